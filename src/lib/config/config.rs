use std::{collections::HashSet, path::Path, time::Duration};

use tracing::info;

use super::types::{
    AuthConfig, Config, ImageCatalog, ImageDefinition, MonitorConfig, PoolConfig, RuntimeConfig,
    RuntimeKind, ServerConfig,
};
use crate::lib::error::{ArenaError, ArenaResult};

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            token_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            kind: RuntimeKind::Docker,
            call_timeout_secs: 30,
            retry_backoff_ms: 500,
            stop_grace_secs: 10,
            pull_images: true,
            sweep_on_startup: true,
            stop_on_shutdown: true,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            poll_interval_secs: 5,
            quarantine_secs: None,
            log_tail: 200,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let pool = |role: u16, start: u16| PoolConfig {
            role,
            start,
            end: start + 99,
        };

        Config {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            runtime: RuntimeConfig::default(),
            monitor: MonitorConfig::default(),
            pools: vec![
                pool(2000, 32000),
                pool(2001, 32100),
                pool(2002, 32200),
                pool(8888, 38800),
            ],
            images: vec![ImageDefinition {
                name: "v2x-playground-carla".to_string(),
                reference: "carlasim/carla:0.9.15".to_string(),
                description: "CARLA simulator with the V2X playground challenges".to_string(),
                env_prefix: "CARLA".to_string(),
                ports: vec![2000, 2001, 2002, 8888],
                primary_port: Some(2000),
            }],
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> ArenaResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ArenaError::Config(format!("reading {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), images = config.images.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> ArenaResult<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| ArenaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ArenaResult<()> {
        if self.runtime.call_timeout_secs == 0 {
            return Err(ArenaError::Config(
                "runtime.call_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.monitor.poll_interval_secs == 0 {
            return Err(ArenaError::Config(
                "monitor.poll_interval_secs must be at least 1".to_string(),
            ));
        }

        let mut roles = HashSet::new();
        for pool in &self.pools {
            if pool.start > pool.end {
                return Err(ArenaError::Config(format!(
                    "pool for role {} has an empty range {}..={}",
                    pool.role, pool.start, pool.end
                )));
            }
            if !roles.insert(pool.role) {
                return Err(ArenaError::Config(format!(
                    "role {} has more than one pool",
                    pool.role
                )));
            }
        }

        for (i, a) in self.pools.iter().enumerate() {
            for b in &self.pools[i + 1..] {
                if a.start <= b.end && b.start <= a.end {
                    return Err(ArenaError::Config(format!(
                        "pools for roles {} and {} overlap",
                        a.role, b.role
                    )));
                }
            }
        }

        let mut names = HashSet::new();
        for image in &self.images {
            if !names.insert(image.name.as_str()) {
                return Err(ArenaError::Config(format!(
                    "duplicate image {}",
                    image.name
                )));
            }
            if image.ports.is_empty() {
                return Err(ArenaError::Config(format!(
                    "image {} declares no ports",
                    image.name
                )));
            }
            let valid_prefix = !image.env_prefix.is_empty()
                && image
                    .env_prefix
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
            if !valid_prefix {
                return Err(ArenaError::Config(format!(
                    "image {} has invalid env prefix {:?}",
                    image.name, image.env_prefix
                )));
            }
            let mut declared = HashSet::new();
            for role in &image.ports {
                if !declared.insert(*role) {
                    return Err(ArenaError::Config(format!(
                        "image {} declares port {} twice",
                        image.name, role
                    )));
                }
                if !roles.contains(role) {
                    return Err(ArenaError::Config(format!(
                        "image {} declares port {} but no pool serves that role",
                        image.name, role
                    )));
                }
            }
            if let Some(primary) = image.primary_port {
                if !declared.contains(&primary) {
                    return Err(ArenaError::Config(format!(
                        "image {} primary port {} is not declared",
                        image.name, primary
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.call_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.runtime.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs)
    }

    pub fn quarantine(&self) -> Duration {
        self.monitor
            .quarantine_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.poll_interval())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.token_ttl_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.address, self.server.port)
    }
}

impl ImageDefinition {
    /// The role `<PREFIX>_SERVER` points at.
    pub fn primary(&self) -> u16 {
        self.primary_port.unwrap_or(self.ports[0])
    }
}

impl ImageCatalog {
    pub fn new(images: Vec<ImageDefinition>) -> Self {
        let order = images.iter().map(|image| image.name.clone()).collect();
        let images = images
            .into_iter()
            .map(|image| (image.name.clone(), image))
            .collect();
        ImageCatalog { images, order }
    }

    pub fn get(&self, name: &str) -> ArenaResult<&ImageDefinition> {
        self.images
            .get(name)
            .ok_or_else(|| ArenaError::ImageNotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<ImageDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.images.get(name).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[server]
port = 9090

[monitor]
poll_interval_secs = 2

[[pools]]
role = 2000
start = 40000
end = 40001

[[pools]]
role = 8888
start = 48000
end = 48001

[[images]]
name = "mini"
reference = "example/mini:latest"
env_prefix = "MINI"
ports = [2000, 8888]
"#;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.images[0].primary(), 2000);
        assert_eq!(config.quarantine(), config.poll_interval());
    }

    #[test]
    fn parses_partial_file_with_defaults() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.runtime.kind, RuntimeKind::Docker);
        assert_eq!(config.quarantine(), Duration::from_secs(2));
        assert_eq!(config.images[0].primary(), 2000);
    }

    #[test]
    fn rejects_overlapping_pools() {
        let mut config = Config::default();
        config.pools[1].start = config.pools[0].end;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn rejects_image_port_without_pool() {
        let mut config = Config::default();
        config.images[0].ports.push(9999);
        assert!(matches!(config.validate(), Err(ArenaError::Config(_))));
    }

    #[test]
    fn rejects_zero_intervals() {
        let err = Config::from_toml_str("[monitor]\npoll_interval_secs = 0").unwrap_err();
        assert!(err.to_string().contains("poll_interval_secs"));

        let err = Config::from_toml_str("[runtime]\ncall_timeout_secs = 0").unwrap_err();
        assert!(err.to_string().contains("call_timeout_secs"));
    }

    #[test]
    fn rejects_lowercase_env_prefix() {
        let mut config = Config::default();
        config.images[0].env_prefix = "carla".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.images.len(), 1);
        assert_eq!(config.bind_address(), "0.0.0.0:9090");
    }

    #[test]
    fn shipped_sample_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/simarena.toml");
        let config = Config::load(&path).unwrap();
        let defaults = Config::default();
        assert_eq!(config.pools, defaults.pools);
        assert_eq!(config.images, defaults.images);
        assert_eq!(config.quarantine(), defaults.quarantine());
    }

    #[test]
    fn catalog_keeps_declaration_order() {
        let mut images = Config::default().images;
        let mut second = images[0].clone();
        second.name = "aaa-first-alphabetically".to_string();
        images.push(second);
        let catalog = ImageCatalog::new(images);
        let names: Vec<_> = catalog.list().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["v2x-playground-carla", "aaa-first-alphabetically"]);
        assert!(matches!(
            catalog.get("nope"),
            Err(ArenaError::ImageNotFound(_))
        ));
    }
}
