use std::{collections::HashMap, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

use super::types::{PoolUsage, PortAllocator, PortBinding, RolePool};
use crate::lib::{
    config::types::PoolConfig,
    containers::types::RecordKey,
    error::{ArenaError, ArenaResult},
};

impl RolePool {
    pub fn new(config: &PoolConfig) -> Self {
        RolePool {
            role: config.role,
            start: config.start,
            end: config.end,
            bound: Default::default(),
            quarantined: HashMap::new(),
        }
    }

    fn capacity(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    fn lowest_free(&self, now: Instant, quarantine: Duration) -> Option<u16> {
        (self.start..=self.end).find(|port| {
            !self.bound.contains_key(port) && !self.in_quarantine(*port, now, quarantine)
        })
    }

    fn in_quarantine(&self, port: u16, now: Instant, quarantine: Duration) -> bool {
        self.quarantined
            .get(&port)
            .is_some_and(|released| now.duration_since(*released) < quarantine)
    }

    fn expire_quarantine(&mut self, now: Instant, quarantine: Duration) {
        self.quarantined
            .retain(|_, released| now.duration_since(*released) < quarantine);
    }
}

impl PortAllocator {
    pub fn new(pools: &[PoolConfig], quarantine: Duration) -> Self {
        let pools = pools
            .iter()
            .map(|config| (config.role, RolePool::new(config)))
            .collect();

        PortAllocator {
            pools: Mutex::new(pools),
            quarantine,
        }
    }

    /// Binds one host port per role for `key`, lowest free port first.
    /// Either every role gets a port or nothing is bound.
    pub async fn allocate(&self, key: &RecordKey, roles: &[u16]) -> ArenaResult<Vec<PortBinding>> {
        let mut pools = self.pools.lock().await;
        let now = Instant::now();

        let mut picked = Vec::with_capacity(roles.len());
        for role in roles {
            let pool = pools.get_mut(role).ok_or_else(|| {
                ArenaError::Config(format!("no pool configured for role {}", role))
            })?;
            pool.expire_quarantine(now, self.quarantine);

            let host_port =
                pool.lowest_free(now, self.quarantine)
                    .ok_or_else(|| ArenaError::PoolExhausted {
                        image: key.image.clone(),
                        role: *role,
                    })?;
            picked.push(PortBinding {
                team: key.team.clone(),
                image: key.image.clone(),
                logical_port: *role,
                host_port,
            });
        }

        for binding in &picked {
            if let Some(pool) = pools.get_mut(&binding.logical_port) {
                pool.bound.insert(binding.host_port, binding.clone());
            }
        }

        debug!(team = %key.team, image = %key.image, ports = ?picked.iter().map(|b| b.host_port).collect::<Vec<_>>(), "Allocated host ports");
        Ok(picked)
    }

    /// Returns ports to the pool. Fails without releasing anything when one
    /// of them is not currently bound to the same owner.
    pub async fn release(&self, bindings: &[PortBinding]) -> ArenaResult<()> {
        let mut pools = self.pools.lock().await;

        for binding in bindings {
            let held = pools
                .get(&binding.logical_port)
                .and_then(|pool| pool.bound.get(&binding.host_port));
            if held != Some(binding) {
                return Err(ArenaError::NotAllocated(binding.host_port));
            }
        }

        let now = Instant::now();
        for binding in bindings {
            if let Some(pool) = pools.get_mut(&binding.logical_port) {
                pool.bound.remove(&binding.host_port);
                pool.quarantined.insert(binding.host_port, now);
            }
        }

        debug!(ports = ?bindings.iter().map(|b| b.host_port).collect::<Vec<_>>(), "Released host ports");
        Ok(())
    }

    /// Releases whatever is still bound to `key`, used to clear bindings left
    /// behind by a failed or interrupted cycle.
    pub async fn release_owner(&self, key: &RecordKey) -> Vec<PortBinding> {
        let mut pools = self.pools.lock().await;
        let now = Instant::now();
        let mut released = Vec::new();

        for pool in pools.values_mut() {
            let owned: Vec<u16> = pool
                .bound
                .iter()
                .filter(|(_, binding)| key.owns(binding))
                .map(|(port, _)| *port)
                .collect();
            for port in owned {
                if let Some(binding) = pool.bound.remove(&port) {
                    pool.quarantined.insert(port, now);
                    released.push(binding);
                }
            }
        }

        if !released.is_empty() {
            warn!(team = %key.team, image = %key.image, count = released.len(), "Force-released stale port bindings");
        }
        released
    }

    /// Snapshot of every live binding, ordered by role then host port.
    pub async fn bindings(&self) -> Vec<PortBinding> {
        let pools = self.pools.lock().await;
        let mut roles: Vec<&RolePool> = pools.values().collect();
        roles.sort_by_key(|pool| pool.role);
        roles
            .into_iter()
            .flat_map(|pool| pool.bound.values().cloned())
            .collect()
    }

    pub async fn bindings_for(&self, key: &RecordKey) -> Vec<PortBinding> {
        self.bindings()
            .await
            .into_iter()
            .filter(|binding| key.owns(binding))
            .collect()
    }

    pub async fn usage(&self) -> Vec<PoolUsage> {
        let pools = self.pools.lock().await;
        let now = Instant::now();
        let mut usage: Vec<PoolUsage> = pools
            .values()
            .map(|pool| PoolUsage {
                role: pool.role,
                capacity: pool.capacity(),
                bound: pool.bound.len(),
                quarantined: pool
                    .quarantined
                    .keys()
                    .filter(|port| pool.in_quarantine(**port, now, self.quarantine))
                    .count(),
            })
            .collect();
        usage.sort_by_key(|entry| entry.role);
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc};

    fn pools(capacity: u16) -> Vec<PoolConfig> {
        [(2000, 30000), (2001, 31000), (2002, 32000), (8888, 38000)]
            .into_iter()
            .map(|(role, start)| PoolConfig {
                role,
                start,
                end: start + capacity - 1,
            })
            .collect()
    }

    const ROLES: [u16; 4] = [2000, 2001, 2002, 8888];

    #[tokio::test]
    async fn allocates_lowest_port_per_role() {
        let allocator = PortAllocator::new(&pools(10), Duration::ZERO);
        let key = RecordKey::new("alpha", "carla");

        let bindings = allocator.allocate(&key, &ROLES).await.unwrap();
        let ports: Vec<u16> = bindings.iter().map(|b| b.host_port).collect();
        assert_eq!(ports, vec![30000, 31000, 32000, 38000]);
        assert!(bindings.iter().all(|b| key.owns(b)));

        let other = RecordKey::new("beta", "carla");
        let next = allocator.allocate(&other, &ROLES).await.unwrap();
        assert_eq!(next[0].host_port, 30001);
    }

    #[tokio::test]
    async fn exhaustion_is_all_or_nothing() {
        let mut configs = pools(2);
        configs[3].end = configs[3].start; // role 8888 has a single port
        let allocator = PortAllocator::new(&configs, Duration::ZERO);

        allocator
            .allocate(&RecordKey::new("alpha", "carla"), &ROLES)
            .await
            .unwrap();
        let err = allocator
            .allocate(&RecordKey::new("beta", "carla"), &ROLES)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ArenaError::PoolExhausted {
                image: "carla".into(),
                role: 8888
            }
        );
        assert_eq!(allocator.bindings().await.len(), 4);
    }

    #[tokio::test]
    async fn release_rejects_foreign_binding() {
        let allocator = PortAllocator::new(&pools(4), Duration::ZERO);
        let key = RecordKey::new("alpha", "carla");
        let mut bindings = allocator.allocate(&key, &ROLES).await.unwrap();

        bindings[0].team = "mallory".into();
        let err = allocator.release(&bindings).await.unwrap_err();
        assert_eq!(err, ArenaError::NotAllocated(30000));
        assert_eq!(allocator.bindings().await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn released_port_is_quarantined() {
        let allocator = PortAllocator::new(&pools(2), Duration::from_secs(5));
        let alpha = RecordKey::new("alpha", "carla");
        let beta = RecordKey::new("beta", "carla");

        let bindings = allocator.allocate(&alpha, &ROLES).await.unwrap();
        allocator.release(&bindings).await.unwrap();

        let next = allocator.allocate(&beta, &ROLES).await.unwrap();
        assert_eq!(next[0].host_port, 30001);
        allocator.release(&next).await.unwrap();

        let err = allocator.allocate(&alpha, &ROLES).await.unwrap_err();
        assert!(matches!(err, ArenaError::PoolExhausted { .. }));

        tokio::time::advance(Duration::from_secs(5)).await;
        let again = allocator.allocate(&alpha, &ROLES).await.unwrap();
        assert_eq!(again[0].host_port, 30000);
    }

    #[tokio::test]
    async fn release_owner_clears_only_that_key() {
        let allocator = PortAllocator::new(&pools(4), Duration::ZERO);
        let alpha = RecordKey::new("alpha", "carla");
        let beta = RecordKey::new("beta", "carla");
        allocator.allocate(&alpha, &ROLES).await.unwrap();
        allocator.allocate(&beta, &ROLES).await.unwrap();

        let released = allocator.release_owner(&alpha).await;
        assert_eq!(released.len(), 4);
        assert!(allocator.bindings_for(&alpha).await.is_empty());
        assert_eq!(allocator.bindings_for(&beta).await.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_allocations_never_collide() {
        let allocator = Arc::new(PortAllocator::new(&pools(50), Duration::ZERO));
        let mut handles = Vec::new();
        for i in 0..40 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                let key = RecordKey::new(&format!("team{}", i), "carla");
                allocator.allocate(&key, &ROLES).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for binding in handle.await.unwrap() {
                assert!(seen.insert(binding.host_port), "duplicate {}", binding.host_port);
            }
        }
        assert_eq!(seen.len(), 160);

        let usage = allocator.usage().await;
        assert!(usage.iter().all(|u| u.bound == 40 && u.capacity == 50));
    }
}
