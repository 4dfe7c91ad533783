use std::{sync::Arc, time::Duration};

use sysinfo::{Disks, System};
use tokio::{
    sync::{Mutex, watch},
    time::{MissedTickBehavior, interval, timeout},
};
use tracing::{debug, info, warn};

use super::types::{Health, HealthReport, Monitor, PortView, PortsStatus, SystemStats};
use crate::lib::{
    config::types::ImageDefinition,
    containers::types::{ContainerState, RecordKey},
    error::{ArenaError, ArenaResult},
    orchestrator::types::Orchestrator,
    runtime::types::{ObservedState, RuntimeError, RuntimeStatus},
};

impl Monitor {
    pub fn new(orchestrator: Arc<Orchestrator>, log_tail: usize) -> Self {
        Monitor {
            orchestrator,
            log_tail,
            sysinfo: Mutex::new(System::new_all()),
        }
    }

    /// Accepts `<team>-<image>` or the bare image name. Names that belong
    /// to another team do not resolve.
    pub fn resolve(&self, team: &str, container_name: &str) -> ArenaResult<&ImageDefinition> {
        let images = &self.orchestrator.images;
        if let Some(image) = container_name
            .strip_prefix(team)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|name| images.get(name).ok())
        {
            return Ok(image);
        }
        images.get(container_name)
    }

    async fn observe(&self, handle: &str) -> Result<RuntimeStatus, RuntimeError> {
        let call_timeout = self.orchestrator.policy.call_timeout;
        match timeout(call_timeout, self.orchestrator.runtime.inspect(handle)).await {
            Ok(Err(RuntimeError::NotFound(_))) => Ok(RuntimeStatus {
                state: ObservedState::Missing,
                ready: false,
                exit_code: None,
            }),
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(format!(
                "inspect did not answer within {:?}",
                call_timeout
            ))),
        }
    }

    pub async fn health(&self, team: &str, container_name: &str) -> ArenaResult<HealthReport> {
        let image = self.resolve(team, container_name)?;
        let key = RecordKey::new(team, &image.name);

        let Some(record) = self.orchestrator.registry.get(&key).await else {
            return Ok(HealthReport {
                container_name: key.container_name(),
                state: ContainerState::Absent,
                health: Health::Unhealthy,
                observed: None,
            });
        };
        let Some(handle) = record.runtime_handle.clone() else {
            return Ok(HealthReport {
                container_name: record.container_name,
                state: record.state,
                health: Health::Unhealthy,
                observed: None,
            });
        };

        let status = match self.observe(&handle).await {
            Ok(status) => status,
            Err(err) => {
                debug!(%key, %err, "Health poll failed");
                return Ok(HealthReport {
                    container_name: record.container_name,
                    state: record.state,
                    health: Health::Unknown,
                    observed: None,
                });
            }
        };

        let state = match self.orchestrator.reconcile(&key, &handle, &status).await {
            Ok(Some(reconciled)) => reconciled.state,
            Ok(None) | Err(ArenaError::ConflictingOperation(_)) => record.state,
            Err(err) => return Err(err),
        };
        let health = if status.state == ObservedState::Running && status.ready {
            Health::Healthy
        } else {
            Health::Unhealthy
        };

        Ok(HealthReport {
            container_name: record.container_name,
            state,
            health,
            observed: Some(status),
        })
    }

    pub async fn logs(&self, team: &str, container_name: &str) -> ArenaResult<String> {
        let image = self.resolve(team, container_name)?;
        let key = RecordKey::new(team, &image.name);

        let handle = self
            .orchestrator
            .registry
            .get(&key)
            .await
            .and_then(|record| record.runtime_handle)
            .ok_or_else(|| ArenaError::NotRunning(key.container_name()))?;

        let call_timeout = self.orchestrator.policy.call_timeout;
        match timeout(
            call_timeout,
            self.orchestrator.runtime.logs(&handle, self.log_tail),
        )
        .await
        {
            Ok(Ok(logs)) => Ok(logs),
            Ok(Err(RuntimeError::NotFound(_))) => Err(ArenaError::NotRunning(key.container_name())),
            Ok(Err(err)) => {
                warn!(%key, %handle, %err, "Could not fetch logs");
                Err(ArenaError::RuntimeUnavailable(
                    "logs: container runtime unreachable".to_string(),
                ))
            }
            Err(_) => Err(ArenaError::RuntimeUnavailable("logs timed out".to_string())),
        }
    }

    /// Host ports held by each of `team`'s records, as the pool sees them.
    pub async fn ports_status(&self, team: &str) -> Vec<PortsStatus> {
        let mut statuses = Vec::new();
        for record in self.orchestrator.registry.list(team).await {
            let ports = self
                .orchestrator
                .ports
                .bindings_for(&record.key())
                .await
                .into_iter()
                .map(|binding| PortView {
                    role: binding.logical_port,
                    host_port: binding.host_port,
                })
                .collect();
            statuses.push(PortsStatus {
                container_name: record.container_name,
                image: record.image,
                state: record.state,
                ports,
            });
        }
        statuses
    }

    pub async fn stats(&self) -> SystemStats {
        let running = self
            .orchestrator
            .registry
            .all()
            .await
            .iter()
            .filter(|record| record.state == ContainerState::Running)
            .count();
        let usage = self.orchestrator.ports.usage().await;

        let mut sysinfo = self.sysinfo.lock().await;
        sysinfo.refresh_cpu_usage();
        sysinfo.refresh_memory();
        SystemStats::collect(&sysinfo, &Disks::new_with_refreshed_list(), running, &usage)
    }

    /// Inspects every live record once and folds the result back in.
    /// Returns how many records were observed.
    pub async fn poll_once(&self) -> usize {
        let mut observed = 0;
        for record in self.orchestrator.registry.all().await {
            if !matches!(
                record.state,
                ContainerState::Starting | ContainerState::Running
            ) {
                continue;
            }
            let Some(handle) = record.runtime_handle.as_deref() else {
                continue;
            };
            let key = record.key();

            let status = match self.observe(handle).await {
                Ok(status) => status,
                Err(err) => {
                    debug!(%key, %err, "Poll failed, keeping last known state");
                    continue;
                }
            };
            observed += 1;
            match self.orchestrator.reconcile(&key, handle, &status).await {
                Ok(_) => {}
                Err(ArenaError::ConflictingOperation(_)) => {
                    debug!(%key, "Operation in flight, skipping reconcile")
                }
                Err(err) => warn!(%key, %err, "Could not reconcile record"),
            }
        }
        observed
    }

    pub async fn run_poll_loop(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?every, "Poll loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let observed = self.poll_once().await;
                    debug!(observed, "Poll round finished");
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Poll loop stopped");
    }
}
