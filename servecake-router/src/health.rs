use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::registry::DeploymentRegistry;
use crate::replica::{Replica, ReplicaHealth, ReplicaId};

#[async_trait]
/// Checks whether a replica is able to serve calls.
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, deployment: &str, replica: &Replica) -> anyhow::Result<()>;
}

#[derive(Debug, Copy, Clone, Default)]
/// Probes a replica by asking its call channel.
pub struct ChannelProbe;

#[async_trait]
impl HealthProbe for ChannelProbe {
    async fn probe(&self, _deployment: &str, replica: &Replica) -> anyhow::Result<()> {
        replica.check_health().await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Health check configuration.
pub struct HealthCheckConfig {
    /// How often every replica is probed.
    pub interval: Duration,
    /// How long a single probe may take before it counts as a failure.
    pub timeout: Duration,
    /// The number of consecutive failures before a replica is marked unreachable.
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

/// Periodically probes every replica of every registered deployment and
/// updates their health status.
///
/// A replica is marked [ReplicaHealth::Unreachable] once it fails
/// `failure_threshold` consecutive probes, a single successful probe
/// restores it. Draining replicas are never touched.
pub struct HealthChecker<P> {
    registry: DeploymentRegistry,
    probe: Arc<P>,
    config: HealthCheckConfig,
    failures: HashMap<(String, ReplicaId), u32>,
}

impl<P> HealthChecker<P>
where
    P: HealthProbe,
{
    pub fn new(registry: DeploymentRegistry, probe: P, config: HealthCheckConfig) -> Self {
        Self {
            registry,
            probe: Arc::new(probe),
            config,
            failures: HashMap::new(),
        }
    }

    /// Starts the health checker task.
    pub fn spawn(self) -> HealthCheckerHandle {
        let kill_switch = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(self.run(kill_switch.clone()));
        HealthCheckerHandle {
            kill_switch,
            handle,
        }
    }

    async fn run(mut self, kill_switch: Arc<AtomicBool>) {
        info!(interval = ?self.config.interval, "Health checker is running.");

        let mut interval = interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;

            if kill_switch.load(Ordering::Relaxed) {
                break;
            }

            self.check_all().await;
        }
    }

    /// Probes every replica once and applies the results.
    pub async fn check_all(&mut self) {
        let mut targets = Vec::new();
        for deployment in self.registry.deployments() {
            let replicas = deployment.replicas().all();
            for replica in replicas.iter() {
                targets.push((deployment.name().to_string(), replica.clone()));
            }
        }

        let checks = targets.into_iter().map(|(deployment, replica)| {
            let probe = self.probe.clone();
            let timeout = self.config.timeout;
            async move {
                let result =
                    match tokio::time::timeout(timeout, probe.probe(&deployment, &replica)).await {
                        Ok(result) => result,
                        Err(_) => Err(anyhow::anyhow!("Health probe timed out after {timeout:?}")),
                    };
                (deployment, replica, result)
            }
        });

        let results = futures::future::join_all(checks).await;

        let mut seen = HashMap::with_capacity(results.len());
        for (deployment, replica, result) in results {
            let key = (deployment, replica.id().to_string());
            let failures = self.apply_result(&key, &replica, result);
            seen.insert(key, failures);
        }

        // Forget replicas which are no longer registered.
        self.failures = seen
            .into_iter()
            .filter(|(_, failures)| *failures > 0)
            .collect();
    }

    fn apply_result(
        &self,
        key: &(String, ReplicaId),
        replica: &Replica,
        result: anyhow::Result<()>,
    ) -> u32 {
        let (deployment, replica_id) = key;

        match result {
            Ok(()) => {
                if replica.health() == ReplicaHealth::Unreachable {
                    replica.set_health(ReplicaHealth::Healthy);
                    info!(
                        deployment = %deployment,
                        replica = %replica_id,
                        "Replica recovered and is serving calls again."
                    );
                }
                0
            },
            Err(e) => {
                let failures = self.failures.get(key).copied().unwrap_or(0) + 1;

                if failures >= self.config.failure_threshold
                    && replica.health() == ReplicaHealth::Healthy
                {
                    replica.set_health(ReplicaHealth::Unreachable);
                    warn!(
                        deployment = %deployment,
                        replica = %replica_id,
                        failures = failures,
                        error = %e,
                        "Replica marked unreachable after consecutive health check failures."
                    );
                } else {
                    debug!(
                        deployment = %deployment,
                        replica = %replica_id,
                        failures = failures,
                        error = %e,
                        "Replica failed health check."
                    );
                }

                failures
            },
        }
    }
}

/// A handle to a running health checker.
pub struct HealthCheckerHandle {
    kill_switch: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl HealthCheckerHandle {
    /// Stops the health checker.
    pub fn kill(&self) {
        self.kill_switch.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}
