use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde_json::Value;
use tracing::Instrument;

use crate::call::{Call, CallId, CallMetadata, ReplicaRequest, Target};
use crate::error::DispatchError;
use crate::handle::{AsyncHandle, SyncHandle};
use crate::registry::{Deployment, DeploymentRegistry};
use crate::replica::Replica;
use crate::statistics::{CallRecorder, DispatchStatistics};

pub const DEFAULT_SELECTION_ATTEMPTS: usize = 3;
pub const DEFAULT_SELECTION_BACKOFF: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_SELECTION_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
/// Configuration of the dispatcher's retry and deadline behaviour.
pub struct DispatcherConfig {
    /// The number of times replica selection is attempted before the call
    /// fails with [DispatchError::NoReplicaAvailable].
    pub selection_attempts: usize,

    /// The initial delay between two selection attempts.
    ///
    /// The delay doubles after every failed attempt.
    pub selection_backoff: Duration,

    /// The upper bound of the delay between two selection attempts.
    pub max_selection_backoff: Duration,

    /// The deadline applied to calls which do not set their own.
    pub default_deadline: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            selection_attempts: DEFAULT_SELECTION_ATTEMPTS,
            selection_backoff: DEFAULT_SELECTION_BACKOFF,
            max_selection_backoff: DEFAULT_MAX_SELECTION_BACKOFF,
            default_deadline: None,
        }
    }
}

impl DispatcherConfig {
    /// Set the number of selection attempts, at least one attempt is always made.
    pub fn with_selection_attempts(mut self, attempts: usize) -> Self {
        self.selection_attempts = attempts.max(1);
        self
    }

    /// Set the initial and maximum delay between selection attempts.
    pub fn with_selection_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.selection_backoff = initial;
        self.max_selection_backoff = max.max(initial);
        self
    }

    /// Set the deadline applied to calls which do not set their own.
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }
}

#[derive(Clone)]
/// The single entry point routing calls to replicas.
///
/// The dispatcher is a cheap to clone handle, all clones share the same
/// registry, configuration and statistics.
pub struct Dispatcher {
    registry: DeploymentRegistry,
    config: Arc<DispatcherConfig>,
    statistics: DispatchStatistics,
    next_call_id: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Creates a new dispatcher using the default configuration.
    pub fn new(registry: DeploymentRegistry) -> Self {
        Self::with_config(registry, DispatcherConfig::default())
    }

    /// Creates a new dispatcher using a custom configuration.
    pub fn with_config(registry: DeploymentRegistry, config: DispatcherConfig) -> Self {
        Self {
            registry,
            config: Arc::new(config),
            statistics: DispatchStatistics::default(),
            next_call_id: Arc::new(AtomicU64::new(1)),
        }
    }

    #[inline]
    pub fn registry(&self) -> &DeploymentRegistry {
        &self.registry
    }

    #[inline]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    #[inline]
    /// Gets the live dispatch statistics.
    pub fn statistics(&self) -> &DispatchStatistics {
        &self.statistics
    }

    /// Creates a handle for issuing calls from within the runtime.
    pub fn async_handle(&self) -> AsyncHandle {
        AsyncHandle::new(self.clone())
    }

    /// Creates a handle for issuing blocking calls from outside the runtime.
    ///
    /// Calls are executed on the runtime behind `runtime`.
    pub fn sync_handle(&self, runtime: tokio::runtime::Handle) -> SyncHandle {
        SyncHandle::new(self.clone(), runtime)
    }

    /// Dispatches the call to one of the target deployment's replicas.
    ///
    /// The call does not start until the returned result is polled, dropping
    /// the result cancels the call and releases any in-flight counter it holds.
    /// A call is only counted as dispatched once it starts.
    pub fn dispatch(&self, mut call: Call) -> PendingResult {
        let id = CallId(self.next_call_id.fetch_add(1, Ordering::Relaxed));
        call.id = Some(id);

        let span = debug_span!("dispatch", call_id = %id, target = %call.target);
        let dispatcher = self.clone();
        let inner = async move {
            let recorder = CallRecorder::start(&dispatcher.statistics);
            let result = dispatcher.execute(id, call).await;
            recorder.finish(&result);
            result
        }
        .instrument(span)
        .boxed();

        PendingResult { id, inner }
    }

    async fn execute(&self, id: CallId, call: Call) -> Result<Value, DispatchError> {
        let deadline = match call.deadline.or(self.config.default_deadline) {
            None => return self.route(id, call).await,
            Some(deadline) => deadline,
        };

        let expires_at = match call.submitted_at.checked_add(deadline) {
            Some(expires_at) => expires_at,
            None => return self.route(id, call).await,
        };
        match tokio::time::timeout_at(expires_at, self.route(id, call)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(deadline = ?deadline, "Call exceeded its deadline.");
                Err(DispatchError::Timeout { deadline })
            },
        }
    }

    async fn route(&self, id: CallId, call: Call) -> Result<Value, DispatchError> {
        let deployment = match &call.target {
            Target::Deployment(name) => self.registry.resolve_by_name(name)?,
            Target::Route(path) => self.registry.resolve_by_prefix(path)?.deployment,
        };
        let method = deployment.resolve_method(call.method())?.to_string();

        let metadata = CallMetadata {
            id,
            deployment: deployment.name(),
            method: &method,
        };
        let replica = self.select_replica(&deployment, &metadata).await?;

        // Held until the replica responds or the call is dropped.
        let _guard = replica.track();

        trace!(
            deployment = %deployment.name(),
            replica = %replica.id(),
            method = %method,
            in_flight = replica.in_flight(),
            "Forwarding call to replica."
        );

        let request = ReplicaRequest {
            call_id: id.0,
            method,
            args: call.args,
        };

        replica
            .invoke(request)
            .await
            .map_err(|failure| {
                debug!(
                    deployment = %deployment.name(),
                    replica = %replica.id(),
                    failure = %failure,
                    "Replica failed to handle call."
                );
                DispatchError::Replica {
                    deployment: deployment.name().to_string(),
                    replica: replica.id().to_string(),
                    failure,
                }
            })
    }

    async fn select_replica(
        &self,
        deployment: &Deployment,
        call: &CallMetadata<'_>,
    ) -> Result<Arc<Replica>, DispatchError> {
        let attempts = self.config.selection_attempts.max(1);
        let mut backoff = self.config.selection_backoff;

        for attempt in 1..=attempts {
            let snapshot = deployment.replicas().snapshot();
            if let Some(replica) = deployment.policy().select(&snapshot, call) {
                return Ok(replica);
            }

            if attempt < attempts {
                debug!(
                    deployment = %deployment.name(),
                    attempt = attempt,
                    backoff = ?backoff,
                    "No replica available, retrying selection."
                );
                tokio::time::sleep(with_jitter(backoff)).await;
                backoff = next_backoff(backoff, self.config.max_selection_backoff);
            }
        }

        warn!(
            deployment = %deployment.name(),
            attempts = attempts,
            "No replica became available within the selection budget."
        );

        Err(DispatchError::NoReplicaAvailable {
            deployment: deployment.name().to_string(),
            attempts,
        })
    }
}

fn next_backoff(backoff: Duration, max: Duration) -> Duration {
    backoff.saturating_mul(2).min(max)
}

/// Adds up to 25% of random jitter to the backoff.
fn with_jitter(backoff: Duration) -> Duration {
    let max_jitter = u64::try_from(backoff.as_micros()).unwrap_or(u64::MAX) / 4;
    if max_jitter == 0 {
        return backoff;
    }

    backoff.saturating_add(Duration::from_micros(
        rand::thread_rng().gen_range(0..=max_jitter),
    ))
}

/// The pending result of a dispatched call.
///
/// Resolves once the replica responds. Dropping it abandons the call.
pub struct PendingResult {
    id: CallId,
    inner: BoxFuture<'static, Result<Value, DispatchError>>,
}

impl PendingResult {
    #[inline]
    /// The correlation ID of the call.
    pub fn call_id(&self) -> CallId {
        self.id
    }
}

impl Future for PendingResult {
    type Output = Result<Value, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::call::CallArgs;
    use crate::registry::DeploymentConfig;
    use crate::replica::test_utils::echo_replica;

    fn echo_dispatcher(config: DispatcherConfig) -> Dispatcher {
        let registry = DeploymentRegistry::default();
        registry
            .register(DeploymentConfig::new("echo").with_route_prefix("/echo"))
            .expect("Register deployment.");
        registry
            .add_replica("echo", echo_replica("echo-1"))
            .expect("Add replica.");
        Dispatcher::with_config(registry, config)
    }

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);

        let backoff = Duration::from_millis(100);
        for _ in 0..100 {
            let delay = with_jitter(backoff);
            assert!(delay >= backoff);
            assert!(delay <= backoff + Duration::from_millis(25));
        }
    }

    #[test]
    fn test_backoff_saturates() {
        let max = Duration::from_millis(200);
        assert_eq!(next_backoff(Duration::from_millis(10), max), Duration::from_millis(20));
        assert_eq!(next_backoff(Duration::from_millis(150), max), max);
        assert_eq!(next_backoff(Duration::MAX, Duration::MAX), Duration::MAX);
        assert!(with_jitter(Duration::MAX) >= Duration::MAX);
    }

    #[test]
    fn test_config_builders() {
        let config = DispatcherConfig::default()
            .with_selection_attempts(0)
            .with_selection_backoff(Duration::from_millis(50), Duration::from_millis(10))
            .with_default_deadline(Duration::from_secs(1));
        assert_eq!(config.selection_attempts, 1);
        assert_eq!(config.max_selection_backoff, Duration::from_millis(50));
        assert_eq!(config.default_deadline, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_call_ids_are_unique() {
        let dispatcher = echo_dispatcher(DispatcherConfig::default());

        let first = dispatcher.dispatch(Call::to_deployment("echo", "call", CallArgs::default()));
        let second = dispatcher.dispatch(Call::to_deployment("echo", "call", CallArgs::default()));
        assert_ne!(first.call_id(), second.call_id());

        assert_eq!(first.await, Ok(json!(null)));
        assert_eq!(second.await, Ok(json!(null)));
        assert_eq!(dispatcher.statistics().num_dispatched(), 2);
        assert_eq!(dispatcher.statistics().num_succeeded(), 2);
    }

    #[tokio::test]
    async fn test_unbounded_deadline() {
        let dispatcher = echo_dispatcher(DispatcherConfig::default());

        let call = Call::to_deployment("echo", "call", CallArgs::positional(["hi"]))
            .with_deadline(Duration::MAX);
        let value = dispatcher.dispatch(call).await.expect("Dispatch call.");
        assert_eq!(value, json!("hi"));
    }

    #[tokio::test]
    async fn test_statistics_account_for_every_call() {
        let dispatcher = echo_dispatcher(
            DispatcherConfig::default()
                .with_selection_attempts(50)
                .with_selection_backoff(Duration::from_millis(20), Duration::from_millis(20)),
        );
        let stats = dispatcher.statistics();

        // Never polled, so never started.
        drop(dispatcher.dispatch(Call::to_deployment("echo", "call", CallArgs::default())));
        assert_eq!(stats.num_dispatched(), 0);

        dispatcher
            .dispatch(Call::to_deployment("echo", "call", CallArgs::default()))
            .await
            .expect("Dispatch call.");

        dispatcher.registry().remove_replica("echo", "echo-1").expect("Remove replica.");
        let pending = dispatcher.dispatch(Call::to_deployment("echo", "call", CallArgs::default()));
        let outcome = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(outcome.is_err(), "Caller should give up first.");

        assert_eq!(stats.num_dispatched(), 2);
        assert_eq!(stats.num_succeeded(), 1);
        assert_eq!(stats.num_abandoned(), 1);
        assert_eq!(stats.num_no_replica(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_by_route() {
        let dispatcher = echo_dispatcher(DispatcherConfig::default());

        let call = Call::to_route("/echo/anything", None, CallArgs::positional(["hi"]));
        let value = dispatcher.dispatch(call).await.expect("Dispatch call.");
        assert_eq!(value, json!("hi"));

        let call = Call::to_route("/missing", None, CallArgs::default());
        let err = dispatcher.dispatch(call).await.expect_err("Route is missing.");
        assert!(matches!(err, DispatchError::NotFound(_)));
        assert_eq!(dispatcher.statistics().num_not_found(), 1);
    }

    #[tokio::test]
    async fn test_default_deadline_applies() {
        let dispatcher = echo_dispatcher(
            DispatcherConfig::default()
                .with_selection_attempts(50)
                .with_selection_backoff(Duration::from_millis(20), Duration::from_millis(20))
                .with_default_deadline(Duration::from_millis(50)),
        );
        dispatcher.registry().remove_replica("echo", "echo-1").expect("Remove replica.");

        let call = Call::to_deployment("echo", "call", CallArgs::default());
        let err = dispatcher.dispatch(call).await.expect_err("Call should time out.");
        assert_eq!(
            err,
            DispatchError::Timeout {
                deadline: Duration::from_millis(50)
            }
        );
    }
}
