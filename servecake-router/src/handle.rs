use std::borrow::Cow;
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::call::{Call, CallArgs, Target};
use crate::dispatcher::{Dispatcher, PendingResult};
use crate::error::DispatchError;

#[derive(Clone)]
/// Issues calls to deployments from within the runtime.
///
/// Calls suspend the caller until the replica responds, any number of
/// calls can be in flight concurrently on the same runtime.
/// This handle is cheap to clone.
pub struct AsyncHandle {
    dispatcher: Dispatcher,
}

impl AsyncHandle {
    pub(crate) fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Calls the given method of a deployment.
    pub fn call(
        &self,
        deployment: impl Into<String>,
        method: impl Into<Cow<'static, str>>,
        args: CallArgs,
    ) -> PendingResult {
        self.submit(Call::to_deployment(deployment, method, args))
    }

    /// Calls the given method of a deployment, failing with
    /// [DispatchError::Timeout] if it does not complete within `deadline`.
    pub fn call_with_deadline(
        &self,
        deployment: impl Into<String>,
        method: impl Into<Cow<'static, str>>,
        args: CallArgs,
        deadline: Duration,
    ) -> PendingResult {
        self.submit(Call::to_deployment(deployment, method, args).with_deadline(deadline))
    }

    /// Submits an already built call.
    pub fn submit(&self, call: Call) -> PendingResult {
        self.dispatcher.dispatch(call)
    }

    /// Creates a handle bound to a single deployment.
    pub fn deployment(&self, name: impl Into<String>) -> DeploymentHandle {
        DeploymentHandle {
            dispatcher: self.dispatcher.clone(),
            deployment: name.into(),
            method: None,
            deadline: None,
        }
    }
}

#[derive(Clone)]
/// An async handle bound to a single deployment.
///
/// ```ignore
/// let shout = handle.deployment("echo").method("shout");
/// let value = shout.remote(CallArgs::positional(["hi"])).await?;
/// ```
pub struct DeploymentHandle {
    dispatcher: Dispatcher,
    deployment: String,
    method: Option<Cow<'static, str>>,
    deadline: Option<Duration>,
}

impl DeploymentHandle {
    #[inline]
    pub fn deployment_name(&self) -> &str {
        &self.deployment
    }

    /// Targets a specific method rather than the deployment's default.
    pub fn method(mut self, method: impl Into<Cow<'static, str>>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Applies a deadline to every call made through this handle.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Calls the deployment with the given arguments.
    pub fn remote(&self, args: CallArgs) -> PendingResult {
        let mut call = Call::new(
            Target::Deployment(self.deployment.clone()),
            self.method.clone(),
            args,
        );
        if let Some(deadline) = self.deadline {
            call = call.with_deadline(deadline);
        }
        self.dispatcher.dispatch(call)
    }
}

#[derive(Clone)]
/// Issues blocking calls to deployments from threads outside of the runtime.
///
/// Each call is handed to the runtime and the calling thread parks until
/// the result is sent back over a completion channel, so the routing
/// logic is shared with [AsyncHandle] and the runtime is never blocked.
///
/// Calling from a worker of a multi-threaded runtime is tolerated, the worker
/// hands its other tasks off while it waits. A thread driving a current-thread
/// runtime cannot wait on itself, so calls made there fail immediately with
/// [DispatchError::BlockingInRuntime]. Use `tokio::task::spawn_blocking` on a
/// multi-threaded runtime or a dedicated thread instead.
pub struct SyncHandle {
    dispatcher: Dispatcher,
    runtime: Handle,
}

impl SyncHandle {
    pub(crate) fn new(dispatcher: Dispatcher, runtime: Handle) -> Self {
        Self {
            dispatcher,
            runtime,
        }
    }

    /// Calls the given method of a deployment and blocks until it completes.
    pub fn call(
        &self,
        deployment: impl Into<String>,
        method: impl Into<Cow<'static, str>>,
        args: CallArgs,
    ) -> Result<Value, DispatchError> {
        self.submit(Call::to_deployment(deployment, method, args))
    }

    /// Calls the given method of a deployment and blocks until it completes
    /// or `deadline` elapses.
    pub fn call_with_deadline(
        &self,
        deployment: impl Into<String>,
        method: impl Into<Cow<'static, str>>,
        args: CallArgs,
        deadline: Duration,
    ) -> Result<Value, DispatchError> {
        self.submit(Call::to_deployment(deployment, method, args).with_deadline(deadline))
    }

    /// Submits an already built call and blocks until it completes.
    ///
    /// If the runtime shuts down before the call completes,
    /// [DispatchError::Cancelled] is returned.
    pub fn submit(&self, call: Call) -> Result<Value, DispatchError> {
        let flavor = Handle::try_current().ok().map(|handle| handle.runtime_flavor());
        if flavor == Some(RuntimeFlavor::CurrentThread) {
            warn!("Refusing to block a current-thread runtime on a sync call.");
            return Err(DispatchError::BlockingInRuntime);
        }

        let (tx, rx) = flume::bounded(1);
        let pending = self.dispatcher.dispatch(call);

        self.runtime.spawn(async move {
            let result = pending.await;
            let _ = tx.send_async(result).await;
        });

        let received = match flavor {
            Some(_) => tokio::task::block_in_place(|| rx.recv()),
            None => rx.recv(),
        };
        received.unwrap_or(Err(DispatchError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::registry::{DeploymentConfig, DeploymentRegistry};
    use crate::replica::test_utils::echo_replica;

    fn dispatcher() -> Dispatcher {
        let registry = DeploymentRegistry::default();
        registry
            .register(DeploymentConfig::new("echo"))
            .expect("Register deployment.");
        registry
            .add_replica("echo", echo_replica("echo-1"))
            .expect("Add replica.");
        Dispatcher::new(registry)
    }

    #[tokio::test]
    async fn test_deployment_handle() {
        let handle = dispatcher().async_handle().deployment("echo");
        assert_eq!(handle.deployment_name(), "echo");

        let value = handle
            .clone()
            .method("anything")
            .with_deadline(Duration::from_secs(5))
            .remote(CallArgs::positional([1, 2, 3]))
            .await
            .expect("Call deployment.");
        assert_eq!(value, json!(1));

        let value = handle.remote(CallArgs::default()).await.expect("Call deployment.");
        assert_eq!(value, json!(null));
    }

    #[test]
    fn test_sync_handle_runtime_shutdown() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Build runtime.");
        let handle = dispatcher().sync_handle(runtime.handle().clone());
        drop(runtime);

        let err = handle
            .call("echo", "call", CallArgs::positional(["hi"]))
            .expect_err("Runtime is gone.");
        assert_eq!(err, DispatchError::Cancelled);
    }

    #[test]
    fn test_sync_handle_rejects_current_thread_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Build runtime.");
        let dispatcher = dispatcher();
        let handle = dispatcher.sync_handle(runtime.handle().clone());

        let result = runtime.block_on(async {
            handle.call("echo", "call", CallArgs::positional(["hi"]))
        });
        assert_eq!(result, Err(DispatchError::BlockingInRuntime));
        assert_eq!(dispatcher.statistics().num_dispatched(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_handle_on_multi_thread_worker() {
        let handle = dispatcher().sync_handle(Handle::current());

        let value = tokio::spawn(async move {
            handle.call("echo", "call", CallArgs::positional(["hi"]))
        })
        .await
        .expect("Task should complete.")
        .expect("Call deployment.");
        assert_eq!(value, json!("hi"));
    }
}
