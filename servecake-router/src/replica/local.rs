use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::call::{CallArgs, ReplicaRequest};
use crate::error::ReplicaFailure;
use crate::replica::ReplicaChannel;

/// The user defined logic of a deployment.
///
/// Each replica of a deployment runs its own instance of the service.
pub trait DeploymentService: Sized + Send + Sync + 'static {
    /// The name of the deployment this service implements.
    fn deployment_name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Register all callable methods of this service with the registry.
    ///
    /// See [MethodRegistry] for more information.
    fn register_methods(registry: &mut MethodRegistry<Self>);
}

/// A registry used for linking a service's callable methods with
/// the router at runtime.
///
/// Methods are looked up by name when a call arrives, a method which
/// is not registered can never be invoked.
pub struct MethodRegistry<Svc> {
    methods: BTreeMap<Cow<'static, str>, Arc<dyn OpaqueMethod>>,
    service: Arc<Svc>,
}

impl<Svc> MethodRegistry<Svc>
where
    Svc: DeploymentService,
{
    pub(crate) fn new(service: Svc) -> Self {
        Self {
            methods: BTreeMap::new(),
            service: Arc::new(service),
        }
    }

    /// Consumes the registry into the produced method table.
    pub(crate) fn into_methods(
        self,
    ) -> BTreeMap<Cow<'static, str>, Arc<dyn OpaqueMethod>> {
        self.methods
    }

    /// Adds a new callable method to the registry.
    ///
    /// Registering a method under an existing name replaces the old method.
    pub fn add_method<F, Fut>(&mut self, name: impl Into<Cow<'static, str>>, method: F)
    where
        F: Fn(Arc<Svc>, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ReplicaFailure>> + Send + 'static,
    {
        let method = FnMethod {
            service: self.service.clone(),
            method,
            _fut: PhantomData,
        };
        self.methods.insert(name.into(), Arc::new(method));
    }
}

pub(crate) trait OpaqueMethod: Send + Sync {
    fn call(&self, args: CallArgs) -> BoxFuture<'static, Result<Value, ReplicaFailure>>;
}

struct FnMethod<Svc, F, Fut> {
    service: Arc<Svc>,
    method: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<Svc, F, Fut> OpaqueMethod for FnMethod<Svc, F, Fut>
where
    Svc: Send + Sync + 'static,
    F: Fn(Arc<Svc>, CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ReplicaFailure>> + Send + 'static,
{
    fn call(&self, args: CallArgs) -> BoxFuture<'static, Result<Value, ReplicaFailure>> {
        (self.method)(self.service.clone(), args).boxed()
    }
}

#[derive(Clone)]
/// A replica channel which runs a [DeploymentService] inside this process.
///
/// Every invocation runs as its own runtime task, a panicking method is
/// reported as a failure rather than unwinding into the caller.
/// Dropping the call does not stop the method from running.
pub struct LocalChannel {
    deployment: &'static str,
    methods: Arc<BTreeMap<Cow<'static, str>, Arc<dyn OpaqueMethod>>>,
}

impl LocalChannel {
    /// Creates a new channel running the given service.
    pub fn new<Svc>(service: Svc) -> Self
    where
        Svc: DeploymentService,
    {
        let mut registry = MethodRegistry::new(service);
        Svc::register_methods(&mut registry);

        Self {
            deployment: Svc::deployment_name(),
            methods: Arc::new(registry.into_methods()),
        }
    }

    #[inline]
    /// The name of the deployment the service implements.
    pub fn deployment_name(&self) -> &'static str {
        self.deployment
    }

    /// The names of all callable methods.
    pub fn methods(&self) -> impl Iterator<Item = &str> + '_ {
        self.methods.keys().map(|name| name.as_ref())
    }

    /// Runs the named method with the given arguments.
    pub async fn call_method(
        &self,
        method: &str,
        args: CallArgs,
    ) -> Result<Value, ReplicaFailure> {
        let handler = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| ReplicaFailure::unknown_method(method))?;

        match tokio::spawn(handler.call(args)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(
                    deployment = self.deployment,
                    method = method,
                    "Deployment method panicked while handling call."
                );
                Err(ReplicaFailure::internal(format!(
                    "Method {method:?} panicked while handling the call"
                )))
            },
            Err(_) => Err(ReplicaFailure::internal("Method execution was cancelled")),
        }
    }
}

#[async_trait]
impl ReplicaChannel for LocalChannel {
    async fn invoke(&self, request: ReplicaRequest) -> Result<Value, ReplicaFailure> {
        self.call_method(&request.method, request.args).await
    }
}
