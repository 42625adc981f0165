//! # Servecake Router
//! Routes calls to independently scaled deployments and load balances them
//! across each deployment's replicas.
//!
//! A [DeploymentRegistry] holds every deployment along with its route prefix,
//! methods, replicas and load balancing policy. The [Dispatcher] resolves the
//! target of each call, selects a replica with the deployment's policy and
//! forwards the call over the replica's [ReplicaChannel].
//!
//! ```ignore
//! let registry = DeploymentRegistry::default();
//! let channel = LocalChannel::new(Echo);
//! registry.register(DeploymentConfig::for_channel(&channel).with_route_prefix("/echo"))?;
//! registry.add_replica("echo", Replica::new("echo-1", channel))?;
//!
//! let dispatcher = Dispatcher::new(registry);
//! let value = dispatcher
//!     .async_handle()
//!     .call("echo", "call", CallArgs::positional(["hi"]))
//!     .await?;
//! ```

#[macro_use]
extern crate tracing;

mod call;
mod dispatcher;
mod error;
mod handle;
mod health;
mod policy;
mod registry;
mod replica;
mod statistics;

pub use async_trait::async_trait;
pub use call::{Call, CallArgs, CallId, CallMetadata, ReplicaRequest, Target};
pub use dispatcher::{
    Dispatcher,
    DispatcherConfig,
    PendingResult,
    DEFAULT_MAX_SELECTION_BACKOFF,
    DEFAULT_SELECTION_ATTEMPTS,
    DEFAULT_SELECTION_BACKOFF,
};
pub use error::{
    DispatchError,
    DuplicateReplica,
    MembershipError,
    NotFound,
    RegistryError,
    ReplicaFailure,
};
pub use handle::{AsyncHandle, DeploymentHandle, SyncHandle};
pub use health::{
    ChannelProbe,
    HealthCheckConfig,
    HealthChecker,
    HealthCheckerHandle,
    HealthProbe,
};
pub use policy::{
    LeastOutstandingRequests,
    LoadBalancingPolicy,
    PolicyKind,
    RoundRobin,
    UnknownPolicy,
};
pub use registry::{
    Deployment,
    DeploymentConfig,
    DeploymentRegistry,
    RouteMatch,
    DEFAULT_METHOD,
};
pub use replica::{
    DeploymentService,
    InFlightGuard,
    LocalChannel,
    MethodRegistry,
    Replica,
    ReplicaChannel,
    ReplicaHealth,
    ReplicaId,
    ReplicaSet,
};
pub use statistics::{DispatchStatistics, DispatchStatisticsInner};
