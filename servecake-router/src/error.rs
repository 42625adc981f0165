use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::replica::ReplicaId;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Describes why a replica failed to process a call.
///
/// This is produced by the replica's own code (or its transport) and is
/// propagated back to the caller verbatim.
pub struct ReplicaFailure {
    /// The display message for the failure.
    pub message: String,
    /// An optional status code the replica wants the caller to see.
    ///
    /// The HTTP front door uses this as the response status when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ReplicaFailure {
    /// A generic failure without any status attached.
    pub fn new(msg: impl Display) -> Self {
        Self {
            message: msg.to_string(),
            status: None,
        }
    }

    /// A failure carrying a specific status code.
    pub fn with_status(status: u16, msg: impl Display) -> Self {
        Self {
            message: msg.to_string(),
            status: Some(status),
        }
    }

    /// The replica does not expose the requested method.
    pub fn unknown_method(method: &str) -> Self {
        Self::with_status(404, format!("Unknown method: {method}"))
    }

    /// The arguments provided could not be used by the method.
    pub fn invalid_args(msg: impl Display) -> Self {
        Self::with_status(400, msg)
    }

    /// An internal error occurred while running the method.
    pub fn internal(msg: impl Display) -> Self {
        Self::with_status(500, msg)
    }
}

impl Display for ReplicaFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl Debug for ReplicaFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaFailure")
            .field("message", &self.message)
            .field("status", &self.status)
            .finish()
    }
}

impl Error for ReplicaFailure {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// The thing which was looked up but not found.
pub enum NotFound {
    #[error("No deployment registered with the name {0:?}")]
    Deployment(String),

    #[error("No deployment registered for the route {0:?}")]
    Route(String),

    #[error("Deployment {deployment:?} has no method {method:?}")]
    Method { deployment: String, method: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Replica {0:?} already exists within the replica set")]
/// The replica ID is already a member of the set.
pub struct DuplicateReplica(pub ReplicaId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// An error produced when adding a replica to a replica set.
pub enum MembershipError {
    #[error("{0}")]
    Duplicate(#[from] DuplicateReplica),

    #[error("Replica {0:?} is already a member of another replica set")]
    /// Replicas are never shared between deployments.
    AlreadyOwned(ReplicaId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// An error produced when mutating the deployment registry.
pub enum RegistryError {
    #[error("Route prefix {prefix:?} is already owned by deployment {existing:?}")]
    /// The prefix is already registered to another deployment.
    RoutePrefixConflict { prefix: String, existing: String },

    #[error("Deployment {0:?} is already registered")]
    /// A deployment with the same name already exists.
    DeploymentExists(String),

    #[error("Invalid route prefix {0:?}, prefixes must start with '/'")]
    InvalidRoutePrefix(String),

    #[error("Failed to add replica to deployment {deployment:?}: {source}")]
    DuplicateReplica {
        deployment: String,
        #[source]
        source: DuplicateReplica,
    },

    #[error("Replica {replica:?} cannot join {deployment:?}, it already serves another deployment")]
    ReplicaInUse { deployment: String, replica: ReplicaId },

    #[error("{0}")]
    NotFound(#[from] NotFound),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// The reason a dispatched call did not produce a value.
pub enum DispatchError {
    #[error("{0}")]
    /// The target deployment, route or method does not exist.
    ///
    /// This is permanent and never retried.
    NotFound(#[from] NotFound),

    #[error(
        "No replica of deployment {deployment:?} was available after {attempts} selection attempts"
    )]
    /// The replica set remained empty for the whole selection budget.
    NoReplicaAvailable { deployment: String, attempts: usize },

    #[error("Replica {replica:?} of deployment {deployment:?} failed: {failure}")]
    /// The replica's own code failed while handling the call.
    ///
    /// This is never retried against another replica as the call may not be idempotent.
    Replica {
        deployment: String,
        replica: ReplicaId,
        failure: ReplicaFailure,
    },

    #[error("The call did not complete within its deadline ({deadline:?})")]
    /// The call exceeded its deadline and was abandoned.
    Timeout { deadline: Duration },

    #[error("The call was cancelled before a result was produced")]
    /// The runtime dropped the call before it could complete.
    Cancelled,

    #[error("A blocking call was made from a thread driving a current-thread runtime")]
    /// The sync handle was used where waiting would deadlock the runtime.
    BlockingInRuntime,
}

impl DispatchError {
    /// Returns the replica failure, if the error originates from a replica.
    pub fn replica_failure(&self) -> Option<&ReplicaFailure> {
        match self {
            DispatchError::Replica { failure, .. } => Some(failure),
            _ => None,
        }
    }
}
