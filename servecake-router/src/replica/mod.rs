mod local;
mod set;

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use self::local::{DeploymentService, LocalChannel, MethodRegistry};
pub use self::set::ReplicaSet;
use crate::call::ReplicaRequest;
use crate::error::ReplicaFailure;

/// The unique ID of a replica.
pub type ReplicaId = String;

#[async_trait]
/// The transport used to invoke a replica's deployment code.
///
/// The router treats this as opaque, it may run the code in process
/// or forward the request to another machine.
pub trait ReplicaChannel: Send + Sync + 'static {
    /// Invokes the given method on the replica and waits for its result.
    async fn invoke(&self, request: ReplicaRequest) -> Result<Value, ReplicaFailure>;

    /// Checks whether the replica behind this channel can accept calls.
    ///
    /// In process channels are always considered healthy.
    async fn check_health(&self) -> Result<(), ReplicaFailure> {
        Ok(())
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The health of a replica as last reported by the health checker.
pub enum ReplicaHealth {
    /// The replica can serve new calls.
    Healthy = 0,
    /// The replica is finishing its in-flight calls and should not receive new ones.
    Draining = 1,
    /// The replica failed its health checks.
    Unreachable = 2,
}

impl ReplicaHealth {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReplicaHealth::Healthy,
            1 => ReplicaHealth::Draining,
            _ => ReplicaHealth::Unreachable,
        }
    }
}

/// A single running instance of a deployment.
pub struct Replica {
    id: ReplicaId,
    channel: Arc<dyn ReplicaChannel>,
    in_flight: AtomicUsize,
    health: AtomicU8,
    /// Set while the replica is a member of a replica set.
    claimed: AtomicBool,
}

impl Replica {
    /// Creates a new healthy replica using the given call channel.
    pub fn new(id: impl Into<ReplicaId>, channel: impl ReplicaChannel) -> Arc<Self> {
        Self::with_channel(id, Arc::new(channel))
    }

    /// Creates a new healthy replica from an already shared call channel.
    pub fn with_channel(
        id: impl Into<ReplicaId>,
        channel: Arc<dyn ReplicaChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            channel,
            in_flight: AtomicUsize::new(0),
            health: AtomicU8::new(ReplicaHealth::Healthy as u8),
            claimed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    /// The number of calls currently being processed by the replica.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    #[inline]
    pub fn health(&self) -> ReplicaHealth {
        ReplicaHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.health() == ReplicaHealth::Healthy
    }

    /// Updates the health of the replica.
    ///
    /// Returns the previous health status.
    pub fn set_health(&self, health: ReplicaHealth) -> ReplicaHealth {
        let previous = self.health.swap(health as u8, Ordering::AcqRel);
        ReplicaHealth::from_u8(previous)
    }

    #[inline]
    /// Whether the replica currently belongs to a replica set.
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Marks the replica as a member of a replica set.
    ///
    /// Returns `false` if another set already owns it.
    pub(crate) fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    /// Marks a new call as in flight on this replica.
    ///
    /// The counter is released when the returned guard is dropped.
    pub fn track(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            replica: self.clone(),
        }
    }

    /// Forwards the request to the replica's call channel.
    pub(crate) async fn invoke(
        &self,
        request: ReplicaRequest,
    ) -> Result<Value, ReplicaFailure> {
        self.channel.invoke(request).await
    }

    /// Asks the replica's call channel whether it can accept calls.
    pub async fn check_health(&self) -> Result<(), ReplicaFailure> {
        self.channel.check_health().await
    }
}

impl Debug for Replica {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("in_flight", &self.in_flight())
            .field("health", &self.health())
            .finish()
    }
}

/// Keeps a replica's in-flight counter elevated for as long as it lives.
///
/// Dropping the guard decrements the counter exactly once, which covers
/// completion, failure, timeouts and callers abandoning the call.
pub struct InFlightGuard {
    replica: Arc<Replica>,
}

impl InFlightGuard {
    #[inline]
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.replica.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::echo_replica;
    use super::*;

    #[test]
    fn test_in_flight_guard() {
        let replica = echo_replica("replica-1");
        assert_eq!(replica.in_flight(), 0);

        let guard_1 = replica.track();
        let guard_2 = replica.track();
        assert_eq!(replica.in_flight(), 2);
        assert_eq!(guard_1.replica().id(), "replica-1");

        drop(guard_1);
        assert_eq!(replica.in_flight(), 1);
        drop(guard_2);
        assert_eq!(replica.in_flight(), 0);
    }

    #[test]
    fn test_health_transitions() {
        let replica = echo_replica("replica-1");
        assert!(replica.is_healthy());

        let previous = replica.set_health(ReplicaHealth::Draining);
        assert_eq!(previous, ReplicaHealth::Healthy);
        assert_eq!(replica.health(), ReplicaHealth::Draining);
        assert!(!replica.is_healthy());

        replica.set_health(ReplicaHealth::Unreachable);
        assert_eq!(replica.health(), ReplicaHealth::Unreachable);
    }

    #[tokio::test]
    async fn test_concurrent_tracking_never_leaks() {
        let replica = echo_replica("replica-1");

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let replica = replica.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = replica.track();
                tokio::task::yield_now().await;
            }));
        }
        futures::future::join_all(tasks).await;

        assert_eq!(replica.in_flight(), 0);
    }
}
