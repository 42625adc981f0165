use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::call::CallMetadata;
use crate::replica::Replica;

/// Picks which replica should serve a call.
///
/// The snapshot provided is ordered by replica ID and only contains
/// healthy replicas. Returning `None` signals that no replica is available,
/// which the dispatcher treats as a transient condition.
pub trait LoadBalancingPolicy: Send + Sync + 'static {
    /// A short name of the policy used for logging.
    fn name(&self) -> &'static str;

    /// Selects a replica from the snapshot.
    fn select(
        &self,
        snapshot: &[Arc<Replica>],
        call: &CallMetadata,
    ) -> Option<Arc<Replica>>;
}

#[derive(Debug, Default)]
/// Cycles through the replicas in order.
///
/// If the membership changed between selections the cursor simply wraps
/// around the new set of replicas.
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl LoadBalancingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(
        &self,
        snapshot: &[Arc<Replica>],
        _call: &CallMetadata,
    ) -> Option<Arc<Replica>> {
        if snapshot.is_empty() {
            return None;
        }

        let position = self.cursor.fetch_add(1, Ordering::Relaxed);
        snapshot.get(position % snapshot.len()).cloned()
    }
}

#[derive(Debug, Default, Copy, Clone)]
/// Picks the replica with the fewest in-flight calls.
///
/// Ties are broken by the replica ID order of the snapshot.
pub struct LeastOutstandingRequests;

impl LoadBalancingPolicy for LeastOutstandingRequests {
    fn name(&self) -> &'static str {
        "least-outstanding"
    }

    fn select(
        &self,
        snapshot: &[Arc<Replica>],
        _call: &CallMetadata,
    ) -> Option<Arc<Replica>> {
        // `min_by_key` keeps the first minimum, which is the lowest replica ID.
        snapshot
            .iter()
            .min_by_key(|replica| replica.in_flight())
            .cloned()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
/// The built in load balancing policies.
pub enum PolicyKind {
    #[default]
    RoundRobin,
    LeastOutstandingRequests,
}

impl PolicyKind {
    /// Creates a new policy instance with fresh state.
    pub fn build(self) -> Box<dyn LoadBalancingPolicy> {
        match self {
            PolicyKind::RoundRobin => Box::<RoundRobin>::default(),
            PolicyKind::LeastOutstandingRequests => Box::new(LeastOutstandingRequests),
        }
    }
}

impl Display for PolicyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyKind::RoundRobin => write!(f, "round-robin"),
            PolicyKind::LeastOutstandingRequests => write!(f, "least-outstanding"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown load balancing policy {0:?}, expected 'round-robin' or 'least-outstanding'")]
pub struct UnknownPolicy(String);

impl FromStr for PolicyKind {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" | "rr" => Ok(PolicyKind::RoundRobin),
            "least-outstanding" | "least_outstanding" | "lor" => {
                Ok(PolicyKind::LeastOutstandingRequests)
            },
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}
