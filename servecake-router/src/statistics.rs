use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::DispatchError;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the dispatcher.
pub struct DispatchStatistics(Arc<DispatchStatisticsInner>);

impl Deref for DispatchStatistics {
    type Target = DispatchStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct DispatchStatisticsInner {
    /// The number of calls which started executing.
    pub(crate) num_dispatched: Counter,
    /// The number of calls which produced a value.
    pub(crate) num_succeeded: Counter,
    /// The number of calls targeting an unknown deployment, route or method.
    pub(crate) num_not_found: Counter,
    /// The number of calls which exhausted their selection budget.
    pub(crate) num_no_replica: Counter,
    /// The number of calls which failed within the replica.
    pub(crate) num_replica_errors: Counter,
    /// The number of calls which exceeded their deadline.
    pub(crate) num_timeouts: Counter,
    /// The number of calls dropped by their caller before completing.
    pub(crate) num_abandoned: Counter,
}

impl DispatchStatisticsInner {
    /// The number of calls which started executing.
    ///
    /// Every started call is eventually counted by exactly one of the
    /// outcome counters, including [Self::num_abandoned].
    pub fn num_dispatched(&self) -> u64 {
        self.num_dispatched.load(Ordering::Relaxed)
    }

    /// The number of calls which produced a value.
    pub fn num_succeeded(&self) -> u64 {
        self.num_succeeded.load(Ordering::Relaxed)
    }

    /// The number of calls targeting an unknown deployment, route or method.
    pub fn num_not_found(&self) -> u64 {
        self.num_not_found.load(Ordering::Relaxed)
    }

    /// The number of calls which exhausted their selection budget.
    pub fn num_no_replica(&self) -> u64 {
        self.num_no_replica.load(Ordering::Relaxed)
    }

    /// The number of calls which failed within the replica.
    pub fn num_replica_errors(&self) -> u64 {
        self.num_replica_errors.load(Ordering::Relaxed)
    }

    /// The number of calls which exceeded their deadline.
    pub fn num_timeouts(&self) -> u64 {
        self.num_timeouts.load(Ordering::Relaxed)
    }

    pub fn num_abandoned(&self) -> u64 {
        self.num_abandoned.load(Ordering::Relaxed)
    }

    /// Records the outcome of a completed call.
    pub(crate) fn record<T>(&self, outcome: &Result<T, DispatchError>) {
        let counter = match outcome {
            Ok(_) => &self.num_succeeded,
            Err(DispatchError::NotFound(_)) => &self.num_not_found,
            Err(DispatchError::NoReplicaAvailable { .. }) => &self.num_no_replica,
            Err(DispatchError::Replica { .. }) => &self.num_replica_errors,
            Err(DispatchError::Timeout { .. }) => &self.num_timeouts,
            Err(DispatchError::Cancelled) => &self.num_abandoned,
            Err(DispatchError::BlockingInRuntime) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts a call from the moment it starts executing.
///
/// A recorder dropped without [CallRecorder::finish] counts the call as abandoned.
pub(crate) struct CallRecorder {
    statistics: DispatchStatistics,
    finished: bool,
}

impl CallRecorder {
    pub(crate) fn start(statistics: &DispatchStatistics) -> Self {
        statistics.num_dispatched.fetch_add(1, Ordering::Relaxed);
        Self {
            statistics: statistics.clone(),
            finished: false,
        }
    }

    pub(crate) fn finish<T>(mut self, outcome: &Result<T, DispatchError>) {
        self.finished = true;
        self.statistics.record(outcome);
    }
}

impl Drop for CallRecorder {
    fn drop(&mut self) {
        if !self.finished {
            self.statistics
                .num_abandoned
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}
