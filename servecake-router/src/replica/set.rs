use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DuplicateReplica, MembershipError};
use crate::replica::Replica;

#[derive(Clone, Default)]
/// The collection of replicas serving a single deployment.
///
/// Membership is copy-on-write, readers take a cheap reference to the
/// current member list and never observe a partially applied change.
/// Members are kept ordered by their replica ID.
pub struct ReplicaSet {
    members: Arc<RwLock<Arc<Vec<Arc<Replica>>>>>,
}

impl ReplicaSet {
    /// Adds a new replica to the set.
    ///
    /// A replica can only belong to one set at a time, it must be removed
    /// from its current set before it can join another.
    pub fn add(&self, replica: Arc<Replica>) -> Result<(), MembershipError> {
        let mut lock = self.members.write();

        let idx = match lock.binary_search_by(|member| member.id().cmp(replica.id())) {
            Ok(_) => return Err(DuplicateReplica(replica.id().to_string()).into()),
            Err(idx) => idx,
        };

        if !replica.claim() {
            return Err(MembershipError::AlreadyOwned(replica.id().to_string()));
        }

        let mut members = Vec::with_capacity(lock.len() + 1);
        members.extend(lock.iter().cloned());
        members.insert(idx, replica);
        *lock = Arc::new(members);

        Ok(())
    }

    /// Removes the replica with the given ID from the set.
    ///
    /// Removing a replica which is not a member is a no-op.
    pub fn remove(&self, replica_id: &str) -> Option<Arc<Replica>> {
        let mut lock = self.members.write();

        let idx = lock
            .binary_search_by(|member| member.id().cmp(replica_id))
            .ok()?;

        let mut members = (**lock).clone();
        let removed = members.remove(idx);
        *lock = Arc::new(members);
        removed.release();

        Some(removed)
    }

    /// Gives up ownership of every member so they can join another set.
    ///
    /// The members stay in place so calls which already selected them
    /// can complete.
    pub fn release_all(&self) {
        for replica in self.members.read().iter() {
            replica.release();
        }
    }

    /// Returns the replicas which are currently healthy.
    ///
    /// The returned list is detached from the set, so selection can happen
    /// without holding any lock. The in-flight counters remain live.
    pub fn snapshot(&self) -> Vec<Arc<Replica>> {
        let members = self.members.read().clone();
        members
            .iter()
            .filter(|replica| replica.is_healthy())
            .cloned()
            .collect()
    }

    /// Returns every member of the set regardless of its health.
    pub fn all(&self) -> Arc<Vec<Arc<Replica>>> {
        self.members.read().clone()
    }

    /// Gets the replica with the given ID.
    pub fn get(&self, replica_id: &str) -> Option<Arc<Replica>> {
        let members = self.members.read();
        members
            .binary_search_by(|member| member.id().cmp(replica_id))
            .ok()
            .map(|idx| members[idx].clone())
    }

    #[inline]
    pub fn contains(&self, replica_id: &str) -> bool {
        self.get(replica_id).is_some()
    }

    #[inline]
    /// The number of members, including unhealthy ones.
    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::test_utils::echo_replica;
    use crate::replica::ReplicaHealth;

    fn ids(replicas: &[Arc<Replica>]) -> Vec<&str> {
        replicas.iter().map(|r| r.id()).collect()
    }

    #[test]
    fn test_add_and_remove() {
        let set = ReplicaSet::default();
        set.add(echo_replica("b")).expect("Add replica.");
        set.add(echo_replica("a")).expect("Add replica.");
        set.add(echo_replica("c")).expect("Add replica.");
        assert_eq!(set.len(), 3);
        assert_eq!(ids(&set.snapshot()), vec!["a", "b", "c"]);

        let removed = set.remove("b").expect("Replica should be removed.");
        assert_eq!(removed.id(), "b");
        assert_eq!(ids(&set.snapshot()), vec!["a", "c"]);
        assert!(!set.contains("b"));
        assert!(set.contains("a"));
    }

    #[test]
    fn test_duplicate_replica() {
        let set = ReplicaSet::default();
        set.add(echo_replica("a")).expect("Add replica.");
        let err = set.add(echo_replica("a")).expect_err("Duplicate should be rejected.");
        assert_eq!(err, MembershipError::Duplicate(DuplicateReplica("a".to_string())));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_replica_belongs_to_one_set() {
        let set_a = ReplicaSet::default();
        let set_b = ReplicaSet::default();
        let replica = echo_replica("a");

        set_a.add(replica.clone()).expect("Add replica.");
        assert!(replica.is_claimed());

        let err = set_b
            .add(replica.clone())
            .expect_err("Replica is owned by another set.");
        assert_eq!(err, MembershipError::AlreadyOwned("a".to_string()));
        assert!(set_b.is_empty());

        // Adding the same replica twice to its own set is still a duplicate.
        let err = set_a.add(replica.clone()).expect_err("Replica is a member.");
        assert!(matches!(err, MembershipError::Duplicate(_)));

        set_a.remove("a");
        assert!(!replica.is_claimed());
        set_b.add(replica.clone()).expect("Replica was released.");
        assert_eq!(set_b.len(), 1);
    }

    #[test]
    fn test_release_all_keeps_members() {
        let set_a = ReplicaSet::default();
        let replica = echo_replica("a");
        set_a.add(replica.clone()).expect("Add replica.");

        set_a.release_all();
        assert!(!replica.is_claimed());
        assert_eq!(set_a.len(), 1);

        let set_b = ReplicaSet::default();
        set_b.add(replica).expect("Replica was released.");
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let set = ReplicaSet::default();
        assert!(set.remove("missing").is_none());

        set.add(echo_replica("a")).expect("Add replica.");
        assert!(set.remove("missing").is_none());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_snapshot_excludes_unhealthy() {
        let set = ReplicaSet::default();
        let draining = echo_replica("a");
        let unreachable = echo_replica("b");
        set.add(draining.clone()).expect("Add replica.");
        set.add(unreachable.clone()).expect("Add replica.");
        set.add(echo_replica("c")).expect("Add replica.");

        draining.set_health(ReplicaHealth::Draining);
        unreachable.set_health(ReplicaHealth::Unreachable);
        assert_eq!(ids(&set.snapshot()), vec!["c"]);
        assert_eq!(set.all().len(), 3);

        draining.set_health(ReplicaHealth::Healthy);
        assert_eq!(ids(&set.snapshot()), vec!["a", "c"]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let set = ReplicaSet::default();
        set.add(echo_replica("a")).expect("Add replica.");

        let snapshot = set.snapshot();
        set.add(echo_replica("b")).expect("Add replica.");
        set.remove("a");

        assert_eq!(ids(&snapshot), vec!["a"]);
        assert_eq!(ids(&set.snapshot()), vec!["b"]);
    }

    #[test]
    fn test_membership_sequence() {
        let set = ReplicaSet::default();
        let mut expected = std::collections::BTreeSet::new();

        for i in 0..20 {
            let id = format!("replica-{i:02}");
            set.add(echo_replica(&id)).expect("Add replica.");
            expected.insert(id);

            if i % 3 == 0 {
                let victim = format!("replica-{:02}", i / 2);
                set.remove(&victim);
                expected.remove(&victim);
            }
        }

        let snapshot = set.snapshot();
        let actual = ids(&snapshot);
        let expected = expected.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_membership_changes() {
        let set = ReplicaSet::default();

        let mut writers = Vec::new();
        for worker in 0..4 {
            let set = set.clone();
            writers.push(tokio::spawn(async move {
                for i in 0..50 {
                    let id = format!("w{worker}-{i}");
                    set.add(echo_replica(&id)).expect("Add replica.");
                    if i % 2 == 0 {
                        set.remove(&id);
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        let reader = {
            let set = set.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let snapshot = set.snapshot();
                    let mut sorted = ids(&snapshot);
                    sorted.sort_unstable();
                    assert_eq!(ids(&snapshot), sorted, "Snapshot should stay ordered.");
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.expect("Writer should complete.");
        }
        reader.await.expect("Reader should complete.");

        assert_eq!(set.len(), 4 * 25);
    }
}
