//! Per-submitter execution high-water marks.
//!
//! A request is identified for replay purposes by `(replica_id, timestamp)`.
//! The deduplicator remembers, for every submitter, the largest timestamp
//! that has executed. Anything at or below that mark is stale: either a
//! replay or a resubmission by a confused (or malicious) primary.
//!
//! Only *executed* requests advance the mark. Admission checks
//! ([`Deduplicator::is_new`]) never mutate state, so a request that is
//! received but lost in a view change can still be resubmitted.

use std::collections::HashMap;

use ledgerbft_types::{ReplicaId, Timestamp};

use crate::request::Request;

/// Highest executed timestamp per submitter.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    high_water: HashMap<ReplicaId, Timestamp>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `request` is newer than anything executed for its
    /// submitter.
    pub fn is_new(&self, request: &Request) -> bool {
        self.high_water
            .get(&request.replica_id)
            .is_none_or(|hwm| request.timestamp > *hwm)
    }

    /// Records `request` as executed.
    ///
    /// Returns true if the submitter's mark advanced. Stale updates are
    /// ignored.
    pub fn execute(&mut self, request: &Request) -> bool {
        if !self.is_new(request) {
            return false;
        }
        self.high_water.insert(request.replica_id, request.timestamp);
        true
    }

    /// Executed high-water mark for `submitter`, if any request executed.
    pub fn high_water_mark(&self, submitter: ReplicaId) -> Option<Timestamp> {
        self.high_water.get(&submitter).copied()
    }

    /// Number of submitters tracked.
    pub fn len(&self) -> usize {
        self.high_water.len()
    }

    pub fn is_empty(&self) -> bool {
        self.high_water.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn req(submitter: u64, ts: u64) -> Request {
        Request::new(ReplicaId::new(submitter), Timestamp::from_nanos(ts), &b"tx"[..])
    }

    #[test]
    fn unknown_submitter_is_new() {
        let dedup = Deduplicator::new();
        assert!(dedup.is_new(&req(7, 1)));
        assert!(dedup.is_empty());
    }

    #[test_case(90, false; "older")]
    #[test_case(100, false; "equal")]
    #[test_case(101, true; "newer")]
    fn replay_after_execution(ts: u64, expected: bool) {
        let mut dedup = Deduplicator::new();
        assert!(dedup.execute(&req(3, 100)));
        assert_eq!(dedup.is_new(&req(3, ts)), expected);
    }

    #[test]
    fn submitters_are_independent() {
        let mut dedup = Deduplicator::new();
        dedup.execute(&req(1, 100));
        assert!(dedup.is_new(&req(2, 50)));
        assert_eq!(dedup.high_water_mark(ReplicaId::new(2)), None);
    }

    #[test]
    fn stale_execution_does_not_regress() {
        let mut dedup = Deduplicator::new();
        assert!(dedup.execute(&req(1, 100)));
        assert!(!dedup.execute(&req(1, 40)));
        assert!(!dedup.execute(&req(1, 100)));
        assert_eq!(
            dedup.high_water_mark(ReplicaId::new(1)),
            Some(Timestamp::from_nanos(100))
        );
    }

    #[test]
    fn admission_check_does_not_mutate() {
        let dedup = Deduplicator::new();
        assert!(dedup.is_new(&req(1, 5)));
        assert!(dedup.is_new(&req(1, 5)));
        assert!(dedup.is_empty());
    }

    proptest! {
        /// The mark is the running maximum of executed timestamps.
        #[test]
        fn prop_mark_is_monotonic(timestamps in prop::collection::vec(1u64..1_000, 1..50)) {
            let mut dedup = Deduplicator::new();
            let mut max = 0;
            for ts in timestamps {
                dedup.execute(&req(9, ts));
                max = max.max(ts);
                prop_assert_eq!(
                    dedup.high_water_mark(ReplicaId::new(9)),
                    Some(Timestamp::from_nanos(max))
                );
                prop_assert!(!dedup.is_new(&req(9, max)));
                prop_assert!(dedup.is_new(&req(9, max + 1)));
            }
        }
    }
}
