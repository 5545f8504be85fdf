//! Test registry - the single source of truth for test state.
//!
//! The registry is owned by the dispatch task and mutated only in response
//! to discrete inbound events, so it needs no interior locking. Everything
//! leaving the registry is a copy; reporters never see a live reference.

use specter_common::{Error, ImageRef, Result, TestDescriptor, TestRecord, TestStatus};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Immutable point-in-time copy of the registry, keyed by test id.
/// Keys are sorted, which makes everything derived from a snapshot
/// (report artifact, orphan list) deterministic.
pub type Snapshot = BTreeMap<String, TestRecord>;

/// In-memory store of every discovered test and its status history
#[derive(Debug, Default)]
pub struct TestRegistry {
    records: HashMap<String, TestRecord>,
    /// Seeding order; dispatch assigns in this order
    order: Vec<String>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the registry from the inventory. All-or-nothing: a duplicate
    /// identifier fails the whole batch with [`Error::DuplicateTest`] and
    /// seeds no records. Descriptors with `skip` set seed as `skipped`.
    pub fn seed(&mut self, descriptors: &[TestDescriptor]) -> Result<()> {
        let mut incoming = HashSet::new();
        for descriptor in descriptors {
            let id = descriptor.id();
            if !incoming.insert(id.clone()) || self.records.contains_key(&id) {
                return Err(Error::DuplicateTest { id });
            }
        }
        for descriptor in descriptors {
            let id = descriptor.id();
            self.order.push(id.clone());
            self.records.insert(id, TestRecord::new(descriptor.clone()));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&TestRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `pending -> running`, counting the attempt
    pub fn mark_running(&mut self, id: &str) -> Result<()> {
        let record = self.checked_mut(id, TestStatus::Running)?;
        record.status = TestStatus::Running;
        record.attempts += 1;
        Ok(())
    }

    /// `running -> success | failed` from a worker-reported outcome
    pub fn record_outcome(
        &mut self,
        id: &str,
        status: TestStatus,
        images: BTreeMap<String, ImageRef>,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) -> Result<()> {
        if !matches!(status, TestStatus::Success | TestStatus::Failed) {
            return Err(Error::Protocol(format!(
                "worker reported non-terminal status {} for {}",
                status, id
            )));
        }
        let record = self.checked_mut(id, status)?;
        record.status = status;
        record.images.extend(images);
        if duration_ms.is_some() {
            record.duration_ms = duration_ms;
        }
        record.error = match status {
            TestStatus::Failed => error.or_else(|| Some("test failed".to_string())),
            _ => None,
        };
        Ok(())
    }

    /// `running -> pending`: crash re-queue. Attempt history is preserved.
    pub fn requeue(&mut self, id: &str) -> Result<()> {
        let record = self.checked_mut(id, TestStatus::Pending)?;
        record.status = TestStatus::Pending;
        Ok(())
    }

    /// `running -> failed` with an explicit reason (retries exhausted,
    /// terminated during drain)
    pub fn fail(&mut self, id: &str, reason: &str) -> Result<()> {
        let record = self.checked_mut(id, TestStatus::Failed)?;
        record.status = TestStatus::Failed;
        record.error = Some(reason.to_string());
        Ok(())
    }

    /// `failed -> pending`: user-triggered retest. Clears the error but not
    /// the attempt history.
    pub fn retest(&mut self, id: &str) -> Result<()> {
        let record = self.checked_mut(id, TestStatus::Pending)?;
        record.status = TestStatus::Pending;
        record.error = None;
        Ok(())
    }

    fn checked_mut(&mut self, id: &str, to: TestStatus) -> Result<&mut TestRecord> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTest { id: id.to_string() })?;
        if !record.status.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: record.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(record)
    }

    /// Pending test ids in seeding order
    pub fn pending_in_order(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.records
                    .get(*id)
                    .map(|r| r.status == TestStatus::Pending)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Number of tests still pending or running. The run is complete the
    /// moment this reaches zero.
    pub fn open_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| matches!(r.status, TestStatus::Pending | TestStatus::Running))
            .count()
    }

    /// Aggregate verdict: true iff every non-skipped record is `success`
    pub fn all_success(&self) -> bool {
        self.records
            .values()
            .filter(|r| r.status != TestStatus::Skipped)
            .all(|r| r.status == TestStatus::Success)
    }

    /// Immutable copy for reporting; never a live reference
    pub fn snapshot(&self) -> Snapshot {
        self.records
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }
}

/// Aggregate verdict over a snapshot, mirroring
/// [`TestRegistry::all_success`] for consumers that only hold the copy.
pub fn snapshot_success(snapshot: &Snapshot) -> bool {
    snapshot
        .values()
        .filter(|r| r.status != TestStatus::Skipped)
        .all(|r| r.status == TestStatus::Success)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(story: &str, test: &str, browser: &str) -> TestDescriptor {
        TestDescriptor {
            story: story.to_string(),
            test: test.to_string(),
            browser: browser.to_string(),
            skip: false,
            retries: None,
        }
    }

    fn seeded() -> TestRegistry {
        let mut registry = TestRegistry::new();
        registry
            .seed(&[
                descriptor("a", "t", "chrome"),
                descriptor("b", "t", "chrome"),
                descriptor("c", "t", "firefox"),
            ])
            .unwrap();
        registry
    }

    #[test]
    fn test_seed_duplicate_seeds_nothing() {
        let mut registry = TestRegistry::new();
        let result = registry.seed(&[
            descriptor("a", "t", "chrome"),
            descriptor("a", "t", "chrome"),
        ]);
        assert!(matches!(result, Err(Error::DuplicateTest { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_seed_duplicate_against_existing() {
        let mut registry = seeded();
        let result = registry.seed(&[descriptor("a", "t", "chrome")]);
        assert!(matches!(result, Err(Error::DuplicateTest { .. })));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_pending_never_jumps_to_success() {
        let mut registry = seeded();
        let result = registry.record_outcome(
            "a/t/chrome",
            TestStatus::Success,
            BTreeMap::new(),
            None,
            None,
        );
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn test_attempts_count_assignments() {
        let mut registry = seeded();
        registry.mark_running("a/t/chrome").unwrap();
        registry.requeue("a/t/chrome").unwrap();
        registry.mark_running("a/t/chrome").unwrap();
        assert_eq!(registry.get("a/t/chrome").unwrap().attempts, 2);
    }

    #[test]
    fn test_retest_clears_error_keeps_attempts() {
        let mut registry = seeded();
        registry.mark_running("a/t/chrome").unwrap();
        registry.fail("a/t/chrome", "exhausted retries").unwrap();

        registry.retest("a/t/chrome").unwrap();
        let record = registry.get("a/t/chrome").unwrap();
        assert_eq!(record.status, TestStatus::Pending);
        assert_eq!(record.error, None);
        assert_eq!(record.attempts, 1);
    }

    #[test]
    fn test_retest_requires_failed() {
        let mut registry = seeded();
        assert!(registry.retest("a/t/chrome").is_err());
    }

    #[test]
    fn test_skipped_is_inert() {
        let mut registry = TestRegistry::new();
        let mut skipped = descriptor("a", "t", "chrome");
        skipped.skip = true;
        registry.seed(&[skipped]).unwrap();

        assert_eq!(registry.get("a/t/chrome").unwrap().status, TestStatus::Skipped);
        assert!(registry.mark_running("a/t/chrome").is_err());
        assert_eq!(registry.open_count(), 0);
        // skipped does not count against the aggregate
        assert!(registry.all_success());
    }

    #[test]
    fn test_pending_in_order_follows_seeding_order() {
        let mut registry = seeded();
        registry.mark_running("a/t/chrome").unwrap();
        assert_eq!(registry.pending_in_order(), vec!["b/t/chrome", "c/t/firefox"]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut registry = seeded();
        let snapshot = registry.snapshot();
        registry.mark_running("a/t/chrome").unwrap();
        assert_eq!(snapshot["a/t/chrome"].status, TestStatus::Pending);
        assert_eq!(
            registry.get("a/t/chrome").unwrap().status,
            TestStatus::Running
        );
    }

    #[test]
    fn test_aggregate_verdict() {
        let mut registry = seeded();
        for id in ["a/t/chrome", "b/t/chrome", "c/t/firefox"] {
            registry.mark_running(id).unwrap();
            registry
                .record_outcome(id, TestStatus::Success, BTreeMap::new(), None, None)
                .unwrap();
        }
        assert!(registry.all_success());
        assert!(snapshot_success(&registry.snapshot()));

        let mut registry = seeded();
        registry.mark_running("a/t/chrome").unwrap();
        registry.fail("a/t/chrome", "boom").unwrap();
        assert!(!registry.all_success());
        assert!(!snapshot_success(&registry.snapshot()));
    }
}
