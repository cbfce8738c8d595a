//! Set-based coverage accounting.
//!
//! Every ingested address sits in exactly one of three sets: `pending`,
//! `scanned_ok` or `failed`. Host completion moves an address out of
//! `pending`; a later rescan of the same address (another chunk, a requeue,
//! a split child) simply overwrites the outcome, so duplicates across
//! chunks collapse to one entry and the latest result wins.
//!
//! `quarantined` is an advisory overlay: addresses that kept failing are
//! flagged there without leaving the main accounting.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Failed attempts after which an address is flagged as quarantined.
pub const QUARANTINE_THRESHOLD: u32 = 3;

/// Aggregate coverage counters.
///
/// `total` counts unique addresses, so `total = completed + failed +
/// pending` holds at any quiescent point. `killed` counts chunks, not
/// addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub killed: usize,
    pub quarantined: usize,
}

/// Tracks the outcome of every address the engine has ever ingested.
#[derive(Debug, Default)]
pub struct CoverageTracker {
    pending: HashSet<String>,
    scanned_ok: HashSet<String>,
    failed: HashSet<String>,
    quarantined: HashSet<String>,
    failure_counts: HashMap<String, u32>,
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places addresses into `pending`. Re-ingesting a finished address
    /// moves it back, because it is about to be rescanned.
    pub fn ingest<'a, I>(&mut self, addresses: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for address in addresses {
            self.scanned_ok.remove(address);
            self.failed.remove(address);
            self.pending.insert(address.to_string());
        }
    }

    /// Records a host outcome, moving the address to its final set.
    pub fn record(&mut self, address: &str, ok: bool) {
        self.pending.remove(address);
        if ok {
            self.failed.remove(address);
            self.scanned_ok.insert(address.to_string());
            self.failure_counts.remove(address);
            self.quarantined.remove(address);
        } else {
            self.scanned_ok.remove(address);
            self.failed.insert(address.to_string());
            let count = self.failure_counts.entry(address.to_string()).or_insert(0);
            *count += 1;
            if *count >= QUARANTINE_THRESHOLD {
                self.quarantined.insert(address.to_string());
            }
        }
    }

    pub fn is_quarantined(&self, address: &str) -> bool {
        self.quarantined.contains(address)
    }

    /// Counters at this instant. `killed_chunks` comes from the chunk
    /// registry because it counts chunks, not addresses.
    pub fn snapshot(&self, killed_chunks: usize) -> Coverage {
        let completed = self.scanned_ok.len();
        let failed = self.failed.len();
        let pending = self.pending.len();
        Coverage {
            total: completed + failed + pending,
            completed,
            failed,
            pending,
            killed: killed_chunks,
            quarantined: self.quarantined.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_then_record_conserves_membership() {
        let mut tracker = CoverageTracker::new();
        tracker.ingest(["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(tracker.snapshot(0).pending, 3);

        tracker.record("10.0.0.1", true);
        tracker.record("10.0.0.2", false);

        let coverage = tracker.snapshot(0);
        assert_eq!(coverage.total, 3);
        assert_eq!(coverage.completed, 1);
        assert_eq!(coverage.failed, 1);
        assert_eq!(coverage.pending, 1);
        assert_eq!(
            coverage.total,
            coverage.completed + coverage.failed + coverage.pending
        );
    }

    #[test]
    fn latest_outcome_wins_for_duplicate_addresses() {
        let mut tracker = CoverageTracker::new();
        tracker.ingest(["10.0.0.1"]);
        tracker.record("10.0.0.1", false);
        assert_eq!(tracker.snapshot(0).failed, 1);

        // The same address scanned again from another chunk.
        tracker.record("10.0.0.1", true);
        let coverage = tracker.snapshot(0);
        assert_eq!(coverage.total, 1);
        assert_eq!(coverage.completed, 1);
        assert_eq!(coverage.failed, 0);
    }

    #[test]
    fn reingest_moves_a_finished_address_back_to_pending() {
        let mut tracker = CoverageTracker::new();
        tracker.ingest(["10.0.0.1"]);
        tracker.record("10.0.0.1", true);
        tracker.ingest(["10.0.0.1"]);

        let coverage = tracker.snapshot(0);
        assert_eq!(coverage.total, 1);
        assert_eq!(coverage.pending, 1);
        assert_eq!(coverage.completed, 0);
    }

    #[test]
    fn quarantine_flags_repeat_offenders_without_moving_them() {
        let mut tracker = CoverageTracker::new();
        tracker.ingest(["10.0.0.1"]);
        for _ in 0..QUARANTINE_THRESHOLD {
            tracker.record("10.0.0.1", false);
        }
        assert!(tracker.is_quarantined("10.0.0.1"));
        let coverage = tracker.snapshot(0);
        assert_eq!(coverage.failed, 1);
        assert_eq!(coverage.quarantined, 1);

        // One success clears the flag and the failure streak.
        tracker.record("10.0.0.1", true);
        assert!(!tracker.is_quarantined("10.0.0.1"));
        assert_eq!(tracker.snapshot(0).quarantined, 0);
    }
}
