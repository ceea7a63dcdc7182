//! Partition offset monitor.
//!
//! Tracks the highest processed offset per (source URN, partition) within
//! this replica. A partitioned source asks the monitor to `accept` each
//! message before processing and `mark`s it afterwards; offsets at or below
//! the mark are refused, which suppresses the duplicates a rebalance race can
//! push into a partition channel.

use std::collections::HashMap;
use std::sync::Mutex;

const METRIC_DUPLICATES: &str = "dataflow_monitor_duplicates";

/// Tracks per-partition processing progress for all sources of this replica.
#[derive(Default)]
pub struct Monitor {
    marks: Mutex<HashMap<(String, i32), i64>>,
}

impl Monitor {
    /// Create a new instance.
    pub fn new() -> Self {
        metrics::register_counter!(METRIC_DUPLICATES, metrics::Unit::Count, "messages refused as already processed");
        Self::default()
    }

    /// Register an assigned partition.
    pub fn assigned(&self, urn: &str, partition: i32) {
        tracing::info!(urn = %urn, partition, "assigned partition");
    }

    /// Deregister a revoked partition, discarding its mark.
    ///
    /// Any in-flight message of the partition may be redelivered to another
    /// replica; dropping the mark keeps a later re-assignment honest.
    pub fn revoked(&self, urn: &str, partition: i32) {
        tracing::info!(urn = %urn, partition, "revoked partition");
        let mut marks = self.marks.lock().expect("monitor mutex poisoned");
        marks.remove(&(urn.to_string(), partition));
    }

    /// Check whether the given offset should be processed.
    pub fn accept(&self, source_name: &str, urn: &str, partition: i32, offset: i64) -> bool {
        let marks = self.marks.lock().expect("monitor mutex poisoned");
        match marks.get(&(urn.to_string(), partition)) {
            Some(marked) if offset <= *marked => {
                tracing::debug!(source = %source_name, partition, offset, marked, "not accepting message");
                metrics::counter!(METRIC_DUPLICATES, 1);
                false
            }
            _ => true,
        }
    }

    /// Record that the given offset has been processed.
    pub fn mark(&self, urn: &str, partition: i32, offset: i64) {
        let mut marks = self.marks.lock().expect("monitor mutex poisoned");
        marks.insert((urn.to_string(), partition), offset);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const URN: &str = "urn:dataflow:kafka:broker:topic";

    #[test]
    fn accepts_fresh_offsets_in_order() {
        let monitor = Monitor::default();
        for offset in 0..3 {
            assert!(monitor.accept("in", URN, 0, offset), "offset {} must be accepted", offset);
            monitor.mark(URN, 0, offset);
        }
    }

    #[test]
    fn refuses_marked_offsets() {
        let monitor = Monitor::default();
        monitor.mark(URN, 0, 5);
        assert!(!monitor.accept("in", URN, 0, 5));
        assert!(!monitor.accept("in", URN, 0, 3));
        assert!(monitor.accept("in", URN, 0, 6));
    }

    #[test]
    fn partitions_are_independent() {
        let monitor = Monitor::default();
        monitor.mark(URN, 0, 10);
        assert!(monitor.accept("in", URN, 1, 0));
    }

    #[test]
    fn revocation_clears_the_mark() {
        let monitor = Monitor::default();
        monitor.mark(URN, 0, 10);
        monitor.revoked(URN, 0);
        assert!(monitor.accept("in", URN, 0, 0), "a re-assigned partition starts from its committed offset");
    }
}
