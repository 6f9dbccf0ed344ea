//! Lightweight atomic metrics, exposed as a point-in-time snapshot (ambient
//! stack; spec.md is silent on metrics but the Non-goals don't exclude
//! observability). Grounded in the teacher's `transaction/statistics.rs`
//! (`ComponentStats` trait, snapshot-on-read style) and `io/metrics.rs`
//! (atomic counters incremented on the hot path, summarized on demand).

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters touched from any zone thread on the data path. Every field is
/// an independent `AtomicU64`; no cross-field consistency is promised
/// between two reads of a snapshot, matching the teacher's metrics style.
#[derive(Default)]
pub struct Statistics {
    pub blocks_written: AtomicU64,
    pub blocks_read: AtomicU64,
    pub dedupe_hits: AtomicU64,
    pub dedupe_advice_valid: AtomicU64,
    pub dedupe_advice_stale: AtomicU64,
    pub blocks_allocated: AtomicU64,
    pub blocks_freed: AtomicU64,
    pub compressed_blocks_written: AtomicU64,
    pub compression_fragments_packed: AtomicU64,
    pub journal_blocks_written: AtomicU64,
    pub journal_blocks_reclaimed: AtomicU64,
    pub out_of_space_waits: AtomicU64,
    pub read_only_entries: AtomicU64,
}

/// Point-in-time snapshot, safe to serialize/log/export.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatisticsSnapshot {
    pub blocks_written: u64,
    pub blocks_read: u64,
    pub dedupe_hits: u64,
    pub dedupe_advice_valid: u64,
    pub dedupe_advice_stale: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub compressed_blocks_written: u64,
    pub compression_fragments_packed: u64,
    pub journal_blocks_written: u64,
    pub journal_blocks_reclaimed: u64,
    pub out_of_space_waits: u64,
    pub read_only_entries: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            dedupe_hits: self.dedupe_hits.load(Ordering::Relaxed),
            dedupe_advice_valid: self.dedupe_advice_valid.load(Ordering::Relaxed),
            dedupe_advice_stale: self.dedupe_advice_stale.load(Ordering::Relaxed),
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            blocks_freed: self.blocks_freed.load(Ordering::Relaxed),
            compressed_blocks_written: self.compressed_blocks_written.load(Ordering::Relaxed),
            compression_fragments_packed: self.compression_fragments_packed.load(Ordering::Relaxed),
            journal_blocks_written: self.journal_blocks_written.load(Ordering::Relaxed),
            journal_blocks_reclaimed: self.journal_blocks_reclaimed.load(Ordering::Relaxed),
            out_of_space_waits: self.out_of_space_waits.load(Ordering::Relaxed),
            read_only_entries: self.read_only_entries.load(Ordering::Relaxed),
        }
    }

    pub fn record_write(&self) {
        self.blocks_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self) {
        self.blocks_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dedupe_hit(&self) {
        self.dedupe_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allocation(&self) {
        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_free(&self) {
        self.blocks_freed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_only_entry(&self) {
        self.read_only_entries.fetch_add(1, Ordering::Relaxed);
    }
}

impl StatisticsSnapshot {
    /// Render as JSON, the shape exported to the admin/CLI surface (out of
    /// scope for this crate per spec §1, but its wire format is not).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("StatisticsSnapshot fields are all JSON-safe")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = Statistics::new();
        stats.record_write();
        stats.record_write();
        stats.record_dedupe_hit();
        let snap = stats.snapshot();
        assert_eq!(snap.blocks_written, 2);
        assert_eq!(snap.dedupe_hits, 1);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let stats = Statistics::new();
        stats.record_allocation();
        let json = stats.snapshot().to_json();
        assert!(json.contains("\"blocks_allocated\":1"));
    }
}
