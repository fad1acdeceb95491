use std::sync::{Arc, RwLock};

use crate::sync::{read_lock, write_lock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanvasStatsSnapshot {
    pub chunk_count: usize,
    pub listener_count: usize,
    pub events_dispatched: u64,
    pub chunks_created: u64,
    pub chunks_deleted: u64,
    pub downloads_requested: u64,
    pub scans: u64,
}

/// Read side of the counters published by the broadcaster after every scheduler pass.
#[derive(Clone, Debug)]
pub struct CanvasStatsHandle {
    snapshot: Arc<RwLock<CanvasStatsSnapshot>>,
}

impl Default for CanvasStatsHandle {
    fn default() -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(CanvasStatsSnapshot::default())),
        }
    }
}

impl CanvasStatsHandle {
    pub fn snapshot(&self) -> CanvasStatsSnapshot {
        *read_lock(&self.snapshot, "canvas stats")
    }

    pub(crate) fn publish(&self, snapshot: CanvasStatsSnapshot) {
        *write_lock(&self.snapshot, "canvas stats") = snapshot;
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsAccumulator {
    events_dispatched: u64,
    chunks_deleted: u64,
    downloads_requested: u64,
    scans: u64,
}

impl StatsAccumulator {
    pub(crate) fn record_event(&mut self) {
        self.events_dispatched = self.events_dispatched.saturating_add(1);
    }

    pub(crate) fn record_scan(&mut self, deleted: usize, downloads: usize) {
        self.scans = self.scans.saturating_add(1);
        self.chunks_deleted = self.chunks_deleted.saturating_add(deleted as u64);
        self.downloads_requested = self.downloads_requested.saturating_add(downloads as u64);
    }

    pub(crate) fn snapshot(
        &self,
        chunk_count: usize,
        listener_count: usize,
        chunks_created: u64,
    ) -> CanvasStatsSnapshot {
        CanvasStatsSnapshot {
            chunk_count,
            listener_count,
            events_dispatched: self.events_dispatched,
            chunks_created,
            chunks_deleted: self.chunks_deleted,
            downloads_requested: self.downloads_requested,
            scans: self.scans,
        }
    }
}
