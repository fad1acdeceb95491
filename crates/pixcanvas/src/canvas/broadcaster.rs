use std::collections::{BTreeMap, HashSet};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::chunk::{Chunk, ChunkQueryState, ChunkStatus};
use super::chunk_map::ChunkMap;
use super::event::CanvasEvent;
use super::listener::{CanvasListener, ListenerId, ListenerResult};
use super::stats::{CanvasStatsHandle, StatsAccumulator};
use crate::geometry::{ChunkCoordinate, ChunkRect, Rect};

const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(10);

struct ListenerEntry {
    listener: Box<dyn CanvasListener>,
    all_events: bool,
    virtual_chunks: HashSet<ChunkCoordinate>,
}

impl ListenerEntry {
    fn wants(&self, chunks: ChunkRect) -> bool {
        if self.all_events {
            return true;
        }
        if chunks.len() <= self.virtual_chunks.len() {
            chunks.iter().any(|coord| self.virtual_chunks.contains(&coord))
        } else {
            self.virtual_chunks.iter().any(|coord| chunks.contains(*coord))
        }
    }
}

/// Single consumer of canvas events. Owns the listener registry and runs the
/// eviction and download scheduler between events.
pub(crate) struct Broadcaster {
    map: Arc<ChunkMap>,
    listeners: BTreeMap<ListenerId, ListenerEntry>,
    downloads: SyncSender<Arc<Chunk>>,
    stats: CanvasStatsHandle,
    accumulator: StatsAccumulator,
}

impl Broadcaster {
    pub(crate) fn new(map: Arc<ChunkMap>, downloads: SyncSender<Arc<Chunk>>, stats: CanvasStatsHandle) -> Self {
        Self {
            map,
            listeners: BTreeMap::new(),
            downloads,
            stats,
            accumulator: StatsAccumulator::default(),
        }
    }

    /// Runs until every event sender is gone, then detaches the remaining listeners.
    pub(crate) fn run(mut self, events: Receiver<CanvasEvent>) {
        let interval = self.map.config().scan_interval.max(MIN_SCAN_INTERVAL);
        let mut next_scan = Instant::now() + interval;
        loop {
            let timeout = next_scan.saturating_duration_since(Instant::now());
            match events.recv_timeout(timeout) {
                Ok(event) => self.dispatch(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if Instant::now() >= next_scan {
                self.scan();
                next_scan = Instant::now() + interval;
            }
        }

        self.detach_all();
        self.publish_stats();
        debug!("canvas_broadcaster_stopped");
    }

    fn dispatch(&mut self, event: CanvasEvent) {
        self.accumulator.record_event();
        let name = event.name();
        trace!(event = name, "canvas_event");
        match event {
            CanvasEvent::SetPixel { pos, color } => {
                let coord = self.map.chunk_coord(pos);
                let chunks = ChunkRect {
                    min: coord,
                    max: ChunkCoordinate::new(coord.x.saturating_add(1), coord.y.saturating_add(1)),
                };
                self.notify(name, chunks, |listener| listener.handle_set_pixel(pos, color));
            }
            CanvasEvent::SetImage { image } => {
                let chunks = self.map.outer_rect(image.rect());
                self.notify(name, chunks, |listener| listener.handle_set_image(&image));
            }
            CanvasEvent::RevalidateRect { rect } => {
                let chunks = self.map.outer_rect(rect);
                self.notify(name, chunks, |listener| listener.handle_revalidate_rect(rect));
            }
            CanvasEvent::InvalidateRect { rect } => {
                let chunks = self.map.outer_rect(rect);
                self.notify(name, chunks, |listener| listener.handle_invalidate_rect(rect));
            }
            CanvasEvent::InvalidateAll => {
                self.notify_all(name, |listener| listener.handle_invalidate_all());
            }
            CanvasEvent::SignalDownload { rect } => {
                let chunks = self.map.outer_rect(rect);
                self.notify(name, chunks, |listener| listener.handle_signal_download(rect));
            }
            CanvasEvent::SetTime { time } => {
                self.notify_all(name, |listener| listener.handle_set_time(time));
            }
            CanvasEvent::ListenerSubscribe {
                id,
                listener,
                all_events,
            } => {
                let mut entry = ListenerEntry {
                    listener,
                    all_events,
                    virtual_chunks: HashSet::new(),
                };
                if all_events {
                    let mut coords = self.map.snapshot().iter().map(|chunk| chunk.coord()).collect::<Vec<_>>();
                    coords.sort_by_key(|coord| (coord.y, coord.x));
                    catch_up(&self.map, id, entry.listener.as_mut(), coords);
                }
                self.listeners.insert(id, entry);
                debug!(listener = %id, all_events, "listener_subscribed");
                self.publish_stats();
            }
            CanvasEvent::ListenerUnsubscribe { id, detached } => {
                let found = match self.listeners.remove(&id) {
                    Some(mut entry) => {
                        report(id, "detach", entry.listener.handle_detach());
                        debug!(listener = %id, "listener_unsubscribed");
                        true
                    }
                    None => false,
                };
                // The caller may have given up waiting.
                let _ = detached.send(found);
                self.publish_stats();
            }
            CanvasEvent::ListenerRectsChanged { id, rects } => {
                self.change_rects(id, &rects);
                self.scan();
            }
            CanvasEvent::Sync => self.scan(),
        }
    }

    fn notify(
        &mut self,
        event: &'static str,
        chunks: ChunkRect,
        mut call: impl FnMut(&mut dyn CanvasListener) -> ListenerResult,
    ) {
        for (id, entry) in self.listeners.iter_mut() {
            if entry.wants(chunks) {
                report(*id, event, call(entry.listener.as_mut()));
            }
        }
    }

    fn notify_all(&mut self, event: &'static str, mut call: impl FnMut(&mut dyn CanvasListener) -> ListenerResult) {
        for (id, entry) in self.listeners.iter_mut() {
            report(*id, event, call(entry.listener.as_mut()));
        }
    }

    fn change_rects(&mut self, id: ListenerId, rects: &[Rect]) {
        let Some(entry) = self.listeners.get_mut(&id) else {
            warn!(listener = %id, "listener_rects_for_unknown_listener");
            return;
        };

        let needed = rects
            .iter()
            .flat_map(|rect| self.map.outer_rect(*rect).iter())
            .collect::<HashSet<_>>();
        let mut created = needed.difference(&entry.virtual_chunks).copied().collect::<Vec<_>>();
        let mut removed = entry.virtual_chunks.difference(&needed).copied().collect::<Vec<_>>();
        created.sort_by_key(|coord| (coord.y, coord.x));
        removed.sort_by_key(|coord| (coord.y, coord.x));
        entry.virtual_chunks = needed;

        if created.is_empty() && removed.is_empty() {
            return;
        }
        let created_rects = created.iter().map(|coord| self.map.pixel_rect(*coord)).collect::<Vec<_>>();
        let removed_rects = removed.iter().map(|coord| self.map.pixel_rect(*coord)).collect::<Vec<_>>();
        debug!(
            listener = %id,
            created = created.len(),
            removed = removed.len(),
            "listener_chunks_changed"
        );
        report(
            id,
            "chunks_change",
            entry.listener.handle_chunks_change(&created_rects, &removed_rects),
        );

        catch_up(&self.map, id, entry.listener.as_mut(), created);
    }

    /// Scheduler pass: creates watched chunks, evicts stale ones and queues downloads.
    fn scan(&mut self) {
        let watched = self
            .listeners
            .values()
            .flat_map(|entry| entry.virtual_chunks.iter().copied())
            .collect::<HashSet<_>>();
        for coord in &watched {
            // Coordinates outside the world are never created.
            let _ = self.map.get(*coord, true);
        }

        let lifetime = self.map.config().lifetime;
        let mut deleted = 0;
        let mut downloads = 0;
        for chunk in self.map.snapshot() {
            let is_watched = watched.contains(&chunk.coord());
            match chunk.query_state(is_watched, &lifetime) {
                ChunkQueryState::Delete => {
                    if self.map.remove_if_same(&chunk) {
                        trace!(chunk = %chunk.coord(), "chunk_deleted");
                        deleted += 1;
                    }
                }
                ChunkQueryState::Download if is_watched => match self.downloads.try_send(Arc::clone(&chunk)) {
                    Ok(()) => downloads += 1,
                    Err(TrySendError::Full(_)) => {
                        trace!(chunk = %chunk.coord(), "download_queue_full");
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                },
                ChunkQueryState::Download | ChunkQueryState::Keep => {}
            }
        }

        self.accumulator.record_scan(deleted, downloads);
        if deleted > 0 || downloads > 0 {
            debug!(deleted, downloads, chunks = self.map.len(), "canvas_scan");
        }
        self.publish_stats();
    }

    fn detach_all(&mut self) {
        for (id, mut entry) in std::mem::take(&mut self.listeners) {
            report(id, "detach", entry.listener.handle_detach());
        }
    }

    fn publish_stats(&self) {
        self.stats.publish(self.accumulator.snapshot(
            self.map.len(),
            self.listeners.len(),
            self.map.created_total(),
        ));
    }
}

/// Brings a listener up to date with chunks that already exist.
fn catch_up(
    map: &ChunkMap,
    id: ListenerId,
    listener: &mut dyn CanvasListener,
    coords: impl IntoIterator<Item = ChunkCoordinate>,
) {
    for coord in coords {
        let Ok(chunk) = map.get(coord, false) else {
            continue;
        };
        match chunk.image_copy(false) {
            Ok((image, ChunkStatus::Valid)) => {
                report(id, "set_image", listener.handle_set_image(&image));
            }
            Ok((_, ChunkStatus::Downloading)) => {
                report(id, "signal_download", listener.handle_signal_download(chunk.rect()));
            }
            Ok((_, ChunkStatus::Invalid)) | Err(_) => {}
        }
    }
}

fn report(id: ListenerId, event: &'static str, result: ListenerResult) {
    if let Err(error) = result {
        warn!(listener = %id, event, error = %error, "listener_callback_failed");
    }
}
