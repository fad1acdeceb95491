use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use super::broadcaster::Broadcaster;
use super::chunk::{Chunk, ChunkStatus, SetImageOutcome};
use super::chunk_map::ChunkMap;
use super::config::CanvasConfig;
use super::error::CanvasError;
use super::event::CanvasEvent;
use super::image::{CanvasImage, Color, Palette};
use super::listener::{CanvasListener, ListenerId};
use super::stats::CanvasStatsHandle;
use crate::geometry::{ChunkCoordinate, ChunkRect, PixelSize, Point, Rect};
use crate::sync::{mutex_lock, read_lock, write_lock};

/// Receiving end of the scheduler's download requests.
///
/// Every received chunk is watched by at least one listener and was invalid
/// when it was queued. A connector should re-check it with
/// [`Chunk::query_state`] before fetching.
#[derive(Debug)]
pub struct DownloadRequests {
    receiver: Receiver<Arc<Chunk>>,
}

impl DownloadRequests {
    /// Blocks until a request arrives. `None` once the canvas is closed.
    pub fn recv(&self) -> Option<Arc<Chunk>> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Arc<Chunk>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Arc<Chunk>, TryRecvError> {
        self.receiver.try_recv()
    }
}

struct CanvasInner {
    map: Arc<ChunkMap>,
    events: RwLock<Option<SyncSender<CanvasEvent>>>,
    broadcaster: Mutex<Option<JoinHandle<()>>>,
    next_listener_id: AtomicU64,
    stats: CanvasStatsHandle,
}

impl CanvasInner {
    fn shutdown(&self) {
        let sender = write_lock(&self.events, "canvas events").take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let handle = mutex_lock(&self.broadcaster, "canvas broadcaster").take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                warn!("canvas_closed_from_listener_callback");
                return;
            }
            if handle.join().is_err() {
                warn!("canvas_broadcaster_panicked");
            }
        }
        info!(chunks = self.map.len(), "canvas_closed");
    }
}

impl Drop for CanvasInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shared handle to a sparse, chunked pixel canvas.
///
/// Clones refer to the same canvas. Mutations apply to the chunks right away
/// and are then forwarded to the broadcaster thread, which notifies listeners
/// in the order the mutations happened. The canvas closes when [`Canvas::close`]
/// is called or the last handle is dropped.
#[derive(Clone)]
pub struct Canvas {
    inner: Arc<CanvasInner>,
}

impl Canvas {
    /// Creates the canvas and starts its broadcaster thread.
    pub fn new(config: CanvasConfig) -> Result<(Canvas, DownloadRequests), CanvasError> {
        if !config.chunk_size.is_positive() {
            return Err(CanvasError::InvalidState("chunk size must be positive"));
        }

        let (event_tx, event_rx) = mpsc::sync_channel(config.event_queue_capacity.max(1));
        let (download_tx, download_rx) = mpsc::sync_channel(config.download_queue_capacity.max(1));
        let stats = CanvasStatsHandle::default();
        let chunk_size = config.chunk_size;
        let origin = config.origin;
        let map = Arc::new(ChunkMap::new(config));

        let broadcaster = Broadcaster::new(Arc::clone(&map), download_tx, stats.clone());
        let handle = thread::Builder::new()
            .name("canvas-broadcaster".to_string())
            .spawn(move || broadcaster.run(event_rx))
            .map_err(|error| CanvasError::Spawn(error.to_string()))?;
        info!(
            chunk_width = chunk_size.width,
            chunk_height = chunk_size.height,
            origin = %origin,
            "canvas_started"
        );

        let canvas = Canvas {
            inner: Arc::new(CanvasInner {
                map,
                events: RwLock::new(Some(event_tx)),
                broadcaster: Mutex::new(Some(handle)),
                next_listener_id: AtomicU64::new(1),
                stats,
            }),
        };
        Ok((
            canvas,
            DownloadRequests {
                receiver: download_rx,
            },
        ))
    }

    pub fn config(&self) -> &CanvasConfig {
        self.inner.map.config()
    }

    pub fn chunk_size(&self) -> PixelSize {
        self.config().chunk_size
    }

    pub fn origin(&self) -> Point {
        self.config().origin
    }

    pub fn palette(&self) -> Option<&Arc<Palette>> {
        self.config().palette.as_ref()
    }

    pub fn stats(&self) -> CanvasStatsHandle {
        self.inner.stats.clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.map.len()
    }

    pub fn is_closed(&self) -> bool {
        read_lock(&self.inner.events, "canvas events").is_none()
    }

    pub fn chunk_coord(&self, pos: Point) -> ChunkCoordinate {
        self.inner.map.chunk_coord(pos)
    }

    /// Smallest chunk rectangle covering `rect`.
    pub fn outer_chunk_rect(&self, rect: Rect) -> ChunkRect {
        self.inner.map.outer_rect(rect)
    }

    /// Largest chunk rectangle fully inside `rect`.
    pub fn inner_chunk_rect(&self, rect: Rect) -> ChunkRect {
        self.inner.map.inner_rect(rect)
    }

    pub fn get_chunk(&self, coord: ChunkCoordinate, create: bool) -> Result<Arc<Chunk>, CanvasError> {
        if create && self.is_closed() {
            return Err(CanvasError::Closed);
        }
        self.inner.map.get(coord, create)
    }

    pub fn get_chunks(
        &self,
        rect: ChunkRect,
        create: bool,
        ignore_missing: bool,
    ) -> Result<Vec<Arc<Chunk>>, CanvasError> {
        if create && self.is_closed() {
            return Err(CanvasError::Closed);
        }
        self.inner.map.get_many(rect, create, ignore_missing)
    }

    pub fn get_pixel(&self, pos: Point) -> Result<Color, CanvasError> {
        let coord = self.chunk_coord(pos);
        let chunk = self.inner.map.get(coord, false)?;
        chunk.pixel(pos).map_err(CanvasError::chunk(coord))
    }

    pub fn get_pixel_index(&self, pos: Point) -> Result<u8, CanvasError> {
        let coord = self.chunk_coord(pos);
        let chunk = self.inner.map.get(coord, false)?;
        chunk.pixel_index(pos).map_err(CanvasError::chunk(coord))
    }

    /// Writes one pixel into an existing chunk. Listeners see the stored
    /// color, which on paletted canvases is the nearest palette entry.
    pub fn set_pixel(&self, pos: Point, color: Color) -> Result<(), CanvasError> {
        self.with_events(|events| {
            let coord = self.chunk_coord(pos);
            let chunk = self.inner.map.get(coord, false)?;
            let color = chunk.set_pixel(pos, color).map_err(CanvasError::chunk(coord))?;
            emit(events, CanvasEvent::SetPixel { pos, color })
        })
    }

    /// Paletted variant of [`Canvas::set_pixel`]. Listeners see the resolved color.
    pub fn set_pixel_index(&self, pos: Point, index: u8) -> Result<(), CanvasError> {
        self.with_events(|events| {
            let coord = self.chunk_coord(pos);
            let chunk = self.inner.map.get(coord, false)?;
            let color = chunk.set_pixel_index(pos, index).map_err(CanvasError::chunk(coord))?;
            emit(events, CanvasEvent::SetPixel { pos, color })
        })
    }

    /// Delivers downloaded content to every chunk fully covered by `image`.
    ///
    /// Each target chunk must be downloading. Chunks whose content did not
    /// change are reported to listeners as revalidated instead of replaced.
    pub fn set_image(&self, image: &CanvasImage, create: bool, ignore_missing: bool) -> Result<(), CanvasError> {
        self.with_events(|events| {
            let chunks = self
                .inner
                .map
                .get_many(self.inner_chunk_rect(image.rect()), create, ignore_missing)?;
            for chunk in chunks {
                match chunk.set_image(image).map_err(CanvasError::chunk(chunk.coord()))? {
                    SetImageOutcome::Replaced(image) => emit(events, CanvasEvent::SetImage { image })?,
                    SetImageOutcome::Unchanged => emit(events, CanvasEvent::RevalidateRect { rect: chunk.rect() })?,
                }
            }
            Ok(())
        })
    }

    /// RGBA copy of `rect`. Chunks that are missing or not valid stay transparent.
    ///
    /// With `only_if_valid` every touched chunk must exist and be valid.
    pub fn get_image_copy(
        &self,
        rect: Rect,
        only_if_valid: bool,
        ignore_missing: bool,
    ) -> Result<CanvasImage, CanvasError> {
        let chunks = self.inner.map.get_many(
            self.outer_chunk_rect(rect),
            false,
            ignore_missing && !only_if_valid,
        )?;
        let mut result = CanvasImage::new_rgba(rect);
        for chunk in chunks {
            let (image, status) = chunk
                .image_copy(only_if_valid)
                .map_err(CanvasError::chunk(chunk.coord()))?;
            if status == ChunkStatus::Valid {
                result.copy_from(&image);
            }
        }
        Ok(result)
    }

    pub fn invalidate_rect(&self, rect: Rect, ignore_missing: bool) -> Result<(), CanvasError> {
        self.with_events(|events| {
            let chunks = self
                .inner
                .map
                .get_many(self.outer_chunk_rect(rect), false, ignore_missing)?;
            for chunk in &chunks {
                chunk.invalidate();
            }
            emit(events, CanvasEvent::InvalidateRect { rect })
        })
    }

    pub fn invalidate_all(&self) -> Result<(), CanvasError> {
        self.with_events(|events| {
            for chunk in self.inner.map.snapshot() {
                chunk.invalidate();
            }
            emit(events, CanvasEvent::InvalidateAll)
        })
    }

    /// Marks existing chunks in `rect` valid without touching their content.
    pub fn revalidate_rect(&self, rect: Rect) -> Result<(), CanvasError> {
        self.with_events(|events| {
            let chunks = self.inner.map.get_many(self.outer_chunk_rect(rect), false, true)?;
            for chunk in &chunks {
                chunk.revalidate();
            }
            emit(events, CanvasEvent::RevalidateRect { rect })
        })
    }

    /// Creates missing chunks in `rect` and moves the invalid ones to downloading.
    ///
    /// Returns the chunks that actually transitioned. Listeners are only
    /// notified when that set is not empty.
    pub fn signal_download(&self, rect: Rect) -> Result<Vec<Arc<Chunk>>, CanvasError> {
        self.with_events(|events| {
            let chunks = self.inner.map.get_many(self.outer_chunk_rect(rect), true, true)?;
            let started = chunks
                .into_iter()
                .filter(|chunk| chunk.signal_download())
                .collect::<Vec<_>>();
            if !started.is_empty() {
                emit(events, CanvasEvent::SignalDownload { rect })?;
            }
            Ok(started)
        })
    }

    /// True when every chunk touched by `rect` exists and is valid.
    pub fn is_valid(&self, rect: Rect) -> bool {
        match self.inner.map.get_many(self.outer_chunk_rect(rect), false, false) {
            Ok(chunks) => chunks.iter().all(|chunk| chunk.status() == ChunkStatus::Valid),
            Err(_) => false,
        }
    }

    /// Forwards a replay clock update to all listeners.
    pub fn set_time(&self, time: SystemTime) -> Result<(), CanvasError> {
        self.with_events(|events| emit(events, CanvasEvent::SetTime { time }))
    }

    /// Requests a scheduler pass without waiting for the next interval.
    pub fn sync(&self) -> Result<(), CanvasError> {
        self.with_events(|events| emit(events, CanvasEvent::Sync))
    }

    /// Registers a listener. Without `all_events` it only receives events
    /// touching the rectangles later passed to [`Canvas::register_rects`].
    pub fn subscribe_listener(
        &self,
        listener: Box<dyn CanvasListener>,
        all_events: bool,
    ) -> Result<ListenerId, CanvasError> {
        self.with_events(|events| {
            let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
            emit(
                events,
                CanvasEvent::ListenerSubscribe {
                    id,
                    listener,
                    all_events,
                },
            )?;
            Ok(id)
        })
    }

    /// Replaces the listener's rectangles of interest. The chunks covering
    /// them are kept alive and downloaded on demand.
    pub fn register_rects(&self, id: ListenerId, rects: Vec<Rect>) -> Result<(), CanvasError> {
        self.with_events(|events| emit(events, CanvasEvent::ListenerRectsChanged { id, rects }))
    }

    /// Removes a listener and waits until its detach callback has run.
    ///
    /// Returns false if the listener was not subscribed.
    pub fn unsubscribe_listener(&self, id: ListenerId) -> Result<bool, CanvasError> {
        let (detached_tx, detached_rx) = mpsc::sync_channel(1);
        self.with_events(|events| {
            emit(
                events,
                CanvasEvent::ListenerUnsubscribe {
                    id,
                    detached: detached_tx,
                },
            )
        })?;
        // A broadcaster that stopped meanwhile detaches every listener itself.
        Ok(detached_rx.recv().unwrap_or(false))
    }

    /// Stops the broadcaster after it drained all pending events. Every
    /// remaining listener is detached. Calling this again has no effect.
    pub fn close(&self) {
        debug!("canvas_close_requested");
        self.inner.shutdown();
    }

    /// Runs `action` with the event sender while holding the closed-state
    /// lock, so mutations and their events cannot interleave with `close`.
    fn with_events<T>(
        &self,
        action: impl FnOnce(&SyncSender<CanvasEvent>) -> Result<T, CanvasError>,
    ) -> Result<T, CanvasError> {
        let events = read_lock(&self.inner.events, "canvas events");
        let sender = events.as_ref().ok_or(CanvasError::Closed)?;
        action(sender)
    }
}

fn emit(events: &SyncSender<CanvasEvent>, event: CanvasEvent) -> Result<(), CanvasError> {
    events.send(event).map_err(|_| CanvasError::Closed)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::canvas::error::ErrorKind;
    use crate::canvas::image::{opaque, TRANSPARENT};
    use crate::canvas::listener::ListenerResult;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Pixel(Point, Color),
        Image(Rect),
        Invalidate(Rect),
        InvalidateAll,
        Revalidate(Rect),
        Download(Rect),
        Chunks(Vec<Rect>, Vec<Rect>),
        Time(SystemTime),
        Detach,
    }

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<Seen>>>);

    impl Log {
        fn take(&self) -> Vec<Seen> {
            std::mem::take(&mut *self.0.lock().expect("log lock"))
        }

        fn push(&self, seen: Seen) -> ListenerResult {
            self.0.lock().expect("log lock").push(seen);
            Ok(())
        }
    }

    impl CanvasListener for Log {
        fn handle_set_pixel(&mut self, pos: Point, color: Color) -> ListenerResult {
            self.push(Seen::Pixel(pos, color))
        }
        fn handle_set_image(&mut self, image: &CanvasImage) -> ListenerResult {
            self.push(Seen::Image(image.rect()))
        }
        fn handle_invalidate_rect(&mut self, rect: Rect) -> ListenerResult {
            self.push(Seen::Invalidate(rect))
        }
        fn handle_invalidate_all(&mut self) -> ListenerResult {
            self.push(Seen::InvalidateAll)
        }
        fn handle_signal_download(&mut self, rect: Rect) -> ListenerResult {
            self.push(Seen::Download(rect))
        }
        fn handle_chunks_change(&mut self, created: &[Rect], removed: &[Rect]) -> ListenerResult {
            self.push(Seen::Chunks(created.to_vec(), removed.to_vec()))
        }
        fn handle_revalidate_rect(&mut self, rect: Rect) -> ListenerResult {
            self.push(Seen::Revalidate(rect))
        }
        fn handle_set_time(&mut self, time: SystemTime) -> ListenerResult {
            self.push(Seen::Time(time))
        }
        fn handle_detach(&mut self) -> ListenerResult {
            self.push(Seen::Detach)
        }
    }

    fn canvas() -> (Canvas, DownloadRequests) {
        Canvas::new(CanvasConfig {
            scan_interval: Duration::from_secs(3600),
            ..CanvasConfig::with_chunk_size(PixelSize::new(4, 4))
        })
        .expect("canvas")
    }

    fn filled(rect: Rect, color: Color) -> CanvasImage {
        let mut image = CanvasImage::new_rgba(rect);
        for y in rect.min.y..rect.max.y {
            for x in rect.min.x..rect.max.x {
                image.set_pixel(Point::new(x, y), color).expect("inside");
            }
        }
        image
    }

    fn download(canvas: &Canvas, rect: Rect, color: Color) {
        canvas.signal_download(rect).expect("signal");
        canvas.set_image(&filled(rect, color), false, false).expect("set image");
    }

    #[test]
    fn rejects_non_positive_chunk_size() {
        let result = Canvas::new(CanvasConfig::with_chunk_size(PixelSize::new(0, 4)));
        assert!(matches!(result, Err(CanvasError::InvalidState(_))));
    }

    #[test]
    fn pixel_access_requires_existing_chunk() {
        let (canvas, _downloads) = canvas();
        let error = canvas.get_pixel(Point::new(1, 1)).expect_err("missing");
        assert_eq!(error.kind(), ErrorKind::NotFound);
        let error = canvas
            .set_pixel(Point::new(-1, 0), opaque(1, 2, 3))
            .expect_err("missing");
        assert_eq!(
            error,
            CanvasError::NotFound {
                coord: ChunkCoordinate::new(-1, 0)
            }
        );

        canvas.get_chunk(ChunkCoordinate::new(-1, 0), true).expect("create");
        canvas.set_pixel(Point::new(-1, 0), opaque(1, 2, 3)).expect("set");
        assert_eq!(canvas.get_pixel(Point::new(-1, 0)), Ok(opaque(1, 2, 3)));
    }

    #[test]
    fn paletted_set_pixel_reports_stored_color_to_listeners() {
        let palette = Palette::new(vec![opaque(255, 255, 255), opaque(229, 0, 0)]).expect("palette");
        let (canvas, _downloads) = Canvas::new(CanvasConfig {
            palette: Some(Arc::new(palette)),
            scan_interval: Duration::from_secs(3600),
            ..CanvasConfig::with_chunk_size(PixelSize::new(4, 4))
        })
        .expect("canvas");
        let log = Log::default();
        let id = canvas.subscribe_listener(Box::new(log.clone()), true).expect("subscribe");
        canvas.get_chunk(ChunkCoordinate::new(0, 0), true).expect("create");
        canvas.set_pixel(Point::new(1, 1), opaque(250, 10, 10)).expect("pixel");
        canvas.unsubscribe_listener(id).expect("unsubscribe");

        let stored = canvas.get_pixel(Point::new(1, 1)).expect("stored");
        assert_eq!(stored, opaque(229, 0, 0));
        assert_eq!(log.take(), vec![Seen::Pixel(Point::new(1, 1), stored), Seen::Detach]);
    }

    #[test]
    fn invalidate_missing_rect_honours_ignore_missing() {
        let (canvas, _downloads) = canvas();
        let valid = Rect::new(0, 0, 4, 4);
        download(&canvas, valid, opaque(3, 3, 3));
        let empty = Rect::new(40, 40, 48, 48);

        canvas.invalidate_rect(empty, true).expect("ignored");
        assert_eq!(canvas.chunk_count(), 1);
        assert!(canvas.is_valid(valid));

        let error = canvas.invalidate_rect(empty, false).expect_err("missing");
        assert_eq!(error.kind(), ErrorKind::NotFound);
        assert_eq!(canvas.chunk_count(), 1);
        assert!(canvas.is_valid(valid));
    }

    #[test]
    fn set_image_requires_downloading_chunks() {
        let (canvas, _downloads) = canvas();
        let rect = Rect::new(0, 0, 8, 4);
        canvas.get_chunks(canvas.outer_chunk_rect(rect), true, false).expect("create");
        let error = canvas
            .set_image(&filled(rect, opaque(9, 9, 9)), false, false)
            .expect_err("not downloading");
        assert_eq!(error.kind(), ErrorKind::InvalidState);

        download(&canvas, rect, opaque(9, 9, 9));
        assert!(canvas.is_valid(rect));
        assert_eq!(canvas.get_pixel(Point::new(7, 3)), Ok(opaque(9, 9, 9)));
    }

    #[test]
    fn set_image_only_touches_fully_covered_chunks() {
        let (canvas, _downloads) = canvas();
        canvas.signal_download(Rect::new(0, 0, 8, 4)).expect("signal");
        canvas
            .set_image(&filled(Rect::new(0, 0, 6, 4), opaque(5, 5, 5)), false, true)
            .expect("partial");
        assert!(canvas.is_valid(Rect::new(0, 0, 4, 4)));
        assert!(!canvas.is_valid(Rect::new(4, 0, 8, 4)));
    }

    #[test]
    fn signal_download_reports_only_transitions() {
        let (canvas, _downloads) = canvas();
        let rect = Rect::new(0, 0, 8, 8);
        assert_eq!(canvas.signal_download(rect).expect("first").len(), 4);
        assert!(canvas.signal_download(rect).expect("second").is_empty());
        canvas.invalidate_rect(Rect::new(0, 0, 1, 1), false).expect("invalidate");
        let again = canvas.signal_download(rect).expect("third");
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].coord(), ChunkCoordinate::new(0, 0));
    }

    #[test]
    fn get_image_copy_renders_invalid_chunks_transparent() {
        let (canvas, _downloads) = canvas();
        download(&canvas, Rect::new(0, 0, 4, 4), opaque(1, 1, 1));
        canvas.signal_download(Rect::new(4, 0, 8, 4)).expect("signal");

        let copy = canvas
            .get_image_copy(Rect::new(2, 0, 10, 2), false, true)
            .expect("copy");
        assert_eq!(copy.rect(), Rect::new(2, 0, 10, 2));
        assert_eq!(copy.pixel(Point::new(3, 1)), Ok(opaque(1, 1, 1)));
        assert_eq!(copy.pixel(Point::new(4, 1)), Ok(TRANSPARENT));
        assert_eq!(copy.pixel(Point::new(9, 1)), Ok(TRANSPARENT));

        assert!(canvas.get_image_copy(Rect::new(2, 0, 10, 2), false, false).is_err());
        assert!(canvas.get_image_copy(Rect::new(0, 0, 8, 4), true, true).is_err());
        assert!(canvas.get_image_copy(Rect::new(0, 0, 4, 4), true, false).is_ok());
    }

    #[test]
    fn pixels_written_during_download_survive_image_arrival() {
        let (canvas, _downloads) = canvas();
        let rect = Rect::new(0, 0, 4, 4);
        canvas.signal_download(rect).expect("signal");
        canvas.set_pixel(Point::new(2, 2), opaque(255, 0, 0)).expect("queued");
        canvas.set_image(&filled(rect, opaque(0, 0, 255)), false, false).expect("image");
        assert_eq!(canvas.get_pixel(Point::new(2, 2)), Ok(opaque(255, 0, 0)));
        assert_eq!(canvas.get_pixel(Point::new(1, 1)), Ok(opaque(0, 0, 255)));
    }

    #[test]
    fn all_events_listener_sees_events_in_order() {
        let (canvas, _downloads) = canvas();
        let log = Log::default();
        let id = canvas.subscribe_listener(Box::new(log.clone()), true).expect("subscribe");
        let rect = Rect::new(0, 0, 4, 4);

        canvas.signal_download(rect).expect("signal");
        canvas.set_image(&filled(rect, opaque(3, 3, 3)), false, false).expect("image");
        canvas.set_pixel(Point::new(1, 1), opaque(4, 4, 4)).expect("pixel");
        canvas.invalidate_rect(rect, false).expect("invalidate");
        canvas.signal_download(rect).expect("signal again");
        canvas.set_image(&filled(rect, opaque(3, 3, 3)), false, false).expect("image again");
        canvas.signal_download(rect).expect("no transition");
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(60);
        canvas.set_time(time).expect("time");
        canvas.invalidate_all().expect("invalidate all");
        assert_eq!(canvas.unsubscribe_listener(id), Ok(true));

        assert_eq!(
            log.take(),
            vec![
                Seen::Download(rect),
                Seen::Image(rect),
                Seen::Pixel(Point::new(1, 1), opaque(4, 4, 4)),
                Seen::Invalidate(rect),
                Seen::Download(rect),
                Seen::Image(rect),
                Seen::Time(time),
                Seen::InvalidateAll,
                Seen::Detach,
            ]
        );
        assert_eq!(canvas.unsubscribe_listener(id), Ok(false));
    }

    #[test]
    fn unchanged_image_is_reported_as_revalidation() {
        let (canvas, _downloads) = canvas();
        let log = Log::default();
        let id = canvas.subscribe_listener(Box::new(log.clone()), true).expect("subscribe");
        let rect = Rect::new(0, 0, 4, 4);
        download(&canvas, rect, opaque(6, 6, 6));
        canvas.invalidate_rect(rect, false).expect("invalidate");
        download(&canvas, rect, opaque(6, 6, 6));
        canvas.unsubscribe_listener(id).expect("unsubscribe");

        assert_eq!(
            log.take(),
            vec![
                Seen::Download(rect),
                Seen::Image(rect),
                Seen::Invalidate(rect),
                Seen::Download(rect),
                Seen::Revalidate(rect),
                Seen::Detach,
            ]
        );
    }

    #[test]
    fn rect_listener_only_sees_its_chunks_and_gets_downloads() {
        let (canvas, downloads) = canvas();
        let log = Log::default();
        let id = canvas.subscribe_listener(Box::new(log.clone()), false).expect("subscribe");
        let watched = Rect::new(1, 1, 3, 3);
        canvas.register_rects(id, vec![watched]).expect("register");

        let chunk = downloads.recv_timeout(Duration::from_secs(5)).expect("download request");
        assert_eq!(chunk.coord(), ChunkCoordinate::new(0, 0));
        let chunk_rect = Rect::new(0, 0, 4, 4);
        download(&canvas, chunk_rect, opaque(7, 7, 7));

        canvas.get_chunk(ChunkCoordinate::new(5, 5), true).expect("unwatched");
        canvas.set_pixel(Point::new(21, 21), opaque(1, 1, 1)).expect("elsewhere");
        canvas.set_pixel(Point::new(3, 3), opaque(2, 2, 2)).expect("watched");
        canvas.register_rects(id, Vec::new()).expect("clear");
        canvas.unsubscribe_listener(id).expect("unsubscribe");

        assert_eq!(
            log.take(),
            vec![
                Seen::Chunks(vec![chunk_rect], Vec::new()),
                Seen::Download(chunk_rect),
                Seen::Image(chunk_rect),
                Seen::Pixel(Point::new(3, 3), opaque(2, 2, 2)),
                Seen::Chunks(Vec::new(), vec![chunk_rect]),
                Seen::Detach,
            ]
        );
    }

    #[test]
    fn newly_watched_valid_chunks_are_replayed_to_listener() {
        let (canvas, _downloads) = canvas();
        let rect = Rect::new(4, 4, 8, 8);
        download(&canvas, rect, opaque(8, 8, 8));

        let log = Log::default();
        let id = canvas.subscribe_listener(Box::new(log.clone()), false).expect("subscribe");
        canvas.register_rects(id, vec![Rect::new(5, 5, 6, 6)]).expect("register");
        canvas.unsubscribe_listener(id).expect("unsubscribe");

        assert_eq!(
            log.take(),
            vec![Seen::Chunks(vec![rect], Vec::new()), Seen::Image(rect), Seen::Detach]
        );
    }

    #[test]
    fn all_events_listener_receives_existing_chunks_on_subscribe() {
        let (canvas, _downloads) = canvas();
        let first = Rect::new(4, 0, 8, 4);
        let second = Rect::new(0, 4, 4, 8);
        download(&canvas, second, opaque(2, 2, 2));
        download(&canvas, first, opaque(1, 1, 1));
        let pending = Rect::new(8, 0, 12, 4);
        canvas.signal_download(pending).expect("pending");
        canvas.get_chunk(ChunkCoordinate::new(5, 5), true).expect("invalid");

        let log = Log::default();
        let id = canvas.subscribe_listener(Box::new(log.clone()), true).expect("subscribe");
        canvas.unsubscribe_listener(id).expect("unsubscribe");

        assert_eq!(
            log.take(),
            vec![
                Seen::Image(first),
                Seen::Download(pending),
                Seen::Image(second),
                Seen::Detach,
            ]
        );
    }

    #[test]
    fn stale_unwatched_chunks_are_evicted() {
        let (canvas, _downloads) = Canvas::new(CanvasConfig {
            lifetime: crate::canvas::chunk::ChunkLifetime {
                delete_invalid_after: Duration::ZERO,
                delete_unqueried_after: Duration::ZERO,
            },
            scan_interval: Duration::from_secs(3600),
            ..CanvasConfig::with_chunk_size(PixelSize::new(4, 4))
        })
        .expect("canvas");
        canvas.get_chunk(ChunkCoordinate::new(0, 0), true).expect("invalid chunk");
        download(&canvas, Rect::new(4, 0, 8, 4), opaque(1, 1, 1));
        std::thread::sleep(Duration::from_millis(5));
        canvas.sync().expect("sync");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while canvas.stats().snapshot().chunks_deleted == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(canvas.stats().snapshot().chunks_deleted, 1);
        assert_eq!(canvas.chunk_count(), 1);
        assert!(canvas.get_chunk(ChunkCoordinate::new(1, 0), false).is_ok());
    }

    #[test]
    fn close_detaches_listeners_and_rejects_mutations() {
        let (canvas, downloads) = canvas();
        let log = Log::default();
        canvas.subscribe_listener(Box::new(log.clone()), true).expect("subscribe");
        canvas.get_chunk(ChunkCoordinate::new(0, 0), true).expect("create");
        canvas.set_pixel(Point::new(0, 0), opaque(1, 1, 1)).expect("pixel");
        let clone = canvas.clone();
        canvas.close();
        clone.close();

        assert!(canvas.is_closed());
        assert_eq!(
            log.take(),
            vec![Seen::Pixel(Point::new(0, 0), opaque(1, 1, 1)), Seen::Detach]
        );
        assert_eq!(
            clone.set_pixel(Point::new(0, 0), opaque(2, 2, 2)),
            Err(CanvasError::Closed)
        );
        assert_eq!(clone.invalidate_all(), Err(CanvasError::Closed));
        assert!(canvas.get_pixel(Point::new(0, 0)).is_ok());
        assert!(downloads.recv().is_none());
    }
}
