use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::error::ChunkError;
use super::image::{CanvasImage, Color, Palette};
use crate::geometry::{ChunkCoordinate, Point, Rect};
use crate::sync::{read_lock, write_lock};

/// Validity of a chunk. `Valid` and `Downloading` exclude each other by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Invalid,
    Downloading,
    Valid,
}

/// Scheduler verdict for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkQueryState {
    Keep,
    Download,
    Delete,
}

/// Eviction thresholds. Both have to be exceeded before a chunk is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLifetime {
    pub delete_invalid_after: Duration,
    pub delete_unqueried_after: Duration,
}

impl Default for ChunkLifetime {
    fn default() -> Self {
        Self {
            delete_invalid_after: Duration::from_secs(5 * 60),
            delete_unqueried_after: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetImageOutcome {
    /// New content, already including replayed queued pixels.
    Replaced(CanvasImage),
    /// Content is identical to what the chunk held before.
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
struct QueuedPixel {
    pos: Point,
    color: Color,
}

#[derive(Debug)]
struct ChunkInner {
    image: CanvasImage,
    status: ChunkStatus,
    queue: Vec<QueuedPixel>,
    last_query: Instant,
    last_invalidation: Instant,
}

/// One tile of the canvas.
///
/// The rectangle never changes after creation. Image, status and the pending
/// pixel queue share one reader/writer lock.
#[derive(Debug)]
pub struct Chunk {
    coord: ChunkCoordinate,
    rect: Rect,
    inner: RwLock<ChunkInner>,
}

impl Chunk {
    pub fn new(coord: ChunkCoordinate, rect: Rect, palette: Option<&Arc<Palette>>) -> Self {
        let now = Instant::now();
        Self {
            coord,
            rect,
            inner: RwLock::new(ChunkInner {
                image: CanvasImage::blank(rect, palette),
                status: ChunkStatus::Invalid,
                queue: Vec::new(),
                last_query: now,
                last_invalidation: now,
            }),
        }
    }

    pub fn coord(&self) -> ChunkCoordinate {
        self.coord
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn status(&self) -> ChunkStatus {
        read_lock(&self.inner, "chunk").status
    }

    pub fn queued_pixels(&self) -> usize {
        read_lock(&self.inner, "chunk").queue.len()
    }

    pub fn pixel(&self, pos: Point) -> Result<Color, ChunkError> {
        self.check_bounds(pos)?;
        read_lock(&self.inner, "chunk").image.pixel(pos)
    }

    pub fn pixel_index(&self, pos: Point) -> Result<u8, ChunkError> {
        self.check_bounds(pos)?;
        read_lock(&self.inner, "chunk").image.index_at(pos)
    }

    /// Writes a pixel and returns the color stored. While downloading the
    /// write is also queued so it survives the arrival of the fetched image.
    pub fn set_pixel(&self, pos: Point, color: Color) -> Result<Color, ChunkError> {
        self.check_bounds(pos)?;
        let mut inner = write_lock(&self.inner, "chunk");
        let color = inner.image.set_pixel(pos, color)?;
        if inner.status == ChunkStatus::Downloading {
            inner.queue.push(QueuedPixel { pos, color });
        }
        Ok(color)
    }

    /// Paletted variant of [`Chunk::set_pixel`]. Returns the palette color written.
    pub fn set_pixel_index(&self, pos: Point, index: u8) -> Result<Color, ChunkError> {
        self.check_bounds(pos)?;
        let mut inner = write_lock(&self.inner, "chunk");
        inner.image.set_index(pos, index)?;
        let color = inner.image.pixel(pos)?;
        if inner.status == ChunkStatus::Downloading {
            inner.queue.push(QueuedPixel { pos, color });
        }
        Ok(color)
    }

    /// Replaces the content with the part of `src` covering this chunk, replays
    /// the queued pixels onto it and marks the chunk valid.
    ///
    /// Requires a prior successful [`Chunk::signal_download`].
    pub fn set_image(&self, src: &CanvasImage) -> Result<SetImageOutcome, ChunkError> {
        let mut inner = write_lock(&self.inner, "chunk");
        if inner.status != ChunkStatus::Downloading {
            return Err(ChunkError::InvalidState("download flag is not set"));
        }
        if !src.rect().contains_rect(&self.rect) {
            return Err(ChunkError::InvalidState("image does not cover the chunk"));
        }

        let mut image = CanvasImage::blank(self.rect, src.palette());
        image.copy_from(src);

        if inner.queue.is_empty() && image == inner.image {
            inner.status = ChunkStatus::Valid;
            return Ok(SetImageOutcome::Unchanged);
        }

        for queued in inner.queue.drain(..) {
            image.set_pixel(queued.pos, queued.color)?;
        }
        inner.image = image;
        inner.status = ChunkStatus::Valid;
        Ok(SetImageOutcome::Replaced(inner.image.clone()))
    }

    pub fn image_copy(&self, only_if_valid: bool) -> Result<(CanvasImage, ChunkStatus), ChunkError> {
        let inner = read_lock(&self.inner, "chunk");
        if only_if_valid && inner.status != ChunkStatus::Valid {
            return Err(ChunkError::InvalidState("chunk is not valid"));
        }
        Ok((inner.image.clone(), inner.status))
    }

    /// Marks the content as out of sync with the remote world.
    pub fn invalidate(&self) {
        let mut inner = write_lock(&self.inner, "chunk");
        inner.status = ChunkStatus::Invalid;
        inner.queue.clear();
        inner.last_invalidation = Instant::now();
    }

    /// Marks the current content as in sync again without new data.
    pub fn revalidate(&self) {
        let mut inner = write_lock(&self.inner, "chunk");
        inner.queue.clear();
        inner.status = ChunkStatus::Valid;
    }

    /// Starts a download. Returns false without any effect if the chunk is
    /// already valid or already downloading.
    pub fn signal_download(&self) -> bool {
        let mut inner = write_lock(&self.inner, "chunk");
        if inner.status != ChunkStatus::Invalid {
            return false;
        }
        inner.queue.clear();
        inner.status = ChunkStatus::Downloading;
        true
    }

    pub fn query_state(&self, reset_time: bool, lifetime: &ChunkLifetime) -> ChunkQueryState {
        self.query_state_at(Instant::now(), reset_time, lifetime)
    }

    /// State check used by the scheduler and connectors.
    ///
    /// The query timer is only refreshed while not downloading, so a stuck
    /// download keeps aging toward deletion.
    pub fn query_state_at(
        &self,
        now: Instant,
        reset_time: bool,
        lifetime: &ChunkLifetime,
    ) -> ChunkQueryState {
        let mut inner = write_lock(&self.inner, "chunk");
        let invalid_for = now.saturating_duration_since(inner.last_invalidation);
        let unqueried_for = now.saturating_duration_since(inner.last_query);
        if inner.status != ChunkStatus::Valid
            && invalid_for > lifetime.delete_invalid_after
            && unqueried_for > lifetime.delete_unqueried_after
        {
            return ChunkQueryState::Delete;
        }

        if reset_time && inner.status != ChunkStatus::Downloading {
            inner.last_query = now;
        }

        if inner.status == ChunkStatus::Invalid {
            ChunkQueryState::Download
        } else {
            ChunkQueryState::Keep
        }
    }

    fn check_bounds(&self, pos: Point) -> Result<(), ChunkError> {
        if self.rect.contains_point(pos) {
            Ok(())
        } else {
            Err(ChunkError::OutOfBounds {
                pos,
                rect: self.rect,
            })
        }
    }
}
