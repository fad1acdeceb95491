use std::sync::Arc;
use std::time::Duration;

use super::chunk::ChunkLifetime;
use super::image::Palette;
use crate::geometry::{PixelSize, Point, Rect};

#[derive(Debug, Clone)]
pub struct CanvasConfig {
    pub chunk_size: PixelSize,
    /// Positive values move the chunk grid into negative direction.
    pub origin: Point,
    /// Chunks are only created where they intersect this rectangle.
    pub world_rect: Rect,
    /// Paletted canvases start every chunk as palette index 0.
    pub palette: Option<Arc<Palette>>,
    pub lifetime: ChunkLifetime,
    pub scan_interval: Duration,
    pub event_queue_capacity: usize,
    pub download_queue_capacity: usize,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            chunk_size: PixelSize::new(64, 64),
            origin: Point::default(),
            world_rect: Rect::everything(),
            palette: None,
            lifetime: ChunkLifetime::default(),
            scan_interval: Duration::from_secs(1),
            event_queue_capacity: 256,
            download_queue_capacity: 64,
        }
    }
}

impl CanvasConfig {
    pub fn with_chunk_size(chunk_size: PixelSize) -> Self {
        Self {
            chunk_size,
            ..Self::default()
        }
    }
}
