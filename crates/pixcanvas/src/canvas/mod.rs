mod broadcaster;
mod chunk;
mod chunk_map;
mod config;
mod error;
mod event;
mod handle;
mod image;
mod listener;
mod stats;

pub use chunk::{Chunk, ChunkLifetime, ChunkQueryState, ChunkStatus, SetImageOutcome};
pub use config::CanvasConfig;
pub use error::{CanvasError, ChunkError, ErrorKind};
pub use handle::{Canvas, DownloadRequests};
pub use image::{opaque, CanvasImage, Color, Palette, PixelData, TRANSPARENT};
pub use listener::{CanvasListener, ListenerError, ListenerId, ListenerResult};
pub use stats::{CanvasStatsHandle, CanvasStatsSnapshot};
