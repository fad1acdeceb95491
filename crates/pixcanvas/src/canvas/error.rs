use thiserror::Error;

use crate::geometry::{ChunkCoordinate, Point, Rect};

/// Coarse classification shared by chunk and canvas failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    OutOfBounds,
    InvalidState,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("position {pos} is outside of {rect}")]
    OutOfBounds { pos: Point, rect: Rect },
    #[error("invalid chunk state: {0}")]
    InvalidState(&'static str),
    #[error("image is not paletted")]
    NotPaletted,
    #[error("color index {index} outside of palette with {len} entries")]
    PaletteIndex { index: u8, len: usize },
}

impl ChunkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChunkError::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            ChunkError::InvalidState(_) | ChunkError::NotPaletted | ChunkError::PaletteIndex { .. } => {
                ErrorKind::InvalidState
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanvasError {
    #[error("chunk at {coord} does not exist")]
    NotFound { coord: ChunkCoordinate },
    #[error("chunk {coord}: {source}")]
    Chunk {
        coord: ChunkCoordinate,
        #[source]
        source: ChunkError,
    },
    #[error("invalid canvas state: {0}")]
    InvalidState(&'static str),
    #[error("canvas is closed")]
    Closed,
    #[error("failed to start broadcaster thread: {0}")]
    Spawn(String),
}

impl CanvasError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CanvasError::NotFound { .. } => ErrorKind::NotFound,
            CanvasError::Chunk { source, .. } => source.kind(),
            CanvasError::InvalidState(_) | CanvasError::Spawn(_) => ErrorKind::InvalidState,
            CanvasError::Closed => ErrorKind::Closed,
        }
    }

    pub(crate) fn chunk(coord: ChunkCoordinate) -> impl FnOnce(ChunkError) -> CanvasError {
        move |source| CanvasError::Chunk { coord, source }
    }
}
