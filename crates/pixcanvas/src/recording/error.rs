use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::codec::CodecError;
use crate::canvas::CanvasError;
use crate::geometry::{PixelSize, Point};

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("failed to access recording {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("recording {path} is malformed: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("found no recordings for {short_name} in {dir}")]
    NoRecordings { short_name: String, dir: PathBuf },
    #[error(
        "recording {path} uses chunk size {chunk_size:?} with origin {origin}, \
which does not match the canvas"
    )]
    Mismatch {
        path: PathBuf,
        chunk_size: PixelSize,
        origin: Point,
    },
    #[error(transparent)]
    Canvas(#[from] CanvasError),
}

impl RecordingError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> RecordingError {
        let path = path.into();
        move |source| RecordingError::Io { path, source }
    }

    pub(crate) fn format(path: impl Into<PathBuf>) -> impl FnOnce(CodecError) -> RecordingError {
        let path = path.into();
        move |source| RecordingError::Format { path, source }
    }
}
