use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod canvas;
pub mod connection;
pub mod geometry;
pub mod recording;
mod sync;

pub use canvas::{
    opaque, Canvas, CanvasConfig, CanvasError, CanvasImage, CanvasListener, CanvasStatsHandle,
    CanvasStatsSnapshot, Chunk, ChunkError, ChunkLifetime, ChunkQueryState, ChunkStatus, Color,
    DownloadRequests, ErrorKind, ListenerError, ListenerId, ListenerResult, Palette, PixelData,
    SetImageOutcome, TRANSPARENT,
};
pub use connection::{
    Connection, ConnectionError, ConnectionFactory, ConnectionRegistry, Lease, ReplayConnection,
    SharedSlot, SimulatedOptions, SimulatedWorld, Teardown,
};
pub use geometry::{divide_ceil, divide_floor, ChunkCoordinate, ChunkRect, PixelSize, Point, Rect};
pub use recording::{
    list_recordings, recording_dir, replay_file_into, DiskReader, DiskWriterHandle, Record,
    RecordBody, RecordingError, RecordingFile, RecordingHeader, RecordingReader, ReaderOptions,
    ReplaySummary, WriterOptions,
};

pub const ROOT_ENV_VAR: &str = "PIXREC_ROOT";

pub const CONFIG_FILE_NAME: &str = "pixrec.json";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub root: PathBuf,
    pub recordings_dir: PathBuf,
    pub config_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum PathsError {
    #[error("failed to read environment variable {var}: {source}")]
    EnvVar {
        var: &'static str,
        #[source]
        source: env::VarError,
    },
    #[error("failed to resolve current directory: {0}")]
    CurrentDir(#[source] std::io::Error),
    #[error("{var} is set but is not an existing directory: {path}")]
    InvalidEnvRoot { var: &'static str, path: PathBuf },
    #[error("failed to create recordings directory at {path}: {source}")]
    CreateRecordingsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves the data root from `PIXREC_ROOT`, falling back to the current
/// directory, and makes sure the recordings directory exists.
pub fn resolve_app_paths() -> Result<AppPaths, PathsError> {
    let root = resolve_root()?;
    app_paths_in(root)
}

fn app_paths_in(root: PathBuf) -> Result<AppPaths, PathsError> {
    let recordings_dir = root.join("recordings");
    let config_path = root.join(CONFIG_FILE_NAME);

    fs::create_dir_all(&recordings_dir).map_err(|source| PathsError::CreateRecordingsDir {
        path: recordings_dir.clone(),
        source,
    })?;

    Ok(AppPaths {
        root,
        recordings_dir,
        config_path,
    })
}

fn resolve_root() -> Result<PathBuf, PathsError> {
    match env::var(ROOT_ENV_VAR) {
        Ok(value) => {
            let normalized = normalize_path(Path::new(&value));
            if normalized.is_dir() {
                Ok(normalized)
            } else {
                Err(PathsError::InvalidEnvRoot {
                    var: ROOT_ENV_VAR,
                    path: normalized,
                })
            }
        }
        Err(env::VarError::NotPresent) => {
            let cwd = env::current_dir().map_err(PathsError::CurrentDir)?;
            Ok(normalize_path(&cwd))
        }
        Err(source) => Err(PathsError::EnvVar {
            var: ROOT_ENV_VAR,
            source,
        }),
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
