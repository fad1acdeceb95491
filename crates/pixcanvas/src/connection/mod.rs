mod shared;
mod simulated;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::canvas::{Canvas, CanvasError};
use crate::recording::{DiskReader, ReaderOptions, RecordingError, RecordingFile};

pub use shared::{Lease, SharedSlot, Teardown};
pub use simulated::{SimulatedOptions, SimulatedWorld};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("unknown connection type `{0}`")]
    UnknownType(String),
    #[error(transparent)]
    Canvas(#[from] CanvasError),
    #[error(transparent)]
    Recording(#[from] RecordingError),
    #[error("connection failed: {0}")]
    Failed(String),
}

/// A source of canvas data: a live world or a replay.
pub trait Connection: Send {
    /// File-system friendly identifier, also used as the recordings directory name.
    fn short_name(&self) -> String;

    /// Human readable name.
    fn name(&self) -> String;

    fn online_players(&self) -> usize;

    fn canvas(&self) -> &Canvas;

    fn close(&mut self);

    fn as_replay(&self) -> Option<&dyn ReplayConnection> {
        None
    }
}

/// A connection whose canvas follows a seekable clock.
pub trait ReplayConnection: Connection {
    fn set_replay_time(&self, time: SystemTime);

    /// Blocks until the canvas reflects `target`, for at most `timeout`.
    fn wait_caught_up(&self, target: SystemTime, timeout: Duration) -> bool;

    fn recordings(&self) -> &[RecordingFile];
}

impl Connection for DiskReader {
    fn short_name(&self) -> String {
        format!("replay-{}", self.source_name())
    }

    fn name(&self) -> String {
        format!("Replay of {}", self.source_name())
    }

    fn online_players(&self) -> usize {
        0
    }

    fn canvas(&self) -> &Canvas {
        DiskReader::canvas(self)
    }

    fn close(&mut self) {
        DiskReader::close(self);
    }

    fn as_replay(&self) -> Option<&dyn ReplayConnection> {
        Some(self)
    }
}

impl ReplayConnection for DiskReader {
    fn set_replay_time(&self, time: SystemTime) {
        DiskReader::set_replay_time(self, time);
    }

    fn wait_caught_up(&self, target: SystemTime, timeout: Duration) -> bool {
        DiskReader::wait_caught_up(self, target, timeout)
    }

    fn recordings(&self) -> &[RecordingFile] {
        DiskReader::recordings(self)
    }
}

/// Builds a connection for the given instance name.
pub type ConnectionFactory =
    Box<dyn Fn(&str) -> Result<Box<dyn Connection>, ConnectionError> + Send + Sync>;

struct ConnectionType {
    display_name: String,
    factory: ConnectionFactory,
}

/// Known connection types, keyed by type name.
#[derive(Default)]
pub struct ConnectionRegistry {
    types: BTreeMap<String, ConnectionType>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `replay` type reading from `recordings_root`.
    pub fn with_replay(recordings_root: PathBuf, options: ReaderOptions) -> Self {
        let mut registry = Self::new();
        registry.register(
            "replay",
            "Recording replay",
            Box::new(move |name: &str| -> Result<Box<dyn Connection>, ConnectionError> {
                let reader = DiskReader::open(&recordings_root, name, options.clone())?;
                Ok(Box::new(reader) as Box<dyn Connection>)
            }),
        );
        registry
    }

    /// Adds a type. An existing registration with the same name is replaced.
    pub fn register(&mut self, type_name: &str, display_name: &str, factory: ConnectionFactory) {
        self.types.insert(
            type_name.to_string(),
            ConnectionType {
                display_name: display_name.to_string(),
                factory,
            },
        );
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// `(type name, display name)` pairs in type name order.
    pub fn types(&self) -> impl Iterator<Item = (&str, &str)> {
        self.types
            .iter()
            .map(|(name, entry)| (name.as_str(), entry.display_name.as_str()))
    }

    pub fn open(&self, type_name: &str, instance: &str) -> Result<Box<dyn Connection>, ConnectionError> {
        let entry = self
            .types
            .get(type_name)
            .ok_or_else(|| ConnectionError::UnknownType(type_name.to_string()))?;
        (entry.factory)(instance)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.types.keys()).finish()
    }
}
