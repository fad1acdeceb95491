use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pixcanvas::{CanvasConfig, PixelSize, ReaderOptions, Rect, SimulatedOptions, WriterOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::atomic_io::write_text_atomic;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config '{path}'{location}: {source}")]
    Parse {
        path: PathBuf,
        location: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode config: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to write config '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config value at {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Contents of `pixrec.json`. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub writer: WriterSettings,
    pub replay: ReplaySettings,
    pub simulated: SimulatedSettings,
    /// Rectangles recorded per connection short name.
    pub recorders: BTreeMap<String, Vec<RectSpec>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WriterSettings {
    pub record_everything: bool,
    pub flush_interval_ms: u64,
    pub compression_level: i32,
}

impl Default for WriterSettings {
    fn default() -> Self {
        let defaults = WriterOptions::default();
        Self {
            record_everything: defaults.record_everything,
            flush_interval_ms: defaults.flush_interval.as_millis() as u64,
            compression_level: defaults.compression_level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplaySettings {
    pub heartbeat_interval_ms: u64,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: ReaderOptions::default().heartbeat_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatedSettings {
    pub chunk_size: i32,
    /// Half extent of the square world around the origin.
    pub world_radius: i32,
    pub bigchunk_radius: i32,
    pub seed: u64,
    pub download_delay_ms: u64,
    pub scan_interval_ms: u64,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            world_radius: 4096,
            bigchunk_radius: 1,
            seed: 0,
            download_delay_ms: 0,
            scan_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectSpec {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl From<Rect> for RectSpec {
    fn from(rect: Rect) -> Self {
        Self {
            x: rect.min.x,
            y: rect.min.y,
            width: rect.width(),
            height: rect.height(),
        }
    }
}

impl From<RectSpec> for Rect {
    fn from(spec: RectSpec) -> Self {
        Rect::from_origin_size(spec.x, spec.y, spec.width, spec.height)
    }
}

impl AppConfig {
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            record_everything: self.writer.record_everything,
            flush_interval: Duration::from_millis(self.writer.flush_interval_ms),
            compression_level: self.writer.compression_level,
        }
    }

    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            heartbeat_interval: Duration::from_millis(self.replay.heartbeat_interval_ms),
            ..ReaderOptions::default()
        }
    }

    pub fn simulated_options(&self) -> Result<SimulatedOptions, ConfigError> {
        let settings = &self.simulated;
        if settings.chunk_size <= 0 {
            return Err(ConfigError::Invalid {
                field: "simulated.chunk_size",
                message: format!("expected a positive size, got {}", settings.chunk_size),
            });
        }
        if settings.world_radius <= 0 {
            return Err(ConfigError::Invalid {
                field: "simulated.world_radius",
                message: format!("expected a positive radius, got {}", settings.world_radius),
            });
        }
        let radius = settings.world_radius;
        Ok(SimulatedOptions {
            canvas: CanvasConfig {
                world_rect: Rect::new(-radius, -radius, radius, radius),
                scan_interval: Duration::from_millis(settings.scan_interval_ms.max(1)),
                ..CanvasConfig::with_chunk_size(PixelSize::new(settings.chunk_size, settings.chunk_size))
            },
            bigchunk_radius: settings.bigchunk_radius,
            seed: settings.seed,
            download_delay: Duration::from_millis(settings.download_delay_ms),
            ..SimulatedOptions::default()
        })
    }

    pub fn recorder_rects(&self, short_name: &str) -> Vec<Rect> {
        self.recorders
            .get(short_name)
            .map(|specs| specs.iter().copied().map(Rect::from).collect())
            .unwrap_or_default()
    }

    pub fn set_recorder_rects(&mut self, short_name: &str, rects: &[Rect]) {
        self.recorders.insert(
            short_name.to_string(),
            rects.iter().copied().map(RectSpec::from).collect(),
        );
    }
}

/// Loads the config. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(AppConfig::default()),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    parse_config(path, &raw)
}

fn parse_config(path: &Path, raw: &str) -> Result<AppConfig, ConfigError> {
    let mut deserializer = serde_json::Deserializer::from_str(raw);
    serde_path_to_error::deserialize::<_, AppConfig>(&mut deserializer).map_err(|error| {
        let json_path = error.path().to_string();
        let location = if json_path.is_empty() || json_path == "." {
            String::new()
        } else {
            format!(" at {json_path}")
        };
        ConfigError::Parse {
            path: path.to_path_buf(),
            location,
            source: error.into_inner(),
        }
    })
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let json = serde_json::to_string_pretty(config).map_err(ConfigError::Encode)?;
    write_text_atomic(path, &json).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}
