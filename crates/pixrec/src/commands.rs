use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use pixcanvas::recording::{list_recordings, recording_dir, system_time_to_ns};
use pixcanvas::{
    opaque, AppPaths, CanvasError, Connection, ConnectionError, ConnectionRegistry, DiskWriterHandle, Point,
    Rect, RecordingError, RecordingReader, SharedSlot, SimulatedWorld,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::cli::Command;
use crate::config::{load_config, save_config, AppConfig, ConfigError};

const REPLAY_TIMEOUT: Duration = Duration::from_secs(60);
const PAINT_INTERVAL: Duration = Duration::from_millis(20);
const STATS_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SIMULATE_RECT: Rect = Rect {
    min: Point::new(-128, -128),
    max: Point::new(128, 128),
};

#[derive(Debug, Error)]
pub(crate) enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Recording(#[from] RecordingError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Canvas(#[from] CanvasError),
    #[error("failed to write snapshot '{path}': {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
    #[error("no rectangle given and none configured for '{0}'")]
    NoRect(String),
    #[error("replay of '{name}' did not reach +{at_ms} ms within {timeout_s} s")]
    ReplayTimeout { name: String, at_ms: u64, timeout_s: u64 },
}

pub(crate) fn run(command: Command, paths: &AppPaths, out: &mut impl Write) -> Result<(), AppError> {
    match command {
        Command::Help => {
            writeln!(out, "{}", crate::cli::usage_text())?;
            Ok(())
        }
        Command::List { name } => list(paths, &name, out),
        Command::Inspect { path } => inspect(&path, out),
        Command::Snapshot {
            name,
            at_ms,
            rect,
            out: target,
        } => {
            let config = load_config(&paths.config_path)?;
            snapshot(paths, &config, &name, at_ms, rect, &target, out)
        }
        Command::Simulate { name, seconds, rect } => {
            let mut config = load_config(&paths.config_path)?;
            if let Some(rect) = rect {
                config.set_recorder_rects(&name, &[rect]);
                save_config(&paths.config_path, &config)?;
            }
            simulate(paths, &config, &name, Duration::from_secs(seconds), out)
        }
    }
}

fn list(paths: &AppPaths, name: &str, out: &mut impl Write) -> Result<(), AppError> {
    let dir = recording_dir(&paths.recordings_dir, name);
    let files = list_recordings(&dir)?;
    if files.is_empty() {
        writeln!(out, "no recordings for '{name}' in {}", dir.display())?;
        return Ok(());
    }
    for file in &files {
        let duration = file
            .ended_at
            .duration_since(file.started_at)
            .unwrap_or_default();
        writeln!(
            out,
            "{}\tstart_ms={}\tduration={:.1}s\tchunk={}",
            file_label(&file.path),
            unix_ms(file.started_at),
            duration.as_secs_f64(),
            file.header.chunk_size
        )?;
    }
    Ok(())
}

fn inspect(path: &Path, out: &mut impl Write) -> Result<(), AppError> {
    let mut reader = RecordingReader::open(path)?;
    let header = *reader.header();
    let mut counts = BTreeMap::<&'static str, u64>::new();
    let mut total = 0u64;
    let mut last_ns = header.started_at_ns;
    while let Some(record) = reader.next_record()? {
        *counts.entry(record.body.name()).or_default() += 1;
        total += 1;
        last_ns = last_ns.max(record.timestamp_ns);
    }

    writeln!(out, "file: {}", path.display())?;
    writeln!(out, "format version: {}", header.version)?;
    writeln!(out, "chunk size: {}", header.chunk_size)?;
    writeln!(out, "origin: {}", header.origin)?;
    writeln!(out, "start_ms: {}", header.started_at_ns / 1_000_000)?;
    writeln!(
        out,
        "span: {:.3}s",
        (last_ns - header.started_at_ns).max(0) as f64 / 1e9
    )?;
    writeln!(out, "records: {total}")?;
    for (kind, count) in counts {
        writeln!(out, "  {kind}: {count}")?;
    }
    Ok(())
}

fn snapshot(
    paths: &AppPaths,
    config: &AppConfig,
    name: &str,
    at_ms: u64,
    rect: Option<Rect>,
    target: &Path,
    out: &mut impl Write,
) -> Result<(), AppError> {
    let rect = match rect.or_else(|| config.recorder_rects(name).first().copied()) {
        Some(rect) => rect,
        None => return Err(AppError::NoRect(name.to_string())),
    };
    let registry = ConnectionRegistry::with_replay(paths.recordings_dir.clone(), config.reader_options());
    let mut connection = registry.open("replay", name)?;
    let result = capture(connection.as_ref(), name, at_ms, rect, target);
    connection.close();
    result?;
    writeln!(out, "wrote {} ({}x{} at +{at_ms} ms)", target.display(), rect.width(), rect.height())?;
    Ok(())
}

fn capture(connection: &dyn Connection, name: &str, at_ms: u64, rect: Rect, target: &Path) -> Result<(), AppError> {
    let Some(replay) = connection.as_replay() else {
        return Err(ConnectionError::Failed(format!("'{}' cannot seek", connection.name())).into());
    };
    let Some(first) = replay.recordings().first() else {
        return Err(ConnectionError::Failed(format!("'{}' has no recordings", connection.name())).into());
    };
    let at = first.started_at + Duration::from_millis(at_ms);
    replay.set_replay_time(at);
    if !replay.wait_caught_up(at, REPLAY_TIMEOUT) {
        return Err(AppError::ReplayTimeout {
            name: name.to_string(),
            at_ms,
            timeout_s: REPLAY_TIMEOUT.as_secs(),
        });
    }

    let image = connection.canvas().get_image_copy(rect, false, true)?;
    image
        .to_rgba_image()
        .save_with_format(target, image::ImageFormat::Png)
        .map_err(|source| AppError::Snapshot {
            path: target.to_path_buf(),
            source,
        })?;
    info!(name, at_ms, path = %target.display(), "snapshot_written");
    Ok(())
}

fn simulate(
    paths: &AppPaths,
    config: &AppConfig,
    name: &str,
    duration: Duration,
    out: &mut impl Write,
) -> Result<(), AppError> {
    let mut rects = config.recorder_rects(name);
    if rects.is_empty() {
        rects.push(DEFAULT_SIMULATE_RECT);
    }
    let options = config.simulated_options()?;
    let slot = SharedSlot::new();
    let world = slot.acquire(|| SimulatedWorld::start(name, options))?;
    info!(name = %world.name(), players = world.online_players(), "simulation_started");

    let writer = DiskWriterHandle::start(
        world.canvas(),
        &paths.recordings_dir,
        &world.short_name(),
        config.writer_options(),
    )?;
    writer.set_listening_rects(rects.clone())?;
    let recording = writer.path().to_path_buf();

    let stop = AtomicBool::new(false);
    let painter = world.clone();
    let pushed = thread::scope(|scope| {
        let handle = scope.spawn(|| paint(&painter, &rects, config.simulated.seed, &stop));
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            thread::sleep(STATS_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
            let stats = world.canvas().stats().snapshot();
            info!(
                chunks = stats.chunk_count,
                listeners = stats.listener_count,
                downloads = stats.downloads_requested,
                events = stats.events_dispatched,
                "simulation_stats"
            );
        }
        stop.store(true, Ordering::Release);
        handle.join().unwrap_or_else(|_| {
            warn!("simulation_painter_panicked");
            0
        })
    });
    drop(painter);

    let stats = world.canvas().stats().snapshot();
    writer.close()?;
    drop(world);
    writeln!(
        out,
        "recorded {} ({pushed} pixels pushed, {} chunks, {} downloads)",
        recording.display(),
        stats.chunk_count,
        stats.downloads_requested
    )?;
    Ok(())
}

/// Pushes pseudo-random pixels into `rects` until `stop` is set.
fn paint(world: &SimulatedWorld, rects: &[Rect], seed: u64, stop: &AtomicBool) -> u64 {
    let mut state = seed ^ system_time_to_ns(SystemTime::now()) as u64 | 1;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let mut pushed = 0u64;
    while !stop.load(Ordering::Acquire) {
        for rect in rects {
            let width = rect.width().max(1) as u64;
            let height = rect.height().max(1) as u64;
            let pos = Point::new(
                rect.min.x + (next() % width) as i32,
                rect.min.y + (next() % height) as i32,
            );
            let [r, g, b, ..] = next().to_le_bytes();
            match world.push_pixel(pos, opaque(r, g, b)) {
                Ok(()) => pushed += 1,
                Err(ConnectionError::Canvas(CanvasError::Closed)) => return pushed,
                Err(error) => warn!(pos = %pos, error = %error, "simulation_push_failed"),
            }
        }
        thread::sleep(PAINT_INTERVAL);
    }
    pushed
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn unix_ms(time: SystemTime) -> i128 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_millis() as i128,
        Err(before) => -(before.duration().as_millis() as i128),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn temp_paths(temp: &TempDir) -> AppPaths {
        let recordings_dir = temp.path().join("recordings");
        std::fs::create_dir_all(&recordings_dir).expect("recordings dir");
        AppPaths {
            root: temp.path().to_path_buf(),
            recordings_dir,
            config_path: temp.path().join("pixrec.json"),
        }
    }

    fn run_to_string(command: Command, paths: &AppPaths) -> String {
        let mut out = Vec::new();
        run(command, paths, &mut out).expect("command");
        String::from_utf8(out).expect("utf8")
    }

    #[test]
    fn list_reports_missing_recordings() {
        let temp = TempDir::new().expect("temp");
        let paths = temp_paths(&temp);
        let output = run_to_string(
            Command::List {
                name: "nowhere".to_string(),
            },
            &paths,
        );
        assert!(output.starts_with("no recordings for 'nowhere'"), "{output}");
    }

    #[test]
    fn simulate_then_list_inspect_and_snapshot() {
        let temp = TempDir::new().expect("temp");
        let paths = temp_paths(&temp);
        let rect = Rect::from_origin_size(0, 0, 32, 32);

        let output = run_to_string(
            Command::Simulate {
                name: "sim".to_string(),
                seconds: 1,
                rect: Some(rect),
            },
            &paths,
        );
        assert!(output.starts_with("recorded "), "{output}");
        let config = load_config(&paths.config_path).expect("config");
        assert_eq!(config.recorder_rects("sim"), vec![rect]);

        let listing = run_to_string(
            Command::List {
                name: "sim".to_string(),
            },
            &paths,
        );
        assert_eq!(listing.lines().count(), 1, "{listing}");
        assert!(listing.contains(".pixrec"), "{listing}");

        let files = list_recordings(&recording_dir(&paths.recordings_dir, "sim")).expect("files");
        let report = run_to_string(
            Command::Inspect {
                path: files[0].path.clone(),
            },
            &paths,
        );
        assert!(report.contains("chunk size: 64x64"), "{report}");
        assert!(report.contains("invalidate_all: 1"), "{report}");

        let png = temp.path().join("shot.png");
        let output = run_to_string(
            Command::Snapshot {
                name: "sim".to_string(),
                at_ms: 60_000,
                rect: None,
                out: png.clone(),
            },
            &paths,
        );
        assert!(output.starts_with("wrote "), "{output}");
        let image = image::open(&png).expect("png").to_rgba8();
        assert_eq!(image.dimensions(), (32, 32));
    }

    #[test]
    fn snapshot_without_rect_fails() {
        let temp = TempDir::new().expect("temp");
        let paths = temp_paths(&temp);
        let mut out = Vec::new();
        let error = run(
            Command::Snapshot {
                name: "sim".to_string(),
                at_ms: 0,
                rect: None,
                out: temp.path().join("x.png"),
            },
            &paths,
            &mut out,
        )
        .expect_err("must fail");
        assert!(matches!(error, AppError::NoRect(_)));
    }
}
