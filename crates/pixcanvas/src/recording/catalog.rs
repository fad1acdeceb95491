use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use super::codec::{read_header, RecordingHeader};
use super::error::RecordingError;

pub const RECORDING_EXTENSION: &str = "pixrec";

/// One recording file of a source, with the time span it covers.
#[derive(Debug, Clone)]
pub struct RecordingFile {
    pub path: PathBuf,
    pub header: RecordingHeader,
    pub started_at: SystemTime,
    /// Start of the next file, or the listing time for the newest one.
    pub ended_at: SystemTime,
}

impl RecordingFile {
    pub fn covers(&self, time: SystemTime) -> bool {
        time >= self.started_at && time < self.ended_at
    }
}

/// Replaces every run of characters outside `[A-Za-z0-9.-]` with a single `_`.
pub fn sanitize_short_name(short_name: &str) -> String {
    let mut sanitized = String::with_capacity(short_name.len());
    let mut in_run = false;
    for ch in short_name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
            sanitized.push(ch);
            in_run = false;
        } else if !in_run {
            sanitized.push('_');
            in_run = true;
        }
    }
    // "", "." and ".." must not address the parent directories.
    if sanitized.chars().all(|ch| ch == '.') {
        sanitized.insert(0, '_');
    }
    sanitized
}

pub fn recording_dir(recordings_root: &Path, short_name: &str) -> PathBuf {
    recordings_root.join(sanitize_short_name(short_name))
}

/// `YYYY-MM-DDTHHMMSS.pixrec` in UTC.
pub fn recording_file_name(time: SystemTime) -> String {
    format!("{}.{RECORDING_EXTENSION}", utc_stamp(time))
}

/// First free file name for a recording starting at `time`.
pub fn next_recording_path(dir: &Path, time: SystemTime) -> PathBuf {
    let stamp = utc_stamp(time);
    let mut candidate = dir.join(format!("{stamp}.{RECORDING_EXTENSION}"));
    let mut suffix = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{stamp}_{suffix}.{RECORDING_EXTENSION}"));
        suffix += 1;
    }
    candidate
}

/// Lists the recordings in `dir` sorted by file name.
///
/// Unreadable files and files whose chunk geometry differs from the first
/// readable one are skipped. A missing directory yields an empty list.
pub fn list_recordings(dir: &Path) -> Result<Vec<RecordingFile>, RecordingError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(RecordingError::io(dir)(error)),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(RecordingError::io(dir))?.path();
        let is_recording = path.extension().and_then(|ext| ext.to_str()) == Some(RECORDING_EXTENSION);
        if is_recording && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut files: Vec<RecordingFile> = Vec::with_capacity(paths.len());
    for path in paths {
        let header = match read_file_header(&path) {
            Ok(header) => header,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "recording_header_unreadable");
                continue;
            }
        };
        if let Some(first) = files.first() {
            if first.header.chunk_size != header.chunk_size || first.header.origin != header.origin {
                warn!(
                    path = %path.display(),
                    chunk_width = header.chunk_size.width,
                    chunk_height = header.chunk_size.height,
                    origin = %header.origin,
                    "recording_geometry_differs"
                );
                continue;
            }
        }
        let started_at = header.started_at();
        if let Some(previous) = files.last_mut() {
            previous.ended_at = started_at;
        }
        files.push(RecordingFile {
            path,
            header,
            started_at,
            ended_at: SystemTime::now().max(started_at),
        });
    }
    Ok(files)
}

pub fn read_file_header(path: &Path) -> Result<RecordingHeader, RecordingError> {
    let file = File::open(path).map_err(RecordingError::io(path))?;
    let mut decoder = zstd::stream::read::Decoder::with_buffer(BufReader::new(file))
        .map_err(RecordingError::io(path))?;
    read_header(&mut decoder).map_err(RecordingError::format(path))
}

fn utc_stamp(time: SystemTime) -> String {
    let secs = match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs_f64().ceil() as i64),
    };
    let days = secs.div_euclid(86_400);
    let day_secs = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}{:02}{:02}",
        day_secs / 3600,
        (day_secs / 60) % 60,
        day_secs % 60
    )
}

/// Gregorian date for a day count relative to 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
