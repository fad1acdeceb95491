use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, trace, warn};

use super::catalog::{list_recordings, recording_dir, RecordingFile};
use super::codec::{read_header, read_record, CodecError, Record, RecordBody, RecordingHeader};
use super::error::RecordingError;
use crate::canvas::{opaque, Canvas, CanvasConfig, CanvasError, ChunkStatus, ErrorKind};
use crate::sync::mutex_lock;

type Decoder = zstd::stream::read::Decoder<'static, BufReader<File>>;

/// Sequential access to the records of one recording file.
pub struct RecordingReader {
    path: PathBuf,
    header: RecordingHeader,
    decoder: Decoder,
    done: bool,
}

impl RecordingReader {
    pub fn open(path: &Path) -> Result<Self, RecordingError> {
        let file = File::open(path).map_err(RecordingError::io(path))?;
        let mut decoder = Decoder::with_buffer(BufReader::new(file)).map_err(RecordingError::io(path))?;
        let header = read_header(&mut decoder).map_err(RecordingError::format(path))?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
            decoder,
            done: false,
        })
    }

    pub fn header(&self) -> &RecordingHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next record, `None` at the end of the data written so far.
    ///
    /// A record cut off by an unfinished recording also ends the stream.
    pub fn next_record(&mut self) -> Result<Option<Record>, RecordingError> {
        if self.done {
            return Ok(None);
        }
        match read_record(&mut self.decoder) {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(CodecError::Truncated) => {
                debug!(path = %self.path.display(), "recording_truncated");
                self.done = true;
                Ok(None)
            }
            Err(error) => {
                self.done = true;
                Err(RecordingError::format(&self.path)(error))
            }
        }
    }
}

impl Iterator for RecordingReader {
    type Item = Result<Record, RecordingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Applies one record to `canvas` the way a live connector would have.
///
/// Images restart the download of their chunks first, so they apply even to
/// chunks that are still valid from earlier records.
pub fn apply_record(canvas: &Canvas, record: &Record) -> Result<(), CanvasError> {
    match &record.body {
        RecordBody::SetPixel { pos, rgb } => canvas.set_pixel(*pos, opaque(rgb[0], rgb[1], rgb[2])),
        RecordBody::InvalidateRect { rect } => canvas.invalidate_rect(*rect, true),
        RecordBody::InvalidateAll => canvas.invalidate_all(),
        RecordBody::RevalidateRect { rect } => canvas.revalidate_rect(*rect),
        RecordBody::SetImage { .. } => {
            let Some(image) = record.body.image() else {
                return Err(CanvasError::InvalidState("image record does not match its size"));
            };
            for chunk in canvas.get_chunks(canvas.inner_chunk_rect(image.rect()), false, true)? {
                if chunk.status() == ChunkStatus::Valid {
                    chunk.invalidate();
                }
            }
            canvas.signal_download(image.rect())?;
            canvas.set_image(&image, false, true)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub applied: usize,
    pub skipped: usize,
    pub last_time: Option<SystemTime>,
}

/// Synchronously applies the records of `path` up to and including `until`.
///
/// Records the canvas rejects, like pixels for chunks that never arrived, are
/// counted as skipped.
pub fn replay_file_into(
    canvas: &Canvas,
    path: &Path,
    until: Option<SystemTime>,
) -> Result<ReplaySummary, RecordingError> {
    let mut reader = RecordingReader::open(path)?;
    check_geometry(canvas, &reader)?;

    let mut summary = ReplaySummary::default();
    while let Some(record) = reader.next_record()? {
        let time = record.time();
        if until.is_some_and(|until| time > until) {
            break;
        }
        match apply_record(canvas, &record) {
            Ok(()) => summary.applied += 1,
            Err(CanvasError::Closed) => return Err(CanvasError::Closed.into()),
            Err(error) => {
                trace!(record = record.body.name(), error = %error, "replay_record_skipped");
                summary.skipped += 1;
            }
        }
        summary.last_time = Some(time);
    }
    Ok(summary)
}

fn check_geometry(canvas: &Canvas, reader: &RecordingReader) -> Result<(), RecordingError> {
    let header = reader.header();
    if header.chunk_size != canvas.chunk_size() || header.origin != canvas.origin() {
        return Err(RecordingError::Mismatch {
            path: reader.path().to_path_buf(),
            chunk_size: header.chunk_size,
            origin: header.origin,
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// How often the replay clock is forwarded to listeners.
    pub heartbeat_interval: Duration,
    /// Tuning for the replay canvas. Chunk size and origin come from the recordings.
    pub canvas: CanvasConfig,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            canvas: CanvasConfig::default(),
        }
    }
}

enum SlotEvent {
    Target(SystemTime),
    Heartbeat,
    Closed,
}

#[derive(Default)]
struct SlotState {
    requested: Option<SystemTime>,
    caught_up: Option<SystemTime>,
    closed: bool,
}

/// Single-entry seek channel. A newer request replaces an unconsumed one.
#[derive(Default)]
struct SeekSlot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl SeekSlot {
    fn request(&self, time: SystemTime) {
        let mut state = mutex_lock(&self.state, "seek slot");
        if state.closed {
            return;
        }
        state.requested = Some(time);
        self.changed.notify_all();
    }

    fn close(&self) {
        mutex_lock(&self.state, "seek slot").closed = true;
        self.changed.notify_all();
    }

    /// Non-blocking check for a new request.
    fn poll(&self) -> Option<SlotEvent> {
        let mut state = mutex_lock(&self.state, "seek slot");
        if state.closed {
            return Some(SlotEvent::Closed);
        }
        state.requested.take().map(|time| {
            state.caught_up = None;
            SlotEvent::Target(time)
        })
    }

    /// Publishes `caught_up` and blocks until a new request, closing or `timeout`.
    fn wait(&self, caught_up: Option<SystemTime>, timeout: Duration) -> SlotEvent {
        let mut state = mutex_lock(&self.state, "seek slot");
        if caught_up.is_some() {
            state.caught_up = caught_up;
            self.changed.notify_all();
        }

        let deadline = Instant::now() + timeout;
        loop {
            if state.closed {
                return SlotEvent::Closed;
            }
            if let Some(time) = state.requested.take() {
                state.caught_up = None;
                return SlotEvent::Target(time);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return SlotEvent::Heartbeat;
            }
            state = match self.changed.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn wait_caught_up(&self, target: SystemTime, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = mutex_lock(&self.state, "seek slot");
        loop {
            if state.requested.is_none() && state.caught_up == Some(target) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if state.closed || remaining.is_zero() {
                return false;
            }
            state = match self.changed.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

enum FileOutcome {
    Seek(SystemTime),
    Idle(SystemTime),
    Closed,
}

struct ReplayWorker {
    short_name: String,
    canvas: Canvas,
    files: Vec<RecordingFile>,
    slot: Arc<SeekSlot>,
    heartbeat: Duration,
}

impl ReplayWorker {
    fn run(self) {
        let mut next = match self.wait_for_target(None) {
            Some(target) => target,
            None => return,
        };
        loop {
            let outcome = match self.file_for(next) {
                Some(index) => self.play_file(index, next),
                None => FileOutcome::Idle(next),
            };
            next = match outcome {
                FileOutcome::Seek(target) => target,
                FileOutcome::Idle(target) => match self.wait_for_target(Some(target)) {
                    Some(target) => target,
                    None => break,
                },
                FileOutcome::Closed => break,
            };
        }
        debug!(short_name = %self.short_name, "replay_worker_stopped");
    }

    /// Blocks for the next seek, sending heartbeats meanwhile. `None` once closed.
    fn wait_for_target(&self, caught_up: Option<SystemTime>) -> Option<SystemTime> {
        loop {
            match self.slot.wait(caught_up, self.heartbeat) {
                SlotEvent::Target(time) => return Some(time),
                SlotEvent::Heartbeat => {
                    if let Some(time) = caught_up {
                        if self.canvas.set_time(time).is_err() {
                            return None;
                        }
                    }
                }
                SlotEvent::Closed => return None,
            }
        }
    }

    /// The last file is open-ended so a growing recording stays seekable.
    fn file_for(&self, time: SystemTime) -> Option<usize> {
        let last = self.files.len().checked_sub(1)?;
        self.files
            .iter()
            .enumerate()
            .position(|(index, file)| file.covers(time) || (index == last && time >= file.started_at))
    }

    fn covers(&self, index: usize, time: SystemTime) -> bool {
        self.file_for(time) == Some(index)
    }

    fn play_file(&self, index: usize, target: SystemTime) -> FileOutcome {
        let file = &self.files[index];
        let mut reader = match RecordingReader::open(&file.path) {
            Ok(reader) => reader,
            Err(error) => {
                warn!(path = %file.path.display(), error = %error, "replay_file_unreadable");
                return FileOutcome::Idle(target);
            }
        };
        if let Err(error) = check_geometry(&self.canvas, &reader) {
            warn!(error = %error, "replay_file_skipped");
            return FileOutcome::Idle(target);
        }
        debug!(path = %file.path.display(), "replay_file_opened");

        let outcome = self.replay(index, &mut reader, target);
        // Nothing of a closed file stays valid.
        if let Err(error) = self.canvas.invalidate_all() {
            trace!(error = %error, "replay_invalidate_failed");
        }
        outcome
    }

    fn replay(&self, index: usize, reader: &mut RecordingReader, mut target: SystemTime) -> FileOutcome {
        let mut pending: Option<Record> = None;
        let mut exhausted = false;
        let mut last_heartbeat = Instant::now();
        loop {
            match self.slot.poll() {
                Some(SlotEvent::Closed) => return FileOutcome::Closed,
                Some(SlotEvent::Target(time)) => {
                    if time < target || !self.covers(index, time) {
                        return FileOutcome::Seek(time);
                    }
                    target = time;
                }
                Some(SlotEvent::Heartbeat) | None => {}
            }

            if pending.is_none() && !exhausted {
                match reader.next_record() {
                    Ok(Some(record)) => pending = Some(record),
                    Ok(None) => exhausted = true,
                    Err(error) => {
                        warn!(error = %error, "replay_file_abandoned");
                        exhausted = true;
                    }
                }
            }

            if let Some(record) = pending.as_ref().filter(|record| record.time() <= target) {
                match apply_record(&self.canvas, record) {
                    Ok(()) => {}
                    Err(CanvasError::Closed) => return FileOutcome::Closed,
                    Err(error) if error.kind() == ErrorKind::NotFound => {}
                    Err(error) => {
                        trace!(record = record.body.name(), error = %error, "replay_record_rejected");
                    }
                }
                if last_heartbeat.elapsed() >= self.heartbeat {
                    if self.canvas.set_time(record.time()).is_err() {
                        return FileOutcome::Closed;
                    }
                    last_heartbeat = Instant::now();
                }
                pending = None;
                continue;
            }

            // Caught up: every record up to `target` is applied.
            if self.canvas.set_time(target).is_err() {
                return FileOutcome::Closed;
            }
            last_heartbeat = Instant::now();
            match self.slot.wait(Some(target), self.heartbeat) {
                SlotEvent::Closed => return FileOutcome::Closed,
                SlotEvent::Heartbeat => {}
                SlotEvent::Target(time) => {
                    if time < target || !self.covers(index, time) {
                        return FileOutcome::Seek(time);
                    }
                    target = time;
                }
            }
        }
    }
}

/// Replays the recordings of one source into its own canvas.
///
/// The replay position is set with [`DiskReader::set_replay_time`]; the
/// worker applies every record up to that time and then waits for the next
/// seek. Seeking backward reopens the file from its start.
pub struct DiskReader {
    short_name: String,
    canvas: Canvas,
    files: Vec<RecordingFile>,
    slot: Arc<SeekSlot>,
    worker: Option<JoinHandle<()>>,
}

impl DiskReader {
    pub fn open(recordings_root: &Path, short_name: &str, options: ReaderOptions) -> Result<Self, RecordingError> {
        let dir = recording_dir(recordings_root, short_name);
        let files = list_recordings(&dir)?;
        let Some(first) = files.first() else {
            return Err(RecordingError::NoRecordings {
                short_name: short_name.to_string(),
                dir,
            });
        };

        let config = CanvasConfig {
            chunk_size: first.header.chunk_size,
            origin: first.header.origin,
            ..options.canvas
        };
        let (canvas, _downloads) = Canvas::new(config)?;
        let slot = Arc::new(SeekSlot::default());
        slot.request(first.started_at);

        let worker = ReplayWorker {
            short_name: short_name.to_string(),
            canvas: canvas.clone(),
            files: files.clone(),
            slot: Arc::clone(&slot),
            heartbeat: options.heartbeat_interval.max(Duration::from_millis(1)),
        };
        let handle = thread::Builder::new()
            .name(format!("replay-{short_name}"))
            .spawn(move || worker.run())
            .map_err(|error| CanvasError::Spawn(error.to_string()))?;
        info!(short_name, files = files.len(), "replay_opened");

        Ok(Self {
            short_name: short_name.to_string(),
            canvas,
            files,
            slot,
            worker: Some(handle),
        })
    }

    pub fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    pub fn recordings(&self) -> &[RecordingFile] {
        &self.files
    }

    pub fn source_name(&self) -> &str {
        &self.short_name
    }

    /// Moves the replay position. Only the newest unprocessed request is kept.
    pub fn set_replay_time(&self, time: SystemTime) {
        self.slot.request(time);
    }

    /// Waits until every record up to `target` is applied, for at most `timeout`.
    ///
    /// `target` must be the latest time passed to [`DiskReader::set_replay_time`].
    pub fn wait_caught_up(&self, target: SystemTime, timeout: Duration) -> bool {
        self.slot.wait_caught_up(target, timeout)
    }

    /// Stops the worker and closes the replay canvas. Calling this again has no effect.
    pub fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.slot.close();
        if worker.join().is_err() {
            warn!(short_name = %self.short_name, "replay_worker_panicked");
        }
        self.canvas.close();
        info!(short_name = %self.short_name, "replay_closed");
    }
}

impl Drop for DiskReader {
    fn drop(&mut self) {
        self.close();
    }
}
