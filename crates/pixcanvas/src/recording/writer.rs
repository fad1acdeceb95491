use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use super::catalog::{next_recording_path, recording_dir};
use super::codec::{write_header, write_record, CodecError, Record, RecordBody, RecordingHeader};
use super::error::RecordingError;
use crate::canvas::{Canvas, CanvasError, CanvasImage, CanvasListener, Color, ListenerError, ListenerId, ListenerResult};
use crate::geometry::{Point, Rect};

#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Record every event of the canvas instead of only the registered rectangles.
    pub record_everything: bool,
    /// Upper bound for how long records may sit in the compressor.
    pub flush_interval: Duration,
    /// zstd level, 0 selects the library default.
    pub compression_level: i32,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            record_everything: false,
            flush_interval: Duration::from_secs(5),
            compression_level: 0,
        }
    }
}

/// Canvas listener that appends every observed change to a compressed recording file.
struct DiskWriter {
    path: PathBuf,
    encoder: Option<zstd::stream::write::Encoder<'static, File>>,
    flush_interval: Duration,
    last_flush: Instant,
    records: u64,
}

impl DiskWriter {
    fn create(path: PathBuf, header: &RecordingHeader, options: &WriterOptions) -> Result<Self, RecordingError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(RecordingError::io(&path))?;
        let mut encoder =
            zstd::stream::write::Encoder::new(file, options.compression_level).map_err(RecordingError::io(&path))?;
        write_header(&mut encoder, header).map_err(RecordingError::format(&path))?;
        encoder.flush().map_err(RecordingError::io(&path))?;
        Ok(Self {
            path,
            encoder: Some(encoder),
            flush_interval: options.flush_interval,
            last_flush: Instant::now(),
            records: 0,
        })
    }

    fn write(&mut self, record: Record, flush: bool) -> ListenerResult {
        let encoder = self.encoder.as_mut().ok_or(ListenerError::Closed)?;
        write_record(encoder, &record).map_err(listener_error)?;
        self.records += 1;
        if flush || self.last_flush.elapsed() >= self.flush_interval {
            encoder.flush()?;
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    fn finish(&mut self) -> ListenerResult {
        let Some(encoder) = self.encoder.take() else {
            return Ok(());
        };
        let mut file = encoder.finish()?;
        file.flush()?;
        debug!(path = %self.path.display(), records = self.records, "recording_finished");
        Ok(())
    }
}

impl CanvasListener for DiskWriter {
    fn handle_set_pixel(&mut self, pos: Point, color: Color) -> ListenerResult {
        self.write(Record::set_pixel(SystemTime::now(), pos, color), false)
    }

    fn handle_set_image(&mut self, image: &CanvasImage) -> ListenerResult {
        let record = Record::set_image(SystemTime::now(), image).map_err(listener_error)?;
        self.write(record, true)
    }

    fn handle_invalidate_rect(&mut self, rect: Rect) -> ListenerResult {
        self.write(Record::new(SystemTime::now(), RecordBody::InvalidateRect { rect }), false)
    }

    fn handle_invalidate_all(&mut self) -> ListenerResult {
        self.write(Record::new(SystemTime::now(), RecordBody::InvalidateAll), false)
    }

    fn handle_revalidate_rect(&mut self, rect: Rect) -> ListenerResult {
        self.write(Record::new(SystemTime::now(), RecordBody::RevalidateRect { rect }), false)
    }

    // Replays re-create downloads before every image.
    fn handle_signal_download(&mut self, _rect: Rect) -> ListenerResult {
        Ok(())
    }

    fn handle_chunks_change(&mut self, _created: &[Rect], _removed: &[Rect]) -> ListenerResult {
        Ok(())
    }

    fn handle_detach(&mut self) -> ListenerResult {
        let closing = self.write(Record::new(SystemTime::now(), RecordBody::InvalidateAll), true);
        let finished = self.finish();
        closing.and(finished)
    }
}

impl Drop for DiskWriter {
    fn drop(&mut self) {
        if let Err(error) = self.finish() {
            warn!(path = %self.path.display(), error = %error, "recording_finish_failed");
        }
    }
}

fn listener_error(error: CodecError) -> ListenerError {
    match error {
        CodecError::Io(source) => ListenerError::Io(source),
        other => ListenerError::Rejected(other.to_string()),
    }
}

/// Running recording of a canvas into `<recordings root>/<short name>/`.
///
/// Stops when closed or dropped. Closing waits until the file is finished.
pub struct DiskWriterHandle {
    canvas: Canvas,
    id: ListenerId,
    path: PathBuf,
    closed: bool,
}

impl DiskWriterHandle {
    pub fn start(
        canvas: &Canvas,
        recordings_root: &Path,
        short_name: &str,
        options: WriterOptions,
    ) -> Result<Self, RecordingError> {
        let dir = recording_dir(recordings_root, short_name);
        fs::create_dir_all(&dir).map_err(RecordingError::io(&dir))?;
        let started_at = SystemTime::now();
        let path = next_recording_path(&dir, started_at);
        let header = RecordingHeader::new(started_at, canvas.chunk_size(), canvas.origin());
        let writer = DiskWriter::create(path.clone(), &header, &options)?;

        let id = canvas.subscribe_listener(Box::new(writer), options.record_everything)?;
        info!(
            short_name,
            path = %path.display(),
            record_everything = options.record_everything,
            "recording_started"
        );
        Ok(Self {
            canvas: canvas.clone(),
            id,
            path,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rectangles to record when not recording everything.
    pub fn set_listening_rects(&self, rects: Vec<Rect>) -> Result<(), RecordingError> {
        if self.closed {
            return Err(CanvasError::Closed.into());
        }
        self.canvas.register_rects(self.id, rects)?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), RecordingError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), RecordingError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.canvas.unsubscribe_listener(self.id) {
            // A closed canvas already detached the writer.
            Ok(_) | Err(CanvasError::Closed) => {}
            Err(error) => return Err(error.into()),
        }
        info!(path = %self.path.display(), "recording_stopped");
        Ok(())
    }
}

impl Drop for DiskWriterHandle {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            warn!(path = %self.path.display(), error = %error, "recording_stop_failed");
        }
    }
}
