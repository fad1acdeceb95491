use std::thread;
use std::time::{Duration, SystemTime};

use image::RgbaImage;
use pixcanvas::recording::list_recordings;
use pixcanvas::{
    opaque, recording_dir, replay_file_into, Canvas, CanvasConfig, CanvasImage, CanvasListener, Color,
    DiskReader, DiskWriterHandle, ListenerResult, PixelSize, Point, ReaderOptions, Rect, WriterOptions,
};
use tempfile::TempDir;

const CHUNK: i32 = 16;

struct Noop;

impl CanvasListener for Noop {
    fn handle_set_pixel(&mut self, _pos: Point, _color: Color) -> ListenerResult {
        Ok(())
    }

    fn handle_set_image(&mut self, _image: &CanvasImage) -> ListenerResult {
        Ok(())
    }

    fn handle_invalidate_rect(&mut self, _rect: Rect) -> ListenerResult {
        Ok(())
    }

    fn handle_invalidate_all(&mut self) -> ListenerResult {
        Ok(())
    }

    fn handle_signal_download(&mut self, _rect: Rect) -> ListenerResult {
        Ok(())
    }

    fn handle_chunks_change(&mut self, _created: &[Rect], _removed: &[Rect]) -> ListenerResult {
        Ok(())
    }
}

/// Returns once every event emitted so far went through all listeners.
fn drain(canvas: &Canvas) {
    let id = canvas.subscribe_listener(Box::new(Noop), false).expect("barrier subscribe");
    assert!(canvas.unsubscribe_listener(id).expect("barrier unsubscribe"));
}

fn filled(rect: Rect, color: Color) -> CanvasImage {
    CanvasImage::from_rgba(
        rect.min,
        RgbaImage::from_pixel(rect.width() as u32, rect.height() as u32, color),
    )
}

fn download(canvas: &Canvas, rect: Rect, color: Color) {
    let started = canvas.signal_download(rect).expect("signal download");
    assert!(!started.is_empty());
    canvas.set_image(&filled(rect, color), false, true).expect("set image");
}

struct Checkpoint {
    time: SystemTime,
    image: CanvasImage,
}

fn checkpoint(canvas: &Canvas, area: Rect) -> Checkpoint {
    drain(canvas);
    thread::sleep(Duration::from_millis(5));
    let checkpoint = Checkpoint {
        time: SystemTime::now(),
        image: canvas.get_image_copy(area, false, true).expect("live copy"),
    };
    thread::sleep(Duration::from_millis(5));
    checkpoint
}

fn record_session(root: &std::path::Path, area: Rect) -> Vec<Checkpoint> {
    let (canvas, _downloads) =
        Canvas::new(CanvasConfig::with_chunk_size(PixelSize::new(CHUNK, CHUNK))).expect("canvas");
    let writer = DiskWriterHandle::start(
        &canvas,
        root,
        "round trip",
        WriterOptions {
            record_everything: true,
            ..WriterOptions::default()
        },
    )
    .expect("writer");
    thread::sleep(Duration::from_millis(5));

    let right = Rect::from_origin_size(CHUNK, 0, CHUNK, CHUNK);
    let mut checkpoints = Vec::new();

    download(&canvas, Rect::from_origin_size(0, 0, 2 * CHUNK, CHUNK), opaque(200, 30, 30));
    checkpoints.push(checkpoint(&canvas, area));

    canvas.set_pixel(Point::new(3, 3), opaque(0, 0, 255)).expect("pixel");
    canvas.set_pixel(Point::new(20, 10), opaque(0, 255, 0)).expect("pixel");
    checkpoints.push(checkpoint(&canvas, area));

    canvas.invalidate_rect(right, false).expect("invalidate");
    checkpoints.push(checkpoint(&canvas, area));

    download(&canvas, right, opaque(10, 10, 10));
    canvas.set_pixel(Point::new(31, 15), opaque(255, 255, 0)).expect("pixel");
    checkpoints.push(checkpoint(&canvas, area));

    writer.close().expect("close writer");
    canvas.close();
    checkpoints
}

#[test]
fn disk_reader_reproduces_every_checkpoint() {
    let temp = TempDir::new().expect("temp");
    let area = Rect::new(-4, -4, 2 * CHUNK + 4, CHUNK + 4);
    let checkpoints = record_session(temp.path(), area);
    assert_ne!(checkpoints[0].image, checkpoints[1].image);
    assert_ne!(checkpoints[1].image, checkpoints[2].image);

    let mut reader = DiskReader::open(
        temp.path(),
        "round trip",
        ReaderOptions {
            heartbeat_interval: Duration::from_millis(10),
            ..ReaderOptions::default()
        },
    )
    .expect("reader");
    assert_eq!(reader.canvas().chunk_size(), PixelSize::new(CHUNK, CHUNK));

    // Forward through all checkpoints, then seek backward.
    for index in [0usize, 1, 2, 3, 1, 0] {
        let checkpoint = &checkpoints[index];
        reader.set_replay_time(checkpoint.time);
        assert!(
            reader.wait_caught_up(checkpoint.time, Duration::from_secs(10)),
            "replay did not reach checkpoint {index}"
        );
        let replayed = reader
            .canvas()
            .get_image_copy(area, false, true)
            .expect("replay copy");
        assert_eq!(replayed, checkpoint.image, "checkpoint {index} differs");
    }
    reader.close();
}

#[test]
fn offline_replay_matches_checkpoint() {
    let temp = TempDir::new().expect("temp");
    let area = Rect::new(0, 0, 2 * CHUNK, CHUNK);
    let checkpoints = record_session(temp.path(), area);

    let files = list_recordings(&recording_dir(temp.path(), "round trip")).expect("list");
    assert_eq!(files.len(), 1);

    let (canvas, _downloads) =
        Canvas::new(CanvasConfig::with_chunk_size(PixelSize::new(CHUNK, CHUNK))).expect("canvas");
    let summary = replay_file_into(&canvas, &files[0].path, Some(checkpoints[1].time)).expect("replay");
    assert!(summary.applied >= 3, "{summary:?}");
    assert_eq!(summary.skipped, 0);
    assert_eq!(
        canvas.get_image_copy(area, false, true).expect("copy"),
        checkpoints[1].image
    );
}
