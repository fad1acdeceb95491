use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::shared::Teardown;
use super::{Connection, ConnectionError};
use crate::canvas::{
    opaque, Canvas, CanvasConfig, CanvasError, CanvasImage, Chunk, ChunkError, ChunkQueryState, Color,
    DownloadRequests, ErrorKind,
};
use crate::geometry::{divide_floor, ChunkCoordinate, ChunkRect, Point, Rect};
use crate::sync::{mutex_lock, read_lock, write_lock};

const DOWNLOAD_POLL: Duration = Duration::from_millis(50);

const PATTERN: [[u8; 3]; 8] = [
    [255, 255, 255],
    [228, 228, 228],
    [136, 136, 136],
    [34, 34, 34],
    [229, 0, 0],
    [2, 190, 1],
    [0, 131, 199],
    [229, 217, 0],
];

#[derive(Debug, Clone)]
pub struct SimulatedOptions {
    pub canvas: CanvasConfig,
    /// Downloads fetch the `(2 * radius + 1)²` aligned chunk block around the requested chunk.
    pub bigchunk_radius: i32,
    pub seed: u64,
    pub online_players: usize,
    /// Added to every download batch.
    pub download_delay: Duration,
}

impl Default for SimulatedOptions {
    fn default() -> Self {
        Self {
            canvas: CanvasConfig {
                world_rect: Rect::new(-4096, -4096, 4096, 4096),
                ..CanvasConfig::default()
            },
            bigchunk_radius: 1,
            seed: 0,
            online_players: 1,
            download_delay: Duration::ZERO,
        }
    }
}

/// Authoritative pixels: a seeded pattern plus everything pushed since.
struct WorldState {
    world_rect: Rect,
    seed: u64,
    pushed: RwLock<HashMap<Point, Color>>,
    connected: AtomicBool,
    stopped: AtomicBool,
}

impl WorldState {
    fn color_at(&self, pos: Point) -> Color {
        if let Some(color) = read_lock(&self.pushed, "simulated world").get(&pos) {
            return *color;
        }
        let cell = ((pos.x >> 3) as u32 as u64) << 32 | (pos.y >> 3) as u32 as u64;
        let [r, g, b] = PATTERN[(mix(cell ^ self.seed) % PATTERN.len() as u64) as usize];
        opaque(r, g, b)
    }

    fn render(&self, rect: Rect, canvas: &Canvas) -> Result<CanvasImage, ChunkError> {
        let mut image = CanvasImage::blank(rect, canvas.palette());
        let visible = rect.intersect(&self.world_rect);
        for y in visible.min.y..visible.max.y {
            for x in visible.min.x..visible.max.x {
                let pos = Point::new(x, y);
                image.set_pixel(pos, self.color_at(pos))?;
            }
        }
        Ok(image)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

fn mix(mut value: u64) -> u64 {
    value = value.wrapping_add(0x9e37_79b9_7f4a_7c15);
    value = (value ^ (value >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    value = (value ^ (value >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    value ^ (value >> 31)
}

/// In-process world that serves a canvas like a remote game server would.
///
/// A worker thread answers the canvas' download requests in aligned chunk
/// blocks. [`SimulatedWorld::push_pixel`] stands in for pixel updates pushed
/// by the server, [`SimulatedWorld::disconnect`] for a lost connection.
pub struct SimulatedWorld {
    short_name: String,
    options: SimulatedOptions,
    canvas: Canvas,
    state: Arc<WorldState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedWorld {
    pub fn start(short_name: &str, options: SimulatedOptions) -> Result<Self, ConnectionError> {
        if options.bigchunk_radius < 0 {
            return Err(ConnectionError::Failed("bigchunk radius must not be negative".to_string()));
        }
        let (canvas, downloads) = Canvas::new(options.canvas.clone())?;
        let state = Arc::new(WorldState {
            world_rect: options.canvas.world_rect,
            seed: options.seed,
            pushed: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });

        let worker = DownloadWorker {
            canvas: canvas.clone(),
            state: Arc::clone(&state),
            radius: options.bigchunk_radius,
            delay: options.download_delay,
        };
        let handle = thread::Builder::new()
            .name(format!("sim-{short_name}"))
            .spawn(move || worker.run(downloads))
            .map_err(|error| ConnectionError::Failed(error.to_string()))?;
        info!(short_name, seed = options.seed, "simulated_world_started");

        Ok(Self {
            short_name: short_name.to_string(),
            options,
            canvas,
            state,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Changes a pixel of the world and forwards it to the canvas when connected.
    pub fn push_pixel(&self, pos: Point, color: Color) -> Result<(), ConnectionError> {
        if !self.state.world_rect.contains_point(pos) {
            return Err(ConnectionError::Failed(format!("{pos} is outside of the world")));
        }
        write_lock(&self.state.pushed, "simulated world").insert(pos, color);
        if !self.state.is_connected() {
            return Ok(());
        }
        match self.canvas.set_pixel(pos, color) {
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            other => other.map_err(ConnectionError::from),
        }
    }

    /// Authoritative color, independent of what the canvas currently holds.
    pub fn world_pixel(&self, pos: Point) -> Color {
        self.state.color_at(pos)
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Drops the link. Every chunk of the canvas becomes invalid.
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        if self.state.connected.swap(false, Ordering::AcqRel) {
            info!(short_name = %self.short_name, "simulated_world_disconnected");
            self.canvas.invalidate_all()?;
        }
        Ok(())
    }

    /// Restores the link. The scheduler requests the invalid chunks again.
    pub fn reconnect(&self) -> Result<(), ConnectionError> {
        if !self.state.connected.swap(true, Ordering::AcqRel) {
            info!(short_name = %self.short_name, "simulated_world_reconnected");
            self.canvas.sync()?;
        }
        Ok(())
    }

    pub fn options(&self) -> &SimulatedOptions {
        &self.options
    }

    /// Stops the download worker and closes the canvas. Calling this again has no effect.
    pub fn shutdown(&self) {
        let Some(worker) = mutex_lock(&self.worker, "simulated worker").take() else {
            return;
        };
        self.state.stopped.store(true, Ordering::Release);
        self.canvas.close();
        if worker.join().is_err() {
            warn!(short_name = %self.short_name, "simulated_worker_panicked");
        }
        info!(short_name = %self.short_name, "simulated_world_closed");
    }
}

impl Connection for SimulatedWorld {
    fn short_name(&self) -> String {
        self.short_name.clone()
    }

    fn name(&self) -> String {
        format!("Simulated world {}", self.short_name)
    }

    fn online_players(&self) -> usize {
        if self.state.is_connected() {
            self.options.online_players
        } else {
            0
        }
    }

    fn canvas(&self) -> &Canvas {
        &self.canvas
    }

    fn close(&mut self) {
        self.shutdown();
    }
}

impl Teardown for SimulatedWorld {
    fn teardown(&self) {
        self.shutdown();
    }
}

impl Drop for SimulatedWorld {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct DownloadWorker {
    canvas: Canvas,
    state: Arc<WorldState>,
    radius: i32,
    delay: Duration,
}

impl DownloadWorker {
    fn run(self, downloads: DownloadRequests) {
        let lifetime = self.canvas.config().lifetime;
        while !self.state.stopped.load(Ordering::Acquire) {
            let chunk = match downloads.recv_timeout(DOWNLOAD_POLL) {
                Ok(chunk) => chunk,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if !self.state.is_connected() {
                continue;
            }
            // Requests can be stale: an earlier batch may already cover this chunk.
            if chunk.query_state(false, &lifetime) != ChunkQueryState::Download {
                continue;
            }
            if let Err(error) = self.download(&chunk) {
                if error.kind() == ErrorKind::Closed {
                    break;
                }
                warn!(coord = %chunk.coord(), error = %error, "simulated_download_failed");
            }
        }
        debug!("simulated_download_worker_stopped");
    }

    fn download(&self, chunk: &Chunk) -> Result<(), CanvasError> {
        let config = self.canvas.config();
        let block = bigchunk(chunk.coord(), self.radius);
        let rect = block
            .pixel_rect(config.chunk_size, config.origin)
            .intersect(&self.state.world_rect);
        let started = self.canvas.signal_download(rect)?;
        if started.is_empty() {
            return Ok(());
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let image = self
            .state
            .render(rect, &self.canvas)
            .map_err(CanvasError::chunk(chunk.coord()))?;
        for target in &started {
            match self.canvas.set_image(&image.copy_region(target.rect()), false, true) {
                Ok(()) => {}
                // Invalidated while the batch was rendered.
                Err(error) if error.kind() == ErrorKind::InvalidState => {
                    trace!(coord = %target.coord(), "simulated_download_superseded");
                }
                Err(error) => return Err(error),
            }
        }
        debug!(rect = ?rect, chunks = started.len(), "simulated_download_done");
        Ok(())
    }
}

/// Aligned block of `(2 * radius + 1)²` chunks containing `coord`.
fn bigchunk(coord: ChunkCoordinate, radius: i32) -> ChunkRect {
    let size = 2 * radius as i64 + 1;
    let align = |value: i32| {
        let start = divide_floor(value as i64 + radius as i64, size) * size - radius as i64;
        (
            start.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            (start + size).clamp(i32::MIN as i64, i32::MAX as i64) as i32,
        )
    };
    let (min_x, max_x) = align(coord.x);
    let (min_y, max_y) = align(coord.y);
    ChunkRect {
        min: ChunkCoordinate::new(min_x, min_y),
        max: ChunkCoordinate::new(max_x, max_y),
    }
}
