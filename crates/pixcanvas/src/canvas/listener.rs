use std::fmt;
use std::io;
use std::time::SystemTime;

use thiserror::Error;

use super::image::{CanvasImage, Color};
use crate::geometry::{Point, Rect};

/// Handle for a subscribed listener, unique per canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener is closed")]
    Closed,
    #[error("listener i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Rejected(String),
}

pub type ListenerResult = Result<(), ListenerError>;

/// Observer of canvas changes.
///
/// All callbacks run on the canvas broadcaster thread, one at a time and in
/// event order. A callback must not call back into the same canvas: mutating
/// calls block on the broadcaster, which is busy running the callback.
pub trait CanvasListener: Send {
    fn handle_set_pixel(&mut self, pos: Point, color: Color) -> ListenerResult;

    fn handle_set_image(&mut self, image: &CanvasImage) -> ListenerResult;

    fn handle_invalidate_rect(&mut self, rect: Rect) -> ListenerResult;

    fn handle_invalidate_all(&mut self) -> ListenerResult;

    fn handle_signal_download(&mut self, rect: Rect) -> ListenerResult;

    /// Chunk rectangles that became relevant for this listener, and ones that stopped being relevant.
    fn handle_chunks_change(&mut self, created: &[Rect], removed: &[Rect]) -> ListenerResult;

    /// Chunks inside `rect` are valid again and did not change visually.
    fn handle_revalidate_rect(&mut self, _rect: Rect) -> ListenerResult {
        Ok(())
    }

    /// Clock update from a replaying canvas.
    fn handle_set_time(&mut self, _time: SystemTime) -> ListenerResult {
        Ok(())
    }

    /// Last callback before the canvas drops this listener.
    fn handle_detach(&mut self) -> ListenerResult {
        Ok(())
    }
}
