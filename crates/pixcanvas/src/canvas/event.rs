use std::sync::mpsc::SyncSender;
use std::time::SystemTime;

use super::image::{CanvasImage, Color};
use super::listener::{CanvasListener, ListenerId};
use crate::geometry::{Point, Rect};

/// Everything the broadcaster thread consumes, in the order it was produced.
pub(crate) enum CanvasEvent {
    SetPixel {
        pos: Point,
        color: Color,
    },
    SetImage {
        image: CanvasImage,
    },
    RevalidateRect {
        rect: Rect,
    },
    InvalidateRect {
        rect: Rect,
    },
    InvalidateAll,
    SignalDownload {
        rect: Rect,
    },
    SetTime {
        time: SystemTime,
    },
    ListenerSubscribe {
        id: ListenerId,
        listener: Box<dyn CanvasListener>,
        all_events: bool,
    },
    ListenerUnsubscribe {
        id: ListenerId,
        detached: SyncSender<bool>,
    },
    ListenerRectsChanged {
        id: ListenerId,
        rects: Vec<Rect>,
    },
    /// Runs a scheduler pass right away.
    Sync,
}

impl CanvasEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            CanvasEvent::SetPixel { .. } => "set_pixel",
            CanvasEvent::SetImage { .. } => "set_image",
            CanvasEvent::RevalidateRect { .. } => "revalidate_rect",
            CanvasEvent::InvalidateRect { .. } => "invalidate_rect",
            CanvasEvent::InvalidateAll => "invalidate_all",
            CanvasEvent::SignalDownload { .. } => "signal_download",
            CanvasEvent::SetTime { .. } => "set_time",
            CanvasEvent::ListenerSubscribe { .. } => "listener_subscribe",
            CanvasEvent::ListenerUnsubscribe { .. } => "listener_unsubscribe",
            CanvasEvent::ListenerRectsChanged { .. } => "listener_rects_changed",
            CanvasEvent::Sync => "sync",
        }
    }
}
