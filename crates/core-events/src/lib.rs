//! Shared input-event model and delivery queue.
//!
//! The HID interpreter produces [`HidEvent`]s synchronously from inside the
//! transport's report callback; the application consumes them from its own
//! task. [`EventQueue`] sits between the two as a bounded channel.
//!
//! Channel policy: the producing side must never block (it runs on the HID
//! transport worker), so delivery uses `try_send` and a full queue drops the
//! event. Loss under a slow consumer is preferable to stalling report
//! delivery; drops are counted so tests and the status log can observe them.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Default capacity of the application-facing event queue.
pub const EVENT_QUEUE_CAP: usize = 64;

/// High-level input event emitted by the HID interpreter.
///
/// `ordinal` identifies which field of its kind on the device produced the
/// event (button 0, button 1, axis 0, ...), stable across reports for the
/// lifetime of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidEvent {
    pub device_id: u32,
    pub ordinal: u32,
    pub kind: HidEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidEventKind {
    KeyDown { keycode: u32 },
    KeyUp { keycode: u32 },
    MouseMotion { dx: i32, dy: i32 },
    MouseButtonDown,
    MouseButtonUp,
    MouseWheel { delta: i32 },
    JoyButtonDown,
    JoyButtonUp,
    JoyAxis { pos: i32 },
    JoyHat { pos: i32 },
}

/// Destination for events produced while parsing a report.
///
/// `deliver` is invoked synchronously, once per event, in field-declaration
/// order for a given report. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: HidEvent);
}

/// Per-queue delivery counters.
#[derive(Debug, Default)]
struct QueueTelemetry {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTelemetrySnapshot {
    pub delivered: u64,
    pub dropped: u64,
}

/// Bounded event queue connecting the HID interpreter to the application.
///
/// Cloning shares the underlying channel and counters; any clone may act as
/// the sink while another is drained by the consumer.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: Sender<HidEvent>,
    rx: Receiver<HidEvent>,
    telemetry: Arc<QueueTelemetry>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAP)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, rx) = bounded(cap);
        Self {
            tx,
            rx,
            telemetry: Arc::new(QueueTelemetry::default()),
        }
    }

    /// Non-blocking consume; `None` when the queue is currently empty.
    pub fn poll(&self) -> Option<HidEvent> {
        self.rx.try_recv().ok()
    }

    /// Blocking consume; `None` only if every producing clone is gone.
    pub fn recv(&self) -> Option<HidEvent> {
        self.rx.recv().ok()
    }

    pub fn telemetry(&self) -> QueueTelemetrySnapshot {
        QueueTelemetrySnapshot {
            delivered: self.telemetry.delivered.load(Relaxed),
            dropped: self.telemetry.dropped.load(Relaxed),
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventQueue {
    fn deliver(&self, event: HidEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.telemetry.delivered.fetch_add(1, Relaxed);
            }
            Err(TrySendError::Full(ev)) => {
                self.telemetry.dropped.fetch_add(1, Relaxed);
                tracing::trace!(target: "events.queue", ?ev, "event dropped, queue full");
            }
            Err(TrySendError::Disconnected(_)) => {
                // Consumer is gone; nothing useful left to do with the event.
                self.telemetry.dropped.fetch_add(1, Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_down(code: u32) -> HidEvent {
        HidEvent {
            device_id: 0,
            ordinal: 0,
            kind: HidEventKind::KeyDown { keycode: code },
        }
    }

    #[test]
    fn delivers_in_order() {
        let q = EventQueue::with_capacity(8);
        q.deliver(key_down(4));
        q.deliver(key_down(5));
        assert_eq!(q.poll(), Some(key_down(4)));
        assert_eq!(q.poll(), Some(key_down(5)));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let q = EventQueue::with_capacity(2);
        q.deliver(key_down(1));
        q.deliver(key_down(2));
        q.deliver(key_down(3)); // no room
        let t = q.telemetry();
        assert_eq!(t.delivered, 2);
        assert_eq!(t.dropped, 1);
        // The queued events are intact.
        assert_eq!(q.poll(), Some(key_down(1)));
        assert_eq!(q.poll(), Some(key_down(2)));
        assert_eq!(q.poll(), None);
    }

    #[test]
    fn clones_share_channel_and_counters() {
        let q = EventQueue::with_capacity(4);
        let sink = q.clone();
        sink.deliver(key_down(9));
        assert_eq!(q.poll(), Some(key_down(9)));
        assert_eq!(q.telemetry().delivered, 1);
    }
}
