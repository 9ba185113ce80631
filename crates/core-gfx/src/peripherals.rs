//! Seams to the display, scaler and touch hardware.
//!
//! The pipeline is written against these traits so the worker can drive the
//! real MIPI-DSI panel and scaler block on target hardware and in-memory
//! stand-ins everywhere else. Peripheral failure is not a recoverable
//! condition for the pipeline; see the worker's fatal policy.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("peripheral fault: {message}")]
pub struct PeripheralError {
    pub message: String,
}

impl PeripheralError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Fixed-geometry RGB565 panel with a writable frame buffer.
pub trait DisplayPanel: Send {
    fn width(&self) -> usize;
    fn height(&self) -> usize;

    /// Row-major `width * height` RGB565 buffer the next flush presents.
    fn frame_buffer(&mut self) -> &mut [u16];

    /// Present the frame buffer; blocks until the panel accepted it.
    fn flush(&mut self) -> Result<(), PeripheralError>;

    fn set_brightness(&mut self, pct: u8) -> Result<(), PeripheralError>;
}

/// One blocking scale-and-copy between two linear RGB565 buffers.
pub struct ScaleOp<'a> {
    pub src: &'a [u16],
    pub src_width: usize,
    pub src_height: usize,
    pub dst: &'a mut [u16],
    pub dst_width: usize,
    pub dst_height: usize,
    pub scale_x: f32,
    pub scale_y: f32,
}

pub trait Scaler: Send {
    fn scale(&mut self, op: ScaleOp<'_>) -> Result<(), PeripheralError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TouchPoint {
    pub x: i32,
    pub y: i32,
}

pub trait TouchInput: Send {
    /// Read currently active touch points, up to `points.len()`; returns how
    /// many were written.
    fn read_points(&mut self, points: &mut [TouchPoint]) -> usize;
}
