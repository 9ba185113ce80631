//! Conversion worker: receives a frame (or the overlay), produces panel
//! content, presents it, and hands the buffer back.

use crossbeam_channel::{Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, trace};

use crate::peripherals::{DisplayPanel, PeripheralError, ScaleOp, Scaler};
use crate::{Frame, PixelFormat, Rect, Surface, pack_rgb565};

pub(crate) enum WorkItem {
    /// Convert, scale and present a paletted frame.
    Frame { index: usize, frame: Frame },
    /// Present the pre-rendered overlay verbatim.
    Overlay(Surface),
    /// Fill the overlay from the current panel content; does not present.
    SnapshotOverlay(Surface),
}

pub(crate) enum Done {
    Frame { index: usize, frame: Frame },
    Overlay(Surface),
}

pub(crate) fn spawn(
    panel: Box<dyn DisplayPanel>,
    scaler: Box<dyn Scaler>,
    rx: Receiver<WorkItem>,
    tx: Sender<Done>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("gfx".into())
        .spawn(move || {
            Worker {
                panel,
                scaler,
                intermediate: Vec::new(),
                inter_w: 0,
                inter_h: 0,
            }
            .run(rx, tx)
        })
        .expect("failed to spawn graphics worker")
}

/// The hardware cannot be repaired at runtime; a peripheral error ends the
/// process rather than presenting garbage.
fn fatal(e: PeripheralError) -> ! {
    error!(target: "gfx.worker", error = %e, "unrecoverable peripheral failure");
    panic!("graphics peripheral failure: {e}");
}

struct Worker {
    panel: Box<dyn DisplayPanel>,
    scaler: Box<dyn Scaler>,
    /// Lazily sized RGB565 buffer between palette conversion and the scaler.
    intermediate: Vec<u16>,
    inter_w: usize,
    inter_h: usize,
}

impl Worker {
    fn run(mut self, rx: Receiver<WorkItem>, tx: Sender<Done>) {
        // The loop ends when the pipeline handle is dropped.
        while let Ok(item) = rx.recv() {
            match item {
                WorkItem::Frame { index, frame } => {
                    let t0 = Instant::now();
                    self.present_frame(&frame);
                    debug!(
                        target: "gfx.worker",
                        frame = index,
                        elapsed_us = t0.elapsed().as_micros() as u64,
                        "frame presented"
                    );
                    if tx.send(Done::Frame { index, frame }).is_err() {
                        break;
                    }
                }
                WorkItem::Overlay(surface) => {
                    self.present_overlay(&surface);
                    if tx.send(Done::Overlay(surface)).is_err() {
                        break;
                    }
                }
                WorkItem::SnapshotOverlay(mut surface) => {
                    self.snapshot_into(&mut surface);
                    if tx.send(Done::Overlay(surface)).is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn present_frame(&mut self, frame: &Frame) {
        let fw = frame.surface.width();
        let fh = frame.surface.height();
        // Geometry change invalidates the whole intermediate buffer.
        let mut region = frame.dirty;
        if fw != self.inter_w || fh != self.inter_h {
            self.inter_w = fw;
            self.inter_h = fh;
            self.intermediate = vec![0u16; fw * fh];
            region = Rect::full(fw, fh);
            trace!(target: "gfx.worker", width = fw, height = fh, "intermediate reallocated");
        }
        self.convert(frame, region);
        let (pw, ph) = (self.panel.width(), self.panel.height());
        let op = ScaleOp {
            src: &self.intermediate,
            src_width: fw,
            src_height: fh,
            dst: self.panel.frame_buffer(),
            dst_width: pw,
            dst_height: ph,
            scale_x: pw as f32 / fw as f32,
            scale_y: ph as f32 / fh as f32,
        };
        if let Err(e) = self.scaler.scale(op) {
            fatal(e);
        }
        if let Err(e) = self.panel.flush() {
            fatal(e);
        }
    }

    /// Apply the frame's palette over its damaged region into the
    /// intermediate buffer. RGB565 frames copy through unconverted.
    fn convert(&mut self, frame: &Frame, region: Rect) {
        if region.is_empty() {
            return;
        }
        let pitch = frame.surface.pitch();
        let src = frame.surface.pixels();
        match frame.surface.format() {
            PixelFormat::Clut8 => {
                let mut lut = [0u16; 256];
                for (i, entry) in lut.iter_mut().enumerate() {
                    let (r, g, b) = frame.palette.rgb(i);
                    *entry = pack_rgb565(r, g, b);
                }
                for y in region.top..region.bottom {
                    let row = &src[y * pitch..];
                    let out = &mut self.intermediate[y * self.inter_w..];
                    for x in region.left..region.right {
                        out[x] = lut[row[x] as usize];
                    }
                }
            }
            PixelFormat::Rgb565 => {
                for y in region.top..region.bottom {
                    let row = &src[y * pitch..];
                    let out = &mut self.intermediate[y * self.inter_w..];
                    for x in region.left..region.right {
                        out[x] = u16::from_le_bytes([row[x * 2], row[x * 2 + 1]]);
                    }
                }
            }
        }
    }

    fn present_overlay(&mut self, overlay: &Surface) {
        let fb = self.panel.frame_buffer();
        let src = overlay.pixels();
        for (dst, pair) in fb.iter_mut().zip(src.chunks_exact(2)) {
            *dst = u16::from_le_bytes([pair[0], pair[1]]);
        }
        if let Err(e) = self.panel.flush() {
            fatal(e);
        }
    }

    fn snapshot_into(&mut self, overlay: &mut Surface) {
        let fb = self.panel.frame_buffer();
        let dst = overlay.pixels_mut();
        for (src, pair) in fb.iter().zip(dst.chunks_exact_mut(2)) {
            pair.copy_from_slice(&src.to_le_bytes());
        }
    }
}
