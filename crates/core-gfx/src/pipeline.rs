//! Engine-facing pipeline surface: drawing, palette, overlay and the
//! update/flip protocol.

use crossbeam_channel::{Receiver, Sender, bounded};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, trace, warn};

use crate::peripherals::{DisplayPanel, Scaler, TouchInput, TouchPoint};
use crate::worker::{self, Done, WorkItem};
use crate::{Frame, PixelFormat, Rect, Surface};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsConfig {
    /// Presentation rate cap; `0` disables rate limiting (useful in tests).
    pub refresh_hz: u32,
    pub brightness_pct: u8,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            refresh_hz: 30,
            brightness_pct: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InFlight {
    None,
    Frame(usize),
    Overlay,
}

/// Double-buffered paletted pipeline in front of a fixed RGB565 panel.
///
/// All methods are called from the engine thread. The worker owns the panel
/// and scaler; buffers travel to it and back through single-slot channels,
/// so at most one frame of lag can build up and a full submit queue simply
/// blocks until the previous frame was presented.
pub struct GraphicsPipeline {
    submit_tx: Option<Sender<WorkItem>>,
    ack_rx: Receiver<Done>,
    worker: Option<JoinHandle<()>>,
    panel_w: usize,
    panel_h: usize,
    /// Frame currently owned and mutated by the engine.
    cur: Frame,
    /// The other frame, when neither in flight nor owned by the worker.
    spare: Option<Frame>,
    cur_index: usize,
    overlay: Option<Surface>,
    overlay_visible: bool,
    in_flight: InFlight,
    last_update: Option<Instant>,
    refresh_interval: Duration,
    touch: Box<dyn TouchInput>,
    frames_submitted: u64,
}

impl GraphicsPipeline {
    /// Acquire the peripherals and start the conversion worker. Frames start
    /// at panel geometry in CLUT8 until `init_size` redefines them.
    pub fn new(
        mut panel: Box<dyn DisplayPanel>,
        scaler: Box<dyn Scaler>,
        touch: Box<dyn TouchInput>,
        cfg: GraphicsConfig,
    ) -> Self {
        let panel_w = panel.width();
        let panel_h = panel.height();
        if let Err(e) = panel.set_brightness(cfg.brightness_pct) {
            tracing::error!(target: "gfx.pipeline", error = %e, "brightness setup failed");
            panic!("graphics peripheral failure: {e}");
        }
        let (submit_tx, submit_rx) = bounded(1);
        let (ack_tx, ack_rx) = bounded(1);
        let worker = worker::spawn(panel, scaler, submit_rx, ack_tx);
        let refresh_interval = if cfg.refresh_hz == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / cfg.refresh_hz
        };
        info!(
            target: "gfx.pipeline",
            panel_w,
            panel_h,
            refresh_hz = cfg.refresh_hz,
            "pipeline up"
        );
        Self {
            submit_tx: Some(submit_tx),
            ack_rx,
            worker: Some(worker),
            panel_w,
            panel_h,
            cur: Frame::new(panel_w, panel_h, PixelFormat::Clut8),
            spare: Some(Frame::new(panel_w, panel_h, PixelFormat::Clut8)),
            cur_index: 0,
            overlay: Some(Surface::new(panel_w, panel_h, PixelFormat::Rgb565)),
            overlay_visible: false,
            in_flight: InFlight::None,
            last_update: None,
            refresh_interval,
            touch,
            frames_submitted: 0,
        }
    }

    pub fn panel_size(&self) -> (usize, usize) {
        (self.panel_w, self.panel_h)
    }

    pub fn screen_size(&self) -> (usize, usize) {
        (self.cur.surface.width(), self.cur.surface.height())
    }

    pub fn screen_format(&self) -> PixelFormat {
        self.cur.surface.format()
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Redefine the logical frame geometry. Waits for the worker to go idle
    /// first so no in-flight frame references the old shape.
    pub fn init_size(&mut self, width: usize, height: usize, format: PixelFormat) {
        info!(target: "gfx.pipeline", width, height, ?format, "init_size");
        self.wait_idle();
        self.cur = Frame::new(width, height, format);
        self.spare = Some(Frame::new(width, height, format));
        self.cur_index = 0;
    }

    /// Direct access to the current frame for free-form drawing.
    pub fn lock_screen(&mut self) -> &mut Surface {
        &mut self.cur.surface
    }

    /// End a `lock_screen` drawing session; the whole frame counts as dirty.
    pub fn unlock_screen(&mut self) {
        let full = Rect::full(self.cur.surface.width(), self.cur.surface.height());
        self.cur.dirty.union(full);
    }

    pub fn copy_rect_to_screen(
        &mut self,
        buf: &[u8],
        pitch: usize,
        x: usize,
        y: usize,
        w: usize,
        h: usize,
    ) {
        self.cur.surface.copy_rect(buf, pitch, x, y, w, h);
        self.cur.dirty.union(Rect::new(x, y, x + w, y + h));
    }

    /// Install palette colors on the current frame; the whole frame is
    /// re-converted on the next update.
    pub fn set_palette(&mut self, colors: &[u8], start: usize, num: usize) {
        self.cur.palette.set(colors, start, num);
        self.cur.dirty = Rect::full(self.cur.surface.width(), self.cur.surface.height());
    }

    pub fn grab_palette(&self, dst: &mut [u8], start: usize, num: usize) {
        self.cur.palette.grab(dst, start, num);
    }

    pub fn overlay_size(&self) -> (usize, usize) {
        (self.panel_w, self.panel_h)
    }

    pub fn set_overlay_visible(&mut self, visible: bool) {
        self.overlay_visible = visible;
    }

    pub fn overlay_visible(&self) -> bool {
        self.overlay_visible
    }

    pub fn copy_rect_to_overlay(
        &mut self,
        buf: &[u8],
        pitch: usize,
        x: usize,
        y: usize,
        w: usize,
        h: usize,
    ) {
        self.claim_overlay().copy_rect(buf, pitch, x, y, w, h);
    }

    pub fn grab_overlay(&mut self, dst: &mut Surface) {
        dst.copy_from(self.claim_overlay());
    }

    /// Reset the overlay to a snapshot of what the panel currently shows, so
    /// UI drawn on top of it composes over the last game image.
    pub fn clear_overlay(&mut self) {
        self.wait_idle();
        let overlay = self.overlay.take().expect("overlay present after wait_idle");
        self.send(WorkItem::SnapshotOverlay(overlay));
        self.in_flight = InFlight::Overlay;
        self.drain_ack();
    }

    /// Present the current frame (or the overlay) and flip buffers.
    ///
    /// Rate limited to the configured refresh interval: calls arriving early
    /// return without doing anything. Otherwise this waits for the previous
    /// submission to finish, seeds the next frame with the submitted frame's
    /// pixels and palette, and hands the frame to the worker. Drawing can
    /// then continue while conversion and scaling run.
    pub fn update_screen(&mut self) {
        if let Some(last) = self.last_update {
            if last.elapsed() < self.refresh_interval {
                return;
            }
        }
        self.last_update = Some(Instant::now());
        let t0 = Instant::now();
        self.wait_idle();
        if self.overlay_visible {
            let overlay = self.overlay.take().expect("overlay present after wait_idle");
            self.send(WorkItem::Overlay(overlay));
            self.in_flight = InFlight::Overlay;
        } else {
            let mut next = self.spare.take().expect("spare frame present after wait_idle");
            // The submitted frame's content becomes the base of the next one,
            // so incremental blits stay correct relative to what is displayed.
            next.copy_contents_from(&self.cur);
            next.dirty = Rect::EMPTY;
            let submitted = std::mem::replace(&mut self.cur, next);
            let index = self.cur_index;
            self.send(WorkItem::Frame {
                index,
                frame: submitted,
            });
            self.in_flight = InFlight::Frame(index);
            self.cur_index ^= 1;
        }
        self.frames_submitted += 1;
        trace!(
            target: "gfx.pipeline",
            elapsed_us = t0.elapsed().as_micros() as u64,
            "update submitted"
        );
    }

    /// Read active touch points. In paletted mode, panel coordinates are
    /// scaled down to the logical screen resolution.
    pub fn get_touch(&mut self, points: &mut [TouchPoint]) -> usize {
        let n = self.touch.read_points(points);
        if !self.overlay_visible {
            let lw = self.cur.surface.width() as i32;
            let lh = self.cur.surface.height() as i32;
            for p in points[..n].iter_mut() {
                p.x = p.x * lw / self.panel_w as i32;
                p.y = p.y * lh / self.panel_h as i32;
            }
        }
        n
    }

    /// Block until the worker has nothing of ours; afterwards both frames and
    /// the overlay are on the engine side.
    pub fn wait_idle(&mut self) {
        if !matches!(self.in_flight, InFlight::None) {
            self.drain_ack();
        }
    }

    fn drain_ack(&mut self) {
        match self.ack_rx.recv().expect("graphics worker exited") {
            Done::Frame { index, frame } => {
                if let InFlight::Frame(expected) = self.in_flight {
                    if expected != index {
                        warn!(target: "gfx.pipeline", expected, index, "frame ack mismatch");
                    }
                }
                self.spare = Some(frame);
            }
            Done::Overlay(surface) => {
                self.overlay = Some(surface);
            }
        }
        self.in_flight = InFlight::None;
    }

    fn claim_overlay(&mut self) -> &mut Surface {
        if self.overlay.is_none() {
            self.drain_ack();
        }
        self.overlay.as_mut().expect("overlay returned by worker")
    }

    fn send(&self, item: WorkItem) {
        self.submit_tx
            .as_ref()
            .expect("pipeline already shut down")
            .send(item)
            .expect("graphics worker exited");
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        // Disconnecting the submit channel stops the worker loop.
        drop(self.submit_tx.take());
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peripherals::{PeripheralError, ScaleOp};
    use std::sync::{Arc, Mutex};

    /// Panel that records what each flush presented.
    struct MemoryPanel {
        width: usize,
        height: usize,
        fb: Vec<u16>,
        presented: Arc<Mutex<Vec<u16>>>,
        flushes: Arc<Mutex<u32>>,
    }

    impl MemoryPanel {
        fn new(width: usize, height: usize) -> (Self, Arc<Mutex<Vec<u16>>>, Arc<Mutex<u32>>) {
            let presented = Arc::new(Mutex::new(vec![0u16; width * height]));
            let flushes = Arc::new(Mutex::new(0));
            (
                Self {
                    width,
                    height,
                    fb: vec![0u16; width * height],
                    presented: Arc::clone(&presented),
                    flushes: Arc::clone(&flushes),
                },
                presented,
                flushes,
            )
        }
    }

    impl DisplayPanel for MemoryPanel {
        fn width(&self) -> usize {
            self.width
        }
        fn height(&self) -> usize {
            self.height
        }
        fn frame_buffer(&mut self) -> &mut [u16] {
            &mut self.fb
        }
        fn flush(&mut self) -> Result<(), PeripheralError> {
            self.presented.lock().unwrap().copy_from_slice(&self.fb);
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
        fn set_brightness(&mut self, _pct: u8) -> Result<(), PeripheralError> {
            Ok(())
        }
    }

    /// Nearest-neighbor stand-in for the hardware scaler.
    struct NearestScaler;

    impl Scaler for NearestScaler {
        fn scale(&mut self, op: ScaleOp<'_>) -> Result<(), PeripheralError> {
            for y in 0..op.dst_height {
                let sy = y * op.src_height / op.dst_height;
                for x in 0..op.dst_width {
                    let sx = x * op.src_width / op.dst_width;
                    op.dst[y * op.dst_width + x] = op.src[sy * op.src_width + sx];
                }
            }
            Ok(())
        }
    }

    struct NoTouch;

    impl TouchInput for NoTouch {
        fn read_points(&mut self, _points: &mut [TouchPoint]) -> usize {
            0
        }
    }

    struct FixedTouch(i32, i32);

    impl TouchInput for FixedTouch {
        fn read_points(&mut self, points: &mut [TouchPoint]) -> usize {
            if points.is_empty() {
                return 0;
            }
            points[0] = TouchPoint {
                x: self.0,
                y: self.1,
            };
            1
        }
    }

    fn test_cfg() -> GraphicsConfig {
        GraphicsConfig {
            refresh_hz: 0,
            brightness_pct: 100,
        }
    }

    fn pipeline(
        w: usize,
        h: usize,
        touch: Box<dyn TouchInput>,
    ) -> (GraphicsPipeline, Arc<Mutex<Vec<u16>>>, Arc<Mutex<u32>>) {
        let (panel, presented, flushes) = MemoryPanel::new(w, h);
        let gp = GraphicsPipeline::new(Box::new(panel), Box::new(NearestScaler), touch, test_cfg());
        (gp, presented, flushes)
    }

    #[test]
    fn palette_survives_flip() {
        let (mut gp, _presented, _) = pipeline(64, 64, Box::new(NoTouch));
        gp.init_size(32, 32, PixelFormat::Clut8);
        gp.set_palette(&[10, 20, 30], 0, 1);
        gp.update_screen();
        let mut out = [0u8; 3];
        gp.grab_palette(&mut out, 0, 1);
        assert_eq!(out, [10, 20, 30]);
    }

    #[test]
    fn blitted_pixels_reach_panel_scaled() {
        let (mut gp, presented, _) = pipeline(64, 64, Box::new(NoTouch));
        gp.init_size(32, 32, PixelFormat::Clut8);
        gp.set_palette(&[0xFF, 0x00, 0x00], 1, 1); // index 1 = pure red
        let rect = vec![1u8; 4 * 4];
        gp.copy_rect_to_screen(&rect, 4, 8, 8, 4, 4);
        gp.update_screen();
        gp.wait_idle();
        // Logical (8,8) lands at panel (16,16) under the 2x scale.
        let panel = presented.lock().unwrap();
        assert_eq!(panel[16 * 64 + 16], 0xF800);
        // A pixel drawn after the update is not on the panel yet.
        drop(panel);
        let late = vec![1u8; 1];
        gp.copy_rect_to_screen(&late, 1, 0, 0, 1, 1);
        let panel = presented.lock().unwrap();
        assert_eq!(panel[0], 0x0000);
    }

    #[test]
    fn incremental_draws_accumulate_across_flips() {
        let (mut gp, presented, _) = pipeline(32, 32, Box::new(NoTouch));
        gp.init_size(32, 32, PixelFormat::Clut8);
        gp.set_palette(&[0xFF, 0, 0, 0, 0xFF, 0], 1, 2); // 1 = red, 2 = green
        gp.copy_rect_to_screen(&[1u8], 1, 0, 0, 1, 1);
        gp.update_screen();
        // Second frame only touches one other pixel; the first must persist
        // through the copy-forward.
        gp.copy_rect_to_screen(&[2u8], 1, 5, 5, 1, 1);
        gp.update_screen();
        gp.wait_idle();
        let panel = presented.lock().unwrap();
        assert_eq!(panel[0], 0xF800);
        assert_eq!(panel[5 * 32 + 5], 0x07E0);
    }

    #[test]
    fn overlay_presented_verbatim() {
        let (mut gp, presented, _) = pipeline(16, 16, Box::new(NoTouch));
        gp.set_overlay_visible(true);
        let px = 0xABCDu16.to_le_bytes();
        gp.copy_rect_to_overlay(&px, 2, 3, 2, 1, 1);
        gp.update_screen();
        gp.wait_idle();
        let panel = presented.lock().unwrap();
        assert_eq!(panel[2 * 16 + 3], 0xABCD);
    }

    #[test]
    fn clear_overlay_snapshots_panel() {
        let (mut gp, _presented, _) = pipeline(16, 16, Box::new(NoTouch));
        gp.init_size(16, 16, PixelFormat::Clut8);
        gp.set_palette(&[0xFF, 0xFF, 0xFF], 0, 1); // whole frame white
        gp.update_screen();
        gp.wait_idle();
        gp.clear_overlay();
        let mut snap = Surface::new(16, 16, PixelFormat::Rgb565);
        gp.grab_overlay(&mut snap);
        let first = u16::from_le_bytes([snap.pixels()[0], snap.pixels()[1]]);
        assert_eq!(first, 0xFFFF);
    }

    #[test]
    fn touch_scales_to_logical_resolution() {
        let (mut gp, _, _) = pipeline(64, 64, Box::new(FixedTouch(32, 16)));
        gp.init_size(32, 32, PixelFormat::Clut8);
        let mut pts = [TouchPoint::default(); 2];
        let n = gp.get_touch(&mut pts);
        assert_eq!(n, 1);
        assert_eq!(pts[0], TouchPoint { x: 16, y: 8 });
        // With the overlay up, panel coordinates pass through untouched.
        gp.set_overlay_visible(true);
        let n = gp.get_touch(&mut pts);
        assert_eq!(n, 1);
        assert_eq!(pts[0], TouchPoint { x: 32, y: 16 });
    }

    #[test]
    fn refresh_rate_limits_updates() {
        let (panel, _, _f) = MemoryPanel::new(8, 8);
        let mut gp = GraphicsPipeline::new(
            Box::new(panel),
            Box::new(NearestScaler),
            Box::new(NoTouch),
            GraphicsConfig {
                refresh_hz: 30,
                brightness_pct: 100,
            },
        );
        gp.update_screen();
        gp.update_screen(); // declined by the limiter
        assert_eq!(gp.frames_submitted(), 1);
    }

    #[test]
    fn init_size_waits_for_worker_and_resizes() {
        let (mut gp, presented, _) = pipeline(64, 64, Box::new(NoTouch));
        gp.init_size(32, 32, PixelFormat::Clut8);
        gp.update_screen();
        // Mid-flight geometry change must not race the worker.
        gp.init_size(16, 16, PixelFormat::Clut8);
        assert_eq!(gp.screen_size(), (16, 16));
        gp.set_palette(&[0, 0, 0xFF], 3, 1);
        gp.copy_rect_to_screen(&[3u8], 1, 0, 0, 1, 1);
        gp.update_screen();
        gp.wait_idle();
        let panel = presented.lock().unwrap();
        assert_eq!(panel[0], 0x001F);
    }
}
