//! Lantern simulation harness.
//!
//! Wires the three core subsystems together against in-memory hardware
//! stand-ins: game-asset reads stream through the block cache, a small
//! animation runs through the graphics pipeline, and scripted HID reports
//! flow through the interpreter into the event queue. Useful for eyeballing
//! logs and telemetry on a development host, and as living documentation of
//! how the pieces connect on target.

mod config;
mod sim;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use core_blockcache::{BlockCache, CacheConfig, CachedDisk, DiskCtl, SECTOR_SIZE, SectorBackend};
use core_events::{EventQueue, EventSink};
use core_gfx::peripherals::TouchPoint;
use core_gfx::{GraphicsConfig, GraphicsPipeline, PixelFormat};
use core_hid::Device;
use sim::{MemoryDisk, ScriptedTouch, SimPanel, SimScaler};

/// Boot-protocol keyboard descriptor used for the demo input device.
const KEYBOARD_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0x05, 0x07, 0x19, 0xE0, 0x29, 0xE7, 0x15, 0x00, 0x25,
    0x01, 0x75, 0x01, 0x95, 0x08, 0x81, 0x02, 0x95, 0x01, 0x75, 0x08, 0x81, 0x01, 0x95, 0x06,
    0x75, 0x08, 0x15, 0x00, 0x25, 0x65, 0x05, 0x07, 0x19, 0x00, 0x29, 0x65, 0x81, 0x00, 0xC0,
];

/// Three-button wheel mouse descriptor.
const MOUSE_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, 0x09, 0x01, 0xA1, 0x00, 0x05, 0x09, 0x19, 0x01, 0x29,
    0x03, 0x15, 0x00, 0x25, 0x01, 0x95, 0x03, 0x75, 0x01, 0x81, 0x02, 0x95, 0x01, 0x75, 0x05,
    0x81, 0x01, 0x05, 0x01, 0x09, 0x30, 0x09, 0x31, 0x09, 0x38, 0x15, 0x81, 0x25, 0x7F, 0x75,
    0x08, 0x95, 0x03, 0x81, 0x06, 0xC0, 0xC0,
];

const PANEL_W: usize = 640;
const PANEL_H: usize = 480;
const GAME_W: usize = 320;
const GAME_H: usize = 200;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "lantern", version, about = "Adventure-backend core simulation harness")]
struct Args {
    /// Disk image backing the simulated card; a pattern-filled in-memory
    /// card is used when omitted.
    #[arg(long)]
    disk: Option<PathBuf>,
    /// Configuration file path (default: ./lantern.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of animation frames to run.
    #[arg(long, default_value_t = 90)]
    frames: u32,
}

fn configure_logging() -> Result<WorkerGuard> {
    let log_path = Path::new("lantern.log");
    if log_path.exists() {
        let _ = std::fs::remove_file(log_path);
    }
    let appender = tracing_appender::rolling::never(".", "lantern.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = configure_logging()?;
    info!(target: "runtime", "startup");

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("lantern.toml"));
    let cfg = config::load(&config_path)?;
    info!(
        target: "runtime",
        config = %config_path.display(),
        block_size = cfg.cache.block_size,
        block_count = cfg.cache.block_count,
        refresh_hz = cfg.display.refresh_hz,
        queue_cap = cfg.input.queue_cap,
        "configuration loaded"
    );

    run(&args, &cfg)
}

fn run(args: &Args, cfg: &config::Config) -> Result<()> {
    // Storage: block cache over the simulated card.
    let backend: Arc<dyn SectorBackend> = match &args.disk {
        Some(path) => {
            let image = std::fs::read(path)
                .with_context(|| format!("reading disk image {}", path.display()))?;
            Arc::new(MemoryDisk::from_image(&image))
        }
        None => Arc::new(MemoryDisk::new(1 << 16)),
    };
    let cache = Arc::new(
        BlockCache::new(
            CacheConfig {
                block_size: cfg.cache.block_size,
                block_count: cfg.cache.block_count,
            },
            backend,
        )
        .context("block cache init")?,
    );
    let disk = CachedDisk::new(Arc::clone(&cache));
    info!(
        target: "runtime",
        sectors = ?disk.control(DiskCtl::SectorCount),
        sector_size = ?disk.control(DiskCtl::SectorSize),
        "card mounted"
    );

    // Graphics: panel-sized pipeline, logical 320x200 paletted screen.
    let (panel, presented) = SimPanel::new(PANEL_W, PANEL_H);
    let touch = ScriptedTouch::new(vec![
        TouchPoint { x: 320, y: 240 },
        TouchPoint { x: 0, y: 0 },
    ]);
    let mut gp = GraphicsPipeline::new(
        Box::new(panel),
        Box::new(SimScaler),
        Box::new(touch),
        GraphicsConfig {
            refresh_hz: cfg.display.refresh_hz,
            brightness_pct: cfg.display.brightness_pct,
        },
    );
    gp.init_size(GAME_W, GAME_H, PixelFormat::Clut8);
    // Grayscale ramp palette.
    let mut palette = Vec::with_capacity(768);
    for i in 0..256u16 {
        let v = i as u8;
        palette.extend_from_slice(&[v, v, v]);
    }
    gp.set_palette(&palette, 0, 256);

    // Input: two demo devices feeding the shared bounded queue.
    let queue = EventQueue::with_capacity(cfg.input.queue_cap);
    let sink: Arc<dyn EventSink> = Arc::new(queue.clone());
    let mut keyboard =
        Device::from_descriptor(KEYBOARD_DESCRIPTOR, 0, Arc::clone(&sink)).context("keyboard")?;
    let mut mouse = Device::from_descriptor(MOUSE_DESCRIPTOR, 1, sink).context("mouse")?;

    let mut events_seen = 0u64;
    let mut sector_buf = vec![0u8; SECTOR_SIZE];
    for frame in 0..args.frames {
        // Stream one "asset" sector through the cache and blit it as a
        // 64x8 tile marching across the screen.
        disk.read(&mut sector_buf, frame as u64, 1)
            .context("asset read")?;
        let x = (frame as usize * 8) % (GAME_W - 64);
        let y = (frame as usize * 4) % (GAME_H - 8);
        gp.copy_rect_to_screen(&sector_buf, 64, x, y, 64, 8);

        // Scripted input: tap a key every other frame, wiggle the mouse.
        let key = if frame % 2 == 0 { 0x04 } else { 0x00 };
        keyboard.parse_report(&[0, 0, key, 0, 0, 0, 0, 0], 0);
        mouse.parse_report(&[0, 1, 0xFF, 0], 0);

        gp.update_screen();

        let mut points = [TouchPoint::default(); 1];
        if gp.get_touch(&mut points) > 0 {
            debug!(target: "runtime", x = points[0].x, y = points[0].y, "touch");
        }
        while let Some(event) = queue.poll() {
            events_seen += 1;
            debug!(target: "runtime", ?event, "input event");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    gp.wait_idle();

    let stats = cache.stats();
    let qstats = queue.telemetry();
    let checksum: u32 = presented
        .lock()
        .unwrap()
        .iter()
        .fold(0u32, |acc, &px| acc.wrapping_add(px as u32));
    info!(
        target: "runtime",
        cache_reads = stats.reads,
        cache_misses = stats.misses,
        frames_submitted = gp.frames_submitted(),
        events_delivered = qstats.delivered,
        events_dropped = qstats.dropped,
        events_seen,
        panel_checksum = checksum,
        "simulation complete"
    );
    Ok(())
}
