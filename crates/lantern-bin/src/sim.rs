//! Host-side stand-ins for the target hardware: an in-memory SD card, an
//! RGB565 panel, a nearest-neighbor scaler and a scripted touch source.

use std::sync::{Arc, Mutex};

use core_blockcache::{BackendError, SECTOR_SIZE, SectorBackend};
use core_gfx::peripherals::{
    DisplayPanel, PeripheralError, ScaleOp, Scaler, TouchInput, TouchPoint,
};

/// In-memory sector store, optionally seeded from a disk image. Sectors that
/// were never written read back as a deterministic pattern (every u32 of
/// sector `n` holds `n`), which makes cache verification trivial.
pub struct MemoryDisk {
    sectors: u64,
    written: Mutex<std::collections::HashMap<u64, Box<[u8]>>>,
}

impl MemoryDisk {
    pub fn new(sectors: u64) -> Self {
        Self {
            sectors,
            written: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn from_image(image: &[u8]) -> Self {
        let sectors = (image.len() as u64).div_ceil(SECTOR_SIZE as u64);
        let disk = Self::new(sectors.max(1));
        {
            let mut written = disk.written.lock().unwrap();
            for (i, chunk) in image.chunks(SECTOR_SIZE).enumerate() {
                let mut sector = vec![0u8; SECTOR_SIZE];
                sector[..chunk.len()].copy_from_slice(chunk);
                written.insert(i as u64, sector.into_boxed_slice());
            }
        }
        disk
    }

    fn fill_pattern(dst: &mut [u8], sector: u64) {
        let word = (sector as u32).to_le_bytes();
        for chunk in dst.chunks_exact_mut(4) {
            chunk.copy_from_slice(&word);
        }
    }
}

impl SectorBackend for MemoryDisk {
    fn read_sectors(
        &self,
        dst: &mut [u8],
        start_sector: u64,
        sector_count: usize,
    ) -> Result<(), BackendError> {
        if start_sector + sector_count as u64 > self.sectors {
            return Err(BackendError::new("read past end of device"));
        }
        let written = self.written.lock().unwrap();
        for i in 0..sector_count {
            let sector = start_sector + i as u64;
            let out = &mut dst[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            match written.get(&sector) {
                Some(data) => out.copy_from_slice(data),
                None => Self::fill_pattern(out, sector),
            }
        }
        Ok(())
    }

    fn write_sectors(
        &self,
        src: &[u8],
        start_sector: u64,
        sector_count: usize,
    ) -> Result<(), BackendError> {
        if start_sector + sector_count as u64 > self.sectors {
            return Err(BackendError::new("write past end of device"));
        }
        let mut written = self.written.lock().unwrap();
        for i in 0..sector_count {
            let sector = start_sector + i as u64;
            let data = src[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].to_vec();
            written.insert(sector, data.into_boxed_slice());
        }
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.sectors
    }
}

/// Panel whose flushes land in a shared buffer the harness can inspect.
pub struct SimPanel {
    width: usize,
    height: usize,
    fb: Vec<u16>,
    presented: Arc<Mutex<Vec<u16>>>,
}

impl SimPanel {
    pub fn new(width: usize, height: usize) -> (Self, Arc<Mutex<Vec<u16>>>) {
        let presented = Arc::new(Mutex::new(vec![0u16; width * height]));
        (
            Self {
                width,
                height,
                fb: vec![0u16; width * height],
                presented: Arc::clone(&presented),
            },
            presented,
        )
    }
}

impl DisplayPanel for SimPanel {
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
        Ok(())
    }

    fn set_brightness(&mut self, _pct: u8) -> Result<(), PeripheralError> {
        Ok(())
    }
}

/// Nearest-neighbor replacement for the hardware scaler block.
pub struct SimScaler;

impl Scaler for SimScaler {
    fn scale(&mut self, op: ScaleOp<'_>) -> Result<(), PeripheralError> {
        if op.src.len() < op.src_width * op.src_height
            || op.dst.len() < op.dst_width * op.dst_height
        {
            return Err(PeripheralError::new("scale buffers undersized"));
        }
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

/// Plays back a fixed list of touch points, one per poll.
pub struct ScriptedTouch {
    script: Vec<TouchPoint>,
    next: usize,
}

impl ScriptedTouch {
    pub fn new(script: Vec<TouchPoint>) -> Self {
        Self { script, next: 0 }
    }
}

impl TouchInput for ScriptedTouch {
    fn read_points(&mut self, points: &mut [TouchPoint]) -> usize {
        if points.is_empty() {
            return 0;
        }
        match self.script.get(self.next) {
            Some(&p) => {
                self.next += 1;
                points[0] = p;
                1
            }
            None => 0,
        }
    }
}
