//! Disk-control facade for a filesystem driver sitting on top of the cache.
//!
//! A FAT-style driver talks to its media through sector read/write plus a
//! small control interface for geometry and flushing. Reads and writes go
//! through the cache; control queries are answered straight from the backend.

use std::sync::Arc;

use crate::{BackendError, BlockCache};

/// Control requests a filesystem driver issues against the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskCtl {
    /// Flush pending device-side state. Writes already pass through
    /// synchronously, so this acknowledges without further work.
    Sync,
    SectorCount,
    SectorSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskCtlValue {
    None,
    Count(u64),
    Size(usize),
}

/// A cache-fronted disk as seen by a filesystem driver.
pub struct CachedDisk {
    cache: Arc<BlockCache>,
}

impl CachedDisk {
    pub fn new(cache: Arc<BlockCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn read(
        &self,
        dst: &mut [u8],
        start_sector: u64,
        sector_count: usize,
    ) -> Result<(), BackendError> {
        self.cache.read_sectors(dst, start_sector, sector_count)
    }

    pub fn write(
        &self,
        src: &[u8],
        start_sector: u64,
        sector_count: usize,
    ) -> Result<(), BackendError> {
        self.cache.write_sectors(src, start_sector, sector_count)
    }

    pub fn control(&self, ctl: DiskCtl) -> Result<DiskCtlValue, BackendError> {
        let backend = self.cache.backend();
        Ok(match ctl {
            DiskCtl::Sync => DiskCtlValue::None,
            DiskCtl::SectorCount => DiskCtlValue::Count(backend.sector_count()),
            DiskCtl::SectorSize => DiskCtlValue::Size(backend.sector_size()),
        })
    }
}
