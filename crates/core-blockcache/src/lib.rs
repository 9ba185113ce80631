//! Read-through block cache between a filesystem driver and sector storage.
//!
//! Many reader threads, one worker. The flow for a cache miss:
//!
//! * reader scans the slot table and doesn't find the block
//! * reader takes the request gate
//! * reader sends a `Read` request and blocks on the reply
//! * worker claims a slot (FIFO), fills it from the backend, replies
//! * reader releases the gate and retries the slot scan, which now hits
//!
//! Readers never wait on each other on the hit path: each slot is guarded by
//! its own mutex and `try_lock` acts as the claim; a slot that can't be
//! claimed is simply skipped this pass (the holder is either another reader
//! mid-copy or the worker mid-fill). All mutation of `valid`, `blockno` and
//! the block data happens on the worker; a reader holding a slot only copies
//! out of it and flips the `touched` mark.
//!
//! Eviction is FIFO rather than LRU: the workload is dominated by sequential
//! streaming with readahead, and FIFO needs no per-access metadata writes.
//!
//! Invariants:
//! * a slot with `valid == false` has meaningless data
//! * at most one slot is valid for any given block number
//! * `block_size` is a nonzero multiple of the 512-byte sector and fixed,
//!   together with `block_count`, at construction

mod diskio;
mod worker;

pub use diskio::{CachedDisk, DiskCtl, DiskCtlValue};

use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use thiserror::Error;

use worker::Request;

/// Fixed sector size of the storage backend, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Synchronous sector-addressed storage the cache sits in front of.
///
/// Callbacks may suspend the calling thread; the cache worker is the only
/// thread that invokes `read_sectors`, while `write_sectors` runs on the
/// writing client's thread.
pub trait SectorBackend: Send + Sync {
    fn read_sectors(
        &self,
        dst: &mut [u8],
        start_sector: u64,
        sector_count: usize,
    ) -> Result<(), BackendError>;

    fn write_sectors(
        &self,
        src: &[u8],
        start_sector: u64,
        sector_count: usize,
    ) -> Result<(), BackendError>;

    /// Total device capacity in sectors.
    fn sector_count(&self) -> u64;

    fn sector_size(&self) -> usize {
        SECTOR_SIZE
    }
}

/// Error reported by a [`SectorBackend`]; passed through to callers unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage backend error: {message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("out of memory allocating cache blocks")]
    NoMem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Cache granularity in bytes; a nonzero multiple of [`SECTOR_SIZE`].
    pub block_size: usize,
    /// Number of cache slots; at least 1.
    pub block_count: usize,
}

impl CacheConfig {
    fn validate(&self) -> Result<(), InitError> {
        if self.block_size == 0 || self.block_size % SECTOR_SIZE != 0 {
            return Err(InitError::InvalidConfig(
                "block_size must be a nonzero multiple of the sector size",
            ));
        }
        if self.block_count == 0 {
            return Err(InitError::InvalidConfig("block_count must be at least 1"));
        }
        Ok(())
    }

    fn sectors_per_block(&self) -> usize {
        self.block_size / SECTOR_SIZE
    }
}

/// One cache slot. The mutex doubles as the claim flag: `try_lock` either
/// hands the caller the slot or tells it someone else holds it right now.
pub(crate) struct Slot {
    state: Mutex<SlotState>,
}

pub(crate) struct SlotState {
    pub(crate) blockno: u64,
    pub(crate) valid: bool,
    /// Set once a client has consumed this block; a touched valid block is a
    /// readahead candidate for `blockno + 1`.
    pub(crate) touched: bool,
    pub(crate) data: Box<[u8]>,
}

impl Slot {
    fn new(data: Box<[u8]>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                blockno: 0,
                valid: false,
                touched: false,
                data,
            }),
        }
    }

    /// Non-blocking claim. `None` means another actor holds the slot; that is
    /// a scheduling hint, not an error. A poisoned slot is reclaimed as-is:
    /// the worker resets every field before trusting it again.
    pub(crate) fn try_claim(&self) -> Option<MutexGuard<'_, SlotState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
        }
    }

    /// Blocking claim, used by the worker where skipping is not an option
    /// (holders only keep a slot for the duration of one memcpy).
    pub(crate) fn claim(&self) -> MutexGuard<'_, SlotState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(p) => p.into_inner(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    pub(crate) reads: AtomicU64,
    pub(crate) misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Block copies served out of the cache.
    pub reads: u64,
    /// Reads that had to go through the worker to the backend.
    pub misses: u64,
}

pub(crate) struct Shared {
    pub(crate) cfg: CacheConfig,
    pub(crate) backend: Arc<dyn SectorBackend>,
    pub(crate) slots: Box<[Slot]>,
    pub(crate) stats: CacheStats,
}

/// Reader-side half of the request mailbox. The gate mutex funnels many
/// clients into the single-slot request channel; the write path additionally
/// holds it across the backend write so no read request can interleave.
struct RequestPort {
    req_tx: Sender<Request>,
    done_rx: Receiver<Result<(), BackendError>>,
}

impl RequestPort {
    fn request(&self, req: Request) -> Result<(), BackendError> {
        self.req_tx.send(req).expect("cache worker exited");
        self.done_rx.recv().expect("cache worker exited")
    }
}

/// Concurrent read-through sector cache with a readahead worker.
///
/// The worker thread lives until the cache is dropped: dropping the handle
/// disconnects the request channel and the worker exits its receive loop on
/// its own. There is no explicit shutdown protocol.
pub struct BlockCache {
    shared: Arc<Shared>,
    port: Mutex<RequestPort>,
}

impl BlockCache {
    pub fn new(cfg: CacheConfig, backend: Arc<dyn SectorBackend>) -> Result<Self, InitError> {
        cfg.validate()?;
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(cfg.block_count)
            .map_err(|_| InitError::NoMem)?;
        for _ in 0..cfg.block_count {
            let mut data = Vec::new();
            data.try_reserve_exact(cfg.block_size)
                .map_err(|_| InitError::NoMem)?;
            data.resize(cfg.block_size, 0);
            slots.push(Slot::new(data.into_boxed_slice()));
        }
        let shared = Arc::new(Shared {
            cfg,
            backend,
            slots: slots.into_boxed_slice(),
            stats: CacheStats::default(),
        });
        let (req_tx, req_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        worker::spawn(Arc::clone(&shared), req_rx, done_tx);
        Ok(Self {
            shared,
            port: Mutex::new(RequestPort { req_tx, done_rx }),
        })
    }

    pub fn config(&self) -> CacheConfig {
        self.shared.cfg
    }

    pub fn backend(&self) -> &Arc<dyn SectorBackend> {
        &self.shared.backend
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            reads: self.shared.stats.reads.load(Relaxed),
            misses: self.shared.stats.misses.load(Relaxed),
        }
    }

    /// Read `sector_count` sectors starting at `start_sector` into `dst`.
    ///
    /// `dst` must hold at least `sector_count * 512` bytes. The call may
    /// suspend indefinitely while the worker talks to the backend; the first
    /// backend error encountered is returned and ends the read early.
    pub fn read_sectors(
        &self,
        dst: &mut [u8],
        start_sector: u64,
        sector_count: usize,
    ) -> Result<(), BackendError> {
        assert!(
            dst.len() >= sector_count * SECTOR_SIZE,
            "destination buffer too small for {sector_count} sectors"
        );
        let spb = self.shared.cfg.sectors_per_block() as u64;
        let mut sector = start_sector;
        let mut remaining = sector_count;
        let mut copied = 0usize;
        let mut want_rescan = false;
        while remaining > 0 {
            let blockno = sector / spb;
            let byte_off = (sector % spb) as usize * SECTOR_SIZE;
            let mut found = false;
            for slot in self.shared.slots.iter() {
                // Skip any slot someone else holds; if the block we want is
                // in it, the retry after the miss request will find it.
                let Some(mut st) = slot.try_claim() else {
                    continue;
                };
                if st.valid && st.blockno == blockno {
                    let avail = (self.shared.cfg.block_size - byte_off) / SECTOR_SIZE;
                    let take = avail.min(remaining);
                    let nbytes = take * SECTOR_SIZE;
                    dst[copied..copied + nbytes]
                        .copy_from_slice(&st.data[byte_off..byte_off + nbytes]);
                    // A first consumption of a freshly filled block means the
                    // readahead scan may have new work past it.
                    if !st.touched {
                        want_rescan = true;
                    }
                    st.touched = true;
                    copied += nbytes;
                    sector += take as u64;
                    remaining -= take;
                    found = true;
                    self.shared.stats.reads.fetch_add(1, Relaxed);
                }
                drop(st);
                if found {
                    break;
                }
            }
            if !found {
                self.shared.stats.misses.fetch_add(1, Relaxed);
                tracing::trace!(target: "blockcache", block = blockno, "miss, requesting read");
                let port = self.port.lock().expect("request gate poisoned");
                port.request(Request::Read(blockno))?;
                // Block is now cached (or the error returned above); loop
                // around and fetch it off the slot table.
            }
        }
        if want_rescan {
            let port = self.port.lock().expect("request gate poisoned");
            // A rescan is acknowledged before the scan itself runs and
            // cannot fail.
            let _ = port.request(Request::Rescan);
        }
        Ok(())
    }

    /// Write `sector_count` sectors through to the backend, invalidating any
    /// cached block overlapping the written range first.
    ///
    /// The request gate is held from the first invalidate until the backend
    /// write finishes, so no reader can re-populate one of the written blocks
    /// in between.
    pub fn write_sectors(
        &self,
        src: &[u8],
        start_sector: u64,
        sector_count: usize,
    ) -> Result<(), BackendError> {
        assert!(
            src.len() >= sector_count * SECTOR_SIZE,
            "source buffer too small for {sector_count} sectors"
        );
        let port = self.port.lock().expect("request gate poisoned");
        if sector_count > 0 {
            let spb = self.shared.cfg.sectors_per_block() as u64;
            let first = start_sector / spb;
            let last = (start_sector + sector_count as u64 - 1) / spb;
            for blockno in first..=last {
                tracing::trace!(target: "blockcache", block = blockno, "invalidate before write");
                port.request(Request::Invalidate(blockno))?;
            }
        }
        let r = self
            .shared
            .backend
            .write_sectors(src, start_sector, sector_count);
        drop(port);
        r
    }

    /// Wait until every request the worker has accepted so far, including the
    /// scan that may follow it, has completed.
    #[cfg(test)]
    pub(crate) fn drain_worker(&self) {
        let port = self.port.lock().expect("request gate poisoned");
        // Invalidating a block no backend can hold is a no-op, but its reply
        // orders after any in-progress scan.
        let _ = port.request(Request::Invalidate(u64::MAX));
    }

    #[cfg(test)]
    pub(crate) fn valid_blocks(&self) -> Vec<u64> {
        self.shared
            .slots
            .iter()
            .map(|s| s.claim())
            .filter(|st| st.valid)
            .map(|st| st.blockno)
            .collect()
    }
}
