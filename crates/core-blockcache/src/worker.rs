//! Cache worker: the single thread allowed to fill, evict and invalidate
//! slots. Readers funnel work to it through the bounded request channel and
//! block on the reply; after serving a read (or an explicit rescan) it makes
//! one best-effort readahead pass over the slot table.

use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::{BackendError, Shared};

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) enum Request {
    /// Ensure the block is cached; replies with the backend result.
    Read(u64),
    /// Drop any cached copy of the block; always replies `Ok`.
    Invalidate(u64),
    /// Ack immediately, then run a readahead scan.
    Rescan,
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    req_rx: Receiver<Request>,
    done_tx: Sender<Result<(), BackendError>>,
) {
    thread::Builder::new()
        .name("blkcache".into())
        .spawn(move || {
            Worker {
                shared,
                fifo_pos: 0,
                next_stats_log: Instant::now() + STATS_LOG_INTERVAL,
            }
            .run(req_rx, done_tx)
        })
        .expect("failed to spawn cache worker");
}

struct Worker {
    shared: Arc<Shared>,
    /// Next eviction candidate; only the worker reads or advances it.
    fifo_pos: usize,
    next_stats_log: Instant,
}

impl Worker {
    fn run(mut self, req_rx: Receiver<Request>, done_tx: Sender<Result<(), BackendError>>) {
        // Receive fails only once every cache handle is gone.
        while let Ok(req) = req_rx.recv() {
            let mut want_scan = false;
            match req {
                Request::Read(blockno) => {
                    trace!(target: "blockcache.worker", block = blockno, "read request");
                    let r = self.read_block(blockno);
                    let _ = done_tx.send(r);
                    want_scan = true;
                }
                Request::Invalidate(blockno) => {
                    trace!(target: "blockcache.worker", block = blockno, "invalidate request");
                    self.invalidate(blockno);
                    let _ = done_tx.send(Ok(()));
                    // No scan here: a just-invalidated range must not be
                    // pre-read straight back in.
                }
                Request::Rescan => {
                    let _ = done_tx.send(Ok(()));
                    want_scan = true;
                }
            }
            if want_scan {
                self.scan();
                self.maybe_log_stats();
            }
        }
    }

    /// Fill one slot with `blockno` unless some slot already holds it.
    fn read_block(&mut self, blockno: u64) -> Result<(), BackendError> {
        let shared = Arc::clone(&self.shared);
        for (i, slot) in shared.slots.iter().enumerate() {
            let st = slot.claim();
            if st.valid && st.blockno == blockno {
                trace!(target: "blockcache.worker", block = blockno, slot = i, "already cached");
                return Ok(());
            }
        }
        // Pick the eviction victim: walk the FIFO cursor past any slot that
        // is currently claimed by a reader.
        let count = shared.slots.len();
        let (pos, mut st) = loop {
            match shared.slots[self.fifo_pos].try_claim() {
                Some(guard) => break (self.fifo_pos, guard),
                None => self.fifo_pos = (self.fifo_pos + 1) % count,
            }
        };
        st.valid = false;
        st.touched = false;
        st.blockno = blockno;
        let spb = shared.cfg.sectors_per_block();
        let r = shared
            .backend
            .read_sectors(&mut st.data, blockno * spb as u64, spb);
        match &r {
            Ok(()) => {
                st.valid = true;
                trace!(target: "blockcache.worker", block = blockno, slot = pos, "filled");
            }
            Err(e) => {
                debug!(target: "blockcache.worker", block = blockno, error = %e, "backend read failed, slot left invalid");
            }
        }
        drop(st);
        self.fifo_pos = (pos + 1) % count;
        r
    }

    /// Drop every cached copy of `blockno`. Claims each slot with a yielding
    /// spin; readers only hold a slot for the duration of one copy.
    fn invalidate(&self, blockno: u64) {
        for slot in self.shared.slots.iter() {
            let mut st = loop {
                match slot.try_claim() {
                    Some(guard) => break guard,
                    None => thread::yield_now(),
                }
            };
            if st.valid && st.blockno == blockno {
                st.valid = false;
            }
        }
    }

    /// Readahead: for every valid block a client has consumed, make sure its
    /// successor is cached too. Single pass, best effort; a slot we cannot
    /// claim right now is skipped and a failed pre-read only logs.
    fn scan(&mut self) {
        let shared = Arc::clone(&self.shared);
        let mut present = Vec::with_capacity(shared.slots.len());
        let mut wanted = Vec::new();
        for slot in shared.slots.iter() {
            if let Some(st) = slot.try_claim() {
                if st.valid {
                    present.push(st.blockno);
                    if st.touched {
                        wanted.push(st.blockno + 1);
                    }
                }
            }
        }
        for next in wanted {
            if present.contains(&next) {
                continue;
            }
            trace!(target: "blockcache.worker", block = next, "readahead");
            match self.read_block(next) {
                Ok(()) => present.push(next),
                Err(e) => {
                    debug!(target: "blockcache.worker", block = next, error = %e, "readahead failed");
                }
            }
        }
    }

    fn maybe_log_stats(&mut self) {
        use std::sync::atomic::Ordering::Relaxed;
        let now = Instant::now();
        if now < self.next_stats_log {
            return;
        }
        let misses = self.shared.stats.misses.load(Relaxed);
        if misses == 0 {
            return;
        }
        self.next_stats_log = now + STATS_LOG_INTERVAL;
        let reads = self.shared.stats.reads.load(Relaxed);
        let hit_pct = 100.0 - (misses as f64 / reads.max(1) as f64) * 100.0;
        info!(target: "blockcache.worker", reads, misses, hit_pct = format_args!("{hit_pct:.1}"), "cache stats");
    }
}
