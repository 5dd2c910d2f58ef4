// vim: tw=80
//! Transaction group bookkeeping
//!
//! Exactly one txg is open at a time.  Transactions join it by taking a
//! hold.  Closing a txg opens the next one, after which the closed txg is
//! quiesced: it can be synced once every hold on it has been released.

use crate::types::*;
use std::{
    collections::BTreeMap,
    pin::pin,
    sync::Mutex
};
use tokio::sync::{Notify, watch};
use tracing::trace;

#[derive(Debug)]
struct Inner {
    open: TxgT,
    /// Outstanding holds by txg
    holds: BTreeMap<TxgT, u64>,
    /// Bytes dirtied by txg
    dirty: BTreeMap<TxgT, u64>,
    /// Space reserved by transactions, by txg and directory
    inflight: BTreeMap<TxgT, BTreeMap<DirId, u64>>,
}

#[derive(Debug)]
pub struct TxgEngine {
    inner: Mutex<Inner>,
    quiesced: Notify,
    synced: watch::Sender<TxgT>,
}

impl TxgEngine {
    /// Record that `txg` dirtied `bytes` more bytes
    pub fn add_dirty(&self, txg: TxgT, bytes: u64) {
        *self.inner.lock().unwrap().dirty.entry(txg).or_default() += bytes;
    }

    /// Close the open txg, opening the next one.  Does nothing if `txg` is
    /// already closed.
    pub fn close(&self, txg: TxgT) {
        let mut g = self.inner.lock().unwrap();
        if g.open == txg {
            g.open = txg + 1;
            trace!(%txg, "closed");
        }
    }

    /// Bytes dirtied so far in `txg`
    pub fn dirty(&self, txg: TxgT) -> u64 {
        self.inner.lock().unwrap().dirty.get(&txg).cloned().unwrap_or(0)
    }

    /// Join the open txg
    pub fn hold(&self) -> TxgT {
        let mut g = self.inner.lock().unwrap();
        let txg = g.open;
        *g.holds.entry(txg).or_default() += 1;
        txg
    }

    /// Space reserved by every transaction that hasn't synced yet
    pub fn inflight(&self) -> u64 {
        self.inner.lock().unwrap()
            .inflight.values()
            .flat_map(BTreeMap::values)
            .sum()
    }

    /// Like [`inflight`](Self::inflight), but only for one directory
    pub fn inflight_dir(&self, dir: DirId) -> u64 {
        self.inner.lock().unwrap()
            .inflight.values()
            .filter_map(|m| m.get(&dir))
            .sum()
    }

    /// Forget everything about txgs up to and including `txg`, which is now
    /// durable.
    pub fn mark_synced(&self, txg: TxgT) {
        {
            let mut g = self.inner.lock().unwrap();
            let later = g.holds.split_off(&(txg + 1));
            debug_assert!(g.holds.values().all(|h| *h == 0));
            g.holds = later;
            g.dirty = g.dirty.split_off(&(txg + 1));
            g.inflight = g.inflight.split_off(&(txg + 1));
        }
        self.synced.send_replace(txg);
        trace!(%txg, "synced");
    }

    pub fn new(synced: TxgT) -> Self {
        let inner = Inner {
            open: synced + 1,
            holds: BTreeMap::new(),
            dirty: BTreeMap::new(),
            inflight: BTreeMap::new()
        };
        let (synced, _) = watch::channel(synced);
        TxgEngine {
            inner: Mutex::new(inner),
            quiesced: Notify::new(),
            synced
        }
    }

    pub fn open_txg(&self) -> TxgT {
        self.inner.lock().unwrap().open
    }

    /// Wait until no transaction holds `txg`.  `txg` must be closed.
    pub async fn quiesce(&self, txg: TxgT) {
        loop {
            let mut notified = pin!(self.quiesced.notified());
            notified.as_mut().enable();
            {
                let g = self.inner.lock().unwrap();
                debug_assert!(txg < g.open);
                if g.holds.get(&txg).cloned().unwrap_or(0) == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn release(&self, txg: TxgT) {
        let mut g = self.inner.lock().unwrap();
        let h = g.holds.entry(txg).or_default();
        debug_assert!(*h > 0);
        *h = h.saturating_sub(1);
        if *h == 0 && txg < g.open {
            drop(g);
            self.quiesced.notify_waiters();
        }
    }

    /// Reserve `bytes` of space for `dir` in `txg`, which must be held
    pub fn reserve(&self, txg: TxgT, dir: DirId, bytes: u64) {
        let mut g = self.inner.lock().unwrap();
        *g.inflight.entry(txg).or_default().entry(dir).or_default() += bytes;
    }

    pub fn synced_txg(&self) -> TxgT {
        *self.synced.borrow()
    }

    /// Wait until `txg` is durable
    pub async fn wait_synced(&self, txg: TxgT) -> Result<()> {
        let mut rx = self.synced.subscribe();
        rx.wait_for(|synced| *synced >= txg)
            .await
            .map(drop)
            .map_err(|_| Error::Shutdown)
    }
}

// LCOV_EXCL_STOP
