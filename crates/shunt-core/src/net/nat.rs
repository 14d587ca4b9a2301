//! UDP NAT table with per-key singleflight dial coordination.
//!
//! Keyed by the stringified inbound source address. The first handler to miss
//! on a key becomes the owner and dials the outbound; concurrent handlers for
//! the same key park on a notifier and re-look-up once the owner finishes,
//! so a burst of packets from one source costs exactly one dial.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use super::stats::TrackedDatagram;

/// Per-key singleflight: at most one owner per key; everyone else waits for
/// the owner's broadcast and re-checks.
#[derive(Default)]
pub struct Flight {
    inflight: DashMap<String, Arc<Notify>>,
}

impl Flight {
    pub fn new() -> Self {
        Self::default()
    }

    /// First caller for `key` gets `(notify, true)` and owns the flight;
    /// later callers get `(notify, false)` and must wait on it.
    pub fn acquire(&self, key: &str) -> (Arc<Notify>, bool) {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(v) => {
                let notify = Arc::new(Notify::new());
                v.insert(notify.clone());
                (notify, true)
            }
        }
    }

    /// Owner-side release: drops the token, then wakes every waiter.
    pub fn complete(&self, key: &str, notify: &Notify) {
        self.inflight.remove(key);
        notify.notify_waiters();
    }
}

/// One installed outbound endpoint plus its reply pump.
pub struct NatEntry {
    datagram: Arc<TrackedDatagram>,
    last_seen: Mutex<Instant>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl NatEntry {
    pub fn new(datagram: Arc<TrackedDatagram>, pump: JoinHandle<()>) -> Arc<Self> {
        Arc::new(Self {
            datagram,
            last_seen: Mutex::new(Instant::now()),
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn datagram(&self) -> Arc<TrackedDatagram> {
        self.datagram.clone()
    }

    fn refresh(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

impl Drop for NatEntry {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Keyed map of live UDP outbound endpoints.
#[derive(Default)]
pub struct NatTable {
    entries: DashMap<String, Arc<NatEntry>>,
    flight: Flight,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an entry and refreshes its idle timer.
    pub fn get(&self, key: &str) -> Option<Arc<NatEntry>> {
        let entry = self.entries.get(key)?.clone();
        entry.refresh();
        Some(entry)
    }

    pub fn set(&self, key: &str, entry: Arc<NatEntry>) {
        self.entries.insert(key.to_string(), entry);
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Singleflight token for the dial on `key`.
    pub fn get_or_create_lock(&self, key: &str) -> (Arc<Notify>, bool) {
        self.flight.acquire(key)
    }

    /// Owner releases the dial token and wakes waiters, whether or not an
    /// entry was installed.
    pub fn release_lock(&self, key: &str, notify: &Notify) {
        self.flight.complete(key, notify);
    }

    /// Evicts entries idle longer than `timeout`. Returns how many went.
    pub fn evict_idle(&self, timeout: Duration) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().idle() > timeout)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            debug!(key = %key, "udp session expired");
            self.entries.remove(&key);
        }
        count
    }

    /// Background idle sweeper. The handle owns the loop; abort to stop.
    pub fn start_sweeper(self: Arc<Self>, timeout: Duration) -> JoinHandle<()> {
        let table = self;
        tokio::spawn(async move {
            let period = (timeout / 2).max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                table.evict_idle(timeout);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn flight_elects_exactly_one_owner() {
        let flight = Arc::new(Flight::new());
        let owners = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let flight = flight.clone();
            let owners = owners.clone();
            let done = done.clone();
            handles.push(tokio::spawn(async move {
                let (notify, owner) = flight.acquire("k");
                if owner {
                    owners.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    flight.complete("k", &notify);
                } else {
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    notified.await;
                }
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(owners.load(Ordering::SeqCst), 1);
        assert_eq!(done.load(Ordering::SeqCst), 32);
    }

    #[tokio::test]
    async fn second_acquire_after_complete_is_owner_again() {
        let flight = Flight::new();
        let (notify, owner) = flight.acquire("k");
        assert!(owner);
        flight.complete("k", &notify);
        let (_notify, owner) = flight.acquire("k");
        assert!(owner);
    }
}
