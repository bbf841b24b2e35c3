use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::cancel::CancelToken;

/// How often a blocked `acquire` re-checks its cancellation token.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(25);

// ---------------------------------------------------------------------------
// MemoryManager — strict byte arbiter for in-flight slab data
// ---------------------------------------------------------------------------

/// Tracks available bytes for in-flight slab data.
///
/// The streaming producer acquires one redundant slab worth of memory before
/// reading, and the slab upload returns it progressively as shards land on
/// hosts. This caps total materialized shard data to approximately `limit`
/// bytes across all concurrent uploads.
///
/// A request larger than the limit is clamped to the limit so an oversized
/// redundancy setting can still proceed — it just acquires the entire budget
/// and runs alone.
pub struct MemoryManager {
    state: Mutex<State>,
    freed: Condvar,
    limit: usize,
}

struct State {
    available: usize,
}

impl MemoryManager {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(MemoryManager {
            state: Mutex::new(State { available: limit }),
            freed: Condvar::new(),
            limit,
        })
    }

    /// Block until `bytes` are available, then subtract them. Returns `None`
    /// if `interrupt` is canceled before the grant is made.
    pub fn acquire(self: &Arc<Self>, bytes: usize, interrupt: &CancelToken) -> Option<MemoryGrant> {
        let bytes = bytes.min(self.limit);
        let mut state = self.lock_state();
        loop {
            if interrupt.is_canceled() {
                return None;
            }
            if state.available >= bytes {
                state.available -= bytes;
                return Some(MemoryGrant {
                    manager: Arc::clone(self),
                    remaining: bytes,
                });
            }
            let (guard, _timeout) = self
                .freed
                .wait_timeout(state, ACQUIRE_POLL_INTERVAL)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    /// Bytes currently available for new grants.
    pub fn available(&self) -> usize {
        self.lock_state().available
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let mut state = self.lock_state();
        state.available = (state.available + bytes).min(self.limit);
        self.freed.notify_all();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A granted byte budget. Bytes may be returned progressively with
/// [`release_some`]; anything still held is returned on drop.
///
/// [`release_some`]: MemoryGrant::release_some
pub struct MemoryGrant {
    manager: Arc<MemoryManager>,
    remaining: usize,
}

impl MemoryGrant {
    /// Return up to `bytes` of the grant to the pool.
    pub fn release_some(&mut self, bytes: usize) {
        let bytes = bytes.min(self.remaining);
        self.remaining -= bytes;
        self.manager.release(bytes);
    }

    /// Bytes of this grant not yet returned.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Drop for MemoryGrant {
    fn drop(&mut self) {
        self.manager.release(self.remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn never() -> CancelToken {
        CancelToken::new()
    }

    #[test]
    fn acquire_release_cycle() {
        let mgr = MemoryManager::new(1024);
        let g1 = mgr.acquire(512, &never()).unwrap();
        let g2 = mgr.acquire(512, &never()).unwrap();
        assert_eq!(mgr.available(), 0);
        drop(g1);
        drop(g2);
        assert_eq!(mgr.available(), 1024);
        let g3 = mgr.acquire(1024, &never()).unwrap();
        drop(g3);
        assert_eq!(mgr.available(), 1024);
    }

    #[test]
    fn acquire_blocks_and_unblocks() {
        let mgr = MemoryManager::new(100);
        let held = mgr.acquire(100, &never()).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let acquired2 = Arc::clone(&acquired);
        let mgr2 = Arc::clone(&mgr);

        let handle = std::thread::spawn(move || {
            let g = mgr2.acquire(50, &never()).unwrap();
            acquired2.store(true, Ordering::SeqCst);
            drop(g);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst), "should be blocked");

        drop(held);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst), "should have acquired");
    }

    #[test]
    fn oversized_request_clamps_to_limit() {
        let mgr = MemoryManager::new(64);
        let g = mgr.acquire(128, &never()).unwrap();
        assert_eq!(g.remaining(), 64);
        drop(g);
        assert_eq!(mgr.available(), 64);
    }

    #[test]
    fn canceled_acquire_unblocks() {
        let mgr = MemoryManager::new(100);
        let held = mgr.acquire(100, &never()).unwrap();

        let interrupt = CancelToken::new();
        let interrupt2 = interrupt.clone();
        let mgr2 = Arc::clone(&mgr);
        let handle = std::thread::spawn(move || mgr2.acquire(50, &interrupt2).is_none());

        std::thread::sleep(Duration::from_millis(50));
        interrupt.cancel();
        assert!(handle.join().unwrap(), "acquire should return None");
        drop(held);
    }

    #[test]
    fn release_some_returns_progressively() {
        let mgr = MemoryManager::new(1000);
        let mut g = mgr.acquire(800, &never()).unwrap();
        g.release_some(300);
        assert_eq!(g.remaining(), 500);
        assert_eq!(mgr.available(), 500);
        // Over-release is clamped to what is held.
        g.release_some(9999);
        assert_eq!(g.remaining(), 0);
        assert_eq!(mgr.available(), 1000);
        drop(g);
        assert_eq!(mgr.available(), 1000);
    }

    #[test]
    fn concurrent_stress_never_exceeds_limit() {
        let cap = 500usize;
        let mgr = MemoryManager::new(cap);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let m = Arc::clone(&mgr);
            let inf = Arc::clone(&in_flight);
            let pk = Arc::clone(&peak);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let chunk = 100;
                    let g = m.acquire(chunk, &CancelToken::new()).unwrap();
                    let current = inf.fetch_add(chunk, Ordering::SeqCst) + chunk;
                    pk.fetch_max(current, Ordering::Relaxed);
                    std::thread::yield_now();
                    inf.fetch_sub(chunk, Ordering::SeqCst);
                    drop(g);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert!(
            peak.load(Ordering::SeqCst) <= cap,
            "peak {} exceeded cap {}",
            peak.load(Ordering::SeqCst),
            cap
        );
        assert_eq!(mgr.available(), cap);
    }
}
