//! Lane scheduler — named bounded concurrency for expensive work.
//!
//! `acquire` suspends when a lane is saturated and wakes waiters in strict
//! FIFO order. A cancelled waiter (dropped future) is removed and never
//! wakes; a permit is released on every exit path via RAII. Holder count
//! never exceeds the configured concurrency.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const CANCELLED: u8 = 2;

struct Waiter {
    id: u64,
    state: Arc<AtomicU8>,
    tx: oneshot::Sender<()>,
}

struct LaneState {
    holders: usize,
    capacity: usize,
    waiters: VecDeque<Waiter>,
}

struct Lane {
    name: String,
    state: Mutex<LaneState>,
}

impl Lane {
    /// Release one permit: hand it to the first live waiter, else decrement.
    fn release(&self) {
        let mut state = self.state.lock();
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    if waiter
                        .state
                        .compare_exchange(WAITING, GRANTED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        // Holder count transfers to the waiter. If its
                        // receiver is already gone, its guard releases.
                        let _ = waiter.tx.send(());
                        return;
                    }
                    // Cancelled while queued; try the next one.
                }
                None => {
                    state.holders = state.holders.saturating_sub(1);
                    return;
                }
            }
        }
    }
}

/// RAII permit: dropping releases the lane slot.
pub struct LanePermit {
    lane: Arc<Lane>,
}

impl Drop for LanePermit {
    fn drop(&mut self) {
        self.lane.release();
    }
}

/// Removes a cancelled waiter, or releases a permit granted after
/// cancellation won the race.
struct WaitGuard {
    lane: Arc<Lane>,
    id: u64,
    state: Arc<AtomicU8>,
    armed: bool,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self
            .state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut state = self.lane.state.lock();
            state.waiters.retain(|w| w.id != self.id);
        } else {
            // Already granted: we own a permit we'll never use.
            self.lane.release();
        }
    }
}

/// The scheduler: lanes are created on first use with the configured (or
/// default 1) concurrency.
pub struct LaneScheduler {
    lanes: DashMap<String, Arc<Lane>>,
    concurrency: DashMap<String, usize>,
    next_waiter: AtomicU64,
}

impl Default for LaneScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl LaneScheduler {
    pub fn new() -> Self {
        Self {
            lanes: DashMap::new(),
            concurrency: DashMap::new(),
            next_waiter: AtomicU64::new(1),
        }
    }

    /// Declare (or hot-reload) a lane's concurrency.
    pub fn set_concurrency(&self, name: &str, concurrency: usize) {
        let concurrency = concurrency.max(1);
        self.concurrency.insert(name.to_string(), concurrency);
        let Some(lane) = self.lanes.get(name).map(|r| r.value().clone()) else {
            return;
        };
        let to_wake = {
            let mut state = lane.state.lock();
            state.capacity = concurrency;
            state.capacity.saturating_sub(state.holders)
        };
        // Raised capacity frees slots for queued waiters.
        for _ in 0..to_wake {
            let granted = {
                let mut state = lane.state.lock();
                if state.holders < state.capacity && !state.waiters.is_empty() {
                    state.holders += 1;
                    true
                } else {
                    false
                }
            };
            if granted {
                lane.release();
            } else {
                break;
            }
        }
    }

    fn lane(&self, name: &str) -> Arc<Lane> {
        self.lanes
            .entry(name.to_string())
            .or_insert_with(|| {
                let capacity = self.concurrency.get(name).map(|c| *c).unwrap_or(1);
                Arc::new(Lane {
                    name: name.to_string(),
                    state: Mutex::new(LaneState {
                        holders: 0,
                        capacity,
                        waiters: VecDeque::new(),
                    }),
                })
            })
            .clone()
    }

    /// Acquire a permit, suspending FIFO behind current holders.
    pub async fn acquire(&self, name: &str) -> LanePermit {
        let lane = self.lane(name);
        loop {
            let wait = {
                let mut state = lane.state.lock();
                if state.holders < state.capacity {
                    state.holders += 1;
                    None
                } else {
                    let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
                    let flag = Arc::new(AtomicU8::new(WAITING));
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(Waiter {
                        id,
                        state: flag.clone(),
                        tx,
                    });
                    Some((id, flag, rx))
                }
            };

            match wait {
                None => {
                    debug!(lane = %lane.name, "lane permit acquired");
                    return LanePermit { lane };
                }
                Some((id, flag, rx)) => {
                    let mut guard = WaitGuard {
                        lane: lane.clone(),
                        id,
                        state: flag,
                        armed: true,
                    };
                    match rx.await {
                        Ok(()) => {
                            guard.armed = false;
                            debug!(lane = %lane.name, "lane permit granted after wait");
                            return LanePermit { lane };
                        }
                        Err(_) => {
                            // Sender vanished without granting; retry.
                            guard.armed = false;
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Current holder count for a lane (diagnostics).
    pub fn holders(&self, name: &str) -> usize {
        self.lanes
            .get(name)
            .map(|l| l.state.lock().holders)
            .unwrap_or(0)
    }
}
