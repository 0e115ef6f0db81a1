//! Deterministic interleaving of host hooks via token-passing.
//!
//! Runs per-CPU hooks and administrative operations on separate OS threads,
//! with only one thread active at a time. A PRNG-driven scheduler controls
//! which thread gets the "token" at each yield point, so a given seed
//! always explores the same interleaving of attach, detach and the
//! per-CPU entry protocol.
//!
//! ## Architecture
//!
//! The orchestrator spawns one worker per participant. Workers block on a
//! condvar until the PRNG selects them. The controller calls
//! [`maybe_yield`] between the steps of every protocol (after announcing
//! itself on a CPU, while waiting for quiescence, inside kfuncs), which
//! releases the token and lets the PRNG pick the next worker.
//!
//! A worker that would block on a lock held by another worker must not
//! keep the token, so controller locks are taken through [`lock`],
//! [`read`] and [`write`], which spin on `try_*` and yield between
//! attempts while a ring is installed on the current thread.
//!
//! Outside a ring every function here is a no-op or a plain lock.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::{
    Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

/// Worker identity within a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

/// Token-passing scheduler.
///
/// Workers block on a condvar until selected by the PRNG. Only one worker
/// is active at a time.
pub struct TokenRing {
    mu: Mutex<TokenState>,
    cv: Condvar,
}

struct TokenState {
    /// Which worker currently holds the token.
    active: Option<WorkerId>,
    /// Bitmask of workers that have finished (supports up to 64 workers).
    finished_mask: u64,
    total: usize,
    rng: SmallRng,
    nr_yields: u64,
}

impl TokenState {
    fn is_finished(&self, id: WorkerId) -> bool {
        self.finished_mask & (1u64 << id.0) != 0
    }

    fn mark_finished(&mut self, id: WorkerId) {
        self.finished_mask |= 1u64 << id.0;
    }

    fn n_finished(&self) -> usize {
        self.finished_mask.count_ones() as usize
    }

    fn all_done(&self) -> bool {
        self.n_finished() == self.total
    }

    /// Pick the next non-finished worker using PRNG.
    fn pick_next(&mut self) -> Option<WorkerId> {
        let n_remaining = self.total - self.n_finished();
        if n_remaining == 0 {
            return None;
        }
        let idx = (self.rng.next_u32() as usize) % n_remaining;
        (0..self.total)
            .map(WorkerId)
            .filter(|&id| !self.is_finished(id))
            .nth(idx)
    }
}

impl TokenRing {
    /// Create a new token ring for `total` workers.
    ///
    /// # Panics
    /// Panics if `total` is 0 or exceeds 64.
    pub fn new(total: usize, seed: u64) -> Self {
        assert!(
            total > 0 && total <= 64,
            "TokenRing supports 1-64 workers, got {total}"
        );
        TokenRing {
            mu: Mutex::new(TokenState {
                active: None,
                finished_mask: 0,
                total,
                rng: SmallRng::seed_from_u64(seed),
                nr_yields: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Orchestrator: select the first worker via PRNG and wake it.
    pub fn start(&self) {
        let mut state = self.mu.lock();
        state.active = state.pick_next();
        self.cv.notify_all();
    }

    /// Worker: block until this worker is selected.
    pub fn wait_for_token(&self, my_id: WorkerId) {
        let mut state = self.mu.lock();
        while state.active != Some(my_id) {
            self.cv.wait(&mut state);
        }
    }

    /// Worker: release the token, let the PRNG select the next worker
    /// (possibly this one again) and block until re-selected.
    pub fn yield_token(&self, my_id: WorkerId) {
        let mut state = self.mu.lock();
        debug_assert_eq!(state.active, Some(my_id));
        state.nr_yields += 1;
        state.active = state.pick_next();
        self.cv.notify_all();
        while state.active != Some(my_id) {
            self.cv.wait(&mut state);
        }
    }

    /// Worker: mark as finished and wake the next worker (or signal
    /// all-done to the orchestrator).
    pub fn finish(&self, my_id: WorkerId) {
        let mut state = self.mu.lock();
        debug_assert_eq!(state.active, Some(my_id));
        state.mark_finished(my_id);
        state.active = if state.all_done() {
            None
        } else {
            state.pick_next()
        };
        self.cv.notify_all();
    }

    /// Orchestrator: block until all workers have finished.
    pub fn wait_all_done(&self) {
        let mut state = self.mu.lock();
        while !state.all_done() {
            self.cv.wait(&mut state);
        }
    }

    /// Number of token hand-offs so far.
    pub fn nr_yields(&self) -> u64 {
        self.mu.lock().nr_yields
    }
}

#[derive(Clone, Copy)]
struct InterleaveCtx {
    ring: *const TokenRing,
    worker_id: WorkerId,
}

thread_local! {
    static INTERLEAVE_CTX: Cell<Option<InterleaveCtx>> = const { Cell::new(None) };
}

/// Install the ring on the current worker thread.
///
/// The ring must outlive the installation; [`run`] guarantees this by
/// uninstalling before its scope ends.
pub fn install(ring: &TokenRing, worker_id: WorkerId) {
    INTERLEAVE_CTX.with(|c| {
        c.set(Some(InterleaveCtx {
            ring: ring as *const TokenRing,
            worker_id,
        }));
    });
}

pub fn uninstall() {
    INTERLEAVE_CTX.with(|c| c.set(None));
}

/// Whether the current thread runs under a ring.
pub fn is_active() -> bool {
    INTERLEAVE_CTX.with(|c| c.get()).is_some()
}

/// Yield point. Hands the token to a PRNG-selected worker when the current
/// thread runs under a ring, otherwise does nothing.
pub fn maybe_yield() {
    let Some(ctx) = INTERLEAVE_CTX.with(|c| c.get()) else {
        return;
    };
    // SAFETY: `install` callers keep the ring alive until `uninstall`.
    let ring = unsafe { &*ctx.ring };
    ring.yield_token(ctx.worker_id);
}

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    if !is_active() {
        return mutex.lock();
    }
    loop {
        if let Some(guard) = mutex.try_lock() {
            return guard;
        }
        maybe_yield();
    }
}

pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    if !is_active() {
        return lock.read();
    }
    loop {
        if let Some(guard) = lock.try_read() {
            return guard;
        }
        maybe_yield();
    }
}

/// Read side that may nest inside another read guard on the same lock
/// even while a writer is waiting.
pub fn read_recursive<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    if !is_active() {
        return lock.read_recursive();
    }
    loop {
        if let Some(guard) = lock.try_read_recursive() {
            return guard;
        }
        maybe_yield();
    }
}

pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    if !is_active() {
        return lock.write();
    }
    loop {
        if let Some(guard) = lock.try_write() {
            return guard;
        }
        maybe_yield();
    }
}

/// Run each closure on its own thread under a fresh ring seeded with
/// `seed`, one at a time, switching at yield points. Returns the number of
/// token hand-offs.
///
/// A panicking worker still releases the token; the panic is re-raised
/// once every worker has finished.
pub fn run<'env>(seed: u64, workers: Vec<Box<dyn FnOnce() + Send + 'env>>) -> u64 {
    let ring = TokenRing::new(workers.len(), seed);
    let panics: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = workers
            .into_iter()
            .enumerate()
            .map(|(i, work)| {
                let ring = &ring;
                s.spawn(move || {
                    let id = WorkerId(i);
                    install(ring, id);
                    ring.wait_for_token(id);
                    let res = panic::catch_unwind(AssertUnwindSafe(work));
                    uninstall();
                    ring.finish(id);
                    res
                })
            })
            .collect();
        ring.start();
        ring.wait_all_done();
        handles
            .into_iter()
            .filter_map(|h| h.join().ok().and_then(Result::err))
            .collect()
    });
    if let Some(panic) = panics.into_iter().next() {
        panic::resume_unwind(panic);
    }
    ring.nr_yields()
}
