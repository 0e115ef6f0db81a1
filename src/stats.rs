//! Controller-wide counters.
//!
//! All counters are relaxed atomics bumped from the hooks; [`ScxStats::snapshot`]
//! produces a serializable copy for the demo binary and for tests.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::rq::ScxRqStats;

#[derive(Debug, Default)]
pub struct ScxStats {
    pub(crate) nr_attach: AtomicU64,
    pub(crate) nr_attach_rejected: AtomicU64,
    pub(crate) nr_detach: AtomicU64,
    /// Hook invocations that reached the policy.
    pub(crate) nr_hook_calls: AtomicU64,
    /// Hook invocations that found the extension disabled or bypassing.
    pub(crate) nr_bypassed: AtomicU64,
    pub(crate) nr_faults: AtomicU64,
    pub(crate) nr_duplicate_idle: AtomicU64,
    /// Backoff rounds spent waiting for CPUs to quiesce.
    pub(crate) nr_quiesce_spins: AtomicU64,
    pub(crate) nr_events_dropped: AtomicU64,
    pub(crate) nr_ticks: AtomicU64,
    pub(crate) nr_resched: AtomicU64,
    pub(crate) nr_prio_fallbacks: AtomicU64,
}

impl ScxStats {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn nr_attach(&self) -> u64 {
        self.nr_attach.load(Ordering::Relaxed)
    }

    pub fn nr_detach(&self) -> u64 {
        self.nr_detach.load(Ordering::Relaxed)
    }

    pub fn nr_faults(&self) -> u64 {
        self.nr_faults.load(Ordering::Relaxed)
    }

    pub fn nr_bypassed(&self) -> u64 {
        self.nr_bypassed.load(Ordering::Relaxed)
    }

    pub fn nr_quiesce_spins(&self) -> u64 {
        self.nr_quiesce_spins.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ScxStatsSnapshot {
        let ld = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ScxStatsSnapshot {
            nr_attach: ld(&self.nr_attach),
            nr_attach_rejected: ld(&self.nr_attach_rejected),
            nr_detach: ld(&self.nr_detach),
            nr_hook_calls: ld(&self.nr_hook_calls),
            nr_bypassed: ld(&self.nr_bypassed),
            nr_faults: ld(&self.nr_faults),
            nr_duplicate_idle: ld(&self.nr_duplicate_idle),
            nr_quiesce_spins: ld(&self.nr_quiesce_spins),
            nr_events_dropped: ld(&self.nr_events_dropped),
            nr_ticks: ld(&self.nr_ticks),
            nr_resched: ld(&self.nr_resched),
            nr_prio_fallbacks: ld(&self.nr_prio_fallbacks),
            fork: ForkAccountingSnapshot::default(),
            cpus: Vec::new(),
        }
    }
}

/// Balance of the fork path. Every `pre_fork` is matched by exactly one
/// `post_fork` or `cancel_fork`, and every `init_task(fork)` by exactly one
/// `exit_task` or a task that stays alive.
#[derive(Debug, Default)]
pub struct ForkAccounting {
    /// Outstanding reservations.
    pub(crate) reserved: AtomicU64,
    /// Children initialized by a policy and not yet exited.
    pub(crate) initialized: AtomicU64,
    pub(crate) nr_cancelled: AtomicU64,
    pub(crate) nr_failed: AtomicU64,
}

impl ForkAccounting {
    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn initialized(&self) -> u64 {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ForkAccountingSnapshot {
        ForkAccountingSnapshot {
            reserved: self.reserved(),
            initialized: self.initialized(),
            nr_cancelled: self.nr_cancelled.load(Ordering::Relaxed),
            nr_failed: self.nr_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForkAccountingSnapshot {
    pub reserved: u64,
    pub initialized: u64,
    pub nr_cancelled: u64,
    pub nr_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScxStatsSnapshot {
    pub nr_attach: u64,
    pub nr_attach_rejected: u64,
    pub nr_detach: u64,
    pub nr_hook_calls: u64,
    pub nr_bypassed: u64,
    pub nr_faults: u64,
    pub nr_duplicate_idle: u64,
    pub nr_quiesce_spins: u64,
    pub nr_events_dropped: u64,
    pub nr_ticks: u64,
    pub nr_resched: u64,
    pub nr_prio_fallbacks: u64,
    pub fork: ForkAccountingSnapshot,
    pub cpus: Vec<ScxRqStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let stats = ScxStats::default();
        ScxStats::inc(&stats.nr_attach);
        ScxStats::inc(&stats.nr_ticks);
        ScxStats::inc(&stats.nr_ticks);
        let snap = stats.snapshot();
        assert_eq!(snap.nr_attach, 1);
        assert_eq!(snap.nr_ticks, 2);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["nr_ticks"], 2);
        assert_eq!(json["fork"]["reserved"], 0);
    }
}
