//! Per-CPU run-queue extension state.
//!
//! One [`ScxRq`] exists per CPU for the lifetime of the controller. Its
//! fields are written by the CPU that owns it; the only remote writers are
//! the attach path (resetting idle bookkeeping before a new policy is
//! published) and `cpuperf_set`, both through atomics.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::types::{CpuId, TimeNs};

#[derive(Debug)]
pub struct ScxRq {
    cpu: CpuId,
    online: AtomicBool,
    idle: AtomicBool,
    /// `(generation << 1) | idle`: what the policy of that generation was
    /// last told about this CPU.
    reported_idle: AtomicU64,
    cpuperf_target: AtomicU32,
    /// Callbacks currently executing on behalf of this CPU.
    pub(crate) inflight: AtomicU32,
    /// Last generation whose detach observed this CPU quiescent.
    acked_gen: AtomicU64,
    resched: AtomicBool,
    clock: AtomicU64,
    nr_idle_edges: AtomicU64,
    nr_idle_reports: AtomicU64,
}

/// Serializable view of one run queue.
#[derive(Debug, Clone, Serialize)]
pub struct ScxRqStats {
    pub cpu: CpuId,
    pub online: bool,
    pub idle: bool,
    pub cpuperf_target: u32,
    pub clock: TimeNs,
    pub nr_idle_edges: u64,
    pub nr_idle_reports: u64,
    pub acked_gen: u64,
}

impl ScxRq {
    pub fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            online: AtomicBool::new(true),
            idle: AtomicBool::new(false),
            reported_idle: AtomicU64::new(0),
            cpuperf_target: AtomicU32::new(0),
            inflight: AtomicU32::new(0),
            acked_gen: AtomicU64::new(0),
            resched: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            nr_idle_edges: AtomicU64::new(0),
            nr_idle_reports: AtomicU64::new(0),
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub(crate) fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }

    /// The CPU's actual idle state as last reported by the host.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Record the new idle state. Returns the previous one.
    pub(crate) fn swap_idle(&self, idle: bool) -> bool {
        self.idle.swap(idle, Ordering::AcqRel)
    }

    pub(crate) fn reported_idle(&self, generation: u64) -> Option<bool> {
        let raw = self.reported_idle.load(Ordering::Acquire);
        (raw >> 1 == generation).then_some(raw & 1 != 0)
    }

    pub(crate) fn set_reported_idle(&self, generation: u64, idle: bool) {
        self.reported_idle
            .store((generation << 1) | idle as u64, Ordering::Release);
    }

    pub fn cpuperf_target(&self) -> u32 {
        self.cpuperf_target.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpuperf_target(&self, perf: u32) {
        self.cpuperf_target.store(perf, Ordering::Release);
    }

    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::SeqCst)
    }

    pub fn acked_gen(&self) -> u64 {
        self.acked_gen.load(Ordering::Acquire)
    }

    pub(crate) fn ack(&self, generation: u64) {
        self.acked_gen.store(generation, Ordering::Release);
    }

    pub(crate) fn request_resched(&self) {
        self.resched.store(true, Ordering::Release);
    }

    /// Consume a pending reschedule request.
    pub fn take_resched(&self) -> bool {
        self.resched.swap(false, Ordering::AcqRel)
    }

    pub fn clock(&self) -> TimeNs {
        self.clock.load(Ordering::Relaxed)
    }

    pub(crate) fn advance_clock(&self, delta: TimeNs) -> TimeNs {
        self.clock.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub(crate) fn count_idle_edge(&self) {
        self.nr_idle_edges.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_idle_report(&self) {
        self.nr_idle_reports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn nr_idle_edges(&self) -> u64 {
        self.nr_idle_edges.load(Ordering::Relaxed)
    }

    pub fn nr_idle_reports(&self) -> u64 {
        self.nr_idle_reports.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ScxRqStats {
        ScxRqStats {
            cpu: self.cpu,
            online: self.is_online(),
            idle: self.is_idle(),
            cpuperf_target: self.cpuperf_target(),
            clock: self.clock(),
            nr_idle_edges: self.nr_idle_edges(),
            nr_idle_reports: self.nr_idle_reports(),
            acked_gen: self.acked_gen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_idle_is_generation_tagged() {
        let rq = ScxRq::new(CpuId(0));
        assert_eq!(rq.reported_idle(1), None);
        rq.set_reported_idle(1, true);
        assert_eq!(rq.reported_idle(1), Some(true));
        assert_eq!(rq.reported_idle(2), None);
        rq.set_reported_idle(2, false);
        assert_eq!(rq.reported_idle(2), Some(false));
    }

    #[test]
    fn test_resched_is_consumed_once() {
        let rq = ScxRq::new(CpuId(0));
        rq.request_resched();
        assert!(rq.take_resched());
        assert!(!rq.take_resched());
    }
}
