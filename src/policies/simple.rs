//! A simple vtime policy.
//!
//! Every task goes to one shared queue, ordered by virtual time in vtime
//! mode or in arrival order in FIFO mode. A waking task that finds an idle
//! CPU in its affinity mask goes straight to that CPU's local queue. Busy
//! CPUs run at full performance, idle ones drop their target to zero.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ExitInfo;
use crate::kfuncs::OpsCtx;
use crate::ops::{enq_flags, InitTaskArgs, OpsFlags, SchedExtOps};
use crate::task::Task;
use crate::types::{CpuId, DsqId, Vtime, SCX_CPUPERF_ONE, SCX_SLICE_DFL, SCX_WEIGHT_DFL};

/// The shared queue all non-local insertions go to.
pub const SHARED_DSQ: DsqId = DsqId(0);

#[derive(Debug, Default)]
pub struct SimplePolicy {
    fifo: bool,
    partial: bool,
    vtime_now: AtomicU64,
    nr_local: AtomicU64,
    nr_global: AtomicU64,
    nr_ticks: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimpleStats {
    pub nr_local: u64,
    pub nr_global: u64,
    pub nr_ticks: u64,
    pub vtime_now: u64,
}

impl SimplePolicy {
    pub fn new(fifo: bool) -> Self {
        Self {
            fifo,
            ..Default::default()
        }
    }

    /// Only claim tasks that asked for `SCHED_EXT`.
    pub fn switch_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn stats(&self) -> SimpleStats {
        SimpleStats {
            nr_local: self.nr_local.load(Ordering::Relaxed),
            nr_global: self.nr_global.load(Ordering::Relaxed),
            nr_ticks: self.nr_ticks.load(Ordering::Relaxed),
            vtime_now: self.vtime_now.load(Ordering::Relaxed),
        }
    }

    fn vtime_now(&self) -> Vtime {
        Vtime(self.vtime_now.load(Ordering::Relaxed))
    }

    /// Charge the part of the slice `p` used since it was last charged and
    /// refill the slice.
    fn charge(&self, p: &Task) {
        let used = SCX_SLICE_DFL.saturating_sub(p.scx.slice());
        p.scx.set_slice(SCX_SLICE_DFL);
        if self.fifo || used == 0 {
            return;
        }
        let weight = p.scx.weight().max(1) as u64;
        let charge = used * SCX_WEIGHT_DFL as u64 / weight;
        let vtime = Vtime(p.scx.dsq_vtime().0.saturating_add(charge));
        p.scx.set_dsq_vtime(vtime);
        self.advance_vtime_now(vtime);
    }

    fn advance_vtime_now(&self, vtime: Vtime) {
        let mut cur = self.vtime_now.load(Ordering::Relaxed);
        while Vtime(cur) < vtime {
            match self.vtime_now.compare_exchange_weak(
                cur,
                vtime.0,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl SchedExtOps for SimplePolicy {
    fn name(&self) -> &str {
        "simple"
    }

    fn flags(&self) -> OpsFlags {
        let mut flags =
            OpsFlags::HAS_UPDATE_IDLE | OpsFlags::KEEP_BUILTIN_IDLE | OpsFlags::HAS_CPU_HOTPLUG;
        if self.partial {
            flags.insert(OpsFlags::SWITCH_PARTIAL);
        }
        flags
    }

    fn init(&self, cx: &OpsCtx<'_>) -> Result<()> {
        if cx.nr_cpu_ids() == 0 {
            bail!("no CPUs to schedule on");
        }
        info!(fifo = self.fifo, nr_cpus = cx.nr_cpu_ids(), "simple policy starting");
        Ok(())
    }

    fn exit(&self, info: &ExitInfo) {
        info!(kind = ?info.kind, "simple policy exiting: {:?}", self.stats());
    }

    fn init_task(&self, _cx: &OpsCtx<'_>, p: &Task, _args: InitTaskArgs) -> Result<()> {
        p.scx.set_weight(SCX_WEIGHT_DFL);
        Ok(())
    }

    fn enable(&self, _cx: &OpsCtx<'_>, p: &Task) {
        p.scx.set_dsq_vtime(self.vtime_now());
    }

    fn enqueue(&self, cx: &OpsCtx<'_>, p: &Task, flags: u64) -> DsqId {
        // Nonzero only on a re-enqueue after the slice ran out.
        self.charge(p);

        if flags & enq_flags::WAKEUP != 0 {
            if let Some(cpu) = cx.pick_idle_cpu(&p.cpus_allowed()) {
                self.nr_local.fetch_add(1, Ordering::Relaxed);
                return DsqId::local_on(cpu);
            }
        }

        self.nr_global.fetch_add(1, Ordering::Relaxed);
        if !self.fifo {
            // Limit the budget a long sleeper can accumulate to one slice.
            let floor = Vtime(self.vtime_now().0.saturating_sub(SCX_SLICE_DFL));
            if p.scx.dsq_vtime() < floor {
                p.scx.set_dsq_vtime(floor);
            }
        }
        SHARED_DSQ
    }

    fn quiescent(&self, _cx: &OpsCtx<'_>, p: &Task, _deq_flags: u64) {
        self.charge(p);
    }

    fn tick(&self, cx: &OpsCtx<'_>, _p: &Task) {
        self.nr_ticks.fetch_add(1, Ordering::Relaxed);
        if let Some(cpu) = cx.cpu() {
            cx.cpuperf_set(cpu, SCX_CPUPERF_ONE);
        }
    }

    fn update_idle(&self, cx: &OpsCtx<'_>, cpu: CpuId, idle: bool) {
        cx.cpuperf_set(cpu, if idle { 0 } else { SCX_CPUPERF_ONE });
    }

    fn cpu_online(&self, _cx: &OpsCtx<'_>, cpu: CpuId) {
        debug!(%cpu, "simple: CPU online");
    }

    fn cpu_offline(&self, cx: &OpsCtx<'_>, cpu: CpuId) {
        debug!(%cpu, "simple: CPU offline");
        cx.cpuperf_set(cpu, 0);
    }

    fn core_sched_before(&self, _cx: &OpsCtx<'_>, a: &Task, b: &Task) -> Option<bool> {
        if self.fifo {
            return None;
        }
        Some(a.scx.dsq_vtime() < b.scx.dsq_vtime())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScxConfig;
    use crate::controller::ScxController;
    use crate::ops::deq_flags;
    use crate::types::{Pid, SchedClass};

    #[test]
    fn test_vtime_now_only_advances() {
        let policy = SimplePolicy::new(false);
        policy.advance_vtime_now(Vtime(100));
        policy.advance_vtime_now(Vtime(50));
        assert_eq!(policy.vtime_now(), Vtime(100));
    }

    #[test]
    fn test_flags_keep_builtin_idle() {
        let flags = SimplePolicy::new(true).flags();
        assert!(flags.contains(OpsFlags::HAS_UPDATE_IDLE | OpsFlags::KEEP_BUILTIN_IDLE));
        assert!(!flags.contains(OpsFlags::SWITCH_PARTIAL));
        assert_eq!(flags.unknown_bits(), 0);

        let flags = SimplePolicy::new(false).switch_partial(true).flags();
        assert!(flags.contains(OpsFlags::SWITCH_PARTIAL));
    }

    #[test]
    fn test_vtime_charges_runtime_once() {
        let cfg = ScxConfig::builder()
            .cpus(1)
            .callback_budget(std::time::Duration::from_secs(5))
            .build()
            .unwrap();
        let ctl = ScxController::new(cfg).unwrap();
        ctl.try_attach(Box::new(SimplePolicy::new(false))).unwrap();
        let p = Task::builder(Pid(1), "runner", 1).build();
        ctl.register_task(p.clone()).unwrap();
        assert_eq!(p.sched_class(), SchedClass::Ext);
        let start = p.scx.dsq_vtime().0;

        ctl.runnable(CpuId(0), &p, 0, 0);
        for _ in 0..3 {
            assert!(!ctl.tick(CpuId(0), Some(&*p), 1_000_000));
        }
        ctl.quiescent(CpuId(0), &p, deq_flags::SLEEP);
        assert_eq!(p.scx.dsq_vtime().0 - start, 3_000_000);

        // The next wakeup has nothing left to charge.
        ctl.runnable(CpuId(0), &p, 10, enq_flags::WAKEUP);
        assert_eq!(p.scx.dsq_vtime().0 - start, 3_000_000);

        // A full slice followed by a re-enqueue charges the whole slice.
        for _ in 0..19 {
            assert!(!ctl.tick(CpuId(0), Some(&*p), 1_000_000));
        }
        assert!(ctl.tick(CpuId(0), Some(&*p), 1_000_000));
        ctl.runnable(CpuId(0), &p, 20, 0);
        assert_eq!(p.scx.dsq_vtime().0 - start, 3_000_000 + SCX_SLICE_DFL);
        assert_eq!(p.scx.slice(), SCX_SLICE_DFL);

        ctl.detach();
    }
}
