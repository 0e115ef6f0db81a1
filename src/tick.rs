//! Per-CPU hooks: scheduler tick, idle edges, tick suppression,
//! performance targets and CPU hotplug.
//!
//! All of these run on the CPU they pertain to, never block and never take
//! a lock shared with the administrative path.

use std::sync::atomic::Ordering;

use tracing::{debug, info};

use crate::controller::{OpsGuard, ScxController};
use crate::error::{ecode, ExitInfo, ExitKind};
use crate::ops::OpsFlags;
use crate::stats::ScxStats;
use crate::task::Task;
use crate::types::{CpuId, SchedClass, TimeNs, SCX_SLICE_INF};

impl ScxController {
    /// Scheduler tick on `cpu` with `curr` running for `elapsed` ns since
    /// the last tick. Returns whether `curr` must be rescheduled.
    pub fn tick(&self, cpu: CpuId, curr: Option<&Task>, elapsed: TimeNs) -> bool {
        let Some(rq) = self.rq(cpu) else {
            return false;
        };
        rq.advance_clock(elapsed);
        ScxStats::inc(&self.stats.nr_ticks);

        let Some(guard) = self.enter(cpu) else {
            return false;
        };
        self.sync_idle(&guard, rq.is_idle());

        let Some(p) = curr.filter(|p| p.sched_class() == SchedClass::Ext) else {
            return false;
        };
        if p.scx.slice() != SCX_SLICE_INF {
            p.scx.consume_slice(elapsed);
        }
        self.call(guard.handle, Some(cpu), "tick", |ops, cx| ops.tick(cx, p));

        if p.scx.slice() == 0 {
            rq.request_resched();
            ScxStats::inc(&self.stats.nr_resched);
            return true;
        }
        false
    }

    /// Idle-state edge on `cpu`, reported by the CPU itself.
    ///
    /// Repeated reports of the same state are dropped. A policy instance
    /// hears about an edge only if it differs from what that instance was
    /// last told about the CPU.
    pub fn update_idle(&self, cpu: CpuId, idle: bool) {
        let Some(rq) = self.rq(cpu) else {
            return;
        };
        if rq.swap_idle(idle) == idle {
            ScxStats::inc(&self.stats.nr_duplicate_idle);
            return;
        }
        rq.count_idle_edge();

        if let Some(guard) = self.enter(cpu) {
            self.sync_idle(&guard, idle);
        }
    }

    /// Bring the policy's view of the guarded CPU in line with `idle`.
    fn sync_idle(&self, guard: &OpsGuard<'_>, idle: bool) {
        let (rq, handle) = (guard.rq, guard.handle);
        if rq.reported_idle(handle.generation) == Some(idle) {
            return;
        }
        rq.set_reported_idle(handle.generation, idle);

        if handle.builtin_idle() {
            if idle {
                self.idle_mask().set(rq.cpu());
            } else {
                self.idle_mask().clear(rq.cpu());
            }
        }
        if handle.flags.contains(OpsFlags::HAS_UPDATE_IDLE) {
            let cpu = rq.cpu();
            self.call(handle, Some(cpu), "update_idle", |ops, cx| {
                ops.update_idle(cx, cpu, idle)
            });
            rq.count_idle_report();
        }
    }

    /// Whether `cpu`'s periodic tick may be stopped while `curr` runs.
    pub fn can_stop_tick(&self, _cpu: CpuId, curr: Option<&Task>) -> bool {
        if !self.is_enabled() {
            return true;
        }
        match curr {
            Some(p) if p.sched_class() == SchedClass::Ext => p.scx.slice() == SCX_SLICE_INF,
            _ => true,
        }
    }

    /// Performance target requested for `cpu`, 0 when no policy is
    /// attached.
    pub fn cpuperf_target(&self, cpu: CpuId) -> u32 {
        if !self.is_enabled() {
            return 0;
        }
        self.rq(cpu).map_or(0, |rq| rq.cpuperf_target())
    }

    /// `cpu` joins the set of CPUs the extension schedules onto.
    pub fn rq_activate(&self, cpu: CpuId) {
        let Some(rq) = self.rq(cpu) else {
            return;
        };
        if rq.set_online(true) {
            return;
        }
        self.nr_online.fetch_add(1, Ordering::AcqRel);
        info!(%cpu, "CPU online");

        if let Some(guard) = self.enter(cpu) {
            self.handle_hotplug(&guard, true);
            if guard.handle.builtin_idle() && rq.is_idle() {
                self.idle_mask().set(cpu);
            }
        }
    }

    /// `cpu` leaves the set of CPUs the extension schedules onto. Once this
    /// returns no callback runs on behalf of `cpu`.
    pub fn rq_deactivate(&self, cpu: CpuId) {
        let Some(rq) = self.rq(cpu) else {
            return;
        };
        if !rq.is_online() {
            return;
        }
        if let Some(guard) = self.enter(cpu) {
            self.handle_hotplug(&guard, false);
        }

        if !rq.set_online(false) {
            return;
        }
        self.nr_online.fetch_sub(1, Ordering::AcqRel);
        self.quiesce_cpu(cpu);
        self.idle_mask().clear(cpu);
        info!(%cpu, "CPU offline");
    }

    fn handle_hotplug(&self, guard: &OpsGuard<'_>, online: bool) {
        let (cpu, handle) = (guard.rq.cpu(), guard.handle);
        if handle.flags.contains(OpsFlags::HAS_CPU_HOTPLUG) {
            if online {
                self.call(handle, Some(cpu), "cpu_online", |ops, cx| ops.cpu_online(cx, cpu));
            } else {
                self.call(handle, Some(cpu), "cpu_offline", |ops, cx| ops.cpu_offline(cx, cpu));
            }
            return;
        }

        debug!(%cpu, online, policy = %handle.name, "no hotplug callbacks, restarting");
        self.raise_exit(
            handle.generation,
            ExitInfo::new(
                ExitKind::Unreg,
                ecode::ACT_RESTART | ecode::RSN_HOTPLUG,
                format!(
                    "CPU {} going {}, restarting",
                    cpu,
                    if online { "online" } else { "offline" }
                ),
            ),
        );
    }
}
