//! Helpers a policy may call from inside its callbacks.
//!
//! Every callback receives an [`OpsCtx`] bound to the controller, the CPU
//! the callback runs on behalf of (if any) and the generation of the policy
//! instance being called. Helpers that act on behalf of a policy instance
//! become no-ops once that instance has been replaced.

use anyhow::Result;

use crate::controller::ScxController;
use crate::cpumask::Cpumask;
use crate::error::{ExitInfo, ExitKind};
use crate::interleave::maybe_yield;
use crate::types::{CpuId, SCX_CPUPERF_ONE};

pub struct OpsCtx<'a> {
    ctl: &'a ScxController,
    cpu: Option<CpuId>,
    generation: u64,
}

impl<'a> OpsCtx<'a> {
    pub(crate) fn new(ctl: &'a ScxController, cpu: Option<CpuId>, generation: u64) -> Self {
        Self {
            ctl,
            cpu,
            generation,
        }
    }

    /// The CPU the callback runs on behalf of. `None` in task context
    /// (fork, `sched_setscheduler`, attach and detach).
    pub fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn nr_cpu_ids(&self) -> u32 {
        self.ctl.nr_cpus()
    }

    pub fn cpu_online(&self, cpu: CpuId) -> bool {
        self.ctl.rq(cpu).is_some_and(|rq| rq.is_online())
    }

    /// Current performance target of `cpu` in `[0, SCX_CPUPERF_ONE]`.
    pub fn cpuperf_cur(&self, cpu: CpuId) -> u32 {
        maybe_yield();
        self.ctl.rq(cpu).map_or(0, |rq| rq.cpuperf_target())
    }

    /// Set the performance target of `cpu`. Values above `SCX_CPUPERF_ONE`
    /// or an invalid CPU fault the policy.
    pub fn cpuperf_set(&self, cpu: CpuId, perf: u32) {
        maybe_yield();
        if perf > SCX_CPUPERF_ONE {
            self.error(format!("Invalid cpuperf target {perf} for CPU {cpu}"));
            return;
        }
        match self.ctl.rq(cpu) {
            Some(rq) => rq.set_cpuperf_target(perf),
            None => self.error(format!("Invalid target CPU {cpu}")),
        }
    }

    pub fn is_cpu_idle(&self, cpu: CpuId) -> bool {
        self.ctl.idle_mask().test(cpu)
    }

    /// Claim `cpu` in the built-in idle mask. Fails for policies that
    /// replaced built-in idle tracking.
    pub fn test_and_clear_cpu_idle(&self, cpu: CpuId) -> bool {
        maybe_yield();
        if !self.builtin_idle_enabled() {
            self.error("built-in idle tracking is disabled".to_string());
            return false;
        }
        self.ctl.idle_mask().test_and_clear(cpu)
    }

    /// Claim an idle CPU from `allowed`.
    pub fn pick_idle_cpu(&self, allowed: &Cpumask) -> Option<CpuId> {
        maybe_yield();
        if !self.builtin_idle_enabled() {
            self.error("built-in idle tracking is disabled".to_string());
            return None;
        }
        self.ctl.idle_mask().pick(allowed)
    }

    /// Fault the policy instance. It is detached asynchronously.
    pub fn error(&self, msg: String) {
        tracing::debug!(generation = self.generation, "policy raised error: {msg}");
        self.ctl
            .raise_exit(self.generation, ExitInfo::new(ExitKind::ErrorPolicy, 0, msg));
    }

    /// Request a voluntary exit with `exit_code`.
    pub fn exit(&self, exit_code: u64, msg: String) {
        self.ctl
            .raise_exit(self.generation, ExitInfo::new(ExitKind::Done, exit_code, msg));
    }

    /// Convenience for policies propagating an [`anyhow::Error`].
    pub fn check<T>(&self, res: Result<T>) -> Option<T> {
        res.map_err(|e| self.error(format!("{e:#}"))).ok()
    }

    fn builtin_idle_enabled(&self) -> bool {
        self.ctl.builtin_idle_enabled()
    }
}
