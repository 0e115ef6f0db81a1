//! The callback surface a scheduling policy implements.
//!
//! A policy is an opaque object handed to [`ScxController::try_attach`]. The
//! host invokes it from per-CPU hooks and from task context; every
//! invocation is bounded by the configured callback budget and wrapped so
//! that a panic ends the policy instead of the host.
//!
//! Callbacks without a sensible default answer are gated by [`OpsFlags`]:
//! the host only calls `update_idle` and the hotplug callbacks when the
//! policy declares them.
//!
//! [`ScxController::try_attach`]: crate::ScxController::try_attach

use anyhow::Result;

use crate::cpumask::Cpumask;
use crate::error::ExitInfo;
use crate::kfuncs::OpsCtx;
use crate::task::Task;
use crate::types::{CpuId, DsqId, TimeNs};

/// Policy flags, matching the kernel's `scx_ops_flags` where one exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpsFlags(u64);

impl OpsFlags {
    pub const NONE: OpsFlags = OpsFlags(0);
    /// Keep the built-in idle mask even though `update_idle` is implemented.
    pub const KEEP_BUILTIN_IDLE: OpsFlags = OpsFlags(1 << 0);
    /// Only `SCHED_EXT` tasks move to the extension; fair tasks stay put.
    pub const SWITCH_PARTIAL: OpsFlags = OpsFlags(1 << 3);
    /// The policy implements `update_idle`.
    pub const HAS_UPDATE_IDLE: OpsFlags = OpsFlags(1 << 16);
    /// The policy implements `cpu_online`/`cpu_offline`.
    pub const HAS_CPU_HOTPLUG: OpsFlags = OpsFlags(1 << 17);

    const ALL: u64 = Self::KEEP_BUILTIN_IDLE.0
        | Self::SWITCH_PARTIAL.0
        | Self::HAS_UPDATE_IDLE.0
        | Self::HAS_CPU_HOTPLUG.0;

    pub fn from_raw(raw: u64) -> Self {
        OpsFlags(raw)
    }

    pub fn contains(self, other: OpsFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: OpsFlags) {
        self.0 |= other.0;
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Bits the host does not know about.
    pub fn unknown_bits(self) -> u64 {
        self.0 & !Self::ALL
    }
}

impl std::ops::BitOr for OpsFlags {
    type Output = OpsFlags;

    fn bitor(self, rhs: Self) -> Self {
        OpsFlags(self.0 | rhs.0)
    }
}

/// Enqueue flags.
pub mod enq_flags {
    /// The task is waking up.
    pub const WAKEUP: u64 = 1 << 0;
}

/// Dequeue flags.
pub mod deq_flags {
    /// The task is going to sleep.
    pub const SLEEP: u64 = 1 << 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitTaskArgs {
    /// Called from `fork()` rather than while attaching.
    pub fork: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitTaskArgs {
    /// The fork that created the task was cancelled.
    pub cancelled: bool,
}

/// A pluggable scheduling policy.
pub trait SchedExtOps: Send + Sync {
    /// Name reported in logs and exit records. Must not be empty.
    fn name(&self) -> &str;

    fn flags(&self) -> OpsFlags {
        OpsFlags::NONE
    }

    /// Requested stall timeout; zero selects the host default.
    fn timeout_ns(&self) -> TimeNs {
        0
    }

    /// Validate and set up the policy. Runs once while attaching; an error
    /// rejects the attach.
    fn init(&self, _cx: &OpsCtx<'_>) -> Result<()> {
        Ok(())
    }

    /// The policy is being detached.
    fn exit(&self, _info: &ExitInfo) {}

    /// A task is entering the policy's view, either at fork or at attach.
    fn init_task(&self, _cx: &OpsCtx<'_>, _p: &Task, _args: InitTaskArgs) -> Result<()> {
        Ok(())
    }

    /// A task initialized by `init_task` is leaving the policy's view.
    fn exit_task(&self, _cx: &OpsCtx<'_>, _p: &Task, _args: ExitTaskArgs) {}

    /// The task moved into the extension class.
    fn enable(&self, _cx: &OpsCtx<'_>, _p: &Task) {}

    /// The task moved out of the extension class.
    fn disable(&self, _cx: &OpsCtx<'_>, _p: &Task) {}

    fn runnable(&self, _cx: &OpsCtx<'_>, _p: &Task, _enq_flags: u64) {}

    /// Pick the dispatch queue for a runnable task.
    fn enqueue(&self, _cx: &OpsCtx<'_>, _p: &Task, _enq_flags: u64) -> DsqId {
        DsqId::GLOBAL
    }

    fn quiescent(&self, _cx: &OpsCtx<'_>, _p: &Task, _deq_flags: u64) {}

    /// Periodic tick for the task running on `cx.cpu()`.
    fn tick(&self, _cx: &OpsCtx<'_>, _p: &Task) {}

    /// Idle edge on `cpu`. Only called with [`OpsFlags::HAS_UPDATE_IDLE`].
    fn update_idle(&self, _cx: &OpsCtx<'_>, _cpu: CpuId, _idle: bool) {}

    /// Only called with [`OpsFlags::HAS_CPU_HOTPLUG`].
    fn cpu_online(&self, _cx: &OpsCtx<'_>, _cpu: CpuId) {}

    /// Only called with [`OpsFlags::HAS_CPU_HOTPLUG`].
    fn cpu_offline(&self, _cx: &OpsCtx<'_>, _cpu: CpuId) {}

    fn set_cpumask(&self, _cx: &OpsCtx<'_>, _p: &Task, _cpumask: &Cpumask) {}

    /// Whether `a` should run before `b` on a core-scheduled sibling pair.
    /// `None` selects the host's default order. The answers must be
    /// transitive; answering `true` both ways is a fault.
    fn core_sched_before(&self, _cx: &OpsCtx<'_>, _a: &Task, _b: &Task) -> Option<bool> {
        None
    }
}
