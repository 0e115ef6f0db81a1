//! Task model seen by the extension.
//!
//! The host owns its tasks; each [`Task`] embeds the [`SchedExtEntity`] the
//! active policy works with. Fields the per-CPU hooks read on the hot path
//! (class, priority, slice, timestamps) are atomics so that a hook never
//! takes a lock on another task.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cpumask::Cpumask;
use crate::types::{
    CpuId, DsqId, Pid, SchedClass, SchedPolicy, TimeNs, Vtime, MAX_RT_PRIO, SCX_SLICE_DFL,
    SCX_WEIGHT_DFL,
};

/// Lifecycle of a task with respect to the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScxTaskState {
    /// No policy has initialized the entity.
    Unclassified = 0,
    /// `pre_fork` reserved the entity; `fork` has not completed.
    PreFork = 1,
    /// The host finished classifying the task. Whether a policy initialized
    /// the entity is tracked separately by the generation it was
    /// initialized under.
    Classified = 2,
    /// The fork was abandoned after `pre_fork`.
    Cancelled = 3,
    /// The task was reaped.
    Exited = 4,
}

impl ScxTaskState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ScxTaskState::PreFork,
            2 => ScxTaskState::Classified,
            3 => ScxTaskState::Cancelled,
            4 => ScxTaskState::Exited,
            _ => ScxTaskState::Unclassified,
        }
    }
}

/// Task-level flags.
pub mod task_flags {
    /// Kernel thread.
    pub const KTHREAD: u32 = 1 << 0;
    /// Pinned to its realtime/deadline class; may not move to the extension.
    pub const RT_PINNED: u32 = 1 << 1;
}

const SCX_TASK_ENABLED: u32 = 1 << 0;
const SCX_TASK_DISALLOW: u32 = 1 << 1;

/// Per-task extension state.
pub struct SchedExtEntity {
    state: AtomicU8,
    flags: AtomicU32,
    /// Queue-membership token, `DsqId::INVALID` when not queued.
    dsq: AtomicU64,
    dsq_vtime: AtomicU64,
    slice: AtomicU64,
    weight: AtomicU32,
    perf_hint: AtomicU32,
    core_sched_at: AtomicU64,
    /// Generation of the policy instance that initialized this entity.
    ops_gen: AtomicU64,
}

impl SchedExtEntity {
    /// `init_scx_entity()`: a pristine entity for a new task.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ScxTaskState::Unclassified as u8),
            flags: AtomicU32::new(0),
            dsq: AtomicU64::new(DsqId::INVALID.0),
            dsq_vtime: AtomicU64::new(0),
            slice: AtomicU64::new(SCX_SLICE_DFL),
            weight: AtomicU32::new(SCX_WEIGHT_DFL),
            perf_hint: AtomicU32::new(0),
            core_sched_at: AtomicU64::new(0),
            ops_gen: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ScxTaskState {
        ScxTaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ScxTaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Return every policy-visible field to its initial value.
    pub(crate) fn reset(&self) {
        self.flags.store(0, Ordering::Relaxed);
        self.dsq.store(DsqId::INVALID.0, Ordering::Relaxed);
        self.dsq_vtime.store(0, Ordering::Relaxed);
        self.slice.store(SCX_SLICE_DFL, Ordering::Relaxed);
        self.weight.store(SCX_WEIGHT_DFL, Ordering::Relaxed);
        self.perf_hint.store(0, Ordering::Relaxed);
        self.core_sched_at.store(0, Ordering::Relaxed);
        self.ops_gen.store(0, Ordering::Release);
    }

    /// The queue the task currently sits in, if any.
    pub fn dsq(&self) -> Option<DsqId> {
        match DsqId(self.dsq.load(Ordering::Acquire)) {
            DsqId::INVALID => None,
            dsq => Some(dsq),
        }
    }

    pub(crate) fn set_dsq(&self, dsq: Option<DsqId>) {
        self.dsq
            .store(dsq.unwrap_or(DsqId::INVALID).0, Ordering::Release);
    }

    pub fn dsq_vtime(&self) -> Vtime {
        Vtime(self.dsq_vtime.load(Ordering::Relaxed))
    }

    pub fn set_dsq_vtime(&self, vtime: Vtime) {
        self.dsq_vtime.store(vtime.0, Ordering::Relaxed);
    }

    pub fn slice(&self) -> TimeNs {
        self.slice.load(Ordering::Relaxed)
    }

    pub fn set_slice(&self, slice: TimeNs) {
        self.slice.store(slice, Ordering::Relaxed);
    }

    /// Charge `delta` ns to the slice, saturating at zero. Returns the
    /// remaining slice.
    pub(crate) fn consume_slice(&self, delta: TimeNs) -> TimeNs {
        let left = self.slice().saturating_sub(delta);
        self.slice.store(left, Ordering::Relaxed);
        left
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    /// Performance-target hint as a share of `SCX_CPUPERF_ONE`.
    pub fn perf_hint(&self) -> u32 {
        self.perf_hint.load(Ordering::Relaxed)
    }

    pub fn set_perf_hint(&self, perf: u32) {
        self.perf_hint.store(perf, Ordering::Relaxed);
    }

    pub fn core_sched_at(&self) -> TimeNs {
        self.core_sched_at.load(Ordering::Relaxed)
    }

    pub(crate) fn touch_core_sched(&self, now: TimeNs) {
        self.core_sched_at.store(now, Ordering::Relaxed);
    }

    /// Refuse this task. Only honored from `init_task`.
    pub fn set_disallow(&self, disallow: bool) {
        if disallow {
            self.flags.fetch_or(SCX_TASK_DISALLOW, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!SCX_TASK_DISALLOW, Ordering::AcqRel);
        }
    }

    pub fn disallowed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & SCX_TASK_DISALLOW != 0
    }

    /// Whether the policy's `enable` callback has run for this task.
    pub fn is_enabled(&self) -> bool {
        self.flags.load(Ordering::Acquire) & SCX_TASK_ENABLED != 0
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.flags.fetch_or(SCX_TASK_ENABLED, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!SCX_TASK_ENABLED, Ordering::AcqRel);
        }
    }

    pub(crate) fn ops_gen(&self) -> u64 {
        self.ops_gen.load(Ordering::Acquire)
    }

    pub(crate) fn set_ops_gen(&self, generation: u64) {
        self.ops_gen.store(generation, Ordering::Release);
    }
}

impl Default for SchedExtEntity {
    fn default() -> Self {
        Self::new()
    }
}

/// A host task.
pub struct Task {
    pid: Pid,
    comm: String,
    policy: AtomicU8,
    class: AtomicU8,
    /// Realtime priority for RT tasks, `MAX_RT_PRIO + 20 + nice` otherwise.
    prio: AtomicI32,
    flags: AtomicU32,
    cpus_allowed: Mutex<Cpumask>,
    nr_cpus_allowed: AtomicU32,
    cpu: AtomicU32,
    pub scx: SchedExtEntity,
}

impl Task {
    pub fn builder(pid: Pid, comm: impl Into<String>, nr_cpus: u32) -> TaskBuilder {
        TaskBuilder {
            pid,
            comm: comm.into(),
            policy: SchedPolicy::Normal,
            prio: MAX_RT_PRIO + 20,
            flags: 0,
            cpus_allowed: Cpumask::full(nr_cpus as usize),
            cpu: CpuId(0),
        }
    }

    /// The child half of `fork()`: inherits policy, priority and affinity.
    /// The child starts out in the class its policy maps to without the
    /// extension; the controller reclassifies it in `post_fork`.
    pub fn fork_from(parent: &Task, pid: Pid, comm: impl Into<String>) -> Arc<Task> {
        let cpus_allowed = parent.cpus_allowed();
        let policy = parent.policy();
        Arc::new(Task {
            pid,
            comm: comm.into(),
            policy: AtomicU8::new(policy as u8),
            class: AtomicU8::new(default_class(policy) as u8),
            prio: AtomicI32::new(parent.prio()),
            flags: AtomicU32::new(parent.flags() & !task_flags::RT_PINNED),
            nr_cpus_allowed: AtomicU32::new(cpus_allowed.weight() as u32),
            cpus_allowed: Mutex::new(cpus_allowed),
            cpu: AtomicU32::new(parent.cpu().0),
            scx: SchedExtEntity::new(),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn comm(&self) -> &str {
        &self.comm
    }

    pub fn policy(&self) -> SchedPolicy {
        SchedPolicy::from_raw(self.policy.load(Ordering::Acquire)).unwrap_or(SchedPolicy::Normal)
    }

    pub(crate) fn set_policy(&self, policy: SchedPolicy) {
        self.policy.store(policy as u8, Ordering::Release);
    }

    pub fn sched_class(&self) -> SchedClass {
        SchedClass::from_raw(self.class.load(Ordering::Acquire))
    }

    pub(crate) fn set_sched_class(&self, class: SchedClass) {
        self.class.store(class as u8, Ordering::Release);
    }

    pub fn prio(&self) -> i32 {
        self.prio.load(Ordering::Relaxed)
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn is_rt_pinned(&self) -> bool {
        self.flags() & task_flags::RT_PINNED != 0
    }

    pub fn cpus_allowed(&self) -> Cpumask {
        self.cpus_allowed.lock().clone()
    }

    pub fn nr_cpus_allowed(&self) -> u32 {
        self.nr_cpus_allowed.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpus_allowed(&self, mask: Cpumask) {
        let mut cur = self.cpus_allowed.lock();
        self.nr_cpus_allowed
            .store(mask.weight() as u32, Ordering::Release);
        *cur = mask;
    }

    /// The CPU the task last ran on or was assigned to.
    pub fn cpu(&self) -> CpuId {
        CpuId(self.cpu.load(Ordering::Relaxed))
    }

    pub fn set_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu.0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("comm", &self.comm)
            .field("policy", &self.policy())
            .field("class", &self.sched_class())
            .field("scx_state", &self.scx.state())
            .finish()
    }
}

/// The class a policy maps to while no extension policy claims it.
pub fn default_class(policy: SchedPolicy) -> SchedClass {
    match policy {
        SchedPolicy::Deadline => SchedClass::Deadline,
        SchedPolicy::Fifo | SchedPolicy::Rr => SchedClass::Rt,
        SchedPolicy::Normal | SchedPolicy::Batch | SchedPolicy::Idle | SchedPolicy::Ext => {
            SchedClass::Fair
        }
    }
}

pub struct TaskBuilder {
    pid: Pid,
    comm: String,
    policy: SchedPolicy,
    prio: i32,
    flags: u32,
    cpus_allowed: Cpumask,
    cpu: CpuId,
}

impl TaskBuilder {
    pub fn policy(mut self, policy: SchedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Nice value for fair/ext policies.
    pub fn nice(mut self, nice: i8) -> Self {
        self.prio = MAX_RT_PRIO + 20 + nice as i32;
        self
    }

    /// Realtime priority value (`0` is most important).
    pub fn rt_prio(mut self, prio: i32) -> Self {
        self.prio = prio.clamp(0, MAX_RT_PRIO - 1);
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn cpus_allowed(mut self, mask: Cpumask) -> Self {
        self.cpus_allowed = mask;
        self
    }

    pub fn cpu(mut self, cpu: CpuId) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn build(self) -> Arc<Task> {
        Arc::new(Task {
            pid: self.pid,
            comm: self.comm,
            policy: AtomicU8::new(self.policy as u8),
            class: AtomicU8::new(default_class(self.policy) as u8),
            prio: AtomicI32::new(self.prio),
            flags: AtomicU32::new(self.flags),
            nr_cpus_allowed: AtomicU32::new(self.cpus_allowed.weight() as u32),
            cpus_allowed: Mutex::new(self.cpus_allowed),
            cpu: AtomicU32::new(self.cpu.0),
            scx: SchedExtEntity::new(),
        })
    }
}
