//! The extension controller: attach, detach and the per-CPU entry protocol.
//!
//! ## Entry protocol
//!
//! A per-CPU hook announces itself by incrementing the CPU's in-flight
//! counter and only then loads the enable state. Detach first publishes
//! `Disabling` and only then reads the in-flight counters. All four accesses
//! are `SeqCst`, so either the hook observes `Disabling` and bypasses the
//! policy, or detach observes the hook and waits for it. Every CPU found
//! quiescent is acknowledged with the generation being torn down.
//!
//! Task-context operations (fork, `sched_setscheduler`, reaping) hold the
//! fork rwsem for reading instead. Detach frees the policy handle only
//! under the write side.
//!
//! ## Faults
//!
//! Callbacks run under [`ScxController::call`], which catches panics and
//! enforces the callback budget. A fault records the first exit info of the
//! generation, moves the state to `Disabling` and queues the detach on the
//! `scx_disable` worker.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use crossbeam::utils::Backoff;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::config::ScxConfig;
use crate::disable::{self, DisableRequest, ScxEvent};
use crate::error::{ExitInfo, ExitKind, ScxError};
use crate::idle::IdleMask;
use crate::interleave;
use crate::kfuncs::OpsCtx;
use crate::ops::{ExitTaskArgs, InitTaskArgs, OpsFlags, SchedExtOps};
use crate::rq::ScxRq;
use crate::state::{EnableSnapshot, EnableState, EnableStateKind};
use crate::stats::{ForkAccounting, ScxStats, ScxStatsSnapshot};
use crate::task::{default_class, ScxTaskState, Task};
use crate::types::{CpuId, Pid, SchedClass, SchedPolicy, TimeNs};

/// Longest policy name accepted at attach.
pub const SCX_OPS_NAME_LEN: usize = 128;

/// An attached policy instance.
pub(crate) struct PolicyHandle {
    pub(crate) ops: Box<dyn SchedExtOps>,
    pub(crate) name: String,
    pub(crate) flags: OpsFlags,
    pub(crate) generation: u64,
    pub(crate) timeout_ns: TimeNs,
}

impl PolicyHandle {
    pub(crate) fn builtin_idle(&self) -> bool {
        builtin_idle(self.flags)
    }
}

fn builtin_idle(flags: OpsFlags) -> bool {
    !flags.contains(OpsFlags::HAS_UPDATE_IDLE) || flags.contains(OpsFlags::KEEP_BUILTIN_IDLE)
}

/// Proof that the current thread is inside the policy on behalf of a CPU.
pub(crate) struct OpsGuard<'a> {
    pub(crate) rq: &'a ScxRq,
    pub(crate) handle: &'a PolicyHandle,
}

impl Drop for OpsGuard<'_> {
    fn drop(&mut self) {
        self.rq.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PendingExit {
    generation: u64,
    info: ExitInfo,
}

pub struct ScxController {
    config: ScxConfig,
    pub(crate) state: EnableState,
    ops: AtomicPtr<PolicyHandle>,
    /// Flags of the policy being attached or attached, zero otherwise.
    active_flags: AtomicU64,
    active_name: Mutex<Option<String>>,
    next_gen: AtomicU64,
    rqs: Box<[ScxRq]>,
    idle_mask: IdleMask,
    pub(crate) nr_online: AtomicU32,
    pub(crate) tasks: Mutex<BTreeMap<Pid, Arc<Task>>>,
    admin: Mutex<()>,
    pub(crate) fork_rwsem: RwLock<()>,
    pending_exit: Mutex<Option<PendingExit>>,
    last_exit: Mutex<Option<ExitInfo>>,
    pub(crate) stats: ScxStats,
    pub(crate) fork_acct: ForkAccounting,
    disable_tx: Sender<DisableRequest>,
    disable_worker: Mutex<Option<JoinHandle<()>>>,
    events_tx: Sender<ScxEvent>,
    events_rx: Receiver<ScxEvent>,
}

impl ScxController {
    /// Create a controller with every CPU online and busy, and no policy
    /// attached.
    pub fn new(config: ScxConfig) -> Result<Arc<Self>> {
        let (disable_tx, disable_rx) = channel::bounded(4);
        let (events_tx, events_rx) = channel::bounded(config.event_capacity);
        let rqs: Box<[ScxRq]> = (0..config.nr_cpus).map(|cpu| ScxRq::new(CpuId(cpu))).collect();

        let ctl = Arc::new(Self {
            state: EnableState::new(),
            ops: AtomicPtr::new(ptr::null_mut()),
            active_flags: AtomicU64::new(0),
            active_name: Mutex::new(None),
            next_gen: AtomicU64::new(0),
            idle_mask: IdleMask::new(config.nr_cpus),
            nr_online: AtomicU32::new(config.nr_cpus),
            rqs,
            tasks: Mutex::new(BTreeMap::new()),
            admin: Mutex::new(()),
            fork_rwsem: RwLock::new(()),
            pending_exit: Mutex::new(None),
            last_exit: Mutex::new(None),
            stats: ScxStats::default(),
            fork_acct: ForkAccounting::default(),
            disable_tx,
            disable_worker: Mutex::new(None),
            events_tx,
            events_rx,
            config,
        });

        let worker = disable::spawn_worker(Arc::downgrade(&ctl), disable_rx)?;
        *ctl.disable_worker.lock() = Some(worker);

        info!(
            nr_cpus = ctl.config.nr_cpus,
            callback_budget_ns = ctl.config.callback_budget_ns,
            "scx controller ready"
        );
        Ok(ctl)
    }

    pub fn config(&self) -> &ScxConfig {
        &self.config
    }

    pub fn nr_cpus(&self) -> u32 {
        self.config.nr_cpus
    }

    pub fn rq(&self, cpu: CpuId) -> Option<&ScxRq> {
        self.rqs.get(cpu.index())
    }

    pub fn rqs(&self) -> &[ScxRq] {
        &self.rqs
    }

    pub fn idle_mask(&self) -> &IdleMask {
        &self.idle_mask
    }

    pub fn nr_online(&self) -> u32 {
        self.nr_online.load(Ordering::Acquire)
    }

    /// Lock-free; safe from any context.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.state.load(Ordering::Acquire).is_enabled()
    }

    pub fn state(&self) -> EnableSnapshot {
        self.state.load(Ordering::Acquire)
    }

    /// Name of the attached (or attaching, or detaching) policy.
    pub fn policy_name(&self) -> Option<String> {
        self.active_name.lock().clone()
    }

    pub(crate) fn builtin_idle_enabled(&self) -> bool {
        builtin_idle(OpsFlags::from_raw(self.active_flags.load(Ordering::Acquire)))
    }

    pub fn stats(&self) -> &ScxStats {
        &self.stats
    }

    pub fn fork_accounting(&self) -> &ForkAccounting {
        &self.fork_acct
    }

    pub fn stats_snapshot(&self) -> ScxStatsSnapshot {
        let mut snap = self.stats.snapshot();
        snap.fork = self.fork_acct.snapshot();
        snap.cpus = self.rqs.iter().map(ScxRq::stats).collect();
        snap
    }

    /// Receiver for out-of-band events. Receivers share one queue.
    pub fn events(&self) -> Receiver<ScxEvent> {
        self.events_rx.clone()
    }

    /// Exit info of the most recently detached policy.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.last_exit.lock().clone()
    }

    /// Every registered task.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().values().cloned().collect()
    }

    pub fn task(&self, pid: Pid) -> Option<Arc<Task>> {
        self.tasks.lock().get(&pid).cloned()
    }

    /// Install `ops` as the active policy.
    ///
    /// Validates the policy, runs its `init`, initializes every registered
    /// task and only then publishes it. On error the policy's `exit` has
    /// run and the controller is attachable again.
    pub fn try_attach(&self, ops: Box<dyn SchedExtOps>) -> Result<(), ScxError> {
        let _admin = interleave::lock(&self.admin);

        let snap = self.state.load(Ordering::SeqCst);
        if snap.kind != EnableStateKind::Disabled {
            return Err(ScxError::AttachConflict {
                active: self.policy_name().unwrap_or_default(),
            });
        }

        let generation = self.next_gen.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = Box::new(PolicyHandle {
            name: ops.name().to_string(),
            flags: ops.flags(),
            timeout_ns: ops.timeout_ns(),
            generation,
            ops,
        });

        if let Err(reason) = self.validate(&handle) {
            return Err(self.reject(handle, reason));
        }

        let switch_all = !handle.flags.contains(OpsFlags::SWITCH_PARTIAL);
        self.active_flags
            .store(handle.flags.raw(), Ordering::Release);
        *self.active_name.lock() = Some(handle.name.clone());
        self.state.store(
            EnableStateKind::Enabling,
            switch_all,
            generation,
            Ordering::SeqCst,
        );
        debug!(policy = %handle.name, generation, "enabling");

        match self.call(&handle, None, "init", |ops, cx| ops.init(cx)) {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(self.reject(handle, format!("init failed: {e:#}"))),
            None => return Err(self.reject(handle, self.pending_reason(generation))),
        }
        if self.has_pending_exit(generation) {
            return Err(self.reject(handle, self.pending_reason(generation)));
        }

        let fork_guard = interleave::write(&self.fork_rwsem);

        self.idle_mask.clear_all();
        for rq in self.rqs.iter() {
            rq.set_cpuperf_target(0);
            let idle = rq.is_idle();
            rq.set_reported_idle(generation, idle);
            if idle && rq.is_online() && handle.builtin_idle() {
                self.idle_mask.set(rq.cpu());
            }
        }

        let tasks = self.tasks();
        let mut initialized = Vec::with_capacity(tasks.len());
        for p in &tasks {
            if let Err(reason) = self.init_task(&handle, p, false) {
                self.unwind_tasks(&handle, &initialized);
                return Err(self.reject(
                    handle,
                    format!("init_task failed for {}[{}]: {reason}", p.comm(), p.pid()),
                ));
            }
            initialized.push(p.clone());
        }
        if self.has_pending_exit(generation) {
            self.unwind_tasks(&handle, &initialized);
            return Err(self.reject(handle, self.pending_reason(generation)));
        }

        let raw = Box::into_raw(handle);
        self.ops.store(raw, Ordering::SeqCst);
        self.state.store(
            EnableStateKind::Enabled,
            switch_all,
            generation,
            Ordering::SeqCst,
        );

        // SAFETY: the handle is only freed by `disable_with`, which needs the
        // admin mutex held here.
        let handle = unsafe { &*raw };
        for p in &tasks {
            self.reclassify(Some(handle), p);
        }
        drop(fork_guard);

        ScxStats::inc(&self.stats.nr_attach);
        info!(
            policy = %handle.name,
            generation,
            switch_all,
            nr_tasks = tasks.len(),
            "policy attached"
        );
        self.publish(ScxEvent::Attached {
            name: handle.name.clone(),
            generation,
        });
        Ok(())
    }

    fn validate(&self, handle: &PolicyHandle) -> Result<(), String> {
        if handle.name.is_empty() {
            return Err("policy name must not be empty".into());
        }
        if handle.name.len() >= SCX_OPS_NAME_LEN {
            return Err(format!(
                "policy name is longer than {} bytes",
                SCX_OPS_NAME_LEN - 1
            ));
        }
        if handle.flags.unknown_bits() != 0 {
            return Err(format!(
                "unknown flags 0x{:x}",
                handle.flags.unknown_bits()
            ));
        }
        if handle.timeout_ns > self.config.watchdog_timeout_max_ns {
            return Err(format!(
                "watchdog timeout {}ms exceeds the {}ms limit",
                handle.timeout_ns / 1_000_000,
                self.config.watchdog_timeout_max_ns / 1_000_000
            ));
        }
        Ok(())
    }

    /// Abort an attach: run the policy's `exit`, drop it and return to
    /// `Disabled`.
    fn reject(&self, handle: Box<PolicyHandle>, reason: String) -> ScxError {
        let generation = handle.generation;
        let info = ExitInfo::new(ExitKind::Error, 0, reason.clone());
        self.call(&handle, None, "exit", |ops, _| ops.exit(&info));

        self.active_flags.store(0, Ordering::Release);
        *self.active_name.lock() = None;
        self.state.store(
            EnableStateKind::Disabled,
            false,
            generation,
            Ordering::SeqCst,
        );
        self.pending_exit.lock().take();
        *self.last_exit.lock() = Some(info);
        ScxStats::inc(&self.stats.nr_attach_rejected);

        warn!(policy = %handle.name, generation, "attach rejected: {reason}");
        ScxError::ValidationRejected {
            name: handle.name.clone(),
            reason,
        }
    }

    fn unwind_tasks(&self, handle: &PolicyHandle, tasks: &[Arc<Task>]) {
        for p in tasks {
            self.exit_task(handle, p, false);
            p.scx.reset();
        }
    }

    /// Detach the active policy and wait until no CPU can observe it.
    /// A no-op when nothing is attached.
    pub fn detach(&self) {
        self.disable_with(None, ExitInfo::new(ExitKind::Unreg, 0, ""));
    }

    /// Forced detach from the disable worker. Ignored unless `generation`
    /// is still the current policy instance.
    pub(crate) fn disable_generation(&self, generation: u64) {
        self.disable_with(
            Some(generation),
            ExitInfo::new(ExitKind::Error, 0, "forced detach"),
        );
    }

    fn disable_with(&self, expected: Option<u64>, info: ExitInfo) -> Option<ExitInfo> {
        let _admin = interleave::lock(&self.admin);

        let snap = self.state.load(Ordering::SeqCst);
        if !matches!(
            snap.kind,
            EnableStateKind::Enabled | EnableStateKind::Disabling
        ) {
            return None;
        }
        if expected.is_some_and(|g| g != snap.generation) {
            return None;
        }
        let generation = snap.generation;

        // A fault raised earlier takes precedence over `info`.
        self.record_exit(generation, info);
        self.state.store(
            EnableStateKind::Disabling,
            snap.switch_all,
            generation,
            Ordering::SeqCst,
        );

        for rq in self.rqs.iter() {
            self.quiesce_rq(rq);
            rq.ack(generation);
        }

        let fork_guard = interleave::write(&self.fork_rwsem);

        let raw = self.ops.load(Ordering::SeqCst);
        // SAFETY: only this function frees the handle, under the admin mutex.
        let Some(handle) = (unsafe { raw.as_ref() }) else {
            self.state.store(
                EnableStateKind::Disabled,
                false,
                generation,
                Ordering::SeqCst,
            );
            return None;
        };

        let info = self
            .pending_exit
            .lock()
            .as_ref()
            .filter(|p| p.generation == generation)
            .map(|p| p.info.clone())
            .unwrap_or_default();

        let tasks = self.tasks();
        for p in &tasks {
            self.teardown_task(handle, p);
        }
        self.call(handle, None, "exit", |ops, _| ops.exit(&info));

        self.ops.store(ptr::null_mut(), Ordering::SeqCst);
        self.active_flags.store(0, Ordering::Release);
        self.idle_mask.clear_all();
        for rq in self.rqs.iter() {
            rq.set_cpuperf_target(0);
        }
        self.state.store(
            EnableStateKind::Disabled,
            false,
            generation,
            Ordering::SeqCst,
        );
        drop(fork_guard);

        // SAFETY: unpublished above, and every CPU acknowledged this
        // generation after the state left `Enabled`.
        let handle = unsafe { Box::from_raw(raw) };
        let name = handle.name.clone();
        drop(handle);

        *self.active_name.lock() = None;
        self.pending_exit.lock().take();
        *self.last_exit.lock() = Some(info.clone());
        ScxStats::inc(&self.stats.nr_detach);

        if let Err(e) = info.report() {
            warn!(policy = %name, generation, "{e}");
        }
        info!(policy = %name, generation, nr_tasks = tasks.len(), "policy detached");
        self.publish(ScxEvent::Detached {
            name,
            generation,
            info: info.clone(),
        });
        Some(info)
    }

    fn quiesce_rq(&self, rq: &ScxRq) {
        let backoff = Backoff::new();
        while rq.inflight() != 0 {
            ScxStats::inc(&self.stats.nr_quiesce_spins);
            interleave::maybe_yield();
            backoff.snooze();
        }
    }

    /// Wait until no callback runs on behalf of `cpu`.
    pub(crate) fn quiesce_cpu(&self, cpu: CpuId) {
        if let Some(rq) = self.rq(cpu) {
            self.quiesce_rq(rq);
        }
    }

    fn teardown_task(&self, handle: &PolicyHandle, p: &Task) {
        if p.sched_class() == SchedClass::Ext {
            if p.scx.is_enabled() {
                self.call(handle, None, "disable", |ops, cx| ops.disable(cx, p));
            }
            p.set_sched_class(default_class(p.policy()));
        }
        p.scx.set_enabled(false);
        p.scx.set_dsq(None);
        self.exit_task(handle, p, false);
        p.scx.reset();
    }

    /// Enter the policy on behalf of `cpu`. `None` means the caller must
    /// make the default decision.
    pub(crate) fn enter(&self, cpu: CpuId) -> Option<OpsGuard<'_>> {
        self.enter_rq(cpu, true)
    }

    /// Like [`enter`](Self::enter) but also through an offline CPU, for
    /// callers whose answer must not depend on which CPUs are online.
    pub(crate) fn enter_any(&self, cpu: CpuId) -> Option<OpsGuard<'_>> {
        self.enter_rq(cpu, false)
    }

    fn enter_rq(&self, cpu: CpuId, need_online: bool) -> Option<OpsGuard<'_>> {
        let rq = self.rq(cpu)?;
        rq.inflight.fetch_add(1, Ordering::SeqCst);
        interleave::maybe_yield();

        let snap = self.state.load(Ordering::SeqCst);
        let raw = self.ops.load(Ordering::Acquire);
        if !snap.is_enabled() || raw.is_null() || (need_online && !rq.is_online()) {
            rq.inflight.fetch_sub(1, Ordering::SeqCst);
            ScxStats::inc(&self.stats.nr_bypassed);
            return None;
        }
        // SAFETY: the state was `Enabled` after our in-flight increment was
        // visible, so detach waits for the guard before freeing the handle.
        let handle = unsafe { &*raw };
        ScxStats::inc(&self.stats.nr_hook_calls);
        Some(OpsGuard { rq, handle })
    }

    /// The policy handle for task-context operations. Holding the fork
    /// rwsem keeps the handle alive; bypassing instances are returned so
    /// tasks can still leave them cleanly.
    pub(crate) fn locked_handle<'g>(
        &'g self,
        _fork: &'g RwLockReadGuard<'_, ()>,
    ) -> Option<(&'g PolicyHandle, EnableSnapshot)> {
        let snap = self.state.load(Ordering::SeqCst);
        if !matches!(
            snap.kind,
            EnableStateKind::Enabled | EnableStateKind::Disabling
        ) {
            return None;
        }
        let raw = self.ops.load(Ordering::Acquire);
        // SAFETY: detach frees the handle only under the fork rwsem write
        // side, which `_fork` excludes.
        unsafe { raw.as_ref() }
            .filter(|h| h.generation == snap.generation)
            .map(|h| (h, snap))
    }

    /// Invoke a policy callback with panic isolation and the callback
    /// budget. Returns `None` if the callback panicked.
    pub(crate) fn call<R>(
        &self,
        handle: &PolicyHandle,
        cpu: Option<CpuId>,
        what: &'static str,
        f: impl FnOnce(&dyn SchedExtOps, &OpsCtx<'_>) -> R,
    ) -> Option<R> {
        let cx = OpsCtx::new(self, cpu, handle.generation);
        let start = Instant::now();
        let res = panic::catch_unwind(AssertUnwindSafe(|| f(handle.ops.as_ref(), &cx)));
        let elapsed = start.elapsed();

        match res {
            Ok(ret) => {
                let budget = Duration::from_nanos(self.config.callback_budget_ns);
                if elapsed > budget {
                    self.raise_exit(
                        handle.generation,
                        ExitInfo::new(
                            ExitKind::ErrorPolicy,
                            0,
                            format!("{what}() ran for {elapsed:?}, budget is {budget:?}"),
                        ),
                    );
                }
                Some(ret)
            }
            Err(panic) => {
                self.raise_exit(
                    handle.generation,
                    ExitInfo::new(
                        ExitKind::ErrorPolicy,
                        0,
                        format!("{what}() panicked: {}", panic_message(panic.as_ref())),
                    ),
                );
                None
            }
        }
    }

    /// Record `info` as the exit reason of `generation` unless one was
    /// already recorded. Returns whether it was recorded.
    fn record_exit(&self, generation: u64, info: ExitInfo) -> bool {
        let mut pending = self.pending_exit.lock();
        if pending.as_ref().is_some_and(|p| p.generation == generation) {
            return false;
        }
        *pending = Some(PendingExit { generation, info });
        true
    }

    fn has_pending_exit(&self, generation: u64) -> bool {
        self.pending_exit
            .lock()
            .as_ref()
            .is_some_and(|p| p.generation == generation)
    }

    fn pending_reason(&self, generation: u64) -> String {
        self.pending_exit
            .lock()
            .as_ref()
            .filter(|p| p.generation == generation)
            .and_then(|p| p.info.msg.clone())
            .unwrap_or_else(|| "policy exited during attach".into())
    }

    /// End policy instance `generation`. Never blocks: the state moves to
    /// `Disabling` here and the detach itself runs on the disable worker.
    /// Only the first exit of a generation counts.
    pub(crate) fn raise_exit(&self, generation: u64, info: ExitInfo) -> bool {
        if !self.record_exit(generation, info.clone()) {
            return false;
        }
        if info.kind.is_error() {
            ScxStats::inc(&self.stats.nr_faults);
            warn!(
                generation,
                kind = ?info.kind,
                "policy fault: {}",
                info.msg.as_deref().unwrap_or("")
            );
        } else {
            info!(
                generation,
                exit_code = info.exit_code,
                "policy exit requested: {}",
                info.msg.as_deref().unwrap_or("")
            );
        }

        let flipped = self
            .state
            .transition(
                generation,
                EnableStateKind::Enabled,
                EnableStateKind::Disabling,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !flipped {
            // Attach or detach is running and picks the exit up itself.
            return true;
        }

        if info.kind.is_error() {
            self.publish(ScxEvent::Fault {
                name: self.policy_name().unwrap_or_default(),
                generation,
                info,
            });
        }
        if !disable::request_disable(&self.disable_tx, generation) {
            warn!(generation, "disable request queue full");
        }
        true
    }

    pub(crate) fn publish(&self, event: ScxEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                ScxStats::inc(&self.stats.nr_events_dropped);
                debug!(generation = event.generation(), "event channel full, dropping");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Run `init_task` for `p` and mark it as owned by `handle`.
    pub(crate) fn init_task(&self, handle: &PolicyHandle, p: &Task, fork: bool) -> Result<(), String> {
        match self.call(handle, None, "init_task", |ops, cx| {
            ops.init_task(cx, p, InitTaskArgs { fork })
        }) {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(format!("{e:#}")),
            None => return Err("init_task() panicked".into()),
        }

        if p.scx.disallowed() && p.policy() == SchedPolicy::Ext {
            if fork {
                self.raise_exit(
                    handle.generation,
                    ExitInfo::new(
                        ExitKind::ErrorPolicy,
                        0,
                        format!(
                            "init_task() set disallow for {}[{}] during fork",
                            p.comm(),
                            p.pid()
                        ),
                    ),
                );
            } else {
                debug!(pid = %p.pid(), comm = p.comm(), "disallowed, moving to SCHED_NORMAL");
                p.set_policy(SchedPolicy::Normal);
            }
        }

        p.scx.set_ops_gen(handle.generation);
        p.scx.set_state(ScxTaskState::Classified);
        self.fork_acct.initialized.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Run `exit_task` for `p` if `handle` initialized it.
    pub(crate) fn exit_task(&self, handle: &PolicyHandle, p: &Task, cancelled: bool) {
        if p.scx.ops_gen() != handle.generation {
            return;
        }
        self.call(handle, None, "exit_task", |ops, cx| {
            ops.exit_task(cx, p, ExitTaskArgs { cancelled })
        });
        p.scx.set_ops_gen(0);
        self.fork_acct.initialized.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether `p` should be served by the extension right now.
    pub fn task_should_use_extension(&self, p: &Task) -> bool {
        let snap = self.state.load(Ordering::Acquire);
        if !snap.is_enabled() || p.nr_cpus_allowed() == 0 || self.nr_online() == 0 {
            return false;
        }
        if p.scx.disallowed() || p.scx.state() == ScxTaskState::Exited {
            return false;
        }
        match p.policy() {
            SchedPolicy::Ext => true,
            policy => policy.is_fair() && snap.switch_all,
        }
    }

    /// Whether `p` is currently served by the extension.
    pub fn task_on_scx(&self, p: &Task) -> bool {
        self.is_enabled() && p.sched_class() == SchedClass::Ext
    }

    /// Move `p` into or out of the extension class to match its current
    /// eligibility. Task context.
    pub(crate) fn reclassify(&self, handle: Option<&PolicyHandle>, p: &Task) {
        let on_ext = p.sched_class() == SchedClass::Ext;
        let Some(handle) = handle.filter(|h| p.scx.ops_gen() == h.generation) else {
            if on_ext {
                p.set_sched_class(default_class(p.policy()));
            }
            return;
        };

        let want_ext = self.task_should_use_extension(p);
        if want_ext && !on_ext {
            p.set_sched_class(SchedClass::Ext);
            if !p.scx.is_enabled() {
                self.call(handle, None, "enable", |ops, cx| ops.enable(cx, p));
                p.scx.set_enabled(true);
            }
        } else if !want_ext && on_ext {
            if p.scx.is_enabled() {
                self.call(handle, None, "disable", |ops, cx| ops.disable(cx, p));
                p.scx.set_enabled(false);
            }
            p.scx.set_dsq(None);
            p.set_sched_class(default_class(p.policy()));
        }
    }
}

impl Drop for ScxController {
    fn drop(&mut self) {
        self.disable_with(None, ExitInfo::new(ExitKind::Unreg, 0, "controller dropped"));

        // Disconnect the worker, then reap it unless we are the worker.
        let (tx, _) = channel::bounded(1);
        drop(std::mem::replace(&mut self.disable_tx, tx));
        if let Some(worker) = self.disable_worker.lock().take() {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

