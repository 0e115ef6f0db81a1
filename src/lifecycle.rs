//! Task lifecycle hooks: fork, reaping, policy and affinity changes, and
//! the runnable/quiescent transitions that hand out queue-membership
//! tokens.
//!
//! A fork is bracketed by a [`ForkReservation`] that holds the fork rwsem
//! for reading from `pre_fork` until `post_fork` or `cancel_fork`, so a
//! policy cannot be attached or detached underneath a half-created task.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLockReadGuard;
use tracing::debug;

use crate::controller::ScxController;
use crate::cpumask::Cpumask;
use crate::error::{ClassTransitionError, ExitInfo, ExitKind, ScxError};
use crate::interleave;
use crate::task::{default_class, ScxTaskState, Task};
use crate::types::{CpuId, DsqId, Pid, SchedClass, SchedPolicy, TimeNs};

/// Resources reserved by `pre_fork`. Consumed by `post_fork` or
/// `cancel_fork`; dropping it releases the reservation as well.
#[must_use = "a fork reservation must be completed or cancelled"]
pub struct ForkReservation<'a> {
    ctl: &'a ScxController,
    fork: RwLockReadGuard<'a, ()>,
    parent: Pid,
}

impl ForkReservation<'_> {
    pub fn parent(&self) -> Pid {
        self.parent
    }
}

impl Drop for ForkReservation<'_> {
    fn drop(&mut self) {
        self.ctl.fork_acct.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ScxController {
    /// Reserve what the child's entity needs. Blocks while a policy is
    /// being attached or detached.
    ///
    /// The other task-context operations may run on the forking thread
    /// while the reservation is held. A second `pre_fork` on that thread
    /// may not: it queues behind a waiting detach, which waits for the
    /// first reservation.
    pub fn pre_fork(&self, parent: &Task) -> ForkReservation<'_> {
        let fork = interleave::read(&self.fork_rwsem);
        self.fork_acct.reserved.fetch_add(1, Ordering::AcqRel);
        ForkReservation {
            ctl: self,
            fork,
            parent: parent.pid(),
        }
    }

    /// Initialize the child's entity with the active policy, if any.
    ///
    /// On error nothing of the child is visible to the policy; the caller
    /// aborts the fork and calls [`cancel_fork`](Self::cancel_fork).
    pub fn fork(&self, res: &ForkReservation<'_>, child: &Task) -> Result<(), ScxError> {
        debug_assert!(std::ptr::eq(res.ctl, self));
        child.scx.set_state(ScxTaskState::PreFork);

        if let Some((handle, snap)) = self.locked_handle(&res.fork) {
            if snap.is_enabled() {
                if let Err(reason) = self.init_task(handle, child, true) {
                    child.scx.reset();
                    self.fork_acct.nr_failed.fetch_add(1, Ordering::Relaxed);
                    debug!(pid = %child.pid(), parent = %res.parent, "fork failed: {reason}");
                    return Err(ScxError::AllocationFailure {
                        pid: child.pid(),
                        reason,
                    });
                }
            }
        }

        child.scx.set_state(ScxTaskState::Classified);
        Ok(())
    }

    /// The child is linked into the host. Registers it and moves it into
    /// the extension class if it is eligible.
    pub fn post_fork(&self, res: ForkReservation<'_>, child: &Arc<Task>) {
        debug_assert!(std::ptr::eq(res.ctl, self));
        self.tasks.lock().insert(child.pid(), child.clone());
        let handle = self.locked_handle(&res.fork).map(|(h, _)| h);
        self.reclassify(handle, child);
    }

    /// Abandon a fork after `pre_fork`. Undoes `fork` if it initialized the
    /// child.
    pub fn cancel_fork(&self, res: ForkReservation<'_>, child: &Task) {
        debug_assert!(std::ptr::eq(res.ctl, self));
        if let Some((handle, _)) = self.locked_handle(&res.fork) {
            self.exit_task(handle, child, true);
        }
        child.scx.reset();
        child.scx.set_state(ScxTaskState::Cancelled);
        self.fork_acct.nr_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Adopt a task that was not created through the fork hooks, such as
    /// boot-time tasks.
    pub fn register_task(&self, p: Arc<Task>) -> Result<(), ScxError> {
        let fork = interleave::read_recursive(&self.fork_rwsem);
        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&p.pid()) {
                return Ok(());
            }
            tasks.insert(p.pid(), p.clone());
        }

        let handle = self.locked_handle(&fork);
        if let Some((h, snap)) = handle {
            if snap.is_enabled() {
                if let Err(reason) = self.init_task(h, &p, false) {
                    self.tasks.lock().remove(&p.pid());
                    p.scx.reset();
                    return Err(ScxError::AllocationFailure {
                        pid: p.pid(),
                        reason,
                    });
                }
            }
        }
        p.scx.set_state(ScxTaskState::Classified);
        self.reclassify(handle.map(|(h, _)| h), &p);
        Ok(())
    }

    /// The task was reaped. No callback sees it afterwards.
    pub fn task_dead(&self, p: &Task) {
        let fork = interleave::read_recursive(&self.fork_rwsem);
        self.tasks.lock().remove(&p.pid());

        if let Some((handle, _)) = self.locked_handle(&fork) {
            if p.scx.is_enabled() {
                self.call(handle, None, "disable", |ops, cx| ops.disable(cx, p));
                p.scx.set_enabled(false);
            }
            self.exit_task(handle, p, false);
        }
        p.scx.set_dsq(None);
        p.scx.set_state(ScxTaskState::Exited);
        if p.sched_class() == SchedClass::Ext {
            p.set_sched_class(default_class(p.policy()));
        }
    }

    /// Validate a policy change of `p` to `policy`.
    pub fn check_setscheduler(&self, p: &Task, policy: SchedPolicy) -> Result<(), ScxError> {
        if policy == SchedPolicy::Ext && p.is_rt_pinned() {
            return Err(ScxError::InvalidClassTransition {
                pid: p.pid(),
                reason: ClassTransitionError::RtPinned,
            });
        }
        if self.is_enabled()
            && p.scx.disallowed()
            && p.policy() != policy
            && policy == SchedPolicy::Ext
        {
            return Err(ScxError::InvalidClassTransition {
                pid: p.pid(),
                reason: ClassTransitionError::Disallowed,
            });
        }
        Ok(())
    }

    /// Change the policy of `p` and move it between classes accordingly.
    /// On error nothing changes.
    pub fn sched_setscheduler(&self, p: &Task, policy: SchedPolicy) -> Result<(), ScxError> {
        let fork = interleave::read_recursive(&self.fork_rwsem);
        self.check_setscheduler(p, policy)?;

        let old = p.policy();
        p.set_policy(policy);
        if p.sched_class() != SchedClass::Ext {
            p.set_sched_class(default_class(policy));
        }
        self.reclassify(self.locked_handle(&fork).map(|(h, _)| h), p);
        debug!(pid = %p.pid(), ?old, new = ?policy, class = ?p.sched_class(), "setscheduler");
        Ok(())
    }

    /// Change the affinity of `p`. Tasks left without any allowed CPU drop
    /// out of the extension.
    pub fn set_cpus_allowed(&self, p: &Task, mask: Cpumask) {
        let fork = interleave::read_recursive(&self.fork_rwsem);
        p.set_cpus_allowed(mask);
        let handle = self.locked_handle(&fork).map(|(h, _)| h);
        if let Some(h) = handle {
            if p.sched_class() == SchedClass::Ext && p.nr_cpus_allowed() > 0 {
                let mask = p.cpus_allowed();
                self.call(h, None, "set_cpumask", |ops, cx| ops.set_cpumask(cx, p, &mask));
            }
        }
        self.reclassify(handle, p);
    }

    /// `p` became runnable on `cpu` at `now`. For tasks on the extension
    /// the policy picks the queue, which becomes the task's
    /// queue-membership token.
    pub fn runnable(&self, cpu: CpuId, p: &Task, now: TimeNs, enq_flags: u64) -> Option<DsqId> {
        if p.scx.state() == ScxTaskState::Exited {
            return None;
        }
        p.set_cpu(cpu);
        p.scx.touch_core_sched(now);

        let guard = self.enter(cpu)?;
        if p.sched_class() != SchedClass::Ext {
            return None;
        }
        let handle = guard.handle;
        self.call(handle, Some(cpu), "runnable", |ops, cx| {
            ops.runnable(cx, p, enq_flags)
        })?;
        let dsq = self.call(handle, Some(cpu), "enqueue", |ops, cx| {
            ops.enqueue(cx, p, enq_flags)
        })?;

        if !dsq.is_valid_target(self.nr_cpus()) {
            self.raise_exit(
                handle.generation,
                ExitInfo::new(
                    ExitKind::ErrorPolicy,
                    0,
                    format!(
                        "invalid DSQ ID 0x{:016x} for {}[{}]",
                        dsq.0,
                        p.comm(),
                        p.pid()
                    ),
                ),
            );
            return None;
        }
        p.scx.set_dsq(Some(dsq));
        Some(dsq)
    }

    /// `p` stopped being runnable. Drops its queue-membership token.
    pub fn quiescent(&self, cpu: CpuId, p: &Task, deq_flags: u64) {
        if let Some(guard) = self.enter(cpu) {
            if p.sched_class() == SchedClass::Ext && p.scx.state() != ScxTaskState::Exited {
                self.call(guard.handle, Some(cpu), "quiescent", |ops, cx| {
                    ops.quiescent(cx, p, deq_flags)
                });
            }
        }
        p.scx.set_dsq(None);
    }
}
