//! Core-scheduling tie-break between tasks of possibly different classes.

use crate::controller::ScxController;
use crate::error::{ExitInfo, ExitKind};
use crate::stats::ScxStats;
use crate::task::Task;
use crate::types::SchedClass;

impl ScxController {
    /// Whether `a` has strictly lower priority than `b` for co-scheduling
    /// on sibling hardware threads. `in_fi` is set while the core is in
    /// forced idle.
    ///
    /// Classes rank first. Within a class, realtime and deadline tasks
    /// compare by priority value, fair tasks by priority value after the
    /// time they were last made runnable if in forced idle, and extension
    /// tasks by the policy's `core_sched_before`. Everything else falls
    /// back to [`default_prio_less`].
    ///
    /// The result is always irreflexive and asymmetric: a policy claiming
    /// both tasks run first is a fault and the pair falls back. Transitivity
    /// across extension tasks is up to the policy's `core_sched_before`.
    pub fn prio_less(&self, a: &Task, b: &Task, in_fi: bool) -> bool {
        let (class_a, class_b) = (a.sched_class(), b.sched_class());
        if class_a != class_b {
            return class_a.rank() > class_b.rank();
        }

        match class_a {
            SchedClass::Deadline | SchedClass::Rt => {
                if a.prio() != b.prio() {
                    return a.prio() > b.prio();
                }
            }
            SchedClass::Fair => {
                if in_fi && a.scx.core_sched_at() != b.scx.core_sched_at() {
                    return a.scx.core_sched_at() > b.scx.core_sched_at();
                }
                if a.prio() != b.prio() {
                    return a.prio() > b.prio();
                }
            }
            SchedClass::Ext => {
                if let Some(less) = self.ext_prio_less(a, b) {
                    return less;
                }
            }
            SchedClass::Stop | SchedClass::Idle => {}
        }
        default_prio_less(a, b)
    }

    fn ext_prio_less(&self, a: &Task, b: &Task) -> Option<bool> {
        if std::ptr::eq(a, b) {
            return Some(false);
        }
        // Whether the policy is asked depends on the enable state only, never
        // on which CPUs are online. The CPU just picks the in-flight slot.
        let cpu = a.cpu().min(b.cpu());
        let guard = self.enter_any(cpu)?;
        let handle = guard.handle;

        let b_first = self
            .call(handle, None, "core_sched_before", |ops, cx| {
                ops.core_sched_before(cx, b, a)
            })
            .flatten();
        let a_first = self
            .call(handle, None, "core_sched_before", |ops, cx| {
                ops.core_sched_before(cx, a, b)
            })
            .flatten();

        match (b_first, a_first) {
            (Some(true), Some(true)) => {
                self.raise_exit(
                    handle.generation,
                    ExitInfo::new(
                        ExitKind::ErrorPolicy,
                        0,
                        format!(
                            "core_sched_before() claims both {}[{}] and {}[{}] run first",
                            a.comm(),
                            a.pid(),
                            b.comm(),
                            b.pid()
                        ),
                    ),
                );
                ScxStats::inc(&self.stats.nr_prio_fallbacks);
                None
            }
            (Some(b_first), Some(a_first)) if b_first != a_first => Some(b_first),
            _ => {
                ScxStats::inc(&self.stats.nr_prio_fallbacks);
                None
            }
        }
    }
}

/// Order used when nothing more specific applies: the task made runnable
/// later ranks lower, then the higher PID.
pub fn default_prio_less(a: &Task, b: &Task) -> bool {
    (a.scx.core_sched_at(), a.pid()) > (b.scx.core_sched_at(), b.pid())
}
