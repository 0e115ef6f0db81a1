//! Newtype wrappers, type aliases and constants for domain concepts.
//!
//! Newtypes for identifiers (DSQ IDs, PIDs, CPU IDs) and virtual time
//! prevent silent type confusion. Type aliases for plain quantities
//! (timestamps) provide self-documenting code without the boilerplate
//! of implementing arithmetic traits.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default time slice handed to tasks entering the extension class.
pub const SCX_SLICE_DFL: TimeNs = 20_000_000;

/// Infinite slice. A running task with this slice lets the CPU stop its
/// periodic tick.
pub const SCX_SLICE_INF: TimeNs = u64::MAX;

/// Full CPU performance level; `cpuperf_target` values range over
/// `[0, SCX_CPUPERF_ONE]`.
pub const SCX_CPUPERF_ONE: u32 = 1024;

/// Upper bound a policy may request for its stall watchdog.
pub const SCX_WATCHDOG_MAX_TIMEOUT_NS: TimeNs = 30_000_000_000;

/// Realtime priorities are `[0, MAX_RT_PRIO)`, lower is more important.
pub const MAX_RT_PRIO: i32 = 100;

/// Default weight of a nice-0 task in cgroup-weight space.
pub const SCX_WEIGHT_DFL: u32 = 100;

/// Dispatch queue identifier. Wraps u64 with kernel bit-flag conventions.
///
/// The DSQ a task was inserted into is its queue-membership token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DsqId(pub u64);

/// Process identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Pid(pub i32);

/// CPU identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CpuId(pub u32);

impl CpuId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DsqId {
    pub const FLAG_BUILTIN: u64 = 1u64 << 63;
    /// Never a valid insertion target; marks "no queue" in atomic storage.
    pub const INVALID: DsqId = DsqId(Self::FLAG_BUILTIN);
    pub const GLOBAL: DsqId = DsqId(Self::FLAG_BUILTIN | 1);
    pub const LOCAL: DsqId = DsqId(Self::FLAG_BUILTIN | 2);
    pub const LOCAL_ON_MASK: u64 = 0xC000000000000000;
    pub const LOCAL_CPU_MASK: u64 = 0x00000000FFFFFFFF;

    pub fn local_on(cpu: CpuId) -> Self {
        DsqId(Self::LOCAL_ON_MASK | cpu.0 as u64)
    }

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }

    pub fn is_local_on(self) -> bool {
        self.0 & Self::LOCAL_ON_MASK == Self::LOCAL_ON_MASK
    }

    /// Whether this is a built-in DSQ (LOCAL, GLOBAL, or LOCAL_ON).
    pub fn is_builtin(self) -> bool {
        self.0 & Self::FLAG_BUILTIN != 0
    }

    pub fn local_on_cpu(self) -> CpuId {
        CpuId((self.0 & Self::LOCAL_CPU_MASK) as u32)
    }

    /// Whether a policy may insert a task into this queue on a system with
    /// `nr_cpus` CPUs.
    pub fn is_valid_target(self, nr_cpus: u32) -> bool {
        if self.is_local_on() {
            return self.local_on_cpu().0 < nr_cpus;
        }
        if self.is_builtin() {
            return self == Self::GLOBAL || self == Self::LOCAL;
        }
        true
    }
}

/// Simulated time in nanoseconds.
pub type TimeNs = u64;

/// Virtual time for fair scheduling (opaque u64, not nanoseconds).
///
/// Ordering uses wrapping comparison (like the kernel's `time_before64`),
/// so `Vtime(u64::MAX)` compares as less than `Vtime(0)` when they are
/// within half the u64 range of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vtime(pub u64);

impl PartialOrd for Vtime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vtime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Matches kernel time_before64: (s64)(a - b) < 0 means a < b.
        (self.0.wrapping_sub(other.0) as i64).cmp(&0)
    }
}

impl fmt::Display for Vtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling policy as requested through `sched_setscheduler`.
///
/// Discriminants match the Linux `SCHED_*` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SchedPolicy {
    Normal = 0,
    Fifo = 1,
    Rr = 2,
    Batch = 3,
    Idle = 5,
    Deadline = 6,
    Ext = 7,
}

impl SchedPolicy {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => SchedPolicy::Normal,
            1 => SchedPolicy::Fifo,
            2 => SchedPolicy::Rr,
            3 => SchedPolicy::Batch,
            5 => SchedPolicy::Idle,
            6 => SchedPolicy::Deadline,
            7 => SchedPolicy::Ext,
            _ => return None,
        })
    }

    pub fn is_rt(self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::Rr)
    }

    pub fn is_dl(self) -> bool {
        self == SchedPolicy::Deadline
    }

    /// Policies served by the fair class when the extension is not
    /// switching them.
    pub fn is_fair(self) -> bool {
        matches!(
            self,
            SchedPolicy::Normal | SchedPolicy::Batch | SchedPolicy::Idle
        )
    }
}

/// The scheduling class a task is currently served by, from the most to
/// the least important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SchedClass {
    Stop = 0,
    Deadline = 1,
    Rt = 2,
    Fair = 3,
    Ext = 4,
    Idle = 5,
}

impl SchedClass {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SchedClass::Stop,
            1 => SchedClass::Deadline,
            2 => SchedClass::Rt,
            3 => SchedClass::Fair,
            4 => SchedClass::Ext,
            _ => SchedClass::Idle,
        }
    }

    /// Class rank; smaller runs first.
    pub fn rank(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vtime_wrapping_order() {
        assert!(Vtime(u64::MAX) < Vtime(0));
        assert!(Vtime(1) < Vtime(2));
        assert!(Vtime(u64::MAX - 5) < Vtime(3));
    }

    #[test]
    fn test_dsq_targets() {
        assert!(DsqId::GLOBAL.is_valid_target(4));
        assert!(DsqId::LOCAL.is_valid_target(4));
        assert!(DsqId(42).is_valid_target(4));
        assert!(DsqId::local_on(CpuId(3)).is_valid_target(4));
        assert!(!DsqId::local_on(CpuId(4)).is_valid_target(4));
        assert!(!DsqId::INVALID.is_valid_target(4));
        assert_eq!(DsqId::local_on(CpuId(2)).local_on_cpu(), CpuId(2));
    }

    #[test]
    fn test_policy_raw_roundtrip_rejects_gaps() {
        assert_eq!(SchedPolicy::from_raw(7), Some(SchedPolicy::Ext));
        assert_eq!(SchedPolicy::from_raw(4), None);
        assert!(SchedPolicy::Rr.is_rt());
        assert!(SchedPolicy::Idle.is_fair());
    }
}
