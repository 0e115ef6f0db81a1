//! Built-in idle CPU tracking.
//!
//! A lock-free bitmap fed by the idle edges the host reports while a policy
//! is attached. Policies claim idle CPUs through `test_and_clear`, which
//! makes a CPU unavailable to other claimants until its next idle edge.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cpumask::Cpumask;
use crate::types::CpuId;

pub struct IdleMask {
    words: Box<[AtomicU64]>,
    nr_cpus: u32,
}

impl IdleMask {
    pub fn new(nr_cpus: u32) -> Self {
        let nr_words = (nr_cpus as usize).div_ceil(64);
        Self {
            words: (0..nr_words).map(|_| AtomicU64::new(0)).collect(),
            nr_cpus,
        }
    }

    fn slot(&self, cpu: CpuId) -> Option<(&AtomicU64, u64)> {
        if cpu.0 >= self.nr_cpus {
            return None;
        }
        let word = &self.words[cpu.index() / 64];
        Some((word, 1u64 << (cpu.index() % 64)))
    }

    pub fn set(&self, cpu: CpuId) {
        if let Some((word, bit)) = self.slot(cpu) {
            word.fetch_or(bit, Ordering::AcqRel);
        }
    }

    pub fn clear(&self, cpu: CpuId) {
        if let Some((word, bit)) = self.slot(cpu) {
            word.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    pub fn test(&self, cpu: CpuId) -> bool {
        self.slot(cpu)
            .is_some_and(|(word, bit)| word.load(Ordering::Acquire) & bit != 0)
    }

    /// Claim `cpu` if it is idle.
    pub fn test_and_clear(&self, cpu: CpuId) -> bool {
        self.slot(cpu)
            .is_some_and(|(word, bit)| word.fetch_and(!bit, Ordering::AcqRel) & bit != 0)
    }

    /// Claim the first idle CPU in `allowed`.
    pub fn pick(&self, allowed: &Cpumask) -> Option<CpuId> {
        allowed.iter().find(|&cpu| self.test_and_clear(cpu))
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    pub fn weight(&self) -> u32 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_once() {
        let mask = IdleMask::new(70);
        mask.set(CpuId(65));
        assert!(mask.test(CpuId(65)));
        assert!(mask.test_and_clear(CpuId(65)));
        assert!(!mask.test_and_clear(CpuId(65)));
        assert!(!mask.test_and_clear(CpuId(200)));
    }

    #[test]
    fn test_pick_respects_affinity() {
        let mask = IdleMask::new(8);
        mask.set(CpuId(1));
        mask.set(CpuId(6));
        let allowed = Cpumask::from_cpulist(8, "4-7").unwrap();
        assert_eq!(mask.pick(&allowed), Some(CpuId(6)));
        assert_eq!(mask.pick(&allowed), None);
        assert_eq!(mask.weight(), 1);
    }
}
