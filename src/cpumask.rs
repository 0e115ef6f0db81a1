// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A Cpumask object is simply a BitVec of u64's sized to the number of CPUs
//! the controller manages, along with a series of helper functions for
//! creating, manipulating, and reading these BitVec objects. Tasks carry one
//! as their affinity.
//!
//!```rust
//!     use scx_ext::Cpumask;
//!     let mut mask = Cpumask::new(8);
//!     assert!(!mask.test_cpu(0));
//!     mask.set_cpu(0).unwrap();
//!     assert!(mask.test_cpu(0));
//!
//!     let list = Cpumask::from_cpulist(8, "0-2,5").unwrap();
//!     assert_eq!(list.weight(), 4);
//!```

use std::fmt;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::CpuId;

#[derive(Debug, Eq, Clone, Hash, PartialEq, Serialize, Deserialize)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask object covering `nr_cpus` CPUs.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask with every CPU set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Parse a cpulist such as `"0-3,6,8-9"`.
    pub fn from_cpulist(nr_cpus: usize, cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for group in cpulist.split(',').map(str::trim).filter(|g| !g.is_empty()) {
            let (lo, hi) = match group.split_once('-') {
                Some((lo, hi)) => (lo, hi),
                None => (group, group),
            };
            let lo: usize = lo
                .parse()
                .with_context(|| format!("Failed to parse cpulist: {cpulist}"))?;
            let hi: usize = hi
                .parse()
                .with_context(|| format!("Failed to parse cpulist: {cpulist}"))?;
            if lo > hi {
                bail!("Invalid range {}-{} in cpulist {}", lo, hi, cpulist);
            }
            for cpu in lo..=hi {
                mask.set_cpu(cpu)?;
            }
        }

        Ok(mask)
    }

    pub fn from_cpus(nr_cpus: usize, cpus: &[CpuId]) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in cpus {
            mask.set_cpu(cpu.index())?;
        }
        Ok(mask)
    }

    /// Return a slice of u64's whose bits reflect the Cpumask.
    pub fn as_raw_slice(&self) -> &[u64] {
        self.mask.as_raw_slice()
    }

    /// Set all bits in the Cpumask to 1
    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    /// Set all bits in the Cpumask to 0
    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. Out of range
    /// CPUs are reported as not set.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The total size of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Lowest CPU set in the mask.
    pub fn first(&self) -> Option<CpuId> {
        self.mask.first_one().map(|cpu| CpuId(cpu as u32))
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= other.mask.clone();
        new
    }

    /// Iterate over the CPUs set in the mask.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.mask.iter_ones().map(|cpu| CpuId(cpu as u32))
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cpus = self.mask.iter_ones().peekable();
        while let Some(lo) = cpus.next() {
            let mut hi = lo;
            while cpus.peek() == Some(&(hi + 1)) {
                hi += 1;
                cpus.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if lo == hi {
                write!(f, "{lo}")?;
            } else {
                write!(f, "{lo}-{hi}")?;
            }
        }
        Ok(())
    }
}
