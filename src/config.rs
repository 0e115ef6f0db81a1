//! Controller configuration.
//!
//! Built with [`ScxConfig::builder()`]; every knob has a default that
//! matches the kernel's, so `ScxConfig::builder().cpus(n).build()` is enough
//! for most users. Environment overrides exist for the knobs tests and the
//! demo binary want to turn without recompiling.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::types::{TimeNs, SCX_WATCHDOG_MAX_TIMEOUT_NS};

/// Default wall-clock budget for a single policy callback: 10ms.
pub const DEFAULT_CALLBACK_BUDGET_NS: TimeNs = 10_000_000;

/// Stall timeout used when a policy does not request one.
pub const DEFAULT_WATCHDOG_TIMEOUT_NS: TimeNs = SCX_WATCHDOG_MAX_TIMEOUT_NS;

/// Default capacity of the out-of-band event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Largest CPU count the controller accepts.
pub const MAX_CPUS: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScxConfig {
    pub nr_cpus: u32,
    /// A callback running longer than this faults the policy.
    pub callback_budget_ns: TimeNs,
    /// Largest stall timeout a policy may request.
    pub watchdog_timeout_max_ns: TimeNs,
    pub event_capacity: usize,
}

impl ScxConfig {
    pub fn builder() -> ScxConfigBuilder {
        ScxConfigBuilder {
            nr_cpus: 1,
            callback_budget_ns: callback_budget_from_env(),
            watchdog_timeout_max_ns: SCX_WATCHDOG_MAX_TIMEOUT_NS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

pub struct ScxConfigBuilder {
    nr_cpus: u32,
    callback_budget_ns: TimeNs,
    watchdog_timeout_max_ns: TimeNs,
    event_capacity: usize,
}

impl ScxConfigBuilder {
    /// Set the number of CPUs the host schedules onto.
    pub fn cpus(mut self, n: u32) -> Self {
        self.nr_cpus = n;
        self
    }

    pub fn callback_budget_ns(mut self, ns: TimeNs) -> Self {
        self.callback_budget_ns = ns;
        self
    }

    pub fn callback_budget(self, budget: std::time::Duration) -> Self {
        let ns = u64::try_from(budget.as_nanos()).unwrap_or(u64::MAX);
        self.callback_budget_ns(ns)
    }

    /// Cap on the stall timeout a policy may request. Must not exceed
    /// `SCX_WATCHDOG_MAX_TIMEOUT_NS`.
    pub fn watchdog_timeout_max_ns(mut self, ns: TimeNs) -> Self {
        self.watchdog_timeout_max_ns = ns;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ScxConfig> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            bail!(
                "nr_cpus ({}) must be between 1 and {}",
                self.nr_cpus,
                MAX_CPUS
            );
        }
        if self.callback_budget_ns == 0 {
            bail!("callback budget must be non-zero");
        }
        if self.watchdog_timeout_max_ns == 0
            || self.watchdog_timeout_max_ns > SCX_WATCHDOG_MAX_TIMEOUT_NS
        {
            bail!(
                "watchdog timeout cap ({}ns) must be between 1ns and {}ns",
                self.watchdog_timeout_max_ns,
                SCX_WATCHDOG_MAX_TIMEOUT_NS
            );
        }
        if self.event_capacity == 0 {
            bail!("event channel capacity must be non-zero");
        }
        Ok(ScxConfig {
            nr_cpus: self.nr_cpus,
            callback_budget_ns: self.callback_budget_ns,
            watchdog_timeout_max_ns: self.watchdog_timeout_max_ns,
            event_capacity: self.event_capacity,
        })
    }
}

/// Resolve the callback budget from the `SCX_EXT_BUDGET` environment
/// variable.
///
/// - Unset or empty: returns `DEFAULT_CALLBACK_BUDGET_NS` (10ms).
/// - Anything [`parse_duration_ns`] accepts, e.g. `"250ms"`.
pub fn callback_budget_from_env() -> TimeNs {
    match std::env::var("SCX_EXT_BUDGET").ok().as_deref() {
        None | Some("") => DEFAULT_CALLBACK_BUDGET_NS,
        Some(s) => parse_duration_ns(s).unwrap_or_else(|e| {
            tracing::warn!("SCX_EXT_BUDGET={s:?}: {e}, using the default");
            DEFAULT_CALLBACK_BUDGET_NS
        }),
    }
}

/// Parse a duration string with optional unit suffix into nanoseconds.
///
/// Supported formats:
/// - `"1s"`, `"0.5s"`: seconds
/// - `"500ms"`: milliseconds
/// - `"100us"`, `"100μs"`: microseconds
/// - `"1000ns"`: nanoseconds (explicit)
/// - `"1000000"`: bare number, interpreted as nanoseconds
pub fn parse_duration_ns(s: &str) -> Result<TimeNs, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".into());
    }

    // Longest suffix first so "ms" is not read as "s".
    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1_000_000.0)
    } else if let Some(n) = s.strip_suffix("us") {
        (n, 1_000.0)
    } else if let Some(n) = s.strip_suffix("μs") {
        (n, 1_000.0)
    } else if let Some(n) = s.strip_suffix("ns") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000_000_000.0)
    } else {
        (s, 1.0)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration number: {num_str:?}"))?;

    if num < 0.0 {
        return Err(format!("duration must be non-negative: {s:?}"));
    }

    let ns = num * multiplier;
    if ns > u64::MAX as f64 {
        return Err(format!("duration overflow: {s:?}"));
    }

    Ok(ns as TimeNs)
}
