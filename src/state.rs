use std::sync::atomic::{AtomicU64, Ordering};

/// The global enable state of the extension, packed with the generation of
/// the policy instance it refers to and whether that policy claims every
/// fair task.
///
/// Every attach starts a new generation. Readers take one snapshot per
/// scheduling decision and never combine fields from two loads.
#[repr(transparent)]
pub struct EnableState(AtomicU64);

/// One point-in-time view of [`EnableState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnableSnapshot {
    pub kind: EnableStateKind,
    pub generation: u64,
    /// Fair-policy tasks move to the extension (no `SWITCH_PARTIAL`).
    pub switch_all: bool,
}

impl EnableSnapshot {
    pub fn is_enabled(self) -> bool {
        matches!(self.kind, EnableStateKind::Enabled)
    }
}

impl EnableState {
    /// Create a new, disabled [`EnableState`] at generation zero.
    pub const fn new() -> Self {
        Self(AtomicU64::new(Self::pack(EnableStateKind::Disabled, false, 0)))
    }

    /// Load a snapshot with the specified ordering.
    pub fn load(&self, order: Ordering) -> EnableSnapshot {
        Self::unpack(self.0.load(order))
    }

    /// Store a new state with the specified ordering.
    pub fn store(&self, kind: EnableStateKind, switch_all: bool, generation: u64, order: Ordering) {
        self.0.store(Self::pack(kind, switch_all, generation), order);
    }

    /// Atomically move from `current` to `new` if the cell still refers to
    /// `generation`. The switch-all bit is preserved.
    pub fn transition(
        &self,
        generation: u64,
        current: EnableStateKind,
        new: EnableStateKind,
        success: Ordering,
        failure: Ordering,
    ) -> Result<EnableSnapshot, EnableSnapshot> {
        let mut raw = self.0.load(failure);
        loop {
            let snap = Self::unpack(raw);
            if snap.generation != generation || snap.kind != current {
                return Err(snap);
            }
            let next = Self::pack(new, snap.switch_all, generation);
            match self.0.compare_exchange_weak(raw, next, success, failure) {
                Ok(_) => return Ok(snap),
                Err(actual) => raw = actual,
            }
        }
    }

    const fn pack(kind: EnableStateKind, switch_all: bool, generation: u64) -> u64 {
        (generation << GEN_SHIFT) | ((switch_all as u64) << SWITCH_ALL_BIT) | kind as u64
    }

    const fn unpack(raw: u64) -> EnableSnapshot {
        EnableSnapshot {
            kind: EnableStateKind::from_bits(raw & KIND_MASK),
            generation: raw >> GEN_SHIFT,
            switch_all: raw & (1 << SWITCH_ALL_BIT) != 0,
        }
    }
}

impl Default for EnableState {
    fn default() -> Self {
        Self::new()
    }
}

/// Enum classifying the enable states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum EnableStateKind {
    /// A policy is being validated and initialized.
    Enabling = SCX_ENABLING,
    /// A policy is attached and consulted by the hooks.
    Enabled = SCX_ENABLED,
    /// A policy is being torn down; hooks bypass it.
    Disabling = SCX_DISABLING,
    /// No policy is attached.
    Disabled = SCX_DISABLED,
}

impl EnableStateKind {
    const fn from_bits(bits: u64) -> Self {
        match bits {
            SCX_ENABLING => EnableStateKind::Enabling,
            SCX_ENABLED => EnableStateKind::Enabled,
            SCX_DISABLING => EnableStateKind::Disabling,
            _ => EnableStateKind::Disabled,
        }
    }
}

const KIND_MASK: u64 = 0b11;
const SWITCH_ALL_BIT: u32 = 2;
const GEN_SHIFT: u32 = 3;

const SCX_ENABLING: u64 = 0;
const SCX_ENABLED: u64 = 1;
const SCX_DISABLING: u64 = 2;
const SCX_DISABLED: u64 = 3;
