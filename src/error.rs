// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Error and exit reporting.
//!
//! [`ScxError`] is returned synchronously to administrative callers and to
//! the fork path. Runtime faults inside a policy never unwind into the host;
//! they end the policy with an [`ExitInfo`] that is handed to the policy's
//! `exit` callback and published on the event channel.

use std::fmt;

use anyhow::bail;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Pid;

/// Why a `sched_setscheduler` into the extension class was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassTransitionError {
    /// The task is pinned to a realtime or deadline class.
    RtPinned,
    /// The active policy disallowed the task in `init_task`.
    Disallowed,
}

impl fmt::Display for ClassTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassTransitionError::RtPinned => f.write_str("task is pinned to a realtime class"),
            ClassTransitionError::Disallowed => f.write_str("policy disallowed the task"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScxError {
    #[error("policy {active:?} is already attached")]
    AttachConflict { active: String },

    #[error("policy {name:?} rejected: {reason}")]
    ValidationRejected { name: String, reason: String },

    #[error("failed to initialize scheduling entity for pid {pid}: {reason}")]
    AllocationFailure { pid: Pid, reason: String },

    #[error("invalid class transition for pid {pid}: {reason}")]
    InvalidClassTransition {
        pid: Pid,
        reason: ClassTransitionError,
    },

    #[error("policy {name:?} faulted: {msg}")]
    PolicyFault { name: String, msg: String },
}

impl ScxError {
    /// The errno surfaced to a syscall-style caller.
    pub fn errno(&self) -> i32 {
        match self {
            ScxError::AttachConflict { .. } => libc::EBUSY,
            ScxError::ValidationRejected { .. } => libc::EINVAL,
            ScxError::AllocationFailure { .. } => libc::ENOMEM,
            ScxError::InvalidClassTransition { .. } => libc::EINVAL,
            ScxError::PolicyFault { .. } => libc::EIO,
        }
    }
}

/// How a policy instance ended. Values follow the kernel's `scx_exit_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitKind {
    #[default]
    None = 0,
    Done = 1,
    Unreg = 64,
    SysRq = 67,
    Error = 1024,
    ErrorPolicy = 1025,
    ErrorStall = 1026,
}

impl ExitKind {
    pub fn is_error(self) -> bool {
        self as i32 >= ExitKind::Error as i32
    }

    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ExitKind::Done,
            64 => ExitKind::Unreg,
            67 => ExitKind::SysRq,
            1024 => ExitKind::Error,
            1025 => ExitKind::ErrorPolicy,
            1026 => ExitKind::ErrorStall,
            _ => ExitKind::None,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            ExitKind::None => "",
            ExitKind::Done => "policy requested exit",
            ExitKind::Unreg => "unregistered from user space",
            ExitKind::SysRq => "disabled by sysrq",
            ExitKind::Error => "runtime error",
            ExitKind::ErrorPolicy => "scheduling policy error",
            ExitKind::ErrorStall => "runnable task stall",
        }
    }
}

/// Exit code bits. The low 32 bits are free for the policy; the host sets
/// reason bits in `[32, 48)` and action bits in `[48, 64)`.
pub mod ecode {
    pub const RSN_HOTPLUG: u64 = 1 << 32;
    pub const ACT_RESTART: u64 = 1 << 48;
}

/// Record of why a policy instance was detached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub kind: ExitKind,
    pub exit_code: u64,
    pub reason: Option<String>,
    pub msg: Option<String>,
}

impl ExitInfo {
    pub fn new(kind: ExitKind, exit_code: u64, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            kind,
            exit_code,
            reason: Some(kind.reason().to_string()).filter(|s| !s.is_empty()),
            msg: Some(msg).filter(|s| !s.is_empty()),
        }
    }

    pub fn should_restart(&self) -> bool {
        self.exit_code & ecode::ACT_RESTART != 0
    }

    /// Log the exit if it was voluntary. After an error exit, returns an
    /// error containing the exit message instead.
    pub fn report(&self) -> Result<()> {
        if self.kind == ExitKind::None {
            return Ok(());
        }

        let why = match (&self.reason, &self.msg) {
            (Some(reason), None) => format!("EXIT: {}", reason),
            (Some(reason), Some(msg)) => format!("EXIT: {} ({})", reason, msg),
            _ => "<UNKNOWN>".into(),
        };

        if self.kind.is_error() {
            bail!("{}", why)
        } else {
            tracing::info!("{}", why);
            Ok(())
        }
    }
}
