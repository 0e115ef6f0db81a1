//! Forced detachment and the out-of-band event channel.
//!
//! A fault is raised on whatever CPU or task context the policy was running
//! on, which is never a context that may block on a quiescence barrier. The
//! faulting side only flips the enable state to bypass and queues a
//! [`DisableRequest`]; the `scx_disable` worker thread performs the actual
//! detach.

use std::sync::Weak;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam::channel::{Receiver, Sender};
use serde::Serialize;

use crate::controller::ScxController;
use crate::error::{ExitInfo, ScxError};

/// Notifications published by the controller. Delivery is best effort: a
/// full channel drops the event and bumps `nr_events_dropped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ScxEvent {
    Attached { name: String, generation: u64 },
    /// A policy fault was raised. Detachment follows asynchronously.
    Fault {
        name: String,
        generation: u64,
        info: ExitInfo,
    },
    Detached {
        name: String,
        generation: u64,
        info: ExitInfo,
    },
}

impl ScxEvent {
    pub fn generation(&self) -> u64 {
        match self {
            ScxEvent::Attached { generation, .. }
            | ScxEvent::Fault { generation, .. }
            | ScxEvent::Detached { generation, .. } => *generation,
        }
    }

    /// The fault carried by this event, if any.
    pub fn to_error(&self) -> Option<ScxError> {
        match self {
            ScxEvent::Fault { name, info, .. } => Some(ScxError::PolicyFault {
                name: name.clone(),
                msg: info.msg.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DisableRequest {
    pub generation: u64,
}

/// Spawn the disable worker. The worker exits once every sender is gone or
/// the controller has been dropped.
pub(crate) fn spawn_worker(
    ctl: Weak<ScxController>,
    rx: Receiver<DisableRequest>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("scx_disable".into())
        .spawn(move || {
            while let Ok(req) = rx.recv() {
                let Some(ctl) = ctl.upgrade() else {
                    break;
                };
                tracing::debug!(generation = req.generation, "disable worker woken");
                ctl.disable_generation(req.generation);
            }
        })
        .context("Failed to spawn scx_disable worker")
}

/// Queue a detach of `generation`. Never blocks.
pub(crate) fn request_disable(tx: &Sender<DisableRequest>, generation: u64) -> bool {
    tx.try_send(DisableRequest { generation }).is_ok()
}
