//! scx_ext - Host-side core of the extensible scheduler class.
//!
//! This crate implements what the host scheduler does to let a pluggable
//! policy take over task scheduling at runtime, and to take it away again
//! without ever leaving the system unscheduled.
//!
//! # Architecture
//!
//! - **Controller**: attach/detach of a single policy instance at a time,
//!   the global enable state and the per-CPU entry protocol
//! - **Lifecycle**: fork hooks, reaping, policy and affinity changes
//! - **Per-CPU hooks**: tick, idle edges, tick suppression, performance
//!   targets and CPU hotplug
//! - **Core scheduling**: a cross-class priority order that never lets a
//!   policy make it reflexive or symmetric
//! - **Kfuncs**: helpers a policy calls from its callbacks
//! - **Interleave**: a deterministic token ring for exploring thread
//!   interleavings of the above in tests
//!
//! # Usage
//!
//! ```rust,no_run
//! use scx_ext::*;
//!
//! let ctl = ScxController::new(ScxConfig::builder().cpus(4).build()?)?;
//! ctl.try_attach(Box::new(SimplePolicy::new(false)))?;
//!
//! let task = Task::builder(Pid(1), "worker", 4).build();
//! ctl.register_task(task.clone())?;
//! ctl.runnable(CpuId(0), &task, 0, enq_flags::WAKEUP);
//! ctl.tick(CpuId(0), Some(&*task), 1_000_000);
//!
//! ctl.detach();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod controller;
pub mod core_sched;
pub mod cpumask;
pub mod disable;
pub mod error;
pub mod idle;
pub mod interleave;
pub mod kfuncs;
pub mod lifecycle;
pub mod ops;
pub mod policies;
pub mod rq;
pub mod state;
pub mod stats;
pub mod task;
pub mod tick;
pub mod types;

// Re-export the main public types for convenience.
pub use config::{parse_duration_ns, ScxConfig, ScxConfigBuilder};
pub use controller::{ScxController, SCX_OPS_NAME_LEN};
pub use core_sched::default_prio_less;
pub use cpumask::Cpumask;
pub use disable::ScxEvent;
pub use error::{ecode, ClassTransitionError, ExitInfo, ExitKind, ScxError};
pub use idle::IdleMask;
pub use kfuncs::OpsCtx;
pub use lifecycle::ForkReservation;
pub use ops::{deq_flags, enq_flags, ExitTaskArgs, InitTaskArgs, OpsFlags, SchedExtOps};
pub use policies::SimplePolicy;
pub use rq::{ScxRq, ScxRqStats};
pub use state::{EnableSnapshot, EnableStateKind};
pub use stats::{ForkAccountingSnapshot, ScxStatsSnapshot};
pub use task::{default_class, task_flags, SchedExtEntity, ScxTaskState, Task, TaskBuilder};
pub use types::*;
