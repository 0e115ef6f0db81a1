#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use scx_ext::*;

/// Initialize tracing from `RUST_LOG`.
///
/// `try_init()` is idempotent: first call in the process succeeds,
/// subsequent calls are silently ignored.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A controller with a callback budget generous enough for loaded CI
/// machines.
pub fn controller(nr_cpus: u32) -> Arc<ScxController> {
    controller_with_budget(nr_cpus, Duration::from_secs(5))
}

pub fn controller_with_budget(nr_cpus: u32, budget: Duration) -> Arc<ScxController> {
    let cfg = ScxConfig::builder()
        .cpus(nr_cpus)
        .callback_budget(budget)
        .build()
        .unwrap();
    ScxController::new(cfg).unwrap()
}

/// A registered normal task on `cpu`.
pub fn spawn_task(ctl: &ScxController, pid: i32, cpu: u32) -> Arc<Task> {
    let task = Task::builder(Pid(pid), format!("task-{pid}"), ctl.nr_cpus())
        .cpu(CpuId(cpu))
        .build();
    ctl.register_task(task.clone()).unwrap();
    task
}

/// Poll until the controller reaches `kind` or `timeout` elapses.
pub fn wait_for_state(ctl: &ScxController, kind: EnableStateKind, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if ctl.state().kind == kind {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    ctl.state().kind == kind
}

/// Callback counters shared between a test and the policy it attached.
#[derive(Default)]
pub struct Counters {
    pub init: AtomicU64,
    pub exit: AtomicU64,
    pub init_task: AtomicU64,
    pub exit_task: AtomicU64,
    pub exit_task_cancelled: AtomicU64,
    pub enable: AtomicU64,
    pub disable: AtomicU64,
    pub runnable: AtomicU64,
    pub enqueue: AtomicU64,
    pub quiescent: AtomicU64,
    pub tick: AtomicU64,
    pub update_idle: AtomicU64,
    pub cpu_online: AtomicU64,
    pub cpu_offline: AtomicU64,
    pub set_cpumask: AtomicU64,
    pub core_sched_before: AtomicU64,
    /// Callbacks executing right now.
    pub in_callback: AtomicI64,
    /// Idle edges in the order the policy heard them.
    pub idle_edges: Mutex<Vec<(CpuId, bool)>>,
    pub exit_info: Mutex<Option<ExitInfo>>,
}

impl Counters {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }

    pub fn edges_for(&self, cpu: CpuId) -> Vec<bool> {
        self.idle_edges
            .lock()
            .iter()
            .filter(|(c, _)| *c == cpu)
            .map(|(_, idle)| *idle)
            .collect()
    }
}

/// Increments `in_callback` for its lifetime.
struct InCallback<'a>(&'a AtomicI64);

impl<'a> InCallback<'a> {
    fn new(counter: &'a AtomicI64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InCallback(counter)
    }
}

impl Drop for InCallback<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreSchedMode {
    /// No opinion; the host default applies.
    Default,
    /// Lower `dsq_vtime` runs first.
    Vtime,
    /// Claims every task runs first.
    AlwaysFirst,
}

/// Instrumented policy with fault injection.
pub struct TestPolicy {
    pub name: String,
    pub flags: OpsFlags,
    pub timeout_ns: TimeNs,
    pub counters: Arc<Counters>,
    pub fail_init: bool,
    pub fail_init_task: Option<Pid>,
    pub disallow: Option<Pid>,
    pub panic_in_tick: bool,
    pub sleep_in_tick: Option<Duration>,
    pub dsq: DsqId,
    pub core_sched: CoreSchedMode,
    /// Set this performance target from every tick.
    pub tick_perf: Option<u32>,
}

impl TestPolicy {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            flags: OpsFlags::HAS_UPDATE_IDLE | OpsFlags::KEEP_BUILTIN_IDLE | OpsFlags::HAS_CPU_HOTPLUG,
            timeout_ns: 0,
            counters: Arc::new(Counters::default()),
            fail_init: false,
            fail_init_task: None,
            disallow: None,
            panic_in_tick: false,
            sleep_in_tick: None,
            dsq: DsqId::GLOBAL,
            core_sched: CoreSchedMode::Default,
            tick_perf: None,
        }
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    fn bump(&self, counter: &AtomicU64) -> InCallback<'_> {
        counter.fetch_add(1, Ordering::SeqCst);
        InCallback::new(&self.counters.in_callback)
    }
}

impl SchedExtOps for TestPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> OpsFlags {
        self.flags
    }

    fn timeout_ns(&self) -> TimeNs {
        self.timeout_ns
    }

    fn init(&self, _cx: &OpsCtx<'_>) -> Result<()> {
        let _g = self.bump(&self.counters.init);
        if self.fail_init {
            bail!("init refused");
        }
        Ok(())
    }

    fn exit(&self, info: &ExitInfo) {
        let _g = self.bump(&self.counters.exit);
        *self.counters.exit_info.lock() = Some(info.clone());
    }

    fn init_task(&self, _cx: &OpsCtx<'_>, p: &Task, _args: InitTaskArgs) -> Result<()> {
        let _g = self.bump(&self.counters.init_task);
        if self.fail_init_task == Some(p.pid()) {
            bail!("no memory for {}", p.pid());
        }
        if self.disallow == Some(p.pid()) {
            p.scx.set_disallow(true);
        }
        Ok(())
    }

    fn exit_task(&self, _cx: &OpsCtx<'_>, _p: &Task, args: ExitTaskArgs) {
        let _g = self.bump(&self.counters.exit_task);
        if args.cancelled {
            self.counters.exit_task_cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn enable(&self, _cx: &OpsCtx<'_>, _p: &Task) {
        let _g = self.bump(&self.counters.enable);
    }

    fn disable(&self, _cx: &OpsCtx<'_>, _p: &Task) {
        let _g = self.bump(&self.counters.disable);
    }

    fn runnable(&self, _cx: &OpsCtx<'_>, _p: &Task, _enq_flags: u64) {
        let _g = self.bump(&self.counters.runnable);
    }

    fn enqueue(&self, _cx: &OpsCtx<'_>, _p: &Task, _enq_flags: u64) -> DsqId {
        let _g = self.bump(&self.counters.enqueue);
        self.dsq
    }

    fn quiescent(&self, _cx: &OpsCtx<'_>, _p: &Task, _deq_flags: u64) {
        let _g = self.bump(&self.counters.quiescent);
    }

    fn tick(&self, cx: &OpsCtx<'_>, _p: &Task) {
        let _g = self.bump(&self.counters.tick);
        if self.panic_in_tick {
            panic!("tick exploded");
        }
        if let Some(d) = self.sleep_in_tick {
            std::thread::sleep(d);
        }
        if let (Some(perf), Some(cpu)) = (self.tick_perf, cx.cpu()) {
            cx.cpuperf_set(cpu, perf);
        }
    }

    fn update_idle(&self, _cx: &OpsCtx<'_>, cpu: CpuId, idle: bool) {
        let _g = self.bump(&self.counters.update_idle);
        self.counters.idle_edges.lock().push((cpu, idle));
    }

    fn cpu_online(&self, _cx: &OpsCtx<'_>, _cpu: CpuId) {
        let _g = self.bump(&self.counters.cpu_online);
    }

    fn cpu_offline(&self, _cx: &OpsCtx<'_>, _cpu: CpuId) {
        let _g = self.bump(&self.counters.cpu_offline);
    }

    fn set_cpumask(&self, _cx: &OpsCtx<'_>, _p: &Task, _cpumask: &Cpumask) {
        let _g = self.bump(&self.counters.set_cpumask);
    }

    fn core_sched_before(&self, _cx: &OpsCtx<'_>, a: &Task, b: &Task) -> Option<bool> {
        let _g = self.bump(&self.counters.core_sched_before);
        match self.core_sched {
            CoreSchedMode::Default => None,
            CoreSchedMode::Vtime => Some(a.scx.dsq_vtime() < b.scx.dsq_vtime()),
            CoreSchedMode::AlwaysFirst => Some(true),
        }
    }
}

/// Seed from `STRESS_SEED` or a default.
pub fn get_seed() -> u64 {
    std::env::var("STRESS_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(42)
}

pub fn seeded_rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}
