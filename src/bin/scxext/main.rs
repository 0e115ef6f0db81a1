//! scxext - Drive the extension controller with a synthetic workload.
//!
//! One OS thread per CPU runs a tick loop against a shared controller with
//! the simple policy attached: tasks wake, run, get preempted at slice
//! expiry, sleep, fork and exit. Time is simulated; the threads run as fast
//! as they can.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use scx_ext::{
    deq_flags, enq_flags, parse_duration_ns, CpuId, ExitInfo, Pid, SchedPolicy, ScxConfig,
    ScxController, SimplePolicy, Task, TimeNs,
};

/// Drive the extension controller with a synthetic workload.
#[derive(Debug, Parser)]
#[command(name = "scxext")]
struct Opts {
    /// Number of simulated CPUs.
    #[arg(short, long, default_value_t = 4)]
    cpus: u32,

    /// Tasks created at startup, per CPU.
    #[arg(short, long, default_value_t = 4)]
    tasks_per_cpu: u32,

    /// Simulated run time.
    ///
    /// Accepts durations with units: "1s", "500ms", "100us", "1000ns".
    /// A bare number is interpreted as nanoseconds.
    #[arg(short, long, default_value = "1s", value_parser = parse_duration_ns)]
    duration: TimeNs,

    /// Scheduler tick interval.
    #[arg(long, default_value = "1ms", value_parser = parse_duration_ns)]
    tick: TimeNs,

    /// Probability per tick that the running task forks.
    #[arg(long, default_value_t = 0.01)]
    fork_rate: f64,

    /// Probability per tick that the running task goes to sleep, and that
    /// one sleeper wakes up.
    #[arg(long, default_value_t = 0.05)]
    sleep_rate: f64,

    /// Wall-clock budget for a single policy callback. Falls back to
    /// SCX_EXT_BUDGET, then 10ms.
    #[arg(long, value_parser = parse_duration_ns)]
    budget: Option<TimeNs>,

    /// Only move SCHED_EXT tasks to the policy. Tasks are created with
    /// SCHED_EXT in this mode.
    #[arg(short, long)]
    partial: bool,

    /// Order the shared queue by arrival instead of virtual time.
    #[arg(short, long)]
    fifo: bool,

    /// PRNG seed for the workload.
    #[arg(long, env = "SCX_EXT_SEED", default_value_t = 42)]
    seed: u64,

    /// Print the final statistics as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_tracing();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut builder = ScxConfig::builder().cpus(opts.cpus);
    if let Some(budget) = opts.budget {
        builder = builder.callback_budget_ns(budget);
    }
    let ctl = ScxController::new(builder.build()?)?;

    let policy = if opts.partial {
        SchedPolicy::Ext
    } else {
        SchedPolicy::Normal
    };
    let next_pid = AtomicI32::new(1);
    for i in 0..opts.cpus * opts.tasks_per_cpu {
        let pid = Pid(next_pid.fetch_add(1, Ordering::Relaxed));
        let task = Task::builder(pid, format!("worker-{i}"), opts.cpus)
            .policy(policy)
            .cpu(CpuId(i % opts.cpus))
            .build();
        ctl.register_task(task)?;
    }

    let info = loop {
        let info = run_once(&ctl, &opts, &next_pid, &shutdown)?;
        if !info.should_restart() || shutdown.load(Ordering::Relaxed) {
            break info;
        }
        info!("policy asked for a restart");
    };

    let snap = ctl.stats_snapshot();
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&snap)?);
    } else {
        info!(
            nr_ticks = snap.nr_ticks,
            nr_hook_calls = snap.nr_hook_calls,
            nr_bypassed = snap.nr_bypassed,
            nr_resched = snap.nr_resched,
            nr_duplicate_idle = snap.nr_duplicate_idle,
            nr_faults = snap.nr_faults,
            "run complete"
        );
        info!(
            reserved = snap.fork.reserved,
            initialized = snap.fork.initialized,
            nr_cancelled = snap.fork.nr_cancelled,
            nr_failed = snap.fork.nr_failed,
            "fork accounting"
        );
    }
    info.report()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Attach a fresh policy instance, run the workload until the duration
/// elapses, Ctrl-C or the policy goes away, then detach.
fn run_once(
    ctl: &ScxController,
    opts: &Opts,
    next_pid: &AtomicI32,
    shutdown: &AtomicBool,
) -> Result<ExitInfo> {
    let policy = SimplePolicy::new(opts.fifo).switch_partial(opts.partial);
    ctl.try_attach(Box::new(policy))?;

    let mut per_cpu: Vec<Vec<Arc<Task>>> = vec![Vec::new(); opts.cpus as usize];
    for (i, task) in ctl.tasks().into_iter().enumerate() {
        per_cpu[i % opts.cpus as usize].push(task);
    }

    std::thread::scope(|s| {
        for (cpu, tasks) in per_cpu.into_iter().enumerate() {
            let cpu = CpuId(cpu as u32);
            std::thread::Builder::new()
                .name(format!("cpu{cpu}"))
                .spawn_scoped(s, move || drive_cpu(ctl, cpu, tasks, opts, next_pid, shutdown))
                .context("Failed to spawn CPU thread")?;
        }
        Ok::<_, anyhow::Error>(())
    })?;

    ctl.detach();
    for event in ctl.events().try_iter() {
        match event.to_error() {
            Some(err) => warn!("{err}"),
            None => debug!(?event, "controller event"),
        }
    }
    Ok(ctl.exit_info().unwrap_or_default())
}

fn drive_cpu(
    ctl: &ScxController,
    cpu: CpuId,
    tasks: Vec<Arc<Task>>,
    opts: &Opts,
    next_pid: &AtomicI32,
    shutdown: &AtomicBool,
) {
    let mut rng = SmallRng::seed_from_u64(opts.seed ^ cpu.0 as u64);
    let nr_initial = (opts.cpus * opts.tasks_per_cpu) as i32;
    let mut now: TimeNs = 0;
    let mut runnable: VecDeque<Arc<Task>> = VecDeque::new();
    let mut sleeping: Vec<Arc<Task>> = Vec::new();
    let mut curr: Option<Arc<Task>> = None;

    for p in tasks {
        ctl.runnable(cpu, &p, now, enq_flags::WAKEUP);
        runnable.push_back(p);
    }

    while now < opts.duration && !shutdown.load(Ordering::Relaxed) && ctl.is_enabled() {
        if curr.is_none() {
            curr = runnable.pop_front();
            ctl.update_idle(cpu, curr.is_none());
        }

        now += opts.tick;
        let resched = ctl.tick(cpu, curr.as_deref(), opts.tick);

        if !sleeping.is_empty() && rng.gen_bool(opts.sleep_rate) {
            let p = sleeping.swap_remove(rng.gen_range(0..sleeping.len()));
            ctl.runnable(cpu, &p, now, enq_flags::WAKEUP);
            runnable.push_back(p);
        }

        let Some(p) = curr.take() else {
            continue;
        };

        if rng.gen_bool(opts.fork_rate) {
            if let Some(child) = fork_child(ctl, &p, next_pid, &mut rng) {
                ctl.runnable(cpu, &child, now, enq_flags::WAKEUP);
                runnable.push_back(child);
            }
        }

        if rng.gen_bool(opts.sleep_rate) {
            ctl.quiescent(cpu, &p, deq_flags::SLEEP);
            if p.pid().0 > nr_initial && rng.gen_bool(0.5) {
                debug!(%cpu, pid = %p.pid(), "task exiting");
                ctl.task_dead(&p);
            } else {
                sleeping.push(p);
            }
        } else if resched {
            ctl.quiescent(cpu, &p, 0);
            ctl.runnable(cpu, &p, now, 0);
            runnable.push_back(p);
        } else {
            curr = Some(p);
        }
    }

    for p in curr.iter().chain(runnable.iter()) {
        ctl.quiescent(cpu, p, deq_flags::SLEEP);
    }
    ctl.update_idle(cpu, true);
}

/// Fork `parent`. One in ten forks is abandoned by the host after
/// `pre_fork` to exercise the cancel path.
fn fork_child(
    ctl: &ScxController,
    parent: &Task,
    next_pid: &AtomicI32,
    rng: &mut SmallRng,
) -> Option<Arc<Task>> {
    let pid = Pid(next_pid.fetch_add(1, Ordering::Relaxed));
    let res = ctl.pre_fork(parent);
    let child = Task::fork_from(parent, pid, format!("{}-{}", parent.comm(), pid));

    if rng.gen_bool(0.1) {
        ctl.cancel_fork(res, &child);
        return None;
    }
    match ctl.fork(&res, &child) {
        Ok(()) => {
            ctl.post_fork(res, &child);
            Some(child)
        }
        Err(e) => {
            warn!("{e}");
            ctl.cancel_fork(res, &child);
            None
        }
    }
}
