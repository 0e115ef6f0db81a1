//! Core-scheduling priority order across classes.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use scx_ext::*;

mod common;
use common::{Counters, CoreSchedMode, TestPolicy};

fn task(ctl: &ScxController, pid: i32, policy: SchedPolicy) -> Arc<Task> {
    let mut builder = Task::builder(Pid(pid), format!("t{pid}"), ctl.nr_cpus()).policy(policy);
    if policy.is_rt() {
        builder = builder.rt_prio(pid % 7);
    } else {
        builder = builder.nice((pid % 5) as i8 - 2);
    }
    let p = builder.build();
    ctl.register_task(p.clone()).unwrap();
    p
}

#[test]
fn test_class_rank_comes_first() {
    common::setup_test();
    let ctl = common::controller(2);
    let dl = task(&ctl, 1, SchedPolicy::Deadline);
    let rt = task(&ctl, 2, SchedPolicy::Fifo);
    let fair = task(&ctl, 3, SchedPolicy::Normal);
    let ext = task(&ctl, 4, SchedPolicy::Ext);
    ctl.try_attach(Box::new(TestPolicy {
        flags: OpsFlags::SWITCH_PARTIAL,
        ..TestPolicy::new("ranks")
    }))
    .unwrap();
    assert_eq!(fair.sched_class(), SchedClass::Fair);
    assert_eq!(ext.sched_class(), SchedClass::Ext);

    let order = [&dl, &rt, &fair, &ext];
    for (i, hi) in order.iter().enumerate() {
        for lo in &order[i + 1..] {
            assert!(ctl.prio_less(lo, hi, false), "{lo:?} < {hi:?}");
            assert!(!ctl.prio_less(hi, lo, false), "{hi:?} < {lo:?}");
        }
    }
}

#[test]
fn test_rt_and_fair_orders() {
    common::setup_test();
    let ctl = common::controller(2);
    let rt_hi = Task::builder(Pid(1), "rt-hi", 2)
        .policy(SchedPolicy::Rr)
        .rt_prio(5)
        .build();
    let rt_lo = Task::builder(Pid(2), "rt-lo", 2)
        .policy(SchedPolicy::Rr)
        .rt_prio(10)
        .build();
    assert!(ctl.prio_less(&rt_lo, &rt_hi, false));
    assert!(!ctl.prio_less(&rt_hi, &rt_lo, false));

    let early = Task::builder(Pid(3), "early", 2).nice(5).build();
    let late = Task::builder(Pid(4), "late", 2).nice(-5).build();
    ctl.runnable(CpuId(0), &early, 100, 0);
    ctl.runnable(CpuId(0), &late, 200, 0);

    // Outside forced idle the nicer task loses.
    assert!(ctl.prio_less(&early, &late, false));
    // In forced idle the task made runnable later loses.
    assert!(ctl.prio_less(&late, &early, true));
    assert!(!ctl.prio_less(&early, &late, true));
}

#[test]
fn test_ext_order_follows_policy() {
    common::setup_test();
    let ctl = common::controller(2);
    let a = task(&ctl, 1, SchedPolicy::Normal);
    let b = task(&ctl, 2, SchedPolicy::Normal);
    let policy = TestPolicy {
        core_sched: CoreSchedMode::Vtime,
        ..TestPolicy::new("vtime")
    };
    let counters = policy.counters();
    ctl.try_attach(Box::new(policy)).unwrap();

    a.scx.set_dsq_vtime(Vtime(10));
    b.scx.set_dsq_vtime(Vtime(20));
    assert!(ctl.prio_less(&b, &a, false));
    assert!(!ctl.prio_less(&a, &b, false));
    assert!(Counters::get(&counters.core_sched_before) >= 4);
    assert!(!ctl.prio_less(&a, &a, false));

    // Equal answers fall back to the default order.
    b.scx.set_dsq_vtime(Vtime(10));
    assert_eq!(ctl.prio_less(&a, &b, false), default_prio_less(&a, &b));
    assert_eq!(ctl.prio_less(&b, &a, false), default_prio_less(&b, &a));
    assert_eq!(ctl.stats_snapshot().nr_faults, 0);
}

#[test]
fn test_contradictory_policy_faults_and_falls_back() {
    common::setup_test();
    let ctl = common::controller(2);
    let events = ctl.events();
    let a = task(&ctl, 1, SchedPolicy::Normal);
    let b = task(&ctl, 2, SchedPolicy::Normal);
    ctl.try_attach(Box::new(TestPolicy {
        core_sched: CoreSchedMode::AlwaysFirst,
        ..TestPolicy::new("liar")
    }))
    .unwrap();

    assert_eq!(ctl.prio_less(&a, &b, false), default_prio_less(&a, &b));
    assert!(!ctl.is_enabled());
    assert!(common::wait_for_state(
        &ctl,
        EnableStateKind::Disabled,
        Duration::from_secs(5)
    ));

    let info = ctl.exit_info().unwrap();
    assert_eq!(info.kind, ExitKind::ErrorPolicy);
    assert!(info.msg.as_deref().unwrap().contains("core_sched_before"));
    assert!(info.report().is_err());

    let fault = events
        .try_iter()
        .find(|e| matches!(e, ScxEvent::Fault { .. }))
        .unwrap();
    assert_eq!(fault.generation(), 1);

    // Once detached, the default order applies.
    assert_eq!(ctl.prio_less(&b, &a, true), default_prio_less(&b, &a));
}

fn check_strict_weak_order(ctl: &ScxController, tasks: &[Arc<Task>], seed: u64) {
    let mut rng = common::seeded_rng(seed);
    for _ in 0..2_000 {
        let in_fi = rng.gen_bool(0.5);
        let a = &tasks[rng.gen_range(0..tasks.len())];
        let b = &tasks[rng.gen_range(0..tasks.len())];
        let c = &tasks[rng.gen_range(0..tasks.len())];

        assert!(!ctl.prio_less(a, a, in_fi), "seed {seed}: irreflexive {a:?}");
        let ab = ctl.prio_less(a, b, in_fi);
        let ba = ctl.prio_less(b, a, in_fi);
        assert!(!(ab && ba), "seed {seed}: asymmetric {a:?} {b:?} fi={in_fi}");
        if !Arc::ptr_eq(a, b) {
            // Distinct PIDs make the order total.
            assert!(ab || ba, "seed {seed}: total {a:?} {b:?} fi={in_fi}");
        }
        if ab && ctl.prio_less(b, c, in_fi) {
            assert!(
                ctl.prio_less(a, c, in_fi),
                "seed {seed}: transitive {a:?} {b:?} {c:?} fi={in_fi}"
            );
        }
    }
}

#[test]
fn test_prio_less_is_strict_weak_order() {
    common::setup_test();
    let seed = common::get_seed();
    let mut rng = common::seeded_rng(seed);
    let ctl = common::controller(4);

    let policies = [
        SchedPolicy::Normal,
        SchedPolicy::Ext,
        SchedPolicy::Batch,
        SchedPolicy::Fifo,
        SchedPolicy::Rr,
        SchedPolicy::Deadline,
    ];
    let tasks: Vec<_> = (1..=24)
        .map(|pid| task(&ctl, pid, policies[rng.gen_range(0..policies.len())]))
        .collect();

    // Without a policy.
    for p in &tasks {
        ctl.runnable(CpuId(rng.gen_range(0..4)), p, rng.gen_range(0..8) * 1_000, 0);
    }
    check_strict_weak_order(&ctl, &tasks, seed);

    // With a partial policy: fair and extension tasks side by side, the
    // latter ordered by a small range of vtimes with plenty of ties.
    ctl.try_attach(Box::new(TestPolicy {
        flags: OpsFlags::SWITCH_PARTIAL,
        core_sched: CoreSchedMode::Vtime,
        ..TestPolicy::new("swo")
    }))
    .unwrap();
    for p in &tasks {
        p.scx.set_dsq_vtime(Vtime(rng.gen_range(0..4)));
        ctl.runnable(CpuId(rng.gen_range(0..4)), p, rng.gen_range(0..8) * 1_000, 0);
    }
    check_strict_weak_order(&ctl, &tasks, seed.wrapping_add(1));
    assert_eq!(ctl.stats_snapshot().nr_faults, 0);
    assert!(ctl.is_enabled());
}

#[test]
fn test_prio_less_ignores_offline_cpus() {
    common::setup_test();
    let seed = common::get_seed();
    let mut rng = common::seeded_rng(seed);
    let ctl = common::controller(2);
    ctl.try_attach(Box::new(SimplePolicy::new(false))).unwrap();

    let placed = |pid: i32, cpu: u32, vtime: u64| {
        let p = task(&ctl, pid, SchedPolicy::Normal);
        p.set_cpu(CpuId(cpu));
        p.scx.set_dsq_vtime(Vtime(vtime));
        p
    };
    let a = placed(3, 1, 0);
    let b = placed(2, 1, 10);
    let c = placed(1, 0, 5);
    ctl.rq_deactivate(CpuId(1));
    assert!(ctl.is_enabled());

    // Lower vtime runs first, wherever the pair sits.
    assert!(ctl.prio_less(&b, &c, false));
    assert!(ctl.prio_less(&c, &a, false));
    assert!(ctl.prio_less(&b, &a, false));
    assert!(!ctl.prio_less(&a, &b, false));

    let mut tasks = vec![a, b, c];
    for pid in 4..=20 {
        tasks.push(placed(pid, rng.gen_range(0..2), rng.gen_range(0..4)));
    }
    check_strict_weak_order(&ctl, &tasks, seed);
    assert_eq!(ctl.stats_snapshot().nr_faults, 0);
    assert!(ctl.is_enabled());
}
