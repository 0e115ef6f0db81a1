//! Task lifecycle hooks: fork, reaping, policy and affinity changes.

use std::time::Duration;

use scx_ext::*;

mod common;
use common::{Counters, TestPolicy};

#[test]
fn test_fork_cancel_round_trip() {
    common::setup_test();
    let ctl = common::controller(2);
    let parent = common::spawn_task(&ctl, 1, 0);
    let policy = TestPolicy::new("forky");
    let counters = policy.counters();
    ctl.try_attach(Box::new(policy)).unwrap();

    let before = ctl.fork_accounting().snapshot();
    let tasks_before = ctl.tasks().len();

    let res = ctl.pre_fork(&parent);
    assert_eq!(res.parent(), Pid(1));
    assert_eq!(ctl.fork_accounting().reserved(), before.reserved + 1);

    let child = Task::fork_from(&parent, Pid(2), "child");
    ctl.fork(&res, &child).unwrap();
    assert_eq!(ctl.fork_accounting().initialized(), before.initialized + 1);

    ctl.cancel_fork(res, &child);
    let after = ctl.fork_accounting().snapshot();
    assert_eq!(after.reserved, before.reserved);
    assert_eq!(after.initialized, before.initialized);
    assert_eq!(after.nr_cancelled, before.nr_cancelled + 1);
    assert_eq!(ctl.tasks().len(), tasks_before);
    assert!(ctl.task(Pid(2)).is_none());

    assert_eq!(child.scx.state(), ScxTaskState::Cancelled);
    assert_eq!(child.sched_class(), SchedClass::Fair);
    assert_eq!(Counters::get(&counters.exit_task), 1);
    assert_eq!(Counters::get(&counters.exit_task_cancelled), 1);
    assert_eq!(Counters::get(&counters.enable), 1);
}

#[test]
fn test_cancel_before_fork_skips_exit_task() {
    common::setup_test();
    let ctl = common::controller(1);
    let parent = common::spawn_task(&ctl, 1, 0);
    let policy = TestPolicy::new("early-cancel");
    let counters = policy.counters();
    ctl.try_attach(Box::new(policy)).unwrap();

    let res = ctl.pre_fork(&parent);
    let child = Task::fork_from(&parent, Pid(2), "child");
    ctl.cancel_fork(res, &child);

    assert_eq!(child.scx.state(), ScxTaskState::Cancelled);
    assert_eq!(Counters::get(&counters.exit_task), 0);
    assert_eq!(ctl.fork_accounting().reserved(), 0);
}

#[test]
fn test_fork_failure_is_allocation_failure() {
    common::setup_test();
    let ctl = common::controller(2);
    let parent = common::spawn_task(&ctl, 1, 0);
    let policy = TestPolicy {
        fail_init_task: Some(Pid(2)),
        ..TestPolicy::new("oom")
    };
    let counters = policy.counters();
    ctl.try_attach(Box::new(policy)).unwrap();
    let before = ctl.fork_accounting().snapshot();

    let res = ctl.pre_fork(&parent);
    let child = Task::fork_from(&parent, Pid(2), "child");
    let err = ctl.fork(&res, &child).unwrap_err();
    match &err {
        ScxError::AllocationFailure { pid, .. } => assert_eq!(*pid, Pid(2)),
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.errno(), libc::ENOMEM);

    // Nothing of the child is visible.
    assert_eq!(child.scx.state(), ScxTaskState::PreFork);
    assert_eq!(child.scx.dsq(), None);
    assert!(!child.scx.is_enabled());

    ctl.cancel_fork(res, &child);
    let after = ctl.fork_accounting().snapshot();
    assert_eq!(after.reserved, before.reserved);
    assert_eq!(after.initialized, before.initialized);
    assert_eq!(after.nr_failed, before.nr_failed + 1);
    assert_eq!(Counters::get(&counters.exit_task), 0);
    assert!(ctl.is_enabled());
}

#[test]
fn test_fork_without_policy() {
    common::setup_test();
    let ctl = common::controller(2);
    let parent = common::spawn_task(&ctl, 1, 0);

    let res = ctl.pre_fork(&parent);
    let child = Task::fork_from(&parent, Pid(2), "child");
    ctl.fork(&res, &child).unwrap();
    assert_eq!(child.scx.state(), ScxTaskState::Classified);
    ctl.post_fork(res, &child);

    assert_eq!(child.sched_class(), SchedClass::Fair);
    assert!(ctl.task(Pid(2)).is_some());

    // Attaching later adopts the child like any other task.
    ctl.try_attach(Box::new(TestPolicy::new("late"))).unwrap();
    assert_eq!(child.sched_class(), SchedClass::Ext);
}

#[test]
fn test_check_setscheduler_rt_pinned() {
    common::setup_test();
    let ctl = common::controller(2);
    let rt = Task::builder(Pid(1), "migration", 2)
        .policy(SchedPolicy::Fifo)
        .rt_prio(0)
        .flags(task_flags::RT_PINNED | task_flags::KTHREAD)
        .build();
    ctl.register_task(rt.clone()).unwrap();
    ctl.try_attach(Box::new(TestPolicy::new("rt"))).unwrap();
    assert_eq!(rt.sched_class(), SchedClass::Rt);

    let err = ctl.check_setscheduler(&rt, SchedPolicy::Ext).unwrap_err();
    assert!(matches!(
        err,
        ScxError::InvalidClassTransition {
            reason: ClassTransitionError::RtPinned,
            ..
        }
    ));
    assert_eq!(err.errno(), libc::EINVAL);
    assert_eq!(rt.sched_class(), SchedClass::Rt);

    assert!(ctl.sched_setscheduler(&rt, SchedPolicy::Ext).is_err());
    assert_eq!(rt.policy(), SchedPolicy::Fifo);
    assert_eq!(rt.sched_class(), SchedClass::Rt);

    // Other transitions remain allowed.
    ctl.check_setscheduler(&rt, SchedPolicy::Rr).unwrap();
}

#[test]
fn test_disallowed_task_cannot_join() {
    common::setup_test();
    let ctl = common::controller(2);
    let p = Task::builder(Pid(5), "refused", 2)
        .policy(SchedPolicy::Ext)
        .build();
    ctl.register_task(p.clone()).unwrap();
    ctl.try_attach(Box::new(TestPolicy {
        disallow: Some(Pid(5)),
        ..TestPolicy::new("picky")
    }))
    .unwrap();

    // Disallowed at attach: demoted to SCHED_NORMAL and kept out.
    assert!(p.scx.disallowed());
    assert_eq!(p.policy(), SchedPolicy::Normal);
    assert_eq!(p.sched_class(), SchedClass::Fair);
    assert!(!ctl.task_should_use_extension(&p));

    let err = ctl.check_setscheduler(&p, SchedPolicy::Ext).unwrap_err();
    assert!(matches!(
        err,
        ScxError::InvalidClassTransition {
            reason: ClassTransitionError::Disallowed,
            ..
        }
    ));
    assert_eq!(p.policy(), SchedPolicy::Normal);
}

#[test]
fn test_sched_setscheduler_moves_between_classes() {
    common::setup_test();
    let ctl = common::controller(2);
    let p = common::spawn_task(&ctl, 1, 0);
    let policy = TestPolicy {
        flags: OpsFlags::SWITCH_PARTIAL,
        ..TestPolicy::new("partial")
    };
    let counters = policy.counters();
    ctl.try_attach(Box::new(policy)).unwrap();
    assert_eq!(p.sched_class(), SchedClass::Fair);

    ctl.sched_setscheduler(&p, SchedPolicy::Ext).unwrap();
    assert_eq!(p.sched_class(), SchedClass::Ext);
    assert_eq!(Counters::get(&counters.enable), 1);

    ctl.sched_setscheduler(&p, SchedPolicy::Fifo).unwrap();
    assert_eq!(p.sched_class(), SchedClass::Rt);
    assert_eq!(Counters::get(&counters.disable), 1);
    assert!(!p.scx.is_enabled());

    ctl.sched_setscheduler(&p, SchedPolicy::Normal).unwrap();
    assert_eq!(p.sched_class(), SchedClass::Fair);
    assert_eq!(Counters::get(&counters.enable), 1);
}

#[test]
fn test_task_dead_leaves_the_policy() {
    common::setup_test();
    let ctl = common::controller(2);
    let p = common::spawn_task(&ctl, 1, 0);
    let policy = TestPolicy::new("reaper");
    let counters = policy.counters();
    ctl.try_attach(Box::new(policy)).unwrap();
    assert_eq!(ctl.runnable(CpuId(0), &p, 0, enq_flags::WAKEUP), Some(DsqId::GLOBAL));
    ctl.quiescent(CpuId(0), &p, deq_flags::SLEEP);
    assert_eq!(p.scx.dsq(), None);

    ctl.task_dead(&p);
    assert_eq!(p.scx.state(), ScxTaskState::Exited);
    assert_eq!(p.sched_class(), SchedClass::Fair);
    assert!(ctl.task(Pid(1)).is_none());
    assert_eq!(Counters::get(&counters.disable), 1);
    assert_eq!(Counters::get(&counters.exit_task), 1);
    assert_eq!(ctl.fork_accounting().initialized(), 0);

    // No callback sees the task afterwards.
    let runnable = Counters::get(&counters.runnable);
    assert_eq!(ctl.runnable(CpuId(0), &p, 0, enq_flags::WAKEUP), None);
    assert_eq!(Counters::get(&counters.runnable), runnable);
    assert!(!ctl.task_should_use_extension(&p));

    ctl.detach();
    assert_eq!(Counters::get(&counters.exit_task), 1);
}

#[test]
fn test_register_task_is_idempotent_and_fallible() {
    common::setup_test();
    let ctl = common::controller(1);
    ctl.try_attach(Box::new(TestPolicy {
        fail_init_task: Some(Pid(9)),
        ..TestPolicy::new("register")
    }))
    .unwrap();

    let p = common::spawn_task(&ctl, 1, 0);
    ctl.register_task(p.clone()).unwrap();
    assert_eq!(ctl.tasks().len(), 1);
    assert_eq!(ctl.fork_accounting().initialized(), 1);

    let bad = Task::builder(Pid(9), "bad", 1).build();
    let err = ctl.register_task(bad.clone()).unwrap_err();
    assert!(matches!(err, ScxError::AllocationFailure { .. }));
    assert!(ctl.task(Pid(9)).is_none());
    assert_eq!(bad.sched_class(), SchedClass::Fair);
}

#[test]
fn test_set_cpus_allowed_notifies_policy() {
    common::setup_test();
    let ctl = common::controller(4);
    let p = common::spawn_task(&ctl, 1, 0);
    let policy = TestPolicy::new("affinity");
    let counters = policy.counters();
    ctl.try_attach(Box::new(policy)).unwrap();

    let mask = Cpumask::from_cpulist(4, "2-3").unwrap();
    ctl.set_cpus_allowed(&p, mask.clone());
    assert_eq!(p.cpus_allowed(), mask);
    assert_eq!(p.nr_cpus_allowed(), 2);
    assert_eq!(Counters::get(&counters.set_cpumask), 1);
    assert_eq!(p.sched_class(), SchedClass::Ext);
}

#[test]
fn test_runnable_stamps_core_sched_time() {
    common::setup_test();
    let ctl = common::controller(2);
    let p = common::spawn_task(&ctl, 1, 0);

    // Stamped with or without a policy.
    assert_eq!(ctl.runnable(CpuId(1), &p, 500, 0), None);
    assert_eq!(p.scx.core_sched_at(), 500);
    assert_eq!(p.cpu(), CpuId(1));

    let policy = TestPolicy::new("stamp");
    let counters = policy.counters();
    ctl.try_attach(Box::new(policy)).unwrap();
    assert!(ctl.runnable(CpuId(0), &p, 900, 0).is_some());
    assert_eq!(p.scx.core_sched_at(), 900);
    assert_eq!(Counters::get(&counters.runnable), 1);
    assert_eq!(Counters::get(&counters.enqueue), 1);

    ctl.quiescent(CpuId(0), &p, 0);
    assert_eq!(Counters::get(&counters.quiescent), 1);
    assert_eq!(p.scx.dsq(), None);
}

#[test]
fn test_forking_thread_runs_task_ops_while_detach_waits() {
    common::setup_test();
    let ctl = common::controller(2);
    let parent = common::spawn_task(&ctl, 1, 0);
    ctl.try_attach(Box::new(TestPolicy::new("nested-fork"))).unwrap();

    let res = ctl.pre_fork(&parent);
    let child = Task::fork_from(&parent, Pid(2), "child");
    ctl.fork(&res, &child).unwrap();

    std::thread::scope(|s| {
        let detach = s.spawn(|| ctl.detach());
        assert!(common::wait_for_state(
            &ctl,
            EnableStateKind::Disabling,
            Duration::from_secs(5)
        ));
        // Let detach park on the write side of the fork lock.
        std::thread::sleep(Duration::from_millis(50));

        let other = Task::builder(Pid(3), "other", 2).build();
        ctl.register_task(other.clone()).unwrap();
        ctl.sched_setscheduler(&other, SchedPolicy::Batch).unwrap();
        ctl.set_cpus_allowed(&other, Cpumask::from_cpus(2, &[CpuId(0)]).unwrap());
        assert_eq!(other.nr_cpus_allowed(), 1);
        ctl.task_dead(&other);
        assert!(!detach.is_finished());

        ctl.post_fork(res, &child);
        detach.join().unwrap();
    });

    assert_eq!(ctl.state().kind, EnableStateKind::Disabled);
    assert_eq!(child.sched_class(), SchedClass::Fair);
    assert_eq!(ctl.fork_accounting().reserved(), 0);
}
