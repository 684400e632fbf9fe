use crate as hetflow;
use crate::error::Error;
use crate::task::{Group, Task, TaskStatus};
use crate::test_utils::init_runtime;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use rstest::rstest;
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

static_assertions::assert_impl_all!(Task<u32>: Send, Sync, Clone);

#[rstest]
#[case::one_worker(1)]
#[case::four_workers(4)]
fn test_linear_chain_runs_in_order(#[case] workers: usize) -> Result<()> {
    let rt = init_runtime(workers)?;
    let handle = rt.handle();
    let order = Arc::new(Mutex::new(Vec::new()));

    let tasks: Vec<Task<()>> = (0..10)
        .map(|i| {
            let order = order.clone();
            handle.create_task(move || {
                order.lock().push(i);
                Ok(())
            })
        })
        .collect();

    for pair in tasks.windows(2) {
        pair[0].then(&pair[1])?;
    }
    // Launching in reverse does not change the order.
    for task in tasks.iter().rev() {
        task.launch()?;
    }
    tasks[9].wait_for()?;

    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    assert!(tasks.iter().all(|t| t.status() == TaskStatus::Completed));
    Ok(())
}

#[test]
fn test_get_moves_output_once() -> Result<()> {
    let rt = init_runtime(2)?;
    let task = rt.spawn(|| Ok(String::from("done")));

    assert_eq!(task.get()?, "done");
    assert!(matches!(task.get(), Err(Error::Misuse(_))));
    assert!(task.try_take().is_some());
    Ok(())
}

#[test]
fn test_try_take_before_launch() -> Result<()> {
    let rt = init_runtime(1)?;
    let task = rt.handle().create_task(|| Ok(1));

    assert!(task.try_take().is_none());
    assert_eq!(task.status(), TaskStatus::Unlaunched);
    task.launch()?;
    assert_eq!(task.get()?, 1);
    Ok(())
}

#[test]
fn test_value_task() -> Result<()> {
    let rt = init_runtime(1)?;
    let task = rt.handle().create_value_task(vec![1, 2, 3]);

    assert!(task.is_finished());
    assert_eq!(task.get()?, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn test_bind_all() -> Result<()> {
    let rt = init_runtime(2)?;
    let handle = rt.handle();

    let task = handle.create_task_with_args(|_, (a, b): (u32, u32)| Ok(a * b));
    assert!(task.launch().is_err(), "launching before binding fails");

    task.bind_all((6u32, 7u32))?;
    assert!(task.bind_all((1u32, 1u32)).is_err());
    task.launch()?;
    assert_eq!(task.get()?, 42);

    let wrong = handle.create_task_with_args(|_, a: u64| Ok(a));
    wrong.bind_all("not a u64")?;
    wrong.launch()?;
    assert!(wrong.get().is_err());
    Ok(())
}

#[test]
fn test_cycle_and_self_edges_are_rejected() -> Result<()> {
    let rt = init_runtime(1)?;
    let handle = rt.handle();
    let a = handle.create_join_task();
    let b = handle.create_join_task();
    let c = handle.create_join_task();

    a.then(&b)?;
    b.then(&c)?;
    assert!(matches!(c.then(&a), Err(Error::InvalidState(_))));
    assert!(matches!(a.then(&a), Err(Error::InvalidState(_))));

    a.launch()?;
    assert!(matches!(c.then(&a), Err(Error::InvalidState(_))));
    Ok(())
}

#[test]
fn test_failure_cancels_successors() -> Result<()> {
    let rt = init_runtime(2)?;
    let handle = rt.handle();

    let failing = handle.create_task::<_, ()>(|| Err(anyhow!("broken")));
    let next = handle.create_task(|| Ok(1));
    let last = handle.create_task(|| Ok(2));
    failing.then(&next)?;
    next.then(&last)?;

    for task in [&next, &last] {
        task.launch()?;
    }
    failing.launch()?;

    assert!(matches!(failing.wait_for(), Err(Error::Failed { .. })));
    assert!(last.get().unwrap_err().is_canceled());
    assert_eq!(next.status(), TaskStatus::Canceled);
    Ok(())
}

#[test]
fn test_panicking_body() -> Result<()> {
    let rt = init_runtime(1)?;
    let task = rt.spawn::<_, ()>(|| panic!("kaboom"));

    match task.wait_for() {
        Err(Error::Panicked { message, .. }) => assert_eq!(message, "kaboom"),
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[test]
fn test_cancel_before_run() -> Result<()> {
    let rt = init_runtime(1)?;
    let handle = rt.handle();
    let ran = Arc::new(AtomicUsize::new(0));

    let gate = handle.create_join_task();
    let task = handle.create_task({
        let ran = ran.clone();
        move || {
            ran.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    });
    gate.then(&task)?;
    task.launch()?;
    task.cancel();
    gate.launch()?;

    assert!(task.wait_for().unwrap_err().is_canceled());
    assert_eq!(ran.load(Ordering::Relaxed), 0);
    Ok(())
}

#[rstest]
#[case::one_worker(1)]
#[case::four_workers(4)]
fn test_cancel_unlaunched_predecessor(#[case] workers: usize) -> Result<()> {
    let rt = init_runtime(workers)?;
    let handle = rt.handle();
    let ran = Arc::new(AtomicUsize::new(0));

    let body = |ran: &Arc<AtomicUsize>| {
        let ran = ran.clone();
        move || {
            ran.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    };
    let a = handle.create_task(body(&ran));
    let b = handle.create_task(body(&ran));
    a.then(&b)?;
    b.launch()?;
    a.cancel();

    assert_eq!(a.status(), TaskStatus::Canceled);
    assert!(b.wait_for().unwrap_err().is_canceled());
    assert_eq!(b.status(), TaskStatus::Canceled);

    // Launching it afterwards changes nothing.
    a.launch()?;
    assert!(a.wait_for().unwrap_err().is_canceled());
    assert_eq!(ran.load(Ordering::Relaxed), 0);
    Ok(())
}

#[test]
fn test_cancel_unlaunched_task_with_pending_predecessor() -> Result<()> {
    let rt = init_runtime(2)?;
    let handle = rt.handle();
    let ran = Arc::new(AtomicUsize::new(0));

    let gate = handle.create_join_task();
    let mid = handle.create_task(|| Ok(()));
    let last = handle.create_task({
        let ran = ran.clone();
        move || {
            ran.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    });
    gate.then(&mid)?;
    mid.then(&last)?;
    last.launch()?;

    mid.cancel();
    assert_eq!(mid.status(), TaskStatus::Unlaunched);

    gate.launch()?;
    gate.wait_for()?;
    assert!(last.wait_for().unwrap_err().is_canceled());
    assert_eq!(mid.status(), TaskStatus::Canceled);
    assert_eq!(ran.load(Ordering::Relaxed), 0);
    Ok(())
}

#[test]
fn test_successor_of_canceled_task_is_canceled() -> Result<()> {
    let rt = init_runtime(1)?;
    let handle = rt.handle();

    let done = handle.create_task(|| Ok(()));
    done.cancel();
    let next = handle.create_task(|| Ok(()));
    done.then(&next)?;

    assert_eq!(next.status(), TaskStatus::Canceled);
    next.launch()?;
    assert!(next.wait_for().unwrap_err().is_canceled());
    Ok(())
}

#[test]
fn test_concurrent_opposite_edges_never_form_a_cycle() -> Result<()> {
    let rt = init_runtime(1)?;
    let handle = rt.handle();

    for _ in 0..500 {
        let a = handle.create_task(|| Ok(()));
        let b = handle.create_task(|| Ok(()));
        let barrier = Barrier::new(2);

        let (ab, ba) = thread::scope(|s| {
            let ab = s.spawn(|| {
                barrier.wait();
                a.then(&b).is_ok()
            });
            let ba = s.spawn(|| {
                barrier.wait();
                b.then(&a).is_ok()
            });
            (
                ab.join().expect("edge thread panicked"),
                ba.join().expect("edge thread panicked"),
            )
        });

        assert!(ab != ba, "exactly one of the two edges must be added");
    }
    Ok(())
}

#[test]
fn test_group_collects_failures() -> Result<()> {
    let rt = init_runtime(2)?;
    let handle = rt.handle();
    let group = Group::new();

    for i in 0..6 {
        let task = handle.create_task(move || {
            if i % 2 == 0 {
                Err(anyhow!("task {i} failed"))
            } else {
                Ok(())
            }
        });
        task.launch_in(&group)?;
    }

    let Err(Error::Aggregate(agg)) = group.wait_for() else {
        panic!("expected an aggregate error");
    };
    assert_eq!(agg.len(), 3);
    assert!(group.is_empty());
    Ok(())
}

#[test]
fn test_group_cancel_stops_pending_members() -> Result<()> {
    let rt = init_runtime(2)?;
    let handle = rt.handle();
    let group = Group::new();
    let ran = Arc::new(AtomicUsize::new(0));

    let gate = handle.create_join_task();
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let ran = ran.clone();
            let task = handle.create_task(move || {
                ran.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
            gate.then(&task).map(|_| task)
        })
        .collect::<crate::Result<_>>()?;

    for task in &tasks {
        task.launch_in(&group)?;
    }
    group.cancel();
    gate.launch()?;

    assert!(group.wait_for().unwrap_err().is_canceled());
    assert_eq!(ran.load(Ordering::Relaxed), 0);
    assert!(tasks.iter().all(|t| t.status() == TaskStatus::Canceled));
    Ok(())
}

/// Scaled down version of canceling long running bodies: every body polls
/// for cancellation and the group is canceled while they run.
#[test]
fn test_running_bodies_observe_group_cancel() -> Result<()> {
    let rt = init_runtime(4)?;
    let handle = rt.handle();
    let group = Group::new();
    let started = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let started = started.clone();
        let task = handle.create_task_with_context(move |ctx| {
            started.fetch_add(1, Ordering::Relaxed);
            for _ in 0..10_000 {
                ctx.abort_on_cancel()?;
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        });
        task.launch_in(&group)?;
    }

    while started.load(Ordering::Relaxed) == 0 {
        thread::yield_now();
    }
    group.cancel();

    // Canceled bodies end quickly and are not reported as failures.
    let err = group.wait_for().unwrap_err();
    assert!(err.is_canceled(), "{err}");
    Ok(())
}

#[hetflow::test(worker_threads = 2)]
fn test_finish_after_group() -> Result<()> {
    let sum = Arc::new(AtomicUsize::new(0));

    let parent = hetflow::create_task({
        let sum = sum.clone();
        move || {
            let group = Group::new();
            for i in 1..=8 {
                let sum = sum.clone();
                let child = hetflow::create_task(move || {
                    thread::sleep(Duration::from_millis(2));
                    sum.fetch_add(i, Ordering::Relaxed);
                    Ok(())
                });
                child.launch_in(&group)?;
            }
            hetflow::finish_after(&group)?;
            Ok("parent")
        }
    });
    parent.launch()?;

    assert_eq!(parent.get()?, "parent");
    assert_eq!(sum.load(Ordering::Relaxed), 36);
    Ok(())
}

#[hetflow::test(worker_threads = 2)]
fn test_finish_after_task_takes_output() -> Result<()> {
    let parent = hetflow::create_task(|| {
        let child = hetflow::create_task(|| {
            thread::sleep(Duration::from_millis(5));
            Ok(99u32)
        });
        child.launch()?;
        hetflow::finish_after_task(&child)?;
        Ok(0u32)
    });
    parent.launch()?;

    assert_eq!(parent.get()?, 99);
    Ok(())
}

#[test]
fn test_context_functions_outside_a_task() {
    assert!(hetflow::abort_on_cancel().unwrap_err().is_misuse());
    assert!(hetflow::finish_after(&Group::new()).unwrap_err().is_misuse());
    assert!(hetflow::current_task_id().is_none());
}

#[hetflow::test(worker_threads = 1)]
fn test_waiting_inside_a_task_helps() -> Result<()> {
    // A single worker would deadlock if waiting blocked it.
    let inner = hetflow::spawn(|| Ok(5));
    assert_eq!(inner.get()?, 5);

    let id = hetflow::current_task_id();
    assert!(id.is_some());
    Ok(())
}
