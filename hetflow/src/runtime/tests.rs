use crate::runtime::{Builder, Handle};
use crate::task::TaskStatus;
use crate::test_utils::init_runtime;
use anyhow::Result;
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn test_block_on_runs_on_a_worker() -> Result<()> {
    let rt = Builder::new().worker_threads(2).thread_name("flow-worker").try_build()?;
    let id = rt.handle().runtime_id();

    let (name, current) = rt.block_on(|| {
        let name = thread::current().name().map(str::to_owned);
        (name, Handle::current().runtime_id())
    });

    assert_eq!(name.as_deref(), Some("flow-worker"));
    assert_eq!(current, id);
    Ok(())
}

#[test]
fn test_thread_name_fn() -> Result<()> {
    let next = Arc::new(AtomicUsize::new(0));
    let rt = Builder::new()
        .worker_threads(3)
        .thread_name_fn({
            let next = next.clone();
            move || format!("compute-{}", next.fetch_add(1, Ordering::Relaxed))
        })
        .try_build()?;

    assert_eq!(next.load(Ordering::Relaxed), 3);
    let name = rt.block_on(|| thread::current().name().map(str::to_owned));
    assert!(name.is_some_and(|n| n.starts_with("compute-")));
    Ok(())
}

#[test]
#[should_panic(expected = "root failure")]
fn test_block_on_resumes_panic() {
    let rt = init_runtime(1).unwrap();
    let _: () = rt.block_on(|| panic!("root failure"));
}

#[test]
fn test_enter_sets_current_handle() -> Result<()> {
    let rt = init_runtime(1)?;
    assert!(Handle::try_current().is_none());

    {
        let _guard = rt.enter();
        let handle = Handle::try_current().expect("entered");
        assert_eq!(handle.runtime_id(), rt.handle().runtime_id());
        assert_eq!(crate::spawn(|| Ok(3)).get()?, 3);
    }

    assert!(Handle::try_current().is_none());
    Ok(())
}

#[rstest]
#[case::single_worker(1)]
#[case::more_producers_than_workers(2)]
#[case::more_workers(8)]
fn test_injection_from_many_producers(#[case] workers: usize) -> Result<()> {
    let rt = init_runtime(workers)?;
    let counter = Arc::new(AtomicUsize::new(0));

    thread::scope(|s| {
        for _ in 0..4 {
            let handle = rt.handle().clone();
            let counter = counter.clone();
            s.spawn(move || {
                let tasks: Vec<_> = (0..250)
                    .map(|_| {
                        let counter = counter.clone();
                        handle.spawn(move || {
                            counter.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        })
                    })
                    .collect();
                tasks.iter().try_for_each(|t| t.wait_for())
            });
        }
    });

    assert_eq!(counter.load(Ordering::Relaxed), 1_000);
    rt.shutdown()
}

#[test]
fn test_shutdown_cancels_queued_tasks() -> Result<()> {
    let rt = init_runtime(1)?;
    let handle = rt.handle().clone();

    // Occupies the only worker until shutdown starts.
    let blocker = rt.spawn({
        let handle = handle.clone();
        move || {
            while !handle.is_shutdown() {
                thread::yield_now();
            }
            Ok("blocker")
        }
    });
    let pending: Vec<_> = (0..10).map(|i| rt.spawn(move || Ok(i))).collect();

    thread::spawn(move || rt.shutdown())
        .join()
        .expect("shutdown thread panicked")?;

    assert!(handle.is_shutdown());
    assert_eq!(blocker.get()?, "blocker");
    for task in &pending {
        assert_eq!(task.status(), TaskStatus::Canceled);
        assert!(task.get().unwrap_err().is_canceled());
    }
    Ok(())
}

#[test]
fn test_launch_after_shutdown_fails() -> Result<()> {
    let rt = init_runtime(2)?;
    let handle = rt.handle().clone();
    rt.shutdown()?;

    let task = handle.create_task(|| Ok(1));
    assert!(task.launch().unwrap_err().is_misuse());
    Ok(())
}

#[test]
fn test_dropping_runtime_joins_workers() -> Result<()> {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let rt = init_runtime(3)?;
        for _ in 0..64 {
            let counter = counter.clone();
            rt.spawn(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .wait_for()?;
        }
    }
    assert_eq!(counter.load(Ordering::Relaxed), 64);
    Ok(())
}
