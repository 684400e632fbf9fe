use crate as hetflow;
use crate::pattern::{self, Mode, Tuner};
use crate::test_utils::init_runtime;
use anyhow::Result;
use rstest::rstest;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn tuner_for(mode: Mode) -> Tuner {
    match mode {
        Mode::Adaptive => Tuner::new(),
        Mode::Static => Tuner::new().static_chunking(true),
        Mode::Serial => Tuner::new().serial(true),
    }
}

#[rstest]
#[case::adaptive(Mode::Adaptive)]
#[case::static_chunking(Mode::Static)]
#[case::serial(Mode::Serial)]
fn test_preduce_sum(#[case] mode: Mode) -> Result<()> {
    let rt = init_runtime(4)?;

    let sum = rt.handle().preduce(
        0..1_000_000,
        &tuner_for(mode),
        0u64,
        |acc, i| acc + i as u64,
        |a, b| a + b,
    )?;

    assert_eq!(sum, 499_999_500_000);
    Ok(())
}

#[test]
fn test_preduce_keeps_index_order() -> Result<()> {
    let rt = init_runtime(4)?;

    // String concatenation is associative but not commutative.
    let joined = rt.handle().preduce(
        0..2_000,
        &Tuner::new().chunk_size(7),
        String::new(),
        |mut acc, i| {
            acc.push_str(&format!("{i},"));
            acc
        },
        |a, b| a + &b,
    )?;

    let expected: String = (0..2_000).map(|i| format!("{i},")).collect();
    assert_eq!(joined, expected);
    Ok(())
}

#[rstest]
#[case::adaptive(Mode::Adaptive, None)]
#[case::tiny_chunks(Mode::Adaptive, Some(3))]
#[case::static_chunking(Mode::Static, Some(16))]
#[case::serial(Mode::Serial, None)]
fn test_pscan_ones(#[case] mode: Mode, #[case] chunk: Option<usize>) -> Result<()> {
    let rt = init_runtime(4)?;
    let mut tuner = tuner_for(mode);
    if let Some(chunk) = chunk {
        tuner = tuner.chunk_size(chunk);
    }

    let mut data = vec![1u32; 1024];
    rt.handle().pscan(&mut data, &tuner, |a, b| a + b)?;

    let expected: Vec<u32> = (1..=1024).collect();
    assert_eq!(data, expected);
    Ok(())
}

#[rstest]
#[case::adaptive(Mode::Adaptive)]
#[case::static_chunking(Mode::Static)]
fn test_pfor_each_visits_every_index_once(#[case] mode: Mode) -> Result<()> {
    let rt = init_runtime(4)?;
    let seen: Vec<AtomicU8> = (0..50_000).map(|_| AtomicU8::new(0)).collect();

    rt.handle()
        .pfor_each(0..50_000, &tuner_for(mode).chunk_size(5), |i| {
            seen[i].fetch_add(1, Ordering::Relaxed);
        })?;

    assert!(seen.iter().all(|n| n.load(Ordering::Relaxed) == 1));
    Ok(())
}

#[hetflow::test(worker_threads = 4)]
fn test_pfor_each_inside_task() -> Result<()> {
    let sum = AtomicUsize::new(0);
    pattern::pfor_each(10..20, &Tuner::new(), |i| {
        sum.fetch_add(i, Ordering::Relaxed);
    })?;
    assert_eq!(sum.into_inner(), 145);
    Ok(())
}

#[test]
fn test_ptransform() -> Result<()> {
    let rt = init_runtime(3)?;
    let input: Vec<u64> = (0..10_000).collect();
    let mut output = vec![0u64; input.len()];

    rt.handle()
        .ptransform(&input, &mut output, &Tuner::new().chunk_size(64), |x| x * x)?;

    assert!(output.iter().enumerate().all(|(i, &y)| y == (i * i) as u64));
    Ok(())
}

#[test]
fn test_ptransform_length_mismatch() -> Result<()> {
    let rt = init_runtime(2)?;
    let mut output = vec![0u8; 3];

    let err = rt
        .handle()
        .ptransform(&[1u8, 2], &mut output, &Tuner::new(), |x| *x)
        .unwrap_err();
    assert!(err.is_misuse());
    Ok(())
}

#[test]
fn test_zero_chunk_is_rejected() -> Result<()> {
    let rt = init_runtime(2)?;
    let tuner = Tuner::new().chunk_size(0);

    assert!(rt.handle().pfor_each(0..10, &tuner, |_| {}).unwrap_err().is_misuse());
    Ok(())
}

#[test]
fn test_empty_range_creates_no_task() -> Result<()> {
    let rt = init_runtime(2)?;
    let tuner = Tuner::new().profile(true);

    let sum = rt.handle().preduce(5..5, &tuner, 42u32, |a, _| a + 1, |a, b| a + b)?;
    assert_eq!(sum, 42);

    let mut empty: Vec<u32> = Vec::new();
    rt.handle().pscan(&mut empty, &tuner, |a, b| a + b)?;
    rt.handle().pfor_each(3..3, &tuner, |_| unreachable!())?;

    assert!(tuner.last_profile().is_none());
    Ok(())
}

#[test]
fn test_profile_accounts_for_every_element() -> Result<()> {
    let rt = init_runtime(4)?;
    let tuner = Tuner::new().chunk_size(100).profile(true);

    rt.handle().pfor_each(0..100_000, &tuner, |_| {})?;

    let profile = tuner.last_profile().expect("profile recorded");
    assert_eq!(profile.pattern, "pfor_each");
    assert_eq!(profile.chunk_size, 100);
    assert!(!profile.tasks.is_empty() && profile.tasks.len() <= 4);
    assert_eq!(profile.tasks.iter().map(|t| t.elements).sum::<usize>(), 100_000);
    Ok(())
}

#[test]
fn test_static_chunking_never_steals() -> Result<()> {
    let rt = init_runtime(4)?;
    let tuner = Tuner::new().static_chunking(true).degree_of_concurrency(3).profile(true);

    rt.handle().pfor_each(0..30_000, &tuner, |_| {})?;

    let profile = tuner.last_profile().expect("profile recorded");
    assert_eq!(profile.steals, 0);
    assert_eq!(profile.tasks.len(), 3);
    assert!(profile.tasks.iter().all(|t| t.elements == 10_000));
    Ok(())
}

#[test]
fn test_serial_runs_on_caller() -> Result<()> {
    let rt = init_runtime(4)?;
    let caller = thread::current().id();

    rt.handle().pfor_each(0..1_000, &Tuner::new().serial(true), |_| {
        assert_eq!(thread::current().id(), caller);
    })?;
    Ok(())
}

fn partition(s: &mut [i32]) -> usize {
    let last = s.len() - 1;
    s.swap(s.len() / 2, last);
    let pivot = s[last];

    let mut store = 0;
    for i in 0..last {
        if s[i] < pivot {
            s.swap(i, store);
            store += 1;
        }
    }
    s.swap(store, last);
    store
}

#[rstest]
#[case::tasks(Mode::Adaptive)]
#[case::serial(Mode::Serial)]
fn test_quicksort(#[case] mode: Mode) -> Result<()> {
    let rt = init_runtime(4)?;
    let mut rng = fastrand::Rng::with_seed(7);
    let mut data: Vec<i32> = (0..100_000).map(|_| rng.i32(..)).collect();

    let mut expected = data.clone();
    expected.sort_unstable();

    rt.handle().pdivide_and_conquer(
        data.as_mut_slice(),
        &tuner_for(mode),
        |s| s.len() <= 256,
        |s| s.sort_unstable(),
        |s| {
            let pivot = partition(s);
            let (left, right) = s.split_at_mut(pivot);
            vec![left, &mut right[1..]]
        },
        |_| (),
    )?;

    assert_eq!(data, expected);
    Ok(())
}

#[test]
fn test_divide_and_conquer_merges_in_order() -> Result<()> {
    let rt = init_runtime(3)?;
    let tuner = Tuner::new().profile(true);

    let out = rt.handle().pdivide_and_conquer(
        0..1_000usize,
        &tuner,
        |r| r.len() <= 10,
        |r| r.collect::<Vec<_>>(),
        |r| {
            let mid = r.start + r.len() / 2;
            vec![r.start..mid, mid..r.end]
        },
        |parts| parts.concat(),
    )?;

    assert_eq!(out, (0..1_000).collect::<Vec<_>>());
    let profile = tuner.last_profile().expect("profile recorded");
    assert!(profile.nodes > 100);
    Ok(())
}

#[test]
fn test_spawn_variants() -> Result<()> {
    let rt = init_runtime(2)?;
    let handle = rt.handle();

    let scanned = handle.spawn_pscan(vec![2u64; 100], Tuner::new(), |a, b| a + b)?;
    let reduced = handle.spawn_preduce(0..10, Tuner::new(), 1u64, |a, i| a * (i as u64 + 1), |a, b| a * b)?;
    let mapped = handle.spawn_ptransform(vec![1, 2, 3], vec![0; 3], Tuner::new(), |x| x * 10)?;
    let fib = handle.spawn_pdivide_and_conquer(
        15u64,
        Tuner::new(),
        |n| *n < 2,
        |n| n,
        |n| vec![n - 1, n - 2],
        |parts| parts.into_iter().sum(),
    )?;

    assert_eq!(scanned.get()?.last(), Some(&200));
    assert_eq!(reduced.get()?, 3_628_800);
    assert_eq!(mapped.get()?, vec![10, 20, 30]);
    assert_eq!(fib.get()?, 610);
    Ok(())
}

#[test]
fn test_cancel_stops_between_chunks() -> Result<()> {
    let rt = init_runtime(4)?;
    let done = std::sync::Arc::new(AtomicUsize::new(0));

    let counter = done.clone();
    let task = rt.handle().spawn_pfor_each(0..10_000, Tuner::new().chunk_size(10), move |_| {
        thread::sleep(Duration::from_micros(100));
        counter.fetch_add(1, Ordering::Relaxed);
    })?;

    thread::sleep(Duration::from_millis(10));
    task.cancel();

    assert!(task.get().unwrap_err().is_canceled());
    assert!(done.load(Ordering::Relaxed) < 10_000);
    Ok(())
}

#[test]
fn test_panic_in_body_is_reported() -> Result<()> {
    let rt = init_runtime(2)?;

    let task = rt.handle().spawn_pfor_each(0..1_000, Tuner::new().chunk_size(10), |i| {
        if i == 777 {
            panic!("boom");
        }
    })?;

    let err = task.get().unwrap_err();
    assert!(!err.is_canceled());
    Ok(())
}
