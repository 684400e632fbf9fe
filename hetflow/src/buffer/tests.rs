use crate::buffer::{Access, ArenaKind, ArenaSet, MemoryRegion};
use crate::device::{self, KernelSource};
use crate::runtime::Builder;
use crate::task::KernelArg;
use crate::test_utils::{emulated_dsp, init_runtime, init_runtime_with_gpu};
use anyhow::Result;
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

static_assertions::assert_impl_all!(crate::Buffer<f32>: Send, Sync, Clone);

#[test]
fn test_read_view_leaves_state_unchanged() -> Result<()> {
    let (rt, _gpu) = init_runtime_with_gpu(2, false)?;
    let buf = rt.handle().create_buffer_from(vec![1u32, 2, 3]);
    assert_eq!(buf.valid_arenas(), ArenaSet::HOST);

    let view = buf.acquire_ro()?;
    assert_eq!(&*view, &[1, 2, 3]);
    assert_eq!(buf.host_multiplicity(), 1);
    view.release();

    assert_eq!(buf.host_multiplicity(), 0);
    assert_eq!(buf.valid_arenas(), ArenaSet::HOST);
    assert_eq!(buf.authoritative_arena(), Some(ArenaKind::Host));
    Ok(())
}

#[test]
fn test_concurrent_read_views() -> Result<()> {
    let rt = init_runtime(1)?;
    let buf = rt.handle().create_buffer_from(vec![7u8; 4]);

    let a = buf.acquire_ro()?;
    let b = buf.acquire_ro()?;
    assert_eq!(buf.host_multiplicity(), 2);
    drop((a, b));
    assert_eq!(buf.host_multiplicity(), 0);
    Ok(())
}

#[test]
fn test_binding_is_one_shot() -> Result<()> {
    let rt = init_runtime(1)?;

    let buf = rt.handle().create_buffer::<u32>(3);
    assert!(buf.bind_host(vec![0; 2]).is_err());
    buf.bind_host(vec![4, 5, 6])?;
    assert!(buf.bind_host(vec![0; 3]).is_err());
    assert!(buf.bind_region(&MemoryRegion::new("late")).is_err());
    assert_eq!(buf.to_vec()?, vec![4, 5, 6]);
    Ok(())
}

#[test]
fn test_unbound_buffer_starts_zeroed() -> Result<()> {
    let rt = init_runtime(1)?;
    let buf = rt.handle().create_buffer::<u64>(5);

    assert!(buf.valid_arenas().is_empty());
    assert_eq!(buf.to_vec()?, vec![0; 5]);
    assert_eq!(buf.valid_arenas(), ArenaSet::HOST);
    Ok(())
}

#[test]
fn test_gpu_coherence() -> Result<()> {
    let (rt, gpu) = init_runtime_with_gpu(2, false)?;
    let handle = rt.handle();
    let buf = handle.create_buffer_from(vec![1.0f32, 2.0, 3.0, 4.0]);

    let scale = device::create_gpu_kernel(KernelSource::Builtin, "scale");
    let task = handle.create_device_task(
        &scale,
        vec![KernelArg::buffer(&buf, Access::ReadWrite), KernelArg::scalar(2.0f32)],
    )?;
    task.launch()?;
    task.wait_for()?;

    assert_eq!(buf.valid_arenas(), ArenaSet::GPU_CL);
    assert_eq!(buf.authoritative_arena(), Some(ArenaKind::GpuCl));

    assert_eq!(buf.to_vec()?, vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(buf.valid_arenas(), ArenaSet::HOST | ArenaSet::GPU_CL);

    let add_one = handle
        .task_builder()
        .read_writes(&buf)
        .cpu({
            let buf = buf.clone();
            move |_| {
                for v in buf.acquire_rw()?.iter_mut() {
                    *v += 1.0;
                }
                Ok(())
            }
        })
        .build()?;
    add_one.launch()?;
    add_one.wait_for()?;

    let mut view = buf.acquire_rw()?;
    assert_eq!(&*view, &[3.0, 5.0, 7.0, 9.0]);
    view[0] = 0.0;
    drop(view);
    assert_eq!(buf.valid_arenas(), ArenaSet::HOST);

    let stats = gpu.stats();
    assert_eq!(stats.launches, 1);
    assert_eq!(stats.bytes_to_device, 16);
    assert_eq!(stats.bytes_to_host, 16);
    Ok(())
}

#[test]
fn test_shared_memory_gpu_makes_no_copies() -> Result<()> {
    let (rt, gpu) = init_runtime_with_gpu(2, true)?;
    let buf = rt.handle().create_buffer_from(vec![1.0f32, 2.0]);

    let scale = device::create_gpu_kernel(KernelSource::Builtin, "scale");
    let task = rt.handle().create_device_task(
        &scale,
        vec![KernelArg::buffer(&buf, Access::ReadWrite), KernelArg::scalar(3.0f32)],
    )?;
    task.launch()?;
    task.wait_for()?;

    assert_eq!(buf.valid_arenas(), ArenaSet::HOST | ArenaSet::GPU_CL_SVM);
    assert_eq!(buf.to_vec()?, vec![3.0, 6.0]);

    let stats = gpu.stats();
    assert_eq!((stats.allocs, stats.bytes_to_device, stats.bytes_to_host), (0, 0, 0));
    Ok(())
}

#[test]
fn test_region_aliases_dsp_arena() -> Result<()> {
    let dsp = emulated_dsp(false);
    let rt = Builder::new().worker_threads(2).dsp_device(dsp.clone()).try_build()?;
    let region = MemoryRegion::new("ion0");
    let buf = rt.handle().create_buffer_in_region::<f32>(4, &region);
    assert_eq!(buf.region().as_ref().map(MemoryRegion::name), Some("ion0"));

    buf.acquire_wi()?.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(buf.valid_arenas(), ArenaSet::HOST | ArenaSet::DSP_ION);

    let scale = device::create_dsp_kernel(KernelSource::Builtin, "scale");
    let task = rt.handle().create_device_task(
        &scale,
        vec![KernelArg::buffer(&buf, Access::ReadWrite), KernelArg::scalar(3.0f32)],
    )?;
    task.launch()?;
    task.wait_for()?;

    assert_eq!(buf.to_vec()?, vec![3.0, 6.0, 9.0, 12.0]);
    assert_eq!(dsp.stats().bytes_to_device, 0);
    Ok(())
}

#[test]
fn test_conflicting_tasks_are_serialized() -> Result<()> {
    let rt = init_runtime(4)?;
    let handle = rt.handle();
    let buf = handle.create_buffer_from(vec![0u32]);
    let running = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let tasks = (0..16)
        .map(|_| {
            let (buf, running, overlaps) = (buf.clone(), running.clone(), overlaps.clone());
            handle
                .task_builder()
                .read_writes(&buf)
                .cpu(move |_| {
                    if running.swap(true, Ordering::AcqRel) {
                        overlaps.fetch_add(1, Ordering::Relaxed);
                    }
                    let mut view = buf.acquire_rw()?;
                    let seen = view[0];
                    thread::sleep(Duration::from_micros(200));
                    view[0] = seen + 1;
                    running.store(false, Ordering::Release);
                    Ok(())
                })
                .build()
        })
        .collect::<crate::Result<Vec<_>>>()?;

    for task in &tasks {
        task.launch()?;
    }
    for task in &tasks {
        task.wait_for()?;
    }

    assert_eq!(buf.to_vec()?, vec![16]);
    assert_eq!(overlaps.load(Ordering::Relaxed), 0);
    Ok(())
}

#[test]
fn test_read_only_lease_rejects_write_view() -> Result<()> {
    let rt = init_runtime(1)?;
    let buf = rt.handle().create_buffer_from(vec![1u8]);

    let task = rt
        .handle()
        .task_builder()
        .reads(&buf)
        .cpu({
            let buf = buf.clone();
            move |_| {
                assert_eq!(buf.acquire_ro()?[0], 1);
                assert!(buf.acquire_rw().is_err());
                Ok(())
            }
        })
        .build()?;
    task.launch()?;
    task.wait_for()?;
    Ok(())
}

#[rstest]
#[case::single_worker(1)]
#[case::many_workers(4)]
fn test_nested_task_borrows_enclosing_buffer(#[case] workers: usize) -> Result<()> {
    let rt = init_runtime(workers)?;
    let buf = rt.handle().create_buffer_from(vec![1u32, 2, 3]);
    let seen = Arc::new(AtomicUsize::new(0));

    let parent = rt
        .handle()
        .task_builder()
        .read_writes(&buf)
        .cpu({
            let (buf, seen) = (buf.clone(), seen.clone());
            move |ctx| {
                buf.acquire_rw()?[0] = 10;

                let reader = ctx
                    .handle()
                    .task_builder()
                    .reads(&buf)
                    .cpu({
                        let (buf, seen) = (buf.clone(), seen.clone());
                        move |_| {
                            let sum: u32 = buf.acquire_ro()?.iter().sum();
                            seen.store(sum as usize, Ordering::Relaxed);
                            Ok(())
                        }
                    })
                    .build()?;
                reader.launch()?;
                reader.wait_for()?;

                let writer = ctx
                    .handle()
                    .task_builder()
                    .read_writes(&buf)
                    .cpu({
                        let buf = buf.clone();
                        move |_| {
                            buf.acquire_rw()?[2] += 1;
                            Ok(())
                        }
                    })
                    .build()?;
                writer.launch()?;
                writer.wait_for()?;

                assert_eq!(buf.acquire_ro()?[2], 4);
                Ok(())
            }
        })
        .build()?;
    parent.launch()?;
    parent.wait_for()?;

    assert_eq!(seen.load(Ordering::Relaxed), 15);
    assert_eq!(buf.to_vec()?, vec![10, 2, 4]);
    Ok(())
}

#[test]
fn test_nested_write_under_read_lease_fails() -> Result<()> {
    let rt = init_runtime(2)?;
    let buf = rt.handle().create_buffer_from(vec![1u8]);

    let parent = rt
        .handle()
        .task_builder()
        .reads(&buf)
        .cpu({
            let buf = buf.clone();
            move |ctx| {
                let child = ctx
                    .handle()
                    .task_builder()
                    .writes(&buf)
                    .cpu(|_| Ok(()))
                    .build()?;
                child.launch()?;
                let err = child.wait_for().unwrap_err();
                assert!(matches!(err, crate::Error::InvalidState(_)), "{err}");
                Ok(())
            }
        })
        .build()?;
    parent.launch()?;
    parent.wait_for()?;
    assert_eq!(buf.to_vec()?, vec![1]);
    Ok(())
}

#[test]
fn test_nested_device_task_refreshes_host_view() -> Result<()> {
    let (rt, gpu) = init_runtime_with_gpu(2, false)?;
    let buf = rt.handle().create_buffer_from(vec![1.0f32, 2.0]);
    let scale = device::create_gpu_kernel(KernelSource::Builtin, "scale");

    let parent = rt
        .handle()
        .task_builder()
        .read_writes(&buf)
        .cpu({
            let buf = buf.clone();
            move |ctx| {
                let kernel = ctx.handle().create_device_task(
                    &scale,
                    vec![KernelArg::buffer(&buf, Access::ReadWrite), KernelArg::scalar(3.0f32)],
                )?;
                kernel.launch()?;
                kernel.wait_for()?;

                assert_eq!(&*buf.acquire_ro()?, &[3.0, 6.0]);
                Ok(())
            }
        })
        .build()?;
    parent.launch()?;
    parent.wait_for()?;

    assert_eq!(gpu.stats().launches, 1);
    Ok(())
}

#[test]
fn test_poly_task_runs_where_data_is() -> Result<()> {
    let (rt, gpu) = init_runtime_with_gpu(2, false)?;
    let handle = rt.handle();
    let scale = device::create_gpu_kernel(KernelSource::Builtin, "scale");
    let ran_on_cpu = Arc::new(AtomicUsize::new(0));

    let poly = |buf: &crate::Buffer<f32>| {
        let counter = ran_on_cpu.clone();
        handle
            .task_builder()
            .cpu(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .gpu(
                &scale,
                vec![KernelArg::buffer(buf, Access::ReadWrite), KernelArg::scalar(1.0f32)],
            )
            .build()
    };

    // Host data: the CPU alternative wins the tie-break.
    let on_host = handle.create_buffer_from(vec![1.0f32; 8]);
    let task = poly(&on_host)?;
    task.launch()?;
    task.wait_for()?;
    assert_eq!(ran_on_cpu.load(Ordering::Relaxed), 1);
    assert_eq!(gpu.stats().launches, 0);

    // Data already on the GPU: the kernel runs there.
    let on_gpu = handle.create_buffer_from(vec![1.0f32; 8]);
    let warm = handle.create_device_task(
        &scale,
        vec![KernelArg::buffer(&on_gpu, Access::ReadWrite), KernelArg::scalar(2.0f32)],
    )?;
    warm.launch()?;
    warm.wait_for()?;

    let task = poly(&on_gpu)?;
    task.launch()?;
    task.wait_for()?;
    assert_eq!(ran_on_cpu.load(Ordering::Relaxed), 1);
    assert_eq!(gpu.stats().launches, 2);
    Ok(())
}

#[test]
fn test_kernel_failure_is_device_failure() -> Result<()> {
    let (rt, _gpu) = init_runtime_with_gpu(1, false)?;
    let fail = device::create_gpu_kernel(KernelSource::Builtin, "fail");

    let task = rt.handle().create_device_task(&fail, Vec::new())?;
    task.launch()?;

    let err = task.wait_for().unwrap_err();
    assert!(matches!(err, crate::Error::DeviceFailure(_)), "{err}");
    Ok(())
}

#[test]
fn test_missing_device_is_misuse() -> Result<()> {
    let rt = init_runtime(1)?;
    let scale = device::create_gpu_kernel(KernelSource::Builtin, "scale");
    let buf = rt.handle().create_buffer_from(vec![1.0f32]);

    let err = rt
        .handle()
        .create_device_task(&scale, vec![KernelArg::buffer(&buf, Access::ReadWrite)])
        .unwrap_err();
    assert!(err.is_misuse());
    Ok(())
}
