use crate::device::{DeviceKind, EmulatedDevice, KernelData};
use crate::runtime::{Builder, Runtime};
use anyhow::Result;
use std::sync::Arc;

pub(crate) fn init_runtime(worker_threads: usize) -> Result<Runtime> {
    Builder::new().worker_threads(worker_threads).try_build()
}

/// An emulated GPU with the kernels used across the tests registered:
///
/// - `scale(buf: rw f32, factor: f32)`: multiplies every element.
/// - `add(a: ro f32, b: ro f32, out: wi f32)`: element-wise sum.
/// - `fail()`: always fails.
pub(crate) fn emulated_gpu(shares_host_memory: bool) -> Arc<EmulatedDevice> {
    let gpu = EmulatedDevice::new(DeviceKind::Gpu, "gpu0").with_shared_memory(shares_host_memory);
    register_test_kernels(&gpu);
    Arc::new(gpu)
}

pub(crate) fn emulated_dsp(shares_host_memory: bool) -> Arc<EmulatedDevice> {
    let dsp = EmulatedDevice::new(DeviceKind::Dsp, "dsp0").with_shared_memory(shares_host_memory);
    register_test_kernels(&dsp);
    Arc::new(dsp)
}

fn register_test_kernels(device: &EmulatedDevice) {
    device.register_kernel("scale", |args: &mut [KernelData<'_>]| {
        let factor = args[1].scalar::<f32>()?;
        for v in args[0].slice_mut::<f32>()? {
            *v *= factor;
        }
        Ok(())
    });

    device.register_kernel("add", |args: &mut [KernelData<'_>]| {
        let (inputs, out) = args.split_at_mut(2);
        let (a, b) = (inputs[0].slice::<f32>()?, inputs[1].slice::<f32>()?);
        for (i, o) in out[0].slice_mut::<f32>()?.iter_mut().enumerate() {
            *o = a[i] + b[i];
        }
        Ok(())
    });

    device.register_kernel("fail", |_: &mut [KernelData<'_>]| Err("injected failure".to_string()));
}

pub(crate) fn init_runtime_with_gpu(
    worker_threads: usize,
    shares_host_memory: bool,
) -> Result<(Runtime, Arc<EmulatedDevice>)> {
    let gpu = emulated_gpu(shares_host_memory);
    let runtime = Builder::new()
        .worker_threads(worker_threads)
        .gpu_device(gpu.clone())
        .try_build()?;
    Ok((runtime, gpu))
}
