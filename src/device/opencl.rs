//! OpenCL backend over the `ocl` crate. Available under the `opencl` cargo
//! feature.
//!
//! The queue is created with profiling enabled; per-launch times come from
//! the start/end profiling counters of the launch event. Buffer regions are
//! bound through sub-buffers, which are kept alive until the next queue
//! finish.
use fxhash::FxHashMap;
use ocl::core::{self, ArgVal, Event as RawEvent};
use ocl::enums::{
    DeviceInfo as OclDeviceInfo, DeviceInfoResult, KernelWorkGroupInfo,
    KernelWorkGroupInfoResult, ProfilingInfo, ProfilingInfoResult,
};
use ocl::{Buffer, Context, Device, Platform, Program, Queue};

use crate::device::{BoundArg, BufferHandle, DeviceInfo, EventHandle, Executor, KernelHandle};
use crate::error::Error;

fn device_error<E: std::fmt::Display>(err: E) -> Error {
    Error::DeviceError(err.to_string())
}

struct CompiledKernel {
    kernel: core::Kernel,
    // The kernel borrows from the program through OpenCL reference counts;
    // keeping the wrapper here makes the ownership explicit.
    _program: Program,
}

/// Interface with one OpenCL device.
pub struct OpenClExecutor {
    device: Device,
    context: Context,
    queue: Queue,
    buffers: FxHashMap<u64, Buffer<u8>>,
    kernels: FxHashMap<u64, CompiledKernel>,
    events: FxHashMap<u64, RawEvent>,
    // Sub-buffers bound to in-flight launches; released at queue finish.
    pending_regions: Vec<Buffer<u8>>,
    next_id: u64,
    max_work_group_size: usize,
    max_work_item_sizes: Vec<usize>,
    local_mem_size: usize,
}

impl OpenClExecutor {
    /// Opens platform `platform_id` / device `device_id`.
    pub fn new(platform_id: usize, device_id: usize) -> Result<OpenClExecutor, Error> {
        let platforms = Platform::list();
        let platform = *platforms
            .get(platform_id)
            .ok_or_else(|| Error::DeviceError(format!("no platform {}", platform_id)))?;
        let devices = Device::list_all(platform).map_err(device_error)?;
        let device = *devices
            .get(device_id)
            .ok_or_else(|| Error::DeviceError(format!("no device {}", device_id)))?;
        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(device_error)?;
        let queue = Queue::new(&context, device, Some(ocl::flags::QUEUE_PROFILING_ENABLE))
            .map_err(device_error)?;
        let max_work_group_size =
            match device.info(OclDeviceInfo::MaxWorkGroupSize).map_err(device_error)? {
                DeviceInfoResult::MaxWorkGroupSize(size) => size,
                _ => 0,
            };
        let max_work_item_sizes =
            match device.info(OclDeviceInfo::MaxWorkItemSizes).map_err(device_error)? {
                DeviceInfoResult::MaxWorkItemSizes(sizes) => sizes,
                _ => Vec::new(),
            };
        let local_mem_size =
            match device.info(OclDeviceInfo::LocalMemSize).map_err(device_error)? {
                DeviceInfoResult::LocalMemSize(size) => size as usize,
                _ => 0,
            };
        Ok(OpenClExecutor {
            device,
            context,
            queue,
            buffers: FxHashMap::default(),
            kernels: FxHashMap::default(),
            events: FxHashMap::default(),
            pending_regions: Vec::new(),
            next_id: 0,
            max_work_group_size,
            max_work_item_sizes,
            local_mem_size,
        })
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&Buffer<u8>, Error> {
        self.buffers
            .get(&handle.0)
            .ok_or_else(|| Error::DeviceError(format!("unknown buffer {:?}", handle)))
    }

    fn info_string(&self, info: OclDeviceInfo) -> String {
        match self.device.info(info) {
            Ok(result) => result.to_string(),
            Err(..) => String::new(),
        }
    }
}

/// Pads a shape to the three work dimensions OpenCL expects.
fn work_dims(shape: &[usize]) -> [usize; 3] {
    let mut dims = [1; 3];
    for (out, &size) in dims.iter_mut().zip(shape) {
        *out = size;
    }
    dims
}

impl Executor for OpenClExecutor {
    fn info(&self) -> DeviceInfo {
        let core_clock_mhz = match self.device.info(OclDeviceInfo::MaxClockFrequency) {
            Ok(DeviceInfoResult::MaxClockFrequency(mhz)) => mhz as usize,
            _ => 0,
        };
        let compute_units = match self.device.info(OclDeviceInfo::MaxComputeUnits) {
            Ok(DeviceInfoResult::MaxComputeUnits(units)) => units as usize,
            _ => 0,
        };
        DeviceInfo {
            name: self.info_string(OclDeviceInfo::Name),
            vendor: self.info_string(OclDeviceInfo::Vendor),
            device_type: self.info_string(OclDeviceInfo::Type),
            core_clock_mhz,
            compute_units,
        }
    }

    fn is_thread_config_valid(&self, local: &[usize]) -> bool {
        if local.is_empty() || local.len() > 3 {
            return false;
        }
        if local.iter().product::<usize>() > self.max_work_group_size {
            return false;
        }
        local
            .iter()
            .zip(&self.max_work_item_sizes)
            .all(|(&size, &cap)| size <= cap)
    }

    fn is_local_memory_valid(&self, bytes: usize) -> bool {
        bytes <= self.local_mem_size
    }

    fn compile(&mut self, source: &str, kernel_name: &str) -> Result<KernelHandle, Error> {
        let program = Program::builder()
            .devices(self.device)
            .src(source)
            .build(&self.context)
            .map_err(|err| Error::CompileError(err.to_string()))?;
        let kernel = core::create_kernel(program.as_core(), kernel_name)
            .map_err(|err| Error::CompileError(err.to_string()))?;
        let id = self.fresh_id();
        self.kernels.insert(
            id,
            CompiledKernel {
                kernel,
                _program: program,
            },
        );
        Ok(KernelHandle(id))
    }

    fn release_kernel(&mut self, kernel: KernelHandle) {
        self.kernels.remove(&kernel.0);
    }

    fn allocate(&mut self, bytes: usize) -> Result<BufferHandle, Error> {
        let buffer = Buffer::<u8>::builder()
            .queue(self.queue.clone())
            .len(bytes)
            .build()
            .map_err(device_error)?;
        let id = self.fresh_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn free(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn write_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<(), Error> {
        self.buffer(buffer)?
            .write(data)
            .enq()
            .map_err(device_error)
    }

    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Error> {
        self.buffer(buffer)?
            .read(out)
            .offset(offset)
            .enq()
            .map_err(device_error)
    }

    fn copy_buffer(&mut self, src: BufferHandle, len: usize) -> Result<BufferHandle, Error> {
        let copy = Buffer::<u8>::builder()
            .queue(self.queue.clone())
            .len(len)
            .build()
            .map_err(device_error)?;
        self.buffer(src)?
            .copy(&copy, None, Some(len))
            .enq()
            .map_err(device_error)?;
        let id = self.fresh_id();
        self.buffers.insert(id, copy);
        Ok(BufferHandle(id))
    }

    fn local_mem_usage(&self, kernel: KernelHandle) -> usize {
        let compiled = match self.kernels.get(&kernel.0) {
            Some(compiled) => compiled,
            None => return 0,
        };
        match core::get_kernel_work_group_info(
            &compiled.kernel,
            self.device.as_core(),
            KernelWorkGroupInfo::LocalMemSize,
        ) {
            Ok(KernelWorkGroupInfoResult::LocalMemSize(bytes)) => bytes as usize,
            _ => 0,
        }
    }

    fn launch(
        &mut self,
        kernel: KernelHandle,
        global: &[usize],
        local: &[usize],
        args: &[BoundArg],
    ) -> Result<EventHandle, Error> {
        let dims = global.len().max(local.len()).max(1) as u32;
        let global = work_dims(global);
        let local = work_dims(local);
        let mut regions = Vec::new();
        {
            let compiled = self
                .kernels
                .get(&kernel.0)
                .ok_or_else(|| Error::DeviceError("launch of released kernel".to_string()))?;
            for (index, arg) in args.iter().enumerate() {
                match arg {
                    BoundArg::Scalar { bytes, .. } => {
                        let value = unsafe {
                            ArgVal::from_raw(
                                bytes.len(),
                                bytes.as_ptr() as *const std::ffi::c_void,
                            )
                        };
                        core::set_kernel_arg(&compiled.kernel, index as u32, value)
                            .map_err(device_error)?;
                    }
                    BoundArg::Region {
                        handle,
                        offset,
                        len,
                    } => {
                        let buffer = self
                            .buffers
                            .get(&handle.0)
                            .ok_or_else(|| {
                                Error::DeviceError(format!("unknown buffer {:?}", handle))
                            })?;
                        if *offset == 0 && *len == buffer.len() {
                            let value = ArgVal::mem(buffer.as_core());
                            core::set_kernel_arg(&compiled.kernel, index as u32, value)
                                .map_err(device_error)?;
                        } else {
                            let region = buffer
                                .create_sub_buffer(None, *offset, *len)
                                .map_err(device_error)?;
                            let value = ArgVal::mem(region.as_core());
                            core::set_kernel_arg(&compiled.kernel, index as u32, value)
                                .map_err(device_error)?;
                            regions.push(region);
                        }
                    }
                }
            }
            let mut event = RawEvent::null();
            unsafe {
                core::enqueue_kernel(
                    self.queue.as_core(),
                    &compiled.kernel,
                    dims,
                    None,
                    &global,
                    Some(local),
                    None::<core::Event>,
                    Some(&mut event),
                )
                .map_err(device_error)?;
            }
            let id = self.next_id + 1;
            self.next_id = id;
            self.events.insert(id, event);
        }
        self.pending_regions.append(&mut regions);
        Ok(EventHandle(self.next_id))
    }

    fn finish(&mut self) {
        let _ = self.queue.finish();
        self.pending_regions.clear();
    }

    fn elapsed_ms(&self, event: EventHandle) -> Result<f64, Error> {
        let event = self
            .events
            .get(&event.0)
            .ok_or_else(|| Error::DeviceError(format!("unknown event {:?}", event)))?;
        let start = match core::get_event_profiling_info(event, ProfilingInfo::Start)
            .map_err(device_error)?
        {
            ProfilingInfoResult::Start(ns) => ns,
            _ => 0,
        };
        let end = match core::get_event_profiling_info(event, ProfilingInfo::End)
            .map_err(device_error)?
        {
            ProfilingInfoResult::End(ns) => ns,
            _ => 0,
        };
        Ok((end.saturating_sub(start)) as f64 * 1.0e-6)
    }
}
