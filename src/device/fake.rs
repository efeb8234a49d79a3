//! An in-process device. Buffers live in host memory, "compilation" parses
//! the injected `#define` block, and launches run host closures registered
//! per kernel name. Timings are synthetic and deterministic, which keeps
//! searcher tests stable.
use std::mem;

use fxhash::FxHashMap;

use crate::arguments::{bytes_of, HostScalar, MemType};
use crate::device::{BoundArg, BufferHandle, DeviceInfo, EventHandle, Executor, KernelHandle};
use crate::error::Error;

type CostFn = Box<dyn Fn(&FxHashMap<String, usize>, &[usize], &[usize]) -> f64>;
type LocalMemFn = Box<dyn Fn(&FxHashMap<String, usize>) -> usize>;

/// A kernel behavior registered on the fake device.
pub struct FakeKernel {
    body: Box<dyn Fn(&mut FakeLaunch)>,
    cost: Option<CostFn>,
    local_mem: Option<LocalMemFn>,
}

impl FakeKernel {
    pub fn new<F: Fn(&mut FakeLaunch) + 'static>(body: F) -> FakeKernel {
        FakeKernel {
            body: Box::new(body),
            cost: None,
            local_mem: None,
        }
    }

    /// Overrides the synthetic launch time; receives the define map and the
    /// launch shape.
    pub fn with_cost<F>(mut self, cost: F) -> FakeKernel
    where
        F: Fn(&FxHashMap<String, usize>, &[usize], &[usize]) -> f64 + 'static,
    {
        self.cost = Some(Box::new(cost));
        self
    }

    /// Overrides the reported local-memory usage of the compiled kernel.
    pub fn with_local_mem<F>(mut self, local_mem: F) -> FakeKernel
    where
        F: Fn(&FxHashMap<String, usize>) -> usize + 'static,
    {
        self.local_mem = Some(Box::new(local_mem));
        self
    }
}

enum FakeArg {
    Scalar { mem_type: MemType, bytes: Vec<u8> },
    Buffer {
        handle: u64,
        offset: usize,
        data: Vec<u8>,
    },
}

/// A reified launch handed to a fake kernel body. Buffer regions are
/// materialized as owned byte vectors and written back after the body runs.
pub struct FakeLaunch<'a> {
    pub defines: &'a FxHashMap<String, usize>,
    pub global: &'a [usize],
    pub local: &'a [usize],
    args: Vec<FakeArg>,
}

impl<'a> FakeLaunch<'a> {
    /// The value of an injected `#define`, if present.
    pub fn define(&self, name: &str) -> Option<usize> {
        self.defines.get(name).cloned()
    }

    /// Decodes the scalar argument at `index`.
    pub fn scalar<T: HostScalar>(&self, index: usize) -> T {
        match &self.args[index] {
            FakeArg::Scalar { mem_type, bytes } => {
                assert_eq!(*mem_type, T::mem_type(), "argument {} type", index);
                unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) }
            }
            FakeArg::Buffer { .. } => panic!("argument {} is a buffer", index),
        }
    }

    /// Number of `T` elements in the buffer region bound at `index`.
    pub fn elements<T: HostScalar>(&self, index: usize) -> usize {
        match &self.args[index] {
            FakeArg::Buffer { data, .. } => data.len() / mem::size_of::<T>(),
            FakeArg::Scalar { .. } => panic!("argument {} is a scalar", index),
        }
    }

    /// Copies the buffer region bound at `index` into typed host storage.
    pub fn read<T: HostScalar>(&self, index: usize) -> Vec<T> {
        match &self.args[index] {
            FakeArg::Buffer { data, .. } => {
                let elements = data.len() / mem::size_of::<T>();
                let mut values = Vec::with_capacity(elements);
                for chunk in data.chunks_exact(mem::size_of::<T>()) {
                    values.push(unsafe { std::ptr::read_unaligned(chunk.as_ptr() as *const T) });
                }
                values
            }
            FakeArg::Scalar { .. } => panic!("argument {} is a scalar", index),
        }
    }

    /// Overwrites the buffer region bound at `index`.
    pub fn write<T: HostScalar>(&mut self, index: usize, values: &[T]) {
        match &mut self.args[index] {
            FakeArg::Buffer { data, .. } => {
                let bytes = bytes_of(values);
                assert_eq!(bytes.len(), data.len(), "argument {} region size", index);
                data.copy_from_slice(bytes);
            }
            FakeArg::Scalar { .. } => panic!("argument {} is a scalar", index),
        }
    }
}

struct CompiledKernel {
    name: String,
    defines: FxHashMap<String, usize>,
}

/// The fake executor. Device limits are public so tests can tighten them.
pub struct FakeExecutor {
    kernels: FxHashMap<String, FakeKernel>,
    buffers: FxHashMap<u64, Vec<u8>>,
    compiled: FxHashMap<u64, CompiledKernel>,
    events: FxHashMap<u64, f64>,
    next_id: u64,
    pub max_local_threads: usize,
    pub max_local_dims: [usize; 3],
    pub local_mem_limit: usize,
    pub default_cost: f64,
}

impl Default for FakeExecutor {
    fn default() -> FakeExecutor {
        FakeExecutor {
            kernels: FxHashMap::default(),
            buffers: FxHashMap::default(),
            compiled: FxHashMap::default(),
            events: FxHashMap::default(),
            next_id: 0,
            max_local_threads: 1024,
            max_local_dims: [1024, 1024, 64],
            local_mem_limit: 48 * 1024,
            default_cost: 1.0,
        }
    }
}

impl FakeExecutor {
    pub fn new() -> FakeExecutor {
        FakeExecutor::default()
    }

    /// Registers the behavior executed for kernels named `name`.
    pub fn define_kernel(&mut self, name: &str, kernel: FakeKernel) {
        self.kernels.insert(name.to_string(), kernel);
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Extracts the values of the `#define NAME VALUE` lines prepended to the
/// source by the engine. Non-integer defines are ignored.
fn parse_defines(source: &str) -> FxHashMap<String, usize> {
    let mut defines = FxHashMap::default();
    for line in source.lines() {
        let mut words = line.split_whitespace();
        if words.next() != Some("#define") {
            continue;
        }
        if let (Some(name), Some(value)) = (words.next(), words.next()) {
            if let Ok(value) = value.parse::<usize>() {
                defines.insert(name.to_string(), value);
            }
        }
    }
    defines
}

impl Executor for FakeExecutor {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "fake-device".to_string(),
            vendor: "kerntune".to_string(),
            device_type: "emulator".to_string(),
            core_clock_mhz: 1000,
            compute_units: 16,
        }
    }

    fn is_thread_config_valid(&self, local: &[usize]) -> bool {
        if local.is_empty() || local.len() > 3 {
            return false;
        }
        if local.iter().product::<usize>() > self.max_local_threads {
            return false;
        }
        local
            .iter()
            .zip(self.max_local_dims.iter())
            .all(|(&size, &cap)| size <= cap)
    }

    fn is_local_memory_valid(&self, bytes: usize) -> bool {
        bytes <= self.local_mem_limit
    }

    fn compile(&mut self, source: &str, kernel_name: &str) -> Result<KernelHandle, Error> {
        if source.contains("#error") {
            return Err(Error::CompileError(format!(
                "explicit #error while compiling {}",
                kernel_name
            )));
        }
        if !self.kernels.contains_key(kernel_name) {
            return Err(Error::CompileError(format!(
                "undefined kernel '{}'",
                kernel_name
            )));
        }
        let compiled = CompiledKernel {
            name: kernel_name.to_string(),
            defines: parse_defines(source),
        };
        let id = self.fresh_id();
        self.compiled.insert(id, compiled);
        Ok(KernelHandle(id))
    }

    fn release_kernel(&mut self, kernel: KernelHandle) {
        self.compiled.remove(&kernel.0);
    }

    fn allocate(&mut self, bytes: usize) -> Result<BufferHandle, Error> {
        let id = self.fresh_id();
        self.buffers.insert(id, vec![0; bytes]);
        Ok(BufferHandle(id))
    }

    fn free(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn write_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<(), Error> {
        let storage = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| Error::DeviceError(format!("unknown buffer {:?}", buffer)))?;
        if data.len() > storage.len() {
            return Err(Error::DeviceError("buffer write out of bounds".to_string()));
        }
        storage[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        buffer: BufferHandle,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), Error> {
        let storage = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| Error::DeviceError(format!("unknown buffer {:?}", buffer)))?;
        let end = offset + out.len();
        if end > storage.len() {
            return Err(Error::DeviceError("buffer read out of bounds".to_string()));
        }
        out.copy_from_slice(&storage[offset..end]);
        Ok(())
    }

    fn copy_buffer(&mut self, src: BufferHandle, len: usize) -> Result<BufferHandle, Error> {
        let data = {
            let storage = self
                .buffers
                .get(&src.0)
                .ok_or_else(|| Error::DeviceError(format!("unknown buffer {:?}", src)))?;
            if len > storage.len() {
                return Err(Error::DeviceError("buffer copy out of bounds".to_string()));
            }
            storage[..len].to_vec()
        };
        let id = self.fresh_id();
        self.buffers.insert(id, data);
        Ok(BufferHandle(id))
    }

    fn local_mem_usage(&self, kernel: KernelHandle) -> usize {
        let compiled = match self.compiled.get(&kernel.0) {
            Some(compiled) => compiled,
            None => return 0,
        };
        match self.kernels.get(&compiled.name).and_then(|k| k.local_mem.as_ref()) {
            Some(local_mem) => local_mem(&compiled.defines),
            None => 0,
        }
    }

    fn launch(
        &mut self,
        kernel: KernelHandle,
        global: &[usize],
        local: &[usize],
        args: &[BoundArg],
    ) -> Result<EventHandle, Error> {
        let (cost, written) = {
            let compiled = self
                .compiled
                .get(&kernel.0)
                .ok_or_else(|| Error::DeviceError("launch of released kernel".to_string()))?;
            let fake = self.kernels.get(&compiled.name).ok_or_else(|| {
                Error::DeviceError(format!(
                    "no behavior registered for kernel '{}'",
                    compiled.name
                ))
            })?;
            let mut reified = Vec::with_capacity(args.len());
            for arg in args {
                match arg {
                    BoundArg::Scalar { mem_type, bytes } => reified.push(FakeArg::Scalar {
                        mem_type: *mem_type,
                        bytes: bytes.clone(),
                    }),
                    BoundArg::Region {
                        handle,
                        offset,
                        len,
                    } => {
                        let storage = self.buffers.get(&handle.0).ok_or_else(|| {
                            Error::DeviceError(format!("unknown buffer {:?}", handle))
                        })?;
                        let end = offset + len;
                        if end > storage.len() {
                            return Err(Error::DeviceError(
                                "buffer region out of bounds".to_string(),
                            ));
                        }
                        reified.push(FakeArg::Buffer {
                            handle: handle.0,
                            offset: *offset,
                            data: storage[*offset..end].to_vec(),
                        });
                    }
                }
            }
            let mut launch = FakeLaunch {
                defines: &compiled.defines,
                global,
                local,
                args: reified,
            };
            (fake.body)(&mut launch);
            let cost = match &fake.cost {
                Some(cost) => cost(&compiled.defines, global, local),
                None => self.default_cost,
            };
            (cost, launch.args)
        };
        for arg in written {
            if let FakeArg::Buffer {
                handle,
                offset,
                data,
            } = arg
            {
                if let Some(storage) = self.buffers.get_mut(&handle) {
                    storage[offset..offset + data.len()].copy_from_slice(&data);
                }
            }
        }
        let id = self.fresh_id();
        self.events.insert(id, cost);
        Ok(EventHandle(id))
    }

    fn finish(&mut self) {}

    fn elapsed_ms(&self, event: EventHandle) -> Result<f64, Error> {
        self.events
            .get(&event.0)
            .cloned()
            .ok_or_else(|| Error::DeviceError(format!("unknown event {:?}", event)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_parsing() {
        let defines = parse_defines("#define WG 64\n#define VEC 4\n__kernel void k() {}\n");
        assert_eq!(defines.get("WG"), Some(&64));
        assert_eq!(defines.get("VEC"), Some(&4));
        assert_eq!(defines.len(), 2);
    }

    #[test]
    fn buffer_roundtrip() {
        let mut executor = FakeExecutor::new();
        let buffer = executor.allocate(16).unwrap();
        let data = [1.0f32, 2.0, 3.0, 4.0];
        executor.write_buffer(buffer, bytes_of(&data)).unwrap();
        let mut out = [0.0f32; 2];
        executor
            .read_buffer(buffer, 8, crate::arguments::bytes_of_mut(&mut out))
            .unwrap();
        assert_eq!(out, [3.0, 4.0]);
    }

    #[test]
    fn launch_executes_registered_body_on_regions() {
        let mut executor = FakeExecutor::new();
        executor.define_kernel(
            "double_up",
            FakeKernel::new(|launch| {
                let input: Vec<f32> = launch.read(0);
                let doubled: Vec<f32> = input.iter().map(|x| x * 2.0).collect();
                launch.write(1, &doubled);
            }),
        );
        let input = executor.allocate(16).unwrap();
        let output = executor.allocate(16).unwrap();
        executor
            .write_buffer(input, bytes_of(&[1.0f32, 2.0, 3.0, 4.0]))
            .unwrap();
        let kernel = executor.compile("__kernel void double_up()", "double_up").unwrap();
        // Bind only the second half of each buffer.
        let args = [
            BoundArg::Region {
                handle: input,
                offset: 8,
                len: 8,
            },
            BoundArg::Region {
                handle: output,
                offset: 8,
                len: 8,
            },
        ];
        let event = executor.launch(kernel, &[2], &[2], &args).unwrap();
        assert_eq!(executor.elapsed_ms(event).unwrap(), 1.0);
        let mut out = [0.0f32; 4];
        executor
            .read_buffer(output, 0, crate::arguments::bytes_of_mut(&mut out))
            .unwrap();
        assert_eq!(out, [0.0, 0.0, 6.0, 8.0]);
    }

    #[test]
    fn compile_requires_registered_kernel() {
        let mut executor = FakeExecutor::new();
        assert!(executor.compile("__kernel void missing()", "missing").is_err());
        executor.define_kernel("k", FakeKernel::new(|_| {}));
        assert!(executor.compile("#error broken", "k").is_err());
        assert!(executor.compile("__kernel void k()", "k").is_ok());
    }

    #[test]
    fn thread_config_limits() {
        let executor = FakeExecutor::new();
        assert!(executor.is_thread_config_valid(&[32]));
        assert!(executor.is_thread_config_valid(&[32, 32]));
        assert!(!executor.is_thread_config_valid(&[64, 64]));
        assert!(!executor.is_thread_config_valid(&[1, 1, 128]));
        assert!(!executor.is_thread_config_valid(&[]));
    }
}
