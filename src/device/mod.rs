//! The device-layer contract consumed by the tuning engine.
//!
//! The engine never talks to a GPU API directly: it compiles source strings,
//! moves bytes and launches kernels through the object-safe `Executor` trait.
//! Handles are opaque ids minted by the backend; the session owns them and
//! releases them when it ends.
pub mod fake;
#[cfg(feature = "opencl")]
pub mod opencl;

use crate::arguments::MemType;
use crate::error::Error;

/// A compiled kernel, valid until released.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// A device memory allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// A per-launch timing event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Description of the selected device, for reports.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub device_type: String,
    pub core_clock_mhz: usize,
    pub compute_units: usize,
}

/// An argument bound for one launch. The slice handed to `Executor::launch`
/// is positional: entry `i` binds kernel argument `i`.
#[derive(Clone, Debug)]
pub enum BoundArg {
    /// A scalar passed by value, as raw bytes in host byte order.
    Scalar { mem_type: MemType, bytes: Vec<u8> },
    /// A region of a device buffer; offsets and lengths are in bytes.
    /// Sub-launch iteration slicing binds strict sub-regions here.
    Region {
        handle: BufferHandle,
        offset: usize,
        len: usize,
    },
}

/// Interface with one compute device and its single in-order queue.
///
/// Launches are asynchronous: `launch` enqueues the kernel and returns a
/// timing event. The engine calls `finish` before reading the event so
/// measurements have exclusive occupancy of the device.
pub trait Executor {
    /// Returns the description of the device.
    fn info(&self) -> DeviceInfo;

    /// Whether the device accepts `local` as a work-group shape.
    fn is_thread_config_valid(&self, local: &[usize]) -> bool;

    /// Whether the device can provide `bytes` of local memory per group.
    fn is_local_memory_valid(&self, bytes: usize) -> bool;

    /// Compiles `source` and extracts the kernel named `kernel_name`.
    fn compile(&mut self, source: &str, kernel_name: &str) -> Result<KernelHandle, Error>;

    /// Releases a compiled kernel.
    fn release_kernel(&mut self, kernel: KernelHandle);

    /// Allocates an uninitialized device buffer of `bytes` bytes.
    fn allocate(&mut self, bytes: usize) -> Result<BufferHandle, Error>;

    /// Frees a device buffer.
    fn free(&mut self, buffer: BufferHandle);

    /// Uploads `data` to the start of the buffer.
    fn write_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<(), Error>;

    /// Downloads `out.len()` bytes starting at `offset`.
    fn read_buffer(&self, buffer: BufferHandle, offset: usize, out: &mut [u8])
        -> Result<(), Error>;

    /// Allocates a fresh buffer holding a copy of the first `len` bytes of
    /// `src`. Used to snapshot output buffers before each run.
    fn copy_buffer(&mut self, src: BufferHandle, len: usize) -> Result<BufferHandle, Error>;

    /// Local memory consumed by a compiled kernel, in bytes.
    fn local_mem_usage(&self, kernel: KernelHandle) -> usize;

    /// Enqueues one kernel launch and returns its timing event.
    fn launch(
        &mut self,
        kernel: KernelHandle,
        global: &[usize],
        local: &[usize],
        args: &[BoundArg],
    ) -> Result<EventHandle, Error>;

    /// Blocks until the queue is idle.
    fn finish(&mut self);

    /// Elapsed time of a completed launch, in milliseconds.
    fn elapsed_ms(&self, event: EventHandle) -> Result<f64, Error>;
}
