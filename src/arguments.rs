//! Typed kernel arguments: scalars, device buffers and host-side vectors.
//!
//! Arguments are held in a single ordered list; the insertion order of an
//! argument is its positional index in the kernel signature. Output buffers
//! are special in that the engine never launches against them directly: a
//! fresh scratch copy is made before every run so kernel side effects do not
//! leak into subsequent runs.
use std::fmt;
use std::mem;
use std::slice;

use half::f16;
use num::complex::{Complex32, Complex64};

use crate::device::BufferHandle;
use crate::error::Error;

/// Data-types supported for device memory and scalar arguments.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemType {
    I16,
    I32,
    Usize,
    F16,
    F32,
    F64,
    Cplx32,
    Cplx64,
}

impl MemType {
    /// Size of one element in bytes.
    pub fn elem_bytes(self) -> usize {
        match self {
            MemType::I16 | MemType::F16 => 2,
            MemType::I32 | MemType::F32 => 4,
            MemType::Usize => mem::size_of::<usize>(),
            MemType::F64 | MemType::Cplx32 => 8,
            MemType::Cplx64 => 16,
        }
    }
}

/// Reinterprets a slice of plain-old-data values as raw bytes.
pub fn bytes_of<T: Copy>(values: &[T]) -> &[u8] {
    unsafe {
        slice::from_raw_parts(
            values.as_ptr() as *const u8,
            values.len() * mem::size_of::<T>(),
        )
    }
}

/// Mutable variant of `bytes_of`, used to download device buffers into typed
/// host storage.
pub fn bytes_of_mut<T: Copy>(values: &mut [T]) -> &mut [u8] {
    unsafe {
        slice::from_raw_parts_mut(
            values.as_mut_ptr() as *mut u8,
            values.len() * mem::size_of::<T>(),
        )
    }
}

/// A host value that can be passed to a kernel as a scalar or uploaded as a
/// buffer element. Implementers must be plain-old-data: no padding with
/// uninitialized bytes and no references.
pub unsafe trait HostScalar: Copy + fmt::Debug + Send + Sync + 'static {
    /// The device data-type of the value.
    fn mem_type() -> MemType;
    /// Wraps the value into a `ScalarArg`.
    fn into_arg(self) -> ScalarArg;
}

macro_rules! host_scalar {
    ($ty:ty, $tag:ident) => {
        unsafe impl HostScalar for $ty {
            fn mem_type() -> MemType {
                MemType::$tag
            }

            fn into_arg(self) -> ScalarArg {
                ScalarArg::$tag(self)
            }
        }
    };
}

host_scalar!(i16, I16);
host_scalar!(i32, I32);
host_scalar!(usize, Usize);
host_scalar!(f16, F16);
host_scalar!(f32, F32);
host_scalar!(f64, F64);
host_scalar!(Complex32, Cplx32);
host_scalar!(Complex64, Cplx64);

/// A scalar kernel argument.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ScalarArg {
    I16(i16),
    I32(i32),
    Usize(usize),
    F16(f16),
    F32(f32),
    F64(f64),
    Cplx32(Complex32),
    Cplx64(Complex64),
}

impl ScalarArg {
    pub fn mem_type(&self) -> MemType {
        match *self {
            ScalarArg::I16(..) => MemType::I16,
            ScalarArg::I32(..) => MemType::I32,
            ScalarArg::Usize(..) => MemType::Usize,
            ScalarArg::F16(..) => MemType::F16,
            ScalarArg::F32(..) => MemType::F32,
            ScalarArg::F64(..) => MemType::F64,
            ScalarArg::Cplx32(..) => MemType::Cplx32,
            ScalarArg::Cplx64(..) => MemType::Cplx64,
        }
    }

    /// Raw bytes in host byte order, as handed to the device layer.
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            ScalarArg::I16(v) => bytes_of(slice::from_ref(&v)).to_vec(),
            ScalarArg::I32(v) => bytes_of(slice::from_ref(&v)).to_vec(),
            ScalarArg::Usize(v) => bytes_of(slice::from_ref(&v)).to_vec(),
            ScalarArg::F16(v) => bytes_of(slice::from_ref(&v)).to_vec(),
            ScalarArg::F32(v) => bytes_of(slice::from_ref(&v)).to_vec(),
            ScalarArg::F64(v) => bytes_of(slice::from_ref(&v)).to_vec(),
            ScalarArg::Cplx32(v) => bytes_of(slice::from_ref(&v)).to_vec(),
            ScalarArg::Cplx64(v) => bytes_of(slice::from_ref(&v)).to_vec(),
        }
    }
}

/// A device memory argument: positional index, element count, data-type and
/// the opaque buffer handle minted by the executor.
#[derive(Copy, Clone, Debug)]
pub struct BufferArg {
    pub index: usize,
    pub elements: usize,
    pub mem_type: MemType,
    pub handle: BufferHandle,
}

impl BufferArg {
    pub fn size_bytes(&self) -> usize {
        self.elements * self.mem_type.elem_bytes()
    }
}

/// One entry of the ordered kernel argument list.
#[derive(Clone, Debug)]
pub enum KernelArg {
    Scalar(ScalarArg),
    Input(BufferArg),
    Output(BufferArg),
}

/// Ordered kernel argument list; insertion order is the argument index.
#[derive(Clone, Debug, Default)]
pub struct ArgumentStore {
    args: Vec<KernelArg>,
}

impl ArgumentStore {
    pub fn new() -> Self {
        ArgumentStore::default()
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// The index the next inserted argument will receive.
    pub fn next_index(&self) -> usize {
        self.args.len()
    }

    pub fn push_scalar(&mut self, scalar: ScalarArg) -> usize {
        self.args.push(KernelArg::Scalar(scalar));
        self.args.len() - 1
    }

    pub fn push_input(&mut self, elements: usize, mem_type: MemType, handle: BufferHandle) -> usize {
        let index = self.args.len();
        self.args.push(KernelArg::Input(BufferArg {
            index,
            elements,
            mem_type,
            handle,
        }));
        index
    }

    pub fn push_output(
        &mut self,
        elements: usize,
        mem_type: MemType,
        handle: BufferHandle,
    ) -> usize {
        let index = self.args.len();
        self.args.push(KernelArg::Output(BufferArg {
            index,
            elements,
            mem_type,
            handle,
        }));
        index
    }

    /// Replaces a previously registered scalar of the same type at `index`.
    pub fn modify_scalar(&mut self, index: usize, new: ScalarArg) -> Result<(), Error> {
        match self.args.get_mut(index) {
            Some(KernelArg::Scalar(old)) if old.mem_type() == new.mem_type() => {
                *old = new;
                Ok(())
            }
            _ => Err(Error::InvalidScalarIndex(index)),
        }
    }

    pub fn iter(&self) -> slice::Iter<KernelArg> {
        self.args.iter()
    }

    /// Output buffers, in declaration order.
    pub fn outputs(&self) -> impl Iterator<Item = &BufferArg> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            KernelArg::Output(buffer) => Some(buffer),
            _ => None,
        })
    }

    /// Input buffers, in declaration order.
    pub fn inputs(&self) -> impl Iterator<Item = &BufferArg> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            KernelArg::Input(buffer) => Some(buffer),
            _ => None,
        })
    }

    /// All device buffers owned through this store.
    pub fn buffers(&self) -> impl Iterator<Item = &BufferArg> + '_ {
        self.args.iter().filter_map(|arg| match arg {
            KernelArg::Input(buffer) | KernelArg::Output(buffer) => Some(buffer),
            KernelArg::Scalar(..) => None,
        })
    }
}

/// A typed host-side copy of a device buffer. Reference outputs are kept in
/// this form for the session lifetime.
#[derive(Clone, Debug)]
pub enum HostVector {
    I16(Vec<i16>),
    I32(Vec<i32>),
    Usize(Vec<usize>),
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Cplx32(Vec<Complex32>),
    Cplx64(Vec<Complex64>),
}

impl HostVector {
    /// Allocates a zero-filled vector ready to receive a download.
    pub fn zeroed(mem_type: MemType, elements: usize) -> HostVector {
        match mem_type {
            MemType::I16 => HostVector::I16(vec![0; elements]),
            MemType::I32 => HostVector::I32(vec![0; elements]),
            MemType::Usize => HostVector::Usize(vec![0; elements]),
            MemType::F16 => HostVector::F16(vec![f16::from_f32(0.0); elements]),
            MemType::F32 => HostVector::F32(vec![0.0; elements]),
            MemType::F64 => HostVector::F64(vec![0.0; elements]),
            MemType::Cplx32 => HostVector::Cplx32(vec![Complex32::new(0.0, 0.0); elements]),
            MemType::Cplx64 => HostVector::Cplx64(vec![Complex64::new(0.0, 0.0); elements]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostVector::I16(v) => v.len(),
            HostVector::I32(v) => v.len(),
            HostVector::Usize(v) => v.len(),
            HostVector::F16(v) => v.len(),
            HostVector::F32(v) => v.len(),
            HostVector::F64(v) => v.len(),
            HostVector::Cplx32(v) => v.len(),
            HostVector::Cplx64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mem_type(&self) -> MemType {
        match self {
            HostVector::I16(..) => MemType::I16,
            HostVector::I32(..) => MemType::I32,
            HostVector::Usize(..) => MemType::Usize,
            HostVector::F16(..) => MemType::F16,
            HostVector::F32(..) => MemType::F32,
            HostVector::F64(..) => MemType::F64,
            HostVector::Cplx32(..) => MemType::Cplx32,
            HostVector::Cplx64(..) => MemType::Cplx64,
        }
    }

    /// A raw view of the storage, for filling from a device read.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            HostVector::I16(v) => bytes_of_mut(v),
            HostVector::I32(v) => bytes_of_mut(v),
            HostVector::Usize(v) => bytes_of_mut(v),
            HostVector::F16(v) => bytes_of_mut(v),
            HostVector::F32(v) => bytes_of_mut(v),
            HostVector::F64(v) => bytes_of_mut(v),
            HostVector::Cplx32(v) => bytes_of_mut(v),
            HostVector::Cplx64(v) => bytes_of_mut(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BufferHandle;

    #[test]
    fn scalar_bytes_match_type_sizes() {
        assert_eq!(ScalarArg::I16(-3).to_bytes().len(), 2);
        assert_eq!(ScalarArg::I32(7).to_bytes().len(), 4);
        assert_eq!(ScalarArg::F16(f16::from_f32(1.5)).to_bytes().len(), 2);
        assert_eq!(ScalarArg::F32(2.5).to_bytes().len(), 4);
        assert_eq!(ScalarArg::F64(2.5).to_bytes().len(), 8);
        assert_eq!(
            ScalarArg::Cplx32(Complex32::new(1.0, -1.0)).to_bytes().len(),
            8
        );
        assert_eq!(
            ScalarArg::Cplx64(Complex64::new(1.0, -1.0)).to_bytes().len(),
            16
        );
    }

    #[test]
    fn insertion_order_is_argument_index() {
        let mut store = ArgumentStore::new();
        assert_eq!(store.push_input(16, MemType::F32, BufferHandle(1)), 0);
        assert_eq!(store.push_scalar(ScalarArg::Usize(16)), 1);
        assert_eq!(store.push_output(16, MemType::F32, BufferHandle(2)), 2);
        assert_eq!(store.len(), 3);
        let outputs: Vec<_> = store.outputs().collect();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].index, 2);
    }

    #[test]
    fn modify_scalar_checks_type_and_position() {
        let mut store = ArgumentStore::new();
        store.push_input(4, MemType::F32, BufferHandle(1));
        store.push_scalar(ScalarArg::I32(10));
        assert!(store.modify_scalar(1, ScalarArg::I32(20)).is_ok());
        assert!(store.modify_scalar(1, ScalarArg::F32(1.0)).is_err());
        assert!(store.modify_scalar(0, ScalarArg::I32(5)).is_err());
        assert!(store.modify_scalar(9, ScalarArg::I32(5)).is_err());
    }

    #[test]
    fn host_vector_roundtrip() {
        let mut vector = HostVector::zeroed(MemType::F32, 4);
        let data = [1.0f32, 2.0, 3.0, 4.0];
        vector.as_bytes_mut().copy_from_slice(bytes_of(&data));
        match vector {
            HostVector::F32(v) => assert_eq!(v, data),
            _ => panic!("wrong data-type"),
        }
    }
}
