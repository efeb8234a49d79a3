//! An autotuner for parameterized GPU compute kernels.
//!
//! Given kernel source templates with named integer tuning parameters and a
//! set of candidate values per parameter, a [`Tuner`] session compiles and
//! runs kernel variants on one device, measures their runtimes, optionally
//! verifies their outputs against a reference implementation, and reports
//! the fastest valid configuration.
//!
//! Parameters reach the kernel source exclusively through injected
//! `#define NAME VALUE` lines. Launch shapes are derived from per-kernel
//! base shapes through declared modifiers, the configuration space is
//! filtered by user constraints and device admissibility, and four search
//! strategies (full, random, simulated annealing, particle swarm) decide
//! which configurations get measured.
//!
//! The device itself sits behind the [`device::Executor`] trait. An OpenCL
//! backend is available under the `opencl` cargo feature; the in-process
//! [`device::fake`] backend runs kernels as host closures and backs the test
//! suite.
#[macro_use]
extern crate ndarray;

pub mod arguments;
pub mod device;
mod error;
pub mod kernel;
pub mod model;
pub mod report;
pub mod search;
pub mod space;
mod tuner;
pub mod verify;

pub use crate::arguments::MemType;
pub use crate::error::Error;
pub use crate::kernel::{
    Configuration, ConstraintFn, LocalMemoryFn, NdRange, Parameter, Setting,
};
pub use crate::model::Model;
pub use crate::search::SearchMethod;
pub use crate::tuner::{Tuner, TunerConfigurator, TunerResult};
pub use crate::verify::VerificationMethod;
