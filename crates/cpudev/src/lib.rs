//! `cpudev` is the host-CPU execution backend of a heterogeneous compute runtime.
//!
//! Device memory of this backend is ordinary host memory, and kernels are native shared objects
//! produced by an external code generator. The crate provides:
//! - Memory objects with a per-device address table, resolved lazily and aliased across every
//!   device instance of one address space (see [`alloc`]).
//! - Linear and rectangular transfer, fill and map primitives over resolved addresses (see
//!   [`transfer`]).
//! - A process-wide cache from `(build directory, kernel name)` to a loaded work-group launcher
//!   (see [`KernelCache`]).
//! - Argument marshaling and the work-group loop (see [`ExecutionEngine`]), bundled with the rest
//!   into [`BasicDevice`].

pub mod alloc;
pub mod cache;
pub mod image;
pub mod kernel;
pub mod transfer;

mod basic;
mod config;
mod device;
mod error;
mod exec;

pub use alloc::{alloc_mem_obj, free_mem_obj, AddressCell, AlignedBuf, MemFlags, MemoryObject};
pub use basic::BasicDevice;
pub use cache::{
    CodeGenerator, DlModuleLoader, EntryPoint, ExternalCodeGenerator, KernelCache, LoadedModule,
    ModuleLoader,
};
pub use config::{
    DriverConfig, DEFAULT_CODEGEN_PROGRAM, DEFAULT_MAX_WORK_GROUP_SIZE, MAX_EXTENDED_ALIGNMENT,
};
pub use device::{timer_value_ns, DeviceDescriptor, DeviceId, GlobalMemId, GlobalMemoryDomain};
pub use error::{ConfigError, DriverError, DriverResult};
pub use exec::{DispatchSummary, ExecutionEngine, ScratchStats};
pub use image::{ImageDesc, SamplerDesc};
pub use kernel::{ArgBytes, ArgInfo, ArgKind, ArgValue, Command, Kernel, NativeCommand, RunCommand};
pub use transfer::Pitch;

pub use cpudev_abi as abi;
