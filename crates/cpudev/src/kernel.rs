//! Kernel descriptors and the commands the surrounding scheduler hands to a device.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytemuck::Pod;
use cpudev_abi::NativeFn;

use crate::alloc::MemoryObject;
use crate::cache::EntryPoint;
use crate::image::SamplerDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// Passed by value; the kernel reads `size` bytes through its slot.
    Value,
    /// Global/constant buffer (or null).
    Pointer,
    /// Dynamically sized local memory, allocated per dispatch.
    Local,
    Image,
    Sampler,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    pub name: String,
    pub kind: ArgKind,
    pub size: usize,
}

impl ArgInfo {
    pub fn new(name: impl Into<String>, kind: ArgKind, size: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
        }
    }
}

/// A compiled kernel as far as the driver is concerned. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    name: String,
    args: Vec<ArgInfo>,
    autolocal_sizes: Vec<usize>,
}

impl Kernel {
    pub fn new(name: impl Into<String>, args: Vec<ArgInfo>) -> Self {
        Self {
            name: name.into(),
            args,
            autolocal_sizes: Vec::new(),
        }
    }

    /// Appends the compiler-synthesized local buffers ("autolocals"), in launcher order.
    pub fn with_autolocals(mut self, sizes: Vec<usize>) -> Self {
        self.autolocal_sizes = sizes;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[ArgInfo] {
        &self.args
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn num_locals(&self) -> usize {
        self.autolocal_sizes.len()
    }

    pub fn autolocal_sizes(&self) -> &[usize] {
        &self.autolocal_sizes
    }
}

/// Byte blob stored with 16-byte alignment, so generated code may load any scalar or short
/// vector from it directly.
#[derive(Clone, PartialEq, Eq)]
pub struct ArgBytes {
    words: Vec<u128>,
    len: usize,
}

impl ArgBytes {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut words = vec![0u128; bytes.len().div_ceil(16)];
        bytemuck::cast_slice_mut::<u128, u8>(&mut words)[..bytes.len()].copy_from_slice(bytes);
        Self {
            words,
            len: bytes.len(),
        }
    }

    pub fn from_pod<T: Pod>(value: T) -> Self {
        Self::from_bytes(bytemuck::bytes_of(&value))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u128, u8>(&self.words)[..self.len]
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u128, u8>(&mut self.words)[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_arg_ptr(&self) -> *mut c_void {
        self.words.as_ptr() as *mut c_void
    }

    pub(crate) fn as_mut_arg_ptr(&mut self) -> *mut c_void {
        self.words.as_mut_ptr().cast()
    }
}

impl std::fmt::Debug for ArgBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ArgBytes").field(&self.as_bytes()).finish()
    }
}

/// The value bound to one explicit kernel argument.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Value(ArgBytes),
    /// `None` is a legal null buffer argument.
    Buffer(Option<Arc<MemoryObject>>),
    /// Requested size in bytes of a local-memory argument.
    Local(usize),
    Image(Arc<MemoryObject>),
    Sampler(SamplerDesc),
}

/// One NDRange dispatch request.
#[derive(Debug, Clone)]
pub struct RunCommand {
    pub kernel: Arc<Kernel>,
    pub arguments: Vec<ArgValue>,
    pub work_dim: u32,
    pub local_size: [usize; 3],
    pub num_groups: [usize; 3],
    pub global_offset: [usize; 3],
    /// Directory identifying the program build; half of the kernel cache key.
    pub build_dir: PathBuf,
    /// Precompiled module to load instead of invoking the code generator.
    pub precompiled: Option<PathBuf>,
    entry: Option<EntryPoint>,
}

impl RunCommand {
    pub fn new(
        kernel: Arc<Kernel>,
        arguments: Vec<ArgValue>,
        local_size: [usize; 3],
        num_groups: [usize; 3],
        build_dir: impl Into<PathBuf>,
    ) -> Self {
        let work_dim = match (
            num_groups[2].saturating_mul(local_size[2]),
            num_groups[1].saturating_mul(local_size[1]),
        ) {
            (z, _) if z > 1 => 3,
            (_, y) if y > 1 => 2,
            _ => 1,
        };
        Self {
            kernel,
            arguments,
            work_dim,
            local_size,
            num_groups,
            global_offset: [0; 3],
            build_dir: build_dir.into(),
            precompiled: None,
            entry: None,
        }
    }

    pub fn with_precompiled(mut self, path: impl Into<PathBuf>) -> Self {
        self.precompiled = Some(path.into());
        self
    }

    pub fn is_precompiled(&self) -> bool {
        self.precompiled.is_some()
    }

    pub fn precompiled_path(&self) -> Option<&Path> {
        self.precompiled.as_deref()
    }

    pub fn entry_point(&self) -> Option<&EntryPoint> {
        self.entry.as_ref()
    }

    pub(crate) fn set_entry_point(&mut self, entry: EntryPoint) {
        self.entry = Some(entry);
    }

    pub fn group_count(&self) -> usize {
        self.num_groups.iter().product()
    }
}

/// A command wrapping a plain host callback and its pre-built argument blob.
#[derive(Debug, Clone)]
pub struct NativeCommand {
    pub func: NativeFn,
    pub args: ArgBytes,
}

#[derive(Debug, Clone)]
pub enum Command {
    NdRange(RunCommand),
    Native(NativeCommand),
}
