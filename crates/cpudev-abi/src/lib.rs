//! Binary contract between the host-CPU device driver and generated kernel modules.
//!
//! Everything in this crate is read or written directly by machine code that the kernel code
//! generator emits, so the layouts are fixed: `#[repr(C)]`, no implicit padding, no host
//! pointers (addresses travel as `u64` so the layout is identical on every 64-bit host).
//!
//! Bump [`CPUDEV_ABI_VERSION`] whenever a layout or the launcher naming convention changes; the
//! code generator embeds the same constant and the two must agree.

use core::ffi::c_void;

use bytemuck::{Pod, Zeroable};

/// Version of every layout and naming rule in this crate.
pub const CPUDEV_ABI_VERSION: u32 = 1;

/// Prefix of the per-kernel work-group launcher symbol.
pub const LAUNCHER_SYMBOL_PREFIX: &str = "_cpudev_launcher_";
/// Suffix of the per-kernel work-group launcher symbol.
pub const LAUNCHER_SYMBOL_SUFFIX: &str = "_workgroup";

/// Number of grid dimensions carried by [`WorkgroupContext`].
pub const MAX_WORK_DIM: usize = 3;

/// Work-group launcher emitted by the code generator.
///
/// `args` points at one slot per kernel argument (explicit arguments first, then compiler
/// synthesized local buffers). Each slot is itself a pointer: to the argument value for plain
/// values, or to a cell holding the buffer/scratch address for everything else.
pub type WorkgroupFn = unsafe extern "C" fn(args: *mut *mut c_void, ctx: *mut WorkgroupContext);

/// Host callback wrapped by a native-kernel command.
pub type NativeFn = unsafe extern "C" fn(args: *mut c_void);

/// Launcher symbol exported by the generated module for `kernel_name`.
///
/// The symbol is `_cpudev_launcher_<kernel_name>_workgroup`.
pub fn workgroup_symbol(kernel_name: &str) -> String {
    let mut out = String::with_capacity(
        LAUNCHER_SYMBOL_PREFIX.len() + kernel_name.len() + LAUNCHER_SYMBOL_SUFFIX.len(),
    );
    out.push_str(LAUNCHER_SYMBOL_PREFIX);
    out.push_str(kernel_name);
    out.push_str(LAUNCHER_SYMBOL_SUFFIX);
    out
}

/// Per-dispatch execution context handed to every launcher call.
///
/// `local_size`, `num_groups`, `global_offset` and `work_dim` stay fixed for a whole dispatch;
/// only `group_id` changes between calls.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WorkgroupContext {
    pub work_dim: u32,
    pub reserved0: u32,
    pub num_groups: [u64; MAX_WORK_DIM],
    pub group_id: [u64; MAX_WORK_DIM],
    pub global_offset: [u64; MAX_WORK_DIM],
    pub local_size: [u64; MAX_WORK_DIM],
}

impl WorkgroupContext {
    pub const SIZE_BYTES: usize = 104;

    pub fn new(work_dim: u32, local_size: [u64; 3], num_groups: [u64; 3]) -> Self {
        Self {
            work_dim,
            local_size,
            num_groups,
            ..Self::default()
        }
    }

    /// Total number of work-groups in the grid.
    pub fn group_count(&self) -> u64 {
        self.num_groups.iter().product()
    }
}

/// Device-side image descriptor.
///
/// Staged into a freshly allocated buffer for every image argument of a dispatch; the kernel
/// receives a pointer to the staging buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DevImage {
    /// Host address of pixel (0, 0, 0) in the executing device's address space.
    pub data: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub image_array_size: u32,
    pub row_pitch: u32,
    pub slice_pitch: u32,
    pub num_mip_levels: u32,
    pub num_samples: u32,
    pub order: u32,
    pub data_type: u32,
    pub num_channels: u32,
    pub elem_size: u32,
}

impl DevImage {
    pub const SIZE_BYTES: usize = 56;

    pub fn data_ptr(&self) -> *mut c_void {
        self.data as usize as *mut c_void
    }
}

pub const CLK_NORMALIZED_COORDS_FALSE: u32 = 0x0;
pub const CLK_NORMALIZED_COORDS_TRUE: u32 = 0x1;

pub const CLK_ADDRESS_NONE: u32 = 0x0;
pub const CLK_ADDRESS_CLAMP_TO_EDGE: u32 = 0x2;
pub const CLK_ADDRESS_CLAMP: u32 = 0x4;
pub const CLK_ADDRESS_REPEAT: u32 = 0x6;
pub const CLK_ADDRESS_MIRRORED_REPEAT: u32 = 0x8;

pub const CLK_FILTER_NEAREST: u32 = 0x10;
pub const CLK_FILTER_LINEAR: u32 = 0x20;

/// Device-side sampler word: normalized-coords | addressing-mode | filter-mode bits.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DevSampler(pub u32);

impl DevSampler {
    pub const SIZE_BYTES: usize = 4;

    pub const fn normalized_coords(self) -> bool {
        self.0 & 0x1 != 0
    }

    pub const fn addressing_bits(self) -> u32 {
        self.0 & 0xE
    }

    pub const fn filter_bits(self) -> u32 {
        self.0 & 0x30
    }
}

const _: () = assert!(core::mem::size_of::<WorkgroupContext>() == WorkgroupContext::SIZE_BYTES);
const _: () = assert!(core::mem::size_of::<DevImage>() == DevImage::SIZE_BYTES);
const _: () = assert!(core::mem::size_of::<DevSampler>() == DevSampler::SIZE_BYTES);
