//! Execution engine: argument marshaling and the work-group loop.
//!
//! Every launcher argument slot holds a pointer. For value arguments it points at the value's
//! storage; for buffers at the buffer's [`AddressCell`](crate::alloc::AddressCell); for local
//! memory, images and samplers at a dispatch-owned cell that holds the address of per-dispatch
//! scratch. Scratch is released when the marshaled argument set is dropped, on success and on
//! every error path.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cpudev_abi::WorkgroupContext;
use tracing::debug;

use crate::alloc::{alloc_mem_obj, AlignedBuf, MemoryObject};
use crate::device::DeviceDescriptor;
use crate::error::{DriverError, DriverResult};
use crate::image::{fill_dev_image, fill_dev_sampler};
use crate::kernel::{ArgKind, ArgValue, NativeCommand, RunCommand};
use crate::transfer;

/// Counters of per-dispatch scratch allocations made by one device.
#[derive(Debug, Default)]
pub struct ScratchStats {
    live: AtomicUsize,
    total: AtomicUsize,
}

impl ScratchStats {
    /// Scratch allocations currently outstanding.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Scratch allocations made since the device was created.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

struct Scratch {
    buf: AlignedBuf,
    stats: Arc<ScratchStats>,
}

impl Scratch {
    fn new(len: usize, align: usize, stats: &Arc<ScratchStats>) -> DriverResult<Self> {
        let buf = AlignedBuf::new(len, align)?;
        stats.live.fetch_add(1, Ordering::SeqCst);
        stats.total.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            buf,
            stats: stats.clone(),
        })
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.stats.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A dispatch-owned indirection cell holding a scratch address (or null).
#[repr(transparent)]
struct ScratchCell(*mut c_void);

/// Marshaled launcher arguments of one dispatch.
#[derive(Default)]
struct DispatchArgs {
    slots: Vec<*mut c_void>,
    cells: Vec<Box<ScratchCell>>,
    scratch: Vec<Scratch>,
    pinned: Vec<Arc<MemoryObject>>,
    scratch_bytes: usize,
}

impl DispatchArgs {
    fn push_cell(&mut self, addr: *mut c_void) {
        let mut cell = Box::new(ScratchCell(addr));
        // The box keeps the cell at a fixed address while `cells` grows.
        self.slots.push(ptr::addr_of_mut!(*cell).cast::<c_void>());
        self.cells.push(cell);
    }

    fn push_scratch(
        &mut self,
        len: usize,
        device: &DeviceDescriptor,
        stats: &Arc<ScratchStats>,
    ) -> DriverResult<*mut u8> {
        let scratch = Scratch::new(len, device.mem_align, stats)?;
        let addr = scratch.buf.as_ptr();
        self.scratch.push(scratch);
        self.scratch_bytes += len;
        self.push_cell(addr.cast());
        Ok(addr)
    }

    /// Stages `bytes` in fresh scratch and binds the scratch address to the next slot.
    fn push_staged(
        &mut self,
        bytes: &[u8],
        device: &DeviceDescriptor,
        stats: &Arc<ScratchStats>,
    ) -> DriverResult<()> {
        let staging = self.push_scratch(bytes.len(), device, stats)?;
        // SAFETY: `staging` was just allocated with room for `bytes.len()` bytes.
        unsafe { transfer::write(bytes.as_ptr(), staging, 0, bytes.len()) };
        Ok(())
    }
}

/// Summary of a completed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub groups: u64,
    pub scratch_allocations: usize,
    pub scratch_bytes: usize,
}

#[derive(Debug)]
pub struct ExecutionEngine {
    device: DeviceDescriptor,
    stats: Arc<ScratchStats>,
}

impl ExecutionEngine {
    pub fn new(device: DeviceDescriptor) -> Self {
        Self {
            device,
            stats: Arc::new(ScratchStats::default()),
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn scratch_stats(&self) -> &ScratchStats {
        &self.stats
    }

    /// Executes every work-group of `cmd` sequentially, z outermost and x innermost.
    ///
    /// The command must already carry a resolved entry point.
    pub fn run(&self, cmd: &RunCommand) -> DriverResult<DispatchSummary> {
        let kernel = &cmd.kernel;
        let entry = cmd
            .entry_point()
            .ok_or_else(|| DriverError::MissingEntryPoint {
                kernel: kernel.name().to_string(),
            })?;
        self.validate_grid(cmd)?;

        let mut args = self.marshal(cmd)?;
        let mut ctx = WorkgroupContext::new(
            cmd.work_dim,
            cmd.local_size.map(|n| n as u64),
            cmd.num_groups.map(|n| n as u64),
        );
        ctx.global_offset = cmd.global_offset.map(|n| n as u64);

        debug!(
            kernel = kernel.name(),
            dev_id = self.device.dev_id,
            num_groups = ?cmd.num_groups,
            local_size = ?cmd.local_size,
            buffers = args.pinned.len(),
            cells = args.cells.len(),
            "dispatch start"
        );

        let [nx, ny, nz] = cmd.num_groups;
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    ctx.group_id = [x as u64, y as u64, z as u64];
                    // SAFETY: `args` holds one slot per launcher argument (explicit arguments
                    // followed by autolocals), each pointing at storage that outlives the loop.
                    unsafe { entry.call(args.slots.as_mut_ptr(), &mut ctx) };
                }
            }
        }

        let summary = DispatchSummary {
            groups: ctx.group_count(),
            scratch_allocations: args.scratch.len(),
            scratch_bytes: args.scratch_bytes,
        };
        drop(args);
        debug!(
            kernel = kernel.name(),
            groups = summary.groups,
            scratch_bytes = summary.scratch_bytes,
            "dispatch finished"
        );
        Ok(summary)
    }

    /// Calls a native command's host function once with its argument blob.
    pub fn run_native(&self, cmd: &mut NativeCommand) {
        debug!(dev_id = self.device.dev_id, bytes = cmd.args.len(), "native command");
        // SAFETY: the blob was built for `func` by whoever enqueued the command.
        unsafe { (cmd.func)(cmd.args.as_mut_arg_ptr()) }
    }

    fn validate_grid(&self, cmd: &RunCommand) -> DriverResult<()> {
        if !(1..=3).contains(&cmd.work_dim) {
            return Err(DriverError::Precondition(format!(
                "work dimension {} out of range",
                cmd.work_dim
            )));
        }
        if cmd.local_size.contains(&0) {
            return Err(DriverError::Precondition(format!(
                "local size {:?} has an empty dimension",
                cmd.local_size
            )));
        }
        let group_size = cmd
            .local_size
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n));
        match group_size {
            Some(n) if n <= self.device.max_work_group_size => Ok(()),
            _ => Err(DriverError::Precondition(format!(
                "work-group {:?} exceeds the device maximum of {}",
                cmd.local_size, self.device.max_work_group_size
            ))),
        }
    }

    fn marshal(&self, cmd: &RunCommand) -> DriverResult<DispatchArgs> {
        let kernel = &cmd.kernel;
        if cmd.arguments.len() != kernel.num_args() {
            return Err(DriverError::Precondition(format!(
                "kernel `{}` takes {} arguments, command binds {}",
                kernel.name(),
                kernel.num_args(),
                cmd.arguments.len()
            )));
        }

        let mut args = DispatchArgs::default();
        for (index, (info, value)) in kernel.args().iter().zip(&cmd.arguments).enumerate() {
            match (info.kind, value) {
                (ArgKind::Value, ArgValue::Value(bytes)) => {
                    if bytes.len() < info.size {
                        return Err(DriverError::Precondition(format!(
                            "argument {index} (`{}`) expects {} bytes, got {}",
                            info.name,
                            info.size,
                            bytes.len()
                        )));
                    }
                    args.slots.push(bytes.as_arg_ptr());
                }
                (ArgKind::Pointer, ArgValue::Buffer(None)) => args.push_cell(ptr::null_mut()),
                (ArgKind::Pointer, ArgValue::Buffer(Some(mem))) => {
                    alloc_mem_obj(&self.device, mem)?;
                    let slot = mem.slot(self.device.dev_id).ok_or_else(|| {
                        DriverError::Precondition(format!("argument {index} has no device slot"))
                    })?;
                    args.slots.push(slot.cell().as_arg_ptr());
                    args.pinned.push(mem.clone());
                }
                (ArgKind::Local | ArgKind::Pointer, ArgValue::Local(size)) => {
                    args.push_scratch(*size, &self.device, &self.stats)?;
                }
                (ArgKind::Image, ArgValue::Image(mem)) => {
                    alloc_mem_obj(&self.device, mem)?;
                    let image = fill_dev_image(mem, self.device.dev_id)?;
                    args.push_staged(bytemuck::bytes_of(&image), &self.device, &self.stats)?;
                    args.pinned.push(mem.clone());
                }
                (ArgKind::Sampler, ArgValue::Sampler(desc)) => {
                    let sampler = fill_dev_sampler(desc);
                    args.push_staged(bytemuck::bytes_of(&sampler), &self.device, &self.stats)?;
                }
                (kind, value) => {
                    return Err(DriverError::Precondition(format!(
                        "argument {index} (`{}`) is declared {kind:?} but bound to {}",
                        info.name,
                        value_kind(value)
                    )));
                }
            }
        }

        for &size in kernel.autolocal_sizes() {
            args.push_scratch(size, &self.device, &self.stats)?;
        }
        Ok(args)
    }
}

fn value_kind(value: &ArgValue) -> &'static str {
    match value {
        ArgValue::Value(_) => "a value",
        ArgValue::Buffer(_) => "a buffer",
        ArgValue::Local(_) => "local memory",
        ArgValue::Image(_) => "an image",
        ArgValue::Sampler(_) => "a sampler",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use cpudev_abi::{DevImage, DevSampler, WorkgroupFn};

    use std::path::{Path, PathBuf};

    use super::*;
    use crate::alloc::MemFlags;
    use crate::cache::{CodeGenerator, KernelCache, LoadedModule, ModuleLoader};
    use crate::config::DriverConfig;
    use crate::device::GlobalMemoryDomain;
    use crate::image::{
        AddressingMode, ChannelOrder, ChannelType, FilterMode, ImageDesc, SamplerDesc,
    };
    use crate::kernel::{ArgBytes, ArgInfo, Kernel};

    /// Launcher-visible view of the last call, captured by the test launchers below.
    static SEEN: Mutex<Vec<u64>> = Mutex::new(Vec::new());

    /// `args[0]` is a `u32` value, `args[1]` a buffer cell; stores value + group id per group.
    unsafe extern "C" fn store_launcher(args: *mut *mut c_void, ctx: *mut WorkgroupContext) {
        let value = *(*args.add(0) as *const u32);
        let cell = *args.add(1) as *const *mut u32;
        let out = *cell;
        let g = (*ctx).group_id[0] as usize;
        *out.add(g) = value + g as u32;
    }

    /// Records image data pointer, image width and sampler word.
    unsafe extern "C" fn image_launcher(args: *mut *mut c_void, _ctx: *mut WorkgroupContext) {
        let image = *(*args.add(0) as *const *const DevImage);
        let sampler = *(*args.add(1) as *const *const DevSampler);
        let mut seen = SEEN.lock().unwrap();
        seen.clear();
        seen.extend([(*image).data, u64::from((*image).width), u64::from((*sampler).0)]);
    }

    struct Fixed(WorkgroupFn);

    impl LoadedModule for Fixed {
        fn path(&self) -> &Path {
            Path::new("fixed.so")
        }

        fn workgroup_fn(&self, _symbol: &str) -> Result<WorkgroupFn, String> {
            Ok(self.0)
        }
    }

    impl ModuleLoader for Fixed {
        fn load(&self, _path: &Path) -> Result<Arc<dyn LoadedModule>, String> {
            Ok(Arc::new(Fixed(self.0)))
        }
    }

    impl CodeGenerator for Fixed {
        fn generate(
            &self,
            build_dir: &Path,
            _kernel: &Kernel,
            _device: &DeviceDescriptor,
        ) -> DriverResult<PathBuf> {
            Ok(build_dir.join("fixed.so"))
        }
    }

    fn prepared(func: WorkgroupFn, mut cmd: RunCommand, dev: &DeviceDescriptor) -> RunCommand {
        let fixed = Arc::new(Fixed(func));
        let cache = KernelCache::new(fixed.clone(), fixed);
        let entry = cache
            .resolve(&cmd.build_dir, &cmd.kernel, None, dev)
            .unwrap();
        cmd.set_entry_point(entry);
        cmd
    }

    fn device() -> DeviceDescriptor {
        GlobalMemoryDomain::new().register(&DriverConfig::default(), None)
    }

    #[test]
    fn value_and_buffer_arguments_reach_the_launcher() {
        let dev = device();
        let engine = ExecutionEngine::new(dev.clone());
        let out = Arc::new(MemoryObject::new(16, MemFlags::READ_WRITE, 1));
        let kernel = Arc::new(Kernel::new(
            "store",
            vec![
                ArgInfo::new("v", ArgKind::Value, 4),
                ArgInfo::new("out", ArgKind::Pointer, 8),
            ],
        ));
        let cmd = RunCommand::new(
            kernel,
            vec![
                ArgValue::Value(ArgBytes::from_pod(40u32)),
                ArgValue::Buffer(Some(out.clone())),
            ],
            [1, 1, 1],
            [4, 1, 1],
            "/b",
        );
        let cmd = prepared(store_launcher, cmd, &dev);

        let summary = engine.run(&cmd).unwrap();
        assert_eq!(summary.groups, 4);

        let base = out.device_ptr(dev.dev_id).unwrap();
        let mut host = [0u32; 4];
        unsafe { transfer::read(host.as_mut_ptr().cast(), base.as_ptr(), 0, 16) };
        assert_eq!(host, [40, 41, 42, 43]);
    }

    #[test]
    fn images_and_samplers_are_staged_and_released() {
        let dev = device();
        let engine = ExecutionEngine::new(dev.clone());
        let desc = ImageDesc::new_2d(4, 4, ChannelOrder::R, ChannelType::Float);
        let img = Arc::new(
            MemoryObject::new(desc.slice_pitch as usize, MemFlags::READ_ONLY, 1).into_image(desc),
        );
        let kernel = Arc::new(Kernel::new(
            "sample",
            vec![
                ArgInfo::new("img", ArgKind::Image, 8),
                ArgInfo::new("smp", ArgKind::Sampler, 4),
            ],
        ));
        let cmd = RunCommand::new(
            kernel,
            vec![
                ArgValue::Image(img.clone()),
                ArgValue::Sampler(SamplerDesc {
                    normalized_coords: false,
                    addressing: AddressingMode::Clamp,
                    filter: FilterMode::Nearest,
                }),
            ],
            [1, 1, 1],
            [1, 1, 1],
            "/b",
        );
        let cmd = prepared(image_launcher, cmd, &dev);

        let summary = engine.run(&cmd).unwrap();
        assert_eq!(summary.scratch_allocations, 2);
        assert_eq!(engine.scratch_stats().live(), 0);
        assert_eq!(engine.scratch_stats().total(), 2);

        let data = img.device_ptr(dev.dev_id).unwrap().as_ptr() as u64;
        assert_eq!(*SEEN.lock().unwrap(), vec![data, 4, 0x4 | 0x10]);
    }

    #[test]
    fn unprepared_command_is_refused() {
        let dev = device();
        let engine = ExecutionEngine::new(dev);
        let cmd = RunCommand::new(
            Arc::new(Kernel::new("k", Vec::new())),
            Vec::new(),
            [1, 1, 1],
            [1, 1, 1],
            "/b",
        );
        assert!(matches!(
            engine.run(&cmd),
            Err(DriverError::MissingEntryPoint { .. })
        ));
    }

    #[test]
    fn mismatched_argument_is_rejected_without_leaking() {
        let dev = device();
        let engine = ExecutionEngine::new(dev.clone());
        let kernel = Arc::new(
            Kernel::new(
                "k",
                vec![
                    ArgInfo::new("tmp", ArgKind::Local, 0),
                    ArgInfo::new("smp", ArgKind::Sampler, 4),
                ],
            )
            .with_autolocals(vec![32]),
        );
        let cmd = RunCommand::new(
            kernel,
            vec![ArgValue::Local(64), ArgValue::Local(64)],
            [1, 1, 1],
            [1, 1, 1],
            "/b",
        );
        let cmd = prepared(store_launcher, cmd, &dev);

        let err = engine.run(&cmd).unwrap_err();
        assert!(matches!(err, DriverError::Precondition(_)), "{err}");
        assert_eq!(engine.scratch_stats().total(), 1);
        assert_eq!(engine.scratch_stats().live(), 0);
    }

    #[test]
    fn oversized_work_group_is_rejected() {
        let dev = device();
        let engine = ExecutionEngine::new(dev.clone());
        let cmd = RunCommand::new(
            Arc::new(Kernel::new("k", Vec::new())),
            Vec::new(),
            [dev.max_work_group_size + 1, 1, 1],
            [1, 1, 1],
            "/b",
        );
        let cmd = prepared(store_launcher, cmd, &dev);
        assert!(matches!(engine.run(&cmd), Err(DriverError::Precondition(_))));
    }
}
