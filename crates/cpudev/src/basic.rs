//! The basic host-CPU device: one instance per registered device, all of them aliasing the
//! process address space.

use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::alloc::{alloc_mem_obj, free_mem_obj, AlignedBuf, MemoryObject};
use crate::cache::KernelCache;
use crate::config::DriverConfig;
use crate::device::{self, DeviceDescriptor, GlobalMemoryDomain};
use crate::error::{DriverError, DriverResult};
use crate::exec::{DispatchSummary, ExecutionEngine, ScratchStats};
use crate::kernel::{Command, NativeCommand, RunCommand};
use crate::transfer::{self, Pitch};

#[derive(Debug)]
pub struct BasicDevice {
    cache: Arc<KernelCache>,
    engine: ExecutionEngine,
}

impl BasicDevice {
    /// Registers a new instance in `domain`. Every instance of a process should share `cache`.
    pub fn init(
        domain: &GlobalMemoryDomain,
        config: &DriverConfig,
        cache: Arc<KernelCache>,
        cpu: Option<&str>,
    ) -> Self {
        let descriptor = domain.register(config, cpu);
        Self {
            cache,
            engine: ExecutionEngine::new(descriptor),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        self.engine.device()
    }

    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    pub fn scratch_stats(&self) -> &ScratchStats {
        self.engine.scratch_stats()
    }

    pub fn timer_value_ns(&self) -> u64 {
        device::timer_value_ns()
    }

    pub fn alloc_mem_obj(&self, mem: &MemoryObject) -> DriverResult<NonNull<u8>> {
        alloc_mem_obj(self.descriptor(), mem)
    }

    pub fn free(&self, mem: &MemoryObject) {
        free_mem_obj(self.descriptor(), mem)
    }

    /// A standalone zeroed allocation with the device alignment.
    pub fn alloc_ptr(&self, size: usize) -> DriverResult<AlignedBuf> {
        AlignedBuf::new(size, self.descriptor().mem_align)
    }

    pub fn free_ptr(&self, buf: AlignedBuf) {
        drop(buf);
    }

    fn resolved(&self, mem: &MemoryObject) -> DriverResult<NonNull<u8>> {
        mem.device_ptr(self.descriptor().dev_id).ok_or_else(|| {
            DriverError::Precondition(format!(
                "memory object not resolved for device {}",
                self.descriptor().dev_id
            ))
        })
    }

    /// # Safety
    /// `host` must be writable for `len` bytes.
    pub unsafe fn read(
        &self,
        host: *mut u8,
        mem: &MemoryObject,
        offset: usize,
        len: usize,
    ) -> DriverResult<()> {
        check_span(mem, offset, len)?;
        transfer::read(host, self.resolved(mem)?.as_ptr(), offset, len);
        Ok(())
    }

    /// # Safety
    /// `host` must be readable for `len` bytes.
    pub unsafe fn write(
        &self,
        host: *const u8,
        mem: &MemoryObject,
        offset: usize,
        len: usize,
    ) -> DriverResult<()> {
        check_span(mem, offset, len)?;
        transfer::write(host, self.resolved(mem)?.as_ptr(), offset, len);
        Ok(())
    }

    /// Copies between two objects; overlapping ranges of one object are not supported.
    ///
    /// Copying an object onto itself does nothing, whatever the two offsets are.
    pub fn copy(
        &self,
        src: &MemoryObject,
        src_offset: usize,
        dst: &MemoryObject,
        dst_offset: usize,
        len: usize,
    ) -> DriverResult<()> {
        check_span(src, src_offset, len)?;
        check_span(dst, dst_offset, len)?;
        let (s, d) = (self.resolved(src)?, self.resolved(dst)?);
        // SAFETY: both spans were checked against their objects' resolved allocations.
        unsafe { transfer::copy(s.as_ptr(), src_offset, d.as_ptr(), dst_offset, len) };
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_rect(
        &self,
        src: &MemoryObject,
        dst: &MemoryObject,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
        src_pitch: Pitch,
        dst_pitch: Pitch,
    ) -> DriverResult<()> {
        check_rect(src, src_origin, region, src_pitch)?;
        check_rect(dst, dst_origin, region, dst_pitch)?;
        let (s, d) = (self.resolved(src)?, self.resolved(dst)?);
        // SAFETY: both extents were checked against their objects' resolved allocations.
        unsafe {
            transfer::copy_rect(
                s.as_ptr(),
                d.as_ptr(),
                src_origin,
                dst_origin,
                region,
                src_pitch,
                dst_pitch,
            )
        }
    }

    /// # Safety
    /// The host-side extent of the region must be readable.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn write_rect(
        &self,
        host: *const u8,
        mem: &MemoryObject,
        buffer_origin: [usize; 3],
        host_origin: [usize; 3],
        region: [usize; 3],
        buffer_pitch: Pitch,
        host_pitch: Pitch,
    ) -> DriverResult<()> {
        check_rect(mem, buffer_origin, region, buffer_pitch)?;
        transfer::write_rect(
            host,
            self.resolved(mem)?.as_ptr(),
            buffer_origin,
            host_origin,
            region,
            buffer_pitch,
            host_pitch,
        )
    }

    /// # Safety
    /// The host-side extent of the region must be writable.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn read_rect(
        &self,
        host: *mut u8,
        mem: &MemoryObject,
        buffer_origin: [usize; 3],
        host_origin: [usize; 3],
        region: [usize; 3],
        buffer_pitch: Pitch,
        host_pitch: Pitch,
    ) -> DriverResult<()> {
        check_rect(mem, buffer_origin, region, buffer_pitch)?;
        transfer::read_rect(
            host,
            self.resolved(mem)?.as_ptr(),
            buffer_origin,
            host_origin,
            region,
            buffer_pitch,
            host_pitch,
        )
    }

    /// Fills an image region with one pixel; `origin[0]` and `region[0]` count pixels.
    pub fn fill_rect(
        &self,
        mem: &MemoryObject,
        origin: [usize; 3],
        region: [usize; 3],
        pitch: Pitch,
        pixel: &[u8],
    ) -> DriverResult<()> {
        let px = pixel.len();
        let bytes = |pixels: usize| {
            pixels
                .checked_mul(px)
                .ok_or_else(|| DriverError::InvalidRegion("fill extent overflows".to_string()))
        };
        check_rect(
            mem,
            [bytes(origin[0])?, origin[1], origin[2]],
            [bytes(region[0])?, region[1], region[2]],
            pitch,
        )?;
        // SAFETY: the byte extent of the region was checked against the object.
        unsafe { transfer::fill_rect(self.resolved(mem)?.as_ptr(), origin, region, pitch, pixel) }
    }

    /// Writes `count` repetitions of `pattern` starting `offset` repetitions into `mem`.
    pub fn memfill(
        &self,
        mem: &MemoryObject,
        count: usize,
        offset: usize,
        pattern: &[u8],
    ) -> DriverResult<()> {
        let n = pattern.len();
        let span = |v: usize| {
            v.checked_mul(n)
                .ok_or_else(|| DriverError::InvalidRegion("fill range overflows".to_string()))
        };
        check_span(mem, span(offset)?, span(count)?)?;
        // SAFETY: the filled byte range was checked against the object.
        unsafe { transfer::memfill(self.resolved(mem)?.as_ptr(), count, offset, pattern) }
    }

    /// Host-visible address of `[offset, offset + size)` of `mem`.
    pub fn map_mem(
        &self,
        mem: &MemoryObject,
        offset: usize,
        size: usize,
    ) -> DriverResult<NonNull<u8>> {
        check_span(mem, offset, size)?;
        // Copied host contents are stale once the object resolves; only in-place storage maps.
        let host = mem
            .host_ptr()
            .filter(|_| mem.uses_host_storage())
            .and_then(|h| NonNull::new(h.as_ptr().wrapping_add(offset)));
        transfer::map_mem(self.resolved(mem)?, offset, size, host)
    }

    pub fn unmap_mem(
        &self,
        mem: &MemoryObject,
        mapped: NonNull<u8>,
        size: usize,
    ) -> DriverResult<NonNull<u8>> {
        Ok(transfer::unmap_mem(mapped, self.resolved(mem)?, size))
    }

    /// Resolves the entry point of NDRange commands; native commands need nothing.
    pub fn compile_submitted_kernels(&self, cmd: &mut Command) -> DriverResult<()> {
        match cmd {
            Command::NdRange(run) => self.prepare(run),
            Command::Native(_) => Ok(()),
        }
    }

    /// Resolves the entry point of `cmd` from the precompiled module at `binary`.
    pub fn load_binary(&self, binary: &Path, cmd: &mut RunCommand) -> DriverResult<()> {
        cmd.precompiled = Some(binary.to_path_buf());
        self.prepare(cmd)
    }

    fn prepare(&self, cmd: &mut RunCommand) -> DriverResult<()> {
        let entry = self.cache.resolve(
            &cmd.build_dir,
            &cmd.kernel,
            cmd.precompiled.as_deref(),
            self.descriptor(),
        )?;
        cmd.set_entry_point(entry);
        Ok(())
    }

    /// Runs an NDRange command to completion, resolving its entry point first if needed.
    pub fn run(&self, cmd: &mut RunCommand) -> DriverResult<DispatchSummary> {
        if cmd.entry_point().is_none() {
            self.prepare(cmd)?;
        }
        self.engine.run(cmd).inspect_err(|err| {
            if err.is_fatal() {
                warn!(kernel = cmd.kernel.name(), %err, "dispatch failed");
            }
        })
    }

    pub fn run_native(&self, cmd: &mut NativeCommand) {
        self.engine.run_native(cmd)
    }

    pub fn uninit(self) {
        let stats = self.engine.scratch_stats();
        if stats.live() != 0 {
            warn!(
                dev_id = self.descriptor().dev_id,
                live = stats.live(),
                "device released with outstanding scratch"
            );
        }
        debug!(dev_id = self.descriptor().dev_id, "device instance released");
    }
}

fn check_span(mem: &MemoryObject, offset: usize, len: usize) -> DriverResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= mem.size() => Ok(()),
        _ => Err(DriverError::InvalidRegion(format!(
            "range {offset}+{len} exceeds memory object of {} bytes",
            mem.size()
        ))),
    }
}

fn check_rect(
    mem: &MemoryObject,
    origin: [usize; 3],
    region: [usize; 3],
    pitch: Pitch,
) -> DriverResult<()> {
    match transfer::rect_extent(origin, region, pitch) {
        Some(end) if end <= mem.size() => Ok(()),
        _ => Err(DriverError::InvalidRegion(format!(
            "region {region:?} at {origin:?} exceeds memory object of {} bytes",
            mem.size()
        ))),
    }
}
