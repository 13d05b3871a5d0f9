//! Backing storage for memory objects and the per-device address table.
//!
//! Every memory object carries one [`DeviceSlot`] per driver instance. Instances that alias the
//! same host address space resolve through the canonical slot (`slots[global_mem_id]`), so a
//! buffer is allocated (and its initial contents copied) exactly once per space, and every
//! instance of that space observes the same address.

use std::alloc::Layout;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::device::{DeviceDescriptor, DeviceId, GlobalMemId};
use crate::error::{DriverError, DriverResult};
use crate::image::ImageDesc;

bitflags! {
    /// Allocation flags of a memory object (numerically identical to the `CL_MEM_*` values).
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MemFlags: u64 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        /// The caller's host storage *is* the buffer; the driver never allocates or frees it.
        const USE_HOST_PTR = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        /// Copy the caller's host contents into the backing store right after allocating it.
        const COPY_HOST_PTR = 1 << 5;
    }
}

/// Zero-initialised heap allocation with a caller-chosen alignment.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: `AlignedBuf` uniquely owns its allocation; the raw pointer is never shared with
// another owner.
unsafe impl Send for AlignedBuf {}
// SAFETY: shared access only hands out the address; mutation goes through `&mut self` or
// through raw pointers whose synchronisation is the caller's responsibility.
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocates `len` zeroed bytes aligned to `align`.
    ///
    /// Zero-length requests still receive a unique, dereferenceable byte so the address can be
    /// handed to generated code.
    pub fn new(len: usize, align: usize) -> DriverResult<Self> {
        let oom = DriverError::OutOfMemory { size: len, align };
        let layout = Layout::from_size_align(len.max(1), align).map_err(|_| oom)?;
        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(DriverError::OutOfMemory { size: len, align })?;
        Ok(Self { ptr, layout, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is at least `len` bytes and zero-initialised.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees unique access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_zeroed` with exactly `layout`.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

/// The resolved-address cell of one device instance.
///
/// Generated kernels receive a pointer to this cell (not the address itself) for every buffer
/// argument and load the current address through it at call time.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct AddressCell(AtomicPtr<u8>);

impl AddressCell {
    pub fn load(&self) -> *mut u8 {
        self.0.load(Ordering::Acquire)
    }

    fn store(&self, ptr: *mut u8) {
        self.0.store(ptr, Ordering::Release);
    }

    /// Address of the cell itself, in the form a kernel argument slot expects.
    pub fn as_arg_ptr(&self) -> *mut c_void {
        self as *const AddressCell as *mut c_void
    }
}

const NO_SPACE: usize = usize::MAX;

/// Per-device entry of a memory object's address table.
#[derive(Debug)]
pub struct DeviceSlot {
    addr: AddressCell,
    global_mem_id: AtomicUsize,
}

impl Default for DeviceSlot {
    fn default() -> Self {
        Self {
            addr: AddressCell::default(),
            global_mem_id: AtomicUsize::new(NO_SPACE),
        }
    }
}

impl DeviceSlot {
    pub fn cell(&self) -> &AddressCell {
        &self.addr
    }

    pub fn global_mem_id(&self) -> Option<GlobalMemId> {
        match self.global_mem_id.load(Ordering::Acquire) {
            NO_SPACE => None,
            id => Some(id),
        }
    }

    fn set(&self, ptr: *mut u8, space: usize) {
        self.global_mem_id.store(space, Ordering::Release);
        self.addr.store(ptr);
    }
}

#[derive(Debug)]
struct Backing {
    global_mem_id: GlobalMemId,
    buf: AlignedBuf,
}

/// A logical device buffer (or image) and its per-device resolved addresses.
pub struct MemoryObject {
    size: usize,
    flags: MemFlags,
    host_ptr: Option<NonNull<u8>>,
    image: Option<ImageDesc>,
    slots: Box<[DeviceSlot]>,
    backing: Mutex<Vec<Backing>>,
    allocations: AtomicUsize,
}

// SAFETY: `host_ptr` is only dereferenced under the contract of `with_host_ptr`; the slot table
// is atomic and the backing list is mutex-protected.
unsafe impl Send for MemoryObject {}
// SAFETY: see above.
unsafe impl Sync for MemoryObject {}

impl MemoryObject {
    /// A buffer of `size` bytes with no caller-supplied host storage and `device_slots` address
    /// slots (one per registered device instance).
    pub fn new(size: usize, flags: MemFlags, device_slots: usize) -> Self {
        Self {
            size,
            flags,
            host_ptr: None,
            image: None,
            slots: (0..device_slots).map(|_| DeviceSlot::default()).collect(),
            backing: Mutex::new(Vec::new()),
            allocations: AtomicUsize::new(0),
        }
    }

    /// A buffer that references caller-supplied host storage (`USE_HOST_PTR` or
    /// `COPY_HOST_PTR`).
    ///
    /// # Safety
    /// With `USE_HOST_PTR`, `host_ptr` must be valid for reads and writes of `size` bytes for the
    /// whole lifetime of the returned object. With `COPY_HOST_PTR` it only has to be readable for
    /// `size` bytes until the object is first resolved by `alloc_mem_obj`.
    pub unsafe fn with_host_ptr(
        size: usize,
        flags: MemFlags,
        host_ptr: NonNull<u8>,
        device_slots: usize,
    ) -> Self {
        Self {
            host_ptr: Some(host_ptr),
            ..Self::new(size, flags, device_slots)
        }
    }

    /// Attaches image geometry; the object is then marshaled as an image argument.
    pub fn into_image(mut self, image: ImageDesc) -> Self {
        self.image = Some(image);
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    pub fn host_ptr(&self) -> Option<NonNull<u8>> {
        self.host_ptr
    }

    pub fn image(&self) -> Option<&ImageDesc> {
        self.image.as_ref()
    }

    pub fn uses_host_storage(&self) -> bool {
        self.flags.contains(MemFlags::USE_HOST_PTR)
    }

    pub fn slot(&self, dev_id: DeviceId) -> Option<&DeviceSlot> {
        self.slots.get(dev_id)
    }

    /// Current resolved address for `dev_id`, if it has been resolved.
    pub fn device_ptr(&self, dev_id: DeviceId) -> Option<NonNull<u8>> {
        self.slot(dev_id).and_then(|s| NonNull::new(s.cell().load()))
    }

    /// Number of backing allocations ever made for this object.
    pub fn backing_allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    fn slot_or_err(&self, index: usize, what: &str) -> DriverResult<&DeviceSlot> {
        self.slots.get(index).ok_or_else(|| {
            DriverError::Precondition(format!(
                "{what} {index} has no slot in a memory object with {} slots",
                self.slots.len()
            ))
        })
    }
}

impl std::fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObject")
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("host_ptr", &self.host_ptr)
            .field("image", &self.image)
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// Resolves `mem` for `device`, allocating its backing store on first use in the device's
/// address space, and returns the resolved address.
pub fn alloc_mem_obj(device: &DeviceDescriptor, mem: &MemoryObject) -> DriverResult<NonNull<u8>> {
    let own = mem.slot_or_err(device.dev_id, "device")?;
    let canonical = mem.slot_or_err(device.global_mem_id, "global memory space")?;

    let mut backing = mem.backing.lock().unwrap_or_else(PoisonError::into_inner);

    if canonical.cell().load().is_null() {
        let copy_src = if mem.flags.contains(MemFlags::COPY_HOST_PTR) {
            Some(mem.host_ptr.ok_or_else(|| {
                DriverError::Precondition(
                    "COPY_HOST_PTR memory object has no host pointer".to_string(),
                )
            })?)
        } else {
            None
        };

        let addr = if mem.uses_host_storage() {
            mem.host_ptr.ok_or_else(|| {
                DriverError::Precondition(
                    "USE_HOST_PTR memory object has no host pointer".to_string(),
                )
            })?
        } else {
            let buf = AlignedBuf::new(mem.size, device.mem_align)?;
            let addr = buf.as_non_null();
            backing.push(Backing {
                global_mem_id: device.global_mem_id,
                buf,
            });
            mem.allocations.fetch_add(1, Ordering::Relaxed);
            addr
        };

        if let Some(src) = copy_src {
            if src != addr {
                // SAFETY: `src` is valid for `size` bytes per `with_host_ptr`, and `addr` is a
                // fresh allocation of `size` bytes that nothing else references yet.
                unsafe { ptr::copy_nonoverlapping(src.as_ptr(), addr.as_ptr(), mem.size) };
            }
        }

        canonical.set(addr.as_ptr(), device.global_mem_id);
        debug!(
            size = mem.size,
            global_mem_id = device.global_mem_id,
            host_storage = mem.uses_host_storage(),
            "resolved memory object backing store"
        );
    }

    let addr = canonical.cell().load();
    own.set(addr, device.global_mem_id);
    drop(backing);

    NonNull::new(addr).ok_or_else(|| {
        DriverError::Precondition("memory object resolved to a null address".to_string())
    })
}

/// Releases the backing store `device` resolved for `mem`.
///
/// Objects using caller-supplied host storage are never released here. Every slot that aliased
/// the released allocation is cleared, so releasing from several instances of one space is
/// idempotent.
pub fn free_mem_obj(device: &DeviceDescriptor, mem: &MemoryObject) {
    if mem.uses_host_storage() {
        return;
    }
    let Some(own) = mem.slot(device.dev_id) else {
        warn!(dev_id = device.dev_id, "free of memory object without a slot for this device");
        return;
    };

    let mut backing = mem.backing.lock().unwrap_or_else(PoisonError::into_inner);
    let addr = own.cell().load();
    if addr.is_null() {
        return;
    }
    let space = own.global_mem_id().unwrap_or(device.global_mem_id);

    for slot in mem.slots.iter() {
        if slot.cell().load() == addr {
            slot.set(ptr::null_mut(), NO_SPACE);
        }
    }
    let before = backing.len();
    backing.retain(|b| !(b.global_mem_id == space && b.buf.as_ptr() == addr));
    debug!(
        size = mem.size,
        global_mem_id = space,
        released = before - backing.len(),
        "released memory object backing store"
    );
}
