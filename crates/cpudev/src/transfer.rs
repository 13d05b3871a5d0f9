//! Linear and rectangular transfer primitives over resolved addresses.
//!
//! Nothing here knows about memory objects: callers resolve buffers to addresses first (device
//! memory of this driver already lives in the host address space). Rectangular variants walk a
//! 3-D region row by row; every row is one contiguous run of `region[0]` bytes.
//!
//! Overlapping source and destination regions are not supported by any copy in this module.
//! Rows are moved with a non-overlapping copy, so passing aliasing regions is undefined
//! behaviour and must be ruled out by the caller.

use std::ptr::{self, NonNull};

use bytemuck::Pod;

use crate::error::{DriverError, DriverResult};

/// Byte strides between consecutive rows and slices of a region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pitch {
    pub row: usize,
    pub slice: usize,
}

impl Pitch {
    pub const fn new(row: usize, slice: usize) -> Self {
        Self { row, slice }
    }

    /// Byte offset of `origin` (`x` in bytes, `y` in rows, `z` in slices).
    fn offset_of(&self, origin: [usize; 3]) -> usize {
        origin[0] + self.row * origin[1] + self.slice * origin[2]
    }
}

/// Checks that rows of `row_bytes` bytes fit their pitch and rows fit their slice pitch.
fn validate_pitch(
    side: &str,
    row_bytes: usize,
    region: [usize; 3],
    pitch: Pitch,
) -> DriverResult<()> {
    if region[1] > 1 && pitch.row < row_bytes {
        return Err(DriverError::InvalidRegion(format!(
            "{side} row pitch {} is smaller than the row width {row_bytes}",
            pitch.row
        )));
    }
    if region[2] > 1 && pitch.slice < pitch.row.saturating_mul(region[1]) {
        return Err(DriverError::InvalidRegion(format!(
            "{side} slice pitch {} is smaller than {} rows of pitch {}",
            pitch.slice, region[1], pitch.row
        )));
    }
    Ok(())
}

/// One past the last byte touched by a region, relative to the base address.
pub fn rect_extent(origin: [usize; 3], region: [usize; 3], pitch: Pitch) -> Option<usize> {
    if region.iter().any(|&d| d == 0) {
        return Some(0);
    }
    let last_row = pitch
        .row
        .checked_mul(origin[1].checked_add(region[1] - 1)?)?;
    let last_slice = pitch
        .slice
        .checked_mul(origin[2].checked_add(region[2] - 1)?)?;
    origin[0]
        .checked_add(region[0])?
        .checked_add(last_row)?
        .checked_add(last_slice)
}

/// Copies `len` bytes from `device_ptr + offset` into `host_ptr`.
///
/// When both base addresses are identical the host already observes device memory and the call
/// does nothing.
///
/// # Safety
/// `device_ptr + offset` must be readable and `host_ptr` writable for `len` bytes, and the two
/// ranges must not overlap.
pub unsafe fn read(host_ptr: *mut u8, device_ptr: *const u8, offset: usize, len: usize) {
    if host_ptr.cast_const() == device_ptr {
        return;
    }
    ptr::copy_nonoverlapping(device_ptr.add(offset), host_ptr, len);
}

/// Copies `len` bytes from `host_ptr` into `device_ptr + offset`.
///
/// # Safety
/// Mirror image of [`read`].
pub unsafe fn write(host_ptr: *const u8, device_ptr: *mut u8, offset: usize, len: usize) {
    if host_ptr == device_ptr.cast_const() {
        return;
    }
    ptr::copy_nonoverlapping(host_ptr, device_ptr.add(offset), len);
}

/// Copies `len` bytes between two device buffers.
///
/// Copying a buffer onto itself is a no-op regardless of the offsets.
///
/// # Safety
/// Both ranges must be valid for `len` bytes and must not overlap.
pub unsafe fn copy(
    src_ptr: *const u8,
    src_offset: usize,
    dst_ptr: *mut u8,
    dst_offset: usize,
    len: usize,
) {
    if src_ptr == dst_ptr.cast_const() {
        return;
    }
    ptr::copy_nonoverlapping(src_ptr.add(src_offset), dst_ptr.add(dst_offset), len);
}

/// Shared row walker of the rectangular copies. Both bases are already origin-adjusted.
unsafe fn copy_rows(
    src: *const u8,
    src_pitch: Pitch,
    dst: *mut u8,
    dst_pitch: Pitch,
    region: [usize; 3],
) {
    for k in 0..region[2] {
        for j in 0..region[1] {
            ptr::copy_nonoverlapping(
                src.add(src_pitch.row * j + src_pitch.slice * k),
                dst.add(dst_pitch.row * j + dst_pitch.slice * k),
                region[0],
            );
        }
    }
}

/// Copies a 3-D region between two buffers with independent pitches.
///
/// Origins and `region[0]` are in bytes; `region[1]` rows and `region[2]` slices.
///
/// # Safety
/// Every row of both regions must lie inside valid memory (see [`rect_extent`]) and the two
/// regions must not overlap.
pub unsafe fn copy_rect(
    src_ptr: *const u8,
    dst_ptr: *mut u8,
    src_origin: [usize; 3],
    dst_origin: [usize; 3],
    region: [usize; 3],
    src_pitch: Pitch,
    dst_pitch: Pitch,
) -> DriverResult<()> {
    validate_pitch("source", region[0], region, src_pitch)?;
    validate_pitch("destination", region[0], region, dst_pitch)?;
    let src = src_ptr.add(src_pitch.offset_of(src_origin));
    let dst = dst_ptr.add(dst_pitch.offset_of(dst_origin));
    copy_rows(src, src_pitch, dst, dst_pitch, region);
    Ok(())
}

/// Writes a host region into a device buffer.
///
/// # Safety
/// As for [`copy_rect`], with the host side as source.
pub unsafe fn write_rect(
    host_ptr: *const u8,
    device_ptr: *mut u8,
    buffer_origin: [usize; 3],
    host_origin: [usize; 3],
    region: [usize; 3],
    buffer_pitch: Pitch,
    host_pitch: Pitch,
) -> DriverResult<()> {
    copy_rect(
        host_ptr,
        device_ptr,
        host_origin,
        buffer_origin,
        region,
        host_pitch,
        buffer_pitch,
    )
}

/// Reads a device region into host memory.
///
/// # Safety
/// As for [`copy_rect`], with the device side as source.
pub unsafe fn read_rect(
    host_ptr: *mut u8,
    device_ptr: *const u8,
    buffer_origin: [usize; 3],
    host_origin: [usize; 3],
    region: [usize; 3],
    buffer_pitch: Pitch,
    host_pitch: Pitch,
) -> DriverResult<()> {
    copy_rect(
        device_ptr,
        host_ptr,
        buffer_origin,
        host_origin,
        region,
        buffer_pitch,
        host_pitch,
    )
}

/// Replicates one pixel over a 3-D region of an image buffer.
///
/// Unlike the copies, `origin[0]` and `region[0]` count pixels, not bytes; pitches are still
/// byte strides.
///
/// # Safety
/// The region must lie inside valid writable memory.
pub unsafe fn fill_rect(
    device_ptr: *mut u8,
    origin: [usize; 3],
    region: [usize; 3],
    pitch: Pitch,
    pixel: &[u8],
) -> DriverResult<()> {
    let pixel_size = pixel.len();
    if pixel_size == 0 {
        return Err(DriverError::InvalidRegion("empty fill pixel".to_string()));
    }
    let bytes = |pixels: usize| {
        pixels
            .checked_mul(pixel_size)
            .ok_or_else(|| DriverError::InvalidRegion("fill extent overflows".to_string()))
    };
    validate_pitch("image", bytes(region[0])?, region, pitch)?;

    let base = device_ptr.add(pitch.offset_of([bytes(origin[0])?, origin[1], origin[2]]));
    for k in 0..region[2] {
        for j in 0..region[1] {
            let row = base.add(pitch.row * j + pitch.slice * k);
            for i in 0..region[0] {
                ptr::copy_nonoverlapping(pixel.as_ptr(), row.add(pixel_size * i), pixel_size);
            }
        }
    }
    Ok(())
}

unsafe fn fill_words<T: Pod>(dst: *mut u8, count: usize, pattern: &[u8]) {
    let value: T = bytemuck::pod_read_unaligned(pattern);
    let dst = dst.cast::<T>();
    for i in 0..count {
        ptr::write_unaligned(dst.add(i), value);
    }
}

/// Patterns wider than a machine word are written as consecutive `u64` words.
unsafe fn fill_wide(dst: *mut u8, count: usize, pattern: &[u8]) {
    let mut words = [0u64; 16];
    let n = pattern.len() / 8;
    for (word, chunk) in words.iter_mut().zip(pattern.chunks_exact(8)) {
        *word = bytemuck::pod_read_unaligned(chunk);
    }
    let dst = dst.cast::<u64>();
    for i in 0..count {
        for (j, word) in words[..n].iter().enumerate() {
            ptr::write_unaligned(dst.add(i * n + j), *word);
        }
    }
}

/// Fills `count` repetitions of `pattern`, starting `offset` repetitions into `ptr`.
///
/// Supported pattern sizes are 1, 2, 4, 8, 16, 32, 64 and 128 bytes; exactly one fill strategy
/// runs per call.
///
/// # Safety
/// `ptr` must be writable for `(offset + count) * pattern.len()` bytes.
pub unsafe fn memfill(
    ptr: *mut u8,
    count: usize,
    offset: usize,
    pattern: &[u8],
) -> DriverResult<()> {
    let start = ptr.add(offset * pattern.len());
    match pattern.len() {
        1 => fill_words::<u8>(start, count, pattern),
        2 => fill_words::<u16>(start, count, pattern),
        4 => fill_words::<u32>(start, count, pattern),
        8 => fill_words::<u64>(start, count, pattern),
        16 | 32 | 64 | 128 => fill_wide(start, count, pattern),
        other => return Err(DriverError::UnsupportedPatternSize(other)),
    }
    Ok(())
}

/// Host address through which the caller may access `[offset, offset + size)` of a buffer.
///
/// Device memory is host memory, so nothing is copied: the caller's own pointer wins when one is
/// supplied, otherwise the buffer address itself is returned.
pub fn map_mem(
    buf_ptr: NonNull<u8>,
    offset: usize,
    _size: usize,
    host_ptr: Option<NonNull<u8>>,
) -> DriverResult<NonNull<u8>> {
    if let Some(host_ptr) = host_ptr {
        return Ok(host_ptr);
    }
    NonNull::new(buf_ptr.as_ptr().wrapping_add(offset)).ok_or_else(|| {
        DriverError::InvalidRegion(format!("mapping offset {offset} wraps to a null address"))
    })
}

/// Inverse of [`map_mem`]; there is nothing to write back.
pub fn unmap_mem(host_ptr: NonNull<u8>, _device_start: NonNull<u8>, _size: usize) -> NonNull<u8> {
    host_ptr
}
