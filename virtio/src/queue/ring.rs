//! Shared ring memory.
//!
//! The descriptor table and both rings live in memory the device reads
//! and writes concurrently. Nothing here hands out references into that
//! memory: every field is accessed through a volatile or atomic accessor,
//! and the two index fields carry the barriers the ring protocol needs.
//!
//! Layouts (little-endian, as on the wire):
//!
//! ```text
//! desc[i]  @ 16*i   : addr u64 | len u32 | flags u16 | next u16
//! avail    @ 0      : flags u16 | idx u16 | ring [u16; N] | used_event u16
//! used     @ 0      : flags u16 | idx u16 | ring [{id u32, len u32}; N] | avail_event u16
//! ```

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::{self, NonNull};
use core::sync::atomic::{fence, AtomicU16, Ordering};

use bitflags::bitflags;

use super::{ring_slot, Descriptor};
use crate::config;
use crate::error::{Result, VirtioError};

bitflags! {
    /// Available ring flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AvailFlags: u16 {
        /// Driver does not want an interrupt for consumed buffers.
        const NO_INTERRUPT = 1;
    }
}

bitflags! {
    /// Used ring flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsedFlags: u16 {
        /// Device does not want to be notified of new buffers.
        const NO_NOTIFY = 1;
    }
}

/// Used ring element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsedElem {
    /// Head of the completed descriptor chain.
    pub id: u32,
    /// Bytes the device wrote into the chain's writable buffers.
    pub len: u32,
}

/// Zeroed, aligned allocation shared with the device.
#[derive(Debug)]
pub(crate) struct DmaRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is plain memory owned by exactly one queue.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    pub(crate) fn zeroed(size: usize, align: usize) -> Result<Self> {
        let layout =
            Layout::from_size_align(size, align).map_err(|_| VirtioError::DmaAllocation { size })?;
        // SAFETY: `size` is never zero for ring structures.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(VirtioError::DmaAllocation { size })?;
        Ok(DmaRegion { ptr, layout })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Descriptor table: `size` entries of 16 bytes, 16-byte aligned.
#[derive(Debug)]
pub(crate) struct DescriptorTable {
    region: DmaRegion,
    size: u16,
}

impl DescriptorTable {
    const ENTRY: usize = 16;

    pub(crate) fn new(size: u16) -> Result<Self> {
        let region = DmaRegion::zeroed(Self::ENTRY * size as usize, config::DESC_TABLE_ALIGN)?;
        Ok(DescriptorTable { region, size })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.region.as_ptr()
    }

    pub(crate) fn write(&self, index: u16, desc: &Descriptor) {
        assert!(index < self.size, "descriptor {} out of range", index);
        // SAFETY: in bounds; fields are naturally aligned within the entry.
        unsafe {
            let entry = self.region.as_ptr().add(Self::ENTRY * index as usize);
            ptr::write_volatile(entry as *mut u64, desc.addr.to_le());
            ptr::write_volatile(entry.add(8) as *mut u32, desc.len.to_le());
            ptr::write_volatile(entry.add(12) as *mut u16, desc.flags.bits().to_le());
            ptr::write_volatile(entry.add(14) as *mut u16, desc.next.to_le());
        }
    }

    /// Read an entry back from shared memory.
    #[cfg(test)]
    fn read(&self, index: u16) -> Descriptor {
        assert!(index < self.size, "descriptor {} out of range", index);
        // SAFETY: see `write`.
        unsafe {
            let entry = self.region.as_ptr().add(Self::ENTRY * index as usize);
            Descriptor {
                addr: u64::from_le(ptr::read_volatile(entry as *const u64)),
                len: u32::from_le(ptr::read_volatile(entry.add(8) as *const u32)),
                flags: super::DescFlags::from_bits_retain(u16::from_le(ptr::read_volatile(
                    entry.add(12) as *const u16,
                ))),
                next: u16::from_le(ptr::read_volatile(entry.add(14) as *const u16)),
            }
        }
    }
}

/// Driver-written available ring.
#[derive(Debug)]
pub(crate) struct AvailRing {
    region: DmaRegion,
    size: u16,
}

impl AvailRing {
    pub(crate) fn new(size: u16) -> Result<Self> {
        let region = DmaRegion::zeroed(6 + 2 * size as usize, config::AVAIL_RING_ALIGN)?;
        Ok(AvailRing { region, size })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.region.as_ptr()
    }

    fn field(&self, offset: usize) -> *mut u16 {
        debug_assert!(offset + 2 <= self.region.len());
        // SAFETY: callers stay inside the ring layout.
        unsafe { self.region.as_ptr().add(offset) as *mut u16 }
    }

    pub(crate) fn flags(&self) -> AvailFlags {
        // SAFETY: offset 0 is inside the region.
        AvailFlags::from_bits_retain(u16::from_le(unsafe { ptr::read_volatile(self.field(0)) }))
    }

    pub(crate) fn set_flags(&self, flags: AvailFlags) {
        // SAFETY: offset 0 is inside the region.
        unsafe { ptr::write_volatile(self.field(0), flags.bits().to_le()) }
        fence(Ordering::SeqCst);
    }

    /// Place a chain head at ring position `idx & (size - 1)`.
    pub(crate) fn set_entry(&self, idx: u16, head: u16) {
        let slot = ring_slot(idx, self.size) as usize;
        // SAFETY: slot < size, so the entry lies before `used_event`.
        unsafe { ptr::write_volatile(self.field(4 + 2 * slot), head.to_le()) }
    }

    /// Expose every entry written before this call by storing `idx`.
    ///
    /// The fence orders all descriptor and ring-entry writes before the
    /// index store; the device may start consuming as soon as it sees it.
    pub(crate) fn publish(&self, idx: u16) {
        fence(Ordering::SeqCst);
        self.idx_cell().store(idx.to_le(), Ordering::Release);
    }

    pub(crate) fn idx(&self) -> u16 {
        u16::from_le(self.idx_cell().load(Ordering::Acquire))
    }

    pub(crate) fn set_used_event(&self, idx: u16) {
        let offset = 4 + 2 * self.size as usize;
        // SAFETY: `used_event` is the last field of the region.
        unsafe { ptr::write_volatile(self.field(offset), idx.to_le()) }
        fence(Ordering::SeqCst);
    }

    fn idx_cell(&self) -> &AtomicU16 {
        // SAFETY: offset 2 is 2-byte aligned and lives as long as `self`.
        unsafe { &*(self.field(2) as *const AtomicU16) }
    }
}

/// Device-written used ring.
#[derive(Debug)]
pub(crate) struct UsedRing {
    region: DmaRegion,
    size: u16,
}

impl UsedRing {
    pub(crate) fn new(size: u16) -> Result<Self> {
        let region = DmaRegion::zeroed(6 + 8 * size as usize, config::USED_RING_ALIGN)?;
        Ok(UsedRing { region, size })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.region.as_ptr()
    }

    pub(crate) fn flags(&self) -> UsedFlags {
        // SAFETY: offset 0 is inside the region.
        let raw = unsafe { ptr::read_volatile(self.region.as_ptr() as *const u16) };
        UsedFlags::from_bits_retain(u16::from_le(raw))
    }

    /// Device's producer index. Entries below it are fully written.
    pub(crate) fn idx(&self) -> u16 {
        // SAFETY: offset 2 is 2-byte aligned and lives as long as `self`.
        let cell = unsafe { &*(self.region.as_ptr().add(2) as *const AtomicU16) };
        u16::from_le(cell.load(Ordering::Acquire))
    }

    /// Element at ring position `idx & (size - 1)`.
    ///
    /// Only meaningful for positions the caller has seen covered by
    /// [`idx`](Self::idx); that load's acquire orders this read after it.
    pub(crate) fn elem(&self, idx: u16) -> UsedElem {
        let slot = ring_slot(idx, self.size) as usize;
        // SAFETY: slot < size; entries are 4-byte aligned.
        unsafe {
            let entry = self.region.as_ptr().add(4 + 8 * slot);
            UsedElem {
                id: u32::from_le(ptr::read_volatile(entry as *const u32)),
                len: u32::from_le(ptr::read_volatile(entry.add(4) as *const u32)),
            }
        }
    }

    pub(crate) fn avail_event(&self) -> u16 {
        let offset = 4 + 8 * self.size as usize;
        // SAFETY: `avail_event` is the last field of the region.
        let raw = unsafe { ptr::read_volatile(self.region.as_ptr().add(offset) as *const u16) };
        u16::from_le(raw)
    }
}
