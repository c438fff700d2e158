//! Device register access.
//!
//! All register traffic between the driver and a device's capability
//! regions goes through a [`Bus`], so the ordering rules of the transport
//! live in one place and a simulated device can stand in for hardware.

use core::ptr;

/// Access to memory-mapped device registers.
///
/// Addresses are the ones the device advertises through its PCI
/// capabilities. Implementations must perform each access exactly once
/// and in program order.
pub trait Bus: Clone {
    fn read8(&self, addr: u64) -> u8;
    fn read16(&self, addr: u64) -> u16;
    fn read32(&self, addr: u64) -> u32;

    fn write8(&self, addr: u64, value: u8);
    fn write16(&self, addr: u64, value: u16);
    fn write32(&self, addr: u64, value: u32);

    /// Read a 64-bit register as two 32-bit halves, low half first.
    fn read64(&self, addr: u64) -> u64 {
        let lo = self.read32(addr) as u64;
        let hi = self.read32(addr + 4) as u64;
        lo | (hi << 32)
    }

    /// Write a 64-bit register as two 32-bit halves, low half first.
    fn write64(&self, addr: u64, value: u64) {
        self.write32(addr, value as u32);
        self.write32(addr + 4, (value >> 32) as u32);
    }

    /// Translate a driver pointer into the address the device uses for DMA.
    ///
    /// The default assumes an identity mapping.
    fn dma_address(&self, vaddr: *const u8) -> u64 {
        vaddr as u64
    }
}

/// Volatile MMIO access for real hardware.
#[derive(Debug, Clone, Copy)]
pub struct MmioBus {
    _private: (),
}

impl MmioBus {
    /// Create an MMIO bus.
    ///
    /// # Safety
    ///
    /// Every address later passed to this bus must be mapped, device
    /// memory (or RAM) valid for volatile access at the requested width.
    pub unsafe fn new() -> Self {
        MmioBus { _private: () }
    }
}

impl Bus for MmioBus {
    fn read8(&self, addr: u64) -> u8 {
        // SAFETY: guaranteed by the contract of `MmioBus::new`.
        unsafe { ptr::read_volatile(addr as *const u8) }
    }

    fn read16(&self, addr: u64) -> u16 {
        // SAFETY: see `read8`.
        unsafe { ptr::read_volatile(addr as *const u16) }
    }

    fn read32(&self, addr: u64) -> u32 {
        // SAFETY: see `read8`.
        unsafe { ptr::read_volatile(addr as *const u32) }
    }

    fn write8(&self, addr: u64, value: u8) {
        // SAFETY: see `read8`.
        unsafe { ptr::write_volatile(addr as *mut u8, value) }
    }

    fn write16(&self, addr: u64, value: u16) {
        // SAFETY: see `read8`.
        unsafe { ptr::write_volatile(addr as *mut u16, value) }
    }

    fn write32(&self, addr: u64, value: u32) {
        // SAFETY: see `read8`.
        unsafe { ptr::write_volatile(addr as *mut u32, value) }
    }
}
