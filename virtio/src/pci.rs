//! PCI configuration space access for VirtIO devices.
//!
//! Bus enumeration happens elsewhere; this module only reads what a VirtIO
//! driver needs from one device's configuration space: its identity, its
//! BARs, and the vendor-specific capabilities that locate the VirtIO
//! register regions.
//!
//! # Capability Layout
//!
//! Each VirtIO capability (`virtio_pci_cap`) is laid out as:
//!
//! | offset | field |
//! |---|---|
//! | 0 | `cap_vndr` (0x09) |
//! | 1 | `cap_next` |
//! | 2 | `cap_len` |
//! | 3 | `cfg_type` |
//! | 4 | `bar` |
//! | 8 | `offset` (32-bit) |
//! | 12 | `length` (32-bit) |
//! | 16 | `notify_off_multiplier` or `offset_hi` |
//!
//! # References
//!
//! - PCI Local Bus Specification 3.0
//! - VirtIO Specification 1.2, section 4.1.4

use core::fmt;

use log::warn;

use crate::config;

/// Configuration space register offsets (type 0 header).
pub mod regs {
    pub const VENDOR_ID: u8 = 0x00;
    pub const DEVICE_ID: u8 = 0x02;
    pub const COMMAND: u8 = 0x04;
    pub const STATUS: u8 = 0x06;
    pub const REVISION_ID: u8 = 0x08;
    pub const BAR0: u8 = 0x10;
    pub const SUBSYSTEM_ID: u8 = 0x2E;
    pub const CAPABILITIES_PTR: u8 = 0x34;
}

/// Status register: capability list present.
pub const STATUS_CAP_LIST: u16 = 0x10;

/// Command register: memory space enable.
pub const COMMAND_MEMORY: u16 = 0x02;
/// Command register: bus master enable.
pub const COMMAND_BUS_MASTER: u16 = 0x04;

/// Capability ID of vendor-specific capabilities.
pub const CAP_ID_VENDOR: u8 = 0x09;

/// Length of the basic `virtio_pci_cap`.
pub const CAP_LEN: u8 = 16;

/// Highest BAR index a capability may name. Other values are reserved.
pub const MAX_BAR: u8 = 5;

/// Length of `virtio_pci_notify_cap`; longer capabilities carry a
/// 64-bit offset.
pub const NOTIFY_CAP_LEN: u8 = 20;

/// Size of the conventional configuration space.
const CONFIG_SPACE_LEN: usize = 256;

/// Upper bound on capability list entries in a 256-byte config space.
const MAX_CAPABILITIES: usize = 48;

/// PCI device address (Bus:Device:Function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// Create a new PCI address.
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        debug_assert!(device < 32, "Device must be 0-31");
        debug_assert!(function < 8, "Function must be 0-7");
        Self { bus, device, function }
    }

    /// Convert to configuration address for I/O port access.
    pub fn to_config_address(&self, offset: u8) -> u32 {
        debug_assert!(offset & 0x3 == 0, "Offset must be 4-byte aligned");

        (1 << 31) // Enable bit
            | ((self.bus as u32) << 16)
            | ((self.device as u32) << 11)
            | ((self.function as u32) << 8)
            | (offset as u32)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Access to one device's PCI configuration space.
///
/// Only the 32-bit accessors are required; narrower accesses are derived
/// from them the way configuration mechanism #1 works.
pub trait PciConfigSpace {
    /// Address of the device whose configuration space this is.
    fn address(&self) -> PciAddress;

    /// Read a 32-bit value at a dword-aligned offset.
    fn read32(&self, offset: u8) -> u32;

    /// Write a 32-bit value at a dword-aligned offset.
    fn write32(&self, offset: u8, value: u32);

    fn read16(&self, offset: u8) -> u16 {
        let value = self.read32(offset & !0x3);
        ((value >> ((offset & 0x2) * 8)) & 0xFFFF) as u16
    }

    fn read8(&self, offset: u8) -> u8 {
        let value = self.read32(offset & !0x3);
        ((value >> ((offset & 0x3) * 8)) & 0xFF) as u8
    }

    fn write16(&self, offset: u8, value: u16) {
        let aligned_offset = offset & !0x3;
        let shift = (offset & 0x2) * 8;

        let mut current = self.read32(aligned_offset);
        current &= !(0xFFFF << shift);
        current |= (value as u32) << shift;

        self.write32(aligned_offset, current);
    }
}

/// VirtIO device types, keyed by modern device ID (`0x1040 + type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioDeviceType {
    Network,
    Block,
    Console,
    Entropy,
    Filesystem,
    Pmem,
    Unknown(u16),
}

impl VirtioDeviceType {
    /// Classify a modern device ID.
    pub fn from_device_id(device_id: u16) -> Self {
        match device_id.wrapping_sub(config::MODERN_DEVICE_ID_FIRST) {
            1 => VirtioDeviceType::Network,
            2 => VirtioDeviceType::Block,
            3 => VirtioDeviceType::Console,
            4 => VirtioDeviceType::Entropy,
            26 => VirtioDeviceType::Filesystem,
            27 => VirtioDeviceType::Pmem,
            _ => VirtioDeviceType::Unknown(device_id),
        }
    }
}

impl fmt::Display for VirtioDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtioDeviceType::Network => write!(f, "Network"),
            VirtioDeviceType::Block => write!(f, "Block"),
            VirtioDeviceType::Console => write!(f, "Console"),
            VirtioDeviceType::Entropy => write!(f, "Entropy"),
            VirtioDeviceType::Filesystem => write!(f, "Filesystem"),
            VirtioDeviceType::Pmem => write!(f, "Pmem"),
            VirtioDeviceType::Unknown(id) => write!(f, "Unknown({:#x})", id),
        }
    }
}

/// Identity of a device as read from its configuration space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDevice {
    /// Bus:Device:Function address.
    pub address: PciAddress,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Revision ID.
    pub revision: u8,
    /// Subsystem ID.
    pub subsystem_id: u16,
}

impl PciDevice {
    /// Read the identity registers. Returns `None` when no device responds.
    pub fn read<C: PciConfigSpace + ?Sized>(config: &C) -> Option<Self> {
        let vendor_id = config.read16(regs::VENDOR_ID);
        if vendor_id == 0xFFFF {
            return None;
        }

        Some(PciDevice {
            address: config.address(),
            vendor_id,
            device_id: config.read16(regs::DEVICE_ID),
            revision: config.read8(regs::REVISION_ID),
            subsystem_id: config.read16(regs::SUBSYSTEM_ID),
        })
    }

    /// Check if this is a VirtIO device.
    pub fn is_virtio(&self) -> bool {
        self.vendor_id == config::VIRTIO_VENDOR_ID
    }

    /// Transitional devices expose the legacy register layout.
    pub fn is_legacy_id(&self) -> bool {
        (config::LEGACY_DEVICE_ID_FIRST..=config::LEGACY_DEVICE_ID_LAST).contains(&self.device_id)
    }

    pub fn is_modern_id(&self) -> bool {
        (config::MODERN_DEVICE_ID_FIRST..=config::MODERN_DEVICE_ID_LAST).contains(&self.device_id)
    }

    /// Get VirtIO device type if this is a modern VirtIO device.
    pub fn virtio_device_type(&self) -> Option<VirtioDeviceType> {
        if !self.is_virtio() || !self.is_modern_id() {
            return None;
        }
        Some(VirtioDeviceType::from_device_id(self.device_id))
    }
}

impl fmt::Display for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:04x}:{:04x} rev={}",
            self.address, self.vendor_id, self.device_id, self.revision
        )
    }
}

/// VirtIO capability structure types (`cfg_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapType {
    Common,
    Notify,
    Isr,
    Device,
    PciConfig,
    Other(u8),
}

impl From<u8> for CapType {
    fn from(value: u8) -> Self {
        match value {
            1 => CapType::Common,
            2 => CapType::Notify,
            3 => CapType::Isr,
            4 => CapType::Device,
            5 => CapType::PciConfig,
            other => CapType::Other(other),
        }
    }
}

/// A decoded vendor-specific VirtIO capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioCap {
    /// Offset of the capability in configuration space.
    pub position: u8,
    pub cfg_type: CapType,
    pub bar: u8,
    /// Offset within the BAR, including `offset_hi` for long capabilities.
    pub offset: u64,
    pub length: u32,
    /// Capability length as reported by the device.
    pub cap_len: u8,
}

impl VirtioCap {
    /// Decode the capability at `position`.
    ///
    /// Returns `None` when the capability names a reserved BAR or would
    /// extend past the end of configuration space.
    pub fn read<C: PciConfigSpace + ?Sized>(config: &C, position: u8) -> Option<Self> {
        let header = config.read32(position);
        let cap_len = ((header >> 16) & 0xFF) as u8;
        let cfg_type = CapType::from((header >> 24) as u8);

        let span = if cap_len > NOTIFY_CAP_LEN || cfg_type == CapType::Notify {
            NOTIFY_CAP_LEN
        } else {
            CAP_LEN
        };
        if cap_len < CAP_LEN || position as usize + span as usize > CONFIG_SPACE_LEN {
            warn!(
                "[PCI] {}: malformed VirtIO capability at {:#04x} (len {})",
                config.address(),
                position,
                cap_len
            );
            return None;
        }

        let bar = config.read8(position + 4);
        if bar > MAX_BAR {
            warn!(
                "[PCI] {}: VirtIO capability at {:#04x} names reserved BAR {}",
                config.address(),
                position,
                bar
            );
            return None;
        }

        let mut offset = config.read32(position + 8) as u64;
        if cap_len > NOTIFY_CAP_LEN {
            offset |= (config.read32(position + 16) as u64) << 32;
        }

        Some(VirtioCap {
            position,
            cfg_type,
            bar,
            offset,
            length: config.read32(position + 12),
            cap_len,
        })
    }

    /// `notify_off_multiplier`, meaningful for notify capabilities only.
    pub fn notify_multiplier<C: PciConfigSpace + ?Sized>(&self, config: &C) -> u32 {
        match self.position.checked_add(16) {
            Some(field) if field as usize + 4 <= CONFIG_SPACE_LEN => config.read32(field),
            _ => 0,
        }
    }
}

/// Walks the capability list, yielding vendor-specific entries only.
pub struct Capabilities<'a, C: PciConfigSpace + ?Sized> {
    config: &'a C,
    next: u8,
    remaining: usize,
}

/// Iterate over a device's VirtIO capabilities.
pub fn capabilities<C: PciConfigSpace + ?Sized>(config: &C) -> Capabilities<'_, C> {
    let has_list = config.read16(regs::STATUS) & STATUS_CAP_LIST != 0;
    let next = if has_list {
        config.read8(regs::CAPABILITIES_PTR) & 0xFC
    } else {
        0
    };

    Capabilities {
        config,
        next,
        remaining: MAX_CAPABILITIES,
    }
}

impl<'a, C: PciConfigSpace + ?Sized> Iterator for Capabilities<'a, C> {
    type Item = VirtioCap;

    fn next(&mut self) -> Option<VirtioCap> {
        while self.next != 0 && self.remaining > 0 {
            self.remaining -= 1;
            let position = self.next;
            let header = self.config.read32(position);
            self.next = ((header >> 8) & 0xFC) as u8;

            if (header & 0xFF) as u8 == CAP_ID_VENDOR {
                if let Some(cap) = VirtioCap::read(self.config, position) {
                    return Some(cap);
                }
            }
        }
        None
    }
}

/// Base address of a memory BAR, composing 64-bit BARs from two registers.
///
/// `wide` forces composition with the following register even when the
/// BAR does not advertise itself as 64-bit.
///
/// Reserved BAR indices read as address 0.
pub fn bar_address<C: PciConfigSpace + ?Sized>(config: &C, bar: u8, wide: bool) -> u64 {
    if bar > MAX_BAR {
        return 0;
    }
    let register = regs::BAR0 + (bar << 2);
    let low = config.read32(register);
    let mut address = (low & !0xF) as u64;

    let is_64bit = low & 0x1 == 0 && (low >> 1) & 0x3 == 0x2;
    if (is_64bit || wide) && bar < 5 {
        address |= (config.read32(register + 4) as u64) << 32;
    }
    address
}

/// Enable memory decoding and bus mastering so the device can reach the rings.
pub fn enable_bus_master<C: PciConfigSpace + ?Sized>(config: &C) {
    let command = config.read16(regs::COMMAND);
    config.write16(regs::COMMAND, command | COMMAND_MEMORY | COMMAND_BUS_MASTER);
}

/// Configuration mechanism #1 through I/O ports 0xCF8/0xCFC.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
pub struct PortIoConfig {
    address: PciAddress,
}

#[cfg(target_arch = "x86_64")]
impl PortIoConfig {
    const CONFIG_ADDRESS: u16 = 0xCF8;
    const CONFIG_DATA: u16 = 0xCFC;

    /// # Safety
    ///
    /// The caller must own the PCI configuration ports; concurrent users of
    /// 0xCF8/0xCFC race on the address latch.
    pub unsafe fn new(address: PciAddress) -> Self {
        PortIoConfig { address }
    }
}

#[cfg(target_arch = "x86_64")]
impl PciConfigSpace for PortIoConfig {
    fn address(&self) -> PciAddress {
        self.address
    }

    fn read32(&self, offset: u8) -> u32 {
        use x86_64::instructions::port::Port;

        let config_addr = self.address.to_config_address(offset);
        let mut addr_port: Port<u32> = Port::new(Self::CONFIG_ADDRESS);
        let mut data_port: Port<u32> = Port::new(Self::CONFIG_DATA);

        // SAFETY: exclusive port ownership is part of `PortIoConfig::new`.
        unsafe {
            addr_port.write(config_addr);
            data_port.read()
        }
    }

    fn write32(&self, offset: u8, value: u32) {
        use x86_64::instructions::port::Port;

        let config_addr = self.address.to_config_address(offset);
        let mut addr_port: Port<u32> = Port::new(Self::CONFIG_ADDRESS);
        let mut data_port: Port<u32> = Port::new(Self::CONFIG_DATA);

        // SAFETY: see `read32`.
        unsafe {
            addr_port.write(config_addr);
            data_port.write(value);
        }
    }
}
