//! VirtIO driver configuration.
//!
//! Compile-time constants fixed by the VirtIO PCI transport, and the
//! runtime options a device-class driver hands to the transport at attach
//! time.

use crate::transport::Features;

/// PCI vendor ID shared by all VirtIO devices.
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;

/// First device ID of the modern (non-transitional) range.
pub const MODERN_DEVICE_ID_FIRST: u16 = 0x1040;

/// Last device ID of the modern range.
pub const MODERN_DEVICE_ID_LAST: u16 = 0x107F;

/// First transitional (legacy) device ID.
pub const LEGACY_DEVICE_ID_FIRST: u16 = 0x1000;

/// Last transitional (legacy) device ID.
pub const LEGACY_DEVICE_ID_LAST: u16 = 0x103F;

/// PCI revision ID of devices speaking VirtIO 1.x.
pub const SUPPORTED_REVISION: u8 = 1;

/// Largest queue size the split ring format can express.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// MSI-X "no vector" sentinel.
pub const NO_VECTOR: u16 = 0xFFFF;

/// Descriptor table alignment in bytes.
pub const DESC_TABLE_ALIGN: usize = 16;

/// Available ring alignment in bytes.
pub const AVAIL_RING_ALIGN: usize = 2;

/// Used ring alignment in bytes.
pub const USED_RING_ALIGN: usize = 4;

/// Default number of status reads to wait for a reset to complete.
pub const RESET_POLL_LIMIT: u32 = 1_000_000;

/// Per-device options passed to [`DeviceTransport::initialize`].
///
/// [`DeviceTransport::initialize`]: crate::transport::DeviceTransport::initialize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Features the driver cannot work without. `VERSION_1` is always
    /// added by the transport.
    pub required: Features,
    /// Features the driver uses when the device offers them.
    pub optional: Features,
    /// Upper bound on status polls while waiting for reset.
    pub reset_poll_limit: u32,
    /// Whether queues are busy-polled instead of interrupt driven.
    pub polling: bool,
}

impl DriverConfig {
    /// Create a configuration requiring `required` on top of the defaults.
    pub fn new(required: Features) -> Self {
        DriverConfig {
            required: required | Features::VERSION_1,
            ..Self::default()
        }
    }

    /// Replace the optional feature set.
    pub fn with_optional(mut self, optional: Features) -> Self {
        self.optional = optional;
        self
    }

    /// Select interrupt-driven queues.
    pub fn with_interrupts(mut self) -> Self {
        self.polling = false;
        self
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            required: Features::VERSION_1,
            optional: Features::EVENT_IDX | Features::IN_ORDER,
            reset_poll_limit: RESET_POLL_LIMIT,
            polling: true,
        }
    }
}
