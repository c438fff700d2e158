//! VirtIO error types.

use crate::pci::CapType;
use crate::transport::{DeviceStatus, Features, TransportState};

/// Errors surfaced by the transport and the queues.
///
/// Everything except `NoFreeDescriptors` is fatal for the device instance:
/// the transport has already announced `FAILED` to the device by the time
/// the caller sees the error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VirtioError {
    // ── Attach ───────────────────────────────────────────────────────

    #[error("unsupported device {vendor_id:#06x}:{device_id:#06x}")]
    UnsupportedDevice { vendor_id: u16, device_id: u16 },

    #[error("unsupported device revision {0}")]
    UnsupportedRevision(u8),

    #[error("{0:?} capability not found")]
    MissingCapability(CapType),

    // ── Negotiation ──────────────────────────────────────────────────

    #[error("device did not reset within {polls} polls")]
    ResetTimeout { polls: u32 },

    #[error("device status regressed: expected {expected:?}, read {actual:?}")]
    StatusRegressed {
        expected: DeviceStatus,
        actual: DeviceStatus,
    },

    #[error("device does not offer required features {missing:?}")]
    FeatureMismatch { missing: Features },

    #[error("device rejected the negotiated feature set")]
    FeaturesRejected,

    #[error("device set NEEDS_RESET after DRIVER_OK")]
    DeviceGaveUp,

    #[error("transport is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: TransportState,
        actual: TransportState,
    },

    // ── Queues ───────────────────────────────────────────────────────

    #[error("queue {queue} has unusable size {size}")]
    InvalidQueueSize { queue: u16, size: u16 },

    #[error("queue {queue} rejected MSI-X vector {vector}")]
    VectorRejected { queue: u16, vector: u16 },

    #[error("DMA allocation of {size} bytes failed")]
    DmaAllocation { size: usize },

    #[error("device reported invalid used id {0}")]
    InvalidUsedId(u32),

    #[error("request needs {needed} descriptors but only {free} are free")]
    NoFreeDescriptors { needed: usize, free: usize },

    // ── Device classes ───────────────────────────────────────────────

    #[error("pmem flush failed with status {0}")]
    PmemFlushFailed(u32),
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, VirtioError>;
