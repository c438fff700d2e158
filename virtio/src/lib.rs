//! VirtIO transport layer.
//!
//! This crate drives modern (non-transitional) VirtIO devices over PCI:
//! it negotiates capabilities with the device and exchanges buffers with
//! it through split virtqueues.
//!
//! # Architecture
//!
//! - `transport`: PCI capability discovery, device-status state machine,
//!   feature negotiation
//! - `queue`: split virtqueue engine (descriptor table, available/used
//!   rings, in-order and unordered descriptor allocation)
//! - `bus` / `pci`: the hardware access seams (MMIO registers and PCI
//!   configuration space)
//! - `registry`: explicit driver table consulted during device discovery
//! - `console` / `pmem`: device-class drivers built on the above
//!
//! A device-class driver attaches once, creates its queues, marks the
//! device ready, and from then on only talks to its queues:
//!
//! ```ignore
//! let mut transport = DeviceTransport::initialize(bus, &pci, &DriverConfig::default())?;
//! let mut queue = XmitQueue::new(&mut transport, 0, true)?;
//! transport.mark_driver_ok()?;
//!
//! queue.enqueue(vec![VirtToken::device_writable(buffer)])?;
//! queue.kick();
//! while !queue.has_processed_used() {
//!     core::hint::spin_loop();
//! }
//! let completion = queue.dequeue()?;
//! ```
//!
//! # References
//!
//! - VirtIO Specification 1.2, sections 2 and 4.1

#![no_std]

extern crate alloc;

pub mod bus;
pub mod config;
pub mod console;
pub mod error;
pub mod pci;
pub mod pmem;
pub mod queue;
pub mod registry;
pub mod transport;

pub use bus::{Bus, MmioBus};
pub use config::DriverConfig;
pub use error::{Result, VirtioError};
pub use pci::{PciAddress, PciConfigSpace, PciDevice, VirtioDeviceType};
pub use queue::{
    Completion, DescFlags, PolicyKind, QueueFull, VirtQueue, VirtToken, VirtTokens, XmitQueue,
};
pub use registry::{DriverRegistry, VirtioDriver};
pub use transport::{DeviceStatus, DeviceTransport, Features, TransportState};
