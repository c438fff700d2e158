//! VirtIO persistent-memory driver.
//!
//! The device exposes a directly mappable memory window described by its
//! configuration (`start`, `size`) and one request queue used for flushes.

use alloc::vec;

use log::{info, warn};

use crate::bus::Bus;
use crate::config::DriverConfig;
use crate::error::{Result, VirtioError};
use crate::pci::{PciConfigSpace, VirtioDeviceType};
use crate::queue::{VirtToken, XmitQueue};
use crate::registry::VirtioDriver;
use crate::transport::DeviceTransport;

/// PCI device ID of a modern pmem device.
pub const DEVICE_ID: u16 = 0x105B;

const REQUEST_QUEUE: u16 = 0;
const REQ_TYPE_FLUSH: u32 = 0;

mod cfg {
    pub const START: u64 = 0;
    pub const SIZE: u64 = 8;
}

pub struct VirtioPmem<B: Bus> {
    transport: DeviceTransport<B>,
    requests: XmitQueue<B>,
    start: u64,
    size: u64,
}

impl<B: Bus> VirtioPmem<B> {
    pub fn new<C: PciConfigSpace + ?Sized>(bus: B, pci: &C) -> Result<Self> {
        let config = DriverConfig::default();
        let mut transport = DeviceTransport::initialize(bus, pci, &config)?;
        let requests = XmitQueue::new(&mut transport, REQUEST_QUEUE, config.polling)?;
        transport.mark_driver_ok()?;

        let start = transport.read_device_config64(cfg::START)?;
        let size = transport.read_device_config64(cfg::SIZE)?;
        info!(
            "[VirtIO-PMEM] Region {:#x}..{:#x} ({} bytes)",
            start,
            start.wrapping_add(size),
            size
        );

        Ok(VirtioPmem {
            transport,
            requests,
            start,
            size,
        })
    }

    /// Physical start address of the memory window.
    pub fn start_addr(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Ask the device to make prior writes to the window durable.
    pub fn flush(&mut self) -> Result<()> {
        let request = vec![
            VirtToken::device_readable(REQ_TYPE_FLUSH.to_le_bytes().to_vec()),
            VirtToken::device_writable(vec![0u8; 4]),
        ];
        self.requests.enqueue(request)?;
        self.requests.kick();

        while !self.requests.has_processed_used() {
            core::hint::spin_loop();
        }
        let completion = self.requests.dequeue()?;

        let ret = completion
            .tokens
            .last()
            .and_then(|token| token.buffer().get(..4))
            .map_or(u32::MAX, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        if ret != 0 {
            warn!("[VirtIO-PMEM] Flush failed: {}", ret);
            return Err(VirtioError::PmemFlushFailed(ret));
        }
        Ok(())
    }

    pub fn transport(&self) -> &DeviceTransport<B> {
        &self.transport
    }
}

impl<B: Bus> VirtioDriver for VirtioPmem<B> {
    fn device_name(&self) -> &'static str {
        "virtio-pmem"
    }

    fn device_type(&self) -> VirtioDeviceType {
        VirtioDeviceType::Pmem
    }
}
