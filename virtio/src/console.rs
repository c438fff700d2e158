//! VirtIO console driver.
//!
//! Single-port console over two polled queues: receive (queue 0) and
//! transmit (queue 1). The receive queue always holds one zeroed 4 KiB
//! buffer for the device to fill.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, info};

use crate::bus::Bus;
use crate::config::DriverConfig;
use crate::error::Result;
use crate::pci::{PciConfigSpace, VirtioDeviceType};
use crate::queue::{VirtToken, XmitQueue};
use crate::registry::VirtioDriver;
use crate::transport::{DeviceTransport, Features};

/// PCI device ID of a modern console.
pub const DEVICE_ID: u16 = 0x1043;

/// Console geometry is available in device configuration.
pub const F_SIZE: Features = Features::from_bits_retain(1 << 0);
/// Multiple ports (not used).
pub const F_MULTIPORT: Features = Features::from_bits_retain(1 << 1);
/// Emergency write register is available.
pub const F_EMERG_WRITE: Features = Features::from_bits_retain(1 << 2);

const RX_QUEUE: u16 = 0;
const TX_QUEUE: u16 = 1;
const RX_BUFFER_SIZE: usize = 4096;

/// Device configuration offsets.
mod cfg {
    pub const COLS_ROWS: u64 = 0;
    pub const EMERG_WR: u64 = 8;
}

pub struct VirtioConsole<B: Bus> {
    transport: DeviceTransport<B>,
    rx: XmitQueue<B>,
    tx: XmitQueue<B>,
}

impl<B: Bus> VirtioConsole<B> {
    pub fn new<C: PciConfigSpace + ?Sized>(bus: B, pci: &C) -> Result<Self> {
        let config = DriverConfig::new(F_EMERG_WRITE)
            .with_optional(DriverConfig::default().optional | F_SIZE);
        let mut transport = DeviceTransport::initialize(bus, pci, &config)?;

        let mut rx = XmitQueue::new(&mut transport, RX_QUEUE, config.polling)?;
        let tx = XmitQueue::new(&mut transport, TX_QUEUE, config.polling)?;
        rx.enqueue(vec![VirtToken::device_writable(vec![0u8; RX_BUFFER_SIZE])])?;

        transport.mark_driver_ok()?;
        rx.kick();

        info!("[VirtIO-Con] Console at {} ready", transport.device().address);
        Ok(VirtioConsole { transport, rx, tx })
    }

    /// Send `message` followed by a NUL and wait until the device took it.
    ///
    /// Returns `Ok(false)` if the transmit queue is full.
    pub fn send(&mut self, message: &[u8]) -> Result<bool> {
        let mut buffer = Vec::with_capacity(message.len() + 1);
        buffer.extend_from_slice(message);
        buffer.push(0);

        if let Err(full) = self.tx.enqueue(vec![VirtToken::device_readable(buffer)]) {
            debug!("[VirtIO-Con] Transmit queue full ({} free)", full.free());
            return Ok(false);
        }
        self.tx.kick();

        while !self.tx.has_processed_used() {
            core::hint::spin_loop();
        }
        self.tx.dequeue()?;
        Ok(true)
    }

    /// Take a received message if one is waiting.
    ///
    /// The message ends at the first NUL or at the device-written length.
    /// The receive buffer is zeroed and handed back to the device.
    pub fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.rx.has_processed_used() {
            return Ok(None);
        }

        let mut completion = self.rx.dequeue()?;
        let written = completion.device_written as usize;
        let mut message = Vec::new();
        for token in completion.tokens.iter_mut() {
            let take = written.saturating_sub(message.len()).min(token.len());
            message.extend_from_slice(&token.buffer()[..take]);
            token.buffer_mut().fill(0);
        }
        if let Some(end) = message.iter().position(|&b| b == 0) {
            message.truncate(end);
        }

        self.rx.enqueue(completion.tokens)?;
        self.rx.kick();
        Ok(Some(message))
    }

    /// Busy-wait for the next received message.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(message) = self.try_recv()? {
                return Ok(message);
            }
            core::hint::spin_loop();
        }
    }

    /// Console `(columns, rows)`, if the device reports them.
    pub fn size(&self) -> Result<Option<(u16, u16)>> {
        if !self.transport.has_feature(F_SIZE) {
            return Ok(None);
        }
        let raw = self.transport.read_device_config32(cfg::COLS_ROWS)?;
        Ok(Some((raw as u16, (raw >> 16) as u16)))
    }

    /// Write one byte through the emergency register, bypassing the queues.
    pub fn emergency_write(&self, byte: u8) -> Result<()> {
        self.transport.write_device_config32(cfg::EMERG_WR, byte as u32)
    }

    pub fn transport(&self) -> &DeviceTransport<B> {
        &self.transport
    }
}

impl<B: Bus> VirtioDriver for VirtioConsole<B> {
    fn device_name(&self) -> &'static str {
        "virtio-console"
    }

    fn device_type(&self) -> VirtioDeviceType {
        VirtioDeviceType::Console
    }
}
