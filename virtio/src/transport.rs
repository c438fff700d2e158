//! VirtIO PCI transport.
//!
//! Owns the negotiated connection to one device: the capability regions,
//! the accepted feature bits and the device-status handshake.
//!
//! # Initialization Sequence
//!
//! The handshake is a strictly linear state machine:
//!
//! ```text
//! Unattached -> Reset -> Acknowledged -> Driver -> FeaturesNegotiated
//!            -> FeaturesOkConfirmed -> (queue setup) -> DriverOk
//! ```
//!
//! Any failure announces `FAILED` to the device and parks the transport
//! in [`TransportState::Failed`]; nothing moves backwards.

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::bus::Bus;
use crate::config::{self, DriverConfig};
use crate::error::{Result, VirtioError};
use crate::pci::{self, CapType, PciConfigSpace, PciDevice};

bitflags! {
    /// Device status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceStatus: u8 {
        /// Driver has acknowledged device.
        const ACKNOWLEDGE = 1;
        /// Driver knows how to drive the device.
        const DRIVER = 2;
        /// Driver is ready.
        const DRIVER_OK = 4;
        /// Feature negotiation complete.
        const FEATURES_OK = 8;
        /// Device needs reset.
        const NEEDS_RESET = 64;
        /// Driver gave up on the device.
        const FAILED = 128;
    }
}

bitflags! {
    /// Device-independent feature bits.
    ///
    /// Bits 0-23 belong to the device class; device drivers name theirs
    /// with [`Features::from_bits_retain`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Features: u64 {
        /// Indirect descriptor tables (not used by this driver).
        const INDIRECT_DESC = 1 << 28;
        /// `used_event` / `avail_event` notification suppression.
        const EVENT_IDX = 1 << 29;
        /// VirtIO 1.x compliance. Always required.
        const VERSION_1 = 1 << 32;
        const ACCESS_PLATFORM = 1 << 33;
        /// Packed virtqueue layout (not supported).
        const RING_PACKED = 1 << 34;
        /// Device uses buffers in the order they were made available.
        const IN_ORDER = 1 << 35;
        const ORDER_PLATFORM = 1 << 36;
        const NOTIFICATION_DATA = 1 << 38;
        const RING_RESET = 1 << 40;

        const _ = !0;
    }
}

/// `virtio_pci_common_cfg` register offsets.
pub(crate) mod common {
    pub const DEVICE_FEATURE_SELECT: u64 = 0x00;
    pub const DEVICE_FEATURE: u64 = 0x04;
    pub const DRIVER_FEATURE_SELECT: u64 = 0x08;
    pub const DRIVER_FEATURE: u64 = 0x0C;
    pub const CONFIG_MSIX_VECTOR: u64 = 0x10;
    pub const NUM_QUEUES: u64 = 0x12;
    pub const DEVICE_STATUS: u64 = 0x14;
    pub const CONFIG_GENERATION: u64 = 0x15;
    pub const QUEUE_SELECT: u64 = 0x16;
    pub const QUEUE_SIZE: u64 = 0x18;
    pub const QUEUE_MSIX_VECTOR: u64 = 0x1A;
    pub const QUEUE_ENABLE: u64 = 0x1C;
    pub const QUEUE_NOTIFY_OFF: u64 = 0x1E;
    pub const QUEUE_DESC: u64 = 0x20;
    pub const QUEUE_DRIVER: u64 = 0x28;
    pub const QUEUE_DEVICE: u64 = 0x30;
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unattached,
    Reset,
    Acknowledged,
    Driver,
    FeaturesNegotiated,
    FeaturesOkConfirmed,
    DriverOk,
    Failed,
}

/// Register regions located by capability discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Regions {
    /// `virtio_pci_common_cfg`.
    pub common: u64,
    /// Base of the notification region.
    pub notify: Option<u64>,
    /// Multiplier applied to `queue_notify_off`.
    pub notify_multiplier: u32,
    /// ISR status byte.
    pub isr: Option<u64>,
    /// Device-class specific configuration.
    pub device: Option<u64>,
}

/// Negotiated connection to one VirtIO device.
///
/// Deliberately not `Clone`: it stands for one device's register ranges.
#[derive(Debug)]
pub struct DeviceTransport<B: Bus> {
    bus: B,
    device: PciDevice,
    state: TransportState,
    regions: Option<Regions>,
    negotiated: Features,
    reset_poll_limit: u32,
}

impl<B: Bus> DeviceTransport<B> {
    /// Verify that `pci` is a modern VirtIO device this driver can speak to.
    pub fn attach<C: PciConfigSpace + ?Sized>(bus: B, pci: &C) -> Result<Self> {
        let device = PciDevice::read(pci).ok_or(VirtioError::UnsupportedDevice {
            vendor_id: 0xFFFF,
            device_id: 0xFFFF,
        })?;

        info!("[VirtIO] Attaching to {}", device);

        if !device.is_virtio() || device.is_legacy_id() || !device.is_modern_id() {
            warn!(
                "[VirtIO] {:04x}:{:04x} is not a modern VirtIO device",
                device.vendor_id, device.device_id
            );
            return Err(VirtioError::UnsupportedDevice {
                vendor_id: device.vendor_id,
                device_id: device.device_id,
            });
        }

        if device.revision != config::SUPPORTED_REVISION {
            warn!("[VirtIO] Revision {} not supported", device.revision);
            return Err(VirtioError::UnsupportedRevision(device.revision));
        }

        Ok(DeviceTransport {
            bus,
            device,
            state: TransportState::Unattached,
            regions: None,
            negotiated: Features::empty(),
            reset_poll_limit: config::RESET_POLL_LIMIT,
        })
    }

    /// Run the whole handshake up to (not including) `DRIVER_OK`.
    ///
    /// The caller sets up its queues next and then calls
    /// [`mark_driver_ok`](Self::mark_driver_ok).
    pub fn initialize<C: PciConfigSpace + ?Sized>(
        bus: B,
        pci: &C,
        config: &DriverConfig,
    ) -> Result<Self> {
        let mut transport = Self::attach(bus, pci)?;
        transport.reset_poll_limit = config.reset_poll_limit;

        pci::enable_bus_master(pci);
        transport.discover_capabilities(pci)?;
        transport.reset()?;
        transport.acknowledge_and_declare_driver()?;
        transport.negotiate(config.required, config.optional)?;
        Ok(transport)
    }

    /// Locate the common, notify, ISR and device-specific regions.
    pub fn discover_capabilities<C: PciConfigSpace + ?Sized>(&mut self, pci: &C) -> Result<()> {
        self.expect_state(TransportState::Unattached)?;
        if self.regions.is_some() {
            return self.fail(VirtioError::InvalidState {
                expected: TransportState::Unattached,
                actual: self.state,
            });
        }

        let mut common = None;
        let mut regions = Regions {
            common: 0,
            notify: None,
            notify_multiplier: 0,
            isr: None,
            device: None,
        };

        for cap in pci::capabilities(pci) {
            let wide = cap.cap_len > pci::NOTIFY_CAP_LEN;
            let address = pci::bar_address(pci, cap.bar, wide) + cap.offset;
            debug!(
                "[VirtIO] {:?} capability: bar {} offset {:#x} -> {:#x}",
                cap.cfg_type, cap.bar, cap.offset, address
            );

            // First capability of each type wins.
            match cap.cfg_type {
                CapType::Common if common.is_none() => common = Some(address),
                CapType::Notify if regions.notify.is_none() => {
                    regions.notify = Some(address);
                    regions.notify_multiplier = cap.notify_multiplier(pci);
                }
                CapType::Isr if regions.isr.is_none() => regions.isr = Some(address),
                CapType::Device if regions.device.is_none() => regions.device = Some(address),
                _ => {}
            }
        }

        regions.common = match common {
            Some(address) => address,
            None => {
                warn!("[VirtIO] {} has no common configuration", self.device.address);
                self.state = TransportState::Failed;
                return Err(VirtioError::MissingCapability(CapType::Common));
            }
        };

        self.regions = Some(regions);
        Ok(())
    }

    /// Write status 0 and wait for the device to acknowledge the reset.
    pub fn reset(&mut self) -> Result<()> {
        self.expect_state(TransportState::Unattached)?;
        let common = self.common()?;

        self.bus.write8(common + common::DEVICE_STATUS, 0);
        let mut polls = 0;
        while self.bus.read8(common + common::DEVICE_STATUS) != 0 {
            polls += 1;
            if polls >= self.reset_poll_limit {
                return self.fail(VirtioError::ResetTimeout { polls });
            }
            core::hint::spin_loop();
        }

        self.state = TransportState::Reset;
        Ok(())
    }

    /// Set ACKNOWLEDGE, then DRIVER.
    pub fn acknowledge_and_declare_driver(&mut self) -> Result<()> {
        self.expect_state(TransportState::Reset)?;

        let status = self.set_status(DeviceStatus::ACKNOWLEDGE);
        if !status.contains(DeviceStatus::ACKNOWLEDGE) {
            return self.fail(VirtioError::StatusRegressed {
                expected: DeviceStatus::ACKNOWLEDGE,
                actual: status,
            });
        }
        self.state = TransportState::Acknowledged;

        let status = self.set_status(DeviceStatus::DRIVER);
        let expected = DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER;
        if !status.contains(expected) {
            return self.fail(VirtioError::StatusRegressed {
                expected,
                actual: status,
            });
        }
        self.state = TransportState::Driver;
        Ok(())
    }

    /// Agree on `offered & (required | optional)` and confirm FEATURES_OK.
    ///
    /// Nothing is written to the driver feature registers unless every
    /// required bit is offered.
    pub fn negotiate(&mut self, required: Features, optional: Features) -> Result<Features> {
        self.expect_state(TransportState::Driver)?;
        let common = self.common()?;
        let required = required | Features::VERSION_1;

        let offered = self.device_features(common);
        let missing = required.difference(offered);
        if !missing.is_empty() {
            warn!("[VirtIO] Device lacks required features {:?}", missing);
            return self.fail(VirtioError::FeatureMismatch { missing });
        }

        let accepted = offered & (required | optional);
        let bits = accepted.bits();
        self.bus.write32(common + common::DRIVER_FEATURE_SELECT, 0);
        self.bus.write32(common + common::DRIVER_FEATURE, bits as u32);
        self.bus.write32(common + common::DRIVER_FEATURE_SELECT, 1);
        self.bus.write32(common + common::DRIVER_FEATURE, (bits >> 32) as u32);
        self.negotiated = accepted;
        self.state = TransportState::FeaturesNegotiated;

        let status = self.set_status(DeviceStatus::FEATURES_OK);
        if !status.contains(DeviceStatus::FEATURES_OK) {
            warn!("[VirtIO] Device cleared FEATURES_OK");
            return self.fail(VirtioError::FeaturesRejected);
        }

        self.state = TransportState::FeaturesOkConfirmed;
        info!("[VirtIO] Negotiated features {:?}", accepted);
        Ok(accepted)
    }

    /// Set DRIVER_OK. The device is live from here on.
    pub fn mark_driver_ok(&mut self) -> Result<()> {
        self.expect_state(TransportState::FeaturesOkConfirmed)?;

        let status = self.set_status(DeviceStatus::DRIVER_OK);
        if status.contains(DeviceStatus::NEEDS_RESET) {
            warn!("[VirtIO] Device needs reset right after DRIVER_OK");
            return self.fail(VirtioError::DeviceGaveUp);
        }

        self.state = TransportState::DriverOk;
        info!("[VirtIO] {} ready", self.device.address);
        Ok(())
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn device(&self) -> &PciDevice {
        &self.device
    }

    pub fn regions(&self) -> Option<&Regions> {
        self.regions.as_ref()
    }

    /// Feature bits accepted during negotiation.
    pub fn negotiated(&self) -> Features {
        self.negotiated
    }

    pub fn has_feature(&self, feature: Features) -> bool {
        self.negotiated.contains(feature)
    }

    pub fn notify_multiplier(&self) -> u32 {
        self.regions.map_or(0, |r| r.notify_multiplier)
    }

    /// Current device status register.
    pub fn status(&self) -> DeviceStatus {
        match self.regions {
            Some(r) => DeviceStatus::from_bits_retain(self.bus.read8(r.common + common::DEVICE_STATUS)),
            None => DeviceStatus::empty(),
        }
    }

    /// Number of queues the device supports.
    pub fn num_queues(&self) -> u16 {
        self.regions
            .map_or(0, |r| self.bus.read16(r.common + common::NUM_QUEUES))
    }

    pub fn config_generation(&self) -> u8 {
        self.regions
            .map_or(0, |r| self.bus.read8(r.common + common::CONFIG_GENERATION))
    }

    pub fn device_config_region(&self) -> Option<u64> {
        self.regions.and_then(|r| r.device)
    }

    pub fn read_device_config32(&self, offset: u64) -> Result<u32> {
        let base = self.device_config()?;
        Ok(self.bus.read32(base + offset))
    }

    pub fn read_device_config64(&self, offset: u64) -> Result<u64> {
        let base = self.device_config()?;
        Ok(self.bus.read64(base + offset))
    }

    pub fn write_device_config32(&self, offset: u64, value: u32) -> Result<()> {
        let base = self.device_config()?;
        self.bus.write32(base + offset, value);
        Ok(())
    }

    /// Address of the doorbell for a queue with the given `queue_notify_off`.
    pub fn notify_address(&self, queue_notify_off: u16) -> Result<u64> {
        let regions = self.regions.ok_or(VirtioError::MissingCapability(CapType::Common))?;
        let notify = regions
            .notify
            .ok_or(VirtioError::MissingCapability(CapType::Notify))?;
        Ok(notify + queue_notify_off as u64 * regions.notify_multiplier as u64)
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    // ── Queue setup (used by `queue`) ────────────────────────────────

    /// Select `index` and return its maximum size.
    pub(crate) fn select_queue(&mut self, index: u16) -> Result<u16> {
        self.expect_state(TransportState::FeaturesOkConfirmed)?;
        let common = self.common()?;
        self.bus.write16(common + common::QUEUE_SELECT, index);
        Ok(self.bus.read16(common + common::QUEUE_SIZE))
    }

    pub(crate) fn set_queue_size(&self, size: u16) -> Result<()> {
        let common = self.common()?;
        self.bus.write16(common + common::QUEUE_SIZE, size);
        Ok(())
    }

    pub(crate) fn set_queue_addresses(&self, desc: u64, driver: u64, device: u64) -> Result<()> {
        let common = self.common()?;
        self.bus.write64(common + common::QUEUE_DESC, desc);
        self.bus.write64(common + common::QUEUE_DRIVER, driver);
        self.bus.write64(common + common::QUEUE_DEVICE, device);
        Ok(())
    }

    /// Write the selected queue's MSI-X vector and return the readback.
    pub(crate) fn set_queue_vector(&self, vector: u16) -> Result<u16> {
        let common = self.common()?;
        self.bus.write16(common + common::QUEUE_MSIX_VECTOR, vector);
        Ok(self.bus.read16(common + common::QUEUE_MSIX_VECTOR))
    }

    pub(crate) fn disable_config_interrupt(&self) -> Result<()> {
        let common = self.common()?;
        self.bus
            .write16(common + common::CONFIG_MSIX_VECTOR, config::NO_VECTOR);
        Ok(())
    }

    pub(crate) fn queue_notify_off(&self) -> Result<u16> {
        let common = self.common()?;
        Ok(self.bus.read16(common + common::QUEUE_NOTIFY_OFF))
    }

    pub(crate) fn enable_queue(&self) -> Result<()> {
        let common = self.common()?;
        self.bus.write16(common + common::QUEUE_ENABLE, 1);
        Ok(())
    }

    /// Announce failure to the device and surface `error`.
    pub(crate) fn fail<T>(&mut self, error: VirtioError) -> Result<T> {
        warn!("[VirtIO] {} failed: {}", self.device.address, error);
        if let Some(regions) = self.regions {
            let status = self.bus.read8(regions.common + common::DEVICE_STATUS);
            self.bus.write8(
                regions.common + common::DEVICE_STATUS,
                status | DeviceStatus::FAILED.bits(),
            );
        }
        self.state = TransportState::Failed;
        Err(error)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn expect_state(&mut self, expected: TransportState) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        let actual = self.state;
        self.fail(VirtioError::InvalidState { expected, actual })
    }

    fn common(&self) -> Result<u64> {
        self.regions
            .map(|r| r.common)
            .ok_or(VirtioError::MissingCapability(CapType::Common))
    }

    fn device_config(&self) -> Result<u64> {
        self.device_config_region()
            .ok_or(VirtioError::MissingCapability(CapType::Device))
    }

    /// OR `bits` into the status register and return the readback.
    fn set_status(&self, bits: DeviceStatus) -> DeviceStatus {
        let Some(regions) = self.regions else {
            return DeviceStatus::empty();
        };
        let addr = regions.common + common::DEVICE_STATUS;
        let status = self.bus.read8(addr) | bits.bits();
        self.bus.write8(addr, status);
        DeviceStatus::from_bits_retain(self.bus.read8(addr))
    }

    /// Read the 64-bit offered feature set through its two 32-bit windows.
    fn device_features(&self, common: u64) -> Features {
        self.bus.write32(common + common::DEVICE_FEATURE_SELECT, 0);
        let lo = self.bus.read32(common + common::DEVICE_FEATURE) as u64;
        self.bus.write32(common + common::DEVICE_FEATURE_SELECT, 1);
        let hi = self.bus.read32(common + common::DEVICE_FEATURE) as u64;
        Features::from_bits_retain(lo | (hi << 32))
    }
}
