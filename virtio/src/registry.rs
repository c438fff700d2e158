//! Driver registry.
//!
//! Maps PCI `(vendor, device)` IDs to driver constructors. The registry is
//! an ordinary value: the platform builds one at startup, registers the
//! drivers it links in, and hands it to whatever enumerates the bus.

use alloc::boxed::Box;

use hashbrown::HashMap;
use log::{debug, info, warn};

use crate::bus::Bus;
use crate::config::VIRTIO_VENDOR_ID;
use crate::console::{self, VirtioConsole};
use crate::error::Result;
use crate::pci::{PciConfigSpace, PciDevice, VirtioDeviceType};
use crate::pmem::{self, VirtioPmem};

/// Constructs a driver instance for a matching device.
pub type ProbeFn<B, C, D> = fn(B, &C) -> Result<D>;

/// Common surface of every device-class driver.
pub trait VirtioDriver {
    /// Human-readable driver name.
    fn device_name(&self) -> &'static str;

    fn device_type(&self) -> VirtioDeviceType;
}

/// Table of driver constructors keyed by PCI IDs.
pub struct DriverRegistry<B, C: ?Sized, D> {
    drivers: HashMap<(u16, u16), ProbeFn<B, C, D>>,
}

impl<B: Bus, C: PciConfigSpace + ?Sized, D> DriverRegistry<B, C, D> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Register `probe` for `(vendor_id, device_id)`, replacing any earlier
    /// entry. Returns the replaced constructor.
    pub fn register(
        &mut self,
        vendor_id: u16,
        device_id: u16,
        probe: ProbeFn<B, C, D>,
    ) -> Option<ProbeFn<B, C, D>> {
        let previous = self.drivers.insert((vendor_id, device_id), probe);
        if previous.is_some() {
            warn!(
                "[VirtIO] Driver for {:04x}:{:04x} replaced",
                vendor_id, device_id
            );
        } else {
            debug!("[VirtIO] Registered driver for {:04x}:{:04x}", vendor_id, device_id);
        }
        previous
    }

    /// Constructor registered for the given IDs.
    pub fn lookup(&self, vendor_id: u16, device_id: u16) -> Option<ProbeFn<B, C, D>> {
        self.drivers.get(&(vendor_id, device_id)).copied()
    }

    /// Run the matching driver against the device behind `pci`.
    ///
    /// `None` if the slot is empty or no driver matches; otherwise the
    /// driver's construction result.
    pub fn probe(&self, bus: B, pci: &C) -> Option<Result<D>> {
        let device = PciDevice::read(pci)?;
        let Some(probe) = self.lookup(device.vendor_id, device.device_id) else {
            debug!("[VirtIO] No driver for {}", device);
            return None;
        };

        info!("[VirtIO] Probing {}", device);
        Some(probe(bus, pci))
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

impl<B: Bus, C: PciConfigSpace + ?Sized, D> Default for DriverRegistry<B, C, D> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registry with every driver in this crate.
pub fn default_registry<B, C>() -> DriverRegistry<B, C, Box<dyn VirtioDriver>>
where
    B: Bus + 'static,
    C: PciConfigSpace + ?Sized,
{
    let mut registry = DriverRegistry::new();
    registry.register(VIRTIO_VENDOR_ID, console::DEVICE_ID, |bus, pci| {
        Ok(Box::new(VirtioConsole::new(bus, pci)?) as Box<dyn VirtioDriver>)
    });
    registry.register(VIRTIO_VENDOR_ID, pmem::DEVICE_ID, |bus, pci| {
        Ok(Box::new(VirtioPmem::new(bus, pci)?) as Box<dyn VirtioDriver>)
    });
    registry
}
