//! Simulated modern VirtIO PCI device.
//!
//! Implements both [`Bus`] and [`PciConfigSpace`] over shared state so a
//! test can drive the real transport and queue code and then play the
//! device side: walk the available ring, write into buffers and post used
//! entries. Ring memory is the driver's own heap allocation (the bus uses
//! identity DMA addresses), accessed here through raw pointers.

#![allow(dead_code)]

use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use pvio_virtio::pci::PciAddress;
use pvio_virtio::{Bus, PciConfigSpace};
use spin::Mutex;

pub const BAR0: u64 = 0xFEB0_0000;
pub const COMMON: u64 = BAR0;
pub const ISR: u64 = BAR0 + 0x1000;
pub const DEVICE_CFG: u64 = BAR0 + 0x2000;
pub const NOTIFY: u64 = BAR0 + 0x3000;
pub const NOTIFY_MULTIPLIER: u32 = 4;

pub const VERSION_1: u64 = 1 << 32;
pub const EVENT_IDX: u64 = 1 << 29;
pub const IN_ORDER: u64 = 1 << 35;

pub const CAP_COMMON: u8 = 1;
pub const CAP_NOTIFY: u8 = 2;
pub const CAP_ISR: u8 = 3;
pub const CAP_DEVICE: u8 = 4;

pub const NO_VECTOR: u16 = 0xFFFF;

const STATUS_FEATURES_OK: u8 = 8;
const STATUS_DRIVER_OK: u8 = 4;
const STATUS_NEEDS_RESET: u8 = 64;

/// One buffer of a chain as the device sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimBuffer {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
}

impl SimBuffer {
    pub fn is_write(&self) -> bool {
        self.flags & 2 != 0
    }

    pub fn read(&self) -> Vec<u8> {
        let mut data = vec![0u8; self.len as usize];
        // SAFETY: the driver published this buffer and owns it until completion.
        unsafe {
            ptr::copy_nonoverlapping(self.addr as *const u8, data.as_mut_ptr(), data.len());
        }
        data
    }

    /// Copy `data` into the buffer, truncated to its length. Returns bytes written.
    pub fn write(&self, data: &[u8]) -> u32 {
        let n = data.len().min(self.len as usize);
        // SAFETY: see `read`.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.addr as *mut u8, n);
        }
        n as u32
    }
}

/// A descriptor chain taken off the available ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub head: u16,
    /// Descriptor indices, in chain order.
    pub indices: Vec<u16>,
    pub buffers: Vec<SimBuffer>,
}

#[derive(Debug, Clone)]
pub struct SimQueue {
    pub max_size: u16,
    pub size: u16,
    pub desc: u64,
    pub driver: u64,
    pub device: u64,
    pub vector: u16,
    pub enabled: bool,
    pub last_avail: u16,
    /// Complete every chain as soon as the doorbell rings.
    pub auto_complete: bool,
    /// Written into the first writable buffer of auto-completed chains.
    pub response: Vec<u8>,
    /// Contents of readable buffers of auto-completed chains.
    pub received: Vec<Vec<u8>>,
}

impl SimQueue {
    fn new(max_size: u16) -> Self {
        SimQueue {
            max_size,
            size: max_size,
            desc: 0,
            driver: 0,
            device: 0,
            vector: NO_VECTOR,
            enabled: false,
            last_avail: 0,
            auto_complete: false,
            response: Vec::new(),
            received: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct SimState {
    pub config: [u8; 256],
    pub offered: u64,
    pub driver_features: u64,
    device_feature_select: u32,
    driver_feature_select: u32,
    pub status: u8,
    pub config_vector: u16,
    pub queue_select: u16,
    pub queues: Vec<SimQueue>,
    pub device_config: [u8; 64],
    pub emergency: Vec<u8>,

    pub reject_features_ok: bool,
    pub needs_reset_on_driver_ok: bool,
    pub reset_stuck: bool,
    /// Vectors at or above this are refused.
    pub max_vectors: u16,

    /// `(offset, value)` of every common-config write.
    pub common_writes: Vec<(u64, u64)>,
    /// Queue index of every doorbell write.
    pub notifications: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// A modern device with ID `device_id` offering `offered`, with one
    /// queue per entry of `queue_sizes`.
    pub fn new(device_id: u16, offered: u64, queue_sizes: &[u16]) -> Self {
        SimDevice::with_capabilities(
            device_id,
            offered,
            queue_sizes,
            &[CAP_COMMON, CAP_NOTIFY, CAP_ISR, CAP_DEVICE],
        )
    }

    /// Like [`new`](Self::new) but only advertising the given capability types.
    pub fn with_capabilities(device_id: u16, offered: u64, queue_sizes: &[u16], caps: &[u8]) -> Self {
        let state = SimState {
            config: build_config(device_id, caps),
            offered,
            driver_features: 0,
            device_feature_select: 0,
            driver_feature_select: 0,
            status: 0,
            config_vector: NO_VECTOR,
            queue_select: 0,
            queues: queue_sizes.iter().map(|&size| SimQueue::new(size)).collect(),
            device_config: [0; 64],
            emergency: Vec::new(),
            reject_features_ok: false,
            needs_reset_on_driver_ok: false,
            reset_stuck: false,
            max_vectors: 8,
            common_writes: Vec::new(),
            notifications: Vec::new(),
        };
        SimDevice {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut guard = self.state.lock();
        f(&mut *guard)
    }

    pub fn status(&self) -> u8 {
        self.with(|s| s.status)
    }

    pub fn set_config_bytes(&self, offset: usize, bytes: &[u8]) {
        self.with(|s| s.config[offset..offset + bytes.len()].copy_from_slice(bytes));
    }

    pub fn set_device_config(&self, offset: usize, bytes: &[u8]) {
        self.with(|s| s.device_config[offset..offset + bytes.len()].copy_from_slice(bytes));
    }

    pub fn auto_complete(&self, queue: u16, response: &[u8]) {
        self.with(|s| {
            let q = &mut s.queues[queue as usize];
            q.auto_complete = true;
            q.response = response.to_vec();
        });
    }

    pub fn received(&self, queue: u16) -> Vec<Vec<u8>> {
        self.with(|s| s.queues[queue as usize].received.clone())
    }

    pub fn notifications(&self) -> Vec<u16> {
        self.with(|s| s.notifications.clone())
    }

    pub fn common_writes(&self) -> Vec<(u64, u64)> {
        self.with(|s| s.common_writes.clone())
    }

    // ── Device side of the rings ─────────────────────────────────────

    /// Pop every chain the driver has published since the last call.
    pub fn take_available(&self, queue: u16) -> Vec<Chain> {
        self.with(|s| take_available(&mut s.queues[queue as usize]))
    }

    /// Post `{id: head, len}` at the next used position.
    pub fn complete(&self, queue: u16, head: u16, len: u32) {
        self.with(|s| post_used(&s.queues[queue as usize], head as u32, len));
    }

    /// Post a raw used entry, even one naming no valid chain.
    pub fn post_raw(&self, queue: u16, id: u32, len: u32) {
        self.with(|s| post_used(&s.queues[queue as usize], id, len));
    }

    pub fn used_idx(&self, queue: u16) -> u16 {
        self.with(|s| used_idx(&s.queues[queue as usize]))
    }

    pub fn avail_flags(&self, queue: u16) -> u16 {
        self.with(|s| unsafe { ptr::read_volatile(s.queues[queue as usize].driver as *const u16) })
    }

    pub fn used_event(&self, queue: u16) -> u16 {
        self.with(|s| {
            let q = &s.queues[queue as usize];
            unsafe { ptr::read_volatile((q.driver + 4 + 2 * q.size as u64) as *const u16) }
        })
    }

    pub fn set_used_flags(&self, queue: u16, flags: u16) {
        self.with(|s| unsafe { ptr::write_volatile(s.queues[queue as usize].device as *mut u16, flags) });
    }

    pub fn set_avail_event(&self, queue: u16, idx: u16) {
        self.with(|s| set_avail_event(&s.queues[queue as usize], idx));
    }

    // ── Register file ────────────────────────────────────────────────

    fn read(&self, addr: u64, width: u8) -> u64 {
        let mut s = self.state.lock();
        if (COMMON..COMMON + 0x38).contains(&addr) {
            return s.read_common(addr - COMMON, width);
        }
        if (DEVICE_CFG..DEVICE_CFG + 64).contains(&addr) {
            let o = (addr - DEVICE_CFG) as usize;
            let mut value = 0u64;
            for i in (0..width as usize).rev() {
                value = (value << 8) | s.device_config[o + i] as u64;
            }
            return value;
        }
        if addr == ISR {
            return 0;
        }
        0
    }

    fn write(&self, addr: u64, width: u8, value: u64) {
        let mut s = self.state.lock();
        if (COMMON..COMMON + 0x38).contains(&addr) {
            s.common_writes.push((addr - COMMON, value));
            s.write_common(addr - COMMON, value);
            return;
        }
        if (DEVICE_CFG..DEVICE_CFG + 64).contains(&addr) {
            let o = (addr - DEVICE_CFG) as usize;
            for i in 0..width as usize {
                s.device_config[o + i] = (value >> (8 * i)) as u8;
            }
            if o == 8 {
                s.emergency.push(value as u8);
            }
            return;
        }
        if addr >= NOTIFY && addr < NOTIFY + 0x1000 {
            let queue = ((addr - NOTIFY) / NOTIFY_MULTIPLIER as u64) as u16;
            s.notifications.push(queue);
            if let Some(q) = s.queues.get_mut(queue as usize) {
                if q.auto_complete {
                    auto_complete(q);
                }
            }
        }
    }
}

impl SimState {
    fn selected(&mut self) -> Option<&mut SimQueue> {
        self.queues.get_mut(self.queue_select as usize)
    }

    fn read_common(&mut self, offset: u64, _width: u8) -> u64 {
        match offset {
            0x00 => self.device_feature_select as u64,
            0x04 => match self.device_feature_select {
                0 => self.offered & 0xFFFF_FFFF,
                1 => self.offered >> 32,
                _ => 0,
            },
            0x08 => self.driver_feature_select as u64,
            0x0C => match self.driver_feature_select {
                0 => self.driver_features & 0xFFFF_FFFF,
                1 => self.driver_features >> 32,
                _ => 0,
            },
            0x10 => self.config_vector as u64,
            0x12 => self.queues.len() as u64,
            0x14 => self.status as u64,
            0x15 => 0,
            0x16 => self.queue_select as u64,
            0x18 => self.selected().map_or(0, |q| q.size as u64),
            0x1A => self.selected().map_or(NO_VECTOR as u64, |q| q.vector as u64),
            0x1C => self.selected().map_or(0, |q| q.enabled as u64),
            // queue_notify_off equals the queue index.
            0x1E => self.queue_select as u64,
            _ => 0,
        }
    }

    fn write_common(&mut self, offset: u64, value: u64) {
        match offset {
            0x00 => self.device_feature_select = value as u32,
            0x08 => self.driver_feature_select = value as u32,
            0x0C => match self.driver_feature_select {
                0 => self.driver_features = (self.driver_features & !0xFFFF_FFFF) | value,
                1 => self.driver_features = (self.driver_features & 0xFFFF_FFFF) | (value << 32),
                _ => {}
            },
            0x10 => self.config_vector = value as u16,
            0x14 => self.write_status(value as u8),
            0x16 => self.queue_select = value as u16,
            0x18 => {
                if let Some(q) = self.selected() {
                    q.size = value as u16;
                }
            }
            0x1A => {
                let vector = value as u16;
                let max_vectors = self.max_vectors;
                if let Some(q) = self.selected() {
                    q.vector = if vector == NO_VECTOR || vector < max_vectors {
                        vector
                    } else {
                        NO_VECTOR
                    };
                }
            }
            0x1C => {
                if let Some(q) = self.selected() {
                    q.enabled = value != 0;
                }
            }
            0x20 | 0x24 | 0x28 | 0x2C | 0x30 | 0x34 => {
                if let Some(q) = self.selected() {
                    let field = match offset & !0x7 {
                        0x20 => &mut q.desc,
                        0x28 => &mut q.driver,
                        _ => &mut q.device,
                    };
                    if offset & 0x4 == 0 {
                        *field = (*field & !0xFFFF_FFFF) | value;
                    } else {
                        *field = (*field & 0xFFFF_FFFF) | (value << 32);
                    }
                }
            }
            _ => {}
        }
    }

    fn write_status(&mut self, value: u8) {
        if value == 0 {
            if self.reset_stuck {
                return;
            }
            self.status = 0;
            self.driver_features = 0;
            for q in &mut self.queues {
                *q = SimQueue {
                    auto_complete: q.auto_complete,
                    response: core::mem::take(&mut q.response),
                    ..SimQueue::new(q.max_size)
                };
            }
            return;
        }

        let mut status = value;
        if self.reject_features_ok {
            status &= !STATUS_FEATURES_OK;
        }
        if status & STATUS_DRIVER_OK != 0 && self.needs_reset_on_driver_ok {
            status |= STATUS_NEEDS_RESET;
        }
        self.status = status;
    }
}

impl Bus for SimDevice {
    fn read8(&self, addr: u64) -> u8 {
        self.read(addr, 1) as u8
    }

    fn read16(&self, addr: u64) -> u16 {
        self.read(addr, 2) as u16
    }

    fn read32(&self, addr: u64) -> u32 {
        self.read(addr, 4) as u32
    }

    fn write8(&self, addr: u64, value: u8) {
        self.write(addr, 1, value as u64)
    }

    fn write16(&self, addr: u64, value: u16) {
        self.write(addr, 2, value as u64)
    }

    fn write32(&self, addr: u64, value: u32) {
        self.write(addr, 4, value as u64)
    }
}

impl PciConfigSpace for SimDevice {
    fn address(&self) -> PciAddress {
        PciAddress::new(0, 4, 0)
    }

    fn read32(&self, offset: u8) -> u32 {
        let s = self.state.lock();
        let o = offset as usize;
        u32::from_le_bytes([s.config[o], s.config[o + 1], s.config[o + 2], s.config[o + 3]])
    }

    fn write32(&self, offset: u8, value: u32) {
        let mut s = self.state.lock();
        let o = offset as usize;
        s.config[o..o + 4].copy_from_slice(&value.to_le_bytes());
    }
}

// ── Config space construction ───────────────────────────────────────

fn build_config(device_id: u16, caps: &[u8]) -> [u8; 256] {
    let mut config = [0u8; 256];
    config[0..2].copy_from_slice(&0x1AF4u16.to_le_bytes());
    config[2..4].copy_from_slice(&device_id.to_le_bytes());
    config[6..8].copy_from_slice(&0x0010u16.to_le_bytes());
    config[8] = 1;
    // BAR0: 64-bit memory BAR; BAR1 holds the upper half (zero).
    config[0x10..0x14].copy_from_slice(&((BAR0 as u32) | 0x4).to_le_bytes());
    config[0x34] = 0x40;

    // An MSI-X capability first, which discovery must skip.
    let mut layout: Vec<(u8, Vec<u8>)> = vec![(0x40, vec![0x11, 0, 12, 0, 0, 0, 0, 0, 0, 0, 0, 0])];
    let mut position = 0x50u8;
    for &(cfg_type, offset, length) in &[
        (CAP_COMMON, 0x0u32, 0x38u32),
        (CAP_NOTIFY, 0x3000, 0x1000),
        (CAP_ISR, 0x1000, 0x4),
        (CAP_DEVICE, 0x2000, 0x40),
    ] {
        if !caps.contains(&cfg_type) {
            continue;
        }
        let cap_len = if cfg_type == CAP_NOTIFY { 20 } else { 16 };
        let mut bytes = vec![0x09, 0, cap_len, cfg_type, 0, 0, 0, 0];
        bytes.extend_from_slice(&offset.to_le_bytes());
        bytes.extend_from_slice(&length.to_le_bytes());
        if cfg_type == CAP_NOTIFY {
            bytes.extend_from_slice(&NOTIFY_MULTIPLIER.to_le_bytes());
        }
        layout.push((position, bytes));
        position += 0x18;
    }

    for i in 0..layout.len() {
        let next = layout.get(i + 1).map_or(0, |(pos, _)| *pos);
        let (pos, bytes) = &mut layout[i];
        bytes[1] = next;
        config[*pos as usize..*pos as usize + bytes.len()].copy_from_slice(bytes);
    }
    config
}

// ── Ring access ─────────────────────────────────────────────────────

fn used_idx(q: &SimQueue) -> u16 {
    unsafe { ptr::read_volatile((q.device + 2) as *const u16) }
}

fn set_avail_event(q: &SimQueue, idx: u16) {
    unsafe { ptr::write_volatile((q.device + 4 + 8 * q.size as u64) as *mut u16, idx) }
}

fn take_available(q: &mut SimQueue) -> Vec<Chain> {
    fence(Ordering::SeqCst);
    let avail_idx = unsafe { ptr::read_volatile((q.driver + 2) as *const u16) };
    fence(Ordering::SeqCst);

    let mut chains = Vec::new();
    while q.last_avail != avail_idx {
        let slot = (q.last_avail & (q.size - 1)) as u64;
        let head = unsafe { ptr::read_volatile((q.driver + 4 + 2 * slot) as *const u16) };

        let mut chain = Chain {
            head,
            indices: Vec::new(),
            buffers: Vec::new(),
        };
        let mut index = head;
        for _ in 0..q.size {
            let entry = q.desc + 16 * index as u64;
            let (addr, len, flags, next) = unsafe {
                (
                    ptr::read_volatile(entry as *const u64),
                    ptr::read_volatile((entry + 8) as *const u32),
                    ptr::read_volatile((entry + 12) as *const u16),
                    ptr::read_volatile((entry + 14) as *const u16),
                )
            };
            chain.indices.push(index);
            chain.buffers.push(SimBuffer { addr, len, flags });
            if flags & 1 == 0 {
                break;
            }
            index = next;
        }
        chains.push(chain);
        q.last_avail = q.last_avail.wrapping_add(1);
    }

    set_avail_event(q, q.last_avail);
    chains
}

fn post_used(q: &SimQueue, id: u32, len: u32) {
    let idx = used_idx(q);
    unsafe {
        let entry = q.device + 4 + 8 * (idx & (q.size - 1)) as u64;
        ptr::write_volatile(entry as *mut u32, id);
        ptr::write_volatile((entry + 4) as *mut u32, len);
        fence(Ordering::SeqCst);
        ptr::write_volatile((q.device + 2) as *mut u16, idx.wrapping_add(1));
    }
}

fn auto_complete(q: &mut SimQueue) {
    for chain in take_available(q) {
        let mut written = 0;
        let mut responded = false;
        for buffer in &chain.buffers {
            if buffer.is_write() {
                if !responded {
                    written += buffer.write(&q.response);
                    responded = true;
                }
            } else {
                q.received.push(buffer.read());
            }
        }
        post_used(q, chain.head as u32, written);
    }
}
