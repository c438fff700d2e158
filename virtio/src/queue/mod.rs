//! Split virtqueue engine.
//!
//! A [`VirtQueue`] owns one queue's descriptor table, available ring and
//! used ring, and moves buffer ownership between the driver and the
//! device:
//!
//! - [`VirtQueue::enqueue`] takes a chain of [`VirtToken`]s, writes one
//!   descriptor per token and publishes the chain head.
//! - [`VirtQueue::kick`] rings the device doorbell unless the device asked
//!   not to be notified.
//! - [`VirtQueue::dequeue`] takes a completion off the used ring and hands
//!   the chain's buffers back.
//!
//! Chains are always walked through a driver-private copy of the
//! descriptor table, never through the shared one the device can write.

mod policy;
mod ring;
mod xmit;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use log::{debug, info, trace, warn};

use crate::bus::Bus;
use crate::config;
use crate::error::{Result, VirtioError};
use crate::transport::{DeviceTransport, Features};

pub use policy::PolicyKind;
pub use ring::{AvailFlags, UsedElem, UsedFlags};
pub use xmit::XmitQueue;

use policy::AllocPolicy;
use ring::{AvailRing, DescriptorTable, UsedRing};

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescFlags: u16 {
        /// Chain continues at `next`.
        const NEXT = 1;
        /// Buffer is write-only for the device.
        const WRITE = 2;
        /// Buffer holds an indirect descriptor table.
        const INDIRECT = 4;
    }
}

/// One descriptor table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    pub flags: DescFlags,
    pub next: u16,
}

/// Ring position of a free-running index.
///
/// Queue sizes are powers of two, so this equals `idx % size`.
#[inline]
pub fn ring_slot(idx: u16, size: u16) -> u16 {
    debug_assert!(size.is_power_of_two());
    idx & (size - 1)
}

/// Event-index notification test.
///
/// True when `event` lies in the window `[old, new)` of indices published
/// since the last notification.
#[inline]
pub fn need_event(event: u16, new: u16, old: u16) -> bool {
    new.wrapping_sub(event).wrapping_sub(1) < new.wrapping_sub(old)
}

/// A buffer travelling through a queue.
///
/// The queue owns the buffer from `enqueue` until the matching `dequeue`.
pub struct VirtToken {
    flags: DescFlags,
    buffer: Box<[u8]>,
}

/// One request: the tokens of a single descriptor chain, in order.
pub type VirtTokens = Vec<VirtToken>;

impl VirtToken {
    /// `NEXT` and `INDIRECT` are managed by the queue and are dropped here.
    pub fn new(flags: DescFlags, buffer: impl Into<Box<[u8]>>) -> Self {
        VirtToken {
            flags: flags - (DescFlags::NEXT | DescFlags::INDIRECT),
            buffer: buffer.into(),
        }
    }

    /// A buffer the device reads.
    pub fn device_readable(buffer: impl Into<Box<[u8]>>) -> Self {
        Self::new(DescFlags::empty(), buffer)
    }

    /// A buffer the device fills.
    pub fn device_writable(buffer: impl Into<Box<[u8]>>) -> Self {
        Self::new(DescFlags::WRITE, buffer)
    }

    pub fn flags(&self) -> DescFlags {
        self.flags
    }

    pub fn is_write(&self) -> bool {
        self.flags.contains(DescFlags::WRITE)
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_buffer(self) -> Box<[u8]> {
        self.buffer
    }
}

impl fmt::Debug for VirtToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtToken")
            .field("flags", &self.flags)
            .field("buffer", &self.buffer.as_ptr())
            .field("len", &self.buffer.len())
            .finish()
    }
}

/// Returned by `enqueue` when the chain does not fit.
///
/// Nothing was written; the tokens come back untouched.
#[derive(Debug)]
pub struct QueueFull {
    tokens: VirtTokens,
    free: usize,
}

impl QueueFull {
    /// Descriptors the rejected request needed.
    pub fn needed(&self) -> usize {
        self.tokens.len()
    }

    /// Descriptors that were free at the time.
    pub fn free(&self) -> usize {
        self.free
    }

    pub fn into_tokens(self) -> VirtTokens {
        self.tokens
    }
}

impl From<QueueFull> for VirtioError {
    fn from(full: QueueFull) -> Self {
        VirtioError::NoFreeDescriptors {
            needed: full.needed(),
            free: full.free,
        }
    }
}

/// A completed request.
#[derive(Debug)]
pub struct Completion {
    /// The chain's tokens in submission order.
    pub tokens: VirtTokens,
    /// Bytes the device reports having written into the writable buffers.
    pub device_written: u32,
}

/// One split virtqueue.
///
/// The queue keeps a clone of the transport's bus and its own doorbell
/// address, so the transport stays free for `mark_driver_ok` and config
/// reads while queues are live.
pub struct VirtQueue<B: Bus> {
    bus: B,
    index: u16,
    size: u16,
    polling: bool,
    event_idx: bool,
    notify_addr: u64,

    desc: DescriptorTable,
    avail: AvailRing,
    used: UsedRing,

    /// Driver-private copy of every descriptor written.
    desc_shadow: Vec<Descriptor>,
    /// Buffers owned by in-flight descriptors.
    buffers: Vec<Option<Box<[u8]>>>,
    /// Chain length keyed by head index; 0 if not an in-flight head.
    chains: Vec<u16>,
    policy: AllocPolicy,

    avail_idx: u16,
    last_used_idx: u16,
    last_kicked: u16,
    in_flight: usize,
}

impl<B: Bus> VirtQueue<B> {
    /// Set up queue `index` on a transport in `FeaturesOkConfirmed`.
    pub fn new(
        transport: &mut DeviceTransport<B>,
        index: u16,
        polling: bool,
        kind: PolicyKind,
    ) -> Result<Self> {
        let size = transport.select_queue(index)?;
        if size == 0 || !size.is_power_of_two() || size > config::MAX_QUEUE_SIZE {
            return transport.fail(VirtioError::InvalidQueueSize { queue: index, size });
        }
        if kind == PolicyKind::InOrder && !transport.has_feature(Features::IN_ORDER) {
            warn!(
                "[VirtIO-Queue] Queue {} is in-order but IN_ORDER was not negotiated",
                index
            );
        }

        let rings = DescriptorTable::new(size).and_then(|desc| {
            let avail = AvailRing::new(size)?;
            let used = UsedRing::new(size)?;
            Ok((desc, avail, used))
        });
        let (desc, avail, used) = match rings {
            Ok(rings) => rings,
            Err(err) => return transport.fail(err),
        };

        let bus = transport.bus().clone();
        transport.set_queue_size(size)?;
        transport.set_queue_addresses(
            bus.dma_address(desc.as_ptr()),
            bus.dma_address(avail.as_ptr()),
            bus.dma_address(used.as_ptr()),
        )?;

        let vector = if polling { config::NO_VECTOR } else { index };
        if transport.set_queue_vector(vector)? != vector {
            return transport.fail(VirtioError::VectorRejected { queue: index, vector });
        }
        transport.disable_config_interrupt()?;

        let notify_off = transport.queue_notify_off()?;
        let notify_addr = match transport.notify_address(notify_off) {
            Ok(addr) => addr,
            Err(err) => return transport.fail(err),
        };
        transport.enable_queue()?;

        let event_idx = transport.has_feature(Features::EVENT_IDX);
        info!(
            "[VirtIO-Queue] Queue {} ready: size {}, {:?}, {}",
            index,
            size,
            kind,
            if polling { "polling" } else { "interrupts" }
        );

        Ok(VirtQueue {
            bus,
            index,
            size,
            polling,
            event_idx,
            notify_addr,
            desc,
            avail,
            used,
            desc_shadow: vec![Descriptor::default(); size as usize],
            buffers: (0..size).map(|_| None).collect(),
            chains: vec![0; size as usize],
            policy: AllocPolicy::new(kind, size),
            avail_idx: 0,
            last_used_idx: 0,
            last_kicked: 0,
            in_flight: 0,
        })
    }

    /// Chain `tokens` into descriptors and publish the chain head.
    ///
    /// Returns the head index. On `QueueFull` no queue state has changed.
    ///
    /// # Panics
    ///
    /// If `tokens` is empty or a buffer is longer than `u32::MAX`.
    #[must_use = "a full queue hands the tokens back"]
    pub fn enqueue(&mut self, tokens: VirtTokens) -> core::result::Result<u16, QueueFull> {
        assert!(!tokens.is_empty(), "enqueue of an empty chain");
        assert!(
            tokens.iter().all(|t| t.len() <= u32::MAX as usize),
            "buffer too large for a descriptor"
        );

        let Some(indices) = self.policy.claim(tokens.len()) else {
            let free = self.policy.free_slots();
            return Err(QueueFull { tokens, free });
        };

        let head = indices[0];
        let last = indices.len() - 1;
        for (i, token) in tokens.into_iter().enumerate() {
            let index = indices[i];
            let (flags, next) = if i < last {
                (token.flags | DescFlags::NEXT, indices[i + 1])
            } else {
                (token.flags, 0)
            };
            let desc = Descriptor {
                addr: self.bus.dma_address(token.buffer.as_ptr()),
                len: token.buffer.len() as u32,
                flags,
                next,
            };
            self.desc.write(index, &desc);
            self.desc_shadow[index as usize] = desc;
            self.buffers[index as usize] = Some(token.buffer);
        }
        self.chains[head as usize] = indices.len() as u16;

        self.avail.set_entry(self.avail_idx, head);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.avail.publish(self.avail_idx);
        self.in_flight += 1;
        trace!(
            "[VirtIO-Queue] Queue {}: chain {} ({} descriptors) at avail {}",
            self.index,
            head,
            indices.len(),
            self.avail_idx
        );
        Ok(head)
    }

    /// Notify the device of new buffers unless it suppressed notifications.
    ///
    /// Returns whether the doorbell was written.
    pub fn kick(&mut self) -> bool {
        fence(Ordering::SeqCst);
        let notify = if self.event_idx {
            need_event(self.used.avail_event(), self.avail_idx, self.last_kicked)
        } else {
            !self.used.flags().contains(UsedFlags::NO_NOTIFY)
        };
        self.last_kicked = self.avail_idx;

        if notify {
            trace!("[VirtIO-Queue] Queue {}: notify at avail {}", self.index, self.avail_idx);
            self.bus.write16(self.notify_addr, self.index);
        }
        notify
    }

    /// Whether the device has published a completion not yet dequeued.
    pub fn has_processed_used(&self) -> bool {
        self.last_used_idx != self.used.idx()
    }

    /// Take the next completion off the used ring.
    ///
    /// An out-of-range or unknown used id leaves the queue untouched and
    /// returns `InvalidUsedId`.
    ///
    /// # Panics
    ///
    /// If [`has_processed_used`](Self::has_processed_used) is false.
    pub fn dequeue(&mut self) -> Result<Completion> {
        assert!(self.has_processed_used(), "dequeue without a pending completion");

        let completion = match self.policy.kind() {
            PolicyKind::Unordered => self.dequeue_unordered()?,
            PolicyKind::InOrder => self.dequeue_in_order()?,
        };

        if self.event_idx && !self.avail.flags().contains(AvailFlags::NO_INTERRUPT) {
            self.avail.set_used_event(self.last_used_idx);
        }
        Ok(completion)
    }

    /// Ask the device not to interrupt for this queue's completions.
    pub fn suppress(&mut self) {
        self.avail.set_flags(self.avail.flags() | AvailFlags::NO_INTERRUPT);
    }

    /// Re-enable completion interrupts.
    pub fn unsuppress(&mut self) {
        self.avail.set_flags(self.avail.flags() - AvailFlags::NO_INTERRUPT);
        if self.event_idx {
            self.avail.set_used_event(self.last_used_idx);
        }
    }

    /// Descriptors currently free.
    pub fn free_slots(&self) -> usize {
        self.policy.free_slots()
    }

    /// Total descriptors (the queue size).
    pub fn capacity(&self) -> usize {
        self.size as usize
    }

    /// Chains enqueued but not yet dequeued.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.policy.kind()
    }

    pub fn queue_index(&self) -> u16 {
        self.index
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn event_idx(&self) -> bool {
        self.event_idx
    }

    /// Doorbell address this queue writes on `kick`.
    pub fn notify_address(&self) -> u64 {
        self.notify_addr
    }

    // ── Completion handling ──────────────────────────────────────────

    fn dequeue_unordered(&mut self) -> Result<Completion> {
        let elem = self.used.elem(self.last_used_idx);
        let head = self.in_flight_head(elem.id)?;

        let tokens = self.reclaim_chain(head, true);
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        trace!(
            "[VirtIO-Queue] Queue {}: chain {} done, {} bytes written",
            self.index,
            head,
            elem.len
        );
        Ok(Completion {
            tokens,
            device_written: elem.len,
        })
    }

    /// In-order completions may cover several chains with one used entry:
    /// the device may skip the records of earlier chains. Each call consumes
    /// the entry at the consumer position and reclaims everything from the
    /// oldest outstanding chain up to the one it names.
    fn dequeue_in_order(&mut self) -> Result<Completion> {
        let elem = self.used.elem(self.last_used_idx);
        let target = self.in_flight_head(elem.id)?;
        let Some(oldest) = self.policy.oldest() else {
            return Err(VirtioError::InvalidUsedId(elem.id));
        };

        // Walk the span first so a bogus id changes nothing.
        let mut heads = Vec::new();
        let mut head = oldest;
        loop {
            let len = self.chains[head as usize];
            if len == 0 || heads.len() >= self.in_flight {
                warn!(
                    "[VirtIO-Queue] Queue {}: used id {} is not reachable from {}",
                    self.index, elem.id, oldest
                );
                return Err(VirtioError::InvalidUsedId(elem.id));
            }
            heads.push(head);
            if head == target {
                break;
            }
            head = ring_slot(head.wrapping_add(len), self.size);
        }
        if heads.len() > 1 {
            debug!(
                "[VirtIO-Queue] Queue {}: catching up {} chains to head {}",
                self.index,
                heads.len(),
                target
            );
        }

        let mut reclaimed = 0u16;
        let mut tokens = Vec::new();
        for &head in &heads {
            reclaimed += self.chains[head as usize];
            let chain = self.reclaim_chain(head, false);
            // Skipped chains' buffers belong to the queue and are freed here.
            if head == target {
                tokens = chain;
            }
        }
        self.policy.release_span(reclaimed);
        self.last_used_idx = self.last_used_idx.wrapping_add(1);

        Ok(Completion {
            tokens,
            device_written: elem.len,
        })
    }

    fn in_flight_head(&self, id: u32) -> Result<u16> {
        if id < self.size as u32 && self.chains[id as usize] != 0 {
            Ok(id as u16)
        } else {
            warn!("[VirtIO-Queue] Queue {}: bogus used id {}", self.index, id);
            Err(VirtioError::InvalidUsedId(id))
        }
    }

    /// Take back the buffers of the chain at `head`, following the shadow
    /// table. `release` returns each index to an unordered free list.
    fn reclaim_chain(&mut self, head: u16, release: bool) -> VirtTokens {
        let len = core::mem::take(&mut self.chains[head as usize]);
        let mut tokens = Vec::with_capacity(len as usize);
        let mut index = head;
        for _ in 0..len {
            let desc = self.desc_shadow[index as usize];
            let buffer = self.buffers[index as usize].take().unwrap_or_default();
            tokens.push(VirtToken::new(desc.flags, buffer));
            if release {
                self.policy.release(index);
            }
            index = desc.next;
        }
        self.in_flight -= 1;
        tokens
    }
}

impl<B: Bus> fmt::Debug for VirtQueue<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtQueue")
            .field("index", &self.index)
            .field("size", &self.size)
            .field("policy", &self.policy.kind())
            .field("free", &self.policy.free_slots())
            .field("avail_idx", &self.avail_idx)
            .field("last_used_idx", &self.last_used_idx)
            .finish()
    }
}
