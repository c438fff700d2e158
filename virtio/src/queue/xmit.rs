//! Policy-agnostic queue for device-class drivers.

use crate::bus::Bus;
use crate::error::Result;
use crate::transport::{DeviceTransport, Features};

use super::{Completion, PolicyKind, QueueFull, VirtQueue, VirtTokens};

/// A [`VirtQueue`] whose allocation policy follows the negotiated
/// `VIRTIO_F_IN_ORDER` bit.
#[derive(Debug)]
pub struct XmitQueue<B: Bus> {
    queue: VirtQueue<B>,
}

impl<B: Bus> XmitQueue<B> {
    pub fn new(transport: &mut DeviceTransport<B>, index: u16, polling: bool) -> Result<Self> {
        let kind = if transport.has_feature(Features::IN_ORDER) {
            PolicyKind::InOrder
        } else {
            PolicyKind::Unordered
        };
        Ok(XmitQueue {
            queue: VirtQueue::new(transport, index, polling, kind)?,
        })
    }

    #[must_use = "a full queue hands the tokens back"]
    pub fn enqueue(&mut self, tokens: VirtTokens) -> core::result::Result<u16, QueueFull> {
        self.queue.enqueue(tokens)
    }

    pub fn dequeue(&mut self) -> Result<Completion> {
        self.queue.dequeue()
    }

    pub fn kick(&mut self) -> bool {
        self.queue.kick()
    }

    pub fn has_processed_used(&self) -> bool {
        self.queue.has_processed_used()
    }

    pub fn suppress(&mut self) {
        self.queue.suppress()
    }

    pub fn unsuppress(&mut self) {
        self.queue.unsuppress()
    }

    pub fn free_slots(&self) -> usize {
        self.queue.free_slots()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn policy_kind(&self) -> PolicyKind {
        self.queue.policy_kind()
    }

    pub fn queue(&self) -> &VirtQueue<B> {
        &self.queue
    }
}
