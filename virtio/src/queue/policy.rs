//! Descriptor allocation policies.
//!
//! A queue hands out descriptor indices under one of two policies, fixed
//! at construction:
//!
//! - **Unordered**: a LIFO free list. Any completed chain returns its
//!   indices individually.
//! - **InOrder**: chains occupy consecutive indices (wrapping by mask) and
//!   are reclaimed as a contiguous span from the oldest outstanding chain.
//!   Only valid when the device negotiated `VIRTIO_F_IN_ORDER`.

use alloc::vec::Vec;

use super::ring_slot;

/// Which allocation discipline a queue uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Unordered,
    InOrder,
}

#[derive(Debug)]
pub(crate) struct UnorderedState {
    free: Vec<u16>,
}

#[derive(Debug)]
pub(crate) struct InOrderState {
    size: u16,
    /// Next index to hand out (free-running, masked on use).
    next_free: u16,
    free_count: u16,
    /// First index of the oldest outstanding chain.
    oldest: u16,
}

#[derive(Debug)]
pub(crate) enum AllocPolicy {
    Unordered(UnorderedState),
    InOrder(InOrderState),
}

impl AllocPolicy {
    pub(crate) fn new(kind: PolicyKind, size: u16) -> Self {
        match kind {
            // Reversed so that `pop` hands out 0, 1, 2, ... on a fresh queue.
            PolicyKind::Unordered => AllocPolicy::Unordered(UnorderedState {
                free: (0..size).rev().collect(),
            }),
            PolicyKind::InOrder => AllocPolicy::InOrder(InOrderState {
                size,
                next_free: 0,
                free_count: size,
                oldest: 0,
            }),
        }
    }

    pub(crate) fn kind(&self) -> PolicyKind {
        match self {
            AllocPolicy::Unordered(_) => PolicyKind::Unordered,
            AllocPolicy::InOrder(_) => PolicyKind::InOrder,
        }
    }

    pub(crate) fn free_slots(&self) -> usize {
        match self {
            AllocPolicy::Unordered(state) => state.free.len(),
            AllocPolicy::InOrder(state) => state.free_count as usize,
        }
    }

    /// Claim `n` descriptor indices in chain order.
    ///
    /// Returns `None` without touching any state when fewer than `n` are
    /// free.
    pub(crate) fn claim(&mut self, n: usize) -> Option<Vec<u16>> {
        if n == 0 || n > self.free_slots() {
            return None;
        }
        match self {
            AllocPolicy::Unordered(state) => {
                let at = state.free.len() - n;
                let mut claimed = state.free.split_off(at);
                claimed.reverse();
                Some(claimed)
            }
            AllocPolicy::InOrder(state) => {
                let claimed = (0..n as u16)
                    .map(|i| ring_slot(state.next_free.wrapping_add(i), state.size))
                    .collect();
                state.next_free = state.next_free.wrapping_add(n as u16);
                state.free_count -= n as u16;
                Some(claimed)
            }
        }
    }

    /// First index of the oldest outstanding chain (in-order only).
    pub(crate) fn oldest(&self) -> Option<u16> {
        match self {
            AllocPolicy::Unordered(_) => None,
            AllocPolicy::InOrder(state) => Some(ring_slot(state.oldest, state.size)),
        }
    }

    /// Return one index to the free list (unordered only).
    pub(crate) fn release(&mut self, index: u16) {
        match self {
            AllocPolicy::Unordered(state) => state.free.push(index),
            AllocPolicy::InOrder(_) => unreachable!("in-order descriptors are released by span"),
        }
    }

    /// Reclaim `count` descriptors starting at the oldest chain (in-order only).
    pub(crate) fn release_span(&mut self, count: u16) {
        match self {
            AllocPolicy::Unordered(_) => unreachable!("unordered descriptors are released singly"),
            AllocPolicy::InOrder(state) => {
                debug_assert!(state.free_count as u32 + count as u32 <= state.size as u32);
                state.oldest = state.oldest.wrapping_add(count);
                state.free_count += count;
            }
        }
    }
}
