//! Traffic held back until both links are paired.

use crate::{l2cap::Frame, link::LinkId};
use std::collections::VecDeque;

/// A frame waiting to be forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    /// Arrival order across both links.
    pub seq: u64,
    /// The link the frame was received on.
    pub source: LinkId,
    pub frame: Frame,
}

/// Frames received on one link before the relay became active.
#[derive(Debug)]
pub struct PendingQueue {
    source: LinkId,
    entries: VecDeque<Pending>,
}

impl PendingQueue {
    /// Creates an empty queue for frames received on `source`.
    pub fn new(source: LinkId) -> Self {
        Self {
            source,
            entries: VecDeque::new(),
        }
    }

    pub fn source(&self) -> LinkId {
        self.source
    }

    /// Appends a frame. `seq` must be larger than that of any frame pushed before.
    pub fn push(&mut self, seq: u64, frame: Frame) {
        debug_assert!(self.entries.back().map_or(true, |last| last.seq < seq));
        self.entries.push_back(Pending {
            seq,
            source: self.source,
            frame,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops all queued frames.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn pop_front(&mut self) -> Option<Pending> {
        self.entries.pop_front()
    }

    fn front_seq(&self) -> Option<u64> {
        self.entries.front().map(|p| p.seq)
    }
}

/// Empties both queues, returning their frames merged in arrival order.
pub fn drain_in_order(a: &mut PendingQueue, b: &mut PendingQueue) -> Vec<Pending> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    loop {
        let next = match (a.front_seq(), b.front_seq()) {
            (Some(x), Some(y)) if x < y => a.pop_front(),
            (Some(_), Some(_)) => b.pop_front(),
            (Some(_), None) => a.pop_front(),
            (None, Some(_)) => b.pop_front(),
            (None, None) => break,
        };
        out.extend(next);
    }
    out
}
