//! Fixed channels of one link

use super::types::Transport;
use crate::hci::ErrorCode;
use crate::os::{BidiQueue, BidiQueueEnd, DeferredCallback};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

pub(crate) type CloseCallback = Rc<RefCell<DeferredCallback<ErrorCode>>>;

pub(crate) struct FixedChannelState {
    pub cid: u16,
    pub queue: BidiQueue<Vec<u8>>,
    /// Link side of `queue`
    pub link_end: BidiQueueEnd<Vec<u8>>,
    /// Only acquired channels keep the link alive
    pub acquired: bool,
    pub on_close: CloseCallback,
}

pub(crate) struct FixedChannelAllocator {
    transport: Transport,
    queue_depth: usize,
    channels: BTreeMap<u16, FixedChannelState>,
}

impl FixedChannelAllocator {
    pub fn new(transport: Transport, queue_depth: usize) -> Self {
        Self {
            transport,
            queue_depth,
            channels: BTreeMap::new(),
        }
    }

    /// Panics on a CID outside the fixed range or one already allocated.
    pub fn allocate(&mut self, cid: u16) -> &mut FixedChannelState {
        assert!(
            self.transport.is_valid_fixed_service_cid(cid),
            "CID 0x{:04x} is not a fixed service channel",
            cid
        );
        assert!(
            !self.channels.contains_key(&cid),
            "fixed channel 0x{:04x} allocated twice",
            cid
        );
        let queue = BidiQueue::new(&format!("fixed-0x{:04x}", cid), self.queue_depth, self.queue_depth);
        let link_end = queue.down_end();
        self.channels.entry(cid).or_insert(FixedChannelState {
            cid,
            queue,
            link_end,
            acquired: false,
            on_close: Rc::new(RefCell::new(DeferredCallback::new())),
        })
    }

    pub fn is_allocated(&self, cid: u16) -> bool {
        self.channels.contains_key(&cid)
    }

    pub fn get(&self, cid: u16) -> Option<&FixedChannelState> {
        self.channels.get(&cid)
    }

    pub fn get_mut(&mut self, cid: u16) -> Option<&mut FixedChannelState> {
        self.channels.get_mut(&cid)
    }

    pub fn acquired_count(&self) -> usize {
        self.channels.values().filter(|channel| channel.acquired).count()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Remove every channel, for link teardown
    pub fn drain(&mut self) -> impl Iterator<Item = FixedChannelState> {
        std::mem::take(&mut self.channels).into_values()
    }
}
