//! Dynamic channels of one link
//!
//! A local CID is reserved before the signalling exchange that opens the
//! channel completes, then either committed with the PSM and remote CID or
//! released.

use super::constants::FIRST_DYNAMIC_CID;
use super::fixed_channel_allocator::CloseCallback;
use super::psm::Psm;
use super::service::OpenTarget;
use crate::os::{BidiQueue, BidiQueueEnd, DeferredCallback};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

pub(crate) struct DynamicChannelState {
    pub cid: u16,
    pub remote_cid: u16,
    pub psm: Psm,
    pub local_initiated: bool,
    /// MTU the peer can receive
    pub remote_mtu: u16,
    /// Peer's Configuration Request answered
    pub incoming_configured: bool,
    /// Our Configuration Request accepted
    pub outgoing_configured: bool,
    /// Disconnection Request sent
    pub closing: bool,
    pub queue: BidiQueue<Vec<u8>>,
    pub link_end: BidiQueueEnd<Vec<u8>>,
    pub on_close: CloseCallback,
    /// Who hears about the channel once configuration finishes
    pub open_target: Option<OpenTarget>,
}

impl DynamicChannelState {
    pub fn is_configured(&self) -> bool {
        self.incoming_configured && self.outgoing_configured
    }
}

pub(crate) struct DynamicChannelAllocator {
    last_cid: u16,
    queue_depth: usize,
    default_mtu: u16,
    used: BTreeMap<u16, DynamicChannelState>,
    reserved: BTreeSet<u16>,
}

impl DynamicChannelAllocator {
    pub fn new(last_cid: u16, queue_depth: usize, default_mtu: u16) -> Self {
        Self {
            last_cid,
            queue_depth,
            default_mtu,
            used: BTreeMap::new(),
            reserved: BTreeSet::new(),
        }
    }

    /// Lowest free CID, or None when the range is exhausted
    pub fn reserve(&mut self) -> Option<u16> {
        let cid = (FIRST_DYNAMIC_CID..=self.last_cid)
            .find(|cid| !self.used.contains_key(cid) && !self.reserved.contains(cid))?;
        self.reserved.insert(cid);
        Some(cid)
    }

    pub fn release_reserved(&mut self, cid: u16) {
        assert!(
            self.reserved.remove(&cid),
            "CID 0x{:04x} released without being reserved",
            cid
        );
    }

    /// Reserve and commit in one step, for peer-initiated channels
    pub fn allocate(&mut self, psm: Psm, remote_cid: u16) -> Option<&mut DynamicChannelState> {
        let cid = self.reserve()?;
        Some(self.allocate_reserved(cid, psm, remote_cid, false))
    }

    pub fn allocate_reserved(
        &mut self,
        cid: u16,
        psm: Psm,
        remote_cid: u16,
        local_initiated: bool,
    ) -> &mut DynamicChannelState {
        assert!(
            self.reserved.remove(&cid),
            "CID 0x{:04x} committed without being reserved",
            cid
        );
        let queue = BidiQueue::new(&format!("dynamic-0x{:04x}", cid), self.queue_depth, self.queue_depth);
        let link_end = queue.down_end();
        self.used.entry(cid).or_insert(DynamicChannelState {
            cid,
            remote_cid,
            psm,
            local_initiated,
            remote_mtu: self.default_mtu,
            incoming_configured: false,
            outgoing_configured: false,
            closing: false,
            queue,
            link_end,
            on_close: Rc::new(RefCell::new(DeferredCallback::new())),
            open_target: None,
        })
    }

    /// Panics if `cid` is not an allocated channel.
    pub fn free(&mut self, cid: u16) -> DynamicChannelState {
        match self.used.remove(&cid) {
            Some(channel) => channel,
            None => panic!("freeing unknown dynamic channel 0x{:04x}", cid),
        }
    }

    pub fn get(&self, cid: u16) -> Option<&DynamicChannelState> {
        self.used.get(&cid)
    }

    pub fn get_mut(&mut self, cid: u16) -> Option<&mut DynamicChannelState> {
        self.used.get_mut(&cid)
    }

    pub fn find_by_remote_cid(&self, remote_cid: u16) -> Option<u16> {
        self.used
            .values()
            .find(|channel| channel.remote_cid == remote_cid)
            .map(|channel| channel.cid)
    }

    #[cfg(test)]
    pub fn is_reserved(&self, cid: u16) -> bool {
        self.reserved.contains(&cid)
    }

    /// Committed channels; reservations do not count
    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = DynamicChannelState> {
        self.reserved.clear();
        std::mem::take(&mut self.used).into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2cap::constants::*;

    #[test]
    fn test_reserve_then_commit() {
        let mut allocator = DynamicChannelAllocator::new(LAST_CLASSIC_DYNAMIC_CID, 4, DEFAULT_CLASSIC_MTU);
        let first = allocator.reserve().unwrap();
        let second = allocator.reserve().unwrap();
        assert_eq!(first, 0x0040);
        assert_eq!(second, 0x0041);
        assert!(allocator.is_reserved(first));
        assert_eq!(allocator.len(), 0);

        let channel = allocator.allocate_reserved(first, Psm::SDP, 0x0070, true);
        assert_eq!(channel.remote_mtu, DEFAULT_CLASSIC_MTU);
        assert!(channel.local_initiated);
        assert_eq!(allocator.len(), 1);
        assert_eq!(allocator.find_by_remote_cid(0x0070), Some(first));

        // A released reservation is handed out again
        allocator.release_reserved(second);
        assert_eq!(allocator.reserve(), Some(second));
    }

    #[test]
    fn test_le_range_exhaustion() {
        let mut allocator = DynamicChannelAllocator::new(LAST_LE_DYNAMIC_CID, 4, DEFAULT_LE_MTU);
        for remote in 0..0x40 {
            assert!(allocator.allocate(Psm(0x0080), 0x0100 + remote).is_some());
        }
        assert_eq!(allocator.len(), 0x40);
        assert!(allocator.allocate(Psm(0x0080), 0x0200).is_none());

        let freed = allocator.free(0x0050);
        assert_eq!(freed.remote_cid, 0x0110);
        assert_eq!(allocator.reserve(), Some(0x0050));
    }

    #[test]
    #[should_panic(expected = "freeing unknown dynamic channel")]
    fn test_free_unknown_panics() {
        let mut allocator = DynamicChannelAllocator::new(LAST_CLASSIC_DYNAMIC_CID, 4, DEFAULT_CLASSIC_MTU);
        allocator.free(0x0040);
    }
}
