//! Channel handles given to services and connection requesters
//!
//! A handle does not own its channel. The link keeps the channel state and
//! every operation on the handle is posted to the L2CAP handler.

use super::fixed_channel_allocator::CloseCallback;
use super::link::LinkHandle;
use super::psm::Psm;
use crate::hci::{AddressWithType, ErrorCode};
use crate::os::{BidiQueueEnd, Handler};
use std::fmt;

/// An open fixed channel.
///
/// The channel does not keep its link alive until [`acquire`](Self::acquire)
/// is called.
#[derive(Clone)]
pub struct FixedChannel {
    cid: u16,
    device: AddressWithType,
    queue_end: BidiQueueEnd<Vec<u8>>,
    link: LinkHandle,
    on_close: CloseCallback,
}

impl FixedChannel {
    pub(crate) fn new(
        cid: u16,
        device: AddressWithType,
        queue_end: BidiQueueEnd<Vec<u8>>,
        link: LinkHandle,
        on_close: CloseCallback,
    ) -> Self {
        Self {
            cid,
            device,
            queue_end,
            link,
            on_close,
        }
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    pub fn device(&self) -> AddressWithType {
        self.device
    }

    /// Enqueue SDUs to send, dequeue received SDUs
    pub fn queue_end(&self) -> BidiQueueEnd<Vec<u8>> {
        self.queue_end.clone()
    }

    pub fn acquire(&self) {
        let cid = self.cid;
        self.link.post(move |link, _| link.acquire_fixed_channel(cid));
    }

    pub fn release(&self) {
        let cid = self.cid;
        self.link.post(move |link, _| link.release_fixed_channel(cid));
    }

    /// Runs once with the reason the channel closed, even if it already has.
    pub fn register_on_close_callback<F: FnOnce(ErrorCode) + 'static>(&self, handler: &Handler, callback: F) {
        register_on_close(&self.link, &self.on_close, handler, callback);
    }
}

impl fmt::Debug for FixedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedChannel")
            .field("cid", &format_args!("0x{:04x}", self.cid))
            .field("device", &self.device)
            .finish()
    }
}

/// An open, configured dynamic channel.
///
/// Dynamic channels always count toward the link's reference count.
#[derive(Clone)]
pub struct DynamicChannel {
    cid: u16,
    remote_cid: u16,
    psm: Psm,
    mtu: u16,
    device: AddressWithType,
    queue_end: BidiQueueEnd<Vec<u8>>,
    link: LinkHandle,
    on_close: CloseCallback,
}

impl DynamicChannel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cid: u16,
        remote_cid: u16,
        psm: Psm,
        mtu: u16,
        device: AddressWithType,
        queue_end: BidiQueueEnd<Vec<u8>>,
        link: LinkHandle,
        on_close: CloseCallback,
    ) -> Self {
        Self {
            cid,
            remote_cid,
            psm,
            mtu,
            device,
            queue_end,
            link,
            on_close,
        }
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    pub fn remote_cid(&self) -> u16 {
        self.remote_cid
    }

    pub fn psm(&self) -> Psm {
        self.psm
    }

    /// Largest SDU the peer accepts
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn device(&self) -> AddressWithType {
        self.device
    }

    pub fn queue_end(&self) -> BidiQueueEnd<Vec<u8>> {
        self.queue_end.clone()
    }

    /// Start a Disconnection Request; the close callback fires on the response.
    pub fn close(&self) {
        let cid = self.cid;
        self.link.post(move |link, _| link.close_dynamic_channel(cid));
    }

    pub fn register_on_close_callback<F: FnOnce(ErrorCode) + 'static>(&self, handler: &Handler, callback: F) {
        register_on_close(&self.link, &self.on_close, handler, callback);
    }
}

impl fmt::Debug for DynamicChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicChannel")
            .field("cid", &format_args!("0x{:04x}", self.cid))
            .field("remote_cid", &format_args!("0x{:04x}", self.remote_cid))
            .field("psm", &self.psm)
            .field("device", &self.device)
            .finish()
    }
}

fn register_on_close<F: FnOnce(ErrorCode) + 'static>(
    link: &LinkHandle,
    on_close: &CloseCallback,
    handler: &Handler,
    callback: F,
) {
    let on_close = on_close.clone();
    let handler = handler.clone();
    link.handler()
        .post(move || on_close.borrow_mut().register(&handler, callback));
}
