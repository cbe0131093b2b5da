//! Service registries and the callers waiting on channel opens

use super::channel::{DynamicChannel, FixedChannel};
use super::link_manager::{post_to_manager, LinkManagerImpl};
use super::psm::Psm;
use super::types::{ConnectionResult, RegistrationResult, SecurityPolicy};
use crate::os::Handler;
use log::{error, warn};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Services keyed by CID or PSM
pub(crate) struct ServiceRegistry<R> {
    services: BTreeMap<u16, R>,
}

impl<R> ServiceRegistry<R> {
    pub fn new() -> Self {
        Self {
            services: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, id: u16, valid: bool, record: R) -> RegistrationResult {
        if !valid {
            return RegistrationResult::FailInvalidService;
        }
        if self.services.contains_key(&id) {
            return RegistrationResult::FailDuplicateService;
        }
        self.services.insert(id, record);
        RegistrationResult::Success
    }

    pub fn unregister(&mut self, id: u16) -> Option<R> {
        self.services.remove(&id)
    }

    pub fn get(&self, id: u16) -> Option<&R> {
        self.services.get(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.services.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

pub(crate) struct FixedServiceRecord {
    handler: Handler,
    on_open: Rc<dyn Fn(FixedChannel)>,
}

impl FixedServiceRecord {
    pub fn new<O: Fn(FixedChannel) + 'static>(handler: &Handler, on_open: O) -> Self {
        Self {
            handler: handler.clone(),
            on_open: Rc::new(on_open),
        }
    }

    pub fn notify_open(&self, channel: FixedChannel) {
        let on_open = self.on_open.clone();
        self.handler.post(move || on_open(channel));
    }
}

pub(crate) struct DynamicServiceRecord {
    pub security_policy: SecurityPolicy,
    handler: Handler,
    on_open: Rc<dyn Fn(DynamicChannel)>,
}

impl DynamicServiceRecord {
    pub fn new<O: Fn(DynamicChannel) + 'static>(
        security_policy: SecurityPolicy,
        handler: &Handler,
        on_open: O,
    ) -> Self {
        Self {
            security_policy,
            handler: handler.clone(),
            on_open: Rc::new(on_open),
        }
    }

    pub fn open_target(&self) -> OpenTarget {
        OpenTarget::Service {
            handler: self.handler.clone(),
            on_open: self.on_open.clone(),
        }
    }
}

/// Registered services of one transport, shared by all of its links
pub(crate) struct Services {
    pub fixed: ServiceRegistry<FixedServiceRecord>,
    pub dynamic: ServiceRegistry<DynamicServiceRecord>,
}

impl Services {
    pub fn new() -> Self {
        Self {
            fixed: ServiceRegistry::new(),
            dynamic: ServiceRegistry::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fixed.is_empty() && self.dynamic.is_empty()
    }

    pub fn notify_fixed_channel_open(&self, channel: FixedChannel) {
        match self.fixed.get(channel.cid()) {
            Some(record) => record.notify_open(channel),
            None => warn!("No service for fixed channel 0x{:04x}", channel.cid()),
        }
    }
}

/// Caller of `connect_services` waiting for the link
pub(crate) struct PendingFixedConnection {
    handler: Handler,
    on_fail: Box<dyn FnOnce(ConnectionResult)>,
}

impl PendingFixedConnection {
    pub fn new<F: FnOnce(ConnectionResult) + 'static>(handler: &Handler, on_fail: F) -> Self {
        Self {
            handler: handler.clone(),
            on_fail: Box::new(on_fail),
        }
    }

    pub fn fail(self, result: ConnectionResult) {
        let on_fail = self.on_fail;
        self.handler.post(move || on_fail(result));
    }
}

/// Caller of `connect_channel` waiting for a dynamic channel
pub(crate) struct PendingDynamicConnection {
    pub psm: Psm,
    pub security_policy: SecurityPolicy,
    handler: Handler,
    on_open: Box<dyn FnOnce(DynamicChannel)>,
    on_fail: Box<dyn FnOnce(ConnectionResult)>,
}

impl PendingDynamicConnection {
    pub fn new<O, F>(psm: Psm, security_policy: SecurityPolicy, handler: &Handler, on_open: O, on_fail: F) -> Self
    where
        O: FnOnce(DynamicChannel) + 'static,
        F: FnOnce(ConnectionResult) + 'static,
    {
        Self {
            psm,
            security_policy,
            handler: handler.clone(),
            on_open: Box::new(on_open),
            on_fail: Box::new(on_fail),
        }
    }

    pub fn open(self, channel: DynamicChannel) {
        let on_open = self.on_open;
        self.handler.post(move || on_open(channel));
    }

    pub fn fail(self, result: ConnectionResult) {
        let on_fail = self.on_fail;
        self.handler.post(move || on_fail(result));
    }
}

impl fmt::Debug for PendingDynamicConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDynamicConnection")
            .field("psm", &self.psm)
            .field("security_policy", &self.security_policy)
            .finish()
    }
}

/// Who is told when a dynamic channel finishes configuring
pub(crate) enum OpenTarget {
    /// The local caller that asked for the channel
    Requester(PendingDynamicConnection),
    /// The registered service a peer connected to
    Service {
        handler: Handler,
        on_open: Rc<dyn Fn(DynamicChannel)>,
    },
}

impl OpenTarget {
    pub fn open(self, channel: DynamicChannel) {
        match self {
            OpenTarget::Requester(pending) => pending.open(channel),
            OpenTarget::Service { handler, on_open } => handler.post(move || on_open(channel)),
        }
    }

    /// Only a local requester hears about failures
    pub fn fail(self, result: ConnectionResult) {
        if let OpenTarget::Requester(pending) = self {
            pending.fail(result);
        }
    }
}

/// Handle to a registered fixed channel service
pub struct FixedChannelService {
    cid: u16,
    manager: Weak<RefCell<LinkManagerImpl>>,
    manager_handler: Handler,
}

impl FixedChannelService {
    pub(crate) fn new(cid: u16, manager: Weak<RefCell<LinkManagerImpl>>, manager_handler: Handler) -> Self {
        Self {
            cid,
            manager,
            manager_handler,
        }
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    /// Existing channels stay open; new links no longer get this channel.
    pub fn unregister<F: FnOnce() + 'static>(&self, handler: &Handler, on_unregistered: F) {
        let cid = self.cid;
        let handler = handler.clone();
        post_to_manager(&self.manager, &self.manager_handler, move |manager| {
            if manager.unregister_fixed_service(cid) {
                handler.post(on_unregistered);
            } else {
                error!("Unregistering unknown fixed service 0x{:04x}", cid);
            }
        });
    }
}

impl fmt::Debug for FixedChannelService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedChannelService(0x{:04x})", self.cid)
    }
}

/// Handle to a registered dynamic channel service
pub struct DynamicChannelService {
    psm: Psm,
    manager: Weak<RefCell<LinkManagerImpl>>,
    manager_handler: Handler,
}

impl DynamicChannelService {
    pub(crate) fn new(psm: Psm, manager: Weak<RefCell<LinkManagerImpl>>, manager_handler: Handler) -> Self {
        Self {
            psm,
            manager,
            manager_handler,
        }
    }

    pub fn psm(&self) -> Psm {
        self.psm
    }

    pub fn unregister<F: FnOnce() + 'static>(&self, handler: &Handler, on_unregistered: F) {
        let psm = self.psm;
        let handler = handler.clone();
        post_to_manager(&self.manager, &self.manager_handler, move |manager| {
            if manager.unregister_dynamic_service(psm) {
                handler.post(on_unregistered);
            } else {
                error!("Unregistering unknown dynamic service {}", psm);
            }
        });
    }
}

impl fmt::Debug for DynamicChannelService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DynamicChannelService({})", self.psm)
    }
}
