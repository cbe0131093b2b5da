//! Links of one transport, the services registered on it, and callers
//! waiting for a link to come up

use super::link::{Link, LinkHandle};
use super::psm::Psm;
use super::service::{
    DynamicServiceRecord, FixedServiceRecord, PendingDynamicConnection, PendingFixedConnection, Services,
};
use super::constants::CONNECTION_PSM_NOT_SUPPORTED;
use super::types::{ConnectionResult, ConnectionResultCode, RegistrationResult, Transport};
use crate::config::L2capConfig;
use crate::hci::{
    AclConnection, AclManager, Address, AddressWithType, ConnectionCallbacks, ErrorCode, LeConnectionCallbacks,
};
use crate::os::Handler;
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

/// Post `f` to run against the manager on its handler
pub(crate) fn post_to_manager<F: FnOnce(&mut LinkManagerImpl) + 'static>(
    manager: &Weak<RefCell<LinkManagerImpl>>,
    handler: &Handler,
    f: F,
) {
    let manager = manager.clone();
    handler.post(move || {
        if let Some(manager) = manager.upgrade() {
            f(&mut manager.borrow_mut());
        }
    });
}

/// Requests queued while the ACL connection is being created
#[derive(Default)]
struct PendingLink {
    fixed: Vec<PendingFixedConnection>,
    dynamic: Vec<PendingDynamicConnection>,
}

#[derive(Clone)]
pub(crate) struct LinkManager {
    transport: Transport,
    inner: Rc<RefCell<LinkManagerImpl>>,
    handler: Handler,
}

impl LinkManager {
    pub fn new(transport: Transport, acl: &AclManager, handler: &Handler, config: L2capConfig) -> Self {
        let inner = Rc::new_cyclic(|weak_self| {
            RefCell::new(LinkManagerImpl {
                transport,
                acl: acl.clone(),
                handler: handler.clone(),
                weak_self: weak_self.clone(),
                config,
                links: BTreeMap::new(),
                pending_links: BTreeMap::new(),
                services: Services::new(),
            })
        });

        match transport {
            Transport::Classic => {
                let callbacks: Weak<dyn ConnectionCallbacks> = Rc::downgrade(&inner) as _;
                acl.register_callbacks(callbacks, handler);
                // Nothing is registered yet, so nothing to accept
                acl.set_accept_incoming_connections(false);
            }
            Transport::Le => {
                let callbacks: Weak<dyn LeConnectionCallbacks> = Rc::downgrade(&inner) as _;
                acl.register_le_callbacks(callbacks, handler);
            }
        }

        Self {
            transport,
            inner,
            handler: handler.clone(),
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn weak(&self) -> Weak<RefCell<LinkManagerImpl>> {
        Rc::downgrade(&self.inner)
    }

    pub fn post<F: FnOnce(&mut LinkManagerImpl) + 'static>(&self, f: F) {
        post_to_manager(&self.weak(), &self.handler, f);
    }

    #[cfg(test)]
    pub fn link_count(&self) -> usize {
        self.inner.borrow().links.len()
    }
}

pub(crate) struct LinkManagerImpl {
    transport: Transport,
    acl: AclManager,
    handler: Handler,
    weak_self: Weak<RefCell<LinkManagerImpl>>,
    config: L2capConfig,
    links: BTreeMap<AddressWithType, Link>,
    pending_links: BTreeMap<AddressWithType, PendingLink>,
    services: Services,
}

impl LinkManagerImpl {
    pub fn weak_self(&self) -> Weak<RefCell<LinkManagerImpl>> {
        self.weak_self.clone()
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Classic links are keyed by address alone
    fn link_key(&self, device: AddressWithType) -> AddressWithType {
        match self.transport {
            Transport::Classic => AddressWithType::classic(device.address),
            Transport::Le => device,
        }
    }

    pub fn with_link<F: FnOnce(&mut Link, &Services)>(&mut self, address: AddressWithType, f: F) {
        match self.links.get_mut(&address) {
            Some(link) => f(link, &self.services),
            None => debug!("Link to {} is gone", address),
        }
    }

    // ---- Services ----

    pub fn register_fixed_service(&mut self, cid: u16, record: FixedServiceRecord) -> RegistrationResult {
        let was_empty = self.services.is_empty();
        let valid = self.transport.is_valid_fixed_service_cid(cid);
        let result = self.services.fixed.register(cid, valid, record);
        match result {
            RegistrationResult::Success => {
                info!("Registered {} fixed service 0x{:04x}", self.transport, cid);
                self.sync_incoming_acceptance(was_empty);
            }
            _ => warn!("{} fixed service 0x{:04x} not registered: {:?}", self.transport, cid, result),
        }
        result
    }

    pub fn unregister_fixed_service(&mut self, cid: u16) -> bool {
        let was_empty = self.services.is_empty();
        let removed = self.services.fixed.unregister(cid).is_some();
        self.sync_incoming_acceptance(was_empty);
        removed
    }

    pub fn register_dynamic_service(&mut self, psm: Psm, record: DynamicServiceRecord) -> RegistrationResult {
        let was_empty = self.services.is_empty();
        let valid = self.transport.is_valid_psm(psm);
        let result = self.services.dynamic.register(psm.value(), valid, record);
        match result {
            RegistrationResult::Success => {
                info!("Registered {} service {}", self.transport, psm);
                self.sync_incoming_acceptance(was_empty);
            }
            _ => warn!("{} service {} not registered: {:?}", self.transport, psm, result),
        }
        result
    }

    pub fn unregister_dynamic_service(&mut self, psm: Psm) -> bool {
        let was_empty = self.services.is_empty();
        let removed = self.services.dynamic.unregister(psm.value()).is_some();
        self.sync_incoming_acceptance(was_empty);
        removed
    }

    /// Classic ACL only accepts incoming connections while some service exists
    fn sync_incoming_acceptance(&self, was_empty: bool) {
        if self.transport != Transport::Classic {
            return;
        }
        let empty = self.services.is_empty();
        if empty != was_empty {
            self.acl.set_accept_incoming_connections(!empty);
        }
    }

    // ---- Connecting ----

    pub fn connect_fixed_channel_services(&mut self, device: AddressWithType, pending: PendingFixedConnection) {
        let address = self.link_key(device);
        if self.services.fixed.is_empty() {
            pending.fail(ConnectionResult::new(ConnectionResultCode::FailNoServiceRegistered));
            return;
        }
        if self.links.contains_key(&address) {
            if self.allocate_registered_fixed_channels(address) == 0 {
                pending.fail(ConnectionResult::new(ConnectionResultCode::FailAllServicesHaveChannel));
            }
            return;
        }
        self.pending_link(address).fixed.push(pending);
    }

    pub fn connect_dynamic_channel(&mut self, device: AddressWithType, pending: PendingDynamicConnection) {
        if !self.transport.is_valid_psm(pending.psm) {
            warn!("{} is not a valid {} PSM", pending.psm, self.transport);
            pending.fail(ConnectionResult::l2cap_error(CONNECTION_PSM_NOT_SUPPORTED));
            return;
        }
        let address = self.link_key(device);
        if let Some(link) = self.links.get_mut(&address) {
            link.send_connection_request(pending);
            return;
        }
        self.pending_link(address).dynamic.push(pending);
    }

    /// Waiters for `address`, issuing the ACL connect on first use
    fn pending_link(&mut self, address: AddressWithType) -> &mut PendingLink {
        if !self.pending_links.contains_key(&address) {
            debug!("Connecting {} link to {}", self.transport, address);
            match self.transport {
                Transport::Classic => self.acl.create_connection(address.address),
                Transport::Le => self.acl.create_le_connection(address),
            }
        }
        self.pending_links.entry(address).or_default()
    }

    /// Give every registered fixed service without a channel one on `address`
    fn allocate_registered_fixed_channels(&mut self, address: AddressWithType) -> usize {
        let Some(link) = self.links.get_mut(&address) else {
            return 0;
        };
        let mut allocated = 0;
        for cid in self.services.fixed.ids() {
            if !link.is_fixed_channel_allocated(cid) {
                link.allocate_fixed_channel(cid, &self.services);
                allocated += 1;
            }
        }
        allocated
    }

    fn on_link_connected(&mut self, connection: AclConnection) {
        let address = self.link_key(connection.address_with_type());
        if self.links.contains_key(&address) {
            error!("Second {} link to {}, dropping it", self.transport, address);
            let connection = Rc::new(connection);
            let finished = connection.clone();
            connection.register_disconnect_callback(&self.handler, move |_| finished.finish());
            connection.disconnect(ErrorCode::REMOTE_USER_TERMINATED_CONNECTION);
            return;
        }
        info!("{} link to {} up", self.transport, address);
        let handle = LinkHandle::new(self.weak_self.clone(), self.handler.clone(), address);
        let link = Link::new(self.transport, connection, handle, &self.config);
        self.links.insert(address, link);
        self.allocate_registered_fixed_channels(address);

        // Fixed callers were served by the allocation above
        let Some(pending) = self.pending_links.remove(&address) else {
            return;
        };
        if let Some(link) = self.links.get_mut(&address) {
            for request in pending.dynamic {
                link.send_connection_request(request);
            }
        }
    }

    fn on_link_connect_failed(&mut self, address: AddressWithType, reason: ErrorCode) {
        let Some(pending) = self.pending_links.remove(&address) else {
            debug!("No one waiting on failed link to {}", address);
            return;
        };
        info!("{} link to {} failed: {}", self.transport, address, reason);
        let result = ConnectionResult::hci_error(reason);
        for request in pending.fixed {
            request.fail(result);
        }
        for request in pending.dynamic {
            request.fail(result);
        }
    }

    pub fn on_link_disconnected(&mut self, address: AddressWithType, reason: ErrorCode) {
        match self.links.remove(&address) {
            Some(mut link) => link.on_acl_disconnect(reason),
            None => warn!("Disconnect for unknown link {}", address),
        }
    }
}

impl ConnectionCallbacks for RefCell<LinkManagerImpl> {
    fn on_connect_success(&self, connection: AclConnection) {
        self.borrow_mut().on_link_connected(connection);
    }

    fn on_connect_fail(&self, address: Address, reason: ErrorCode) {
        self.borrow_mut()
            .on_link_connect_failed(AddressWithType::classic(address), reason);
    }
}

impl LeConnectionCallbacks for RefCell<LinkManagerImpl> {
    fn on_le_connect_success(&self, _address_with_type: AddressWithType, connection: AclConnection) {
        self.borrow_mut().on_link_connected(connection);
    }

    fn on_le_connect_fail(&self, address_with_type: AddressWithType, reason: ErrorCode) {
        self.borrow_mut().on_link_connect_failed(address_with_type, reason);
    }
}
