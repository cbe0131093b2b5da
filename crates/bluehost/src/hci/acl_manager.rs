//! ACL connection manager
//!
//! Owns every ACL connection, the controller's shared buffer credits and
//! the round-robin fragment scheduler. All state lives in [`AclManagerImpl`]
//! and is only touched from tasks running on the manager's handler.

use crate::config::AclManagerConfig;
use crate::error::AclError;
use crate::hci::acl_connection::{AclConnection, ConnectionState, ConnectionUpdateParameters};
use crate::hci::acl_fragmenter::AclFragmenter;
use crate::hci::address::{Address, AddressWithType, ClassOfDevice, Role};
use crate::hci::callbacks::{
    AclManagerCallbacks, CallbackRegistration, ConnectionCallbacks, ConnectionManagementCallbacks,
    LeConnectionCallbacks,
};
use crate::hci::constants::*;
use crate::hci::error_code::ErrorCode;
use crate::hci::event::{reporting_address, Event, HciEvent, RemoteVersion};
use crate::hci::layer::{CommandResult, EventCallback, HciLayer};
use crate::hci::packet::{AclPacket, HciCommand, LinkPolicySettings, Mode, PacketTypes};
use crate::os::{promise, BidiQueueEnd, FutureValue, Handler};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, error, info, trace, warn};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Cursor;
use std::rc::{Rc, Weak};

/// Snapshot of the credit pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditStatus {
    pub available: u16,
    pub outstanding: u16,
    pub max: u16,
    /// Inbound frames dropped as malformed, illegal or unroutable
    pub dropped_packets: u64,
    pub connections: usize,
}

type AcceptPolicy = Box<dyn Fn(Address, ClassOfDevice) -> bool>;

const CONNECTION_EVENTS: [u8; 12] = [
    EVT_CONN_COMPLETE,
    EVT_CONN_REQUEST,
    EVT_DISCONN_COMPLETE,
    EVT_AUTH_COMPLETE,
    EVT_ENCRYPTION_CHANGE,
    EVT_READ_REMOTE_FEATURES_COMPLETE,
    EVT_READ_REMOTE_VERSION_COMPLETE,
    EVT_MODE_CHANGE,
    EVT_READ_CLOCK_OFFSET_COMPLETE,
    EVT_CONN_PACKET_TYPE_CHANGED,
    EVT_FLUSH_OCCURRED,
    EVT_ROLE_CHANGE,
];

const CONNECTION_LE_SUBEVENTS: [u8; 3] = [
    EVT_LE_CONN_COMPLETE,
    EVT_LE_CONN_UPDATE_COMPLETE,
    EVT_LE_ENHANCED_CONN_COMPLETE,
];

/// Public handle. Cheap to clone; every call is posted to the manager's handler.
#[derive(Clone)]
pub struct AclManager {
    inner: Rc<RefCell<AclManagerImpl>>,
    handler: Handler,
}

impl AclManager {
    pub fn new(hci: Rc<dyn HciLayer>, handler: &Handler, config: AclManagerConfig) -> Self {
        let hci_queue_end = hci.acl_queue_end();
        let inner = Rc::new_cyclic(|weak_self| {
            RefCell::new(AclManagerImpl {
                hci,
                handler: handler.clone(),
                weak_self: weak_self.clone(),
                credits: config.max_acl_packet_credits,
                max_credits: config.max_acl_packet_credits,
                config,
                hci_queue_end,
                connections: BTreeMap::new(),
                fragments_to_send: VecDeque::new(),
                last_serviced: None,
                connecting: BTreeSet::new(),
                connecting_le: BTreeSet::new(),
                pending_outgoing_connections: VecDeque::new(),
                accepted_incoming: BTreeSet::new(),
                client_callbacks: None,
                le_client_callbacks: None,
                manager_callbacks: None,
                accept_incoming: true,
                should_accept_connection: Box::new(|_, _| true),
                dropped_packets: 0,
            })
        });
        inner.borrow().start();
        Self {
            inner,
            handler: handler.clone(),
        }
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn register_callbacks(&self, callbacks: Weak<dyn ConnectionCallbacks>, handler: &Handler) {
        let registration = CallbackRegistration::new(callbacks, handler);
        self.post(move |manager| {
            assert!(
                manager.client_callbacks.is_none(),
                "classic connection callbacks registered twice"
            );
            manager.client_callbacks = Some(registration);
        });
    }

    pub fn register_le_callbacks(&self, callbacks: Weak<dyn LeConnectionCallbacks>, handler: &Handler) {
        let registration = CallbackRegistration::new(callbacks, handler);
        self.post(move |manager| {
            assert!(
                manager.le_client_callbacks.is_none(),
                "LE connection callbacks registered twice"
            );
            manager.le_client_callbacks = Some(registration);
        });
    }

    pub fn register_acl_manager_callbacks(
        &self,
        callbacks: Weak<dyn AclManagerCallbacks>,
        handler: &Handler,
    ) {
        let registration = CallbackRegistration::new(callbacks, handler);
        self.post(move |manager| {
            assert!(
                manager.manager_callbacks.is_none(),
                "ACL manager callbacks registered twice"
            );
            manager.manager_callbacks = Some(registration);
        });
    }

    pub fn create_connection(&self, address: Address) {
        self.post(move |manager| manager.create_connection(address));
    }

    pub fn create_le_connection(&self, address_with_type: AddressWithType) {
        self.post(move |manager| manager.create_le_connection(address_with_type));
    }

    pub fn cancel_connect(&self, address: Address) {
        self.post(move |manager| manager.cancel_connect(address));
    }

    pub fn cancel_le_connect(&self, address_with_type: AddressWithType) {
        self.post(move |manager| manager.cancel_le_connect(address_with_type));
    }

    /// Reject every incoming classic connection while `accept` is false
    pub fn set_accept_incoming_connections(&self, accept: bool) {
        self.post(move |manager| manager.accept_incoming = accept);
    }

    /// Decide per request whether an incoming classic connection is accepted
    pub fn set_connection_acceptance_policy<P>(&self, policy: P)
    where
        P: Fn(Address, ClassOfDevice) -> bool + 'static,
    {
        self.post(move |manager| manager.should_accept_connection = Box::new(policy));
    }

    pub fn credit_status(&self) -> FutureValue<CreditStatus> {
        let (promise, future) = promise();
        self.post(move |manager| promise.set_value(manager.credit_status()));
        future
    }

    /// Stop listening to the controller
    pub fn stop(&self) {
        self.post(|manager| manager.stop());
    }

    fn post<F: FnOnce(&mut AclManagerImpl) + 'static>(&self, f: F) {
        let inner = Rc::downgrade(&self.inner);
        self.handler.post(move || {
            if let Some(inner) = inner.upgrade() {
                f(&mut inner.borrow_mut());
            }
        });
    }
}

pub(crate) struct AclManagerImpl {
    hci: Rc<dyn HciLayer>,
    handler: Handler,
    weak_self: Weak<RefCell<AclManagerImpl>>,
    config: AclManagerConfig,
    hci_queue_end: BidiQueueEnd<Vec<u8>>,
    connections: BTreeMap<u16, ConnectionState>,

    // Credit pool and scheduler
    credits: u16,
    max_credits: u16,
    fragments_to_send: VecDeque<AclPacket>,
    last_serviced: Option<u16>,

    // Outgoing connection bookkeeping
    connecting: BTreeSet<Address>,
    connecting_le: BTreeSet<AddressWithType>,
    pending_outgoing_connections: VecDeque<Address>,
    /// Accepted incoming connections not yet completed
    accepted_incoming: BTreeSet<Address>,

    client_callbacks: Option<CallbackRegistration<dyn ConnectionCallbacks>>,
    le_client_callbacks: Option<CallbackRegistration<dyn LeConnectionCallbacks>>,
    manager_callbacks: Option<CallbackRegistration<dyn AclManagerCallbacks>>,
    accept_incoming: bool,
    should_accept_connection: AcceptPolicy,
    dropped_packets: u64,
}

impl AclManagerImpl {
    fn start(&self) {
        for event_code in CONNECTION_EVENTS {
            self.hci
                .register_event_handler(event_code, &self.handler, self.event_callback());
        }
        for subevent_code in CONNECTION_LE_SUBEVENTS {
            self.hci
                .register_le_event_handler(subevent_code, &self.handler, self.event_callback());
        }

        let weak = self.weak_self.clone();
        self.hci.register_completed_packets_callback(
            &self.handler,
            Rc::new(move |handle, credits| {
                if let Some(manager) = weak.upgrade() {
                    manager.borrow_mut().incoming_acl_credits(handle, credits);
                }
            }),
        );

        let weak = self.weak_self.clone();
        self.hci_queue_end.register_dequeue(
            &self.handler,
            Rc::new(move || {
                if let Some(manager) = weak.upgrade() {
                    manager.borrow_mut().dequeue_and_route_acl_packet_to_connection();
                }
            }),
        );
    }

    fn stop(&mut self) {
        for event_code in CONNECTION_EVENTS {
            self.hci.unregister_event_handler(event_code);
        }
        for subevent_code in CONNECTION_LE_SUBEVENTS {
            self.hci.unregister_le_event_handler(subevent_code);
        }
        self.hci_queue_end.unregister_dequeue();
        self.unregister_all_connections();
        self.connections.clear();
        self.fragments_to_send.clear();
    }

    fn event_callback(&self) -> EventCallback {
        let weak = self.weak_self.clone();
        Rc::new(move |event| {
            if let Some(manager) = weak.upgrade() {
                manager.borrow_mut().on_hci_event(event);
            }
        })
    }

    /// Run `f` against this manager in a later task on its handler
    fn post_self<F: FnOnce(&mut AclManagerImpl) + 'static>(&self, f: F) {
        let weak = self.weak_self.clone();
        self.handler.post(move || {
            if let Some(manager) = weak.upgrade() {
                f(&mut manager.borrow_mut());
            }
        });
    }

    fn enqueue_command<F>(&self, command: HciCommand, on_result: F)
    where
        F: FnOnce(&mut AclManagerImpl, CommandResult) + 'static,
    {
        let weak = self.weak_self.clone();
        self.hci.enqueue_command(
            command,
            &self.handler,
            Box::new(move |result| {
                if let Some(manager) = weak.upgrade() {
                    on_result(&mut manager.borrow_mut(), result);
                }
            }),
        );
    }

    fn check_command_status(_manager: &mut AclManagerImpl, result: CommandResult) {
        if !result.status.is_success() {
            error!(
                "Received command status with error code {}, opcode 0x{:04x}",
                result.status, result.opcode
            );
        }
    }

    pub(crate) fn credit_status(&self) -> CreditStatus {
        CreditStatus {
            available: self.credits,
            outstanding: self.connections.values().map(|c| c.sent_packets).sum(),
            max: self.max_credits,
            dropped_packets: self.dropped_packets,
            connections: self.connections.len(),
        }
    }

    fn on_hci_event(&mut self, event: HciEvent) {
        let event = match Event::parse(&event) {
            Ok(event) => event,
            Err(e) => {
                error!("Received invalid event 0x{:02x}: {}", event.event_code, e);
                return;
            }
        };

        match event {
            Event::ConnectionComplete {
                status,
                handle,
                bd_addr,
                ..
            } => self.on_connection_complete(status, handle, bd_addr),
            Event::ConnectionRequest {
                bd_addr,
                class_of_device,
                link_type,
            } => self.on_incoming_connection(bd_addr, class_of_device, link_type),
            Event::DisconnectionComplete {
                status,
                handle,
                reason,
            } => self.on_disconnection_complete(status, handle, reason),
            Event::AuthenticationComplete { status, handle } => {
                self.on_authentication_complete(status, handle)
            }
            Event::EncryptionChange {
                status,
                handle,
                enabled,
            } => self.on_encryption_change(status, handle, enabled),
            Event::ReadRemoteSupportedFeaturesComplete {
                status,
                handle,
                features,
            } => self.on_read_remote_supported_features_complete(status, handle, features),
            Event::ReadRemoteVersionInformationComplete {
                status,
                handle,
                version,
            } => self.on_read_remote_version_information_complete(status, handle, version),
            Event::ModeChange {
                status,
                handle,
                current_mode,
                interval,
            } => self.on_mode_change(status, handle, current_mode, interval),
            Event::ReadClockOffsetComplete {
                status,
                handle,
                clock_offset,
            } => self.on_read_clock_offset_complete(status, handle, clock_offset),
            Event::ConnectionPacketTypeChanged {
                status,
                handle,
                packet_type,
            } => self.on_connection_packet_type_changed(status, handle, packet_type),
            Event::FlushOccurred { handle } => self.on_flush_occurred(handle),
            Event::RoleChange {
                status,
                bd_addr,
                new_role,
            } => self.on_role_change(status, bd_addr, new_role),
            Event::LeConnectionComplete {
                status,
                handle,
                role,
                peer,
                ..
            } => self.on_le_connection_complete(status, handle, role, peer),
            Event::LeEnhancedConnectionComplete {
                status,
                handle,
                role,
                peer,
                peer_resolvable_private_address,
                ..
            } => self.on_le_connection_complete(
                status,
                handle,
                role,
                reporting_address(peer, peer_resolvable_private_address),
            ),
            Event::LeConnectionUpdateComplete { status, handle, .. } => {
                self.on_le_connection_update_complete(status, handle)
            }
            other => debug!("Ignoring event {:?}", other),
        }
    }

    // Credits and round-robin scheduling

    fn incoming_acl_credits(&mut self, handle: u16, credits: u16) {
        let Some(connection) = self.connections.get_mut(&handle) else {
            info!(
                "Dropping {} received credits to unknown connection 0x{:04x}",
                credits, handle
            );
            return;
        };
        if connection.is_disconnected {
            info!(
                "Dropping {} received credits to disconnected connection 0x{:04x}",
                credits, handle
            );
            return;
        }

        let credits = if credits > connection.sent_packets {
            error!(
                "Controller completed {} packets on 0x{:04x} but only {} were outstanding",
                credits, handle, connection.sent_packets
            );
            connection.sent_packets
        } else {
            credits
        };
        connection.sent_packets -= credits;
        self.credits += credits;
        debug_assert!(self.credits <= self.max_credits);
        self.start_round_robin();
    }

    /// Send pending fragments, or listen for the next connection with data
    fn start_round_robin(&mut self) {
        if self.credits == 0 {
            return;
        }
        if !self.fragments_to_send.is_empty() {
            self.send_next_fragments();
            return;
        }

        for handle in self.rotation_order() {
            let Some(connection) = self.connections.get_mut(&handle) else {
                continue;
            };
            if connection.is_registered || connection.is_disconnected {
                continue;
            }
            connection.is_registered = true;
            let weak = self.weak_self.clone();
            connection.manager_end.register_dequeue(
                &self.handler,
                Rc::new(move || {
                    if let Some(manager) = weak.upgrade() {
                        manager.borrow_mut().handle_dequeue_from_upper(handle);
                    }
                }),
            );
        }
    }

    /// Handles ordered so the connection after the last serviced one comes first
    fn rotation_order(&self) -> Vec<u16> {
        let handles = self.connections.keys().copied();
        match self.last_serviced {
            Some(last) => handles
                .clone()
                .filter(|handle| *handle > last)
                .chain(handles.filter(|handle| *handle <= last))
                .collect(),
            None => handles.collect(),
        }
    }

    fn unregister_all_connections(&mut self) {
        for connection in self.connections.values_mut() {
            if connection.is_registered {
                connection.is_registered = false;
                connection.manager_end.unregister_dequeue();
            }
        }
    }

    fn handle_dequeue_from_upper(&mut self, handle: u16) {
        self.unregister_all_connections();
        let Some(pdu) = self
            .connections
            .get(&handle)
            .and_then(|connection| connection.manager_end.try_dequeue())
        else {
            self.start_round_robin();
            return;
        };

        self.last_serviced = Some(handle);
        let fragments = AclFragmenter::new(self.config.acl_buffer_length).fragment(handle, pdu);
        trace!(
            "Buffered PDU for 0x{:04x} as {} fragment(s)",
            handle,
            fragments.len()
        );
        self.fragments_to_send.extend(fragments);
        self.send_next_fragments();
    }

    fn send_next_fragments(&mut self) {
        while self.credits > 0 {
            let Some(fragment) = self.fragments_to_send.pop_front() else {
                break;
            };
            self.credits -= 1;
            if let Some(connection) = self.connections.get_mut(&fragment.handle) {
                connection.sent_packets += 1;
            }
            self.hci_queue_end.enqueue(fragment.to_bytes());
        }

        if self.fragments_to_send.is_empty() {
            self.post_self(|manager| manager.start_round_robin());
        }
    }

    fn dequeue_and_route_acl_packet_to_connection(&mut self) {
        let Some(bytes) = self.hci_queue_end.try_dequeue() else {
            return;
        };
        let packet = match AclPacket::parse(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                info!("Dropping invalid packet of size {}: {}", bytes.len(), e);
                self.dropped_packets += 1;
                return;
            }
        };
        if packet.handle == VENDOR_DEBUG_HANDLE {
            return;
        }

        let Some(connection) = self.connections.get_mut(&packet.handle) else {
            info!(
                "Dropping packet of size {} to unknown connection 0x{:04x}",
                bytes.len(),
                packet.handle
            );
            self.dropped_packets += 1;
            return;
        };
        if connection.is_disconnected {
            info!(
                "Dropping packet of size {} to disconnected connection 0x{:04x}",
                bytes.len(),
                packet.handle
            );
            self.dropped_packets += 1;
            return;
        }

        match connection
            .recombiner
            .on_fragment(packet.boundary_flag, packet.payload)
        {
            Ok(Some(pdu)) => connection.deliver(pdu),
            Ok(None) => {}
            Err(e @ (AclError::FirstNonFlushable | AclError::CompleteNotAllowed)) => {
                error!("0x{:04x}: {}", packet.handle, e);
                self.dropped_packets += 1;
            }
            Err(e) => {
                warn!("Remote sent unexpected L2CAP PDU on 0x{:04x}: {}", packet.handle, e);
                self.dropped_packets += 1;
            }
        }
    }

    // Connection establishment

    fn is_classic_link_already_connected(&self, address: Address) -> bool {
        self.connections
            .values()
            .any(|c| c.address_with_type.address == address && !c.is_disconnected)
    }

    fn add_connection(&mut self, handle: u16, address_with_type: AddressWithType, role: Role) -> AclConnection {
        let state = ConnectionState::new(
            handle,
            address_with_type,
            role,
            self.config.max_queued_packets_per_connection,
            self.config.outbound_queue_depth,
        );
        let queue_end = state.queue.up_end();
        self.connections.insert(handle, state);
        self.start_round_robin();
        AclConnection::new(
            handle,
            address_with_type,
            role,
            queue_end,
            self.weak_self.clone(),
            self.handler.clone(),
        )
    }

    fn create_connection(&mut self, address: Address) {
        assert!(
            self.client_callbacks.is_some(),
            "create_connection without registered connection callbacks"
        );
        if self.is_classic_link_already_connected(address) {
            warn!("already connected: {}", address);
            return;
        }
        if self.connecting.contains(&address) || self.pending_outgoing_connections.contains(&address) {
            debug!("Connection to {} already in progress", address);
            return;
        }
        if !self.connecting.is_empty() {
            debug!("Queueing connection to {} behind {} in flight", address, self.connecting.len());
            self.pending_outgoing_connections.push_back(address);
            return;
        }
        self.issue_create_connection(address);
    }

    fn issue_create_connection(&mut self, address: Address) {
        self.connecting.insert(address);
        let command = HciCommand::CreateConnection {
            bd_addr: address,
            packet_type: self.config.classic_packet_type,
            page_scan_repetition_mode: self.config.page_scan_repetition_mode,
            clock_offset: 0,
            allow_role_switch: true,
        };
        self.enqueue_command(command, move |manager, result| {
            if result.status.is_success() {
                return;
            }
            error!("Create connection to {} failed: {}", address, result.status);
            manager.connecting.remove(&address);
            manager.notify_connect_fail(address, result.status);
            manager.connect_next_pending();
        });
    }

    fn connect_next_pending(&mut self) {
        if !self.connecting.is_empty() {
            return;
        }
        while let Some(address) = self.pending_outgoing_connections.pop_front() {
            if !self.is_classic_link_already_connected(address) {
                self.issue_create_connection(address);
                break;
            }
        }
    }

    fn notify_connect_fail(&self, address: Address, reason: ErrorCode) {
        match &self.client_callbacks {
            Some(callbacks) => callbacks.post(move |c| c.on_connect_fail(address, reason)),
            None => warn!("No callbacks to report failed connection to {}", address),
        }
    }

    fn create_le_connection(&mut self, address_with_type: AddressWithType) {
        assert!(
            self.le_client_callbacks.is_some(),
            "create_le_connection without registered LE callbacks"
        );
        if self.connecting_le.contains(&address_with_type) {
            debug!("LE connection to {} already in progress", address_with_type);
            return;
        }
        if self
            .connections
            .values()
            .any(|c| c.address_with_type == address_with_type && !c.is_disconnected)
        {
            warn!("already connected: {}", address_with_type);
            return;
        }

        self.connecting_le.insert(address_with_type);
        let params = self.config.le_connection_parameters;
        let command = HciCommand::LeCreateConnection {
            scan_interval: params.scan_interval,
            scan_window: params.scan_window,
            use_filter_accept_list: false,
            peer_address_type: address_with_type.address_type,
            peer_address: address_with_type.address,
            own_address_type: params.own_address_type,
            conn_interval_min: params.conn_interval_min,
            conn_interval_max: params.conn_interval_max,
            conn_latency: params.conn_latency,
            supervision_timeout: params.supervision_timeout,
            min_ce_length: params.min_ce_length,
            max_ce_length: params.max_ce_length,
        };
        self.enqueue_command(command, move |manager, result| {
            if result.status.is_success() {
                return;
            }
            error!("LE create connection to {} failed: {}", address_with_type, result.status);
            manager.connecting_le.remove(&address_with_type);
            if let Some(callbacks) = &manager.le_client_callbacks {
                let status = result.status;
                callbacks.post(move |c| c.on_le_connect_fail(address_with_type, status));
            }
        });
    }

    fn cancel_connect(&mut self, address: Address) {
        if !self.connecting.contains(&address) {
            info!("Cannot cancel non-existent connection to {}", address);
            return;
        }
        self.enqueue_command(
            HciCommand::CreateConnectionCancel { bd_addr: address },
            Self::check_command_status,
        );
    }

    fn cancel_le_connect(&mut self, address_with_type: AddressWithType) {
        if !self.connecting_le.contains(&address_with_type) {
            info!("Cannot cancel non-existent LE connection to {}", address_with_type);
            return;
        }
        self.enqueue_command(HciCommand::LeCreateConnectionCancel, Self::check_command_status);
    }

    fn on_incoming_connection(&mut self, address: Address, class_of_device: ClassOfDevice, link_type: u8) {
        if link_type != LINK_TYPE_ACL {
            info!("Rejecting non-ACL connection request from {}", address);
            self.reject_connection(address, ErrorCode::CONNECTION_REJECTED_LIMITED_RESOURCES);
            return;
        }
        if self.client_callbacks.is_none() {
            error!("No callbacks to call");
            self.reject_connection(address, ErrorCode::CONNECTION_REJECTED_LIMITED_RESOURCES);
            return;
        }
        if !self.accept_incoming {
            info!("Not accepting incoming connections, rejecting {}", address);
            self.reject_connection(address, ErrorCode::CONNECTION_REJECTED_LIMITED_RESOURCES);
            return;
        }
        if self.is_classic_link_already_connected(address) {
            self.reject_connection(address, ErrorCode::CONNECTION_REJECTED_UNACCEPTABLE_BD_ADDR);
            return;
        }
        if (self.should_accept_connection)(address, class_of_device) {
            self.connecting.insert(address);
            self.accepted_incoming.insert(address);
            self.accept_connection(address);
        } else {
            self.reject_connection(address, ErrorCode::CONNECTION_REJECTED_LIMITED_RESOURCES);
        }
    }

    fn accept_connection(&mut self, address: Address) {
        // Prefer to be central
        let command = HciCommand::AcceptConnectionRequest {
            bd_addr: address,
            role: Role::Central,
        };
        self.enqueue_command(command, move |manager, result| {
            if !result.status.is_success() {
                error!("Accepting connection from {} failed: {}", address, result.status);
                manager.accepted_incoming.remove(&address);
                manager.cancel_connect(address);
            }
        });
    }

    fn reject_connection(&mut self, address: Address, reason: ErrorCode) {
        self.enqueue_command(
            HciCommand::RejectConnectionRequest {
                bd_addr: address,
                reason,
            },
            Self::check_command_status,
        );
    }

    fn on_connection_complete(&mut self, status: ErrorCode, handle: u16, address: Address) {
        if !self.connecting.remove(&address) {
            warn!("No prior connection request for {}", address);
        }
        // The peer paged us, so we start out peripheral until a role change
        let role = if self.accepted_incoming.remove(&address) {
            Role::Peripheral
        } else {
            Role::Central
        };

        if !status.is_success() {
            self.notify_connect_fail(address, status);
        } else if self.connections.contains_key(&handle) {
            error!("Connection complete for handle 0x{:04x} which is already in use", handle);
        } else {
            let connection = self.add_connection(handle, AddressWithType::classic(address), role);
            match &self.client_callbacks {
                Some(callbacks) => callbacks.post(move |c| c.on_connect_success(connection)),
                None => warn!("No callbacks for new connection 0x{:04x}", handle),
            }
        }

        self.connect_next_pending();
    }

    fn on_le_connection_complete(
        &mut self,
        status: ErrorCode,
        handle: u16,
        role: Role,
        peer: AddressWithType,
    ) {
        if !self.connecting_le.remove(&peer) {
            warn!("No prior connection request for {}", peer);
        }
        let Some(callbacks) = &self.le_client_callbacks else {
            warn!("No LE callbacks for connection complete from {}", peer);
            return;
        };
        if !status.is_success() {
            callbacks.post(move |c| c.on_le_connect_fail(peer, status));
            return;
        }
        if self.connections.contains_key(&handle) {
            error!("LE connection complete for handle 0x{:04x} which is already in use", handle);
            return;
        }

        let connection = self.add_connection(handle, peer, role);
        if let Some(callbacks) = &self.le_client_callbacks {
            callbacks.post(move |c| c.on_le_connect_success(peer, connection));
        }
    }

    fn on_disconnection_complete(&mut self, status: ErrorCode, handle: u16, reason: ErrorCode) {
        if !status.is_success() {
            error!(
                "Received disconnection complete with error code {}, handle 0x{:04x}",
                status, handle
            );
            return;
        }
        let Some(connection) = self.connections.get_mut(&handle) else {
            warn!("Disconnection complete for unknown handle 0x{:04x}", handle);
            return;
        };

        info!("Disconnected 0x{:04x} ({}): {}", handle, connection.address_with_type, reason);
        connection.is_disconnected = true;
        connection.disconnect_reason = Some(reason);
        connection.on_disconnect.fire(reason);
        if connection.is_registered {
            connection.is_registered = false;
            connection.manager_end.unregister_dequeue();
        }

        // Reclaim outstanding packets
        self.credits += connection.sent_packets;
        connection.sent_packets = 0;

        let before = self.fragments_to_send.len();
        self.fragments_to_send.retain(|fragment| fragment.handle != handle);
        if before != self.fragments_to_send.len() {
            debug!(
                "Discarded {} unsent fragment(s) for 0x{:04x}",
                before - self.fragments_to_send.len(),
                handle
            );
        }
        self.start_round_robin();
    }

    pub(crate) fn cleanup(&mut self, handle: u16) {
        let Some(connection) = self.connections.get(&handle) else {
            warn!("Finish for unknown connection 0x{:04x}", handle);
            return;
        };
        assert!(
            connection.is_disconnected,
            "finish called on live connection 0x{:04x}",
            handle
        );
        if connection.is_registered {
            connection.manager_end.unregister_dequeue();
        }
        self.connections.remove(&handle);
    }

    // Per-connection management

    pub(crate) fn register_management_callbacks(
        &mut self,
        handle: u16,
        registration: CallbackRegistration<dyn ConnectionManagementCallbacks>,
    ) {
        match self.connections.get_mut(&handle) {
            Some(connection) => connection.management_callbacks = Some(registration),
            None => warn!("Callbacks registered for unknown connection 0x{:04x}", handle),
        }
    }

    pub(crate) fn register_disconnect_callback<F: FnOnce(ErrorCode) + 'static>(
        &mut self,
        handle: u16,
        handler: &Handler,
        callback: F,
    ) {
        match self.connections.get_mut(&handle) {
            Some(connection) => connection.on_disconnect.register(handler, callback),
            None => warn!("Disconnect callback registered for unknown connection 0x{:04x}", handle),
        }
    }

    fn live_connection(&self, handle: u16, operation: &str) -> bool {
        match self.connections.get(&handle) {
            Some(connection) if !connection.is_disconnected => true,
            Some(_) => {
                info!("{} on disconnected connection 0x{:04x}", operation, handle);
                false
            }
            None => {
                warn!("{} on unknown connection 0x{:04x}", operation, handle);
                false
            }
        }
    }

    pub(crate) fn handle_disconnect(&mut self, handle: u16, reason: ErrorCode) {
        if self.live_connection(handle, "Disconnect") {
            self.enqueue_command(HciCommand::Disconnect { handle, reason }, Self::check_command_status);
        }
    }

    pub(crate) fn handle_authentication_requested(&mut self, handle: u16) {
        if self.live_connection(handle, "Authentication") {
            self.enqueue_command(
                HciCommand::AuthenticationRequested { handle },
                Self::check_command_status,
            );
        }
    }

    pub(crate) fn handle_set_connection_encryption(&mut self, handle: u16, enable: bool) {
        if self.live_connection(handle, "Set encryption") {
            self.enqueue_command(
                HciCommand::SetConnectionEncryption { handle, enable },
                Self::check_command_status,
            );
        }
    }

    pub(crate) fn handle_change_connection_packet_type(&mut self, handle: u16, packet_type: PacketTypes) {
        if self.live_connection(handle, "Change packet type") {
            self.enqueue_command(
                HciCommand::ChangeConnectionPacketType {
                    handle,
                    packet_type,
                },
                Self::check_command_status,
            );
        }
    }

    pub(crate) fn handle_flush(&mut self, handle: u16) {
        if self.live_connection(handle, "Flush") {
            self.enqueue_command(HciCommand::Flush { handle }, Self::check_command_status);
        }
    }

    pub(crate) fn handle_read_rssi(&mut self, handle: u16) {
        if self.live_connection(handle, "Read RSSI") {
            self.enqueue_command(HciCommand::ReadRssi { handle }, move |manager, result| {
                manager.on_read_rssi_complete(handle, result)
            });
        }
    }

    pub(crate) fn handle_management_command(&mut self, handle: u16, operation: &str, command: HciCommand) {
        if self.live_connection(handle, operation) {
            self.enqueue_command(command, Self::check_command_status);
        }
    }

    pub(crate) fn handle_role_discovery(&mut self, handle: u16) {
        if self.live_connection(handle, "Role discovery") {
            self.enqueue_command(HciCommand::RoleDiscovery { handle }, move |manager, result| {
                manager.on_role_discovery_complete(handle, result)
            });
        }
    }

    pub(crate) fn handle_read_link_policy_settings(&mut self, handle: u16) {
        if self.live_connection(handle, "Read link policy settings") {
            self.enqueue_command(HciCommand::ReadLinkPolicySettings { handle }, move |manager, result| {
                manager.on_read_link_policy_settings_complete(handle, result)
            });
        }
    }

    pub(crate) fn handle_read_link_supervision_timeout(&mut self, handle: u16) {
        if self.live_connection(handle, "Read link supervision timeout") {
            self.enqueue_command(HciCommand::ReadLinkSupervisionTimeout { handle }, move |manager, result| {
                manager.on_read_link_supervision_timeout_complete(handle, result)
            });
        }
    }

    pub(crate) fn handle_le_connection_update(
        &mut self,
        handle: u16,
        parameters: ConnectionUpdateParameters,
        handler: Handler,
        on_complete: Box<dyn FnOnce(ErrorCode)>,
    ) {
        if !self.live_connection(handle, "LE connection update") {
            handler.post(move || on_complete(ErrorCode::UNKNOWN_CONNECTION));
            return;
        }
        if let Some(connection) = self.connections.get_mut(&handle) {
            if connection.on_connection_update.is_some() {
                warn!("Connection update already pending on 0x{:04x}", handle);
                handler.post(move || on_complete(ErrorCode::COMMAND_DISALLOWED));
                return;
            }
            connection.on_connection_update = Some((handler, on_complete));
        }
        let command = HciCommand::LeConnectionUpdate {
            handle,
            conn_interval_min: parameters.conn_interval_min,
            conn_interval_max: parameters.conn_interval_max,
            conn_latency: parameters.conn_latency,
            supervision_timeout: parameters.supervision_timeout,
            min_ce_length: parameters.min_ce_length,
            max_ce_length: parameters.max_ce_length,
        };
        self.enqueue_command(command, move |manager, result| {
            if result.status.is_success() {
                return;
            }
            error!("LE connection update on 0x{:04x} failed: {}", handle, result.status);
            manager.complete_connection_update(handle, result.status);
        });
    }

    fn complete_connection_update(&mut self, handle: u16, status: ErrorCode) {
        let Some(connection) = self.connections.get_mut(&handle) else {
            warn!("Can't find connection 0x{:04x}", handle);
            return;
        };
        if let Some((handler, on_complete)) = connection.on_connection_update.take() {
            handler.post(move || on_complete(status));
        }
    }

    fn management_callbacks(
        &self,
        handle: u16,
        event_name: &str,
    ) -> Option<&CallbackRegistration<dyn ConnectionManagementCallbacks>> {
        match self.connections.get(&handle) {
            Some(connection) => connection.management_callbacks.as_ref(),
            None => {
                warn!("Received {} for unknown connection 0x{:04x}", event_name, handle);
                None
            }
        }
    }

    fn on_authentication_complete(&mut self, status: ErrorCode, handle: u16) {
        if !status.is_success() {
            error!("Received on_authentication_complete with error code {}", status);
        }
        let Some(callbacks) = self.management_callbacks(handle, "authentication complete") else {
            return;
        };
        if status.is_success() {
            callbacks.post(|c| c.on_authentication_complete());
        } else {
            callbacks.post(move |c| c.on_authentication_failed(status));
        }
    }

    fn on_encryption_change(&mut self, status: ErrorCode, handle: u16, enabled: bool) {
        if !status.is_success() {
            error!("Received on_encryption_change with error code {}", status);
            return;
        }
        if let Some(callbacks) = self.management_callbacks(handle, "encryption change") {
            callbacks.post(move |c| c.on_encryption_change(enabled));
        }
    }

    fn on_connection_packet_type_changed(&mut self, status: ErrorCode, handle: u16, packet_type: PacketTypes) {
        if !status.is_success() {
            error!("Received on_connection_packet_type_changed with error code {}", status);
            return;
        }
        if let Some(callbacks) = self.management_callbacks(handle, "packet type changed") {
            callbacks.post(move |c| c.on_connection_packet_type_changed(packet_type));
        }
    }

    fn on_flush_occurred(&mut self, handle: u16) {
        if let Some(callbacks) = self.management_callbacks(handle, "flush occurred") {
            callbacks.post(|c| c.on_flush_occurred());
        }
    }

    /// Value following the connection handle in a Command Complete
    fn read_complete_value<T>(
        result: &CommandResult,
        event_name: &str,
        read: impl FnOnce(&mut Cursor<&[u8]>) -> std::io::Result<T>,
    ) -> Option<T> {
        if !result.status.is_success() {
            error!("Received {} with error code {}", event_name, result.status);
            return None;
        }
        let mut cursor = Cursor::new(result.return_parameters.as_slice());
        match cursor.read_u16::<LittleEndian>().and_then(|_handle| read(&mut cursor)) {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Received {} with invalid packet: {}", event_name, e);
                None
            }
        }
    }

    fn on_read_rssi_complete(&mut self, handle: u16, result: CommandResult) {
        let Some(rssi) = Self::read_complete_value(&result, "read RSSI complete", |c| c.read_i8()) else {
            return;
        };
        if let Some(callbacks) = self.management_callbacks(handle, "read RSSI complete") {
            callbacks.post(move |c| c.on_read_rssi_complete(rssi));
        }
    }

    fn on_role_discovery_complete(&mut self, handle: u16, result: CommandResult) {
        let Some(role) = Self::read_complete_value(&result, "role discovery complete", |c| c.read_u8()) else {
            return;
        };
        let role = Role::from(role);
        if let Some(callbacks) = self.management_callbacks(handle, "role discovery complete") {
            callbacks.post(move |c| c.on_role_discovery_complete(role));
        }
    }

    fn on_read_link_policy_settings_complete(&mut self, handle: u16, result: CommandResult) {
        let Some(settings) = Self::read_complete_value(&result, "read link policy settings complete", |c| {
            c.read_u16::<LittleEndian>()
        }) else {
            return;
        };
        let settings = LinkPolicySettings::from_bits_truncate(settings);
        if let Some(callbacks) = self.management_callbacks(handle, "read link policy settings complete") {
            callbacks.post(move |c| c.on_read_link_policy_settings_complete(settings));
        }
    }

    fn on_read_link_supervision_timeout_complete(&mut self, handle: u16, result: CommandResult) {
        let Some(timeout) = Self::read_complete_value(&result, "read link supervision timeout complete", |c| {
            c.read_u16::<LittleEndian>()
        }) else {
            return;
        };
        if let Some(callbacks) = self.management_callbacks(handle, "read link supervision timeout complete") {
            callbacks.post(move |c| c.on_read_link_supervision_timeout_complete(timeout));
        }
    }

    fn on_mode_change(&mut self, status: ErrorCode, handle: u16, current_mode: Mode, interval: u16) {
        if !status.is_success() {
            error!("Received on_mode_change with error code {}", status);
            return;
        }
        if let Some(callbacks) = self.management_callbacks(handle, "mode change") {
            callbacks.post(move |c| c.on_mode_change(current_mode, interval));
        }
    }

    fn on_read_remote_version_information_complete(&mut self, status: ErrorCode, handle: u16, version: RemoteVersion) {
        if !status.is_success() {
            error!("Received on_read_remote_version_information_complete with error code {}", status);
            return;
        }
        if let Some(callbacks) = self.management_callbacks(handle, "remote version") {
            callbacks.post(move |c| c.on_read_remote_version_information_complete(version));
        }
    }

    fn on_read_remote_supported_features_complete(&mut self, status: ErrorCode, handle: u16, features: u64) {
        if !status.is_success() {
            error!("Received on_read_remote_supported_features_complete with error code {}", status);
            return;
        }
        if let Some(callbacks) = self.management_callbacks(handle, "remote features") {
            callbacks.post(move |c| c.on_read_remote_supported_features_complete(features));
        }
    }

    fn on_read_clock_offset_complete(&mut self, status: ErrorCode, handle: u16, clock_offset: u16) {
        if !status.is_success() {
            error!("Received on_read_clock_offset_complete with error code {}", status);
            return;
        }
        if let Some(callbacks) = self.management_callbacks(handle, "clock offset") {
            callbacks.post(move |c| c.on_read_clock_offset_complete(clock_offset));
        }
    }

    fn on_role_change(&mut self, status: ErrorCode, address: Address, new_role: Role) {
        if !status.is_success() {
            error!("Received on_role_change with error code {}", status);
            return;
        }
        for (handle, connection) in self.connections.iter_mut() {
            if connection.address_with_type.address == address && !connection.is_disconnected {
                debug!(
                    "Role of 0x{:04x} changed from {:?} to {:?}",
                    handle, connection.role, new_role
                );
                connection.role = new_role;
            }
        }
        if let Some(callbacks) = &self.manager_callbacks {
            callbacks.post(move |c| c.on_role_change(address, new_role));
        }
    }

    fn on_le_connection_update_complete(&mut self, status: ErrorCode, handle: u16) {
        match self.connections.get(&handle) {
            Some(connection) if connection.is_disconnected => {
                info!("Already disconnected");
                return;
            }
            None => {
                warn!("Can't find connection 0x{:04x}", handle);
                return;
            }
            Some(_) => {}
        }
        if !status.is_success() {
            error!("Received on_le_connection_update_complete with error code {}", status);
        }
        self.complete_connection_update(handle, status);
    }
}
