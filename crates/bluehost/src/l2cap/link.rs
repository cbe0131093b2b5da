//! One ACL link and the L2CAP channels multiplexed over it
//!
//! The link demultiplexes inbound PDUs by CID, frames outbound SDUs, runs
//! the signalling state machine for dynamic channels, and disconnects the
//! ACL once nothing has referenced it for the idle timeout.

use super::channel::{DynamicChannel, FixedChannel};
use super::constants::*;
use super::dynamic_channel_allocator::DynamicChannelAllocator;
use super::fixed_channel_allocator::FixedChannelAllocator;
use super::link_manager::LinkManagerImpl;
use super::packet::BasicFrame;
use super::psm::Psm;
use super::service::{OpenTarget, PendingDynamicConnection, Services};
use super::signalling::{IdentifierAllocator, SignallingCommand, SignallingPacket};
use super::types::{ConnectionResult, ConnectionResultCode, L2capError, SecurityPolicy, Transport};
use crate::config::L2capConfig;
use crate::hci::{AclConnection, AddressWithType, ConnectionManagementCallbacks, ErrorCode};
use crate::os::{Alarm, BidiQueueEnd, Handler};
use log::{debug, info, trace, warn};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};

/// Non-owning reference to a link, resolved by address through its manager
#[derive(Clone)]
pub(crate) struct LinkHandle {
    manager: Weak<RefCell<LinkManagerImpl>>,
    handler: Handler,
    address: AddressWithType,
}

impl LinkHandle {
    pub fn new(manager: Weak<RefCell<LinkManagerImpl>>, handler: Handler, address: AddressWithType) -> Self {
        Self {
            manager,
            handler,
            address,
        }
    }

    pub fn address(&self) -> AddressWithType {
        self.address
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Run `f` on the link right away. Only call from a task of its own,
    /// never while the manager is borrowed.
    pub fn with_link<F: FnOnce(&mut Link, &Services)>(&self, f: F) {
        self.with_manager(|manager| manager.with_link(self.address, f));
    }

    pub fn with_manager<F: FnOnce(&mut LinkManagerImpl)>(&self, f: F) {
        if let Some(manager) = self.manager.upgrade() {
            f(&mut manager.borrow_mut());
        }
    }

    pub fn post<F: FnOnce(&mut Link, &Services) + 'static>(&self, f: F) {
        let link = self.clone();
        self.handler.post(move || link.with_link(f));
    }
}

/// Management events for the link's ACL connection
struct LinkEvents {
    link: LinkHandle,
}

impl ConnectionManagementCallbacks for LinkEvents {
    fn on_authentication_complete(&self) {
        self.link.with_link(|link, _| link.on_authentication_complete());
    }

    fn on_encryption_change(&self, enabled: bool) {
        self.link.with_link(|link, _| link.on_encryption_change(enabled));
    }

    fn on_authentication_failed(&self, reason: ErrorCode) {
        self.link.with_link(|link, _| link.on_authentication_failed(reason));
    }
}

/// A signalling request waiting for its response, keyed by identifier
enum OutstandingRequest {
    Connection {
        cid: u16,
        pending: PendingDynamicConnection,
    },
    Configuration {
        cid: u16,
    },
    Disconnection {
        cid: u16,
    },
}

impl OutstandingRequest {
    fn cid(&self) -> u16 {
        match self {
            OutstandingRequest::Connection { cid, .. }
            | OutstandingRequest::Configuration { cid }
            | OutstandingRequest::Disconnection { cid } => *cid,
        }
    }
}

pub(crate) struct Link {
    transport: Transport,
    acl: AclConnection,
    acl_end: BidiQueueEnd<Vec<u8>>,
    handle: LinkHandle,
    config: L2capConfig,
    fixed_channels: FixedChannelAllocator,
    dynamic_channels: DynamicChannelAllocator,
    identifiers: IdentifierAllocator,
    outstanding: BTreeMap<u8, OutstandingRequest>,
    /// Opens waiting for the link to be encrypted
    parked: VecDeque<PendingDynamicConnection>,
    idle_alarm: Alarm,
    ref_count: usize,
    authentication_pending: bool,
    encrypted: bool,
    _events: Rc<LinkEvents>,
}

impl Link {
    pub fn new(transport: Transport, acl: AclConnection, handle: LinkHandle, config: &L2capConfig) -> Self {
        let acl_end = acl.queue_end();

        let events = Rc::new(LinkEvents { link: handle.clone() });
        let weak_events: Weak<dyn ConnectionManagementCallbacks> = Rc::downgrade(&events) as _;
        acl.register_callbacks(weak_events, handle.handler());

        let on_disconnect = handle.clone();
        acl.register_disconnect_callback(handle.handler(), move |reason| {
            let address = on_disconnect.address();
            on_disconnect.with_manager(|manager| manager.on_link_disconnected(address, reason));
        });

        let inbound = handle.clone();
        acl_end.register_dequeue(
            handle.handler(),
            Rc::new(move || inbound.with_link(|link, services| link.on_acl_data_ready(services))),
        );

        let link = Self {
            transport,
            acl,
            acl_end,
            idle_alarm: Alarm::new(handle.handler()),
            handle,
            config: config.clone(),
            fixed_channels: FixedChannelAllocator::new(transport, config.channel_queue_depth),
            dynamic_channels: DynamicChannelAllocator::new(
                transport.last_dynamic_cid(),
                config.channel_queue_depth,
                config.default_mtu,
            ),
            identifiers: IdentifierAllocator::default(),
            outstanding: BTreeMap::new(),
            parked: VecDeque::new(),
            ref_count: 0,
            authentication_pending: false,
            encrypted: false,
            _events: events,
        };
        link.arm_idle_alarm();
        link
    }

    pub fn address(&self) -> AddressWithType {
        self.handle.address()
    }

    // ---- Fixed channels ----

    pub fn is_fixed_channel_allocated(&self, cid: u16) -> bool {
        self.fixed_channels.is_allocated(cid)
    }

    /// Allocate `cid` and hand the channel to its registered service
    pub fn allocate_fixed_channel(&mut self, cid: u16, services: &Services) {
        let state = self.fixed_channels.allocate(cid);
        register_outbound(&self.handle, cid, &state.link_end);
        let channel = FixedChannel::new(
            cid,
            self.handle.address(),
            state.queue.up_end(),
            self.handle.clone(),
            state.on_close.clone(),
        );
        debug!("Fixed channel 0x{:04x} open to {}", cid, self.handle.address());
        services.notify_fixed_channel_open(channel);

        if self.transport == Transport::Classic && cid == CLASSIC_PAIRING_CID {
            self.request_authentication();
        }
    }

    pub fn acquire_fixed_channel(&mut self, cid: u16) {
        match self.fixed_channels.get_mut(cid) {
            Some(state) => state.acquired = true,
            None => {
                warn!("Acquiring unknown fixed channel 0x{:04x}", cid);
                return;
            }
        }
        self.refresh_ref_count();
    }

    pub fn release_fixed_channel(&mut self, cid: u16) {
        match self.fixed_channels.get_mut(cid) {
            Some(state) => state.acquired = false,
            None => {
                warn!("Releasing unknown fixed channel 0x{:04x}", cid);
                return;
            }
        }
        self.refresh_ref_count();
    }

    // ---- Dynamic channels ----

    /// Send a Connection Request, or park it until the link is encrypted
    pub fn send_connection_request(&mut self, pending: PendingDynamicConnection) {
        if self.transport == Transport::Classic
            && pending.security_policy == SecurityPolicy::EncryptedTransport
            && !self.encrypted
        {
            debug!(
                "Holding connection to {} on {} until the link is encrypted",
                pending.psm,
                self.address()
            );
            self.parked.push_back(pending);
            self.request_authentication();
            return;
        }

        let Some(cid) = self.dynamic_channels.reserve() else {
            warn!("No free dynamic CID on {}", self.address());
            pending.fail(ConnectionResult::l2cap_error(CONNECTION_NO_RESOURCES_AVAILABLE));
            return;
        };
        let psm = pending.psm;
        debug!("Connecting {} on {} from CID 0x{:04x}", psm, self.address(), cid);
        let identifier = self.send_request(SignallingCommand::ConnectionRequest { psm, source_cid: cid });
        self.outstanding
            .insert(identifier, OutstandingRequest::Connection { cid, pending });
    }

    /// Local close: ask the peer, free the channel when it answers
    pub fn close_dynamic_channel(&mut self, cid: u16) {
        let Some(state) = self.dynamic_channels.get_mut(cid) else {
            warn!("Closing unknown dynamic channel 0x{:04x}", cid);
            return;
        };
        if state.closing {
            return;
        }
        state.closing = true;
        let command = SignallingCommand::DisconnectionRequest {
            destination_cid: state.remote_cid,
            source_cid: cid,
        };
        let identifier = self.send_request(command);
        self.outstanding
            .insert(identifier, OutstandingRequest::Disconnection { cid });
    }

    fn free_dynamic_channel(&mut self, cid: u16, reason: ErrorCode) {
        let state = self.dynamic_channels.free(cid);
        debug!(
            "{} dynamic channel 0x{:04x} ({}) on {} closed: {}",
            if state.local_initiated { "Outgoing" } else { "Incoming" },
            cid,
            state.psm,
            self.address(),
            reason
        );
        state.link_end.unregister_dequeue();
        state.on_close.borrow_mut().fire(reason);
        if let Some(target) = state.open_target {
            target.fail(ConnectionResult::new(ConnectionResultCode::FailL2capError));
        }
        self.outstanding.retain(|_, request| match request {
            OutstandingRequest::Connection { .. } => true,
            other => other.cid() != cid,
        });
        self.refresh_ref_count();
    }

    fn open_if_configured(&mut self, cid: u16) {
        let Some(state) = self.dynamic_channels.get_mut(cid) else {
            return;
        };
        if !state.is_configured() {
            return;
        }
        let Some(target) = state.open_target.take() else {
            return;
        };
        info!(
            "Dynamic channel 0x{:04x} ({}) open to {}",
            cid,
            state.psm,
            self.handle.address()
        );
        let channel = DynamicChannel::new(
            cid,
            state.remote_cid,
            state.psm,
            state.remote_mtu,
            self.handle.address(),
            state.queue.up_end(),
            self.handle.clone(),
            state.on_close.clone(),
        );
        target.open(channel);
    }

    // ---- Reference counting ----

    fn refresh_ref_count(&mut self) {
        let count = self.fixed_channels.acquired_count() + self.dynamic_channels.len();
        if count == self.ref_count {
            return;
        }
        let was_idle = self.ref_count == 0;
        self.ref_count = count;
        if count == 0 {
            debug!("Link to {} idle", self.address());
            self.arm_idle_alarm();
        } else if was_idle {
            self.idle_alarm.cancel();
        }
    }

    fn arm_idle_alarm(&self) {
        let link = self.handle.clone();
        self.idle_alarm.schedule(
            move || link.with_link(|link, _| link.on_idle_timeout()),
            self.config.link_idle_timeout,
        );
    }

    fn on_idle_timeout(&mut self) {
        if self.ref_count != 0 {
            return;
        }
        info!("Link to {} unused, disconnecting", self.address());
        self.acl.disconnect(ErrorCode::REMOTE_USER_TERMINATED_CONNECTION);
    }

    // ---- Security ----

    fn request_authentication(&mut self) {
        if self.transport != Transport::Classic || self.encrypted || self.authentication_pending {
            return;
        }
        self.authentication_pending = true;
        self.acl.authentication_requested();
    }

    fn on_authentication_complete(&mut self) {
        debug!("Link to {} authenticated, enabling encryption", self.address());
        self.acl.set_connection_encryption(true);
    }

    /// Opens waiting on this attempt fail; the next one asks again
    fn on_authentication_failed(&mut self, reason: ErrorCode) {
        self.authentication_pending = false;
        info!(
            "Authentication of {} failed: {}, failing {} waiting opens",
            self.address(),
            reason,
            self.parked.len()
        );
        let failure = ConnectionResult::hci_error(reason);
        for pending in self.parked.drain(..) {
            pending.fail(failure);
        }
    }

    fn on_encryption_change(&mut self, enabled: bool) {
        self.encrypted = enabled;
        self.authentication_pending = false;
        if !enabled {
            info!(
                "Encryption off on {}, {} opens still waiting",
                self.address(),
                self.parked.len()
            );
            return;
        }
        let parked = std::mem::take(&mut self.parked);
        for pending in parked {
            self.send_connection_request(pending);
        }
    }

    // ---- Data path ----

    fn on_acl_data_ready(&mut self, services: &Services) {
        let Some(pdu) = self.acl_end.try_dequeue() else {
            return;
        };
        let frame = match BasicFrame::parse(&pdu) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed PDU from {}: {}", self.address(), e);
                return;
            }
        };
        trace!("{} <- {:?}", self.address(), frame);

        if frame.channel_id == self.transport.signalling_cid() {
            self.on_signalling_frame(&frame.payload, services);
        } else if let Some(state) = self.fixed_channels.get(frame.channel_id) {
            state.link_end.enqueue(frame.payload);
        } else if let Some(state) = self.dynamic_channels.get(frame.channel_id) {
            state.link_end.enqueue(frame.payload);
        } else {
            info!(
                "Dropping PDU for unknown CID 0x{:04x} from {}",
                frame.channel_id,
                self.address()
            );
        }
    }

    fn on_channel_data_ready(&mut self, cid: u16) {
        let (sdu, destination) = if let Some(state) = self.fixed_channels.get(cid) {
            match state.link_end.try_dequeue() {
                Some(sdu) => (sdu, cid),
                None => return,
            }
        } else if let Some(state) = self.dynamic_channels.get(cid) {
            let Some(sdu) = state.link_end.try_dequeue() else {
                return;
            };
            if sdu.len() > usize::from(state.remote_mtu) {
                warn!(
                    "Dropping {} byte SDU on 0x{:04x}, peer MTU is {}",
                    sdu.len(),
                    cid,
                    state.remote_mtu
                );
                return;
            }
            (sdu, state.remote_cid)
        } else {
            return;
        };
        self.acl_end.enqueue(BasicFrame::new(destination, sdu).to_bytes());
    }

    // ---- Signalling ----

    fn send_signalling(&self, packet: SignallingPacket) {
        trace!("{} -> {:?}", self.address(), packet);
        let frame = BasicFrame::new(self.transport.signalling_cid(), packet.to_bytes());
        self.acl_end.enqueue(frame.to_bytes());
    }

    fn send_request(&mut self, command: SignallingCommand) -> u8 {
        let outstanding = &self.outstanding;
        let identifier = self.identifiers.next_free(|identifier| outstanding.contains_key(&identifier));
        if let Some(displaced) = self.outstanding.remove(&identifier) {
            warn!("Out of signalling identifiers on {}, dropping request {}", self.address(), identifier);
            self.abandon_request(displaced);
        }
        self.send_signalling(SignallingPacket::new(identifier, command));
        identifier
    }

    /// Give up on a request without sending anything further
    fn abandon_request(&mut self, request: OutstandingRequest) {
        match request {
            OutstandingRequest::Connection { cid, pending } => {
                self.dynamic_channels.release_reserved(cid);
                pending.fail(ConnectionResult::new(ConnectionResultCode::FailL2capError));
            }
            OutstandingRequest::Configuration { cid } | OutstandingRequest::Disconnection { cid } => {
                if self.dynamic_channels.get(cid).is_some() {
                    self.free_dynamic_channel(cid, ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST);
                }
            }
        }
    }

    fn send_response(&self, identifier: u8, command: SignallingCommand) {
        self.send_signalling(SignallingPacket::new(identifier, command));
    }

    fn reject_invalid_cid(&self, identifier: u8, local_cid: u16, remote_cid: u16) {
        let mut data = local_cid.to_le_bytes().to_vec();
        data.extend_from_slice(&remote_cid.to_le_bytes());
        self.send_response(
            identifier,
            SignallingCommand::CommandReject {
                reason: REJECT_INVALID_CID,
                data,
            },
        );
    }

    fn on_signalling_frame(&mut self, payload: &[u8], services: &Services) {
        for packet in SignallingPacket::parse_frame(payload) {
            match packet {
                Ok(packet) => self.on_signalling_packet(packet, services),
                Err(L2capError::UnknownCommand { code, identifier }) => {
                    warn!("Rejecting unknown signalling command 0x{:02x} from {}", code, self.address());
                    self.send_response(
                        identifier,
                        SignallingCommand::CommandReject {
                            reason: REJECT_NOT_UNDERSTOOD,
                            data: Vec::new(),
                        },
                    );
                }
                Err(e) => warn!("Bad signalling command from {}: {}", self.address(), e),
            }
        }
    }

    fn on_signalling_packet(&mut self, packet: SignallingPacket, services: &Services) {
        let SignallingPacket { identifier, command } = packet;
        match command {
            SignallingCommand::ConnectionRequest { psm, source_cid } => {
                self.on_connection_request(identifier, psm, source_cid, services)
            }
            SignallingCommand::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                ..
            } => self.on_connection_response(identifier, destination_cid, source_cid, result),
            SignallingCommand::ConfigurationRequest {
                destination_cid,
                mtu,
                ..
            } => self.on_configuration_request(identifier, destination_cid, mtu),
            SignallingCommand::ConfigurationResponse { result, .. } => {
                self.on_configuration_response(identifier, result)
            }
            SignallingCommand::DisconnectionRequest {
                destination_cid,
                source_cid,
            } => self.on_disconnection_request(identifier, destination_cid, source_cid),
            SignallingCommand::DisconnectionResponse { .. } => self.on_disconnection_response(identifier),
            SignallingCommand::EchoRequest { data } => {
                self.send_response(identifier, SignallingCommand::EchoResponse { data })
            }
            SignallingCommand::InformationRequest { info_type } => self.send_response(
                identifier,
                SignallingCommand::InformationResponse {
                    info_type,
                    result: INFORMATION_NOT_SUPPORTED,
                    data: Vec::new(),
                },
            ),
            SignallingCommand::CommandReject { reason, .. } => self.on_command_reject(identifier, reason),
            SignallingCommand::EchoResponse { .. } | SignallingCommand::InformationResponse { .. } => {
                debug!("Ignoring unsolicited response {} from {}", identifier, self.address())
            }
        }
    }

    fn send_connection_response(&self, identifier: u8, local_cid: u16, remote_cid: u16, result: u16) {
        self.send_response(
            identifier,
            SignallingCommand::ConnectionResponse {
                destination_cid: local_cid,
                source_cid: remote_cid,
                result,
                status: CONNECTION_STATUS_NO_INFO,
            },
        );
    }

    fn on_connection_request(&mut self, identifier: u8, psm: Psm, remote_cid: u16, services: &Services) {
        let Some(service) = services.dynamic.get(psm.value()) else {
            info!("{} asked for unregistered {}", self.address(), psm);
            self.send_connection_response(identifier, 0, remote_cid, CONNECTION_PSM_NOT_SUPPORTED);
            return;
        };
        if self.dynamic_channels.find_by_remote_cid(remote_cid).is_some() {
            warn!("{} reused remote CID 0x{:04x}", self.address(), remote_cid);
            self.send_connection_response(identifier, 0, remote_cid, CONNECTION_SOURCE_CID_ALREADY_ALLOCATED);
            return;
        }
        if self.transport == Transport::Classic
            && service.security_policy == SecurityPolicy::EncryptedTransport
            && !self.encrypted
        {
            info!("Blocking {} on unencrypted link to {}", psm, self.address());
            self.send_connection_response(identifier, 0, remote_cid, CONNECTION_SECURITY_BLOCK);
            self.request_authentication();
            return;
        }

        let target = service.open_target();
        let Some(state) = self.dynamic_channels.allocate(psm, remote_cid) else {
            self.send_connection_response(identifier, 0, remote_cid, CONNECTION_NO_RESOURCES_AVAILABLE);
            return;
        };
        state.open_target = Some(target);
        let cid = state.cid;
        register_outbound(&self.handle, cid, &state.link_end);

        self.send_connection_response(identifier, cid, remote_cid, CONNECTION_SUCCESS);
        self.refresh_ref_count();
        self.send_configuration_request(cid);
    }

    fn on_connection_response(&mut self, identifier: u8, remote_cid: u16, local_cid: u16, result: u16) {
        let (cid, pending) = match self.outstanding.remove(&identifier) {
            Some(OutstandingRequest::Connection { cid, pending }) => (cid, pending),
            Some(other) => {
                warn!("Connection Response {} answers a different request", identifier);
                self.outstanding.insert(identifier, other);
                return;
            }
            None => {
                warn!("Unexpected Connection Response {} from {}", identifier, self.address());
                return;
            }
        };
        if cid != local_cid {
            warn!(
                "Connection Response names CID 0x{:04x}, expected 0x{:04x}",
                local_cid, cid
            );
        }

        match result {
            CONNECTION_SUCCESS => {
                let invalid = if remote_cid < FIRST_DYNAMIC_CID {
                    Some(CONNECTION_INVALID_CID)
                } else if self.dynamic_channels.find_by_remote_cid(remote_cid).is_some() {
                    Some(CONNECTION_SOURCE_CID_ALREADY_ALLOCATED)
                } else {
                    None
                };
                if let Some(result) = invalid {
                    warn!(
                        "{} accepted {} with unusable CID 0x{:04x}, disconnecting",
                        self.address(),
                        pending.psm,
                        remote_cid
                    );
                    self.dynamic_channels.release_reserved(cid);
                    // Untracked: the channel never existed on our side
                    self.send_request(SignallingCommand::DisconnectionRequest {
                        destination_cid: remote_cid,
                        source_cid: cid,
                    });
                    pending.fail(ConnectionResult::l2cap_error(result));
                    return;
                }
                let state = self
                    .dynamic_channels
                    .allocate_reserved(cid, pending.psm, remote_cid, true);
                state.open_target = Some(OpenTarget::Requester(pending));
                register_outbound(&self.handle, cid, &state.link_end);
                self.refresh_ref_count();
                self.send_configuration_request(cid);
            }
            CONNECTION_PENDING => {
                debug!("Connection for CID 0x{:04x} pending at {}", cid, self.address());
                self.outstanding
                    .insert(identifier, OutstandingRequest::Connection { cid, pending });
            }
            result => {
                info!(
                    "{} refused {} with result 0x{:04x}",
                    self.address(),
                    pending.psm,
                    result
                );
                self.dynamic_channels.release_reserved(cid);
                pending.fail(ConnectionResult::l2cap_error(result));
            }
        }
    }

    fn send_configuration_request(&mut self, cid: u16) {
        let Some(state) = self.dynamic_channels.get(cid) else {
            return;
        };
        let command = SignallingCommand::ConfigurationRequest {
            destination_cid: state.remote_cid,
            flags: 0,
            mtu: Some(self.config.default_mtu),
        };
        let identifier = self.send_request(command);
        self.outstanding
            .insert(identifier, OutstandingRequest::Configuration { cid });
    }

    fn on_configuration_request(&mut self, identifier: u8, local_cid: u16, mtu: Option<u16>) {
        let Some(state) = self.dynamic_channels.get_mut(local_cid) else {
            self.reject_invalid_cid(identifier, local_cid, 0);
            return;
        };
        if let Some(mtu) = mtu {
            state.remote_mtu = mtu;
        }
        state.incoming_configured = true;
        let remote_cid = state.remote_cid;
        self.send_response(
            identifier,
            SignallingCommand::ConfigurationResponse {
                source_cid: remote_cid,
                flags: 0,
                result: CONFIGURATION_SUCCESS,
                mtu: None,
            },
        );
        self.open_if_configured(local_cid);
    }

    fn on_configuration_response(&mut self, identifier: u8, result: u16) {
        let cid = match self.outstanding.remove(&identifier) {
            Some(OutstandingRequest::Configuration { cid }) => cid,
            Some(other) => {
                warn!("Configuration Response {} answers a different request", identifier);
                self.outstanding.insert(identifier, other);
                return;
            }
            None => {
                warn!("Unexpected Configuration Response {} from {}", identifier, self.address());
                return;
            }
        };
        if result != CONFIGURATION_SUCCESS {
            warn!(
                "{} refused configuration of 0x{:04x}: 0x{:04x}",
                self.address(),
                cid,
                result
            );
            self.close_dynamic_channel(cid);
            return;
        }
        if let Some(state) = self.dynamic_channels.get_mut(cid) {
            state.outgoing_configured = true;
        }
        self.open_if_configured(cid);
    }

    fn on_disconnection_request(&mut self, identifier: u8, local_cid: u16, remote_cid: u16) {
        let known = self
            .dynamic_channels
            .get(local_cid)
            .is_some_and(|state| state.remote_cid == remote_cid);
        if !known {
            self.reject_invalid_cid(identifier, local_cid, remote_cid);
            return;
        }
        self.send_response(
            identifier,
            SignallingCommand::DisconnectionResponse {
                destination_cid: local_cid,
                source_cid: remote_cid,
            },
        );
        self.free_dynamic_channel(local_cid, ErrorCode::REMOTE_USER_TERMINATED_CONNECTION);
    }

    fn on_disconnection_response(&mut self, identifier: u8) {
        match self.outstanding.remove(&identifier) {
            Some(OutstandingRequest::Disconnection { cid }) => {
                self.free_dynamic_channel(cid, ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST)
            }
            Some(other) => {
                warn!("Disconnection Response {} answers a different request", identifier);
                self.outstanding.insert(identifier, other);
            }
            None => warn!("Unexpected Disconnection Response {} from {}", identifier, self.address()),
        }
    }

    fn on_command_reject(&mut self, identifier: u8, reason: u16) {
        let Some(request) = self.outstanding.remove(&identifier) else {
            debug!("Command Reject {} matches nothing we sent", identifier);
            return;
        };
        info!(
            "{} rejected request {} with reason 0x{:04x}",
            self.address(),
            identifier,
            reason
        );
        match request {
            OutstandingRequest::Connection { cid, pending } => {
                self.dynamic_channels.release_reserved(cid);
                pending.fail(ConnectionResult::new(ConnectionResultCode::FailL2capError));
            }
            OutstandingRequest::Configuration { cid } => self.close_dynamic_channel(cid),
            OutstandingRequest::Disconnection { cid } => {
                self.free_dynamic_channel(cid, ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST)
            }
        }
    }

    // ---- Teardown ----

    /// The ACL is gone: fail waiters, close every channel and release the ACL
    pub fn on_acl_disconnect(&mut self, reason: ErrorCode) {
        info!("Link to {} down: {}", self.address(), reason);
        self.idle_alarm.cancel();
        self.acl_end.unregister_dequeue();

        let failure = ConnectionResult::hci_error(reason);
        for pending in self.parked.drain(..) {
            pending.fail(failure);
        }
        for (_, request) in std::mem::take(&mut self.outstanding) {
            if let OutstandingRequest::Connection { pending, .. } = request {
                pending.fail(failure);
            }
        }
        for state in self.fixed_channels.drain() {
            trace!("Closing fixed channel 0x{:04x}", state.cid);
            state.link_end.unregister_dequeue();
            state.on_close.borrow_mut().fire(reason);
        }
        for state in self.dynamic_channels.drain() {
            state.link_end.unregister_dequeue();
            state.on_close.borrow_mut().fire(reason);
            if let Some(target) = state.open_target {
                target.fail(failure);
            }
        }
        self.ref_count = 0;
        self.acl.finish();
    }
}

fn register_outbound(handle: &LinkHandle, cid: u16, link_end: &BidiQueueEnd<Vec<u8>>) {
    let link = handle.clone();
    link_end.register_dequeue(
        handle.handler(),
        Rc::new(move || link.with_link(|link, _| link.on_channel_data_ready(cid))),
    );
}
