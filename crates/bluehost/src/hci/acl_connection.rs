//! Per-connection state and the client-facing connection proxy

use crate::error::AclError;
use crate::hci::acl_manager::AclManagerImpl;
use crate::hci::address::{Address, AddressWithType, Role};
use crate::hci::callbacks::{CallbackRegistration, ConnectionManagementCallbacks};
use crate::hci::error_code::ErrorCode;
use crate::hci::packet::{HciCommand, LinkPolicySettings, PacketBoundaryFlag, PacketTypes};
use crate::os::{BidiQueue, BidiQueueEnd, DeferredCallback, Handler};
use log::{error, warn};
use std::cell::RefCell;
use std::rc::Weak;

const L2CAP_BASIC_HEADER_SIZE: usize = 4;

/// Reassembles L2CAP PDUs from inbound ACL fragments
#[derive(Debug, Default)]
pub(crate) struct Recombiner {
    stage: Vec<u8>,
    remaining: usize,
}

impl Recombiner {
    /// Feed one fragment. Returns the PDU once it is complete.
    pub fn on_fragment(
        &mut self,
        boundary_flag: PacketBoundaryFlag,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, AclError> {
        match boundary_flag {
            PacketBoundaryFlag::FirstNonAutomaticallyFlushable => Err(AclError::FirstNonFlushable),
            PacketBoundaryFlag::CompleteL2capPdu => Err(AclError::CompleteNotAllowed),
            PacketBoundaryFlag::ContinuingFragment => {
                if self.stage.is_empty() {
                    return Err(AclError::UnexpectedContinuation);
                }
                if self.remaining < payload.len() {
                    let remaining = self.remaining;
                    self.reset();
                    return Err(AclError::ContinuationOverflow {
                        payload: payload.len(),
                        remaining,
                    });
                }
                self.remaining -= payload.len();
                self.stage.extend_from_slice(&payload);
                if self.remaining > 0 {
                    return Ok(None);
                }
                Ok(Some(std::mem::take(&mut self.stage)))
            }
            PacketBoundaryFlag::FirstAutomaticallyFlushable => {
                if !self.stage.is_empty() {
                    error!("Controller sent a starting packet without finishing previous packet. Drop previous one.");
                    self.reset();
                }
                if payload.len() < L2CAP_BASIC_HEADER_SIZE {
                    return Err(AclError::ShortStartFragment(payload.len()));
                }
                let declared = u16::from_le_bytes([payload[0], payload[1]]) as usize;
                let carried = payload.len() - L2CAP_BASIC_HEADER_SIZE;
                if declared > carried {
                    self.remaining = declared - carried;
                    self.stage = payload;
                    return Ok(None);
                }
                Ok(Some(payload))
            }
        }
    }

    pub fn has_partial(&self) -> bool {
        !self.stage.is_empty()
    }

    fn reset(&mut self) {
        self.stage.clear();
        self.remaining = 0;
    }
}

/// Everything the ACL manager tracks for one open handle
pub(crate) struct ConnectionState {
    pub address_with_type: AddressWithType,
    pub role: Role,
    pub queue: BidiQueue<Vec<u8>>,
    /// Manager side of `queue`: receives outbound PDUs, sends reassembled ones up
    pub manager_end: BidiQueueEnd<Vec<u8>>,
    pub recombiner: Recombiner,
    pub is_disconnected: bool,
    pub disconnect_reason: Option<ErrorCode>,
    /// Whether the round-robin scheduler is listening on `manager_end`
    pub is_registered: bool,
    /// Fragments handed to the controller and not yet acknowledged
    pub sent_packets: u16,
    pub on_disconnect: DeferredCallback<ErrorCode>,
    pub management_callbacks: Option<CallbackRegistration<dyn ConnectionManagementCallbacks>>,
    pub on_connection_update: Option<(Handler, Box<dyn FnOnce(ErrorCode)>)>,
}

impl ConnectionState {
    pub fn new(
        handle: u16,
        address_with_type: AddressWithType,
        role: Role,
        inbound_depth: usize,
        outbound_depth: usize,
    ) -> Self {
        let queue = BidiQueue::new(
            &format!("acl-0x{:04x}", handle),
            inbound_depth,
            outbound_depth,
        );
        let manager_end = queue.down_end();
        Self {
            address_with_type,
            role,
            queue,
            manager_end,
            recombiner: Recombiner::default(),
            is_disconnected: false,
            disconnect_reason: None,
            is_registered: false,
            sent_packets: 0,
            on_disconnect: DeferredCallback::new(),
            management_callbacks: None,
            on_connection_update: None,
        }
    }

    /// Push a reassembled PDU to the upper layer
    pub fn deliver(&self, pdu: Vec<u8>) {
        if !self.manager_end.enqueue(pdu) {
            warn!(
                "Dropping packet due to congestion from remote: {}",
                self.address_with_type
            );
        }
    }
}

/// LE connection parameters requested through [`AclConnection::le_connection_update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionUpdateParameters {
    pub conn_interval_min: u16,
    pub conn_interval_max: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
    pub min_ce_length: u16,
    pub max_ce_length: u16,
}

/// Handle to one established ACL connection.
///
/// Operations are posted to the ACL manager's handler; results come back
/// through [`ConnectionManagementCallbacks`] or the supplied callbacks.
pub struct AclConnection {
    handle: u16,
    address_with_type: AddressWithType,
    role: Role,
    queue_end: BidiQueueEnd<Vec<u8>>,
    manager: Weak<RefCell<AclManagerImpl>>,
    manager_handler: Handler,
}

impl AclConnection {
    pub(crate) fn new(
        handle: u16,
        address_with_type: AddressWithType,
        role: Role,
        queue_end: BidiQueueEnd<Vec<u8>>,
        manager: Weak<RefCell<AclManagerImpl>>,
        manager_handler: Handler,
    ) -> Self {
        Self {
            handle,
            address_with_type,
            role,
            queue_end,
            manager,
            manager_handler,
        }
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    pub fn address(&self) -> Address {
        self.address_with_type.address
    }

    pub fn address_with_type(&self) -> AddressWithType {
        self.address_with_type
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Upper end of the data queue: enqueue PDUs to send, dequeue received ones
    pub fn queue_end(&self) -> BidiQueueEnd<Vec<u8>> {
        self.queue_end.clone()
    }

    pub fn register_callbacks(
        &self,
        callbacks: Weak<dyn ConnectionManagementCallbacks>,
        handler: &Handler,
    ) {
        let handle = self.handle;
        let registration = CallbackRegistration::new(callbacks, handler);
        self.post(move |manager| manager.register_management_callbacks(handle, registration));
    }

    /// `callback` runs exactly once with the disconnect reason, even when
    /// registered after the disconnection already happened.
    pub fn register_disconnect_callback<F: FnOnce(ErrorCode) + 'static>(
        &self,
        handler: &Handler,
        callback: F,
    ) {
        let handle = self.handle;
        let handler = handler.clone();
        self.post(move |manager| manager.register_disconnect_callback(handle, &handler, callback));
    }

    pub fn disconnect(&self, reason: ErrorCode) {
        let handle = self.handle;
        self.post(move |manager| manager.handle_disconnect(handle, reason));
    }

    pub fn authentication_requested(&self) {
        let handle = self.handle;
        self.post(move |manager| manager.handle_authentication_requested(handle));
    }

    pub fn set_connection_encryption(&self, enable: bool) {
        let handle = self.handle;
        self.post(move |manager| manager.handle_set_connection_encryption(handle, enable));
    }

    pub fn change_connection_packet_type(&self, packet_type: PacketTypes) {
        let handle = self.handle;
        self.post(move |manager| manager.handle_change_connection_packet_type(handle, packet_type));
    }

    pub fn flush(&self) {
        let handle = self.handle;
        self.post(move |manager| manager.handle_flush(handle));
    }

    pub fn read_rssi(&self) {
        let handle = self.handle;
        self.post(move |manager| manager.handle_read_rssi(handle));
    }

    pub fn hold_mode(&self, max_interval: u16, min_interval: u16) {
        self.send(
            "Hold mode",
            HciCommand::HoldMode {
                handle: self.handle,
                max_interval,
                min_interval,
            },
        );
    }

    pub fn sniff_mode(&self, max_interval: u16, min_interval: u16, attempt: u16, timeout: u16) {
        self.send(
            "Sniff mode",
            HciCommand::SniffMode {
                handle: self.handle,
                max_interval,
                min_interval,
                attempt,
                timeout,
            },
        );
    }

    pub fn exit_sniff_mode(&self) {
        self.send("Exit sniff mode", HciCommand::ExitSniffMode { handle: self.handle });
    }

    /// Ask the controller to take `role` on this link. The outcome arrives
    /// as a role change through [`AclManagerCallbacks`](super::AclManagerCallbacks).
    pub fn switch_role(&self, role: Role) {
        self.send(
            "Switch role",
            HciCommand::SwitchRole {
                bd_addr: self.address(),
                role,
            },
        );
    }

    pub fn write_link_policy_settings(&self, settings: LinkPolicySettings) {
        self.send(
            "Write link policy settings",
            HciCommand::WriteLinkPolicySettings {
                handle: self.handle,
                settings,
            },
        );
    }

    pub fn write_link_supervision_timeout(&self, timeout: u16) {
        self.send(
            "Write link supervision timeout",
            HciCommand::WriteLinkSupervisionTimeout {
                handle: self.handle,
                timeout,
            },
        );
    }

    pub fn role_discovery(&self) {
        let handle = self.handle;
        self.post(move |manager| manager.handle_role_discovery(handle));
    }

    pub fn read_link_policy_settings(&self) {
        let handle = self.handle;
        self.post(move |manager| manager.handle_read_link_policy_settings(handle));
    }

    pub fn read_link_supervision_timeout(&self) {
        let handle = self.handle;
        self.post(move |manager| manager.handle_read_link_supervision_timeout(handle));
    }

    /// Result arrives with the Read Remote Version Information Complete event
    pub fn read_remote_version_information(&self) {
        self.send(
            "Read remote version",
            HciCommand::ReadRemoteVersionInformation { handle: self.handle },
        );
    }

    pub fn read_remote_supported_features(&self) {
        self.send(
            "Read remote features",
            HciCommand::ReadRemoteSupportedFeatures { handle: self.handle },
        );
    }

    pub fn read_clock_offset(&self) {
        self.send("Read clock offset", HciCommand::ReadClockOffset { handle: self.handle });
    }

    pub fn le_connection_update<F: FnOnce(ErrorCode) + 'static>(
        &self,
        parameters: ConnectionUpdateParameters,
        handler: &Handler,
        on_complete: F,
    ) {
        let handle = self.handle;
        let handler = handler.clone();
        self.post(move |manager| {
            manager.handle_le_connection_update(handle, parameters, handler, Box::new(on_complete))
        });
    }

    /// Release the connection record. Only valid after disconnection.
    pub fn finish(&self) {
        let handle = self.handle;
        self.post(move |manager| manager.cleanup(handle));
    }

    /// Issue a command whose only immediate result is a status
    fn send(&self, operation: &'static str, command: HciCommand) {
        let handle = self.handle;
        self.post(move |manager| manager.handle_management_command(handle, operation, command));
    }

    fn post<F: FnOnce(&mut AclManagerImpl) + 'static>(&self, f: F) {
        let manager = self.manager.clone();
        self.manager_handler.post(move || {
            if let Some(manager) = manager.upgrade() {
                f(&mut manager.borrow_mut());
            }
        });
    }
}

impl std::fmt::Debug for AclConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclConnection")
            .field("handle", &format_args!("0x{:04x}", self.handle))
            .field("address", &self.address_with_type)
            .finish()
    }
}
