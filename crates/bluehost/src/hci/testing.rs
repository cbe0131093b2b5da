//! In-memory HCI layer for driving the connection layer from tests

use crate::hci::address::{Address, AddressType, AddressWithType, Role};
use crate::hci::constants::*;
use crate::hci::error_code::ErrorCode;
use crate::hci::event::HciEvent;
use crate::hci::layer::{CommandCallback, CommandResult, CompletedPacketsCallback, EventCallback, HciLayer};
use crate::hci::packet::{AclPacket, HciCommand, PacketBoundaryFlag};
use crate::os::{BidiQueue, BidiQueueEnd, Handler};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

const FAKE_ACL_QUEUE_DEPTH: usize = 1024;

#[derive(Default)]
struct FakeState {
    commands: VecDeque<(HciCommand, Handler, CommandCallback)>,
    event_handlers: BTreeMap<u8, (Handler, EventCallback)>,
    le_event_handlers: BTreeMap<u8, (Handler, EventCallback)>,
    completed_packets: Option<(Handler, CompletedPacketsCallback)>,
}

/// Records commands and lets a test play the controller
pub(crate) struct FakeHciLayer {
    state: RefCell<FakeState>,
    acl: BidiQueue<Vec<u8>>,
    controller_end: BidiQueueEnd<Vec<u8>>,
}

impl FakeHciLayer {
    pub fn new() -> Rc<Self> {
        let acl = BidiQueue::new("fake-hci-acl", FAKE_ACL_QUEUE_DEPTH, FAKE_ACL_QUEUE_DEPTH);
        let controller_end = acl.down_end();
        Rc::new(Self {
            state: RefCell::new(FakeState::default()),
            acl,
            controller_end,
        })
    }

    pub fn pending_commands(&self) -> usize {
        self.state.borrow().commands.len()
    }

    /// Take the oldest command and answer it with a Command Status
    pub fn pop_command(&self, status: ErrorCode) -> Option<HciCommand> {
        self.pop_command_complete(status, Vec::new())
    }

    /// Take the oldest command and answer it with return parameters
    pub fn pop_command_complete(&self, status: ErrorCode, return_parameters: Vec<u8>) -> Option<HciCommand> {
        let (command, handler, callback) = self.state.borrow_mut().commands.pop_front()?;
        let result = CommandResult {
            opcode: command.opcode(),
            status,
            return_parameters,
        };
        handler.post(move || callback(result));
        Some(command)
    }

    /// Drain the command queue, acknowledging each with success
    pub fn take_commands(&self) -> Vec<HciCommand> {
        std::iter::from_fn(|| self.pop_command(ErrorCode::SUCCESS)).collect()
    }

    pub fn inject_event(&self, event: HciEvent) {
        let state = self.state.borrow();
        let target = match event.le_subevent_code() {
            Some(subevent_code) => state.le_event_handlers.get(&subevent_code),
            None => state.event_handlers.get(&event.event_code),
        };
        let (handler, callback) = target
            .cloned()
            .unwrap_or_else(|| panic!("no handler for event 0x{:02x}", event.event_code));
        handler.post(move || callback(event));
    }

    pub fn complete_packets(&self, handle: u16, count: u16) {
        let (handler, callback) = self
            .state
            .borrow()
            .completed_packets
            .clone()
            .expect("completed packets callback not registered");
        handler.post(move || callback(handle, count));
    }

    /// Deliver a serialized ACL frame as if received from the controller
    pub fn inject_acl(&self, frame: Vec<u8>) {
        self.controller_end.enqueue(frame);
    }

    /// Frames the host has handed to the controller so far
    pub fn sent_acl(&self) -> Vec<AclPacket> {
        std::iter::from_fn(|| self.controller_end.try_dequeue())
            .map(|bytes| AclPacket::parse(&bytes).expect("host sent malformed ACL frame"))
            .collect()
    }

    pub fn has_event_handler(&self, event_code: u8) -> bool {
        self.state.borrow().event_handlers.contains_key(&event_code)
    }

    pub fn has_le_event_handler(&self, subevent_code: u8) -> bool {
        self.state.borrow().le_event_handlers.contains_key(&subevent_code)
    }
}

impl HciLayer for FakeHciLayer {
    fn enqueue_command(&self, command: HciCommand, handler: &Handler, on_result: CommandCallback) {
        self.state
            .borrow_mut()
            .commands
            .push_back((command, handler.clone(), on_result));
    }

    fn register_event_handler(&self, event_code: u8, handler: &Handler, callback: EventCallback) {
        self.state
            .borrow_mut()
            .event_handlers
            .insert(event_code, (handler.clone(), callback));
    }

    fn register_le_event_handler(&self, subevent_code: u8, handler: &Handler, callback: EventCallback) {
        self.state
            .borrow_mut()
            .le_event_handlers
            .insert(subevent_code, (handler.clone(), callback));
    }

    fn unregister_event_handler(&self, event_code: u8) {
        self.state.borrow_mut().event_handlers.remove(&event_code);
    }

    fn unregister_le_event_handler(&self, subevent_code: u8) {
        self.state.borrow_mut().le_event_handlers.remove(&subevent_code);
    }

    fn register_completed_packets_callback(&self, handler: &Handler, callback: CompletedPacketsCallback) {
        self.state.borrow_mut().completed_packets = Some((handler.clone(), callback));
    }

    fn acl_queue_end(&self) -> BidiQueueEnd<Vec<u8>> {
        self.acl.up_end()
    }
}

pub(crate) fn connection_complete(status: ErrorCode, handle: u16, address: Address) -> HciEvent {
    let mut params = vec![status.0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.extend_from_slice(address.as_slice());
    params.push(LINK_TYPE_ACL);
    params.push(0x00); // encryption disabled
    HciEvent::new(EVT_CONN_COMPLETE, params)
}

pub(crate) fn connection_request(address: Address) -> HciEvent {
    let mut params = address.as_slice().to_vec();
    params.extend_from_slice(&[0x0C, 0x02, 0x5A]); // class of device
    params.push(LINK_TYPE_ACL);
    HciEvent::new(EVT_CONN_REQUEST, params)
}

pub(crate) fn disconnection_complete(handle: u16, reason: ErrorCode) -> HciEvent {
    let mut params = vec![ErrorCode::SUCCESS.0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(reason.0);
    HciEvent::new(EVT_DISCONN_COMPLETE, params)
}

pub(crate) fn authentication_complete(status: ErrorCode, handle: u16) -> HciEvent {
    let mut params = vec![status.0];
    params.extend_from_slice(&handle.to_le_bytes());
    HciEvent::new(EVT_AUTH_COMPLETE, params)
}

pub(crate) fn encryption_change(status: ErrorCode, handle: u16, enabled: bool) -> HciEvent {
    let mut params = vec![status.0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(enabled as u8);
    HciEvent::new(EVT_ENCRYPTION_CHANGE, params)
}

pub(crate) fn role_change(address: Address, role: Role) -> HciEvent {
    let mut params = vec![ErrorCode::SUCCESS.0];
    params.extend_from_slice(address.as_slice());
    params.push(u8::from(role));
    HciEvent::new(EVT_ROLE_CHANGE, params)
}

pub(crate) fn le_connection_complete(
    status: ErrorCode,
    handle: u16,
    role: Role,
    peer: AddressWithType,
) -> HciEvent {
    let mut params = vec![EVT_LE_CONN_COMPLETE, status.0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(u8::from(role));
    params.push(u8::from(peer.address_type));
    params.extend_from_slice(peer.address.as_slice());
    params.extend_from_slice(&0x0028u16.to_le_bytes()); // interval
    params.extend_from_slice(&0x0000u16.to_le_bytes()); // latency
    params.extend_from_slice(&0x01F4u16.to_le_bytes()); // supervision timeout
    HciEvent::new(EVT_LE_META_EVENT, params)
}

pub(crate) fn le_enhanced_connection_complete(
    status: ErrorCode,
    handle: u16,
    role: Role,
    peer: AddressWithType,
    peer_resolvable_private_address: Address,
) -> HciEvent {
    let mut params = vec![EVT_LE_ENHANCED_CONN_COMPLETE, status.0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(u8::from(role));
    params.push(u8::from(peer.address_type));
    params.extend_from_slice(peer.address.as_slice());
    params.extend_from_slice(Address::EMPTY.as_slice()); // local RPA
    params.extend_from_slice(peer_resolvable_private_address.as_slice());
    params.extend_from_slice(&0x0028u16.to_le_bytes()); // interval
    params.extend_from_slice(&0x0000u16.to_le_bytes()); // latency
    params.extend_from_slice(&0x01F4u16.to_le_bytes()); // supervision timeout
    params.push(0x00); // central clock accuracy
    HciEvent::new(EVT_LE_META_EVENT, params)
}

pub(crate) fn mode_change(handle: u16, mode: u8, interval: u16) -> HciEvent {
    let mut params = vec![ErrorCode::SUCCESS.0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(mode);
    params.extend_from_slice(&interval.to_le_bytes());
    HciEvent::new(EVT_MODE_CHANGE, params)
}

pub(crate) fn read_remote_version_complete(handle: u16, version: u8, manufacturer: u16, subversion: u16) -> HciEvent {
    let mut params = vec![ErrorCode::SUCCESS.0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.push(version);
    params.extend_from_slice(&manufacturer.to_le_bytes());
    params.extend_from_slice(&subversion.to_le_bytes());
    HciEvent::new(EVT_READ_REMOTE_VERSION_COMPLETE, params)
}

pub(crate) fn read_remote_features_complete(status: ErrorCode, handle: u16, features: u64) -> HciEvent {
    let mut params = vec![status.0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.extend_from_slice(&features.to_le_bytes());
    HciEvent::new(EVT_READ_REMOTE_FEATURES_COMPLETE, params)
}

pub(crate) fn read_clock_offset_complete(handle: u16, clock_offset: u16) -> HciEvent {
    let mut params = vec![ErrorCode::SUCCESS.0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.extend_from_slice(&clock_offset.to_le_bytes());
    HciEvent::new(EVT_READ_CLOCK_OFFSET_COMPLETE, params)
}

pub(crate) fn le_connection_update_complete(status: ErrorCode, handle: u16) -> HciEvent {
    let mut params = vec![EVT_LE_CONN_UPDATE_COMPLETE, status.0];
    params.extend_from_slice(&handle.to_le_bytes());
    params.extend_from_slice(&0x0030u16.to_le_bytes());
    params.extend_from_slice(&0x0000u16.to_le_bytes());
    params.extend_from_slice(&0x01F4u16.to_le_bytes());
    HciEvent::new(EVT_LE_META_EVENT, params)
}

/// An L2CAP basic frame carried in a single ACL frame
pub(crate) fn acl_frame(handle: u16, boundary_flag: PacketBoundaryFlag, payload: Vec<u8>) -> Vec<u8> {
    AclPacket::new(handle, boundary_flag, payload).to_bytes()
}

pub(crate) fn random_peer(last: u8) -> AddressWithType {
    AddressWithType::new(
        Address::new([last, 0x22, 0x33, 0x44, 0x55, 0x66]),
        AddressType::RandomDevice,
    )
}
