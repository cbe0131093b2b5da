//! L2CAP driven end to end through the ACL manager and a fake controller

use super::constants::*;
use super::*;
use crate::config::{AclManagerConfig, L2capConfig};
use crate::hci::testing::*;
use crate::hci::{AclManager, Address, AddressWithType, ErrorCode, HciCommand, PacketBoundaryFlag, Role};
use crate::os::{Handler, Looper};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

const HANDLE: u16 = 0x0040;

struct Harness {
    looper: Looper,
    client: Handler,
    _acl_handler: Handler,
    _l2cap_handler: Handler,
    hci: Rc<FakeHciLayer>,
    acl: AclManager,
    l2cap: L2capModule,
}

#[derive(Default)]
struct ConnectRecorder {
    opened: RefCell<Vec<DynamicChannel>>,
    failed: RefCell<Vec<ConnectionResult>>,
}

struct FixedRegistration {
    result: RegistrationResult,
    service: Option<FixedChannelService>,
    opened: Rc<RefCell<Vec<FixedChannel>>>,
}

struct DynamicRegistration {
    result: RegistrationResult,
    opened: Rc<RefCell<Vec<DynamicChannel>>>,
}

impl Harness {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let looper = Looper::new();
        let acl_handler = looper.new_handler("acl");
        let l2cap_handler = looper.new_handler("l2cap");
        let client = looper.new_handler("client");
        let hci = FakeHciLayer::new();
        let config = AclManagerConfig {
            max_acl_packet_credits: 64,
            ..AclManagerConfig::default()
        };
        let acl = AclManager::new(hci.clone(), &acl_handler, config);
        let l2cap = L2capModule::new(&acl, &l2cap_handler, L2capConfig::classic(), L2capConfig::le());
        looper.run_until_idle();

        Self {
            looper,
            client,
            _acl_handler: acl_handler,
            _l2cap_handler: l2cap_handler,
            hci,
            acl,
            l2cap,
        }
    }

    fn run(&self) {
        self.looper.run_until_idle();
    }

    fn register_fixed(&self, manager: &FixedChannelManager, cid: u16) -> FixedRegistration {
        let answer = Rc::new(RefCell::new(None));
        let opened = Rc::new(RefCell::new(Vec::new()));
        let (answered, on_open) = (answer.clone(), opened.clone());
        manager.register_service(
            cid,
            &self.client,
            move |result, service| *answered.borrow_mut() = Some((result, service)),
            move |channel| on_open.borrow_mut().push(channel),
        );
        self.run();
        let (result, service) = answer.borrow_mut().take().expect("registration not answered");
        FixedRegistration {
            result,
            service,
            opened,
        }
    }

    fn register_dynamic(
        &self,
        manager: &DynamicChannelManager,
        psm: Psm,
        security_policy: SecurityPolicy,
    ) -> DynamicRegistration {
        let answer = Rc::new(RefCell::new(None));
        let opened = Rc::new(RefCell::new(Vec::new()));
        let (answered, on_open) = (answer.clone(), opened.clone());
        manager.register_service(
            psm,
            security_policy,
            &self.client,
            move |result, _service| *answered.borrow_mut() = Some(result),
            move |channel| on_open.borrow_mut().push(channel),
        );
        self.run();
        let result = answer.borrow_mut().take().expect("registration not answered");
        DynamicRegistration { result, opened }
    }

    fn connect_services(&self, manager: &FixedChannelManager, device: AddressWithType) -> Rc<RefCell<Vec<ConnectionResult>>> {
        let failures = Rc::new(RefCell::new(Vec::new()));
        let recorded = failures.clone();
        manager.connect_services(device, &self.client, move |result| recorded.borrow_mut().push(result));
        self.run();
        failures
    }

    fn connect_channel(
        &self,
        manager: &DynamicChannelManager,
        device: AddressWithType,
        psm: Psm,
        security_policy: SecurityPolicy,
    ) -> Rc<ConnectRecorder> {
        let recorder = Rc::new(ConnectRecorder::default());
        let (on_open, on_fail) = (recorder.clone(), recorder.clone());
        manager.connect_channel(
            device,
            psm,
            security_policy,
            &self.client,
            move |channel| on_open.opened.borrow_mut().push(channel),
            move |result| on_fail.failed.borrow_mut().push(result),
        );
        self.run();
        recorder
    }

    fn complete_classic_connect(&self, handle: u16, address: Address) {
        let command = self.hci.pop_command(ErrorCode::SUCCESS);
        assert!(matches!(command, Some(HciCommand::CreateConnection { bd_addr, .. }) if bd_addr == address));
        self.run();
        self.hci
            .inject_event(connection_complete(ErrorCode::SUCCESS, handle, address));
        self.run();
    }

    fn complete_le_connect(&self, handle: u16, peer: AddressWithType) {
        let command = self.hci.pop_command(ErrorCode::SUCCESS);
        assert!(matches!(command, Some(HciCommand::LeCreateConnection { peer_address, .. }) if peer_address == peer.address));
        self.run();
        self.hci
            .inject_event(le_connection_complete(ErrorCode::SUCCESS, handle, Role::Central, peer));
        self.run();
    }

    /// PDUs the host sent, drained
    fn sent_frames(&self) -> Vec<BasicFrame> {
        self.hci
            .sent_acl()
            .into_iter()
            .map(|packet| BasicFrame::parse(&packet.payload).expect("host sent malformed PDU"))
            .collect()
    }

    fn sent_signalling(&self, cid: u16) -> Vec<SignallingPacket> {
        signalling_in(&self.sent_frames(), cid)
    }

    fn inject_pdu(&self, handle: u16, cid: u16, payload: Vec<u8>) {
        self.hci.inject_acl(acl_frame(
            handle,
            PacketBoundaryFlag::FirstAutomaticallyFlushable,
            BasicFrame::new(cid, payload).to_bytes(),
        ));
        self.run();
    }

    fn inject_signalling(&self, handle: u16, identifier: u8, command: SignallingCommand) {
        self.inject_pdu(
            handle,
            CLASSIC_SIGNALLING_CID,
            SignallingPacket::new(identifier, command).to_bytes(),
        );
    }
}

fn signalling_in(frames: &[BasicFrame], cid: u16) -> Vec<SignallingPacket> {
    frames
        .iter()
        .filter(|frame| frame.channel_id == cid)
        .flat_map(|frame| SignallingPacket::parse_frame(&frame.payload))
        .map(|packet| packet.expect("host sent malformed signalling"))
        .collect()
}

fn address(last: u8) -> Address {
    Address::new([last, 0x12, 0x13, 0x14, 0x15, 0x16])
}

fn close_recorder(channel_register: impl FnOnce(Box<dyn FnOnce(ErrorCode)>)) -> Rc<RefCell<Vec<ErrorCode>>> {
    let reasons = Rc::new(RefCell::new(Vec::new()));
    let recorded = reasons.clone();
    channel_register(Box::new(move |reason| recorded.borrow_mut().push(reason)));
    reasons
}

#[test]
fn test_fixed_service_registration_results() {
    let harness = Harness::new();
    let classic = harness.l2cap.classic_fixed_channel_manager();
    let le = harness.l2cap.le_fixed_channel_manager();

    // Outside the fixed range, or the signalling channel itself
    assert_eq!(harness.register_fixed(&classic, 0x0000).result, RegistrationResult::FailInvalidService);
    assert_eq!(harness.register_fixed(&classic, 0x0040).result, RegistrationResult::FailInvalidService);
    assert_eq!(
        harness.register_fixed(&classic, CLASSIC_SIGNALLING_CID).result,
        RegistrationResult::FailInvalidService
    );
    assert_eq!(
        harness.register_fixed(&le, LE_SIGNALLING_CID).result,
        RegistrationResult::FailInvalidService
    );

    let att = harness.register_fixed(&le, LE_ATTRIBUTE_CID);
    assert_eq!(att.result, RegistrationResult::Success);
    assert_eq!(att.service.as_ref().map(|service| service.cid()), Some(LE_ATTRIBUTE_CID));

    let duplicate = harness.register_fixed(&le, LE_ATTRIBUTE_CID);
    assert_eq!(duplicate.result, RegistrationResult::FailDuplicateService);
    assert!(duplicate.service.is_none());

    // The same CID is free on the other transport
    assert_eq!(
        harness.register_fixed(&classic, LE_ATTRIBUTE_CID).result,
        RegistrationResult::Success
    );

    let dynamic = harness.l2cap.le_dynamic_channel_manager();
    assert_eq!(
        harness
            .register_dynamic(&dynamic, Psm(0x0100), SecurityPolicy::None)
            .result,
        RegistrationResult::FailInvalidService
    );
}

#[test]
fn test_incoming_acceptance_follows_services() {
    let harness = Harness::new();

    // No services: classic connection requests are turned away
    harness.hci.inject_event(connection_request(address(1)));
    harness.run();
    assert!(matches!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::RejectConnectionRequest { .. })
    ));
    harness.run();

    let manager = harness.l2cap.classic_dynamic_channel_manager();
    let answer = Rc::new(RefCell::new(None));
    let answered = answer.clone();
    manager.register_service(
        Psm::RFCOMM,
        SecurityPolicy::None,
        &harness.client,
        move |result, service| *answered.borrow_mut() = Some((result, service)),
        |_| {},
    );
    harness.run();
    let (result, service) = answer.borrow_mut().take().unwrap();
    assert_eq!(result, RegistrationResult::Success);

    harness.hci.inject_event(connection_request(address(2)));
    harness.run();
    assert!(matches!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::AcceptConnectionRequest { .. })
    ));
    harness.run();

    // Unregistering the last service stops acceptance again
    let unregistered = Rc::new(RefCell::new(0));
    let counter = unregistered.clone();
    let service = service.unwrap();
    service.unregister(&harness.client, move || *counter.borrow_mut() += 1);
    harness.run();
    assert_eq!(*unregistered.borrow(), 1);

    // A second unregister is an error and runs nothing
    let counter = unregistered.clone();
    service.unregister(&harness.client, move || *counter.borrow_mut() += 1);
    harness.run();
    assert_eq!(*unregistered.borrow(), 1);

    harness.hci.inject_event(connection_request(address(3)));
    harness.run();
    assert!(matches!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::RejectConnectionRequest { .. })
    ));
}

#[test]
fn test_fixed_connect_without_services_fails() {
    let harness = Harness::new();
    let manager = harness.l2cap.le_fixed_channel_manager();

    let failures = harness.connect_services(&manager, random_peer(1));
    assert_eq!(
        *failures.borrow(),
        vec![ConnectionResult::new(ConnectionResultCode::FailNoServiceRegistered)]
    );
    assert_eq!(harness.hci.pending_commands(), 0);
}

#[test]
fn test_fixed_connects_share_one_link_attempt() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_fixed_channel_manager();
    harness.register_fixed(&manager, LE_ATTRIBUTE_CID);

    let device = AddressWithType::classic(address(1));
    let first = harness.connect_services(&manager, device);
    let second = harness.connect_services(&manager, device);

    // One ACL connect for both callers
    assert_eq!(harness.hci.pending_commands(), 1);
    harness.hci.pop_command(ErrorCode::SUCCESS);
    harness.run();
    harness
        .hci
        .inject_event(connection_complete(ErrorCode::PAGE_TIMEOUT, 0x0000, address(1)));
    harness.run();

    let expected = vec![ConnectionResult::hci_error(ErrorCode::PAGE_TIMEOUT)];
    assert_eq!(*first.borrow(), expected);
    assert_eq!(*second.borrow(), expected);
    assert_eq!(harness.l2cap.link_count(Transport::Classic), 0);
}

#[test]
fn test_fixed_and_dynamic_callers_share_one_link() {
    let harness = Harness::new();
    let fixed = harness.l2cap.classic_fixed_channel_manager();
    let dynamic = harness.l2cap.classic_dynamic_channel_manager();
    let service = harness.register_fixed(&fixed, LE_ATTRIBUTE_CID);
    let device = AddressWithType::classic(address(2));

    let failures = harness.connect_services(&fixed, device);
    let recorder = harness.connect_channel(&dynamic, device, Psm::RFCOMM, SecurityPolicy::None);

    // One ACL connect for both callers
    assert_eq!(harness.hci.pending_commands(), 1);
    harness.complete_classic_connect(HANDLE, address(2));
    assert_eq!(harness.hci.pending_commands(), 0);
    assert_eq!(harness.l2cap.link_count(Transport::Classic), 1);
    assert_eq!(service.opened.borrow().len(), 1);
    assert!(failures.borrow().is_empty());

    // The dynamic caller's request went out on the same link
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            1,
            SignallingCommand::ConnectionRequest {
                psm: Psm::RFCOMM,
                source_cid: 0x0040,
            }
        )]
    );
    harness.inject_signalling(
        HANDLE,
        1,
        SignallingCommand::ConnectionResponse {
            destination_cid: 0x0090,
            source_cid: 0x0040,
            result: CONNECTION_SUCCESS,
            status: CONNECTION_STATUS_NO_INFO,
        },
    );
    harness.inject_signalling(
        HANDLE,
        9,
        SignallingCommand::ConfigurationRequest {
            destination_cid: 0x0040,
            flags: 0,
            mtu: None,
        },
    );
    harness.inject_signalling(
        HANDLE,
        2,
        SignallingCommand::ConfigurationResponse {
            source_cid: 0x0040,
            flags: 0,
            result: CONFIGURATION_SUCCESS,
            mtu: None,
        },
    );
    let channel = recorder.opened.borrow_mut().pop().expect("channel did not open");
    assert_eq!(channel.remote_cid(), 0x0090);
    assert!(recorder.failed.borrow().is_empty());

    assert_eq!(service.opened.borrow().len(), 1);
    assert_eq!(harness.l2cap.link_count(Transport::Classic), 1);
}

#[test]
fn test_duplicate_link_is_dropped_and_released() {
    let harness = Harness::new();
    let manager = harness.l2cap.le_fixed_channel_manager();
    let service = harness.register_fixed(&manager, LE_ATTRIBUTE_CID);
    let peer = random_peer(6);

    harness.connect_services(&manager, peer);
    harness.complete_le_connect(HANDLE, peer);
    assert_eq!(service.opened.borrow().len(), 1);

    // The controller reports a second link to the same peer
    harness
        .hci
        .inject_event(le_connection_complete(ErrorCode::SUCCESS, 0x0041, Role::Peripheral, peer));
    harness.run();
    assert_eq!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::Disconnect {
            handle: 0x0041,
            reason: ErrorCode::REMOTE_USER_TERMINATED_CONNECTION,
        })
    );
    harness.run();
    harness
        .hci
        .inject_event(disconnection_complete(0x0041, ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST));
    harness.run();

    // Only the first link's record remains
    let status = harness.acl.credit_status();
    harness.run();
    assert_eq!(status.take().map(|status| status.connections), Some(1));
    assert_eq!(harness.l2cap.link_count(Transport::Le), 1);
    assert_eq!(service.opened.borrow().len(), 1);
}

#[test]
fn test_fixed_channel_data_path() {
    let harness = Harness::new();
    let manager = harness.l2cap.le_fixed_channel_manager();
    let att = harness.register_fixed(&manager, LE_ATTRIBUTE_CID);
    let peer = random_peer(7);

    let failures = harness.connect_services(&manager, peer);
    harness.complete_le_connect(HANDLE, peer);
    assert!(failures.borrow().is_empty());
    assert_eq!(harness.l2cap.link_count(Transport::Le), 1);

    let channel = att.opened.borrow_mut().pop().expect("service was not told");
    assert_eq!(channel.cid(), LE_ATTRIBUTE_CID);
    assert_eq!(channel.device(), peer);

    // Outbound SDUs get a basic header for the channel
    let queue = channel.queue_end();
    queue.enqueue(vec![0x0A, 0x0B]);
    harness.run();
    assert_eq!(
        harness.sent_frames(),
        vec![BasicFrame::new(LE_ATTRIBUTE_CID, vec![0x0A, 0x0B])]
    );

    // Inbound PDUs are demultiplexed by CID
    harness.inject_pdu(HANDLE, LE_ATTRIBUTE_CID, vec![0x01, 0x02, 0x03]);
    assert_eq!(queue.try_dequeue(), Some(vec![0x01, 0x02, 0x03]));

    // Unknown CIDs are dropped
    harness.inject_pdu(HANDLE, 0x0033, vec![0xFF]);
    assert_eq!(queue.try_dequeue(), None);

    // Every service already has its channel
    let failures = harness.connect_services(&manager, peer);
    assert_eq!(
        *failures.borrow(),
        vec![ConnectionResult::new(ConnectionResultCode::FailAllServicesHaveChannel)]
    );
    assert_eq!(harness.hci.pending_commands(), 0);
}

#[test]
fn test_idle_link_is_disconnected() {
    let harness = Harness::new();
    let manager = harness.l2cap.le_fixed_channel_manager();
    let att = harness.register_fixed(&manager, LE_ATTRIBUTE_CID);
    let peer = random_peer(9);

    harness.connect_services(&manager, peer);
    harness.complete_le_connect(HANDLE, peer);
    let channel = att.opened.borrow_mut().pop().unwrap();
    let closed = close_recorder(|callback| channel.register_on_close_callback(&harness.client, callback));

    // Unacquired fixed channels do not hold the link
    assert_eq!(harness.looper.pending_timers(), 1);

    channel.acquire();
    harness.run();
    assert_eq!(harness.looper.pending_timers(), 0);
    harness.looper.advance(Duration::from_secs(60));
    assert_eq!(harness.hci.pending_commands(), 0);

    channel.release();
    harness.run();
    assert_eq!(harness.looper.pending_timers(), 1);
    harness.looper.advance(Duration::from_secs(19));
    assert_eq!(harness.hci.pending_commands(), 0);
    harness.looper.advance(Duration::from_secs(1));
    assert_eq!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::Disconnect {
            handle: HANDLE,
            reason: ErrorCode::REMOTE_USER_TERMINATED_CONNECTION,
        })
    );
    harness.run();

    harness.hci.inject_event(disconnection_complete(
        HANDLE,
        ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST,
    ));
    harness.run();
    assert_eq!(*closed.borrow(), vec![ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST]);
    assert_eq!(harness.l2cap.link_count(Transport::Le), 0);
    assert_eq!(harness.looper.pending_timers(), 0);
}

#[test]
fn test_idle_timer_waits_for_last_release() {
    let harness = Harness::new();
    let manager = harness.l2cap.le_fixed_channel_manager();
    let att = harness.register_fixed(&manager, LE_ATTRIBUTE_CID);
    let security = harness.register_fixed(&manager, LE_SECURITY_CID);
    let peer = random_peer(10);

    harness.connect_services(&manager, peer);
    harness.complete_le_connect(HANDLE, peer);
    let att = att.opened.borrow_mut().pop().unwrap();
    let security = security.opened.borrow_mut().pop().unwrap();

    att.acquire();
    security.acquire();
    harness.run();
    assert_eq!(harness.looper.pending_timers(), 0);

    security.release();
    harness.run();
    assert_eq!(harness.looper.pending_timers(), 0);

    // Releasing twice changes nothing
    security.release();
    harness.run();
    assert_eq!(harness.looper.pending_timers(), 0);

    att.release();
    harness.run();
    assert_eq!(harness.looper.pending_timers(), 1);

    att.acquire();
    harness.run();
    assert_eq!(harness.looper.pending_timers(), 0);
    harness.looper.advance(Duration::from_secs(60));
    assert_eq!(harness.hci.pending_commands(), 0);
    assert_eq!(harness.l2cap.link_count(Transport::Le), 1);
}

#[test]
fn test_pairing_channel_requests_authentication() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_fixed_channel_manager();
    let pairing = harness.register_fixed(&manager, CLASSIC_PAIRING_CID);

    harness.connect_services(&manager, AddressWithType::classic(address(4)));
    harness.complete_classic_connect(HANDLE, address(4));
    assert_eq!(pairing.opened.borrow().len(), 1);
    assert_eq!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::AuthenticationRequested { handle: HANDLE })
    );
}

#[test]
fn test_outgoing_dynamic_channel() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_dynamic_channel_manager();
    let device = AddressWithType::classic(address(1));

    let recorder = harness.connect_channel(&manager, device, Psm::RFCOMM, SecurityPolicy::None);
    harness.complete_classic_connect(HANDLE, address(1));

    // Local CIDs start at the bottom of the dynamic range
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            1,
            SignallingCommand::ConnectionRequest {
                psm: Psm::RFCOMM,
                source_cid: 0x0040,
            }
        )]
    );

    harness.inject_signalling(
        HANDLE,
        1,
        SignallingCommand::ConnectionResponse {
            destination_cid: 0x0080,
            source_cid: 0x0040,
            result: CONNECTION_SUCCESS,
            status: CONNECTION_STATUS_NO_INFO,
        },
    );
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            2,
            SignallingCommand::ConfigurationRequest {
                destination_cid: 0x0080,
                flags: 0,
                mtu: Some(DEFAULT_CLASSIC_MTU),
            }
        )]
    );

    harness.inject_signalling(
        HANDLE,
        7,
        SignallingCommand::ConfigurationRequest {
            destination_cid: 0x0040,
            flags: 0,
            mtu: Some(48),
        },
    );
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            7,
            SignallingCommand::ConfigurationResponse {
                source_cid: 0x0080,
                flags: 0,
                result: CONFIGURATION_SUCCESS,
                mtu: None,
            }
        )]
    );
    // Still waiting for our own request to be accepted
    assert!(recorder.opened.borrow().is_empty());

    harness.inject_signalling(
        HANDLE,
        2,
        SignallingCommand::ConfigurationResponse {
            source_cid: 0x0040,
            flags: 0,
            result: CONFIGURATION_SUCCESS,
            mtu: None,
        },
    );
    let channel = recorder.opened.borrow_mut().pop().expect("channel did not open");
    assert!(recorder.failed.borrow().is_empty());
    assert_eq!(channel.cid(), 0x0040);
    assert_eq!(channel.remote_cid(), 0x0080);
    assert_eq!(channel.psm(), Psm::RFCOMM);
    assert_eq!(channel.mtu(), 48);
    assert_eq!(harness.looper.pending_timers(), 0);

    // Data goes to the remote CID; SDUs above the peer MTU are dropped
    let queue = channel.queue_end();
    queue.enqueue(vec![0x55; 4]);
    queue.enqueue(vec![0x66; 49]);
    harness.run();
    assert_eq!(harness.sent_frames(), vec![BasicFrame::new(0x0080, vec![0x55; 4])]);

    harness.inject_pdu(HANDLE, 0x0040, vec![0x77]);
    assert_eq!(queue.try_dequeue(), Some(vec![0x77]));

    // Local close completes on the peer's response
    let closed = close_recorder(|callback| channel.register_on_close_callback(&harness.client, callback));
    channel.close();
    harness.run();
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            3,
            SignallingCommand::DisconnectionRequest {
                destination_cid: 0x0080,
                source_cid: 0x0040,
            }
        )]
    );
    assert!(closed.borrow().is_empty());

    harness.inject_signalling(
        HANDLE,
        3,
        SignallingCommand::DisconnectionResponse {
            destination_cid: 0x0080,
            source_cid: 0x0040,
        },
    );
    assert_eq!(*closed.borrow(), vec![ErrorCode::CONNECTION_TERMINATED_BY_LOCAL_HOST]);

    // Nothing left on the link, so the idle timer runs again
    assert_eq!(harness.looper.pending_timers(), 1);
}

#[test]
fn test_incoming_dynamic_channel() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_dynamic_channel_manager();
    let service = harness.register_dynamic(&manager, Psm(0x1001), SecurityPolicy::None);
    assert_eq!(service.result, RegistrationResult::Success);

    harness.hci.inject_event(connection_request(address(2)));
    harness.run();
    assert!(matches!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::AcceptConnectionRequest { .. })
    ));
    harness.run();
    harness
        .hci
        .inject_event(connection_complete(ErrorCode::SUCCESS, HANDLE, address(2)));
    harness.run();
    assert_eq!(harness.l2cap.link_count(Transport::Classic), 1);

    harness.inject_signalling(
        HANDLE,
        5,
        SignallingCommand::ConnectionRequest {
            psm: Psm(0x1001),
            source_cid: 0x0090,
        },
    );
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![
            SignallingPacket::new(
                5,
                SignallingCommand::ConnectionResponse {
                    destination_cid: 0x0040,
                    source_cid: 0x0090,
                    result: CONNECTION_SUCCESS,
                    status: CONNECTION_STATUS_NO_INFO,
                }
            ),
            SignallingPacket::new(
                1,
                SignallingCommand::ConfigurationRequest {
                    destination_cid: 0x0090,
                    flags: 0,
                    mtu: Some(DEFAULT_CLASSIC_MTU),
                }
            ),
        ]
    );

    // Unregistered PSM, then a remote CID already in use
    harness.inject_signalling(
        HANDLE,
        6,
        SignallingCommand::ConnectionRequest {
            psm: Psm(0x1003),
            source_cid: 0x0091,
        },
    );
    harness.inject_signalling(
        HANDLE,
        7,
        SignallingCommand::ConnectionRequest {
            psm: Psm(0x1001),
            source_cid: 0x0090,
        },
    );
    let results: Vec<(u8, u16)> = harness
        .sent_signalling(CLASSIC_SIGNALLING_CID)
        .into_iter()
        .map(|packet| match packet.command {
            SignallingCommand::ConnectionResponse { result, .. } => (packet.identifier, result),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(
        results,
        vec![
            (6, CONNECTION_PSM_NOT_SUPPORTED),
            (7, CONNECTION_SOURCE_CID_ALREADY_ALLOCATED)
        ]
    );

    harness.inject_signalling(
        HANDLE,
        1,
        SignallingCommand::ConfigurationResponse {
            source_cid: 0x0040,
            flags: 0,
            result: CONFIGURATION_SUCCESS,
            mtu: None,
        },
    );
    harness.inject_signalling(
        HANDLE,
        8,
        SignallingCommand::ConfigurationRequest {
            destination_cid: 0x0040,
            flags: 0,
            mtu: None,
        },
    );
    harness.sent_frames();
    let channel = service.opened.borrow_mut().pop().expect("service was not told");
    assert_eq!(channel.cid(), 0x0040);
    assert_eq!(channel.remote_cid(), 0x0090);
    // Without an MTU option the peer keeps the default
    assert_eq!(channel.mtu(), DEFAULT_CLASSIC_MTU);

    let closed = close_recorder(|callback| channel.register_on_close_callback(&harness.client, callback));

    // Disconnection for a channel we do not have
    harness.inject_signalling(
        HANDLE,
        9,
        SignallingCommand::DisconnectionRequest {
            destination_cid: 0x0050,
            source_cid: 0x0090,
        },
    );
    assert!(matches!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID).as_slice(),
        [SignallingPacket {
            identifier: 9,
            command: SignallingCommand::CommandReject {
                reason: REJECT_INVALID_CID,
                ..
            },
        }]
    ));

    harness.inject_signalling(
        HANDLE,
        10,
        SignallingCommand::DisconnectionRequest {
            destination_cid: 0x0040,
            source_cid: 0x0090,
        },
    );
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            10,
            SignallingCommand::DisconnectionResponse {
                destination_cid: 0x0040,
                source_cid: 0x0090,
            }
        )]
    );
    assert_eq!(*closed.borrow(), vec![ErrorCode::REMOTE_USER_TERMINATED_CONNECTION]);
}

#[test]
fn test_refused_and_rejected_connections() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_dynamic_channel_manager();
    let device = AddressWithType::classic(address(3));

    // Even PSMs never reach the air
    let invalid = harness.connect_channel(&manager, device, Psm(0x0002), SecurityPolicy::None);
    assert_eq!(
        *invalid.failed.borrow(),
        vec![ConnectionResult::l2cap_error(CONNECTION_PSM_NOT_SUPPORTED)]
    );
    assert_eq!(harness.hci.pending_commands(), 0);

    let refused = harness.connect_channel(&manager, device, Psm::SDP, SecurityPolicy::None);
    let rejected = harness.connect_channel(&manager, device, Psm::AVDTP, SecurityPolicy::None);
    harness.complete_classic_connect(HANDLE, address(3));
    assert_eq!(harness.sent_signalling(CLASSIC_SIGNALLING_CID).len(), 2);

    // A pending result keeps the request alive
    harness.inject_signalling(
        HANDLE,
        1,
        SignallingCommand::ConnectionResponse {
            destination_cid: 0x0000,
            source_cid: 0x0040,
            result: CONNECTION_PENDING,
            status: CONNECTION_STATUS_NO_INFO,
        },
    );
    assert!(refused.failed.borrow().is_empty());

    harness.inject_signalling(
        HANDLE,
        1,
        SignallingCommand::ConnectionResponse {
            destination_cid: 0x0000,
            source_cid: 0x0040,
            result: CONNECTION_NO_RESOURCES_AVAILABLE,
            status: CONNECTION_STATUS_NO_INFO,
        },
    );
    assert_eq!(
        *refused.failed.borrow(),
        vec![ConnectionResult::l2cap_error(CONNECTION_NO_RESOURCES_AVAILABLE)]
    );

    harness.inject_signalling(
        HANDLE,
        2,
        SignallingCommand::CommandReject {
            reason: REJECT_NOT_UNDERSTOOD,
            data: Vec::new(),
        },
    );
    assert_eq!(
        *rejected.failed.borrow(),
        vec![ConnectionResult::new(ConnectionResultCode::FailL2capError)]
    );
    assert!(refused.opened.borrow().is_empty());
    assert!(rejected.opened.borrow().is_empty());
}

#[test]
fn test_encrypted_channel_waits_for_encryption() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_dynamic_channel_manager();
    let device = AddressWithType::classic(address(5));

    harness.connect_channel(&manager, device, Psm::AVDTP, SecurityPolicy::EncryptedTransport);
    harness.complete_classic_connect(HANDLE, address(5));

    // Parked until the link is encrypted
    assert!(harness.sent_signalling(CLASSIC_SIGNALLING_CID).is_empty());
    assert_eq!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::AuthenticationRequested { handle: HANDLE })
    );
    harness.run();

    harness
        .hci
        .inject_event(authentication_complete(ErrorCode::SUCCESS, HANDLE));
    harness.run();
    assert_eq!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::SetConnectionEncryption {
            handle: HANDLE,
            enable: true,
        })
    );
    harness.run();
    assert!(harness.sent_signalling(CLASSIC_SIGNALLING_CID).is_empty());

    harness
        .hci
        .inject_event(encryption_change(ErrorCode::SUCCESS, HANDLE, true));
    harness.run();
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            1,
            SignallingCommand::ConnectionRequest {
                psm: Psm::AVDTP,
                source_cid: 0x0040,
            }
        )]
    );
}

#[test]
fn test_failed_authentication_fails_waiting_opens() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_dynamic_channel_manager();
    let device = AddressWithType::classic(address(7));

    let parked = harness.connect_channel(&manager, device, Psm::AVDTP, SecurityPolicy::EncryptedTransport);
    harness.complete_classic_connect(HANDLE, address(7));
    assert_eq!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::AuthenticationRequested { handle: HANDLE })
    );
    harness.run();

    harness
        .hci
        .inject_event(authentication_complete(ErrorCode::AUTHENTICATION_FAILURE, HANDLE));
    harness.run();
    assert_eq!(
        *parked.failed.borrow(),
        vec![ConnectionResult::hci_error(ErrorCode::AUTHENTICATION_FAILURE)]
    );
    assert!(harness.sent_signalling(CLASSIC_SIGNALLING_CID).is_empty());

    // A later open starts a fresh attempt
    let retry = harness.connect_channel(&manager, device, Psm::AVDTP, SecurityPolicy::EncryptedTransport);
    assert_eq!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::AuthenticationRequested { handle: HANDLE })
    );
    assert!(retry.failed.borrow().is_empty());
}

#[test]
fn test_incoming_request_blocked_without_encryption() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_dynamic_channel_manager();
    harness.register_dynamic(&manager, Psm::HID_CONTROL, SecurityPolicy::EncryptedTransport);

    harness.hci.inject_event(connection_request(address(6)));
    harness.run();
    harness.hci.pop_command(ErrorCode::SUCCESS);
    harness.run();
    harness
        .hci
        .inject_event(connection_complete(ErrorCode::SUCCESS, HANDLE, address(6)));
    harness.run();

    harness.inject_signalling(
        HANDLE,
        4,
        SignallingCommand::ConnectionRequest {
            psm: Psm::HID_CONTROL,
            source_cid: 0x0070,
        },
    );
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            4,
            SignallingCommand::ConnectionResponse {
                destination_cid: 0x0000,
                source_cid: 0x0070,
                result: CONNECTION_SECURITY_BLOCK,
                status: CONNECTION_STATUS_NO_INFO,
            }
        )]
    );
    assert_eq!(
        harness.hci.pop_command(ErrorCode::SUCCESS),
        Some(HciCommand::AuthenticationRequested { handle: HANDLE })
    );
}

#[test]
fn test_disconnect_fails_pending_opens() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_dynamic_channel_manager();
    let device = AddressWithType::classic(address(8));

    let in_flight = harness.connect_channel(&manager, device, Psm::SDP, SecurityPolicy::None);
    let parked = harness.connect_channel(&manager, device, Psm::AVDTP, SecurityPolicy::EncryptedTransport);
    harness.complete_classic_connect(HANDLE, address(8));
    harness.sent_frames();

    harness
        .hci
        .inject_event(disconnection_complete(HANDLE, ErrorCode::CONNECTION_TIMEOUT));
    harness.run();

    let expected = vec![ConnectionResult::hci_error(ErrorCode::CONNECTION_TIMEOUT)];
    assert_eq!(*in_flight.failed.borrow(), expected);
    assert_eq!(*parked.failed.borrow(), expected);
    assert_eq!(harness.l2cap.link_count(Transport::Classic), 0);
    assert_eq!(harness.looper.pending_timers(), 0);
}

#[test]
fn test_unusable_remote_cid_is_disconnected() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_dynamic_channel_manager();
    let device = AddressWithType::classic(address(9));

    let fixed_cid = harness.connect_channel(&manager, device, Psm::SDP, SecurityPolicy::None);
    harness.complete_classic_connect(HANDLE, address(9));
    harness.sent_frames();

    // A fixed-range CID cannot carry a dynamic channel
    harness.inject_signalling(
        HANDLE,
        1,
        SignallingCommand::ConnectionResponse {
            destination_cid: 0x0003,
            source_cid: 0x0040,
            result: CONNECTION_SUCCESS,
            status: CONNECTION_STATUS_NO_INFO,
        },
    );
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            2,
            SignallingCommand::DisconnectionRequest {
                destination_cid: 0x0003,
                source_cid: 0x0040,
            }
        )]
    );
    assert_eq!(
        *fixed_cid.failed.borrow(),
        vec![ConnectionResult::l2cap_error(CONNECTION_INVALID_CID)]
    );
    assert!(fixed_cid.opened.borrow().is_empty());

    // The peer answering our disconnect changes nothing
    harness.inject_signalling(
        HANDLE,
        2,
        SignallingCommand::DisconnectionResponse {
            destination_cid: 0x0003,
            source_cid: 0x0040,
        },
    );

    // The reserved CID went back to the pool
    let first = harness.connect_channel(&manager, device, Psm::RFCOMM, SecurityPolicy::None);
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            3,
            SignallingCommand::ConnectionRequest {
                psm: Psm::RFCOMM,
                source_cid: 0x0040,
            }
        )]
    );
    harness.inject_signalling(
        HANDLE,
        3,
        SignallingCommand::ConnectionResponse {
            destination_cid: 0x0085,
            source_cid: 0x0040,
            result: CONNECTION_SUCCESS,
            status: CONNECTION_STATUS_NO_INFO,
        },
    );
    harness.sent_frames();

    // A second channel may not reuse the peer's CID of the first
    let reused = harness.connect_channel(&manager, device, Psm::AVCTP, SecurityPolicy::None);
    harness.sent_frames();
    harness.inject_signalling(
        HANDLE,
        5,
        SignallingCommand::ConnectionResponse {
            destination_cid: 0x0085,
            source_cid: 0x0041,
            result: CONNECTION_SUCCESS,
            status: CONNECTION_STATUS_NO_INFO,
        },
    );
    assert_eq!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID),
        vec![SignallingPacket::new(
            6,
            SignallingCommand::DisconnectionRequest {
                destination_cid: 0x0085,
                source_cid: 0x0041,
            }
        )]
    );
    assert_eq!(
        *reused.failed.borrow(),
        vec![ConnectionResult::l2cap_error(CONNECTION_SOURCE_CID_ALREADY_ALLOCATED)]
    );
    assert!(first.failed.borrow().is_empty());
}

#[test]
fn test_identifiers_skip_outstanding_requests() {
    let harness = Harness::new();
    let manager = harness.l2cap.classic_dynamic_channel_manager();
    let device = AddressWithType::classic(address(10));

    // Identifier 1 stays unanswered throughout
    let slow = harness.connect_channel(&manager, device, Psm::SDP, SecurityPolicy::None);
    harness.complete_classic_connect(HANDLE, address(10));
    harness.sent_frames();

    for identifier in 2..=255u8 {
        let refused = harness.connect_channel(&manager, device, Psm::RFCOMM, SecurityPolicy::None);
        let sent = harness.sent_signalling(CLASSIC_SIGNALLING_CID);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].identifier, identifier);
        harness.inject_signalling(
            HANDLE,
            identifier,
            SignallingCommand::ConnectionResponse {
                destination_cid: 0x0000,
                source_cid: 0x0041,
                result: CONNECTION_NO_RESOURCES_AVAILABLE,
                status: CONNECTION_STATUS_NO_INFO,
            },
        );
        assert_eq!(refused.failed.borrow().len(), 1);
    }

    // Wrapped around: 1 is still waiting, so the next request takes 2
    harness.connect_channel(&manager, device, Psm::RFCOMM, SecurityPolicy::None);
    let sent = harness.sent_signalling(CLASSIC_SIGNALLING_CID);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].identifier, 2);

    // And the first request can still complete
    harness.inject_signalling(
        HANDLE,
        1,
        SignallingCommand::ConnectionResponse {
            destination_cid: 0x00A0,
            source_cid: 0x0040,
            result: CONNECTION_SUCCESS,
            status: CONNECTION_STATUS_NO_INFO,
        },
    );
    assert!(slow.failed.borrow().is_empty());
    assert!(matches!(
        harness.sent_signalling(CLASSIC_SIGNALLING_CID).as_slice(),
        [SignallingPacket {
            command: SignallingCommand::ConfigurationRequest { destination_cid: 0x00A0, .. },
            ..
        }]
    ));
}

#[test]
fn test_signalling_housekeeping() {
    let harness = Harness::new();
    let manager = harness.l2cap.le_dynamic_channel_manager();
    let peer = random_peer(3);

    harness.connect_channel(&manager, peer, Psm(0x0080), SecurityPolicy::None);
    harness.complete_le_connect(HANDLE, peer);

    // LE links signal on their own fixed channel
    assert_eq!(harness.sent_signalling(LE_SIGNALLING_CID).len(), 1);

    let mut frame = SignallingPacket::new(
        3,
        SignallingCommand::EchoRequest {
            data: vec![0xAB],
        },
    )
    .to_bytes();
    // Unknown code 0x7F with identifier 4 and no body
    frame.extend_from_slice(&[0x7F, 0x04, 0x00, 0x00]);
    frame.extend_from_slice(
        &SignallingPacket::new(5, SignallingCommand::InformationRequest { info_type: 0x0002 }).to_bytes(),
    );
    harness.inject_pdu(HANDLE, LE_SIGNALLING_CID, frame);

    assert_eq!(
        harness.sent_signalling(LE_SIGNALLING_CID),
        vec![
            SignallingPacket::new(3, SignallingCommand::EchoResponse { data: vec![0xAB] }),
            SignallingPacket::new(
                4,
                SignallingCommand::CommandReject {
                    reason: REJECT_NOT_UNDERSTOOD,
                    data: Vec::new(),
                }
            ),
            SignallingPacket::new(
                5,
                SignallingCommand::InformationResponse {
                    info_type: 0x0002,
                    result: INFORMATION_NOT_SUPPORTED,
                    data: Vec::new(),
                }
            ),
        ]
    );
}
