//! HCI packet structures and parsing
//!
//! Commands are serialized for the transport, ACL frames travel both ways.

use crate::error::{HciError, HciResult};
use crate::hci::address::{Address, AddressType, Role};
use crate::hci::constants::*;
use crate::hci::error_code::ErrorCode;
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

bitflags! {
    /// Classic ACL packet types the controller may use on a link
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketTypes: u16 {
        const DM1 = 0x0008;
        const DH1 = 0x0010;
        const DM3 = 0x0400;
        const DH3 = 0x0800;
        const DM5 = 0x4000;
        const DH5 = 0x8000;
    }
}

impl Default for PacketTypes {
    fn default() -> Self {
        PacketTypes::DM1
            | PacketTypes::DH1
            | PacketTypes::DM3
            | PacketTypes::DH3
            | PacketTypes::DM5
            | PacketTypes::DH5
    }
}

bitflags! {
    /// Link modes the local controller may enter or allow on a link
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LinkPolicySettings: u16 {
        const ENABLE_ROLE_SWITCH = 0x0001;
        const ENABLE_HOLD_MODE = 0x0002;
        const ENABLE_SNIFF_MODE = 0x0004;
        const ENABLE_PARK_MODE = 0x0008;
    }
}

/// Power mode reported by a Mode Change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Active,
    Hold,
    Sniff,
    Reserved(u8),
}

impl From<u8> for Mode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Mode::Active,
            0x01 => Mode::Hold,
            0x02 => Mode::Sniff,
            other => Mode::Reserved(other),
        }
    }
}

/// HCI commands issued by the connection layer
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    CreateConnection {
        bd_addr: Address,
        packet_type: PacketTypes,
        page_scan_repetition_mode: u8,
        clock_offset: u16,
        allow_role_switch: bool,
    },
    Disconnect {
        handle: u16,
        reason: ErrorCode,
    },
    CreateConnectionCancel {
        bd_addr: Address,
    },
    AcceptConnectionRequest {
        bd_addr: Address,
        role: Role,
    },
    RejectConnectionRequest {
        bd_addr: Address,
        reason: ErrorCode,
    },
    ChangeConnectionPacketType {
        handle: u16,
        packet_type: PacketTypes,
    },
    AuthenticationRequested {
        handle: u16,
    },
    SetConnectionEncryption {
        handle: u16,
        enable: bool,
    },
    ReadRemoteSupportedFeatures {
        handle: u16,
    },
    ReadRemoteVersionInformation {
        handle: u16,
    },
    ReadClockOffset {
        handle: u16,
    },

    // Link Policy Commands (OGF: 0x02)
    HoldMode {
        handle: u16,
        max_interval: u16,
        min_interval: u16,
    },
    SniffMode {
        handle: u16,
        max_interval: u16,
        min_interval: u16,
        attempt: u16,
        timeout: u16,
    },
    ExitSniffMode {
        handle: u16,
    },
    RoleDiscovery {
        handle: u16,
    },
    SwitchRole {
        bd_addr: Address,
        role: Role,
    },
    ReadLinkPolicySettings {
        handle: u16,
    },
    WriteLinkPolicySettings {
        handle: u16,
        settings: LinkPolicySettings,
    },

    // Host Controller Commands (OGF: 0x03)
    Flush {
        handle: u16,
    },
    ReadLinkSupervisionTimeout {
        handle: u16,
    },
    WriteLinkSupervisionTimeout {
        handle: u16,
        timeout: u16,
    },

    // Status Parameters (OGF: 0x05)
    ReadRssi {
        handle: u16,
    },

    // LE Commands (OGF: 0x08)
    LeCreateConnection {
        scan_interval: u16,
        scan_window: u16,
        use_filter_accept_list: bool,
        peer_address_type: AddressType,
        peer_address: Address,
        own_address_type: AddressType,
        conn_interval_min: u16,
        conn_interval_max: u16,
        conn_latency: u16,
        supervision_timeout: u16,
        min_ce_length: u16,
        max_ce_length: u16,
    },
    LeCreateConnectionCancel,
    LeConnectionUpdate {
        handle: u16,
        conn_interval_min: u16,
        conn_interval_max: u16,
        conn_latency: u16,
        supervision_timeout: u16,
        min_ce_length: u16,
        max_ce_length: u16,
    },
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::CreateConnection { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION),
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::CreateConnectionCancel { .. } => (OGF_LINK_CTL, OCF_CREATE_CONNECTION_CANCEL),
            Self::AcceptConnectionRequest { .. } => (OGF_LINK_CTL, OCF_ACCEPT_CONNECTION_REQUEST),
            Self::RejectConnectionRequest { .. } => (OGF_LINK_CTL, OCF_REJECT_CONNECTION_REQUEST),
            Self::ChangeConnectionPacketType { .. } => {
                (OGF_LINK_CTL, OCF_CHANGE_CONNECTION_PACKET_TYPE)
            }
            Self::AuthenticationRequested { .. } => (OGF_LINK_CTL, OCF_AUTHENTICATION_REQUESTED),
            Self::SetConnectionEncryption { .. } => (OGF_LINK_CTL, OCF_SET_CONNECTION_ENCRYPTION),
            Self::ReadRemoteSupportedFeatures { .. } => {
                (OGF_LINK_CTL, OCF_READ_REMOTE_SUPPORTED_FEATURES)
            }
            Self::ReadRemoteVersionInformation { .. } => {
                (OGF_LINK_CTL, OCF_READ_REMOTE_VERSION_INFORMATION)
            }
            Self::ReadClockOffset { .. } => (OGF_LINK_CTL, OCF_READ_CLOCK_OFFSET),
            Self::HoldMode { .. } => (OGF_LINK_POLICY, OCF_HOLD_MODE),
            Self::SniffMode { .. } => (OGF_LINK_POLICY, OCF_SNIFF_MODE),
            Self::ExitSniffMode { .. } => (OGF_LINK_POLICY, OCF_EXIT_SNIFF_MODE),
            Self::RoleDiscovery { .. } => (OGF_LINK_POLICY, OCF_ROLE_DISCOVERY),
            Self::SwitchRole { .. } => (OGF_LINK_POLICY, OCF_SWITCH_ROLE),
            Self::ReadLinkPolicySettings { .. } => (OGF_LINK_POLICY, OCF_READ_LINK_POLICY_SETTINGS),
            Self::WriteLinkPolicySettings { .. } => (OGF_LINK_POLICY, OCF_WRITE_LINK_POLICY_SETTINGS),
            Self::Flush { .. } => (OGF_HOST_CTL, OCF_FLUSH),
            Self::ReadLinkSupervisionTimeout { .. } => {
                (OGF_HOST_CTL, OCF_READ_LINK_SUPERVISION_TIMEOUT)
            }
            Self::WriteLinkSupervisionTimeout { .. } => {
                (OGF_HOST_CTL, OCF_WRITE_LINK_SUPERVISION_TIMEOUT)
            }
            Self::ReadRssi { .. } => (OGF_STATUS_PARAM, OCF_READ_RSSI),
            Self::LeCreateConnection { .. } => (OGF_LE, OCF_LE_CREATE_CONNECTION),
            Self::LeCreateConnectionCancel => (OGF_LE, OCF_LE_CREATE_CONNECTION_CANCEL),
            Self::LeConnectionUpdate { .. } => (OGF_LE, OCF_LE_CONNECTION_UPDATE),
        }
    }

    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf & 0x3ff)
    }

    /// Connection handle the command targets, if any
    pub fn handle(&self) -> Option<u16> {
        match self {
            Self::Disconnect { handle, .. }
            | Self::ChangeConnectionPacketType { handle, .. }
            | Self::AuthenticationRequested { handle }
            | Self::SetConnectionEncryption { handle, .. }
            | Self::ReadRemoteSupportedFeatures { handle }
            | Self::ReadRemoteVersionInformation { handle }
            | Self::ReadClockOffset { handle }
            | Self::HoldMode { handle, .. }
            | Self::SniffMode { handle, .. }
            | Self::ExitSniffMode { handle }
            | Self::RoleDiscovery { handle }
            | Self::ReadLinkPolicySettings { handle }
            | Self::WriteLinkPolicySettings { handle, .. }
            | Self::Flush { handle }
            | Self::ReadLinkSupervisionTimeout { handle }
            | Self::WriteLinkSupervisionTimeout { handle, .. }
            | Self::ReadRssi { handle }
            | Self::LeConnectionUpdate { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    /// Get the parameters for this command
    fn parameters(&self) -> Vec<u8> {
        let mut params = Vec::new();
        match self {
            Self::CreateConnection {
                bd_addr,
                packet_type,
                page_scan_repetition_mode,
                clock_offset,
                allow_role_switch,
            } => {
                params.extend_from_slice(bd_addr.as_slice());
                params.extend_from_slice(&packet_type.bits().to_le_bytes());
                params.push(*page_scan_repetition_mode);
                params.push(0x00); // Reserved
                params.extend_from_slice(&clock_offset.to_le_bytes());
                params.push(u8::from(*allow_role_switch));
            }
            Self::Disconnect { handle, reason } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(reason.0);
            }
            Self::CreateConnectionCancel { bd_addr } => {
                params.extend_from_slice(bd_addr.as_slice());
            }
            Self::AcceptConnectionRequest { bd_addr, role } => {
                params.extend_from_slice(bd_addr.as_slice());
                params.push(u8::from(*role));
            }
            Self::RejectConnectionRequest { bd_addr, reason } => {
                params.extend_from_slice(bd_addr.as_slice());
                params.push(reason.0);
            }
            Self::ChangeConnectionPacketType {
                handle,
                packet_type,
            } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&packet_type.bits().to_le_bytes());
            }
            Self::AuthenticationRequested { handle }
            | Self::ReadRemoteSupportedFeatures { handle }
            | Self::ReadRemoteVersionInformation { handle }
            | Self::ReadClockOffset { handle }
            | Self::ExitSniffMode { handle }
            | Self::RoleDiscovery { handle }
            | Self::ReadLinkPolicySettings { handle }
            | Self::Flush { handle }
            | Self::ReadLinkSupervisionTimeout { handle }
            | Self::ReadRssi { handle } => {
                params.extend_from_slice(&handle.to_le_bytes());
            }
            Self::HoldMode {
                handle,
                max_interval,
                min_interval,
            } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&max_interval.to_le_bytes());
                params.extend_from_slice(&min_interval.to_le_bytes());
            }
            Self::SniffMode {
                handle,
                max_interval,
                min_interval,
                attempt,
                timeout,
            } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&max_interval.to_le_bytes());
                params.extend_from_slice(&min_interval.to_le_bytes());
                params.extend_from_slice(&attempt.to_le_bytes());
                params.extend_from_slice(&timeout.to_le_bytes());
            }
            Self::SwitchRole { bd_addr, role } => {
                params.extend_from_slice(bd_addr.as_slice());
                params.push(u8::from(*role));
            }
            Self::WriteLinkPolicySettings { handle, settings } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&settings.bits().to_le_bytes());
            }
            Self::WriteLinkSupervisionTimeout { handle, timeout } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&timeout.to_le_bytes());
            }
            Self::SetConnectionEncryption { handle, enable } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(u8::from(*enable));
            }
            Self::LeCreateConnection {
                scan_interval,
                scan_window,
                use_filter_accept_list,
                peer_address_type,
                peer_address,
                own_address_type,
                conn_interval_min,
                conn_interval_max,
                conn_latency,
                supervision_timeout,
                min_ce_length,
                max_ce_length,
            } => {
                params.extend_from_slice(&scan_interval.to_le_bytes());
                params.extend_from_slice(&scan_window.to_le_bytes());
                params.push(u8::from(*use_filter_accept_list));
                params.push(u8::from(*peer_address_type));
                params.extend_from_slice(peer_address.as_slice());
                params.push(u8::from(*own_address_type));
                params.extend_from_slice(&conn_interval_min.to_le_bytes());
                params.extend_from_slice(&conn_interval_max.to_le_bytes());
                params.extend_from_slice(&conn_latency.to_le_bytes());
                params.extend_from_slice(&supervision_timeout.to_le_bytes());
                params.extend_from_slice(&min_ce_length.to_le_bytes());
                params.extend_from_slice(&max_ce_length.to_le_bytes());
            }
            Self::LeCreateConnectionCancel => {}
            Self::LeConnectionUpdate {
                handle,
                conn_interval_min,
                conn_interval_max,
                conn_latency,
                supervision_timeout,
                min_ce_length,
                max_ce_length,
            } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&conn_interval_min.to_le_bytes());
                params.extend_from_slice(&conn_interval_max.to_le_bytes());
                params.extend_from_slice(&conn_latency.to_le_bytes());
                params.extend_from_slice(&supervision_timeout.to_le_bytes());
                params.extend_from_slice(&min_ce_length.to_le_bytes());
                params.extend_from_slice(&max_ce_length.to_le_bytes());
            }
        }
        params
    }

    /// Convert the command to a raw packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();
        debug_assert!(params.len() <= HCI_MAX_PARAM_LEN);

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// Packet boundary flag of an ACL frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketBoundaryFlag {
    FirstNonAutomaticallyFlushable = 0b00,
    ContinuingFragment = 0b01,
    FirstAutomaticallyFlushable = 0b10,
    CompleteL2capPdu = 0b11,
}

impl From<u16> for PacketBoundaryFlag {
    fn from(value: u16) -> Self {
        match value & 0b11 {
            0b00 => Self::FirstNonAutomaticallyFlushable,
            0b01 => Self::ContinuingFragment,
            0b10 => Self::FirstAutomaticallyFlushable,
            _ => Self::CompleteL2capPdu,
        }
    }
}

/// Broadcast flag of an ACL frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastFlag {
    PointToPoint = 0b00,
    ActivePeripheralBroadcast = 0b01,
}

impl From<u16> for BroadcastFlag {
    fn from(value: u16) -> Self {
        match value & 0b11 {
            0b01 => Self::ActivePeripheralBroadcast,
            _ => Self::PointToPoint,
        }
    }
}

/// One ACL data frame
#[derive(Clone, PartialEq, Eq)]
pub struct AclPacket {
    pub handle: u16,
    pub boundary_flag: PacketBoundaryFlag,
    pub broadcast_flag: BroadcastFlag,
    pub payload: Vec<u8>,
}

impl AclPacket {
    pub fn new(handle: u16, boundary_flag: PacketBoundaryFlag, payload: Vec<u8>) -> Self {
        Self {
            handle,
            boundary_flag,
            broadcast_flag: BroadcastFlag::PointToPoint,
            payload,
        }
    }

    /// Parse a frame as delivered by the transport (no packet indicator)
    pub fn parse(data: &[u8]) -> HciResult<Self> {
        if data.len() < ACL_HEADER_SIZE {
            return Err(HciError::Truncated {
                what: "ACL header",
                needed: ACL_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let handle_and_flags = cursor.read_u16::<LittleEndian>()?;
        let length = cursor.read_u16::<LittleEndian>()? as usize;

        let payload = &data[ACL_HEADER_SIZE..];
        if payload.len() < length {
            return Err(HciError::Truncated {
                what: "ACL payload",
                needed: length,
                actual: payload.len(),
            });
        }
        if payload.len() > length {
            return Err(HciError::InvalidParamLength(payload.len()));
        }

        let handle = handle_and_flags & ACL_HANDLE_MASK;
        if handle > ACL_MAX_HANDLE {
            return Err(HciError::InvalidPacketFormat);
        }

        Ok(Self {
            handle,
            boundary_flag: PacketBoundaryFlag::from(handle_and_flags >> ACL_PB_FLAG_SHIFT),
            broadcast_flag: BroadcastFlag::from(handle_and_flags >> ACL_BC_FLAG_SHIFT),
            payload: payload.to_vec(),
        })
    }

    /// Serialize the frame (no packet indicator)
    pub fn to_bytes(&self) -> Vec<u8> {
        let handle_and_flags = (self.handle & ACL_HANDLE_MASK)
            | ((self.boundary_flag as u16) << ACL_PB_FLAG_SHIFT)
            | ((self.broadcast_flag as u16) << ACL_BC_FLAG_SHIFT);

        let mut bytes = Vec::with_capacity(ACL_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&handle_and_flags.to_le_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

impl fmt::Debug for AclPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AclPacket")
            .field("handle", &format_args!("0x{:04x}", self.handle))
            .field("boundary_flag", &self.boundary_flag)
            .field("payload", &hex::encode(&self.payload))
            .finish()
    }
}
