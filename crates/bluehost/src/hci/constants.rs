//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol.

// HCI packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

// ACL header layout
pub const ACL_HEADER_SIZE: usize = 4;
pub const ACL_HANDLE_MASK: u16 = 0x0FFF;
pub const ACL_PB_FLAG_SHIFT: u16 = 12;
pub const ACL_BC_FLAG_SHIFT: u16 = 14;
pub const ACL_MAX_HANDLE: u16 = 0x0EFF;

/// Vendor debug traffic some controllers interleave with ACL data
pub const VENDOR_DEBUG_HANDLE: u16 = 0x0EDC;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LINK_POLICY: u8 = 0x02;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_STATUS_PARAM: u8 = 0x05;
pub const OGF_LE: u8 = 0x08;

// Link Control Commands (OGF: 0x01)
pub const OCF_CREATE_CONNECTION: u16 = 0x0005;
pub const OCF_DISCONNECT: u16 = 0x0006;
pub const OCF_CREATE_CONNECTION_CANCEL: u16 = 0x0008;
pub const OCF_ACCEPT_CONNECTION_REQUEST: u16 = 0x0009;
pub const OCF_REJECT_CONNECTION_REQUEST: u16 = 0x000A;
pub const OCF_CHANGE_CONNECTION_PACKET_TYPE: u16 = 0x000F;
pub const OCF_AUTHENTICATION_REQUESTED: u16 = 0x0011;
pub const OCF_SET_CONNECTION_ENCRYPTION: u16 = 0x0013;
pub const OCF_READ_REMOTE_SUPPORTED_FEATURES: u16 = 0x001B;
pub const OCF_READ_REMOTE_VERSION_INFORMATION: u16 = 0x001D;
pub const OCF_READ_CLOCK_OFFSET: u16 = 0x001F;

// Link Policy Commands (OGF: 0x02)
pub const OCF_HOLD_MODE: u16 = 0x0001;
pub const OCF_SNIFF_MODE: u16 = 0x0003;
pub const OCF_EXIT_SNIFF_MODE: u16 = 0x0004;
pub const OCF_ROLE_DISCOVERY: u16 = 0x0009;
pub const OCF_SWITCH_ROLE: u16 = 0x000B;
pub const OCF_READ_LINK_POLICY_SETTINGS: u16 = 0x000C;
pub const OCF_WRITE_LINK_POLICY_SETTINGS: u16 = 0x000D;

// Host Controller Commands (OGF: 0x03)
pub const OCF_FLUSH: u16 = 0x0008;
pub const OCF_READ_LINK_SUPERVISION_TIMEOUT: u16 = 0x0036;
pub const OCF_WRITE_LINK_SUPERVISION_TIMEOUT: u16 = 0x0037;

// Status Parameters (OGF: 0x05)
pub const OCF_READ_RSSI: u16 = 0x0005;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_CREATE_CONNECTION: u16 = 0x000D;
pub const OCF_LE_CREATE_CONNECTION_CANCEL: u16 = 0x000E;
pub const OCF_LE_CONNECTION_UPDATE: u16 = 0x0013;

// HCI Events
pub const EVT_CONN_COMPLETE: u8 = 0x03;
pub const EVT_CONN_REQUEST: u8 = 0x04;
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_AUTH_COMPLETE: u8 = 0x06;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_READ_REMOTE_FEATURES_COMPLETE: u8 = 0x0B;
pub const EVT_READ_REMOTE_VERSION_COMPLETE: u8 = 0x0C;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_FLUSH_OCCURRED: u8 = 0x11;
pub const EVT_ROLE_CHANGE: u8 = 0x12;
pub const EVT_NUM_COMP_PKTS: u8 = 0x13;
pub const EVT_MODE_CHANGE: u8 = 0x14;
pub const EVT_READ_CLOCK_OFFSET_COMPLETE: u8 = 0x1C;
pub const EVT_CONN_PACKET_TYPE_CHANGED: u8 = 0x1D;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta Events
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_CONN_UPDATE_COMPLETE: u8 = 0x03;
pub const EVT_LE_ENHANCED_CONN_COMPLETE: u8 = 0x0A;

// Link types in classic connection events
pub const LINK_TYPE_SCO: u8 = 0x00;
pub const LINK_TYPE_ACL: u8 = 0x01;

/// Build an opcode from its group and command fields
pub const fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | ocf
}

pub const OP_CREATE_CONNECTION: u16 = opcode(OGF_LINK_CTL, OCF_CREATE_CONNECTION);
pub const OP_DISCONNECT: u16 = opcode(OGF_LINK_CTL, OCF_DISCONNECT);
pub const OP_CREATE_CONNECTION_CANCEL: u16 = opcode(OGF_LINK_CTL, OCF_CREATE_CONNECTION_CANCEL);
pub const OP_ACCEPT_CONNECTION_REQUEST: u16 = opcode(OGF_LINK_CTL, OCF_ACCEPT_CONNECTION_REQUEST);
pub const OP_REJECT_CONNECTION_REQUEST: u16 = opcode(OGF_LINK_CTL, OCF_REJECT_CONNECTION_REQUEST);
pub const OP_AUTHENTICATION_REQUESTED: u16 = opcode(OGF_LINK_CTL, OCF_AUTHENTICATION_REQUESTED);
pub const OP_SET_CONNECTION_ENCRYPTION: u16 = opcode(OGF_LINK_CTL, OCF_SET_CONNECTION_ENCRYPTION);
pub const OP_READ_RSSI: u16 = opcode(OGF_STATUS_PARAM, OCF_READ_RSSI);
pub const OP_LE_CREATE_CONNECTION: u16 = opcode(OGF_LE, OCF_LE_CREATE_CONNECTION);
