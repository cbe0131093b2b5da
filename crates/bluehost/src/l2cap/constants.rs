//! L2CAP constants
//!
//! See Bluetooth Core Specification Vol 3, Part A.

// Fixed channel identifiers
pub const CLASSIC_SIGNALLING_CID: u16 = 0x0001;
pub const CONNECTIONLESS_CID: u16 = 0x0002;
pub const LE_ATTRIBUTE_CID: u16 = 0x0004;
pub const LE_SIGNALLING_CID: u16 = 0x0005;
pub const LE_SECURITY_CID: u16 = 0x0006;
pub const CLASSIC_PAIRING_CID: u16 = 0x0007;

pub const FIRST_FIXED_CID: u16 = 0x0001;
pub const LAST_FIXED_CID: u16 = 0x003F;
pub const FIRST_DYNAMIC_CID: u16 = 0x0040;
pub const LAST_CLASSIC_DYNAMIC_CID: u16 = 0xFFFF;
pub const LAST_LE_DYNAMIC_CID: u16 = 0x007F;

pub const BASIC_HEADER_SIZE: usize = 4;
pub const COMMAND_HEADER_SIZE: usize = 4;

pub const DEFAULT_CLASSIC_MTU: u16 = 672;
pub const DEFAULT_LE_MTU: u16 = 23;

// Signalling command codes
pub const COMMAND_REJECT: u8 = 0x01;
pub const CONNECTION_REQUEST: u8 = 0x02;
pub const CONNECTION_RESPONSE: u8 = 0x03;
pub const CONFIGURATION_REQUEST: u8 = 0x04;
pub const CONFIGURATION_RESPONSE: u8 = 0x05;
pub const DISCONNECTION_REQUEST: u8 = 0x06;
pub const DISCONNECTION_RESPONSE: u8 = 0x07;
pub const ECHO_REQUEST: u8 = 0x08;
pub const ECHO_RESPONSE: u8 = 0x09;
pub const INFORMATION_REQUEST: u8 = 0x0A;
pub const INFORMATION_RESPONSE: u8 = 0x0B;

// Command Reject reasons
pub const REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const REJECT_SIGNALLING_MTU_EXCEEDED: u16 = 0x0001;
pub const REJECT_INVALID_CID: u16 = 0x0002;

// Connection Response results
pub const CONNECTION_SUCCESS: u16 = 0x0000;
pub const CONNECTION_PENDING: u16 = 0x0001;
pub const CONNECTION_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const CONNECTION_SECURITY_BLOCK: u16 = 0x0003;
pub const CONNECTION_NO_RESOURCES_AVAILABLE: u16 = 0x0004;
pub const CONNECTION_INVALID_CID: u16 = 0x0006;
pub const CONNECTION_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x0007;

// Connection Response status (meaningful with CONNECTION_PENDING)
pub const CONNECTION_STATUS_NO_INFO: u16 = 0x0000;

// Configuration Response results
pub const CONFIGURATION_SUCCESS: u16 = 0x0000;
pub const CONFIGURATION_UNACCEPTABLE_PARAMETERS: u16 = 0x0001;
pub const CONFIGURATION_REJECTED: u16 = 0x0002;

// Configuration options
pub const CONFIG_OPTION_MTU: u8 = 0x01;
pub const CONFIG_OPTION_HINT: u8 = 0x80;

// Information Response results
pub const INFORMATION_NOT_SUPPORTED: u16 = 0x0001;
