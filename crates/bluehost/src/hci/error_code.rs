//! Controller status codes

use std::fmt;

/// Status or reason code reported by the controller
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u8);

impl ErrorCode {
    pub const SUCCESS: Self = ErrorCode(0x00);
    pub const UNKNOWN_HCI_COMMAND: Self = ErrorCode(0x01);
    pub const UNKNOWN_CONNECTION: Self = ErrorCode(0x02);
    pub const HARDWARE_FAILURE: Self = ErrorCode(0x03);
    pub const PAGE_TIMEOUT: Self = ErrorCode(0x04);
    pub const AUTHENTICATION_FAILURE: Self = ErrorCode(0x05);
    pub const PIN_OR_KEY_MISSING: Self = ErrorCode(0x06);
    pub const MEMORY_CAPACITY_EXCEEDED: Self = ErrorCode(0x07);
    pub const CONNECTION_TIMEOUT: Self = ErrorCode(0x08);
    pub const CONNECTION_LIMIT_EXCEEDED: Self = ErrorCode(0x09);
    pub const CONNECTION_ALREADY_EXISTS: Self = ErrorCode(0x0B);
    pub const COMMAND_DISALLOWED: Self = ErrorCode(0x0C);
    pub const CONNECTION_REJECTED_LIMITED_RESOURCES: Self = ErrorCode(0x0D);
    pub const CONNECTION_REJECTED_SECURITY_REASONS: Self = ErrorCode(0x0E);
    pub const CONNECTION_REJECTED_UNACCEPTABLE_BD_ADDR: Self = ErrorCode(0x0F);
    pub const CONNECTION_ACCEPT_TIMEOUT: Self = ErrorCode(0x10);
    pub const INVALID_HCI_COMMAND_PARAMETERS: Self = ErrorCode(0x12);
    pub const REMOTE_USER_TERMINATED_CONNECTION: Self = ErrorCode(0x13);
    pub const REMOTE_DEVICE_TERMINATED_CONNECTION_LOW_RESOURCES: Self = ErrorCode(0x14);
    pub const REMOTE_DEVICE_TERMINATED_CONNECTION_POWER_OFF: Self = ErrorCode(0x15);
    pub const CONNECTION_TERMINATED_BY_LOCAL_HOST: Self = ErrorCode(0x16);
    pub const UNSPECIFIED_ERROR: Self = ErrorCode(0x1F);
    pub const LMP_RESPONSE_TIMEOUT: Self = ErrorCode(0x22);
    pub const CONNECTION_FAILED_ESTABLISHMENT: Self = ErrorCode(0x3E);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Human-readable name for logs
    pub fn text(&self) -> &'static str {
        match *self {
            Self::SUCCESS => "SUCCESS",
            Self::UNKNOWN_HCI_COMMAND => "UNKNOWN_HCI_COMMAND",
            Self::UNKNOWN_CONNECTION => "UNKNOWN_CONNECTION",
            Self::HARDWARE_FAILURE => "HARDWARE_FAILURE",
            Self::PAGE_TIMEOUT => "PAGE_TIMEOUT",
            Self::AUTHENTICATION_FAILURE => "AUTHENTICATION_FAILURE",
            Self::PIN_OR_KEY_MISSING => "PIN_OR_KEY_MISSING",
            Self::MEMORY_CAPACITY_EXCEEDED => "MEMORY_CAPACITY_EXCEEDED",
            Self::CONNECTION_TIMEOUT => "CONNECTION_TIMEOUT",
            Self::CONNECTION_LIMIT_EXCEEDED => "CONNECTION_LIMIT_EXCEEDED",
            Self::CONNECTION_ALREADY_EXISTS => "CONNECTION_ALREADY_EXISTS",
            Self::COMMAND_DISALLOWED => "COMMAND_DISALLOWED",
            Self::CONNECTION_REJECTED_LIMITED_RESOURCES => "CONNECTION_REJECTED_LIMITED_RESOURCES",
            Self::CONNECTION_REJECTED_SECURITY_REASONS => "CONNECTION_REJECTED_SECURITY_REASONS",
            Self::CONNECTION_REJECTED_UNACCEPTABLE_BD_ADDR => {
                "CONNECTION_REJECTED_UNACCEPTABLE_BD_ADDR"
            }
            Self::CONNECTION_ACCEPT_TIMEOUT => "CONNECTION_ACCEPT_TIMEOUT",
            Self::INVALID_HCI_COMMAND_PARAMETERS => "INVALID_HCI_COMMAND_PARAMETERS",
            Self::REMOTE_USER_TERMINATED_CONNECTION => "REMOTE_USER_TERMINATED_CONNECTION",
            Self::REMOTE_DEVICE_TERMINATED_CONNECTION_LOW_RESOURCES => {
                "REMOTE_DEVICE_TERMINATED_CONNECTION_LOW_RESOURCES"
            }
            Self::REMOTE_DEVICE_TERMINATED_CONNECTION_POWER_OFF => {
                "REMOTE_DEVICE_TERMINATED_CONNECTION_POWER_OFF"
            }
            Self::CONNECTION_TERMINATED_BY_LOCAL_HOST => "CONNECTION_TERMINATED_BY_LOCAL_HOST",
            Self::UNSPECIFIED_ERROR => "UNSPECIFIED_ERROR",
            Self::LMP_RESPONSE_TIMEOUT => "LMP_RESPONSE_TIMEOUT",
            Self::CONNECTION_FAILED_ESTABLISHMENT => "CONNECTION_FAILED_ESTABLISHMENT",
            _ => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02x})", self.text(), self.0)
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        ErrorCode(value)
    }
}
