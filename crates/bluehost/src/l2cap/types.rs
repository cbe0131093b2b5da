//! Type definitions for L2CAP operations

use super::constants::*;
use super::psm::Psm;
use crate::hci::ErrorCode;
use std::fmt;
use thiserror::Error;

/// Error types specific to L2CAP frame and signalling decoding
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("{what} too short: need {needed} bytes, have {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("Frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Unknown signalling command 0x{code:02x} (identifier {identifier})")]
    UnknownCommand { code: u8, identifier: u8 },

    #[error("Signalling identifier 0 is reserved")]
    ReservedIdentifier,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Which controller transport a link manager serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Classic,
    Le,
}

impl Transport {
    pub fn signalling_cid(self) -> u16 {
        match self {
            Transport::Classic => CLASSIC_SIGNALLING_CID,
            Transport::Le => LE_SIGNALLING_CID,
        }
    }

    pub fn last_dynamic_cid(self) -> u16 {
        match self {
            Transport::Classic => LAST_CLASSIC_DYNAMIC_CID,
            Transport::Le => LAST_LE_DYNAMIC_CID,
        }
    }

    /// Fixed channel ids a service may register: the fixed range minus signalling
    pub fn is_valid_fixed_service_cid(self, cid: u16) -> bool {
        (FIRST_FIXED_CID..=LAST_FIXED_CID).contains(&cid) && cid != self.signalling_cid()
    }

    pub fn is_valid_psm(self, psm: Psm) -> bool {
        match self {
            Transport::Classic => psm.is_valid_classic(),
            Transport::Le => psm.is_valid_le(),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Classic => write!(f, "classic"),
            Transport::Le => write!(f, "LE"),
        }
    }
}

/// Outcome of a service registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationResult {
    Success,
    FailInvalidService,
    FailDuplicateService,
}

/// Security a dynamic channel needs before it may open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPolicy {
    /// Plaintext transport is fine
    #[default]
    None,
    /// The classic link must be authenticated and encrypted
    EncryptedTransport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionResultCode {
    Success,
    FailNoServiceRegistered,
    FailAllServicesHaveChannel,
    FailHciError,
    FailL2capError,
}

/// Why a channel connection attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionResult {
    pub code: ConnectionResultCode,
    /// Controller reason, set with [`ConnectionResultCode::FailHciError`]
    pub hci_error: ErrorCode,
    /// Connection Response result from the peer, set with [`ConnectionResultCode::FailL2capError`]
    pub l2cap_result: u16,
}

impl ConnectionResult {
    pub fn new(code: ConnectionResultCode) -> Self {
        Self {
            code,
            hci_error: ErrorCode::SUCCESS,
            l2cap_result: CONNECTION_SUCCESS,
        }
    }

    pub fn hci_error(reason: ErrorCode) -> Self {
        Self {
            hci_error: reason,
            ..Self::new(ConnectionResultCode::FailHciError)
        }
    }

    pub fn l2cap_error(result: u16) -> Self {
        Self {
            l2cap_result: result,
            ..Self::new(ConnectionResultCode::FailL2capError)
        }
    }
}
