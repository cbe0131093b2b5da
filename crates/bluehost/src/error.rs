use thiserror::Error;

/// Errors raised while decoding HCI traffic
#[derive(Error, Debug)]
pub enum HciError {
    #[error("Invalid parameter length: {0}")]
    InvalidParamLength(usize),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("Truncated {what}: need {needed} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("Unsupported event 0x{0:02x}")]
    UnsupportedEvent(u8),

    #[error("Unsupported LE subevent 0x{0:02x}")]
    UnsupportedLeSubevent(u8),

    #[error("Malformed packet: {0}")]
    Io(#[from] std::io::Error),
}

pub type HciResult<T> = std::result::Result<T, HciError>;

/// Reasons an inbound ACL fragment is dropped during PDU recombination
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclError {
    #[error("controller is not allowed to send FIRST_NON_AUTOMATICALLY_FLUSHABLE to the host")]
    FirstNonFlushable,

    #[error("boundary flag COMPLETE is not valid on an inbound ACL fragment")]
    CompleteNotAllowed,

    #[error("continuation fragment without a starting fragment")]
    UnexpectedContinuation,

    #[error("continuation of {payload} bytes exceeds the {remaining} bytes remaining, PDU dropped")]
    ContinuationOverflow { payload: usize, remaining: usize },

    #[error("starting fragment of {0} bytes is shorter than the basic L2CAP header")]
    ShortStartFragment(usize),
}
