//! Bluehost - the connection layers of a Bluetooth host stack
//!
//! The [`hci`] module owns ACL connections to remote devices: it creates and
//! accepts connections, shares the controller's data buffers fairly between
//! them, and reassembles fragmented packets. The [`l2cap`] module builds on
//! top of it, multiplexing fixed and dynamic channels over each link and
//! bringing links up and down on demand.
//!
//! Everything is single threaded. Components run on [`os::Handler`]s driven
//! by one [`os::Looper`], and talk to each other by posting tasks.

pub mod config;
pub mod error;
pub mod hci;
pub mod l2cap;
pub mod os;

// Re-export common types for convenience
pub use config::{AclManagerConfig, L2capConfig, LeConnectionParameters};
pub use error::{AclError, HciError};
pub use hci::{AclConnection, AclManager, Address, AddressType, AddressWithType, ErrorCode, HciLayer};
pub use l2cap::{
    ConnectionResult, DynamicChannel, DynamicChannelManager, FixedChannel, FixedChannelManager, L2capError,
    L2capModule, Psm, SecurityPolicy,
};
pub use os::{Handler, Looper};
