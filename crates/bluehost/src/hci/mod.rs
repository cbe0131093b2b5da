//! Bluetooth HCI (Host Controller Interface) connection layer
//!
//! Command and event formats the connection layer needs, plus the ACL
//! manager that multiplexes data over the controller's shared buffers.

pub mod acl_connection;
pub mod acl_fragmenter;
pub mod acl_manager;
pub mod address;
pub mod callbacks;
pub mod constants;
pub mod error_code;
pub mod event;
pub mod layer;
pub mod packet;

#[cfg(test)]
pub(crate) mod testing;


pub use acl_connection::{AclConnection, ConnectionUpdateParameters};
pub use acl_fragmenter::AclFragmenter;
pub use acl_manager::{AclManager, CreditStatus};
pub use address::{Address, AddressType, AddressWithType, ClassOfDevice, Role};
pub use callbacks::{
    AclManagerCallbacks, ConnectionCallbacks, ConnectionManagementCallbacks, LeConnectionCallbacks,
};
pub use error_code::ErrorCode;
pub use event::{Event, HciEvent, RemoteVersion};
pub use layer::{CommandCallback, CommandResult, HciLayer};
pub use packet::{
    AclPacket, BroadcastFlag, HciCommand, LinkPolicySettings, Mode, PacketBoundaryFlag, PacketTypes,
};
