//! L2CAP (Logical Link Control and Adaptation Protocol)
//!
//! Multiplexes fixed and dynamic channels over ACL links obtained from the
//! [`AclManager`](crate::hci::AclManager). Links are created on demand when a
//! client connects a service and torn down once they sit unused for the
//! configured idle timeout.

pub mod channel;
pub mod constants;
mod dynamic_channel_allocator;
mod fixed_channel_allocator;
mod link;
mod link_manager;
pub mod module;
pub mod packet;
pub mod psm;
pub mod service;
pub mod signalling;
pub mod types;

#[cfg(test)]
mod tests;

pub use self::channel::{DynamicChannel, FixedChannel};
pub use self::module::{DynamicChannelManager, FixedChannelManager, L2capModule};
pub use self::packet::{BasicFrame, L2capHeader};
pub use self::psm::Psm;
pub use self::service::{DynamicChannelService, FixedChannelService};
pub use self::signalling::{SignallingCommand, SignallingPacket};
pub use self::types::*;
