//! Construction-time parameters
//!
//! Values that would come from the controller (buffer count and size) are
//! supplied here so components never reach for global state.

use crate::hci::address::AddressType;
use crate::hci::packet::PacketTypes;
use std::time::Duration;

/// Parameters used when initiating LE connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeConnectionParameters {
    pub scan_interval: u16,
    pub scan_window: u16,
    pub own_address_type: AddressType,
    pub conn_interval_min: u16,
    pub conn_interval_max: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
    pub min_ce_length: u16,
    pub max_ce_length: u16,
}

impl Default for LeConnectionParameters {
    fn default() -> Self {
        Self {
            scan_interval: 0x0060,
            scan_window: 0x0030,
            own_address_type: AddressType::RandomDevice,
            conn_interval_min: 0x0018,
            conn_interval_max: 0x0028,
            conn_latency: 0x0000,
            supervision_timeout: 0x01F4,
            min_ce_length: 0x0002,
            max_ce_length: 0x0C00,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AclManagerConfig {
    /// Number of ACL buffers in the controller, i.e. the credit pool size
    pub max_acl_packet_credits: u16,
    /// Largest ACL payload the controller accepts per fragment
    pub acl_buffer_length: usize,
    /// Reassembled PDUs held per connection before the oldest is dropped
    pub max_queued_packets_per_connection: usize,
    /// PDUs an upper layer may queue per connection before the oldest is dropped
    pub outbound_queue_depth: usize,
    pub classic_packet_type: PacketTypes,
    pub page_scan_repetition_mode: u8,
    pub le_connection_parameters: LeConnectionParameters,
}

impl Default for AclManagerConfig {
    fn default() -> Self {
        Self {
            max_acl_packet_credits: 8,
            acl_buffer_length: 1021,
            max_queued_packets_per_connection: 10,
            outbound_queue_depth: 32,
            classic_packet_type: PacketTypes::default(),
            page_scan_repetition_mode: 0x01,
            le_connection_parameters: LeConnectionParameters::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct L2capConfig {
    /// Time a link may sit without any channel before it is disconnected
    pub link_idle_timeout: Duration,
    /// MTU advertised in configuration requests
    pub default_mtu: u16,
    /// Depth of each channel's queues
    pub channel_queue_depth: usize,
}

impl L2capConfig {
    pub fn classic() -> Self {
        Self {
            link_idle_timeout: Duration::from_secs(20),
            default_mtu: 672,
            channel_queue_depth: 10,
        }
    }

    pub fn le() -> Self {
        Self {
            default_mtu: 23,
            ..Self::classic()
        }
    }
}

impl Default for L2capConfig {
    fn default() -> Self {
        Self::classic()
    }
}
