//! Splits outbound PDUs into controller-sized ACL fragments

use crate::hci::packet::{AclPacket, PacketBoundaryFlag};

pub struct AclFragmenter {
    mtu: usize,
}

impl AclFragmenter {
    pub fn new(mtu: usize) -> Self {
        assert!(mtu > 0, "ACL MTU must be non-zero");
        Self { mtu }
    }

    /// The first fragment is flushable, every later one is a continuation.
    pub fn fragment(&self, handle: u16, pdu: Vec<u8>) -> Vec<AclPacket> {
        if pdu.len() <= self.mtu {
            return vec![AclPacket::new(
                handle,
                PacketBoundaryFlag::FirstAutomaticallyFlushable,
                pdu,
            )];
        }

        pdu.chunks(self.mtu)
            .enumerate()
            .map(|(index, chunk)| {
                let boundary_flag = if index == 0 {
                    PacketBoundaryFlag::FirstAutomaticallyFlushable
                } else {
                    PacketBoundaryFlag::ContinuingFragment
                };
                AclPacket::new(handle, boundary_flag, chunk.to_vec())
            })
            .collect()
    }
}
