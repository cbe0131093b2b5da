//! HCI event parsing
//!
//! The transport hands over raw [`HciEvent`]s; [`Event::parse`] turns the
//! ones the connection layer consumes into typed values.

use crate::error::{HciError, HciResult};
use crate::hci::address::{Address, AddressType, AddressWithType, ClassOfDevice, Role};
use crate::hci::constants::*;
use crate::hci::error_code::ErrorCode;
use crate::hci::packet::{Mode, PacketTypes};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// HCI event as received from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    pub fn new(event_code: u8, parameters: Vec<u8>) -> Self {
        Self {
            event_code,
            parameters,
        }
    }

    /// Parse an HCI event from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1] as usize;

        if data.len() < parameter_total_length + 2 {
            return None;
        }

        Some(HciEvent {
            event_code,
            parameters: data[2..parameter_total_length + 2].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.event_code, self.parameters.len() as u8];
        bytes.extend_from_slice(&self.parameters);
        bytes
    }

    /// Subevent code when this is an LE meta event
    pub fn le_subevent_code(&self) -> Option<u8> {
        if self.event_code == EVT_LE_META_EVENT {
            self.parameters.first().copied()
        } else {
            None
        }
    }
}

/// Link Manager version of a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteVersion {
    pub version: u8,
    pub manufacturer_name: u16,
    pub subversion: u16,
}

/// Events consumed by the ACL connection layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConnectionComplete {
        status: ErrorCode,
        handle: u16,
        bd_addr: Address,
        link_type: u8,
        encryption_enabled: bool,
    },
    ConnectionRequest {
        bd_addr: Address,
        class_of_device: ClassOfDevice,
        link_type: u8,
    },
    DisconnectionComplete {
        status: ErrorCode,
        handle: u16,
        reason: ErrorCode,
    },
    AuthenticationComplete {
        status: ErrorCode,
        handle: u16,
    },
    EncryptionChange {
        status: ErrorCode,
        handle: u16,
        enabled: bool,
    },
    ReadRemoteSupportedFeaturesComplete {
        status: ErrorCode,
        handle: u16,
        features: u64,
    },
    ReadRemoteVersionInformationComplete {
        status: ErrorCode,
        handle: u16,
        version: RemoteVersion,
    },
    CommandComplete {
        num_packets: u8,
        opcode: u16,
        return_parameters: Vec<u8>,
    },
    CommandStatus {
        status: ErrorCode,
        num_packets: u8,
        opcode: u16,
    },
    FlushOccurred {
        handle: u16,
    },
    RoleChange {
        status: ErrorCode,
        bd_addr: Address,
        new_role: Role,
    },
    NumberOfCompletedPackets {
        completed: Vec<(u16, u16)>,
    },
    ModeChange {
        status: ErrorCode,
        handle: u16,
        current_mode: Mode,
        interval: u16,
    },
    ReadClockOffsetComplete {
        status: ErrorCode,
        handle: u16,
        clock_offset: u16,
    },
    ConnectionPacketTypeChanged {
        status: ErrorCode,
        handle: u16,
        packet_type: PacketTypes,
    },
    LeConnectionComplete {
        status: ErrorCode,
        handle: u16,
        role: Role,
        peer: AddressWithType,
        conn_interval: u16,
        conn_latency: u16,
        supervision_timeout: u16,
    },
    LeConnectionUpdateComplete {
        status: ErrorCode,
        handle: u16,
        conn_interval: u16,
        conn_latency: u16,
        supervision_timeout: u16,
    },
    /// Connection complete from a controller doing address resolution.
    /// The private addresses are empty when not in use.
    LeEnhancedConnectionComplete {
        status: ErrorCode,
        handle: u16,
        role: Role,
        peer: AddressWithType,
        local_resolvable_private_address: Address,
        peer_resolvable_private_address: Address,
        conn_interval: u16,
        conn_latency: u16,
        supervision_timeout: u16,
    },
}

fn read_status(cursor: &mut Cursor<&[u8]>) -> HciResult<ErrorCode> {
    Ok(ErrorCode(cursor.read_u8()?))
}

fn read_handle(cursor: &mut Cursor<&[u8]>) -> HciResult<u16> {
    Ok(cursor.read_u16::<LittleEndian>()? & ACL_HANDLE_MASK)
}

fn read_address(cursor: &mut Cursor<&[u8]>) -> HciResult<Address> {
    let mut bytes = [0u8; 6];
    cursor.read_exact(&mut bytes)?;
    Ok(Address::new(bytes))
}

impl Event {
    pub fn parse(event: &HciEvent) -> HciResult<Self> {
        let mut cursor = Cursor::new(event.parameters.as_slice());
        let c = &mut cursor;

        let parsed = match event.event_code {
            EVT_CONN_COMPLETE => Event::ConnectionComplete {
                status: read_status(c)?,
                handle: read_handle(c)?,
                bd_addr: read_address(c)?,
                link_type: c.read_u8()?,
                encryption_enabled: c.read_u8()? != 0,
            },
            EVT_CONN_REQUEST => {
                let bd_addr = read_address(c)?;
                let mut class_of_device = [0u8; 3];
                c.read_exact(&mut class_of_device)?;
                Event::ConnectionRequest {
                    bd_addr,
                    class_of_device: ClassOfDevice(class_of_device),
                    link_type: c.read_u8()?,
                }
            }
            EVT_DISCONN_COMPLETE => Event::DisconnectionComplete {
                status: read_status(c)?,
                handle: read_handle(c)?,
                reason: ErrorCode(c.read_u8()?),
            },
            EVT_AUTH_COMPLETE => Event::AuthenticationComplete {
                status: read_status(c)?,
                handle: read_handle(c)?,
            },
            EVT_ENCRYPTION_CHANGE => Event::EncryptionChange {
                status: read_status(c)?,
                handle: read_handle(c)?,
                enabled: c.read_u8()? != 0,
            },
            EVT_READ_REMOTE_FEATURES_COMPLETE => Event::ReadRemoteSupportedFeaturesComplete {
                status: read_status(c)?,
                handle: read_handle(c)?,
                features: c.read_u64::<LittleEndian>()?,
            },
            EVT_READ_REMOTE_VERSION_COMPLETE => Event::ReadRemoteVersionInformationComplete {
                status: read_status(c)?,
                handle: read_handle(c)?,
                version: RemoteVersion {
                    version: c.read_u8()?,
                    manufacturer_name: c.read_u16::<LittleEndian>()?,
                    subversion: c.read_u16::<LittleEndian>()?,
                },
            },
            EVT_CMD_COMPLETE => {
                let num_packets = c.read_u8()?;
                let opcode = c.read_u16::<LittleEndian>()?;
                let mut return_parameters = Vec::new();
                c.read_to_end(&mut return_parameters)?;
                Event::CommandComplete {
                    num_packets,
                    opcode,
                    return_parameters,
                }
            }
            EVT_CMD_STATUS => Event::CommandStatus {
                status: read_status(c)?,
                num_packets: c.read_u8()?,
                opcode: c.read_u16::<LittleEndian>()?,
            },
            EVT_FLUSH_OCCURRED => Event::FlushOccurred {
                handle: read_handle(c)?,
            },
            EVT_ROLE_CHANGE => Event::RoleChange {
                status: read_status(c)?,
                bd_addr: read_address(c)?,
                new_role: Role::from(c.read_u8()?),
            },
            EVT_NUM_COMP_PKTS => {
                let count = c.read_u8()? as usize;
                let mut completed = Vec::with_capacity(count);
                for _ in 0..count {
                    let handle = read_handle(c)?;
                    let packets = c.read_u16::<LittleEndian>()?;
                    completed.push((handle, packets));
                }
                Event::NumberOfCompletedPackets { completed }
            }
            EVT_MODE_CHANGE => Event::ModeChange {
                status: read_status(c)?,
                handle: read_handle(c)?,
                current_mode: Mode::from(c.read_u8()?),
                interval: c.read_u16::<LittleEndian>()?,
            },
            EVT_READ_CLOCK_OFFSET_COMPLETE => Event::ReadClockOffsetComplete {
                status: read_status(c)?,
                handle: read_handle(c)?,
                clock_offset: c.read_u16::<LittleEndian>()?,
            },
            EVT_CONN_PACKET_TYPE_CHANGED => Event::ConnectionPacketTypeChanged {
                status: read_status(c)?,
                handle: read_handle(c)?,
                packet_type: PacketTypes::from_bits_truncate(c.read_u16::<LittleEndian>()?),
            },
            EVT_LE_META_EVENT => return Self::parse_le_meta(c),
            other => return Err(HciError::UnsupportedEvent(other)),
        };
        Ok(parsed)
    }

    fn parse_le_meta(c: &mut Cursor<&[u8]>) -> HciResult<Self> {
        match c.read_u8()? {
            EVT_LE_CONN_COMPLETE => {
                let status = read_status(c)?;
                let handle = read_handle(c)?;
                let role = Role::from(c.read_u8()?);
                let address_type = AddressType::from(c.read_u8()?);
                let address = read_address(c)?;
                Ok(Event::LeConnectionComplete {
                    status,
                    handle,
                    role,
                    peer: AddressWithType::new(address, address_type),
                    conn_interval: c.read_u16::<LittleEndian>()?,
                    conn_latency: c.read_u16::<LittleEndian>()?,
                    supervision_timeout: c.read_u16::<LittleEndian>()?,
                })
            }
            EVT_LE_CONN_UPDATE_COMPLETE => Ok(Event::LeConnectionUpdateComplete {
                status: read_status(c)?,
                handle: read_handle(c)?,
                conn_interval: c.read_u16::<LittleEndian>()?,
                conn_latency: c.read_u16::<LittleEndian>()?,
                supervision_timeout: c.read_u16::<LittleEndian>()?,
            }),
            EVT_LE_ENHANCED_CONN_COMPLETE => {
                let status = read_status(c)?;
                let handle = read_handle(c)?;
                let role = Role::from(c.read_u8()?);
                let address_type = AddressType::from(c.read_u8()?);
                let address = read_address(c)?;
                Ok(Event::LeEnhancedConnectionComplete {
                    status,
                    handle,
                    role,
                    peer: AddressWithType::new(address, address_type),
                    local_resolvable_private_address: read_address(c)?,
                    peer_resolvable_private_address: read_address(c)?,
                    conn_interval: c.read_u16::<LittleEndian>()?,
                    conn_latency: c.read_u16::<LittleEndian>()?,
                    supervision_timeout: c.read_u16::<LittleEndian>()?,
                })
            }
            other => Err(HciError::UnsupportedLeSubevent(other)),
        }
    }
}

/// Address an enhanced connection complete is reported under: the peer's
/// resolvable private address when the controller used one.
pub fn reporting_address(peer: AddressWithType, peer_resolvable_private_address: Address) -> AddressWithType {
    if peer_resolvable_private_address.is_empty() {
        peer
    } else {
        AddressWithType::new(peer_resolvable_private_address, AddressType::RandomDevice)
    }
}
