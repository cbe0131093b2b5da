//! L2CAP signalling commands
//!
//! The structured command set exchanged on the signalling channel, with the
//! codec needed to carry it. The same set is used on both transports.

use super::constants::*;
use super::packet::CommandHeader;
use super::psm::Psm;
use super::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignallingCommand {
    CommandReject {
        reason: u16,
        data: Vec<u8>,
    },
    ConnectionRequest {
        psm: Psm,
        source_cid: u16,
    },
    ConnectionResponse {
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },
    ConfigurationRequest {
        destination_cid: u16,
        flags: u16,
        mtu: Option<u16>,
    },
    ConfigurationResponse {
        source_cid: u16,
        flags: u16,
        result: u16,
        mtu: Option<u16>,
    },
    DisconnectionRequest {
        destination_cid: u16,
        source_cid: u16,
    },
    DisconnectionResponse {
        destination_cid: u16,
        source_cid: u16,
    },
    EchoRequest {
        data: Vec<u8>,
    },
    EchoResponse {
        data: Vec<u8>,
    },
    InformationRequest {
        info_type: u16,
    },
    InformationResponse {
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },
}

impl SignallingCommand {
    pub fn code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => COMMAND_REJECT,
            Self::ConnectionRequest { .. } => CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => CONNECTION_RESPONSE,
            Self::ConfigurationRequest { .. } => CONFIGURATION_REQUEST,
            Self::ConfigurationResponse { .. } => CONFIGURATION_RESPONSE,
            Self::DisconnectionRequest { .. } => DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => DISCONNECTION_RESPONSE,
            Self::EchoRequest { .. } => ECHO_REQUEST,
            Self::EchoResponse { .. } => ECHO_RESPONSE,
            Self::InformationRequest { .. } => INFORMATION_REQUEST,
            Self::InformationResponse { .. } => INFORMATION_RESPONSE,
        }
    }

    fn parameters(&self) -> Vec<u8> {
        let mut params = Vec::new();
        match self {
            Self::CommandReject { reason, data } => {
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
            }
            Self::ConnectionRequest { psm, source_cid } => {
                params.extend_from_slice(&psm.value().to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }
            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&status.to_le_bytes());
            }
            Self::ConfigurationRequest {
                destination_cid,
                flags,
                mtu,
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                write_mtu_option(&mut params, *mtu);
            }
            Self::ConfigurationResponse {
                source_cid,
                flags,
                result,
                mtu,
            } => {
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                write_mtu_option(&mut params, *mtu);
            }
            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
            } => {
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
            }
            Self::EchoRequest { data } | Self::EchoResponse { data } => {
                params.extend_from_slice(data);
            }
            Self::InformationRequest { info_type } => {
                params.extend_from_slice(&info_type.to_le_bytes());
            }
            Self::InformationResponse {
                info_type,
                result,
                data,
            } => {
                params.extend_from_slice(&info_type.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(data);
            }
        }
        params
    }
}

fn write_mtu_option(params: &mut Vec<u8>, mtu: Option<u16>) {
    if let Some(mtu) = mtu {
        params.push(CONFIG_OPTION_MTU);
        params.push(2);
        params.extend_from_slice(&mtu.to_le_bytes());
    }
}

/// Pull the MTU out of a configuration option list. Other options are skipped.
fn read_mtu_option(options: &[u8]) -> Option<u16> {
    let mut offset = 0;
    let mut mtu = None;
    while offset + 2 <= options.len() {
        let option_type = options[offset] & !CONFIG_OPTION_HINT;
        let option_length = options[offset + 1] as usize;
        let Some(data) = options.get(offset + 2..offset + 2 + option_length) else {
            break;
        };
        if option_type == CONFIG_OPTION_MTU && option_length == 2 {
            mtu = Some(u16::from_le_bytes([data[0], data[1]]));
        }
        offset += 2 + option_length;
    }
    mtu
}

/// One command and its identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignallingPacket {
    pub identifier: u8,
    pub command: SignallingCommand,
}

impl SignallingPacket {
    pub fn new(identifier: u8, command: SignallingCommand) -> Self {
        Self {
            identifier,
            command,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let params = self.command.parameters();
        let header = CommandHeader::new(self.command.code(), self.identifier, params.len() as u16);
        let mut bytes = Vec::with_capacity(COMMAND_HEADER_SIZE + params.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&params);
        bytes
    }

    /// Parse every command in a signalling frame.
    ///
    /// A bad command does not hide the ones after it as long as its header
    /// is intact. A truncated header ends the frame.
    pub fn parse_frame(data: &[u8]) -> Vec<L2capResult<SignallingPacket>> {
        let mut commands = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let header = match CommandHeader::parse(&data[offset..]) {
                Ok(header) => header,
                Err(e) => {
                    commands.push(Err(e));
                    break;
                }
            };
            let start = offset + COMMAND_HEADER_SIZE;
            let end = start + header.length as usize;
            let Some(params) = data.get(start..end) else {
                commands.push(Err(L2capError::Truncated {
                    what: "signalling command",
                    needed: header.length as usize,
                    actual: data.len() - start,
                }));
                break;
            };
            commands.push(Self::parse_command(header, params));
            offset = end;
        }
        commands
    }

    fn parse_command(header: CommandHeader, params: &[u8]) -> L2capResult<SignallingPacket> {
        if header.identifier == 0 {
            return Err(L2capError::ReservedIdentifier);
        }
        let mut c = Cursor::new(params);
        let command = match header.code {
            COMMAND_REJECT => {
                let reason = c.read_u16::<LittleEndian>()?;
                let mut data = Vec::new();
                c.read_to_end(&mut data)?;
                SignallingCommand::CommandReject { reason, data }
            }
            CONNECTION_REQUEST => SignallingCommand::ConnectionRequest {
                psm: Psm(c.read_u16::<LittleEndian>()?),
                source_cid: c.read_u16::<LittleEndian>()?,
            },
            CONNECTION_RESPONSE => SignallingCommand::ConnectionResponse {
                destination_cid: c.read_u16::<LittleEndian>()?,
                source_cid: c.read_u16::<LittleEndian>()?,
                result: c.read_u16::<LittleEndian>()?,
                status: c.read_u16::<LittleEndian>()?,
            },
            CONFIGURATION_REQUEST => {
                let destination_cid = c.read_u16::<LittleEndian>()?;
                let flags = c.read_u16::<LittleEndian>()?;
                SignallingCommand::ConfigurationRequest {
                    destination_cid,
                    flags,
                    mtu: read_mtu_option(&params[4..]),
                }
            }
            CONFIGURATION_RESPONSE => {
                let source_cid = c.read_u16::<LittleEndian>()?;
                let flags = c.read_u16::<LittleEndian>()?;
                let result = c.read_u16::<LittleEndian>()?;
                SignallingCommand::ConfigurationResponse {
                    source_cid,
                    flags,
                    result,
                    mtu: read_mtu_option(&params[6..]),
                }
            }
            DISCONNECTION_REQUEST => SignallingCommand::DisconnectionRequest {
                destination_cid: c.read_u16::<LittleEndian>()?,
                source_cid: c.read_u16::<LittleEndian>()?,
            },
            DISCONNECTION_RESPONSE => SignallingCommand::DisconnectionResponse {
                destination_cid: c.read_u16::<LittleEndian>()?,
                source_cid: c.read_u16::<LittleEndian>()?,
            },
            ECHO_REQUEST => SignallingCommand::EchoRequest {
                data: params.to_vec(),
            },
            ECHO_RESPONSE => SignallingCommand::EchoResponse {
                data: params.to_vec(),
            },
            INFORMATION_REQUEST => SignallingCommand::InformationRequest {
                info_type: c.read_u16::<LittleEndian>()?,
            },
            INFORMATION_RESPONSE => {
                let info_type = c.read_u16::<LittleEndian>()?;
                let result = c.read_u16::<LittleEndian>()?;
                let mut data = Vec::new();
                c.read_to_end(&mut data)?;
                SignallingCommand::InformationResponse {
                    info_type,
                    result,
                    data,
                }
            }
            code => {
                return Err(L2capError::UnknownCommand {
                    code,
                    identifier: header.identifier,
                })
            }
        };
        Ok(SignallingPacket::new(header.identifier, command))
    }
}

/// Hands out signalling identifiers 1..=255, wrapping and skipping 0
#[derive(Debug)]
pub struct IdentifierAllocator {
    next: u8,
}

impl Default for IdentifierAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdentifierAllocator {
    pub fn next_identifier(&mut self) -> u8 {
        let identifier = self.next;
        self.next = self.next.checked_add(1).unwrap_or(1);
        identifier
    }

    /// Next identifier `in_use` does not claim. When all of them are
    /// claimed the plain next one comes back and its owner is displaced.
    pub fn next_free(&mut self, in_use: impl Fn(u8) -> bool) -> u8 {
        let first = self.next_identifier();
        let mut identifier = first;
        while in_use(identifier) {
            identifier = self.next_identifier();
            if identifier == first {
                break;
            }
        }
        identifier
    }
}
