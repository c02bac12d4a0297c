//! Wire command codec (§4.1): `cmd_id(1) || session_id(16) || payload`,
//! all multi-byte integers big-endian.

use alloc::vec::Vec;

use byteorder::{BigEndian, ByteOrder};

use crate::ids::{DeviceType, SessionId};

pub const CMD_START: u8 = 1;
pub const CMD_FRAGMENT: u8 = 2;
pub const CMD_END_FRAGMENTS: u8 = 3;
pub const CMD_FRAGMENTS_REQUEST: u8 = 4;
pub const CMD_ABORT: u8 = 5;
pub const CMD_ACTIVATE: u8 = 6;
pub const CMD_MANIFEST: u8 = 7;

const HEADER_LEN: usize = 1 + 16;

/// A decoded/to-be-encoded command body, sans header.
///
/// `Firmware` never crosses the socket codec (§4.1): it only ever arrives
/// from the local resource side-channel, so it has no `cmd_id` and is not
/// part of this enum. See `engine::router::FirmwareTrigger`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start {
        device_type: DeviceType,
        frag_count: u16,
        frag_size: u16,
        total_size: u32,
        hash: [u8; 32],
    },
    Fragment {
        frag_id: u16,
        data: Vec<u8>,
        crc: u16,
    },
    EndFragments,
    FragmentsRequest {
        segment_id: u16,
        bitmask: [u8; 16],
    },
    Abort,
    Activate {
        device_type: DeviceType,
        delay_seconds: u32,
    },
    Manifest {
        data: Vec<u8>,
    },
}

/// A complete wire frame: header plus command body.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub session_id: SessionId,
    pub command: Command,
}

/// Errors produced while decoding a frame off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    TooShort,
    UnknownCommand(u8),
    BadDeviceType(u8),
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 8);
        let cmd_id = match &self.command {
            Command::Start { .. } => CMD_START,
            Command::Fragment { .. } => CMD_FRAGMENT,
            Command::EndFragments => CMD_END_FRAGMENTS,
            Command::FragmentsRequest { .. } => CMD_FRAGMENTS_REQUEST,
            Command::Abort => CMD_ABORT,
            Command::Activate { .. } => CMD_ACTIVATE,
            Command::Manifest { .. } => CMD_MANIFEST,
        };
        buf.push(cmd_id);
        buf.extend_from_slice(self.session_id.as_bytes());

        match &self.command {
            Command::Start {
                device_type,
                frag_count,
                frag_size,
                total_size,
                hash,
            } => {
                buf.push(device_type.to_wire());
                push_u16(&mut buf, *frag_count);
                push_u16(&mut buf, *frag_size);
                push_u32(&mut buf, *total_size);
                buf.extend_from_slice(hash);
            }
            Command::Fragment { frag_id, data, crc } => {
                push_u16(&mut buf, *frag_id);
                buf.extend_from_slice(data);
                push_u16(&mut buf, *crc);
            }
            Command::EndFragments => {}
            Command::FragmentsRequest { segment_id, bitmask } => {
                push_u16(&mut buf, *segment_id);
                buf.extend_from_slice(bitmask);
            }
            Command::Abort => {}
            Command::Activate {
                device_type,
                delay_seconds,
            } => {
                buf.push(device_type.to_wire());
                push_u32(&mut buf, *delay_seconds);
            }
            Command::Manifest { data } => {
                buf.extend_from_slice(data);
            }
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Frame, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::TooShort);
        }
        let cmd_id = buf[0];
        let mut session_id_bytes = [0u8; 16];
        session_id_bytes.copy_from_slice(&buf[1..HEADER_LEN]);
        let session_id = SessionId(session_id_bytes);
        let payload = &buf[HEADER_LEN..];

        let command = match cmd_id {
            CMD_START => {
                if payload.len() < 1 + 2 + 2 + 4 + 32 {
                    return Err(CodecError::TooShort);
                }
                let device_type = DeviceType::from_wire(payload[0])
                    .ok_or(CodecError::BadDeviceType(payload[0]))?;
                let frag_count = BigEndian::read_u16(&payload[1..3]);
                let frag_size = BigEndian::read_u16(&payload[3..5]);
                let total_size = BigEndian::read_u32(&payload[5..9]);
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&payload[9..41]);
                Command::Start {
                    device_type,
                    frag_count,
                    frag_size,
                    total_size,
                    hash,
                }
            }
            CMD_FRAGMENT => {
                if payload.len() < 2 + 2 {
                    return Err(CodecError::TooShort);
                }
                let frag_id = BigEndian::read_u16(&payload[0..2]);
                let data_len = payload.len() - 2 - 2;
                let data = payload[2..2 + data_len].to_vec();
                let crc = BigEndian::read_u16(&payload[2 + data_len..2 + data_len + 2]);
                Command::Fragment { frag_id, data, crc }
            }
            CMD_END_FRAGMENTS => Command::EndFragments,
            CMD_FRAGMENTS_REQUEST => {
                if payload.len() < 2 + 16 {
                    return Err(CodecError::TooShort);
                }
                let segment_id = BigEndian::read_u16(&payload[0..2]);
                let mut bitmask = [0u8; 16];
                bitmask.copy_from_slice(&payload[2..18]);
                Command::FragmentsRequest {
                    segment_id,
                    bitmask,
                }
            }
            CMD_ABORT => Command::Abort,
            CMD_ACTIVATE => {
                if payload.len() < 1 + 4 {
                    return Err(CodecError::TooShort);
                }
                let device_type = DeviceType::from_wire(payload[0])
                    .ok_or(CodecError::BadDeviceType(payload[0]))?;
                let delay_seconds = BigEndian::read_u32(&payload[1..5]);
                Command::Activate {
                    device_type,
                    delay_seconds,
                }
            }
            CMD_MANIFEST => Command::Manifest {
                data: payload.to_vec(),
            },
            other => return Err(CodecError::UnknownCommand(other)),
        };

        Ok(Frame {
            session_id,
            command,
        })
    }
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    let mut tmp = [0u8; 2];
    BigEndian::write_u16(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    let mut tmp = [0u8; 4];
    BigEndian::write_u32(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

/// Nibble-table CRC-16, polynomial constant `0x1081`. Bit-for-bit match
/// with the reference fragment checksum; must not be "simplified" into a
/// different (even equivalent-looking) CRC-16 variant, since interop with
/// already-deployed nodes depends on this exact reduction.
pub fn fragment_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &c in data {
        let c = c as u16;
        let mut q = (crc ^ c) & 0x0F;
        crc = (crc >> 4) ^ (q * 0x1081);
        q = (crc ^ (c >> 4)) & 0x0F;
        crc = (crc >> 4) ^ (q * 0x1081);
    }
    crc
}
