//! Sideband message codec for branch-device conversations.
//!
//! Down requests are framed with the standard sideband header (link
//! count, relative address, body length, sequence number, CRC-4 over the
//! header nibbles) and a CRC-8 over the body. Replies are ACK/NAK with a
//! per-opcode body. Only single-hop conversations are framed here; the
//! immediate branch device is the only party this crate speaks to.

use bytes::{BufMut, BytesMut};

use crate::error::DpError;

// ── Opcodes ──────────────────────────────────────────────────────

/// Down-request opcodes used by this crate.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    LinkAddress = 0x01,
    EnumPathResources = 0x10,
    AllocatePayload = 0x11,
    ClearPayloadIdTable = 0x14,
}

impl TryFrom<u8> for Opcode {
    type Error = DpError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Opcode::LinkAddress),
            0x10 => Ok(Opcode::EnumPathResources),
            0x11 => Ok(Opcode::AllocatePayload),
            0x14 => Ok(Opcode::ClearPayloadIdTable),
            _ => Err(DpError::UnknownVariant {
                type_name: "Opcode",
                value: value as u64,
            }),
        }
    }
}

// ── CRC helpers ──────────────────────────────────────────────────

/// CRC-4 over header nibbles, polynomial x^4 + x + 1 (0x13).
fn crc4(nibbles: &[u8]) -> u8 {
    let mut rem: u8 = 0;
    for &n in nibbles {
        for shift in (0..4).rev() {
            rem = (rem << 1) | ((n >> shift) & 1);
            if rem & 0x10 != 0 {
                rem ^= 0x13;
            }
        }
    }
    for _ in 0..4 {
        rem <<= 1;
        if rem & 0x10 != 0 {
            rem ^= 0x13;
        }
    }
    rem & 0xF
}

/// CRC-8 over body bytes, polynomial x^8 + x^7 + x^6 + x^4 + x^2 + 1
/// (0x1D5).
fn crc8(data: &[u8]) -> u8 {
    let mut rem: u16 = 0;
    for &b in data {
        for shift in (0..8).rev() {
            rem = (rem << 1) | ((b >> shift) & 1) as u16;
            if rem & 0x100 != 0 {
                rem ^= 0x1D5;
            }
        }
    }
    for _ in 0..8 {
        rem <<= 1;
        if rem & 0x100 != 0 {
            rem ^= 0x1D5;
        }
    }
    (rem & 0xFF) as u8
}

// ── Down requests ────────────────────────────────────────────────

/// A single-hop down request to the immediate branch device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownRequest {
    /// Enumerate the branch's ports.
    LinkAddress,
    /// Query full/available PBN on a branch port.
    EnumPathResources { port: u8 },
    /// Bind a virtual channel to a port with a PBN budget.
    AllocatePayload { port: u8, vcpi: u8, pbn: u16 },
    /// Drop every payload ID the branch holds.
    ClearPayloadIdTable,
}

impl DownRequest {
    pub fn opcode(&self) -> Opcode {
        match self {
            DownRequest::LinkAddress => Opcode::LinkAddress,
            DownRequest::EnumPathResources { .. } => Opcode::EnumPathResources,
            DownRequest::AllocatePayload { .. } => Opcode::AllocatePayload,
            DownRequest::ClearPayloadIdTable => Opcode::ClearPayloadIdTable,
        }
    }

    fn encode_body(&self, body: &mut BytesMut) {
        body.put_u8(self.opcode() as u8);
        match *self {
            DownRequest::LinkAddress | DownRequest::ClearPayloadIdTable => {}
            DownRequest::EnumPathResources { port } => {
                body.put_u8((port & 0xF) << 4);
            }
            DownRequest::AllocatePayload { port, vcpi, pbn } => {
                // No SDP streams are carried; the low nibble stays zero.
                body.put_u8((port & 0xF) << 4);
                body.put_u8(vcpi & 0x7F);
                body.put_u16(pbn);
            }
        }
    }

    /// Frame the request: header (single hop), body, body CRC.
    pub fn encode(&self, seqno: u8) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(8);
        self.encode_body(&mut body);
        let body_crc = crc8(&body);

        let lct: u8 = 1;
        let lcr: u8 = 0;
        // Body length counts the CRC byte.
        let len = (body.len() + 1) as u8;

        let mut msg = BytesMut::with_capacity(body.len() + 4);
        msg.put_u8((lct << 4) | lcr);
        msg.put_u8(len & 0x3F);
        // Single transaction: both start- and end-of-message set.
        let b2 = 0x80 | 0x40 | ((seqno & 0x1) << 4);
        let hdr_nibbles = [
            msg[0] >> 4,
            msg[0] & 0xF,
            msg[1] >> 4,
            msg[1] & 0xF,
            b2 >> 4,
        ];
        msg.put_u8(b2 | crc4(&hdr_nibbles));
        msg.extend_from_slice(&body);
        msg.put_u8(body_crc);
        msg.to_vec()
    }
}

// ── Replies ──────────────────────────────────────────────────────

/// One enumerated branch port from a LINK_ADDRESS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    pub port: u8,
    pub input: bool,
    pub peer_device_type: u8,
    pub mst_capable: bool,
    pub ddps: bool,
}

/// Decoded ACK bodies for the opcodes this crate sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownReply {
    LinkAddress {
        guid: [u8; 16],
        ports: Vec<PortInfo>,
    },
    EnumPathResources {
        port: u8,
        full_pbn: u16,
        available_pbn: u16,
    },
    AllocatePayload {
        port: u8,
        vcpi: u8,
        allocated_pbn: u16,
    },
    ClearPayloadIdTable,
    /// The branch rejected the request.
    Nak { reason: u8, data: u8 },
}

impl DownReply {
    /// Parse a framed reply as read from the down-reply message box.
    /// Verifies header CRC-4 and body CRC-8 before decoding.
    pub fn parse(raw: &[u8]) -> Result<DownReply, DpError> {
        if raw.len() < 5 {
            return Err(DpError::InvalidReply("reply shorter than header"));
        }
        let len = (raw[1] & 0x3F) as usize;
        let hdr_nibbles = [raw[0] >> 4, raw[0] & 0xF, raw[1] >> 4, raw[1] & 0xF, raw[2] >> 4];
        if crc4(&hdr_nibbles) != raw[2] & 0xF {
            return Err(DpError::CrcMismatch);
        }
        if raw.len() < 3 + len || len < 2 {
            return Err(DpError::InvalidReply("declared body exceeds reply"));
        }
        let body = &raw[3..3 + len - 1];
        if crc8(body) != raw[3 + len - 1] {
            return Err(DpError::CrcMismatch);
        }

        let nak = body[0] & 0x80 != 0;
        let opcode = Opcode::try_from(body[0] & 0x7F)?;
        let rest = &body[1..];

        if nak {
            if rest.len() < 18 {
                return Err(DpError::InvalidReply("nak body truncated"));
            }
            // GUID (16 bytes) precedes reason and data.
            return Ok(DownReply::Nak {
                reason: rest[16],
                data: rest[17],
            });
        }

        match opcode {
            Opcode::LinkAddress => {
                if rest.len() < 17 {
                    return Err(DpError::InvalidReply("link-address body truncated"));
                }
                let mut guid = [0u8; 16];
                guid.copy_from_slice(&rest[..16]);
                let nports = rest[16] as usize;
                let entries = &rest[17..];
                if entries.len() < nports * 2 {
                    return Err(DpError::InvalidReply("port entries truncated"));
                }
                let mut ports = Vec::with_capacity(nports);
                for i in 0..nports {
                    let b0 = entries[i * 2];
                    let b1 = entries[i * 2 + 1];
                    ports.push(PortInfo {
                        port: b0 & 0xF,
                        input: b0 & 0x80 != 0,
                        peer_device_type: (b0 >> 4) & 0x7,
                        mst_capable: b1 & 0x01 != 0,
                        ddps: b1 & 0x02 != 0,
                    });
                }
                Ok(DownReply::LinkAddress { guid, ports })
            }
            Opcode::EnumPathResources => {
                if rest.len() < 5 {
                    return Err(DpError::InvalidReply("enum-path body truncated"));
                }
                Ok(DownReply::EnumPathResources {
                    port: rest[0] >> 4,
                    full_pbn: u16::from_be_bytes([rest[1], rest[2]]),
                    available_pbn: u16::from_be_bytes([rest[3], rest[4]]),
                })
            }
            Opcode::AllocatePayload => {
                if rest.len() < 4 {
                    return Err(DpError::InvalidReply("allocate body truncated"));
                }
                Ok(DownReply::AllocatePayload {
                    port: rest[0] >> 4,
                    vcpi: rest[1] & 0x7F,
                    allocated_pbn: u16::from_be_bytes([rest[2], rest[3]]),
                })
            }
            Opcode::ClearPayloadIdTable => Ok(DownReply::ClearPayloadIdTable),
        }
    }

    /// Frame an ACK/NAK reply (used by the simulated branch in tests and
    /// the compliance tool).
    pub fn encode(&self, seqno: u8) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(24);
        match self {
            DownReply::LinkAddress { guid, ports } => {
                body.put_u8(Opcode::LinkAddress as u8);
                body.put_slice(guid);
                body.put_u8(ports.len() as u8);
                for p in ports {
                    let b0 = (p.input as u8) << 7 | (p.peer_device_type & 0x7) << 4 | (p.port & 0xF);
                    let b1 = (p.mst_capable as u8) | (p.ddps as u8) << 1;
                    body.put_u8(b0);
                    body.put_u8(b1);
                }
            }
            DownReply::EnumPathResources {
                port,
                full_pbn,
                available_pbn,
            } => {
                body.put_u8(Opcode::EnumPathResources as u8);
                body.put_u8(port << 4);
                body.put_u16(*full_pbn);
                body.put_u16(*available_pbn);
            }
            DownReply::AllocatePayload {
                port,
                vcpi,
                allocated_pbn,
            } => {
                body.put_u8(Opcode::AllocatePayload as u8);
                body.put_u8(port << 4);
                body.put_u8(*vcpi);
                body.put_u16(*allocated_pbn);
            }
            DownReply::ClearPayloadIdTable => {
                body.put_u8(Opcode::ClearPayloadIdTable as u8);
            }
            DownReply::Nak { reason, data } => {
                // NAK echoes the opcode with the top bit set; callers
                // encode against AllocatePayload as the common case.
                body.put_u8(0x80 | Opcode::AllocatePayload as u8);
                body.put_slice(&[0u8; 16]);
                body.put_u8(*reason);
                body.put_u8(*data);
            }
        }
        let body_crc = crc8(&body);
        let len = (body.len() + 1) as u8;
        let mut msg = BytesMut::with_capacity(body.len() + 4);
        msg.put_u8(1 << 4);
        msg.put_u8(len & 0x3F);
        let b2 = 0x80 | 0x40 | ((seqno & 0x1) << 4);
        let hdr_nibbles = [msg[0] >> 4, msg[0] & 0xF, msg[1] >> 4, msg[1] & 0xF, b2 >> 4];
        msg.put_u8(b2 | crc4(&hdr_nibbles));
        msg.extend_from_slice(&body);
        msg.put_u8(body_crc);
        msg.to_vec()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_payload_roundtrip() {
        let reply = DownReply::AllocatePayload {
            port: 2,
            vcpi: 5,
            allocated_pbn: 1907,
        };
        let framed = reply.encode(0);
        assert_eq!(DownReply::parse(&framed).unwrap(), reply);
    }

    #[test]
    fn enum_path_roundtrip() {
        let reply = DownReply::EnumPathResources {
            port: 1,
            full_pbn: 2560,
            available_pbn: 1200,
        };
        let framed = reply.encode(1);
        assert_eq!(DownReply::parse(&framed).unwrap(), reply);
    }

    #[test]
    fn link_address_roundtrip() {
        let reply = DownReply::LinkAddress {
            guid: [0x42; 16],
            ports: vec![
                PortInfo {
                    port: 0,
                    input: true,
                    peer_device_type: 1,
                    mst_capable: false,
                    ddps: false,
                },
                PortInfo {
                    port: 1,
                    input: false,
                    peer_device_type: 3,
                    mst_capable: false,
                    ddps: true,
                },
            ],
        };
        let framed = reply.encode(0);
        assert_eq!(DownReply::parse(&framed).unwrap(), reply);
    }

    #[test]
    fn nak_carries_reason() {
        let framed = DownReply::Nak {
            reason: 0x04,
            data: 0x00,
        }
        .encode(0);
        match DownReply::parse(&framed).unwrap() {
            DownReply::Nak { reason, .. } => assert_eq!(reason, 0x04),
            other => panic!("expected nak, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_body_crc_is_rejected() {
        let mut framed = DownReply::ClearPayloadIdTable.encode(0);
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        assert!(matches!(
            DownReply::parse(&framed),
            Err(DpError::CrcMismatch)
        ));
    }

    #[test]
    fn corrupt_header_crc_is_rejected() {
        let mut framed = DownReply::ClearPayloadIdTable.encode(0);
        framed[2] ^= 0x01;
        assert!(matches!(
            DownReply::parse(&framed),
            Err(DpError::CrcMismatch)
        ));
    }

    #[test]
    fn truncated_reply_is_rejected() {
        let framed = DownReply::ClearPayloadIdTable.encode(0);
        assert!(DownReply::parse(&framed[..3]).is_err());
    }

    #[test]
    fn request_encoding_carries_pbn_big_endian() {
        let msg = DownRequest::AllocatePayload {
            port: 1,
            vcpi: 3,
            pbn: 0x0102,
        }
        .encode(0);
        // header(3) + opcode + port + vcpi + pbn(2) + crc
        assert_eq!(msg.len(), 9);
        assert_eq!(msg[3], Opcode::AllocatePayload as u8);
        assert_eq!(msg[4], 1 << 4);
        assert_eq!(msg[5], 3);
        assert_eq!(&msg[6..8], &[0x01, 0x02]);
    }

    #[test]
    fn unknown_opcode_is_surfaced() {
        assert!(matches!(
            Opcode::try_from(0x33),
            Err(DpError::UnknownVariant { .. })
        ));
    }
}
