//! Wire packet model: types, flags, ACK reasons and the big-endian codec.
//!
//! One datagram carries one header plus one packet body. Jumbo DATA
//! packets glue several consecutively-sequenced fragments into a single
//! body; the classifier explodes them before the sequencer ever sees one.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SkeinError};

/// Per-call packet sequence number. DATA numbering starts at 1.
pub type Seq = u32;

/// Abort code used when a packet exhausts its retransmission budget.
pub const ABORT_TIMEOUT: u32 = 6;
/// Abort code used when a connection is torn down under live calls.
pub const ABORT_CONN_DEAD: u32 = 7;

/// Wire packet type identifiers.
///
/// Values 9-12, 14 and 15 are reserved and rejected on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 1,
    Ack = 2,
    Busy = 3,
    Abort = 4,
    AckAll = 5,
    Challenge = 6,
    Response = 7,
    Debug = 8,
    Version = 13,
}

impl TryFrom<u8> for PacketType {
    type Error = SkeinError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketType::Data),
            2 => Ok(PacketType::Ack),
            3 => Ok(PacketType::Busy),
            4 => Ok(PacketType::Abort),
            5 => Ok(PacketType::AckAll),
            6 => Ok(PacketType::Challenge),
            7 => Ok(PacketType::Response),
            8 => Ok(PacketType::Debug),
            13 => Ok(PacketType::Version),
            other => Err(SkeinError::UnknownPacketType(other)),
        }
    }
}

/// Flags carried in DATA packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    pub const NONE: Self = Self(0x00);
    /// This packet closes its side of the call.
    pub const LAST_PACKET: Self = Self(0x01);
    /// The sender wants an acknowledgment promptly.
    pub const REQUEST_ACK: Self = Self(0x02);
    /// The body holds multiple glued fragments.
    pub const JUMBO: Self = Self(0x04);

    pub fn contains(self, flag: PacketFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    pub fn with(self, flag: PacketFlags) -> Self {
        Self(self.0 | flag.0)
    }
}

/// Reasons an ACK may be emitted, in priority order (low to high).
///
/// The numeric value doubles as the wire code and the priority; 0 on the
/// wire means "no reason" and never appears in a generated ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckReason {
    /// New in-order data arrived and sat unconsumed past the soft delay.
    Delay = 1,
    /// A DATA packet with REQUEST_ACK set was received.
    Requested = 2,
    /// Previously buffered data was consumed with nothing new arriving.
    Idle = 3,
    /// A packet we already hold was received again.
    Duplicate = 4,
    /// A packet arrived ahead of a hole in the sequence.
    OutOfSequence = 5,
    /// A packet fell beyond the advertised receive window.
    ExceedsWindow = 6,
    /// Receive buffer memory ran out.
    NoSpace = 7,
    /// Answer to a keep-alive probe.
    PingResponse = 8,
    /// Keep-alive probe.
    Ping = 9,
}

impl AckReason {
    /// Priority for coalescing: the higher value wins.
    pub fn priority(self) -> u8 {
        self as u8
    }

    /// Reasons that must not sit behind a delay timer.
    pub fn is_immediate(self) -> bool {
        matches!(
            self,
            AckReason::Duplicate
                | AckReason::ExceedsWindow
                | AckReason::NoSpace
                | AckReason::PingResponse
                | AckReason::Ping
        )
    }
}

impl TryFrom<u8> for AckReason {
    type Error = SkeinError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(AckReason::Delay),
            2 => Ok(AckReason::Requested),
            3 => Ok(AckReason::Idle),
            4 => Ok(AckReason::Duplicate),
            5 => Ok(AckReason::OutOfSequence),
            6 => Ok(AckReason::ExceedsWindow),
            7 => Ok(AckReason::NoSpace),
            8 => Ok(AckReason::PingResponse),
            9 => Ok(AckReason::Ping),
            other => Err(SkeinError::UnknownAckReason(other)),
        }
    }
}

/// Routing header present on every datagram: connection, channel slot and
/// the channel's call number. Channel + call number disambiguate a
/// retransmitted trailing packet of a finished call from its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub conn_id: u32,
    pub channel: u8,
    pub call_number: u32,
}

impl Header {
    pub const WIRE_LEN: usize = 9;
}

/// An inclusive range of sequence numbers in a selective ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    pub start: Seq,
    pub end: Seq,
}

/// Decoded packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// DATA: seq(4) + flags(1) + payload_len(4) + payload(N)
    Data {
        seq: Seq,
        flags: PacketFlags,
        payload: Bytes,
    },
    /// DATA with the JUMBO flag: seq(4) + flags(1) + count(1) +
    /// (frag_len(2) + frag(N)) per fragment. Fragment i carries sequence
    /// `first_seq + i`.
    Jumbo {
        first_seq: Seq,
        flags: PacketFlags,
        fragments: Vec<Bytes>,
    },
    /// ACK: reason(1) + ack_seq(4) + ping_id(8) + range_count(1) + ranges(8*N)
    Ack {
        reason: AckReason,
        /// Cumulative acknowledgment: every DATA packet with sequence at or
        /// below this value has been received.
        ack_seq: Seq,
        /// Probe correlation for PING / PING_RESPONSE reasons, else 0.
        ping_id: u64,
        /// Out-of-order ranges received beyond `ack_seq`.
        ranges: Vec<SeqRange>,
    },
    /// BUSY: no body.
    Busy,
    /// ABORT: code(4)
    Abort { code: u32 },
    /// ACKALL: no body.
    AckAll,
    /// CHALLENGE: nonce(8)
    Challenge { nonce: u64 },
    /// RESPONSE: nonce(8)
    Response { nonce: u64 },
    /// DEBUG: payload_len(4) + payload(N)
    Debug { payload: Bytes },
    /// VERSION: version(4)
    Version { version: u32 },
}

impl Packet {
    /// Return the wire type tag for this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Data { .. } | Packet::Jumbo { .. } => PacketType::Data,
            Packet::Ack { .. } => PacketType::Ack,
            Packet::Busy => PacketType::Busy,
            Packet::Abort { .. } => PacketType::Abort,
            Packet::AckAll => PacketType::AckAll,
            Packet::Challenge { .. } => PacketType::Challenge,
            Packet::Response { .. } => PacketType::Response,
            Packet::Debug { .. } => PacketType::Debug,
            Packet::Version { .. } => PacketType::Version,
        }
    }

    /// The number of bytes the body occupies after the header and type tag.
    pub fn body_len(&self) -> usize {
        match self {
            Packet::Data { payload, .. } => 4 + 1 + 4 + payload.len(),
            Packet::Jumbo { fragments, .. } => {
                4 + 1 + 1 + fragments.iter().map(|f| 2 + f.len()).sum::<usize>()
            }
            Packet::Ack { ranges, .. } => 1 + 4 + 8 + 1 + ranges.len() * 8,
            Packet::Busy | Packet::AckAll => 0,
            Packet::Abort { .. } => 4,
            Packet::Challenge { .. } | Packet::Response { .. } => 8,
            Packet::Debug { payload } => 4 + payload.len(),
            Packet::Version { .. } => 4,
        }
    }
}

/// Encode a routed packet into one wire datagram.
pub fn encode_datagram(header: &Header, packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(Header::WIRE_LEN + 1 + packet.body_len());
    buf.put_u32(header.conn_id);
    buf.put_u8(header.channel);
    buf.put_u32(header.call_number);
    buf.put_u8(packet.packet_type() as u8);

    match packet {
        Packet::Data {
            seq,
            flags,
            payload,
        } => {
            buf.put_u32(*seq);
            buf.put_u8(flags.0);
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
        }
        Packet::Jumbo {
            first_seq,
            flags,
            fragments,
        } => {
            buf.put_u32(*first_seq);
            buf.put_u8(flags.with(PacketFlags::JUMBO).0);
            buf.put_u8(fragments.len() as u8);
            for frag in fragments {
                buf.put_u16(frag.len() as u16);
                buf.put_slice(frag);
            }
        }
        Packet::Ack {
            reason,
            ack_seq,
            ping_id,
            ranges,
        } => {
            buf.put_u8(*reason as u8);
            buf.put_u32(*ack_seq);
            buf.put_u64(*ping_id);
            buf.put_u8(ranges.len() as u8);
            for r in ranges {
                buf.put_u32(r.start);
                buf.put_u32(r.end);
            }
        }
        Packet::Busy | Packet::AckAll => {}
        Packet::Abort { code } => buf.put_u32(*code),
        Packet::Challenge { nonce } | Packet::Response { nonce } => buf.put_u64(*nonce),
        Packet::Debug { payload } => {
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
        }
        Packet::Version { version } => buf.put_u32(*version),
    }

    buf.freeze()
}

/// Decode one wire datagram into its routing header and packet body.
pub fn decode_datagram(mut data: &[u8]) -> Result<(Header, Packet)> {
    ensure_len(data, Header::WIRE_LEN + 1)?;
    let conn_id = data.get_u32();
    let channel = data.get_u8();
    let call_number = data.get_u32();
    let header = Header {
        conn_id,
        channel,
        call_number,
    };

    let packet_type = PacketType::try_from(data.get_u8())?;
    let packet = match packet_type {
        PacketType::Data => decode_data(data)?,
        PacketType::Ack => {
            ensure_len(data, 14)?;
            let reason = AckReason::try_from(data.get_u8())?;
            let ack_seq = data.get_u32();
            let ping_id = data.get_u64();
            let range_count = data.get_u8() as usize;
            ensure_len(data, range_count * 8)?;
            let mut ranges = Vec::with_capacity(range_count);
            for _ in 0..range_count {
                let start = data.get_u32();
                let end = data.get_u32();
                ranges.push(SeqRange { start, end });
            }
            Packet::Ack {
                reason,
                ack_seq,
                ping_id,
                ranges,
            }
        }
        PacketType::Busy => Packet::Busy,
        PacketType::Abort => {
            ensure_len(data, 4)?;
            Packet::Abort {
                code: data.get_u32(),
            }
        }
        PacketType::AckAll => Packet::AckAll,
        PacketType::Challenge => {
            ensure_len(data, 8)?;
            Packet::Challenge {
                nonce: data.get_u64(),
            }
        }
        PacketType::Response => {
            ensure_len(data, 8)?;
            Packet::Response {
                nonce: data.get_u64(),
            }
        }
        PacketType::Debug => {
            ensure_len(data, 4)?;
            let len = data.get_u32() as usize;
            ensure_len(data, len)?;
            Packet::Debug {
                payload: Bytes::copy_from_slice(&data[..len]),
            }
        }
        PacketType::Version => {
            ensure_len(data, 4)?;
            Packet::Version {
                version: data.get_u32(),
            }
        }
    };

    Ok((header, packet))
}

fn decode_data(mut data: &[u8]) -> Result<Packet> {
    ensure_len(data, 5)?;
    let seq = data.get_u32();
    let flags = PacketFlags(data.get_u8());

    if flags.contains(PacketFlags::JUMBO) {
        ensure_len(data, 1)?;
        let count = data.get_u8() as usize;
        let mut fragments = Vec::with_capacity(count);
        for _ in 0..count {
            ensure_len(data, 2)?;
            let len = data.get_u16() as usize;
            ensure_len(data, len)?;
            fragments.push(Bytes::copy_from_slice(&data[..len]));
            data.advance(len);
        }
        Ok(Packet::Jumbo {
            first_seq: seq,
            flags,
            fragments,
        })
    } else {
        ensure_len(data, 4)?;
        let len = data.get_u32() as usize;
        ensure_len(data, len)?;
        Ok(Packet::Data {
            seq,
            flags,
            payload: Bytes::copy_from_slice(&data[..len]),
        })
    }
}

fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(SkeinError::PacketTooShort {
            expected: needed,
            actual: data.len(),
        })
    } else {
        Ok(())
    }
}
