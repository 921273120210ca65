use thiserror::Error;

/// All errors produced by the Skein reliable-delivery engine.
#[derive(Debug, Error)]
pub enum SkeinError {
    #[error("transmit window full: {in_flight} packets awaiting acknowledgment")]
    WindowFull { in_flight: usize },

    #[error("no free channel on any connection")]
    NoChannelFree,

    #[error("packet given up after {attempts} retransmission attempts")]
    RetransmitExhausted { attempts: u32 },

    #[error("channel {index} cannot accept a call while {state}")]
    ChannelStateViolation { index: u8, state: &'static str },

    #[error("call aborted with code {code}")]
    CallAborted { code: u32 },

    #[error("call has already sent its final packet")]
    CallEnded,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("unknown call handle")]
    UnknownCall,

    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("unknown ack reason: {0}")]
    UnknownAckReason(u8),

    #[error("jumbo packet carries {fragments} fragments, limit is {limit}")]
    JumboTooLarge { fragments: usize, limit: usize },

    #[error("datagram of {size} bytes exceeds receive mtu {mtu}")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SkeinError>;
