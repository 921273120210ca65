//! Datagram classification.
//!
//! Sits between the socket and the connection map: bounds-checks the
//! datagram, decodes it, and explodes jumbo DATA packets into
//! single-sequence packets so everything downstream deals in exactly one
//! sequence number per packet.

use tracing::trace;

use crate::config::Config;
use crate::error::{Result, SkeinError};
use crate::packet::{decode_datagram, Header, Packet, PacketFlags, Seq};

/// Decode one datagram into its header and per-sequence packets.
///
/// Malformed input is an error for the caller to log and drop; it is
/// never fatal to the endpoint.
pub fn classify(datagram: &[u8], cfg: &Config) -> Result<(Header, Vec<Packet>)> {
    if datagram.len() > cfg.rx_mtu {
        return Err(SkeinError::MtuExceeded {
            size: datagram.len(),
            mtu: cfg.rx_mtu,
        });
    }

    let (header, packet) = decode_datagram(datagram)?;
    let packets = match packet {
        Packet::Jumbo {
            first_seq,
            flags,
            fragments,
        } => split_jumbo(first_seq, flags, fragments, cfg)?,
        other => vec![other],
    };
    Ok((header, packets))
}

/// Explode a jumbo body into consecutive single-sequence DATA packets.
///
/// Fragment `i` carries sequence `first_seq + i`. The LAST_PACKET and
/// REQUEST_ACK flags describe the aggregate, so they attach to the final
/// fragment only; the JUMBO flag does not survive the split.
pub fn split_jumbo(
    first_seq: Seq,
    flags: PacketFlags,
    fragments: Vec<bytes::Bytes>,
    cfg: &Config,
) -> Result<Vec<Packet>> {
    if fragments.len() > cfg.rx_jumbo_max {
        return Err(SkeinError::JumboTooLarge {
            fragments: fragments.len(),
            limit: cfg.rx_jumbo_max,
        });
    }
    if fragments.is_empty() {
        trace!(first_seq, "empty jumbo dropped");
        return Ok(Vec::new());
    }

    let last_index = fragments.len() - 1;
    let packets = fragments
        .into_iter()
        .enumerate()
        .map(|(i, payload)| {
            let mut frag_flags = PacketFlags::NONE;
            if i == last_index {
                if flags.contains(PacketFlags::LAST_PACKET) {
                    frag_flags = frag_flags.with(PacketFlags::LAST_PACKET);
                }
                if flags.contains(PacketFlags::REQUEST_ACK) {
                    frag_flags = frag_flags.with(PacketFlags::REQUEST_ACK);
                }
            }
            Packet::Data {
                seq: first_seq + i as Seq,
                flags: frag_flags,
                payload,
            }
        })
        .collect();
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encode_datagram;
    use bytes::Bytes;

    const HDR: Header = Header {
        conn_id: 5,
        channel: 1,
        call_number: 2,
    };

    #[test]
    fn plain_packet_passes_through() {
        let cfg = Config::default();
        let wire = encode_datagram(
            &HDR,
            &Packet::Data {
                seq: 3,
                flags: PacketFlags::NONE,
                payload: Bytes::from_static(b"x"),
            },
        );
        let (header, packets) = classify(&wire, &cfg).unwrap();
        assert_eq!(header, HDR);
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn jumbo_explodes_into_consecutive_sequences() {
        let cfg = Config::default();
        let wire = encode_datagram(
            &HDR,
            &Packet::Jumbo {
                first_seq: 10,
                flags: PacketFlags::LAST_PACKET.with(PacketFlags::REQUEST_ACK),
                fragments: vec![
                    Bytes::from_static(b"a"),
                    Bytes::from_static(b"b"),
                    Bytes::from_static(b"c"),
                ],
            },
        );
        let (_, packets) = classify(&wire, &cfg).unwrap();
        assert_eq!(packets.len(), 3);
        for (i, packet) in packets.iter().enumerate() {
            match packet {
                Packet::Data { seq, flags, .. } => {
                    assert_eq!(*seq, 10 + i as Seq);
                    assert!(!flags.contains(PacketFlags::JUMBO));
                    // The aggregate's flags land on the final fragment only.
                    let is_final = i == 2;
                    assert_eq!(flags.contains(PacketFlags::LAST_PACKET), is_final);
                    assert_eq!(flags.contains(PacketFlags::REQUEST_ACK), is_final);
                }
                other => panic!("expected data, got {other:?}"),
            }
        }
    }

    #[test]
    fn oversized_jumbo_rejected() {
        let cfg = Config::default();
        let fragments = vec![Bytes::from_static(b"x"); cfg.rx_jumbo_max + 1];
        let wire = encode_datagram(
            &HDR,
            &Packet::Jumbo {
                first_seq: 1,
                flags: PacketFlags::NONE,
                fragments,
            },
        );
        assert!(matches!(
            classify(&wire, &cfg),
            Err(SkeinError::JumboTooLarge { fragments: 5, limit: 4 })
        ));
    }

    #[test]
    fn oversized_datagram_rejected() {
        let cfg = Config {
            rx_mtu: 64,
            ..Config::default()
        };
        let wire = encode_datagram(
            &HDR,
            &Packet::Data {
                seq: 1,
                flags: PacketFlags::NONE,
                payload: Bytes::from(vec![0u8; 128]),
            },
        );
        assert!(matches!(
            classify(&wire, &cfg),
            Err(SkeinError::MtuExceeded { .. })
        ));
    }

    #[test]
    fn garbage_is_an_error_not_a_panic() {
        let cfg = Config::default();
        assert!(classify(&[0x01, 0x02], &cfg).is_err());
    }
}
