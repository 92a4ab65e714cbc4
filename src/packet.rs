//! Packet framing for virtual network devices.
//!
//! Reads from a tun device are cut at IPv4 packet boundaries. IPv6 packets
//! are dropped whole and anything unparseable is discarded, so this decoder
//! never fails.
use std::net::Ipv4Addr;

use tracing::trace;

use crate::{
    codec::{Decode, Decoded},
    error::CodecError,
    specification::{IPV4_HDR_MIN_LEN, IPV6_HDR_LEN},
};

/// Cuts IPv4 packets at their total-length field.
#[derive(Debug, Default)]
pub struct Ipv4Framing;

impl Decode for Ipv4Framing {
    fn decode(&mut self, input: &[u8]) -> Result<Decoded, CodecError> {
        match input[0] >> 4 {
            4 => {
                if input.len() < IPV4_HDR_MIN_LEN {
                    return Ok(Decoded::incomplete());
                }
                let total = u16::from_be_bytes([input[2], input[3]]) as usize;
                if total < IPV4_HDR_MIN_LEN {
                    trace!(total, "discarding bad ipv4 header");
                    return Ok(Decoded::skipped(input.len()));
                }
                if input.len() < total {
                    return Ok(Decoded::incomplete());
                }
                Ok(Decoded::unit(input[..total].to_vec(), total))
            }
            6 => {
                if input.len() < IPV6_HDR_LEN {
                    return Ok(Decoded::incomplete());
                }
                let payload = u16::from_be_bytes([input[4], input[5]]) as usize;
                let total = IPV6_HDR_LEN + payload;
                if input.len() < total {
                    return Ok(Decoded::incomplete());
                }
                trace!(total, "dropping ipv6 packet");
                Ok(Decoded::skipped(total))
            }
            version => {
                trace!(version, len = input.len(), "discarding non-ip input");
                Ok(Decoded::skipped(input.len()))
            }
        }
    }

    fn name(&self) -> &'static str {
        "ipv4"
    }
}

/// The source address of an IPv4 packet.
pub fn source(packet: &[u8]) -> Option<Ipv4Addr> {
    address_at(packet, 12)
}

/// The destination address of an IPv4 packet.
pub fn destination(packet: &[u8]) -> Option<Ipv4Addr> {
    address_at(packet, 16)
}

fn address_at(packet: &[u8], offset: usize) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_HDR_MIN_LEN || packet[0] >> 4 != 4 {
        return None;
    }
    let octets: [u8; 4] = packet[offset..offset + 4].try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let total = IPV4_HDR_MIN_LEN + payload.len();
        let mut packet = vec![0u8; IPV4_HDR_MIN_LEN];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        packet[8] = 64;
        packet[9] = 17;
        packet[12..16].copy_from_slice(&src.octets());
        packet[16..20].copy_from_slice(&dst.octets());
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_cuts_at_total_length() {
        let a = ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), b"one");
        let b = ipv4_packet(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1), b"two!");
        let mut input = a.clone();
        input.extend_from_slice(&b);

        let mut framing = Ipv4Framing;
        assert_eq!(framing.decode(&input).unwrap(), Decoded::unit(a.clone(), a.len()));
        assert_eq!(
            framing.decode(&input[a.len()..]).unwrap(),
            Decoded::unit(b.clone(), b.len())
        );
        assert_eq!(framing.decode(&b[..10]).unwrap(), Decoded::incomplete());
    }

    #[test]
    fn test_drops_ipv6_and_junk() {
        let mut v6 = vec![0u8; IPV6_HDR_LEN + 8];
        v6[0] = 0x60;
        v6[5] = 8;
        let mut framing = Ipv4Framing;
        assert_eq!(framing.decode(&v6).unwrap(), Decoded::skipped(v6.len()));
        assert_eq!(framing.decode(&[0x10, 1, 2]).unwrap(), Decoded::skipped(3));
    }

    #[test]
    fn test_addresses() {
        let packet = ipv4_packet(Ipv4Addr::new(10, 8, 0, 2), Ipv4Addr::new(1, 1, 1, 1), b"");
        assert_eq!(source(&packet), Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(destination(&packet), Some(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(source(&packet[..10]), None);
    }
}
