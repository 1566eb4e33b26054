use nfq::Message;
use smoltcp::wire::{
    Error as WireError, EthernetProtocol as EtherType, IpProtocol, Ipv4Packet, Ipv6Packet,
    TcpPacket,
};
use thiserror::Error;

/// Pull the TCP destination port out of a queued packet
///
/// Interception rules match `-p tcp`, so anything else reaching a queue is
/// a classification failure the caller accepts unconditionally.
pub fn destination_port(msg: &Message) -> Result<u16, ClassifyError> {
    tcp_destination_port(msg.get_hw_protocol().into(), msg.get_payload())
}

fn tcp_destination_port(ethertype: EtherType, payload: &[u8]) -> Result<u16, ClassifyError> {
    let segment = match ethertype {
        EtherType::Ipv4 => {
            let packet = Ipv4Packet::new_checked(payload)?;
            if packet.next_header() != IpProtocol::Tcp {
                return Err(ClassifyError::NotTcp(packet.next_header()));
            }
            TcpPacket::new_checked(packet.payload())?
        }
        EtherType::Ipv6 => {
            let packet = Ipv6Packet::new_checked(payload)?;
            if packet.next_header() != IpProtocol::Tcp {
                return Err(ClassifyError::NotTcp(packet.next_header()));
            }
            TcpPacket::new_checked(packet.payload())?
        }
        other => return Err(ClassifyError::NotIp(other)),
    };
    Ok(segment.dst_port())
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("packet is not ip ({0})")]
    NotIp(EtherType),
    #[error("packet is not tcp ({0})")]
    NotTcp(IpProtocol),
    #[error("malformed packet: {0}")]
    Malformed(#[from] WireError),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal IPv4 header plus a bare 20-byte transport header
    fn ipv4_with(proto: u8, dst_port: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 40];
        bytes[0] = 0x45; // version 4, ihl 5
        bytes[2..4].copy_from_slice(&40u16.to_be_bytes());
        bytes[8] = 64; // ttl
        bytes[9] = proto;
        bytes[12..16].copy_from_slice(&[10, 0, 0, 9]);
        bytes[16..20].copy_from_slice(&[10, 0, 0, 5]);
        bytes[20..22].copy_from_slice(&45000u16.to_be_bytes());
        bytes[22..24].copy_from_slice(&dst_port.to_be_bytes());
        bytes[32] = 0x50; // tcp data offset 5
        bytes
    }

    #[test]
    fn extracts_tcp_destination_port() {
        let packet = ipv4_with(6, 80);
        assert_eq!(tcp_destination_port(EtherType::Ipv4, &packet).unwrap(), 80);
    }

    #[test]
    fn rejects_udp() {
        let packet = ipv4_with(17, 53);
        assert!(matches!(
            tcp_destination_port(EtherType::Ipv4, &packet),
            Err(ClassifyError::NotTcp(_))
        ));
    }

    #[test]
    fn rejects_non_ip_ethertype() {
        assert!(matches!(
            tcp_destination_port(EtherType::Arp, &[]),
            Err(ClassifyError::NotIp(_))
        ));
    }

    #[test]
    fn rejects_truncated_packet() {
        let packet = ipv4_with(6, 80);
        assert!(matches!(
            tcp_destination_port(EtherType::Ipv4, &packet[..12]),
            Err(ClassifyError::Malformed(_))
        ));
    }
}
