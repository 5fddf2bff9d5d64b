//! Protocol packet builders for tests, constructed with smoltcp wire
//! types where a Repr exists and by hand where that is simpler.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr,
};

pub const SRC_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
pub const DST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x65, 0x43, 0x21];

const SRC_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
const DST_IP: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

const SRC_PORT: u16 = 40000;

/// Ethernet + IPv4 frame around a prebuilt L4 payload.
fn ipv4_frame(protocol: IpProtocol, l4: &[u8]) -> Vec<u8> {
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&SRC_MAC),
        dst_addr: EthernetAddress::from_bytes(&DST_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };
    let ip_repr = Ipv4Repr {
        src_addr: SRC_IP,
        dst_addr: DST_IP,
        next_header: protocol,
        payload_len: l4.len(),
        hop_limit: 64,
    };

    let mut buffer = vec![0u8; eth_repr.buffer_len() + ip_repr.buffer_len() + l4.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);
    let mut ip = Ipv4Packet::new_unchecked(frame.payload_mut());
    ip_repr.emit(&mut ip, &ChecksumCapabilities::default());
    ip.payload_mut().copy_from_slice(l4);
    buffer
}

/// UDP frame to `dst_port` carrying `payload_len` zero bytes.
pub fn build_udp(dst_port: u16, payload_len: usize) -> Vec<u8> {
    let mut l4 = vec![0u8; 8 + payload_len];
    l4[0..2].copy_from_slice(&SRC_PORT.to_be_bytes());
    l4[2..4].copy_from_slice(&dst_port.to_be_bytes());
    let l4_len = l4.len() as u16;
    l4[4..6].copy_from_slice(&l4_len.to_be_bytes());
    // Checksum 0: not computed (valid for UDP over IPv4).
    ipv4_frame(IpProtocol::Udp, &l4)
}

/// TCP frame to `dst_port` with the given control flags and a zeroed
/// payload of `payload_len` bytes (no options).
pub fn build_tcp(dst_port: u16, syn: bool, ack: bool, payload_len: usize) -> Vec<u8> {
    let mut l4 = vec![0u8; 20 + payload_len];
    l4[0..2].copy_from_slice(&SRC_PORT.to_be_bytes());
    l4[2..4].copy_from_slice(&dst_port.to_be_bytes());
    // Data offset 5 words, flag bits in byte 13.
    l4[12] = 5 << 4;
    let mut flags = 0u8;
    if syn {
        flags |= 0x02;
    }
    if ack {
        flags |= 0x10;
    }
    l4[13] = flags;
    l4[14..16].copy_from_slice(&0xffffu16.to_be_bytes());
    ipv4_frame(IpProtocol::Tcp, &l4)
}

/// Broadcast ARP request.
pub fn build_arp_probe() -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress::from_bytes(&SRC_MAC),
        source_protocol_addr: SRC_IP,
        target_hardware_addr: EthernetAddress::from_bytes(&[0; 6]),
        target_protocol_addr: DST_IP,
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&SRC_MAC),
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Arp,
    };

    let mut buffer = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);
    let mut arp = ArpPacket::new_unchecked(frame.payload_mut());
    arp_repr.emit(&mut arp);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{TcpPacket, UdpPacket};

    #[test]
    fn test_udp_frame_parses() {
        let frame = build_udp(53, 32);
        assert_eq!(frame.len(), 14 + 20 + 8 + 32);
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Ipv4);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.next_header(), IpProtocol::Udp);
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.dst_port(), 53);
    }

    #[test]
    fn test_tcp_frame_parses() {
        let frame = build_tcp(443, true, false, 10);
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.next_header(), IpProtocol::Tcp);
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(tcp.dst_port(), 443);
        assert!(tcp.syn());
        assert!(!tcp.ack());
        assert_eq!(tcp.payload().len(), 10);
    }

    #[test]
    fn test_arp_frame_parses() {
        let frame = build_arp_probe();
        let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
        assert_eq!(eth.ethertype(), EthernetProtocol::Arp);
    }
}
