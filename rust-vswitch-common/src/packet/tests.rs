//! Codec tests against hand-assembled wire bytes.

use super::*;
use crate::packet::arp::{ARP_OPCODE_REPLY, ARP_OPCODE_REQUEST};
use crate::packet::ethernet::{ETHER_TYPE_ARP, ETHER_TYPE_IPV4};
use crate::packet::icmp::{ICMPV6_OPTION_SOURCE_LINK_LAYER_ADDRESS, ICMP_ECHO_REQUEST};
use crate::packet::ip::{IP_PROTOCOL_ICMPV6, IP_PROTOCOL_TCP, IP_PROTOCOL_UDP};
use crate::packet::tcp::{TCP_FLAGS_ACK, TCP_FLAGS_SYN};
use crate::packet::vxlan::{FLAG_I_DETECTED_A_POSSIBLE_LOOP, FLAG_I_WILL_DISCONNECT_FROM_YOU_IF_I_RECEIVE_AGAIN};
use crate::types::MacAddress;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

fn mac(last: u8) -> MacAddress {
    MacAddress([0x02, 0, 0, 0, 0, last])
}

#[test]
fn test_ipv4_header_checksum_matches_known_value() {
    let ip = IpPacket {
        src: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)),
        dst: IpAddr::V4(Ipv4Addr::new(192, 168, 0, 199)),
        protocol: IP_PROTOCOL_UDP,
        hop_limit: 0x40,
        traffic_class: 0,
        identification: 0,
        flags_fragment: 0x4000,
        flow_label: 0,
        options: Bytes::new(),
        packet: IpPayload::Bytes(Bytes::from(vec![0u8; 95])),
    };
    let wire = ip.to_bytes();
    assert_eq!(&wire[0..4], &[0x45, 0x00, 0x00, 0x73]);
    assert_eq!(&wire[10..12], &[0xb8, 0x61]);

    let parsed = IpPacket::decode(&wire).unwrap();
    assert_eq!(parsed, ip);
}

#[test]
fn test_ipv4_trailing_padding_is_ignored() {
    let ip = IpPacket::new(
        "10.0.0.1".parse().unwrap(),
        "10.0.0.2".parse().unwrap(),
        IP_PROTOCOL_UDP,
        IpPayload::Bytes(Bytes::from_static(b"abc")),
    );
    let mut wire = BytesMut::from(&ip.to_bytes()[..]);
    wire.put_bytes(0, 20);
    let parsed = IpPacket::decode(&wire).unwrap();
    assert_eq!(parsed.packet, IpPayload::Bytes(Bytes::from_static(b"abc")));
}

#[test]
fn test_ipv4_fragment_is_opaque() {
    let mut ip = IpPacket::new(
        "10.0.0.1".parse().unwrap(),
        "10.0.0.2".parse().unwrap(),
        IP_PROTOCOL_TCP,
        IpPayload::Bytes(Bytes::from_static(&[1, 2, 3])),
    );
    ip.flags_fragment = 0x2000;
    let parsed = IpPacket::decode(&ip.to_bytes()).unwrap();
    assert!(matches!(parsed.packet, IpPayload::Bytes(_)));
}

#[test]
fn test_arp_request_in_ethernet() {
    let arp = ArpPacket::new(
        ARP_OPCODE_REQUEST,
        mac(1),
        Ipv4Addr::new(10, 0, 0, 1),
        MacAddress::ZERO,
        Ipv4Addr::new(10, 0, 0, 254),
    );
    let frame = EthernetPacket::from_arp(mac(1), MacAddress::BROADCAST, arp);
    let wire = frame.to_bytes();
    assert_eq!(wire.len(), 14 + 28);
    assert_eq!(&wire[12..14], &ETHER_TYPE_ARP.to_be_bytes());

    let parsed = EthernetPacket::decode(&wire).unwrap();
    let arp = parsed.arp().unwrap();
    assert!(arp.is_ether_ip());
    assert_eq!(arp.opcode, ARP_OPCODE_REQUEST);
    assert_eq!(arp.sender_mac_address(), Some(mac(1)));
    assert_eq!(arp.target_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 254)));
    assert_ne!(arp.opcode, ARP_OPCODE_REPLY);
}

#[test]
fn test_arp_with_odd_address_lengths_keeps_them() {
    let mut buf = BytesMut::new();
    buf.put_u16(1);
    buf.put_u16(0x0800);
    buf.put_u8(6);
    buf.put_u8(16);
    buf.put_u16(1);
    buf.put_bytes(0xaa, 6 + 16 + 6 + 16);
    let arp = ArpPacket::decode(&buf).unwrap();
    assert_eq!(arp.sender_ip.len(), 16);
    assert_eq!(arp.sender_ipv4(), None);
}

#[test]
fn test_truncated_frames_fail() {
    assert!(EthernetPacket::decode(&[0u8; 10]).is_err());
    let mut buf = BytesMut::new();
    buf.put_slice(&[0xff; 6]);
    buf.put_slice(&[0x02; 6]);
    buf.put_u16(ETHER_TYPE_IPV4);
    buf.put_slice(&[0x45, 0, 0, 40]);
    assert!(EthernetPacket::decode(&buf).is_err());
}

#[test]
fn test_ether_type_must_match_ip_version() {
    let ip = IpPacket::new(
        "fd00::1".parse().unwrap(),
        "fd00::2".parse().unwrap(),
        IP_PROTOCOL_UDP,
        IpPayload::Bytes(Bytes::new()),
    );
    let mut frame = EthernetPacket::from_ip(mac(1), mac(2), ip);
    frame.ether_type = ETHER_TYPE_IPV4;
    assert!(EthernetPacket::decode(&frame.to_bytes()).is_err());
}

#[test]
fn test_tcp_syn_with_options() {
    let src: IpAddr = "10.0.0.1".parse().unwrap();
    let dst: IpAddr = "10.0.0.2".parse().unwrap();
    let mut syn = TcpPacket::new(40000, 80, 1000, 0, TCP_FLAGS_SYN, 64240);
    syn.options.push(TcpOption::mss(1460));
    syn.options.push(TcpOption::window_scale(7));

    let wire = syn.to_bytes(src, dst);
    // 20 header + 4 mss + 3 wscale padded to 4
    assert_eq!(wire.len(), 28);
    assert_eq!(
        checksum::transport_checksum(src, dst, IP_PROTOCOL_TCP, &wire),
        0
    );

    let parsed = TcpPacket::decode(&wire).unwrap();
    assert!(parsed.is_syn());
    assert!(!parsed.is_ack());
    assert_eq!(parsed.mss(), Some(1460));
    assert_eq!(parsed.window_scale(), Some(7));
    assert_eq!(parsed.seq_num, 1000);
}

#[test]
fn test_tcp_with_data_through_ipv6() {
    let src: IpAddr = "fd00::1".parse().unwrap();
    let dst: IpAddr = "fd00::2".parse().unwrap();
    let mut seg = TcpPacket::new(1, 2, 3, 4, TCP_FLAGS_ACK, 5);
    seg.data = Bytes::from_static(b"hello");
    let ip = IpPacket::tcp(src, dst, seg.clone());
    let parsed = IpPacket::decode(&ip.to_bytes()).unwrap();
    assert_eq!(parsed.tcp_packet(), Some(&seg));
    assert_eq!(parsed.header_len(), 40);
}

#[test]
fn test_tcp_bad_option_length() {
    let mut buf = BytesMut::new();
    buf.put_slice(&[0u8; 12]);
    buf.put_u8(6 << 4);
    buf.put_bytes(0, 7);
    buf.put_slice(&[2, 0, 0, 0]);
    assert!(TcpPacket::decode(&buf).is_err());
}

#[test]
fn test_ip_with_malformed_tcp_keeps_payload_opaque() {
    // data offset 4 words is shorter than the fixed header
    let mut seg = BytesMut::new();
    seg.put_slice(&[0u8; 12]);
    seg.put_u8(4 << 4);
    seg.put_bytes(0, 7);
    let ip = IpPacket::new(
        "10.0.0.1".parse().unwrap(),
        "10.0.0.2".parse().unwrap(),
        IP_PROTOCOL_TCP,
        IpPayload::Bytes(seg.clone().freeze()),
    );
    let frame = EthernetPacket::from_ip(mac(1), mac(2), ip);
    let wire = frame.to_bytes();

    let parsed = EthernetPacket::decode(&wire).unwrap();
    let ip = parsed.ip().unwrap();
    assert_eq!(ip.protocol, IP_PROTOCOL_TCP);
    assert!(ip.tcp_packet().is_none());
    assert_eq!(ip.packet, IpPayload::Bytes(seg.freeze()));
    assert_eq!(parsed.to_bytes(), wire);
}

#[test]
fn test_icmp_echo_checksum() {
    let icmp = IcmpPacket::new(false, ICMP_ECHO_REQUEST, 0, Bytes::from_static(&[0, 1, 0, 2, b'p', b'i', b'n', b'g']));
    let ip = IpPacket::icmp("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), icmp.clone());
    let wire = ip.to_bytes();
    assert_eq!(checksum::checksum(&wire[20..]), 0);
    let parsed = IpPacket::decode(&wire).unwrap();
    assert_eq!(parsed.icmp_packet(), Some(&icmp));
    assert!(parsed.icmp_packet().unwrap().is_echo_request());
}

#[test]
fn test_neighbor_solicitation_layout() {
    let target: Ipv6Addr = "fd00::fe".parse().unwrap();
    let ns = IcmpPacket::neighbor_solicitation(target, mac(9));
    assert!(ns.is_neighbor_solicitation());
    assert_eq!(ns.ndp_target(), Some(target));
    assert_eq!(
        ns.ndp_link_layer_option(),
        Some((ICMPV6_OPTION_SOURCE_LINK_LAYER_ADDRESS, mac(9)))
    );

    let src: IpAddr = "fd00::1".parse().unwrap();
    let dst = IpAddr::V6(icmp::solicited_node_multicast(target));
    assert_eq!(dst, "ff02::1:ff00:fe".parse::<IpAddr>().unwrap());
    let wire = ns.to_bytes(src, dst);
    assert_eq!(
        checksum::transport_checksum(src, dst, IP_PROTOCOL_ICMPV6, &wire),
        0
    );
}

#[test]
fn test_ndp_option_length_must_be_one_unit() {
    let mut na = IcmpPacket::neighbor_advertisement("fd00::2".parse().unwrap(), mac(2));
    let mut other = BytesMut::from(&na.other[..]);
    other[21] = 2;
    na.other = other.freeze();
    assert_eq!(na.ndp_link_layer_option(), None);
    assert!(na.ndp_target().is_some());
}

#[test]
fn test_vxlan_reserved_fields() {
    let mut header = VxlanHeader::new(0x123456);
    header.set_flags(FLAG_I_DETECTED_A_POSSIBLE_LOOP);
    header.reserved2 = 251;
    let frame = EthernetPacket {
        dst: MacAddress::BROADCAST,
        src: mac(1),
        ether_type: 0x88b5,
        packet: EtherPayload::Bytes(Bytes::from_static(b"x")),
    };
    let pkt = VxlanPacket::new(header, frame);
    let wire = pkt.to_bytes();
    assert_eq!(&wire[0..8], &[0x08, 0, 0, 0x02, 0x12, 0x34, 0x56, 251]);

    let parsed = VxlanPacket::decode(&wire).unwrap();
    assert_eq!(parsed.vni(), 0x123456);
    assert!(parsed.header.has_flags(FLAG_I_DETECTED_A_POSSIBLE_LOOP));
    assert!(!parsed
        .header
        .has_flags(FLAG_I_DETECTED_A_POSSIBLE_LOOP | FLAG_I_WILL_DISCONNECT_FROM_YOU_IF_I_RECEIVE_AGAIN));
}
