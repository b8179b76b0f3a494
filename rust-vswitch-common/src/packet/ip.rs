//! IPv4 and IPv6 headers.
//!
//! Both versions decode into the same [`IpPacket`]. Fields that only exist
//! in one version are carried and ignored by the other. Fragments are kept
//! opaque; the switch does not reassemble.

use bytes::{BufMut, Bytes, BytesMut};
use log::trace;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::checksum;
use super::ensure_len;
use super::icmp::IcmpPacket;
use super::tcp::TcpPacket;
use crate::error::Error;

pub const IP_PROTOCOL_ICMP: u8 = 1;
pub const IP_PROTOCOL_TCP: u8 = 6;
pub const IP_PROTOCOL_UDP: u8 = 17;
pub const IP_PROTOCOL_ICMPV6: u8 = 58;
pub const IP_PROTOCOL_SCTP: u8 = 132;

pub const DEFAULT_HOP_LIMIT: u8 = 64;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Payload of an IP packet.
#[derive(Debug, Clone, PartialEq)]
pub enum IpPayload {
    Icmp(IcmpPacket),
    Tcp(TcpPacket),
    Bytes(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpPacket {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Protocol (v4) or next header (v6).
    pub protocol: u8,
    /// TTL (v4) or hop limit (v6).
    pub hop_limit: u8,
    /// TOS (v4) or traffic class (v6).
    pub traffic_class: u8,
    pub identification: u16,
    pub flags_fragment: u16,
    pub flow_label: u32,
    /// IPv4 options, kept verbatim.
    pub options: Bytes,
    pub packet: IpPayload,
}

impl IpPacket {
    /// Build a packet with default header fields. `src` and `dst` must share a version.
    pub fn new(src: IpAddr, dst: IpAddr, protocol: u8, packet: IpPayload) -> Self {
        debug_assert_eq!(src.is_ipv4(), dst.is_ipv4());
        Self {
            src,
            dst,
            protocol,
            hop_limit: DEFAULT_HOP_LIMIT,
            traffic_class: 0,
            identification: 0,
            flags_fragment: 0,
            flow_label: 0,
            options: Bytes::new(),
            packet,
        }
    }

    pub fn icmp(src: IpAddr, dst: IpAddr, icmp: IcmpPacket) -> Self {
        let protocol = if icmp.is_v6 {
            IP_PROTOCOL_ICMPV6
        } else {
            IP_PROTOCOL_ICMP
        };
        Self::new(src, dst, protocol, IpPayload::Icmp(icmp))
    }

    pub fn tcp(src: IpAddr, dst: IpAddr, tcp: TcpPacket) -> Self {
        Self::new(src, dst, IP_PROTOCOL_TCP, IpPayload::Tcp(tcp))
    }

    pub fn is_v4(&self) -> bool {
        self.src.is_ipv4()
    }

    pub fn header_len(&self) -> usize {
        if self.is_v4() {
            IPV4_HEADER_LEN + padded_len(self.options.len())
        } else {
            IPV6_HEADER_LEN
        }
    }

    pub fn icmp_packet(&self) -> Option<&IcmpPacket> {
        match &self.packet {
            IpPayload::Icmp(icmp) => Some(icmp),
            _ => None,
        }
    }

    pub fn tcp_packet(&self) -> Option<&TcpPacket> {
        match &self.packet {
            IpPayload::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure_len(buf, 1, "ip header")?;
        match buf[0] >> 4 {
            4 => Self::decode_v4(buf),
            6 => Self::decode_v6(buf),
            v => Err(Error::Decode(format!("unknown ip version {}", v))),
        }
    }

    fn decode_v4(buf: &[u8]) -> Result<Self, Error> {
        ensure_len(buf, IPV4_HEADER_LEN, "ipv4 header")?;
        let ihl = (buf[0] & 0x0f) as usize * 4;
        if ihl < IPV4_HEADER_LEN {
            return Err(Error::Decode(format!("ipv4 ihl too small: {}", ihl)));
        }
        ensure_len(buf, ihl, "ipv4 header with options")?;
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total_len < ihl || total_len > buf.len() {
            return Err(Error::Decode(format!(
                "ipv4 total length {} out of range (header {}, buffer {})",
                total_len,
                ihl,
                buf.len()
            )));
        }

        let flags_fragment = u16::from_be_bytes([buf[6], buf[7]]);
        let protocol = buf[9];
        let payload = &buf[ihl..total_len];
        // MF set or non-zero offset
        let packet = if flags_fragment & 0x3fff != 0 {
            IpPayload::Bytes(Bytes::copy_from_slice(payload))
        } else {
            decode_payload(protocol, payload)
        };

        Ok(Self {
            src: IpAddr::V4(Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15])),
            dst: IpAddr::V4(Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19])),
            protocol,
            hop_limit: buf[8],
            traffic_class: buf[1],
            identification: u16::from_be_bytes([buf[4], buf[5]]),
            flags_fragment,
            flow_label: 0,
            options: Bytes::copy_from_slice(&buf[IPV4_HEADER_LEN..ihl]),
            packet,
        })
    }

    fn decode_v6(buf: &[u8]) -> Result<Self, Error> {
        ensure_len(buf, IPV6_HEADER_LEN, "ipv6 header")?;
        let head = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        ensure_len(buf, IPV6_HEADER_LEN + payload_len, "ipv6 payload")?;
        let protocol = buf[6];

        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        dst.copy_from_slice(&buf[24..40]);

        let packet = decode_payload(protocol, &buf[IPV6_HEADER_LEN..IPV6_HEADER_LEN + payload_len]);

        Ok(Self {
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol,
            hop_limit: buf[7],
            traffic_class: ((head >> 20) & 0xff) as u8,
            identification: 0,
            flags_fragment: 0,
            flow_label: head & 0x000f_ffff,
            options: Bytes::new(),
            packet,
        })
    }

    /// Encoded transport payload, with checksums computed for the current addresses.
    pub fn payload_bytes(&self) -> Bytes {
        match &self.packet {
            IpPayload::Icmp(icmp) => icmp.to_bytes(self.src, self.dst),
            IpPayload::Tcp(tcp) => tcp.to_bytes(self.src, self.dst),
            IpPayload::Bytes(b) => b.clone(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let payload = self.payload_bytes();
        match (self.src, self.dst) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let opt_len = padded_len(self.options.len());
                let ihl = IPV4_HEADER_LEN + opt_len;
                let mut header = BytesMut::with_capacity(ihl);
                header.put_u8(0x40 | (ihl / 4) as u8);
                header.put_u8(self.traffic_class);
                header.put_u16((ihl + payload.len()) as u16);
                header.put_u16(self.identification);
                header.put_u16(self.flags_fragment);
                header.put_u8(self.hop_limit);
                header.put_u8(self.protocol);
                header.put_u16(0);
                header.put_slice(&src.octets());
                header.put_slice(&dst.octets());
                header.put_slice(&self.options);
                header.put_bytes(0, opt_len - self.options.len());
                let sum = checksum::checksum(&header);
                header[10..12].copy_from_slice(&sum.to_be_bytes());
                buf.put_slice(&header);
            }
            _ => {
                let head = (6u32 << 28) | ((self.traffic_class as u32) << 20) | (self.flow_label & 0x000f_ffff);
                buf.put_u32(head);
                buf.put_u16(payload.len() as u16);
                buf.put_u8(self.protocol);
                buf.put_u8(self.hop_limit);
                buf.put_slice(&checksum::ip_octets(self.src));
                buf.put_slice(&checksum::ip_octets(self.dst));
            }
        }
        buf.put_slice(&payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header_len() + 64);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn description(&self) -> String {
        let inner = match &self.packet {
            IpPayload::Icmp(icmp) => format!("icmp type={} code={}", icmp.icmp_type, icmp.code),
            IpPayload::Tcp(tcp) => tcp.description(),
            IpPayload::Bytes(b) => format!("proto={} len={}", self.protocol, b.len()),
        };
        format!("ip{{{} -> {}, hop={}, {}}}", self.src, self.dst, self.hop_limit, inner)
    }
}

/// A transport header that fails to decode leaves the payload opaque, so
/// the packet can still be switched.
fn decode_payload(protocol: u8, data: &[u8]) -> IpPayload {
    let decoded = match protocol {
        IP_PROTOCOL_ICMP => IcmpPacket::decode(data, false).map(IpPayload::Icmp),
        IP_PROTOCOL_ICMPV6 => IcmpPacket::decode(data, true).map(IpPayload::Icmp),
        IP_PROTOCOL_TCP => TcpPacket::decode(data).map(IpPayload::Tcp),
        _ => return IpPayload::Bytes(Bytes::copy_from_slice(data)),
    };
    decoded.unwrap_or_else(|e| {
        trace!("protocol {} payload kept opaque: {}", protocol, e);
        IpPayload::Bytes(Bytes::copy_from_slice(data))
    })
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}
