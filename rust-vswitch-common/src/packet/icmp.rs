//! ICMP and ICMPv6 messages, including the neighbor discovery layout.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv6Addr};

use super::checksum;
use super::ensure_len;
use super::ip::IP_PROTOCOL_ICMPV6;
use crate::error::Error;
use crate::types::MacAddress;

/* ---------------------------------------------------------------- *
 * ICMPv4
 * ---------------------------------------------------------------- */

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DESTINATION_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PORT_UNREACHABLE_CODE: u8 = 3;

/* ---------------------------------------------------------------- *
 * ICMPv6
 * ---------------------------------------------------------------- */

pub const ICMPV6_DESTINATION_UNREACHABLE: u8 = 1;
pub const ICMPV6_TIME_EXCEEDED: u8 = 3;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;
pub const ICMPV6_NEIGHBOR_SOLICITATION: u8 = 135;
pub const ICMPV6_NEIGHBOR_ADVERTISEMENT: u8 = 136;
pub const ICMPV6_PORT_UNREACHABLE_CODE: u8 = 4;

pub const ICMPV6_OPTION_SOURCE_LINK_LAYER_ADDRESS: u8 = 1;
pub const ICMPV6_OPTION_TARGET_LINK_LAYER_ADDRESS: u8 = 2;

/// Router / Solicited / Override flags of a neighbor advertisement.
pub const NDP_NA_FLAG_ROUTER: u8 = 0x80;
pub const NDP_NA_FLAG_SOLICITED: u8 = 0x40;
pub const NDP_NA_FLAG_OVERRIDE: u8 = 0x20;

/// Reserved word + target address + one link-layer option.
pub const NDP_WITH_OPTION_LEN: usize = 4 + 16 + 8;

/// An ICMP message. `other` is everything after the checksum.
#[derive(Debug, Clone, PartialEq)]
pub struct IcmpPacket {
    pub is_v6: bool,
    pub icmp_type: u8,
    pub code: u8,
    pub other: Bytes,
}

impl IcmpPacket {
    pub fn new(is_v6: bool, icmp_type: u8, code: u8, other: impl Into<Bytes>) -> Self {
        Self {
            is_v6,
            icmp_type,
            code,
            other: other.into(),
        }
    }

    pub fn decode(buf: &[u8], is_v6: bool) -> Result<Self, Error> {
        ensure_len(buf, 4, "icmp header")?;
        Ok(Self {
            is_v6,
            icmp_type: buf[0],
            code: buf[1],
            other: Bytes::copy_from_slice(&buf[4..]),
        })
    }

    /// Encode with the checksum for the given ip addresses. ICMPv6 covers the pseudo header.
    pub fn to_bytes(&self, src: IpAddr, dst: IpAddr) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.other.len());
        buf.put_u8(self.icmp_type);
        buf.put_u8(self.code);
        buf.put_u16(0);
        buf.put_slice(&self.other);
        let sum = if self.is_v6 {
            checksum::transport_checksum(src, dst, IP_PROTOCOL_ICMPV6, &buf)
        } else {
            checksum::checksum(&buf)
        };
        buf[2..4].copy_from_slice(&sum.to_be_bytes());
        buf.freeze()
    }

    pub fn is_echo_request(&self) -> bool {
        if self.is_v6 {
            self.icmp_type == ICMPV6_ECHO_REQUEST
        } else {
            self.icmp_type == ICMP_ECHO_REQUEST
        }
    }

    pub fn is_neighbor_solicitation(&self) -> bool {
        self.is_v6 && self.icmp_type == ICMPV6_NEIGHBOR_SOLICITATION
    }

    pub fn is_neighbor_advertisement(&self) -> bool {
        self.is_v6 && self.icmp_type == ICMPV6_NEIGHBOR_ADVERTISEMENT
    }

    /// Target address of a neighbor solicitation/advertisement.
    pub fn ndp_target(&self) -> Option<Ipv6Addr> {
        if self.other.len() < 20 {
            return None;
        }
        let mut b = [0u8; 16];
        b.copy_from_slice(&self.other[4..20]);
        Some(Ipv6Addr::from(b))
    }

    /// First link-layer address option: `(option type, mac)`. The option
    /// length must be one 8-byte unit carrying a 6-byte mac.
    pub fn ndp_link_layer_option(&self) -> Option<(u8, MacAddress)> {
        if self.other.len() < NDP_WITH_OPTION_LEN {
            return None;
        }
        let opt_type = self.other[20];
        let opt_len = self.other[21];
        if opt_len != 1 {
            return None;
        }
        let mac = MacAddress::from_slice(&self.other[22..28])?;
        Some((opt_type, mac))
    }

    /// A neighbor solicitation for `target` carrying the source link-layer address.
    pub fn neighbor_solicitation(target: Ipv6Addr, src_mac: MacAddress) -> Self {
        Self::new(
            true,
            ICMPV6_NEIGHBOR_SOLICITATION,
            0,
            ndp_body(0, target, ICMPV6_OPTION_SOURCE_LINK_LAYER_ADDRESS, src_mac),
        )
    }

    /// A solicited neighbor advertisement for `target` owned by `target_mac`.
    pub fn neighbor_advertisement(target: Ipv6Addr, target_mac: MacAddress) -> Self {
        Self::new(
            true,
            ICMPV6_NEIGHBOR_ADVERTISEMENT,
            0,
            ndp_body(
                NDP_NA_FLAG_SOLICITED | NDP_NA_FLAG_OVERRIDE,
                target,
                ICMPV6_OPTION_TARGET_LINK_LAYER_ADDRESS,
                target_mac,
            ),
        )
    }
}

fn ndp_body(flags: u8, target: Ipv6Addr, opt_type: u8, mac: MacAddress) -> Bytes {
    let mut buf = BytesMut::with_capacity(NDP_WITH_OPTION_LEN);
    buf.put_u8(flags);
    buf.put_bytes(0, 3);
    buf.put_slice(&target.octets());
    buf.put_u8(opt_type);
    buf.put_u8(1);
    buf.put_slice(&mac.0);
    buf.freeze()
}

/// Solicited-node multicast address `ff02::1:ffXX:XXXX` of `ip`.
pub fn solicited_node_multicast(ip: Ipv6Addr) -> Ipv6Addr {
    let o = ip.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | o[13] as u16,
        u16::from_be_bytes([o[14], o[15]]),
    )
}
