//! ARP over Ethernet.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use super::ensure_len;
use crate::error::Error;
use crate::types::MacAddress;

pub const ARP_HARDWARE_TYPE_ETHER: u16 = 1;
pub const ARP_PROTOCOL_TYPE_IP: u16 = 0x0800;
pub const ARP_OPCODE_REQUEST: u16 = 1;
pub const ARP_OPCODE_REPLY: u16 = 2;

/// An ARP packet. Address fields keep their wire length so callers can
/// reject anything that is not a 6-byte mac / 4-byte ip pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ArpPacket {
    pub hardware_type: u16,
    pub protocol_type: u16,
    pub opcode: u16,
    pub sender_mac: Bytes,
    pub sender_ip: Bytes,
    pub target_mac: Bytes,
    pub target_ip: Bytes,
}

impl ArpPacket {
    const FIXED_LEN: usize = 8;

    /// An Ethernet/IPv4 ARP packet.
    pub fn new(
        opcode: u16,
        sender_mac: MacAddress,
        sender_ip: Ipv4Addr,
        target_mac: MacAddress,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            hardware_type: ARP_HARDWARE_TYPE_ETHER,
            protocol_type: ARP_PROTOCOL_TYPE_IP,
            opcode,
            sender_mac: Bytes::copy_from_slice(&sender_mac.0),
            sender_ip: Bytes::copy_from_slice(&sender_ip.octets()),
            target_mac: Bytes::copy_from_slice(&target_mac.0),
            target_ip: Bytes::copy_from_slice(&target_ip.octets()),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure_len(buf, Self::FIXED_LEN, "arp header")?;
        let hardware_type = u16::from_be_bytes([buf[0], buf[1]]);
        let protocol_type = u16::from_be_bytes([buf[2], buf[3]]);
        let hlen = buf[4] as usize;
        let plen = buf[5] as usize;
        let opcode = u16::from_be_bytes([buf[6], buf[7]]);
        ensure_len(buf, Self::FIXED_LEN + 2 * (hlen + plen), "arp addresses")?;

        let mut off = Self::FIXED_LEN;
        let mut take = |n: usize| {
            let b = Bytes::copy_from_slice(&buf[off..off + n]);
            off += n;
            b
        };
        let sender_mac = take(hlen);
        let sender_ip = take(plen);
        let target_mac = take(hlen);
        let target_ip = take(plen);

        Ok(Self {
            hardware_type,
            protocol_type,
            opcode,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.hardware_type);
        buf.put_u16(self.protocol_type);
        buf.put_u8(self.sender_mac.len() as u8);
        buf.put_u8(self.sender_ip.len() as u8);
        buf.put_u16(self.opcode);
        buf.put_slice(&self.sender_mac);
        buf.put_slice(&self.sender_ip);
        buf.put_slice(&self.target_mac);
        buf.put_slice(&self.target_ip);
    }

    /// Ethernet hardware carrying IPv4.
    pub fn is_ether_ip(&self) -> bool {
        self.hardware_type == ARP_HARDWARE_TYPE_ETHER && self.protocol_type == ARP_PROTOCOL_TYPE_IP
    }

    pub fn sender_ipv4(&self) -> Option<Ipv4Addr> {
        to_ipv4(&self.sender_ip)
    }

    pub fn target_ipv4(&self) -> Option<Ipv4Addr> {
        to_ipv4(&self.target_ip)
    }

    pub fn sender_mac_address(&self) -> Option<MacAddress> {
        MacAddress::from_slice(&self.sender_mac)
    }
}

fn to_ipv4(b: &[u8]) -> Option<Ipv4Addr> {
    let arr: [u8; 4] = b.try_into().ok()?;
    Some(Ipv4Addr::from(arr))
}
