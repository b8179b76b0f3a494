//! Ethernet II framing.

use bytes::{BufMut, Bytes, BytesMut};

use super::arp::ArpPacket;
use super::ensure_len;
use super::ip::IpPacket;
use crate::error::Error;
use crate::types::MacAddress;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;
pub const ETHER_TYPE_IPV6: u16 = 0x86DD;

/// Payload of an Ethernet frame.
#[derive(Debug, Clone, PartialEq)]
pub enum EtherPayload {
    Arp(ArpPacket),
    Ip(IpPacket),
    /// Any ether type the switch only bridges.
    Bytes(Bytes),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EthernetPacket {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ether_type: u16,
    pub packet: EtherPayload,
}

impl EthernetPacket {
    pub const HEADER_LEN: usize = 14;

    /// Wrap an IP packet, deriving the ether type from its version.
    pub fn from_ip(src: MacAddress, dst: MacAddress, ip: IpPacket) -> Self {
        let ether_type = if ip.is_v4() {
            ETHER_TYPE_IPV4
        } else {
            ETHER_TYPE_IPV6
        };
        Self {
            dst,
            src,
            ether_type,
            packet: EtherPayload::Ip(ip),
        }
    }

    pub fn from_arp(src: MacAddress, dst: MacAddress, arp: ArpPacket) -> Self {
        Self {
            dst,
            src,
            ether_type: ETHER_TYPE_ARP,
            packet: EtherPayload::Arp(arp),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure_len(buf, Self::HEADER_LEN, "ethernet header")?;

        let dst = MacAddress::from_slice(&buf[0..6]).ok_or_else(|| Error::Decode("dst mac".into()))?;
        let src = MacAddress::from_slice(&buf[6..12]).ok_or_else(|| Error::Decode("src mac".into()))?;
        let ether_type = u16::from_be_bytes([buf[12], buf[13]]);
        let payload = &buf[Self::HEADER_LEN..];

        let packet = match ether_type {
            ETHER_TYPE_ARP => EtherPayload::Arp(ArpPacket::decode(payload)?),
            ETHER_TYPE_IPV4 | ETHER_TYPE_IPV6 => {
                let ip = IpPacket::decode(payload)?;
                if ip.is_v4() != (ether_type == ETHER_TYPE_IPV4) {
                    return Err(Error::Decode(format!(
                        "ether type {:#06x} does not match the ip version",
                        ether_type
                    )));
                }
                EtherPayload::Ip(ip)
            }
            _ => EtherPayload::Bytes(Bytes::copy_from_slice(payload)),
        };

        Ok(Self {
            dst,
            src,
            ether_type,
            packet,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.dst.0);
        buf.put_slice(&self.src.0);
        buf.put_u16(self.ether_type);
        match &self.packet {
            EtherPayload::Arp(arp) => arp.encode(buf),
            EtherPayload::Ip(ip) => ip.encode(buf),
            EtherPayload::Bytes(b) => buf.put_slice(b),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn arp(&self) -> Option<&ArpPacket> {
        match &self.packet {
            EtherPayload::Arp(arp) => Some(arp),
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<&IpPacket> {
        match &self.packet {
            EtherPayload::Ip(ip) => Some(ip),
            _ => None,
        }
    }

    pub fn ip_mut(&mut self) -> Option<&mut IpPacket> {
        match &mut self.packet {
            EtherPayload::Ip(ip) => Some(ip),
            _ => None,
        }
    }

    /// One-line summary for log output.
    pub fn description(&self) -> String {
        let inner = match &self.packet {
            EtherPayload::Arp(arp) => format!("arp op={}", arp.opcode),
            EtherPayload::Ip(ip) => ip.description(),
            EtherPayload::Bytes(b) => format!("type={:#06x} len={}", self.ether_type, b.len()),
        };
        format!("ether{{{} -> {}, {}}}", self.src, self.dst, inner)
    }
}
