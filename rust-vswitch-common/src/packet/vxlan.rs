//! VXLAN encapsulation (RFC 7348) with the switch's loop-detection fields.
//!
//! `reserved1` carries flag bits exchanged between switches and `reserved2`
//! counts relays. Both survive forwarding untouched except where loop
//! detection updates them.

use bytes::{BufMut, Bytes, BytesMut};

use super::ensure_len;
use super::ethernet::EthernetPacket;
use crate::error::Error;
use crate::types::Vni;

/// The I flag: the VNI field is valid.
pub const VXLAN_FLAG_VNI_VALID: u8 = 0x08;

pub const FLAG_I_AM_FROM_SWITCH: u32 = 0x01;
pub const FLAG_I_DETECTED_A_POSSIBLE_LOOP: u32 = 0x02;
pub const FLAG_I_WILL_DISCONNECT_FROM_YOU_IF_I_RECEIVE_AGAIN: u32 = 0x04;

/// Relay count above which loop detection engages.
pub const LOOP_DETECT_HOP_THRESHOLD: u8 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VxlanHeader {
    pub flags: u8,
    /// 24 bits
    pub reserved1: u32,
    /// 24 bits
    pub vni: Vni,
    pub reserved2: u8,
}

impl VxlanHeader {
    pub const LEN: usize = 8;

    pub fn new(vni: Vni) -> Self {
        Self {
            flags: VXLAN_FLAG_VNI_VALID,
            reserved1: 0,
            vni,
            reserved2: 0,
        }
    }

    pub fn has_flags(&self, flags: u32) -> bool {
        self.reserved1 & flags == flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.reserved1 = (self.reserved1 | flags) & 0x00ff_ffff;
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        ensure_len(buf, Self::LEN, "vxlan header")?;
        Ok(Self {
            flags: buf[0],
            reserved1: u32::from_be_bytes([0, buf[1], buf[2], buf[3]]),
            vni: u32::from_be_bytes([0, buf[4], buf[5], buf[6]]),
            reserved2: buf[7],
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flags);
        buf.put_slice(&self.reserved1.to_be_bytes()[1..]);
        buf.put_slice(&self.vni.to_be_bytes()[1..]);
        buf.put_u8(self.reserved2);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VxlanPacket {
    pub header: VxlanHeader,
    pub packet: EthernetPacket,
}

impl VxlanPacket {
    pub fn new(header: VxlanHeader, packet: EthernetPacket) -> Self {
        Self { header, packet }
    }

    pub fn vni(&self) -> Vni {
        self.header.vni
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let header = VxlanHeader::decode(buf)?;
        let packet = EthernetPacket::decode(&buf[VxlanHeader::LEN..])?;
        Ok(Self { header, packet })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        self.packet.encode(buf);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(VxlanHeader::LEN + 128);
        self.encode(&mut buf);
        buf.freeze()
    }
}
