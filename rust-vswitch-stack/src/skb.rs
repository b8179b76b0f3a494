//! Per-packet processing context threaded through L2, L3 and L4.

use bytes::{Bytes, BytesMut};
use rust_vswitch_common::packet::{EthernetPacket, VxlanHeader, VxlanPacket};
use rust_vswitch_common::types::Vni;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::conntrack::SocketPair;
use crate::context::IfaceRef;

static NEXT_HANDLING_ID: AtomicU64 = AtomicU64::new(1);

/// A fresh id used to correlate the log lines of one packet's processing.
pub fn new_handling_id() -> String {
    format!("{:08x}", NEXT_HANDLING_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Clone)]
pub struct SocketBuffer {
    pub handling_id: String,
    /// Table the packet currently belongs to.
    pub vni: Vni,
    /// Header of the frame as received, reused when it is relayed.
    pub vxlan: Option<VxlanHeader>,
    pub pkt: EthernetPacket,
    /// Ethernet bytes as received. Relayed verbatim while `pkt` is untouched;
    /// anything that rewrites the frame must clear it.
    pub raw: Option<Bytes>,
    /// Inbound interface; `None` for locally generated packets.
    pub devin: Option<IfaceRef>,
    /// Synthetic IPs owning the destination mac.
    pub matched_ips: Vec<IpAddr>,
    pub tcp: Option<SocketPair>,
    pub need_tcp_reset: bool,
}

impl SocketBuffer {
    pub fn from_vxlan(vxlan: VxlanPacket, raw: Bytes, devin: IfaceRef) -> Self {
        Self {
            handling_id: new_handling_id(),
            vni: vxlan.header.vni,
            vxlan: Some(vxlan.header),
            pkt: vxlan.packet,
            raw: Some(raw),
            devin: Some(devin),
            matched_ips: Vec::new(),
            tcp: None,
            need_tcp_reset: false,
        }
    }

    pub fn from_ether(vni: Vni, pkt: EthernetPacket, devin: Option<IfaceRef>) -> Self {
        Self {
            handling_id: new_handling_id(),
            vni,
            vxlan: None,
            pkt,
            raw: None,
            devin,
            matched_ips: Vec::new(),
            tcp: None,
            need_tcp_reset: false,
        }
    }

    /// Move the packet into another table. It no longer has an inbound
    /// interface there.
    pub fn set_table(&mut self, vni: Vni) {
        self.vni = vni;
        self.raw = None;
        self.devin = None;
        self.matched_ips.clear();
        self.tcp = None;
        self.need_tcp_reset = false;
    }

    /// Replace the frame with a locally built one, e.g. a reply.
    pub fn replace_packet(&mut self, pkt: EthernetPacket) {
        self.pkt = pkt;
        self.raw = None;
        self.vxlan = None;
        self.devin = None;
        self.matched_ips.clear();
        self.tcp = None;
        self.need_tcp_reset = false;
    }

    fn egress_header(&self) -> VxlanHeader {
        let mut header = self.vxlan.unwrap_or_else(|| VxlanHeader::new(self.vni));
        header.vni = self.vni;
        header
    }

    /// The frame encapsulated for egress, keeping the received header fields.
    pub fn to_vxlan(&self) -> VxlanPacket {
        VxlanPacket::new(self.egress_header(), self.pkt.clone())
    }

    /// Wire bytes for egress. A frame that was only switched keeps its
    /// received bytes, checksums and padding included.
    pub fn to_vxlan_bytes(&self) -> Bytes {
        match &self.raw {
            Some(raw) => {
                let mut buf = BytesMut::with_capacity(VxlanHeader::LEN + raw.len());
                self.egress_header().encode(&mut buf);
                buf.extend_from_slice(raw);
                buf.freeze()
            }
            None => self.to_vxlan().to_bytes(),
        }
    }
}

impl fmt::Debug for SocketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SocketBuffer{{id={}, vni={}, devin={:?}, matched={:?}, pkt={}}}",
            self.handling_id,
            self.vni,
            self.devin.as_ref().map(|i| i.id()),
            self.matched_ips,
            self.pkt.description()
        )
    }
}
