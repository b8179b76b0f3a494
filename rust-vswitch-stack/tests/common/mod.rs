#![allow(dead_code)]

use bytes::Bytes;
use rust_vswitch_common::packet::{EthernetPacket, VxlanHeader, VxlanPacket};
use rust_vswitch_common::types::{MacAddress, Vni};
use rust_vswitch_stack::{next_iface_id, Iface, IfaceId, IfaceRef, NetworkStack};
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

pub const VNI: Vni = 1314;
pub const SYN_MAC: MacAddress = MacAddress([0x04, 0, 0, 0, 0, 0x01]);
pub const HOST_MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x02]);

pub fn syn_ip() -> IpAddr {
    "10.0.0.1".parse().unwrap()
}

pub fn syn_ip6() -> IpAddr {
    "fd00::1".parse().unwrap()
}

pub fn host_ip() -> IpAddr {
    "10.0.0.2".parse().unwrap()
}

pub fn host_ip6() -> IpAddr {
    "fd00::2".parse().unwrap()
}

/// An interface that keeps every frame sent through it.
#[derive(Debug)]
pub struct RecordingIface {
    id: IfaceId,
    vni: Option<Vni>,
    sent: Mutex<Vec<Bytes>>,
}

impl RecordingIface {
    /// An endpoint carrying only `vni`.
    pub fn bound(vni: Vni) -> Arc<Self> {
        Arc::new(Self {
            id: next_iface_id(),
            vni: Some(vni),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// A remote switch carrying every vni.
    pub fn switch() -> Arc<Self> {
        Arc::new(Self {
            id: next_iface_id(),
            vni: None,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Drain and decode the recorded frames.
    pub fn take(&self) -> Vec<VxlanPacket> {
        let frames: Vec<Bytes> = self.sent.lock().unwrap().drain(..).collect();
        frames
            .iter()
            .map(|f| VxlanPacket::decode(f).expect("switch sent an undecodable frame"))
            .collect()
    }

    /// Drain the recorded frames as sent.
    pub fn take_raw(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().drain(..).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn iface(self: &Arc<Self>) -> IfaceRef {
        self.clone()
    }
}

impl Iface for RecordingIface {
    fn id(&self) -> IfaceId {
        self.id
    }

    fn local_side_vni(&self, hint: Vni) -> Vni {
        self.vni.unwrap_or(hint)
    }

    fn send_packet(&self, frame: &[u8]) -> io::Result<()> {
        self.sent.lock().unwrap().push(Bytes::copy_from_slice(frame));
        Ok(())
    }
}

pub fn vxlan_frame(vni: Vni, ether: EthernetPacket) -> Bytes {
    VxlanPacket::new(VxlanHeader::new(vni), ether).to_bytes()
}

/// Table 1314 on 10.0.0.0/24 and fd00::/64 with 10.0.0.1 and fd00::1 on
/// `SYN_MAC`, plus one host interface bound to it.
pub fn setup() -> (NetworkStack, Arc<RecordingIface>) {
    let mut stack = NetworkStack::new();
    stack
        .add_default_table(VNI, "10.0.0.0/24".parse().unwrap(), Some("fd00::/64".parse().unwrap()))
        .unwrap();
    stack.add_synthetic_ip(VNI, syn_ip(), SYN_MAC).unwrap();
    stack.add_synthetic_ip(VNI, syn_ip6(), SYN_MAC).unwrap();
    let host = RecordingIface::bound(VNI);
    stack.add_iface(host.iface()).unwrap();
    (stack, host)
}
