//! VXLAN peers reached over the daemon's UDP socket.

use rust_vswitch_common::packet::vxlan::FLAG_I_AM_FROM_SWITCH;
use rust_vswitch_common::types::Vni;
use rust_vswitch_stack::{next_iface_id, Iface, IfaceId};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Byte of the VXLAN header holding the low bits of `reserved1`.
const FLAGS_BYTE: usize = 3;

/// How a peer is bound to tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// An endpoint of one VNI.
    Bare(Vni),
    /// Another switch, carrying every VNI.
    Switch,
}

impl PeerKind {
    fn local_side_vni(self, hint: Vni) -> Vni {
        match self {
            PeerKind::Bare(vni) => vni,
            PeerKind::Switch => hint,
        }
    }
}

/// Copy of `frame` with `I_AM_FROM_SWITCH` set.
fn mark_from_switch(frame: &[u8]) -> Vec<u8> {
    let mut marked = frame.to_vec();
    if let Some(b) = marked.get_mut(FLAGS_BYTE) {
        *b |= FLAG_I_AM_FROM_SWITCH as u8;
    }
    marked
}

pub struct UdpIface {
    id: IfaceId,
    remote: SocketAddr,
    kind: PeerKind,
    socket: Arc<UdpSocket>,
}

impl UdpIface {
    pub fn new(remote: SocketAddr, kind: PeerKind, socket: Arc<UdpSocket>) -> Self {
        Self {
            id: next_iface_id(),
            remote,
            kind,
            socket,
        }
    }
}

impl fmt::Debug for UdpIface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PeerKind::Bare(vni) => write!(f, "Iface(udp:{},vni:{})", self.remote, vni),
            PeerKind::Switch => write!(f, "Iface(remote-switch:{})", self.remote),
        }
    }
}

impl Iface for UdpIface {
    fn id(&self) -> IfaceId {
        self.id
    }

    fn local_side_vni(&self, hint: Vni) -> Vni {
        self.kind.local_side_vni(hint)
    }

    fn send_packet(&self, frame: &[u8]) -> io::Result<()> {
        let n = match self.kind {
            PeerKind::Switch => self.socket.try_send_to(&mark_from_switch(frame), self.remote)?,
            PeerKind::Bare(_) => self.socket.try_send_to(frame, self.remote)?,
        };
        if n != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes to {}", n, frame.len(), self.remote),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rust_vswitch_common::packet::VxlanHeader;

    #[test]
    fn test_switch_mark_survives_decode() {
        let mut header = VxlanHeader::new(1314);
        header.reserved2 = 3;
        let mut frame = BytesMut::new();
        header.encode(&mut frame);

        let marked = mark_from_switch(&frame);
        let decoded = VxlanHeader::decode(&marked).unwrap();
        assert!(decoded.has_flags(FLAG_I_AM_FROM_SWITCH));
        assert_eq!(decoded.vni, 1314);
        assert_eq!(decoded.reserved2, 3);
        assert_eq!(mark_from_switch(&[0x08]), vec![0x08]);
    }

    #[test]
    fn test_local_side_vni() {
        assert_eq!(PeerKind::Bare(7).local_side_vni(9), 7);
        assert_eq!(PeerKind::Switch.local_side_vni(9), 9);
    }
}
