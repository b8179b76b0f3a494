//! The daemon: one UDP socket feeding VXLAN frames into the stack.

use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use rust_vswitch_common::metrics::SwitchMetrics;
use rust_vswitch_common::packet::vxlan::FLAG_I_AM_FROM_SWITCH;
use rust_vswitch_common::packet::VxlanHeader;
use rust_vswitch_common::types::{IpPort, Millis};
use rust_vswitch_stack::{Iface, IfaceRef, NetworkStack, SwitchConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use crate::echo::EchoService;
use crate::iface::{PeerKind, UdpIface};

/// Learned peers are forgotten after this much silence.
pub const PEER_TIMEOUT: Millis = 60_000;
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const RECV_BUFFER_SIZE: usize = 65536;

struct Peer {
    iface: Arc<UdpIface>,
    last_seen: Millis,
    is_static: bool,
}

/// What to do with a frame from an address we have not seen yet.
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    Learn(PeerKind),
    RejectSwitch,
    RejectVni,
    Garbage,
}

fn admit(frame: &[u8], has_table: impl Fn(u32) -> bool) -> Admission {
    let Ok(header) = VxlanHeader::decode(frame) else {
        return Admission::Garbage;
    };
    if header.has_flags(FLAG_I_AM_FROM_SWITCH) {
        Admission::RejectSwitch
    } else if !has_table(header.vni) {
        Admission::RejectVni
    } else {
        Admission::Learn(PeerKind::Bare(header.vni))
    }
}

pub struct Switch {
    stack: NetworkStack,
    socket: Arc<UdpSocket>,
    peers: HashMap<SocketAddr, Peer>,
    echo: EchoService,
    started: Instant,
    tick_interval: Duration,
}

impl Switch {
    /// Build the stack from `config` and bind the VXLAN socket.
    pub async fn bind(config: &SwitchConfig, metrics: Arc<SwitchMetrics>) -> Result<Self> {
        let mut stack = NetworkStack::with_metrics(metrics);
        config.apply(&mut stack).context("Failed to apply configuration")?;

        let socket = UdpSocket::bind(config.bind)
            .await
            .with_context(|| format!("Failed to bind {}", config.bind))?;
        info!("VXLAN socket bound on {}", socket.local_addr()?);

        let mut switch = Self {
            stack,
            socket: Arc::new(socket),
            peers: HashMap::new(),
            echo: EchoService::new(),
            started: Instant::now(),
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
        };

        for remote in &config.remotes {
            let kind = match remote.vni {
                Some(vni) => PeerKind::Bare(vni),
                None => PeerKind::Switch,
            };
            switch
                .add_peer(remote.address, kind, true)
                .with_context(|| format!("Failed to add remote {}", remote.address))?;
        }
        for l in &config.listeners {
            let local = IpPort::new(l.ip, l.port);
            switch
                .echo
                .listen(&mut switch.stack, l.vni, local)
                .with_context(|| format!("Failed to listen on {} in table {}", local, l.vni))?;
        }
        Ok(switch)
    }

    fn now(&self) -> Millis {
        self.started.elapsed().as_millis() as Millis
    }

    fn add_peer(&mut self, remote: SocketAddr, kind: PeerKind, is_static: bool) -> Result<Arc<UdpIface>> {
        let iface = Arc::new(UdpIface::new(remote, kind, self.socket.clone()));
        self.stack.add_iface(iface.clone())?;
        info!("added {:?}", iface);
        self.peers.insert(
            remote,
            Peer {
                iface: iface.clone(),
                last_seen: self.now(),
                is_static,
            },
        );
        Ok(iface)
    }

    /// Feed one datagram into the stack.
    pub fn on_datagram(&mut self, frame: &[u8], from: SocketAddr) {
        let now = self.now();
        let iface = match self.peers.get_mut(&from) {
            Some(peer) => {
                peer.last_seen = now;
                if self.stack.is_disconnected(peer.iface.id()) {
                    trace!("{:?} was disconnected, frame dropped", peer.iface);
                    return;
                }
                peer.iface.clone()
            }
            None => {
                let stack = &self.stack;
                match admit(frame, |vni| stack.table(vni).is_ok()) {
                    Admission::Learn(kind) => match self.add_peer(from, kind, false) {
                        Ok(iface) => iface,
                        Err(e) => {
                            warn!("cannot add peer {}: {}", from, e);
                            return;
                        }
                    },
                    Admission::RejectSwitch => {
                        warn!("{} claims to be a switch but is not configured as a remote, dropped", from);
                        return;
                    }
                    Admission::RejectVni => {
                        debug!("{} sent a frame for an unknown vni, dropped", from);
                        return;
                    }
                    Admission::Garbage => {
                        debug!("{} sent an invalid vxlan frame, dropped", from);
                        return;
                    }
                }
            }
        };
        let iface: IfaceRef = iface;
        self.stack.input_vxlan(frame, iface, now);
        self.echo.drain(&mut self.stack, now);
    }

    pub fn on_tick(&mut self) {
        let now = self.now();
        self.stack.tick(now);
        self.echo.drain(&mut self.stack, now);
    }

    /// Drop learned peers that went silent.
    pub fn sweep_peers(&mut self) {
        let now = self.now();
        let expired: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| !p.is_static && now.saturating_sub(p.last_seen) > PEER_TIMEOUT)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in expired {
            if let Some(peer) = self.peers.remove(&addr) {
                info!("peer {} timed out", addr);
                let id = peer.iface.id();
                // a disconnected iface is already gone from the stack
                if self.stack.reconnect_iface(id) {
                    continue;
                }
                if let Err(e) = self.stack.remove_iface(id) {
                    warn!("failed to remove {:?}: {}", peer.iface, e);
                }
            }
        }
        self.echo.drain(&mut self.stack, now);
    }

    pub fn log_stats(&self) {
        match serde_json::to_string(&self.stack.metrics().snapshot()) {
            Ok(line) => info!(
                "stats {} peers {} echo connections {}",
                line,
                self.peers.len(),
                self.echo.connections()
            ),
            Err(e) => warn!("failed to serialize stats: {}", e),
        }
    }

    /// Serve until Ctrl-C.
    pub async fn run(mut self) -> Result<()> {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut tick = tokio::time::interval(self.tick_interval);
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        let mut stats = tokio::time::interval(STATS_INTERVAL);
        stats.tick().await;
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) => self.on_datagram(&buf[..n], from),
                    Err(e) => warn!("recv failed: {}", e),
                },
                _ = tick.tick() => self.on_tick(),
                _ = sweep.tick() => self.sweep_peers(),
                _ = stats.tick() => self.log_stats(),
                res = &mut shutdown => {
                    res.context("Failed to wait for Ctrl-C")?;
                    info!("shutting down");
                    self.log_stats();
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn header_bytes(vni: u32, flags: u32) -> BytesMut {
        let mut header = VxlanHeader::new(vni);
        header.reserved1 = flags;
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf
    }

    #[test]
    fn test_admission() {
        let known = |vni| vni == 1314;
        assert_eq!(admit(&header_bytes(1314, 0), known), Admission::Learn(PeerKind::Bare(1314)));
        assert_eq!(admit(&header_bytes(1315, 0), known), Admission::RejectVni);
        assert_eq!(
            admit(&header_bytes(1314, FLAG_I_AM_FROM_SWITCH), known),
            Admission::RejectSwitch
        );
        assert_eq!(admit(&[0x08, 0], known), Admission::Garbage);
    }
}
