//! `NetworkStack`: owns the tables, interfaces and timers, and is the entry
//! point for inbound frames, time, administration and the TCP socket API.

use bytes::Bytes;
use ipnet::{Ipv4Net, Ipv6Net};
use log::{debug, info, trace, warn};
use rust_vswitch_common::metrics::SwitchMetrics;
use rust_vswitch_common::packet::vxlan::{
    FLAG_I_DETECTED_A_POSSIBLE_LOOP, FLAG_I_WILL_DISCONNECT_FROM_YOU_IF_I_RECEIVE_AGAIN, LOOP_DETECT_HOP_THRESHOLD,
};
use rust_vswitch_common::packet::{EthernetPacket, VxlanHeader, VxlanPacket};
use rust_vswitch_common::types::{IpPort, MacAddress, Millis, Vni, MAX_VNI};
use rust_vswitch_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use crate::conntrack::{ListenHandler, SocketPair};
use crate::context::{IfaceId, IfaceRef, SwitchContext};
use crate::route::{RouteRule, RouteTarget};
use crate::skb::SocketBuffer;
use crate::table::{Table, ARP_TABLE_TIMEOUT, MAC_TABLE_TIMEOUT};
use crate::tcp::{ConnectionHandler, TcpEntry, TcpState};
use crate::timer::EventLoop;
use crate::{l2, l3, l4};

/// How often [`NetworkStack::tick`] evicts expired address entries.
pub const ADDRESS_SWEEP_INTERVAL: Millis = 1000;

pub struct NetworkStack {
    tables: HashMap<Vni, Table>,
    ifaces: Vec<IfaceRef>,
    /// Ifaces cut off by loop detection; their frames are dropped.
    disconnected: HashSet<IfaceId>,
    event_loop: EventLoop,
    next_sweep_at: Millis,
    metrics: Arc<SwitchMetrics>,
}

impl Default for NetworkStack {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStack {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(SwitchMetrics::new()))
    }

    pub fn with_metrics(metrics: Arc<SwitchMetrics>) -> Self {
        Self {
            tables: HashMap::new(),
            ifaces: Vec::new(),
            disconnected: HashSet::new(),
            event_loop: EventLoop::new(),
            next_sweep_at: 0,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<SwitchMetrics> {
        &self.metrics
    }

    fn context(&mut self, now: Millis) -> SwitchContext<'_> {
        SwitchContext::new(&mut self.tables, &self.ifaces, &mut self.event_loop, &self.metrics, now)
    }

    /* ---------------------------------------------------------------- *
     * Packet input
     * ---------------------------------------------------------------- */

    /// Process one VXLAN frame received on `devin`.
    pub fn input_vxlan(&mut self, frame: &[u8], devin: IfaceRef, now: Millis) {
        self.metrics.frames_received.increment();
        self.metrics.bytes_received.add(frame.len() as u64);

        if self.disconnected.contains(&devin.id()) {
            trace!("drop frame from disconnected {:?}", devin);
            self.metrics.frames_dropped.increment();
            return;
        }
        let mut vxlan = match VxlanPacket::decode(frame) {
            Ok(p) => p,
            Err(e) => {
                debug!("invalid vxlan packet from {:?}: {}", devin, e);
                self.metrics.frames_dropped.increment();
                return;
            }
        };
        let vni = vxlan.vni();
        if !self.tables.contains_key(&vni) {
            trace!("vni not defined: {}", vni);
            self.metrics.frames_dropped.increment();
            return;
        }
        if vxlan.packet.src == vxlan.packet.dst {
            trace!("got packet with same src and dst: {}", vxlan.packet.description());
            self.metrics.frames_dropped.increment();
            return;
        }

        let header = &mut vxlan.header;
        if header.reserved2 > LOOP_DETECT_HOP_THRESHOLD {
            warn!("possible loop detected from {:?} with packet {}", devin, vxlan.packet.description());
            self.metrics.loops_detected.increment();
            let possible_loop = header.has_flags(FLAG_I_DETECTED_A_POSSIBLE_LOOP);
            let will_disconnect = header.has_flags(FLAG_I_WILL_DISCONNECT_FROM_YOU_IF_I_RECEIVE_AGAIN);
            if possible_loop && will_disconnect {
                warn!("disconnect from {:?} due to possible loop", devin);
                self.disconnect_iface(devin.id());
                self.metrics.ifaces_disconnected.increment();
                self.metrics.frames_dropped.increment();
                return;
            }
            if !possible_loop && !will_disconnect {
                header.set_flags(FLAG_I_DETECTED_A_POSSIBLE_LOOP);
            } else {
                header.set_flags(FLAG_I_DETECTED_A_POSSIBLE_LOOP | FLAG_I_WILL_DISCONNECT_FROM_YOU_IF_I_RECEIVE_AGAIN);
            }
        }
        header.reserved2 = header.reserved2.saturating_add(1);

        let raw = Bytes::copy_from_slice(&frame[VxlanHeader::LEN..]);
        let mut skb = SocketBuffer::from_vxlan(vxlan, raw, devin);
        trace!("{} input vxlan {:?}", skb.handling_id, skb);
        let mut ctx = self.context(now);
        l2::input(&mut ctx, &mut skb);
    }

    /// Process a bare ethernet frame for table `vni`, e.g. from a local tap.
    pub fn input_ether(&mut self, vni: Vni, frame: &[u8], devin: Option<IfaceRef>, now: Millis) {
        self.metrics.frames_received.increment();
        self.metrics.bytes_received.add(frame.len() as u64);
        let pkt = match EthernetPacket::decode(frame) {
            Ok(p) => p,
            Err(e) => {
                debug!("invalid ethernet packet for vni {}: {}", vni, e);
                self.metrics.frames_dropped.increment();
                return;
            }
        };
        if !self.tables.contains_key(&vni) {
            trace!("vni not defined: {}", vni);
            self.metrics.frames_dropped.increment();
            return;
        }
        let mut skb = SocketBuffer::from_ether(vni, pkt, devin);
        skb.raw = Some(Bytes::copy_from_slice(frame));
        let mut ctx = self.context(now);
        l2::input(&mut ctx, &mut skb);
    }

    /* ---------------------------------------------------------------- *
     * Time
     * ---------------------------------------------------------------- */

    /// Fire every timer due at `now`. Returns how many fired.
    pub fn tick(&mut self, now: Millis) -> usize {
        let mut fired = 0;
        while let Some((id, task)) = self.event_loop.pop_expired(now) {
            let mut ctx = self.context(now);
            l4::on_timer(&mut ctx, id, task);
            fired += 1;
        }
        if now >= self.next_sweep_at {
            self.sweep_addresses(now);
            self.next_sweep_at = now.saturating_add(ADDRESS_SWEEP_INTERVAL);
        }
        fired
    }

    /// Evict expired mac and arp entries of every table. Lookups only
    /// evict what they touch, so [`tick`](Self::tick) runs this periodically.
    pub fn sweep_addresses(&mut self, now: Millis) -> usize {
        let mut evicted = 0;
        for table in self.tables.values_mut() {
            evicted += table.mac_table.sweep(now) + table.arp_table.sweep(now);
        }
        if evicted > 0 {
            trace!("evicted {} expired address entries", evicted);
        }
        evicted
    }

    pub fn next_timer_deadline(&self) -> Option<Millis> {
        self.event_loop.next_deadline()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Send an ARP request or neighbor solicitation for `ip` in table `vni`.
    pub fn resolve(&mut self, vni: Vni, ip: IpAddr, known_mac: Option<MacAddress>, now: Millis) -> Result<()> {
        self.table(vni)?;
        let mut ctx = self.context(now);
        l3::resolve(&mut ctx, vni, ip, known_mac);
        Ok(())
    }

    /* ---------------------------------------------------------------- *
     * Tables
     * ---------------------------------------------------------------- */

    pub fn add_table(
        &mut self,
        vni: Vni,
        v4network: Ipv4Net,
        v6network: Option<Ipv6Net>,
        mac_table_timeout: Millis,
        arp_table_timeout: Millis,
    ) -> Result<()> {
        if vni == 0 || vni > MAX_VNI {
            return Err(Error::InvalidArgument(format!("vni {} out of range", vni)));
        }
        if self.tables.contains_key(&vni) {
            return Err(Error::AlreadyExists(format!("table {}", vni)));
        }
        let table = Table::new(vni, v4network, v6network, mac_table_timeout, arp_table_timeout);
        self.tables.insert(vni, table);
        info!("table {} added: v4={} v6={:?}", vni, v4network, v6network);
        Ok(())
    }

    /// Add a table with the default aging timeouts.
    pub fn add_default_table(&mut self, vni: Vni, v4network: Ipv4Net, v6network: Option<Ipv6Net>) -> Result<()> {
        self.add_table(vni, v4network, v6network, MAC_TABLE_TIMEOUT, ARP_TABLE_TIMEOUT)
    }

    /// Remove a table that no other table routes into. Its connections are
    /// dropped and their timers cancelled.
    pub fn remove_table(&mut self, vni: Vni) -> Result<Table> {
        if !self.tables.contains_key(&vni) {
            return Err(Error::NotFound(format!("table {}", vni)));
        }
        for (other, t) in &self.tables {
            if *other == vni {
                continue;
            }
            if let Some(r) = t.route_table.rules().iter().find(|r| r.target == RouteTarget::Vni(vni)) {
                return Err(Error::InvalidArgument(format!(
                    "table {} is referenced by route {} of table {}",
                    vni, r.alias, other
                )));
            }
        }
        let mut table = self
            .tables
            .remove(&vni)
            .ok_or_else(|| Error::NotFound(format!("table {}", vni)))?;
        for pair in table.conntrack.tcp_pairs() {
            if let Some(mut e) = table.conntrack.remove_tcp(&pair.remote, &pair.local) {
                for id in e.destroy() {
                    self.event_loop.cancel(id);
                }
                self.metrics.conntrack_entries.decrement();
            }
        }
        info!("table {} removed", vni);
        Ok(table)
    }

    pub fn table(&self, vni: Vni) -> Result<&Table> {
        self.tables
            .get(&vni)
            .ok_or_else(|| Error::NotFound(format!("table {}", vni)))
    }

    pub fn table_mut(&mut self, vni: Vni) -> Result<&mut Table> {
        self.tables
            .get_mut(&vni)
            .ok_or_else(|| Error::NotFound(format!("table {}", vni)))
    }

    /// Tables ordered by vni.
    pub fn tables(&self) -> Vec<&Table> {
        let mut tables: Vec<&Table> = self.tables.values().collect();
        tables.sort_by_key(|t| t.vni);
        tables
    }

    pub fn add_synthetic_ip(&mut self, vni: Vni, ip: IpAddr, mac: MacAddress) -> Result<()> {
        self.table_mut(vni)?.add_ip(ip, mac, HashMap::new())?;
        info!("synthetic ip {} ({}) added to table {}", ip, mac, vni);
        Ok(())
    }

    pub fn remove_synthetic_ip(&mut self, vni: Vni, ip: &IpAddr) -> Result<()> {
        let removed = self.table_mut(vni)?.ips.del(ip)?;
        info!("synthetic ip {} ({}) removed from table {}", removed.ip, removed.mac, vni);
        Ok(())
    }

    /// Add a route. A rule into another table requires that table to exist.
    pub fn add_route(&mut self, vni: Vni, rule: RouteRule) -> Result<()> {
        if let RouteTarget::Vni(target) = rule.target {
            if target != vni && !self.tables.contains_key(&target) {
                return Err(Error::NotFound(format!("target table {} of route {}", target, rule.alias)));
            }
        }
        let desc = rule.to_string();
        self.table_mut(vni)?.route_table.add_rule(rule)?;
        info!("route added to table {}: {}", vni, desc);
        Ok(())
    }

    pub fn remove_route(&mut self, vni: Vni, alias: &str) -> Result<RouteRule> {
        let rule = self.table_mut(vni)?.route_table.del_rule(alias)?;
        info!("route removed from table {}: {}", vni, rule);
        Ok(rule)
    }

    /* ---------------------------------------------------------------- *
     * Interfaces
     * ---------------------------------------------------------------- */

    pub fn add_iface(&mut self, iface: IfaceRef) -> Result<()> {
        if self.ifaces.iter().any(|i| i.id() == iface.id()) {
            return Err(Error::AlreadyExists(format!("iface {:?}", iface)));
        }
        debug!("iface added: {:?}", iface);
        self.ifaces.push(iface);
        Ok(())
    }

    /// Remove an interface and forget every mac learned on it.
    pub fn remove_iface(&mut self, id: IfaceId) -> Result<IfaceRef> {
        let idx = self
            .ifaces
            .iter()
            .position(|i| i.id() == id)
            .ok_or_else(|| Error::NotFound(format!("iface {}", id)))?;
        let iface = self.ifaces.remove(idx);
        self.forget_macs_of(id);
        debug!("iface removed: {:?}", iface);
        Ok(iface)
    }

    /// Cut off an iface after a confirmed loop: it leaves the stack, every
    /// MacTable forgets it, and its later frames are dropped.
    fn disconnect_iface(&mut self, id: IfaceId) {
        self.ifaces.retain(|i| i.id() != id);
        self.forget_macs_of(id);
        self.disconnected.insert(id);
    }

    fn forget_macs_of(&mut self, id: IfaceId) {
        for t in self.tables.values_mut() {
            t.mac_table.disconnect(id);
        }
    }

    /// The iface was cut off by loop detection.
    pub fn is_disconnected(&self, id: IfaceId) -> bool {
        self.disconnected.contains(&id)
    }

    /// Let a disconnected iface back in. It must be added again with
    /// [`add_iface`](Self::add_iface).
    pub fn reconnect_iface(&mut self, id: IfaceId) -> bool {
        self.disconnected.remove(&id)
    }

    pub fn ifaces(&self) -> &[IfaceRef] {
        &self.ifaces
    }

    /* ---------------------------------------------------------------- *
     * TCP socket API
     * ---------------------------------------------------------------- */

    /// Listen on `local`. The address must be a synthetic ip of the table,
    /// or the unspecified address of either family.
    pub fn listen(&mut self, vni: Vni, local: IpPort, handler: Box<dyn ListenHandler>) -> Result<()> {
        let table = self.table_mut(vni)?;
        if !local.ip.is_unspecified() && table.ips.lookup(&local.ip).is_none() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a synthetic ip of table {}",
                local.ip, vni
            )));
        }
        table.conntrack.listen(local, handler)?;
        info!("listening on {} in table {}", local, vni);
        Ok(())
    }

    pub fn unlisten(&mut self, vni: Vni, local: &IpPort) -> Result<()> {
        self.table_mut(vni)?.conntrack.unlisten(local)?;
        info!("stop listening on {} in table {}", local, vni);
        Ok(())
    }

    /// Take the oldest established connection of a listener.
    pub fn accept(&mut self, vni: Vni, local: &IpPort) -> Option<SocketPair> {
        self.tables.get_mut(&vni)?.conntrack.accept(local)
    }

    pub fn set_connection_handler(
        &mut self,
        vni: Vni,
        pair: &SocketPair,
        handler: Box<dyn ConnectionHandler>,
    ) -> Result<()> {
        self.tcp_entry_mut(vni, pair)?.set_connection_handler(handler);
        Ok(())
    }

    fn tcp_entry_mut(&mut self, vni: Vni, pair: &SocketPair) -> Result<&mut TcpEntry> {
        self.table_mut(vni)?
            .conntrack
            .lookup_tcp_mut(&pair.remote, &pair.local)
            .ok_or_else(|| Error::NotFound(format!("connection {}", pair)))
    }

    pub fn tcp_state(&self, vni: Vni, pair: &SocketPair) -> Option<TcpState> {
        self.tables
            .get(&vni)?
            .conntrack
            .lookup_tcp(&pair.remote, &pair.local)
            .map(|e| e.state())
    }

    /// Drain up to `max` bytes of in-order data. An empty result means no
    /// data yet, or EOF when [`tcp_state`](Self::tcp_state) shows the remote closed.
    pub fn tcp_read(&mut self, vni: Vni, pair: &SocketPair, max: usize, now: Millis) -> Result<Bytes> {
        let e = self.tcp_entry_mut(vni, pair)?;
        let data = e.receiving_queue.read(max);
        e.receiving_queue.reset_window();
        if !data.is_empty() {
            let mut ctx = self.context(now);
            l4::tcp_ack(&mut ctx, vni, pair);
        }
        Ok(data)
    }

    /// Queue data for sending. Returns how much fit into the send buffer.
    pub fn tcp_write(&mut self, vni: Vni, pair: &SocketPair, data: &[u8], now: Millis) -> Result<usize> {
        let e = self.tcp_entry_mut(vni, pair)?;
        match e.state() {
            TcpState::Established | TcpState::CloseWait => {}
            state => {
                return Err(Error::InvalidArgument(format!(
                    "cannot write to {} in state {}",
                    pair, state
                )))
            }
        }
        let n = e.sending_queue.write(data);
        if n > 0 {
            let mut ctx = self.context(now);
            l4::start_retransmission(&mut ctx, vni, pair);
        }
        Ok(n)
    }

    /// Send FIN after the queued data.
    pub fn tcp_shutdown_output(&mut self, vni: Vni, pair: &SocketPair, now: Millis) -> Result<()> {
        let e = self.tcp_entry_mut(vni, pair)?;
        match e.state() {
            TcpState::Established => e.set_state(TcpState::FinWait1),
            TcpState::CloseWait => e.set_state(TcpState::Closing),
            TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing => return Ok(()),
            state => {
                return Err(Error::InvalidArgument(format!(
                    "cannot shutdown output of {} in state {}",
                    pair, state
                )))
            }
        }
        let mut ctx = self.context(now);
        l4::start_retransmission(&mut ctx, vni, pair);
        Ok(())
    }

    /// Close a connection: reset it now, or once the queued data is acked.
    pub fn tcp_close(&mut self, vni: Vni, pair: &SocketPair, now: Millis) -> Result<()> {
        let e = self.tcp_entry_mut(vni, pair)?;
        if e.sending_queue.has_more_data() {
            debug!("close {} after the pending data is sent", pair);
            e.do_close();
            if e.retransmission_timer.is_none() {
                let mut ctx = self.context(now);
                l4::start_retransmission(&mut ctx, vni, pair);
            }
        } else {
            debug!("close {} now", pair);
            let mut ctx = self.context(now);
            l4::reset_tcp_connection(&mut ctx, vni, pair);
        }
        Ok(())
    }
}
