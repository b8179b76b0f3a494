//! A VPC ("table") and the address tables it owns.

use ipnet::{Ipv4Net, Ipv6Net};
use rust_vswitch_common::types::{MacAddress, Millis, Vni};
use rust_vswitch_common::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;

use crate::context::{IfaceId, IfaceRef};
use crate::conntrack::Conntrack;
use crate::route::RouteTable;

pub const MAC_TABLE_TIMEOUT: Millis = 300_000;
pub const ARP_TABLE_TIMEOUT: Millis = 4 * 3600 * 1000;

/* ---------------------------------------------------------------- *
 * Mac table
 * ---------------------------------------------------------------- */

#[derive(Debug, Clone)]
pub struct MacEntry {
    pub mac: MacAddress,
    pub iface: IfaceRef,
    expire_at: Millis,
}

/// mac -> egress interface. Every observed frame slides the expiry forward.
#[derive(Debug)]
pub struct MacTable {
    timeout: Millis,
    entries: HashMap<MacAddress, MacEntry>,
}

impl MacTable {
    pub fn new(timeout: Millis) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
        }
    }

    pub fn record(&mut self, mac: MacAddress, iface: &IfaceRef, now: Millis) {
        let expire_at = now.saturating_add(self.timeout);
        match self.entries.get_mut(&mac) {
            Some(entry) => {
                if entry.iface.id() != iface.id() {
                    log::trace!("mac {} moved from {:?} to {:?}", mac, entry.iface, iface);
                    entry.iface = iface.clone();
                }
                entry.expire_at = expire_at;
            }
            None => {
                self.entries.insert(
                    mac,
                    MacEntry {
                        mac,
                        iface: iface.clone(),
                        expire_at,
                    },
                );
            }
        }
    }

    pub fn lookup(&mut self, mac: &MacAddress, now: Millis) -> Option<IfaceRef> {
        let expired = self.entries.get(mac)?.expire_at <= now;
        if expired {
            self.entries.remove(mac);
            return None;
        }
        self.entries.get(mac).map(|e| e.iface.clone())
    }

    /// Live entries. Expired ones are evicted on the way.
    pub fn list(&mut self, now: Millis) -> Vec<MacEntry> {
        self.sweep(now);
        self.entries.values().cloned().collect()
    }

    /// Evict expired entries, returning how many were dropped.
    pub fn sweep(&mut self, now: Millis) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expire_at > now);
        before - self.entries.len()
    }

    /// Forget every mac learned on `iface`.
    pub fn disconnect(&mut self, iface: IfaceId) {
        self.entries.retain(|_, e| e.iface.id() != iface);
    }

    pub fn remove(&mut self, mac: &MacAddress) -> bool {
        self.entries.remove(mac).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/* ---------------------------------------------------------------- *
 * Arp table
 * ---------------------------------------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub mac: MacAddress,
    pub ip: IpAddr,
    expire_at: Millis,
}

/// ip -> mac learned from ARP (v4) and NDP (v6).
#[derive(Debug)]
pub struct ArpTable {
    timeout: Millis,
    entries: HashMap<IpAddr, ArpEntry>,
}

impl ArpTable {
    pub fn new(timeout: Millis) -> Self {
        Self {
            timeout,
            entries: HashMap::new(),
        }
    }

    pub fn record(&mut self, mac: MacAddress, ip: IpAddr, now: Millis) {
        self.entries.insert(
            ip,
            ArpEntry {
                mac,
                ip,
                expire_at: now.saturating_add(self.timeout),
            },
        );
    }

    pub fn lookup(&mut self, ip: &IpAddr, now: Millis) -> Option<MacAddress> {
        let entry = *self.entries.get(ip)?;
        if entry.expire_at <= now {
            self.entries.remove(ip);
            return None;
        }
        Some(entry.mac)
    }

    pub fn lookup_by_mac(&mut self, mac: &MacAddress, now: Millis) -> Vec<IpAddr> {
        self.list(now)
            .into_iter()
            .filter(|e| e.mac == *mac)
            .map(|e| e.ip)
            .collect()
    }

    pub fn list(&mut self, now: Millis) -> Vec<ArpEntry> {
        self.sweep(now);
        self.entries.values().copied().collect()
    }

    pub fn sweep(&mut self, now: Millis) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expire_at > now);
        before - self.entries.len()
    }

    pub fn remove(&mut self, ip: &IpAddr) -> bool {
        self.entries.remove(ip).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/* ---------------------------------------------------------------- *
 * Synthetic ips
 * ---------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpMac {
    pub ip: IpAddr,
    pub mac: MacAddress,
    pub annotations: HashMap<String, String>,
}

/// Addresses the switch answers for. Iteration follows insertion order.
#[derive(Debug, Default)]
pub struct SyntheticIpTable {
    entries: Vec<IpMac>,
}

impl SyntheticIpTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ip: IpAddr, mac: MacAddress, annotations: HashMap<String, String>) -> Result<()> {
        if self.entries.iter().any(|e| e.ip == ip) {
            return Err(Error::AlreadyExists(format!("synthetic ip {}", ip)));
        }
        self.entries.push(IpMac { ip, mac, annotations });
        Ok(())
    }

    pub fn del(&mut self, ip: &IpAddr) -> Result<IpMac> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.ip == *ip)
            .ok_or_else(|| Error::NotFound(format!("synthetic ip {}", ip)))?;
        Ok(self.entries.remove(idx))
    }

    pub fn lookup(&self, ip: &IpAddr) -> Option<MacAddress> {
        self.entries.iter().find(|e| e.ip == *ip).map(|e| e.mac)
    }

    /// All synthetic ips owned by `mac`, empty if none.
    pub fn lookup_by_mac(&self, mac: &MacAddress) -> Vec<IpAddr> {
        self.entries.iter().filter(|e| e.mac == *mac).map(|e| e.ip).collect()
    }

    /// Distinct macs in insertion order.
    pub fn all_macs(&self) -> Vec<MacAddress> {
        let mut macs: Vec<MacAddress> = Vec::new();
        for e in &self.entries {
            if !macs.contains(&e.mac) {
                macs.push(e.mac);
            }
        }
        macs
    }

    /// First synthetic ip of the same family as `like`.
    pub fn first_of_family(&self, like: &IpAddr) -> Option<&IpMac> {
        self.entries.iter().find(|e| e.ip.is_ipv4() == like.is_ipv4())
    }

    pub fn first_v4(&self) -> Option<&IpMac> {
        self.entries.iter().find(|e| e.ip.is_ipv4())
    }

    pub fn first_v6(&self) -> Option<&IpMac> {
        self.entries.iter().find(|e| e.ip.is_ipv6())
    }

    pub fn entries(&self) -> &[IpMac] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/* ---------------------------------------------------------------- *
 * Table
 * ---------------------------------------------------------------- */

#[derive(Debug)]
pub struct Table {
    pub vni: Vni,
    pub v4network: Ipv4Net,
    pub v6network: Option<Ipv6Net>,
    pub mac_table: MacTable,
    pub arp_table: ArpTable,
    pub ips: SyntheticIpTable,
    pub route_table: RouteTable,
    pub conntrack: Conntrack,
    pub annotations: HashMap<String, String>,
}

impl Table {
    pub fn new(
        vni: Vni,
        v4network: Ipv4Net,
        v6network: Option<Ipv6Net>,
        mac_table_timeout: Millis,
        arp_table_timeout: Millis,
    ) -> Self {
        let v4network = v4network.trunc();
        let v6network = v6network.map(|n| n.trunc());
        Self {
            vni,
            v4network,
            v6network,
            mac_table: MacTable::new(mac_table_timeout),
            arp_table: ArpTable::new(arp_table_timeout),
            ips: SyntheticIpTable::new(),
            route_table: RouteTable::new(vni, v4network, v6network),
            conntrack: Conntrack::new(),
            annotations: HashMap::new(),
        }
    }

    /// Whether `ip` lies in the v4 or v6 network of this table.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.v4network.contains(v4),
            IpAddr::V6(v6) => self.v6network.map_or(false, |n| n.contains(v6)),
        }
    }

    /// Add a synthetic ip, which must belong to this table's networks.
    pub fn add_ip(&mut self, ip: IpAddr, mac: MacAddress, annotations: HashMap<String, String>) -> Result<()> {
        if !self.contains(&ip) {
            return Err(Error::InvalidArgument(format!(
                "synthetic ip {} is not in vpc {} networks",
                ip, self.vni
            )));
        }
        if !mac.is_unicast() {
            return Err(Error::InvalidArgument(format!("synthetic mac {} is not unicast", mac)));
        }
        self.ips.add(ip, mac, annotations)
    }

    /// Mac of `ip`: synthetic ips first, then learned ARP/NDP entries.
    pub fn lookup(&mut self, ip: &IpAddr, now: Millis) -> Option<MacAddress> {
        self.ips.lookup(ip).or_else(|| self.arp_table.lookup(ip, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{next_iface_id, Iface};
    use rust_vswitch_common::types::Vni;
    use std::io;
    use std::sync::Arc;

    #[derive(Debug)]
    struct NullIface(IfaceId);

    impl Iface for NullIface {
        fn id(&self) -> IfaceId {
            self.0
        }

        fn local_side_vni(&self, hint: Vni) -> Vni {
            hint
        }

        fn send_packet(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }

    fn iface() -> IfaceRef {
        Arc::new(NullIface(next_iface_id()))
    }

    fn mac(last: u8) -> MacAddress {
        MacAddress([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_mac_table_sliding_expiry() {
        let mut t = MacTable::new(1000);
        let a = iface();
        t.record(mac(1), &a, 0);
        t.record(mac(1), &a, 800);
        assert!(t.lookup(&mac(1), 1500).is_some());
        assert!(t.lookup(&mac(1), 1800).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn test_mac_table_last_writer_wins() {
        let mut t = MacTable::new(1000);
        let (a, b) = (iface(), iface());
        t.record(mac(1), &a, 0);
        t.record(mac(1), &b, 10);
        assert_eq!(t.lookup(&mac(1), 20).unwrap().id(), b.id());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_mac_table_disconnect() {
        let mut t = MacTable::new(1000);
        let (a, b) = (iface(), iface());
        t.record(mac(1), &a, 0);
        t.record(mac(2), &a, 0);
        t.record(mac(3), &b, 0);
        t.disconnect(a.id());
        assert_eq!(t.list(0).len(), 1);
        assert!(t.lookup(&mac(3), 0).is_some());
    }

    #[test]
    fn test_arp_table() {
        let mut t = ArpTable::new(100);
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        t.record(mac(5), ip, 0);
        t.record(mac(5), "fd00::5".parse().unwrap(), 50);
        assert_eq!(t.lookup(&ip, 99), Some(mac(5)));
        assert_eq!(t.lookup_by_mac(&mac(5), 10).len(), 2);
        assert_eq!(t.lookup(&ip, 100), None);
        assert_eq!(t.lookup_by_mac(&mac(5), 120).len(), 1);
    }

    #[test]
    fn test_sweep_drops_only_expired() {
        let mut arp = ArpTable::new(100);
        for i in 0..50u8 {
            arp.record(mac(i), IpAddr::from([10, 0, 1, i]), 0);
        }
        arp.record(mac(99), "10.0.0.99".parse().unwrap(), 60);
        assert_eq!(arp.sweep(99), 0);
        assert_eq!(arp.sweep(100), 50);
        assert_eq!(arp.len(), 1);

        let mut macs = MacTable::new(100);
        let a = iface();
        macs.record(mac(1), &a, 0);
        macs.record(mac(2), &a, 50);
        assert_eq!(macs.sweep(120), 1);
        assert_eq!(macs.len(), 1);
    }

    #[test]
    fn test_synthetic_ips() {
        let mut table = Table::new(
            1,
            "10.0.0.0/24".parse().unwrap(),
            Some("fd00::/64".parse().unwrap()),
            MAC_TABLE_TIMEOUT,
            ARP_TABLE_TIMEOUT,
        );
        table.add_ip("10.0.0.254".parse().unwrap(), mac(0xfe), HashMap::new()).unwrap();
        table.add_ip("fd00::fe".parse().unwrap(), mac(0xfe), HashMap::new()).unwrap();
        table.add_ip("10.0.0.253".parse().unwrap(), mac(0xfd), HashMap::new()).unwrap();
        assert!(table.add_ip("10.0.1.1".parse().unwrap(), mac(1), HashMap::new()).is_err());
        assert!(table.add_ip("10.0.0.254".parse().unwrap(), mac(1), HashMap::new()).is_err());
        assert!(table
            .add_ip("10.0.0.9".parse().unwrap(), MacAddress::BROADCAST, HashMap::new())
            .is_err());

        assert_eq!(table.ips.all_macs(), vec![mac(0xfe), mac(0xfd)]);
        assert_eq!(table.ips.lookup_by_mac(&mac(0xfe)).len(), 2);
        assert_eq!(table.ips.first_v6().unwrap().ip, "fd00::fe".parse::<IpAddr>().unwrap());

        table.arp_table.record(mac(7), "10.0.0.7".parse().unwrap(), 0);
        assert_eq!(table.lookup(&"10.0.0.7".parse().unwrap(), 1), Some(mac(7)));
        assert_eq!(table.lookup(&"10.0.0.253".parse().unwrap(), 1), Some(mac(0xfd)));
        assert!(table.ips.del(&"10.0.0.253".parse().unwrap()).is_ok());
        assert_eq!(table.ips.all_macs(), vec![mac(0xfe)]);
    }
}
