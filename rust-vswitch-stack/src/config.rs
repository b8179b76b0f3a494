//! Switch configuration: tables, synthetic IPs, routes, VXLAN peers and
//! echo listeners, deserialized with serde and loaded through the `config`
//! crate.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rust_vswitch_common::types::{MacAddress, Millis, Vni};
use rust_vswitch_common::{Error, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::route::RouteRule;
use crate::stack::NetworkStack;
use crate::table::{ARP_TABLE_TIMEOUT, MAC_TABLE_TIMEOUT};

pub const DEFAULT_BIND: &str = "0.0.0.0:4789";
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub vni: Vni,
    pub v4network: Ipv4Net,
    #[serde(default)]
    pub v6network: Option<Ipv6Net>,
    #[serde(default = "default_mac_table_timeout")]
    pub mac_table_timeout_ms: Millis,
    #[serde(default = "default_arp_table_timeout")]
    pub arp_table_timeout_ms: Millis,
    #[serde(default)]
    pub ips: Vec<IpConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpConfig {
    pub ip: IpAddr,
    pub mac: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub alias: String,
    pub network: IpNet,
    #[serde(default)]
    pub vni: Option<Vni>,
    #[serde(default)]
    pub via: Option<IpAddr>,
}

/// A static VXLAN peer. With `vni` it is an endpoint of that vni, without
/// it a remote switch carrying every vni.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub address: SocketAddr,
    #[serde(default)]
    pub vni: Option<Vni>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub vni: Vni,
    pub ip: IpAddr,
    pub port: u16,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4789))
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_mac_table_timeout() -> Millis {
    MAC_TABLE_TIMEOUT
}

fn default_arp_table_timeout() -> Millis {
    ARP_TABLE_TIMEOUT
}

impl RouteConfig {
    pub fn to_rule(&self) -> Result<RouteRule> {
        match (self.vni, self.via) {
            (Some(vni), None) => Ok(RouteRule::to_vni(self.alias.clone(), self.network, vni)),
            (None, Some(via)) => Ok(RouteRule::via(self.alias.clone(), self.network, via)),
            _ => Err(Error::Config(format!(
                "route {} must set exactly one of vni and via",
                self.alias
            ))),
        }
    }
}

impl IpConfig {
    pub fn mac_address(&self) -> Result<MacAddress> {
        self.mac
            .parse()
            .map_err(|_| Error::Config(format!("invalid mac {} of {}", self.mac, self.ip)))
    }
}

impl SwitchConfig {
    /// Load from a file, the format is picked by its extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let cfg = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        cfg.try_deserialize()
            .map_err(|e| Error::Config(format!("invalid configuration {}: {}", path.display(), e)))
    }

    /// Create the configured tables, synthetic ips and routes. Routes are
    /// added after every table exists so they may point at any of them.
    pub fn apply(&self, stack: &mut NetworkStack) -> Result<()> {
        for t in &self.tables {
            stack
                .add_table(t.vni, t.v4network, t.v6network, t.mac_table_timeout_ms, t.arp_table_timeout_ms)
                .map_err(|e| Error::Config(format!("table {}: {}", t.vni, e)))?;
            for ip in &t.ips {
                let mac = ip.mac_address()?;
                stack
                    .add_synthetic_ip(t.vni, ip.ip, mac)
                    .map_err(|e| Error::Config(format!("table {} ip {}: {}", t.vni, ip.ip, e)))?;
            }
        }
        for t in &self.tables {
            for r in &t.routes {
                let rule = r.to_rule()?;
                stack
                    .add_route(t.vni, rule)
                    .map_err(|e| Error::Config(format!("table {} route {}: {}", t.vni, r.alias, e)))?;
            }
        }
        for l in &self.listeners {
            if !self.tables.iter().any(|t| t.vni == l.vni) {
                return Err(Error::Config(format!("listener {}:{} refers to unknown table {}", l.ip, l.port, l.vni)));
            }
        }
        for r in &self.remotes {
            if let Some(vni) = r.vni {
                if !self.tables.iter().any(|t| t.vni == vni) {
                    return Err(Error::Config(format!("remote {} refers to unknown table {}", r.address, vni)));
                }
            }
        }
        Ok(())
    }

    /// Build a fresh stack from this configuration.
    pub fn build_stack(&self) -> Result<NetworkStack> {
        let mut stack = NetworkStack::new();
        self.apply(&mut stack)?;
        Ok(stack)
    }
}
