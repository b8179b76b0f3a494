//! Per-table routing rules.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rust_vswitch_common::types::Vni;
use rust_vswitch_common::{Error, Result};
use std::fmt;
use std::net::IpAddr;

pub const DEFAULT_RULE_NAME: &str = "default";
pub const DEFAULT_RULE_V6_NAME: &str = "default-v6";

/// Where a matching packet goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// Into the table with this VNI. The table's own VNI means a direct route.
    Vni(Vni),
    /// To a next hop inside the table's own networks.
    Gateway(IpAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub alias: String,
    pub rule: IpNet,
    pub target: RouteTarget,
}

impl RouteRule {
    pub fn to_vni(alias: impl Into<String>, rule: IpNet, vni: Vni) -> Self {
        Self {
            alias: alias.into(),
            rule: rule.trunc(),
            target: RouteTarget::Vni(vni),
        }
    }

    pub fn via(alias: impl Into<String>, rule: IpNet, gateway: IpAddr) -> Self {
        Self {
            alias: alias.into(),
            rule: rule.trunc(),
            target: RouteTarget::Gateway(gateway),
        }
    }

    /// Packets stay in table `vni` and are delivered on-link.
    pub fn is_local_direct(&self, vni: Vni) -> bool {
        self.target == RouteTarget::Vni(vni)
    }

    pub fn target_vni(&self) -> Option<Vni> {
        match self.target {
            RouteTarget::Vni(vni) => Some(vni),
            RouteTarget::Gateway(_) => None,
        }
    }
}

impl fmt::Display for RouteRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            RouteTarget::Vni(vni) => write!(f, "{} -> network {} vni {}", self.alias, self.rule, vni),
            RouteTarget::Gateway(ip) => write!(f, "{} -> network {} via {}", self.alias, self.rule, ip),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    v4network: Ipv4Net,
    v6network: Option<Ipv6Net>,
    default_v4: RouteRule,
    default_v6: Option<RouteRule>,
    rules: Vec<RouteRule>,
}

impl RouteTable {
    /// A table holding the default rules of a VPC.
    pub fn new(vni: Vni, v4network: Ipv4Net, v6network: Option<Ipv6Net>) -> Self {
        let default_v4 = RouteRule::to_vni(DEFAULT_RULE_NAME, IpNet::V4(v4network), vni);
        let default_v6 = v6network.map(|n| RouteRule::to_vni(DEFAULT_RULE_V6_NAME, IpNet::V6(n), vni));
        let mut rules = vec![default_v4.clone()];
        rules.extend(default_v6.clone());
        Self {
            v4network: v4network.trunc(),
            v6network: v6network.map(|n| n.trunc()),
            default_v4,
            default_v6,
            rules,
        }
    }

    /// Longest prefix match; among equal prefixes the earlier rule wins.
    pub fn lookup(&self, ip: &IpAddr) -> Option<&RouteRule> {
        let mut best: Option<&RouteRule> = None;
        for r in &self.rules {
            if !r.rule.contains(ip) {
                continue;
            }
            if best.map_or(true, |b| r.rule.prefix_len() > b.rule.prefix_len()) {
                best = Some(r);
            }
        }
        best
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn add_rule(&mut self, r: RouteRule) -> Result<()> {
        for rr in &self.rules {
            if rr.alias == r.alias {
                return Err(Error::AlreadyExists(format!("route {}", r.alias)));
            }
            if rr.rule == r.rule {
                return Err(Error::AlreadyExists(format!(
                    "route {} has the same network rule as the adding one: {}",
                    rr.alias, r.rule
                )));
            }
        }
        if r.alias == DEFAULT_RULE_NAME && r != self.default_v4 {
            return Err(Error::InvalidArgument(format!("validation failed for the rule with name {}", r.alias)));
        }
        if r.alias == DEFAULT_RULE_V6_NAME && Some(&r) != self.default_v6.as_ref() {
            return Err(Error::InvalidArgument(format!("validation failed for the rule with name {}", r.alias)));
        }
        if let RouteTarget::Gateway(ip) = r.target {
            let inside = match ip {
                IpAddr::V4(v4) => self.v4network.contains(&v4),
                IpAddr::V6(v6) => match &self.v6network {
                    Some(n) => n.contains(&v6),
                    None => return Err(Error::InvalidArgument("this network does not support ipv6".into())),
                },
            };
            if !inside {
                return Err(Error::InvalidArgument(format!(
                    "cannot specify an ip out of the network to redirect packets to: {}",
                    ip
                )));
            }
        }
        self.rules.push(r);
        Ok(())
    }

    pub fn del_rule(&mut self, alias: &str) -> Result<RouteRule> {
        let idx = self
            .rules
            .iter()
            .position(|r| r.alias == alias)
            .ok_or_else(|| Error::NotFound(format!("route {}", alias)))?;
        Ok(self.rules.remove(idx))
    }
}
