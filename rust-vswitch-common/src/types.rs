//! Common value types shared across the switch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// VXLAN network identifier, the tenant/VPC discriminator.
pub type Vni = u32;

/// Monotonic milliseconds. Every time-dependent operation takes `now` explicitly.
pub type Millis = u64;

/// Largest value a 24-bit VNI can carry.
pub const MAX_VNI: Vni = 0x00FF_FFFF;

/// A 48-bit Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Unicast addresses have the I/G bit cleared.
    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::InvalidArgument(format!("invalid mac address: {}", s)))?;
            if part.len() != 2 {
                return Err(Error::InvalidArgument(format!("invalid mac address: {}", s)));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidArgument(format!("invalid mac address: {}", s)))?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidArgument(format!("invalid mac address: {}", s)));
        }
        Ok(Self(out))
    }
}

/// An IP address paired with a transport port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPort {
    pub ip: IpAddr,
    pub port: u16,
}

impl IpPort {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn is_v4(&self) -> bool {
        self.ip.is_ipv4()
    }

    /// The wildcard address of the same family, used for `0.0.0.0`/`::` listeners.
    pub fn any_of_family(&self) -> IpPort {
        let ip = match self.ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        IpPort { ip, port: self.port }
    }
}

impl From<SocketAddr> for IpPort {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for IpPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "02:00:5e:10:00:01".parse().unwrap();
        assert_eq!(mac.0, [0x02, 0x00, 0x5e, 0x10, 0x00, 0x01]);
        assert_eq!(mac.to_string(), "02:00:5e:10:00:01");
        assert!(mac.is_unicast());

        assert!("02:00:5e:10:00".parse::<MacAddress>().is_err());
        assert!("02:00:5e:10:00:01:02".parse::<MacAddress>().is_err());
        assert!("zz:00:5e:10:00:01".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_mac_kinds() {
        assert!(MacAddress::BROADCAST.is_broadcast());
        assert!(!MacAddress::BROADCAST.is_unicast());
        // IPv6 multicast mapping
        assert!(!MacAddress([0x33, 0x33, 0, 0, 0, 1]).is_unicast());
    }

    #[test]
    fn test_ip_port_display() {
        let v4 = IpPort::new("10.0.0.1".parse().unwrap(), 80);
        let v6 = IpPort::new("fd00::1".parse().unwrap(), 443);
        assert_eq!(v4.to_string(), "10.0.0.1:80");
        assert_eq!(v6.to_string(), "[fd00::1]:443");
        assert_eq!(v6.any_of_family().ip, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
    }
}
