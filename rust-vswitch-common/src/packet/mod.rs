//! Wire codecs for the protocols the switch terminates.
//!
//! Every layer decodes once into a plain value whose payload is a tagged
//! enum of the next layer, so the pipeline dispatches on variants and
//! rewrites headers in place before re-encoding.

pub mod arp;
pub mod checksum;
pub mod ethernet;
pub mod icmp;
pub mod ip;
pub mod tcp;
pub mod vxlan;

pub use arp::ArpPacket;
pub use ethernet::{EtherPayload, EthernetPacket};
pub use icmp::IcmpPacket;
pub use ip::{IpPacket, IpPayload};
pub use tcp::{TcpOption, TcpPacket};
pub use vxlan::{VxlanHeader, VxlanPacket};

use crate::error::Error;

pub(crate) fn ensure_len(buf: &[u8], need: usize, what: &str) -> Result<(), Error> {
    if buf.len() < need {
        return Err(Error::Decode(format!(
            "{} requires {} bytes but only {} available",
            what,
            need,
            buf.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
