//! Internet checksum (RFC 1071) and transport pseudo-header helpers.

use std::net::IpAddr;

/// Accumulate `data` as big-endian 16-bit words onto `initial`.
pub fn ones_complement_sum(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold the carries and complement.
pub fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn checksum(data: &[u8]) -> u16 {
    finish(ones_complement_sum(data, 0))
}

/// Sum of the IPv4 or IPv6 pseudo header used by TCP, UDP and ICMPv6.
pub fn pseudo_header_sum(src: IpAddr, dst: IpAddr, protocol: u8, length: usize) -> u32 {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut sum = ones_complement_sum(&s.octets(), 0);
            sum = ones_complement_sum(&d.octets(), sum);
            sum = sum.wrapping_add(protocol as u32);
            sum.wrapping_add(length as u32 & 0xffff)
        }
        _ => {
            let mut sum = ones_complement_sum(&ip_octets(src), 0);
            sum = ones_complement_sum(&ip_octets(dst), sum);
            sum = ones_complement_sum(&(length as u32).to_be_bytes(), sum);
            sum.wrapping_add(protocol as u32)
        }
    }
}

/// Checksum of a transport segment including its pseudo header.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    finish(ones_complement_sum(
        segment,
        pseudo_header_sum(src, dst, protocol, segment.len()),
    ))
}

/// 16-byte form of an address, mapping IPv4 into `::ffff:a.b.c.d`.
pub fn ip_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
