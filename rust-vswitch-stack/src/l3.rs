//! L3: ARP and NDP responder, ICMP, routing between tables, and address
//! resolution.
//!
//! Inbound frames arrive here from L2 when their destination mac belongs to
//! a synthetic IP (`skb.matched_ips` holds the IPs owning that mac), or as a
//! per-synthetic-mac copy of a broadcast. Packets built by L4 enter through
//! [`output`].

use bytes::{BufMut, BytesMut};
use log::{error, trace};
use rust_vswitch_common::packet::arp::{ARP_OPCODE_REPLY, ARP_OPCODE_REQUEST};
use rust_vswitch_common::packet::icmp::{
    solicited_node_multicast, ICMPV6_DESTINATION_UNREACHABLE, ICMPV6_ECHO_REPLY, ICMPV6_PORT_UNREACHABLE_CODE,
    ICMPV6_TIME_EXCEEDED, ICMP_DESTINATION_UNREACHABLE, ICMP_ECHO_REPLY, ICMP_PORT_UNREACHABLE_CODE,
    ICMP_TIME_EXCEEDED,
};
use rust_vswitch_common::packet::ip::{IP_PROTOCOL_SCTP, IP_PROTOCOL_TCP, IP_PROTOCOL_UDP};
use rust_vswitch_common::packet::{ArpPacket, EtherPayload, EthernetPacket, IcmpPacket, IpPacket};
use rust_vswitch_common::types::{MacAddress, Vni};
use std::net::{IpAddr, Ipv6Addr};

use crate::context::SwitchContext;
use crate::l2;
use crate::l4;
use crate::route::RouteTarget;
use crate::skb::SocketBuffer;
use crate::table::Table;

/// Bytes of the offending datagram quoted after its IP header in ICMP errors.
const ICMP_ERROR_QUOTE_LEN: usize = 64;
const NDP_HOP_LIMIT: u8 = 255;

pub(crate) fn input(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    trace!("{} L3.input", skb.handling_id);
    let is_arp = matches!(skb.pkt.packet, EtherPayload::Arp(_));
    let is_ip = matches!(skb.pkt.packet, EtherPayload::Ip(_));
    if skb.pkt.dst.is_unicast() {
        if is_arp {
            handle_arp(ctx, skb);
        } else if is_ip {
            handle_unicast_ip(ctx, skb);
        } else {
            trace!("{} unknown ether type {:#06x}, drop", skb.handling_id, skb.pkt.ether_type);
        }
        return;
    }
    let is_ns = skb
        .pkt
        .ip()
        .and_then(|ip| ip.icmp_packet())
        .map_or(false, |icmp| icmp.is_neighbor_solicitation());
    if is_arp {
        handle_arp(ctx, skb);
    } else if is_ns {
        handle_neighbor_solicitation(ctx, skb);
    } else {
        trace!("{} broadcast packet not handled in L3", skb.handling_id);
    }
}

/* ---------------------------------------------------------------- *
 * Responders
 * ---------------------------------------------------------------- */

fn handle_arp(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    let Some(arp) = skb.pkt.arp() else {
        return;
    };
    if !arp.is_ether_ip() || arp.opcode != ARP_OPCODE_REQUEST {
        trace!("{} not an ethernet/ip arp request, drop", skb.handling_id);
        return;
    }
    let (Some(target), Some(requester_ip), Some(requester_mac)) =
        (arp.target_ipv4(), arp.sender_ipv4(), arp.sender_mac_address())
    else {
        trace!("{} malformed arp request, drop", skb.handling_id);
        return;
    };
    if !skb.matched_ips.contains(&IpAddr::V4(target)) {
        trace!("{} arp target {} is not ours", skb.handling_id, target);
        return;
    }
    let Some(mac) = ctx.table(skb.vni).and_then(|t| t.ips.lookup(&IpAddr::V4(target))) else {
        error!("should not happen: synthetic ip {} has no mac", target);
        return;
    };
    let reply = ArpPacket::new(ARP_OPCODE_REPLY, mac, target, requester_mac, requester_ip);
    let ether = EthernetPacket::from_arp(mac, skb.pkt.src, reply);
    skb.replace_packet(ether);
    ctx.metrics.arp_replies.increment();
    l2::output(ctx, skb);
}

fn handle_neighbor_solicitation(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    let Some(ip) = skb.pkt.ip() else {
        return;
    };
    let Some(icmp) = ip.icmp_packet() else {
        return;
    };
    if ip.is_v4() || !icmp.is_neighbor_solicitation() {
        return;
    }
    let Some(target) = icmp.ndp_target() else {
        trace!("{} truncated neighbor solicitation, drop", skb.handling_id);
        return;
    };
    let requester = ip.src;
    if requester.is_unspecified() {
        trace!("{} duplicate address detection probe, ignored", skb.handling_id);
        return;
    }
    let target_ip = IpAddr::V6(target);
    if !skb.matched_ips.contains(&target_ip) {
        trace!("{} ns target {} is not ours", skb.handling_id, target);
        return;
    }
    let Some(mac) = ctx.table(skb.vni).and_then(|t| t.ips.lookup(&target_ip)) else {
        error!("should not happen: synthetic ip {} has no mac", target);
        return;
    };
    let na = IcmpPacket::neighbor_advertisement(target, mac);
    let mut reply = IpPacket::icmp(target_ip, requester, na);
    reply.hop_limit = NDP_HOP_LIMIT;
    let ether = EthernetPacket::from_ip(mac, skb.pkt.src, reply);
    skb.replace_packet(ether);
    ctx.metrics.ndp_advertisements.increment();
    l2::output(ctx, skb);
}

enum UnicastAction {
    Route,
    Ping,
    NeighborSolicitation,
    Transport,
    Drop(&'static str),
}

fn handle_unicast_ip(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    let Some(ip) = skb.pkt.ip() else {
        return;
    };
    let action = if !skb.matched_ips.contains(&ip.dst) {
        UnicastAction::Route
    } else if let Some(icmp) = ip.icmp_packet() {
        if icmp.is_v6 == ip.is_v4() {
            UnicastAction::Drop("icmp version does not match ip version")
        } else if icmp.is_echo_request() {
            UnicastAction::Ping
        } else if icmp.is_neighbor_solicitation() {
            UnicastAction::NeighborSolicitation
        } else {
            UnicastAction::Drop("unsupported icmp type")
        }
    } else {
        match ip.protocol {
            IP_PROTOCOL_TCP if ip.tcp_packet().is_none() => UnicastAction::Drop("malformed tcp segment"),
            IP_PROTOCOL_TCP | IP_PROTOCOL_UDP | IP_PROTOCOL_SCTP => UnicastAction::Transport,
            _ => UnicastAction::Drop("unsupported ip protocol"),
        }
    };

    match action {
        UnicastAction::Route => route(ctx, skb),
        UnicastAction::Ping => handle_icmp_ping(ctx, skb),
        UnicastAction::NeighborSolicitation => handle_neighbor_solicitation(ctx, skb),
        UnicastAction::Transport => {
            if !l4::input(ctx, skb) {
                respond_icmp_port_unreachable(ctx, skb);
            }
        }
        UnicastAction::Drop(reason) => {
            trace!("{} {}, drop", skb.handling_id, reason);
        }
    }
}

fn handle_icmp_ping(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    let Some(ip) = skb.pkt.ip() else {
        return;
    };
    let Some(icmp) = ip.icmp_packet() else {
        return;
    };
    let reply_type = if icmp.is_v6 {
        ICMPV6_ECHO_REPLY
    } else {
        ICMP_ECHO_REPLY
    };
    let pong = IcmpPacket::new(icmp.is_v6, reply_type, 0, icmp.other.clone());
    let reply = IpPacket::icmp(ip.dst, ip.src, pong);
    let Some(mac) = ctx.table(skb.vni).and_then(|t| t.ips.lookup(&ip.dst)) else {
        error!("should not happen: synthetic ip {} has no mac", ip.dst);
        return;
    };
    let ether = EthernetPacket::from_ip(mac, skb.pkt.src, reply);
    skb.replace_packet(ether);
    ctx.metrics.icmp_echo_replies.increment();
    route_output(ctx, skb);
}

/// The unused word followed by the original IP header and the start of its payload.
fn icmp_error_body(original: &IpPacket) -> BytesMut {
    let bytes = original.to_bytes();
    let quote = bytes.len().min(original.header_len() + ICMP_ERROR_QUOTE_LEN);
    let mut body = BytesMut::with_capacity(4 + quote);
    body.put_u32(0);
    body.put_slice(&bytes[..quote]);
    body
}

fn is_icmp_error(ip: &IpPacket) -> bool {
    match ip.icmp_packet() {
        Some(icmp) if icmp.is_v6 => {
            icmp.icmp_type == ICMPV6_DESTINATION_UNREACHABLE || icmp.icmp_type == ICMPV6_TIME_EXCEEDED
        }
        Some(icmp) => icmp.icmp_type == ICMP_DESTINATION_UNREACHABLE || icmp.icmp_type == ICMP_TIME_EXCEEDED,
        None => false,
    }
}

fn respond_icmp_port_unreachable(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    let Some(ip) = skb.pkt.ip() else {
        return;
    };
    let (icmp_type, code) = if ip.is_v4() {
        (ICMP_DESTINATION_UNREACHABLE, ICMP_PORT_UNREACHABLE_CODE)
    } else {
        (ICMPV6_DESTINATION_UNREACHABLE, ICMPV6_PORT_UNREACHABLE_CODE)
    };
    let icmp = IcmpPacket::new(!ip.is_v4(), icmp_type, code, icmp_error_body(ip));
    let reply = IpPacket::icmp(ip.dst, ip.src, icmp);
    let Some(mac) = ctx.table(skb.vni).and_then(|t| t.ips.lookup(&ip.dst)) else {
        error!("should not happen: synthetic ip {} has no mac", ip.dst);
        return;
    };
    trace!("{} port unreachable for {}", skb.handling_id, ip.description());
    let ether = EthernetPacket::from_ip(mac, skb.pkt.src, reply);
    skb.replace_packet(ether);
    ctx.metrics.icmp_errors_sent.increment();
    route_output(ctx, skb);
}

fn respond_icmp_time_exceeded(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    let Some(ip) = skb.pkt.ip() else {
        return;
    };
    if is_icmp_error(ip) {
        trace!("{} hop limit of an icmp error exceeded, drop", skb.handling_id);
        return;
    }
    let Some(src) = ctx.table(skb.vni).and_then(|t| t.ips.first_of_family(&ip.src)) else {
        trace!("{} no synthetic ip to report time exceeded from", skb.handling_id);
        return;
    };
    let (src_ip, src_mac) = (src.ip, src.mac);
    let icmp_type = if ip.is_v4() {
        ICMP_TIME_EXCEEDED
    } else {
        ICMPV6_TIME_EXCEEDED
    };
    let icmp = IcmpPacket::new(!ip.is_v4(), icmp_type, 0, icmp_error_body(ip));
    let reply = IpPacket::icmp(src_ip, ip.src, icmp);
    let ether = EthernetPacket::from_ip(src_mac, skb.pkt.src, reply);
    skb.replace_packet(ether);
    ctx.metrics.icmp_errors_sent.increment();
    route_output(ctx, skb);
}

/* ---------------------------------------------------------------- *
 * Routing
 * ---------------------------------------------------------------- */

/// Mac of the first synthetic IP of `dst`'s family, used as the source of routed frames.
fn routed_src_mac(table: &Table, dst: &IpAddr) -> Option<MacAddress> {
    table.ips.first_of_family(dst).map(|e| e.mac)
}

/// Forward a packet that is not addressed to any of our synthetic IPs.
fn route(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    let now = ctx.now;
    let vni = skb.vni;
    skb.raw = None;
    let Some(ip) = skb.pkt.ip_mut() else {
        return;
    };
    if ip.hop_limit <= 1 {
        trace!("{} hop limit exceeded", skb.handling_id);
        respond_icmp_time_exceeded(ctx, skb);
        return;
    }
    ip.hop_limit -= 1;
    let dst = ip.dst;

    let Some(table) = ctx.tables.get_mut(&vni) else {
        return;
    };
    let Some(rule) = table.route_table.lookup(&dst).cloned() else {
        trace!("{} no route to {}, drop", skb.handling_id, dst);
        return;
    };
    trace!("{} route {} by rule {}", skb.handling_id, dst, rule);

    match rule.target {
        RouteTarget::Vni(to) if to == vni => {
            let Some(dst_mac) = table.lookup(&dst, now) else {
                trace!("{} mac of {} unknown, resolve it first", skb.handling_id, dst);
                resolve(ctx, vni, dst, None);
                return;
            };
            let Some(src_mac) = routed_src_mac(table, &dst) else {
                trace!("{} no synthetic ip of the family of {}, drop", skb.handling_id, dst);
                return;
            };
            skb.pkt.src = src_mac;
            skb.pkt.dst = dst_mac;
            l2::output(ctx, skb);
        }
        RouteTarget::Vni(to) => {
            let Some(target) = ctx.tables.get_mut(&to) else {
                trace!("{} target table {} not found, drop", skb.handling_id, to);
                return;
            };
            let Some(src_mac) = routed_src_mac(target, &dst) else {
                trace!("{} table {} has no synthetic ip to route with, drop", skb.handling_id, to);
                return;
            };
            let local_direct = target
                .route_table
                .lookup(&dst)
                .map_or(false, |r| r.is_local_direct(to));
            if !local_direct {
                // the target table routes it further
                skb.pkt.src = src_mac;
                skb.pkt.dst = src_mac;
                skb.set_table(to);
                route_output(ctx, skb);
                return;
            }
            let Some(dst_mac) = target.lookup(&dst, now) else {
                trace!("{} mac of {} in table {} unknown, resolve it first", skb.handling_id, dst, to);
                resolve(ctx, to, dst, None);
                return;
            };
            skb.pkt.src = src_mac;
            skb.pkt.dst = dst_mac;
            skb.set_table(to);
            l2::input(ctx, skb);
        }
        RouteTarget::Gateway(gateway) => {
            let Some(gateway_mac) = table.lookup(&gateway, now) else {
                trace!("{} mac of gateway {} unknown, resolve it first", skb.handling_id, gateway);
                resolve(ctx, vni, gateway, None);
                return;
            };
            let Some(src_mac) = routed_src_mac(table, &dst) else {
                trace!("{} no synthetic ip of the family of {}, drop", skb.handling_id, dst);
                return;
            };
            skb.pkt.src = src_mac;
            skb.pkt.dst = gateway_mac;
            l2::output(ctx, skb);
        }
    }
}

/// Send a locally generated frame, honoring routes that leave the table.
fn route_output(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    skb.raw = None;
    let now = ctx.now;
    let vni = skb.vni;
    let dst = match skb.pkt.ip() {
        Some(ip) if skb.pkt.dst.is_unicast() => ip.dst,
        _ => {
            l2::output(ctx, skb);
            return;
        }
    };
    let Some(table) = ctx.tables.get_mut(&vni) else {
        return;
    };
    let Some(rule) = table.route_table.lookup(&dst).cloned() else {
        l2::output(ctx, skb);
        return;
    };
    match rule.target {
        RouteTarget::Vni(to) if to == vni => l2::output(ctx, skb),
        RouteTarget::Vni(to) => {
            let Some(mac) = ctx.tables.get(&to).and_then(|t| routed_src_mac(t, &dst)) else {
                trace!("{} cannot route {} into table {}, drop", skb.handling_id, dst, to);
                return;
            };
            trace!("{} route output {} into table {}", skb.handling_id, dst, to);
            skb.pkt.src = mac;
            skb.pkt.dst = mac;
            skb.set_table(to);
            l2::input(ctx, skb);
        }
        RouteTarget::Gateway(gateway) => {
            let Some(gateway_mac) = table.lookup(&gateway, now) else {
                resolve(ctx, vni, gateway, None);
                return;
            };
            skb.pkt.dst = gateway_mac;
            l2::output(ctx, skb);
        }
    }
}

/// Emit an IP packet generated by L4 from one of table `vni`'s synthetic IPs.
pub(crate) fn output(ctx: &mut SwitchContext, vni: Vni, ip: IpPacket) {
    let now = ctx.now;
    let Some(table) = ctx.tables.get_mut(&vni) else {
        return;
    };
    let Some(src_mac) = table.ips.lookup(&ip.src) else {
        error!("should not happen: {} is not a synthetic ip of table {}", ip.src, vni);
        return;
    };
    let dst = ip.dst;
    let on_link = table
        .route_table
        .lookup(&dst)
        .map_or(true, |r| r.is_local_direct(vni));
    let dst_mac = if on_link {
        match table.lookup(&dst, now) {
            Some(mac) => mac,
            None => {
                trace!("mac of {} unknown, resolve it first", dst);
                resolve(ctx, vni, dst, None);
                return;
            }
        }
    } else {
        // rewritten by route_output
        MacAddress::ZERO
    };
    let ether = EthernetPacket::from_ip(src_mac, dst_mac, ip);
    let mut skb = SocketBuffer::from_ether(vni, ether, None);
    trace!("{} L3.output {}", skb.handling_id, skb.pkt.description());
    route_output(ctx, &mut skb);
}

/* ---------------------------------------------------------------- *
 * Address resolution
 * ---------------------------------------------------------------- */

/// Ask for the mac of `ip` in table `vni`: an ARP request for v4, a
/// neighbor solicitation for v6. When `known_mac` is still reachable the
/// request is unicast to it, otherwise it is broadcast.
pub(crate) fn resolve(ctx: &mut SwitchContext, vni: Vni, ip: IpAddr, known_mac: Option<MacAddress>) {
    let now = ctx.now;
    let Some(table) = ctx.tables.get_mut(&vni) else {
        return;
    };
    let unicast_mac = known_mac.filter(|mac| table.mac_table.lookup(mac, now).is_some());

    let ether = match ip {
        IpAddr::V4(target) => {
            let Some((src_ip, src_mac)) = table.ips.first_v4().and_then(|e| match e.ip {
                IpAddr::V4(v4) => Some((v4, e.mac)),
                IpAddr::V6(_) => None,
            }) else {
                trace!("table {} has no v4 synthetic ip to resolve {} from", vni, ip);
                return;
            };
            let arp = ArpPacket::new(ARP_OPCODE_REQUEST, src_mac, src_ip, MacAddress::ZERO, target);
            EthernetPacket::from_arp(src_mac, unicast_mac.unwrap_or(MacAddress::BROADCAST), arp)
        }
        IpAddr::V6(target) => {
            let Some((src_ip, src_mac)) = table.ips.first_v6().map(|e| (e.ip, e.mac)) else {
                trace!("table {} has no v6 synthetic ip to resolve {} from", vni, ip);
                return;
            };
            let ns = IcmpPacket::neighbor_solicitation(target, src_mac);
            let (dst_ip, dst_mac) = match unicast_mac {
                Some(mac) => (target, mac),
                None => {
                    let group = solicited_node_multicast(target);
                    (group, multicast_mac(group))
                }
            };
            let mut packet = IpPacket::icmp(src_ip, IpAddr::V6(dst_ip), ns);
            packet.hop_limit = NDP_HOP_LIMIT;
            EthernetPacket::from_ip(src_mac, dst_mac, packet)
        }
    };
    ctx.metrics.resolutions_requested.increment();
    let mut skb = SocketBuffer::from_ether(vni, ether, None);
    trace!("{} resolve {} in table {}", skb.handling_id, ip, vni);
    l2::output(ctx, &mut skb);
}

/// Ethernet multicast address `33:33:xx:xx:xx:xx` of an IPv6 multicast group.
fn multicast_mac(group: Ipv6Addr) -> MacAddress {
    let o = group.octets();
    MacAddress::new([0x33, 0x33, o[12], o[13], o[14], o[15]])
}
