//! L2: mac learning, unicast forwarding and broadcast.

use log::{error, trace};
use rust_vswitch_common::packet::arp::{ARP_OPCODE_REPLY, ARP_OPCODE_REQUEST};
use rust_vswitch_common::packet::icmp::{
    ICMPV6_OPTION_SOURCE_LINK_LAYER_ADDRESS, ICMPV6_OPTION_TARGET_LINK_LAYER_ADDRESS,
};
use rust_vswitch_common::packet::EtherPayload;
use rust_vswitch_common::types::MacAddress;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::context::{IfaceId, IfaceRef, SwitchContext};
use crate::l3;
use crate::skb::SocketBuffer;

/// A frame received from an interface, or re-injected into a table by routing.
pub(crate) fn input(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    trace!("{} L2.input {:?}", skb.handling_id, skb);
    let now = ctx.now;
    let Some(table) = ctx.tables.get_mut(&skb.vni) else {
        trace!("{} table {} not found, drop", skb.handling_id, skb.vni);
        return;
    };

    match &skb.devin {
        Some(devin) => table.mac_table.record(skb.pkt.src, devin, now),
        None => trace!("{} no iface provided with this packet", skb.handling_id),
    }

    update_arp_table(ctx, skb);

    let dst = skb.pkt.dst;
    if !dst.is_unicast() {
        send_broadcast(ctx, skb);
        broadcast_local(ctx, skb);
        return;
    }

    let Some(table) = ctx.tables.get_mut(&skb.vni) else {
        return;
    };
    let ips = table.ips.lookup_by_mac(&dst);
    if !ips.is_empty() {
        skb.matched_ips = ips;
        l3::input(ctx, skb);
        return;
    }
    trace!("{} no synthetic ip found", skb.handling_id);
    if let Some(iface) = table.mac_table.lookup(&dst, now) {
        send_packet(ctx, skb, &iface);
        return;
    }
    trace!("{} dst {} not recorded in mac table, drop", skb.handling_id, dst);
    ctx.metrics.frames_dropped.increment();
}

/// A frame generated by this switch. Real interfaces are tried before
/// synthetic ips.
pub(crate) fn output(ctx: &mut SwitchContext, skb: &mut SocketBuffer) {
    trace!("{} L2.output {:?}", skb.handling_id, skb);
    let now = ctx.now;
    let dst = skb.pkt.dst;
    if !dst.is_unicast() {
        send_broadcast(ctx, skb);
        broadcast_local(ctx, skb);
        return;
    }

    let Some(table) = ctx.tables.get_mut(&skb.vni) else {
        return;
    };
    if let Some(iface) = table.mac_table.lookup(&dst, now) {
        send_packet(ctx, skb, &iface);
        return;
    }
    trace!("{} dst {} not recorded in mac table", skb.handling_id, dst);
    let ips = table.ips.lookup_by_mac(&dst);
    if !ips.is_empty() {
        skb.matched_ips = ips;
        l3::input(ctx, skb);
        return;
    }
    trace!("{} no synthetic ip found, drop", skb.handling_id);
    ctx.metrics.frames_dropped.increment();
}

fn send_packet(ctx: &SwitchContext, skb: &SocketBuffer, iface: &IfaceRef) {
    trace!("{} send to {:?}", skb.handling_id, iface);
    ctx.send_frame(&skb.to_vxlan_bytes(), iface);
}

/// Refresh the arp table from ARP and NDP payloads passing through.
fn update_arp_table(ctx: &mut SwitchContext, skb: &SocketBuffer) {
    let now = ctx.now;
    let Some(table) = ctx.tables.get_mut(&skb.vni) else {
        return;
    };
    match &skb.pkt.packet {
        EtherPayload::Arp(arp) => {
            if !arp.is_ether_ip() {
                trace!("{} arp is not ethernet/ip", skb.handling_id);
                return;
            }
            if arp.opcode != ARP_OPCODE_REQUEST && arp.opcode != ARP_OPCODE_REPLY {
                trace!("{} arp is neither request nor reply", skb.handling_id);
                return;
            }
            let Some(sender) = arp.sender_ipv4() else {
                trace!("{} sender ip length is not 4", skb.handling_id);
                return;
            };
            if !table.v4network.contains(&sender) {
                trace!(
                    "{} got arp packet not allowed in the network: {} not in {}",
                    skb.handling_id,
                    sender,
                    table.v4network
                );
                return;
            }
            table.arp_table.record(skb.pkt.src, IpAddr::V4(sender), now);
        }
        EtherPayload::Ip(ip) => {
            let Some(icmp) = ip.icmp_packet() else {
                return;
            };
            if !icmp.is_neighbor_solicitation() && !icmp.is_neighbor_advertisement() {
                return;
            }
            let (Some(target), Some((opt_type, mac))) = (icmp.ndp_target(), icmp.ndp_link_layer_option()) else {
                trace!("{} ndp without a usable link layer option", skb.handling_id);
                return;
            };
            match opt_type {
                // the source may be a solicited node address, recording it does no harm
                ICMPV6_OPTION_SOURCE_LINK_LAYER_ADDRESS => table.arp_table.record(mac, ip.src, now),
                ICMPV6_OPTION_TARGET_LINK_LAYER_ADDRESS => table.arp_table.record(mac, IpAddr::V6(target), now),
                _ => trace!("{} unknown ndp option {}", skb.handling_id, opt_type),
            }
        }
        EtherPayload::Bytes(_) => {}
    }
}

/// Forward once to every interface known in the mac table and every
/// interface carrying this vni, skipping the inbound one.
fn send_broadcast(ctx: &mut SwitchContext, skb: &SocketBuffer) {
    let now = ctx.now;
    let Some(table) = ctx.tables.get_mut(&skb.vni) else {
        return;
    };
    let mut sent: HashSet<IfaceId> = HashSet::new();
    if let Some(devin) = &skb.devin {
        sent.insert(devin.id());
    }
    let mut targets: Vec<IfaceRef> = Vec::new();
    for entry in table.mac_table.list(now) {
        if sent.insert(entry.iface.id()) {
            targets.push(entry.iface);
        }
    }
    for iface in ctx.ifaces {
        if iface.local_side_vni(skb.vni) == skb.vni && sent.insert(iface.id()) {
            targets.push(iface.clone());
        }
    }
    if targets.is_empty() {
        return;
    }
    ctx.metrics.broadcasts.increment();
    let frame = skb.to_vxlan_bytes();
    for iface in &targets {
        trace!("{} broadcast to {:?}", skb.handling_id, iface);
        ctx.send_frame(&frame, iface);
    }
}

/// Hand a copy of the frame to each synthetic mac except the sender's own.
fn broadcast_local(ctx: &mut SwitchContext, skb: &SocketBuffer) {
    let Some(table) = ctx.tables.get(&skb.vni) else {
        return;
    };
    let deliveries: Vec<(MacAddress, Vec<IpAddr>)> = table
        .ips
        .all_macs()
        .into_iter()
        .filter(|mac| *mac != skb.pkt.src)
        .map(|mac| (mac, table.ips.lookup_by_mac(&mac)))
        .collect();
    if deliveries.is_empty() {
        trace!("{} not handled locally", skb.handling_id);
        return;
    }
    for (mac, ips) in deliveries {
        if ips.is_empty() {
            error!("should not happen: cannot find synthetic ips by mac {} in vpc {}", mac, skb.vni);
            continue;
        }
        trace!("{} broadcast to {:?}", skb.handling_id, ips);
        let mut copy = skb.clone();
        copy.matched_ips = ips;
        l3::input(ctx, &mut copy);
    }
}
