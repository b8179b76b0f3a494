//! L4: the passive TCP state machine.
//!
//! Segments reach this layer only when they are addressed to a synthetic IP.
//! Admission decides whether the segment belongs to a tracked connection,
//! opens a new one from a bare SYN, or must be answered with a reset.
//! Timers (retransmission and delayed ACK) are plain tasks on the
//! [`EventLoop`](crate::timer::EventLoop) and come back through [`on_timer`].

use log::{error, trace, warn};
use rust_vswitch_common::packet::tcp::{
    seq_gt, TcpOption, TcpPacket, TCP_FLAGS_ACK, TCP_FLAGS_FIN, TCP_FLAGS_PSH, TCP_FLAGS_RST, TCP_FLAGS_SYN,
};
use rust_vswitch_common::packet::IpPacket;
use rust_vswitch_common::types::{IpPort, Vni};
use std::collections::HashMap;

use crate::conntrack::SocketPair;
use crate::context::SwitchContext;
use crate::l3;
use crate::skb::SocketBuffer;
use crate::table::Table;
use crate::tcp::{
    Segment, TcpEntry, TcpState, DELAYED_ACK_TIMEOUT, MAX_RETRANSMISSION_AFTER_CLOSING, RCV_MSS, RTO_MAX, RTO_MIN,
    SND_DEFAULT_MSS,
};
use crate::timer::{TimerId, TimerTask};

/// Returns false when the segment is not for us and the caller should
/// answer port unreachable.
pub(crate) fn input(ctx: &mut SwitchContext, skb: &mut SocketBuffer) -> bool {
    trace!("{} L4.input", skb.handling_id);
    if !want_to_handle(ctx, skb) {
        return false;
    }
    if skb.need_tcp_reset {
        send_rst_from_segment(ctx, skb);
        return true;
    }
    if let Some(pair) = skb.tcp {
        handle_tcp(ctx, skb, pair);
    }
    true
}

fn want_to_handle(ctx: &mut SwitchContext, skb: &mut SocketBuffer) -> bool {
    let Some(ip) = skb.pkt.ip() else {
        return false;
    };
    let Some(tcp) = ip.tcp_packet() else {
        trace!("{} not a decoded tcp segment", skb.handling_id);
        return false;
    };
    let pair = SocketPair::new(IpPort::new(ip.src, tcp.src_port), IpPort::new(ip.dst, tcp.dst_port));
    let flags = tcp.flags;
    let syn_seq = tcp.seq_num;

    let Some(table) = ctx.tables.get_mut(&skb.vni) else {
        return false;
    };
    if table.conntrack.lookup_tcp(&pair.remote, &pair.local).is_some() {
        trace!("{} found tcp entry {}", skb.handling_id, pair);
        skb.tcp = Some(pair);
        return true;
    }
    if flags & TCP_FLAGS_RST != 0 {
        trace!("{} rst for unknown connection {}, ignored", skb.handling_id, pair);
        return true;
    }
    if flags == TCP_FLAGS_SYN {
        let Some(listen) = table.conntrack.lookup_listen(&pair.local) else {
            trace!("{} no listener for {}", skb.handling_id, pair.local);
            return false;
        };
        if listen.syn_backlog_full() {
            warn!("syn backlog of {} is full, reset {}", listen.local, pair);
            skb.need_tcp_reset = true;
            return true;
        }
        let listen_key = listen.local;
        table
            .conntrack
            .create_tcp(listen_key, pair.remote, pair.local, syn_seq);
        ctx.metrics.conntrack_entries.increment();
        skb.tcp = Some(pair);
        return true;
    }
    trace!("{} segment for unknown connection {}, will reset", skb.handling_id, pair);
    skb.need_tcp_reset = true;
    true
}

/// Reset built only from the received segment, usable without a tracked connection.
fn send_rst_from_segment(ctx: &mut SwitchContext, skb: &SocketBuffer) {
    let Some(ip) = skb.pkt.ip() else {
        return;
    };
    let Some(tcp) = ip.tcp_packet() else {
        return;
    };
    let rst = if tcp.is_ack() {
        TcpPacket::new(tcp.dst_port, tcp.src_port, tcp.ack_num, 0, TCP_FLAGS_RST, 0)
    } else {
        let mut len = tcp.data.len() as u32;
        if tcp.is_syn() {
            len += 1;
        }
        if tcp.is_fin() {
            len += 1;
        }
        TcpPacket::new(
            tcp.dst_port,
            tcp.src_port,
            0,
            tcp.seq_num.wrapping_add(len),
            TCP_FLAGS_RST | TCP_FLAGS_ACK,
            0,
        )
    };
    let reply = IpPacket::tcp(ip.dst, ip.src, rst);
    ctx.metrics.tcp_resets_sent.increment();
    l3::output(ctx, skb.vni, reply);
}

fn entry_mut<'t>(tables: &'t mut HashMap<Vni, Table>, vni: Vni, pair: &SocketPair) -> Option<&'t mut TcpEntry> {
    tables
        .get_mut(&vni)?
        .conntrack
        .lookup_tcp_mut(&pair.remote, &pair.local)
}

fn handle_tcp(ctx: &mut SwitchContext, skb: &SocketBuffer, pair: SocketPair) {
    let Some(tcp) = skb.pkt.ip().and_then(|ip| ip.tcp_packet()) else {
        return;
    };
    let vni = skb.vni;
    let Some(state) = entry_mut(ctx.tables, vni, &pair).map(|e| e.state()) else {
        return;
    };
    trace!("{} tcp {} in state {}: {}", skb.handling_id, pair, state, tcp.description());

    if tcp.is_rst() {
        trace!("{} rst received, destroy {}", skb.handling_id, pair);
        destroy(ctx, vni, &pair);
        return;
    }

    match state {
        TcpState::Closed => handle_closed(ctx, vni, &pair, tcp),
        TcpState::SynReceived => handle_syn_received(ctx, vni, &pair, tcp),
        TcpState::Established => handle_established(ctx, vni, &pair, tcp),
        TcpState::FinWait1 => handle_fin_wait1(ctx, skb, &pair, tcp),
        TcpState::FinWait2 => handle_fin_wait2(ctx, skb, &pair, tcp),
        TcpState::CloseWait => handle_close_wait(ctx, vni, &pair, tcp),
        TcpState::Closing => {
            if !general_discard(ctx, vni, &pair, tcp) {
                trace!("{} drop any packet when it's in CLOSING state", skb.handling_id);
            }
        }
        TcpState::SynSent | TcpState::LastAck | TcpState::TimeWait => {
            error!("should not happen: unsupported tcp state {} of {}", state, pair);
        }
    }
}

/* ---------------------------------------------------------------- *
 * Response builders
 * ---------------------------------------------------------------- */

fn common_response(e: &TcpEntry) -> TcpPacket {
    TcpPacket::new(
        e.local.port,
        e.remote.port,
        e.sending_queue.fetch_seq(),
        e.receiving_queue.expecting_seq(),
        TCP_FLAGS_ACK,
        e.receiving_queue.advertised_window(),
    )
}

fn syn_ack(e: &TcpEntry) -> TcpPacket {
    let mut tcp = common_response(e);
    tcp.flags = TCP_FLAGS_SYN | TCP_FLAGS_ACK;
    tcp.window = 65535;
    tcp.options.push(TcpOption::mss(RCV_MSS));
    let scale = e.receiving_queue.window_scale();
    if scale != 1 {
        tcp.options.push(TcpOption::window_scale(scale.trailing_zeros() as u8));
    }
    tcp
}

fn output_tcp(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair, tcp: TcpPacket) {
    let ip = IpPacket::tcp(pair.local.ip, pair.remote.ip, tcp);
    l3::output(ctx, vni, ip);
}

/* ---------------------------------------------------------------- *
 * States
 * ---------------------------------------------------------------- */

fn handle_closed(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair, tcp: &TcpPacket) {
    if tcp.flags != TCP_FLAGS_SYN {
        trace!("not SYN packet");
        return;
    }
    let Some(e) = entry_mut(ctx.tables, vni, pair) else {
        return;
    };
    e.set_state(TcpState::SynReceived);

    let mss = tcp.mss().map(u32::from).unwrap_or(SND_DEFAULT_MSS);
    let window_scale = match tcp.window_scale() {
        Some(shift) => 1u32 << shift,
        None => {
            // the peer cannot scale, so we must not either
            e.receiving_queue.set_window_scale(1);
            1
        }
    };
    e.sending_queue.init(tcp.window as u32, mss, window_scale);

    let reply = syn_ack(e);
    e.sending_queue.inc_all_seq();
    output_tcp(ctx, vni, pair, reply);
}

fn handle_syn_received(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair, tcp: &TcpPacket) {
    let Some(e) = entry_mut(ctx.tables, vni, pair) else {
        return;
    };
    if tcp.is_syn() {
        if tcp.seq_num == e.receiving_queue.acked_seq().wrapping_sub(1) {
            trace!("syn retransmission of {}", pair);
            e.sending_queue.dec_all_seq();
            let reply = syn_ack(e);
            e.sending_queue.inc_all_seq();
            output_tcp(ctx, vni, pair, reply);
        }
        return;
    }
    if !tcp.is_ack() {
        trace!("no ack flag set");
        return;
    }
    if tcp.ack_num != e.sending_queue.ack_seq() {
        trace!("wrong ack number {}, expecting {}", tcp.ack_num, e.sending_queue.ack_seq());
        return;
    }
    connection_establishes(ctx, vni, pair);
    handle_established(ctx, vni, pair, tcp);
}

fn connection_establishes(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair) {
    let Some(table) = ctx.tables.get_mut(&vni) else {
        return;
    };
    let Some(e) = table.conntrack.lookup_tcp_mut(&pair.remote, &pair.local) else {
        return;
    };
    e.set_state(TcpState::Established);
    ctx.metrics.tcp_connections_accepted.increment();
    match e.parent() {
        Some(parent) => match table.conntrack.listen_entry_mut(&parent) {
            Some(listen) => listen.established(*pair),
            None => warn!("listener {} of {} is gone", parent, pair),
        },
        None => error!("should not happen: {} has no listener while establishing", pair),
    }
}

/// Validation shared by the synchronized states. Returns true when the
/// segment must be discarded.
fn general_discard(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair, tcp: &TcpPacket) -> bool {
    let Some(e) = entry_mut(ctx.tables, vni, pair) else {
        return true;
    };
    let seq = tcp.seq_num;
    let expect = e.receiving_queue.expecting_seq();
    if tcp.is_fin() {
        if seq != e.receiving_queue.acked_seq() {
            trace!("data not fully consumed yet but received FIN");
            return true;
        }
    } else if seq != expect {
        let has_data = tcp.is_psh() || !tcp.data.is_empty();
        if !has_data || seq_gt(seq, expect) {
            trace!("invalid sequence number {}, expecting {}", seq, expect);
            return true;
        }
    }
    if !tcp.is_ack() {
        return false;
    }
    e.ack(tcp.ack_num, tcp.window);
    // the ack may have opened the window
    if e.retransmission_timer.is_none() {
        start_retransmission(ctx, vni, pair);
    }
    false
}

fn handle_established(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair, tcp: &TcpPacket) {
    if general_discard(ctx, vni, pair, tcp) {
        return;
    }
    let Some(e) = entry_mut(ctx.tables, vni, pair) else {
        return;
    };
    let mut need_ack = false;
    if tcp.is_psh() || !tcp.data.is_empty() {
        e.store(Segment::new(tcp.seq_num, tcp.data.clone()));
        need_ack = true;
    }
    if tcp.is_fin() {
        e.set_state(TcpState::CloseWait);
        e.receiving_queue.inc_expecting_seq();
        need_ack = true;
    }
    if need_ack {
        tcp_ack(ctx, vni, pair);
    }
}

fn handle_fin_wait1(ctx: &mut SwitchContext, skb: &SocketBuffer, pair: &SocketPair, tcp: &TcpPacket) {
    let vni = skb.vni;
    if general_discard(ctx, vni, pair, tcp) {
        return;
    }
    let Some(e) = entry_mut(ctx.tables, vni, pair) else {
        return;
    };
    let fin_acked = e.sending_queue.fin_acked();
    if tcp.is_fin() {
        if fin_acked {
            trace!("transform to CLOSING");
            e.set_state(TcpState::Closing);
            send_rst_from_segment(ctx, skb);
        } else {
            trace!("received FIN but the previous sent FIN not acked");
        }
    } else if fin_acked {
        trace!("the sent FIN is acked, transform to FIN_WAIT_2");
        e.set_state(TcpState::FinWait2);
    }
}

fn handle_fin_wait2(ctx: &mut SwitchContext, skb: &SocketBuffer, pair: &SocketPair, tcp: &TcpPacket) {
    let vni = skb.vni;
    if general_discard(ctx, vni, pair, tcp) {
        return;
    }
    if tcp.is_fin() {
        if let Some(e) = entry_mut(ctx.tables, vni, pair) {
            trace!("transform to CLOSING");
            e.set_state(TcpState::Closing);
        }
        send_rst_from_segment(ctx, skb);
    }
}

fn handle_close_wait(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair, tcp: &TcpPacket) {
    if tcp.is_fin() {
        let retransmitted = entry_mut(ctx.tables, vni, pair)
            .map_or(false, |e| tcp.seq_num == e.receiving_queue.expecting_seq().wrapping_sub(1));
        if retransmitted {
            trace!("received FIN again, maybe it's retransmission");
            if tcp.is_ack() {
                if let Some(e) = entry_mut(ctx.tables, vni, pair) {
                    e.ack(tcp.ack_num, tcp.window);
                }
            }
            tcp_ack(ctx, vni, pair);
            return;
        }
    }
    general_discard(ctx, vni, pair, tcp);
}

/* ---------------------------------------------------------------- *
 * Acknowledgement
 * ---------------------------------------------------------------- */

/// Acknowledge received data, delayed unless the receive window is closed.
pub(crate) fn tcp_ack(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair) {
    let Some(e) = entry_mut(ctx.tables, vni, pair) else {
        return;
    };
    if e.receiving_queue.window() == 0 {
        trace!("no window, need to ack immediately");
        if let Some(id) = e.delayed_ack_timer.take() {
            ctx.event_loop.cancel(id);
        }
        send_ack(ctx, vni, pair);
        return;
    }
    if e.delayed_ack_timer.is_some() {
        trace!("delayed ack already scheduled");
        return;
    }
    let task = TimerTask::DelayedAck { vni, pair: *pair };
    e.delayed_ack_timer = Some(ctx.event_loop.delay(ctx.now, DELAYED_ACK_TIMEOUT, task));
}

fn send_ack(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair) {
    let Some(e) = entry_mut(ctx.tables, vni, pair) else {
        return;
    };
    if let Some(id) = e.delayed_ack_timer.take() {
        ctx.event_loop.cancel(id);
    }
    let ack = common_response(e);
    output_tcp(ctx, vni, pair, ack);
}

/* ---------------------------------------------------------------- *
 * Transmission
 * ---------------------------------------------------------------- */

fn rto(count: u32) -> u64 {
    if count >= 32 {
        RTO_MAX
    } else {
        (RTO_MIN << count).min(RTO_MAX)
    }
}

pub(crate) fn start_retransmission(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair) {
    transmit_tcp(ctx, vni, pair, None, 0);
}

enum Transmission {
    Reset,
    Idle { closing: bool },
    Send(Vec<TcpPacket>),
}

fn transmit_tcp(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair, last_begin_seq: Option<u32>, count: u32) {
    let Some(e) = entry_mut(ctx.tables, vni, pair) else {
        return;
    };
    if let Some(id) = e.retransmission_timer.take() {
        ctx.event_loop.cancel(id);
    }

    let plan = if e.require_closing() && count > MAX_RETRANSMISSION_AFTER_CLOSING {
        Transmission::Reset
    } else {
        let segments = e.sending_queue.fetch();
        if segments.is_empty() && !e.need_to_send_fin() {
            trace!("no need to retransmit after {} time(s)", count);
            Transmission::Idle {
                closing: e.require_closing(),
            }
        } else {
            let current_begin_seq = match segments.first() {
                Some(s) => s.seq,
                None => e.sending_queue.fetch_seq().wrapping_add(1),
            };
            let count = if last_begin_seq == Some(current_begin_seq) {
                count
            } else {
                0
            };
            let delay = rto(count);
            trace!("will delay {} ms then retransmit", delay);
            let task = TimerTask::Retransmit {
                vni,
                pair: *pair,
                last_begin_seq: Some(current_begin_seq),
                count: count + 1,
            };
            e.retransmission_timer = Some(ctx.event_loop.delay(ctx.now, delay, task));
            if count > 0 {
                ctx.metrics.tcp_retransmissions.increment();
            }

            let packets = if segments.is_empty() {
                let mut fin = common_response(e);
                fin.flags = TCP_FLAGS_FIN | TCP_FLAGS_ACK;
                vec![fin]
            } else {
                segments
                    .into_iter()
                    .map(|s| {
                        let mut psh = common_response(e);
                        psh.seq_num = s.seq;
                        psh.flags = TCP_FLAGS_PSH | TCP_FLAGS_ACK;
                        psh.data = s.data;
                        psh
                    })
                    .collect()
            };
            Transmission::Send(packets)
        }
    };

    match plan {
        Transmission::Reset => {
            warn!("conn {} is closed due to too many retransmission after closing", pair);
            reset_tcp_connection(ctx, vni, pair);
        }
        Transmission::Idle { closing } => {
            if closing {
                trace!("{} need to be closed", pair);
                reset_tcp_connection(ctx, vni, pair);
            }
        }
        Transmission::Send(packets) => {
            for p in packets {
                output_tcp(ctx, vni, pair, p);
            }
        }
    }
}

/// Send RST for a tracked connection and drop it.
pub(crate) fn reset_tcp_connection(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair) {
    let Some(e) = entry_mut(ctx.tables, vni, pair) else {
        return;
    };
    let mut rst = common_response(e);
    rst.flags = TCP_FLAGS_RST;
    ctx.metrics.tcp_resets_sent.increment();
    output_tcp(ctx, vni, pair, rst);
    destroy(ctx, vni, pair);
}

/// Remove a connection from conntrack and cancel its timers.
pub(crate) fn destroy(ctx: &mut SwitchContext, vni: Vni, pair: &SocketPair) {
    let Some(table) = ctx.tables.get_mut(&vni) else {
        return;
    };
    let Some(mut e) = table.conntrack.remove_tcp(&pair.remote, &pair.local) else {
        return;
    };
    for id in e.destroy() {
        ctx.event_loop.cancel(id);
    }
    ctx.metrics.conntrack_entries.decrement();
}

/// Run a fired timer. Stale timers of a replaced or closed connection are ignored.
pub(crate) fn on_timer(ctx: &mut SwitchContext, id: TimerId, task: TimerTask) {
    match task {
        TimerTask::Retransmit {
            vni,
            pair,
            last_begin_seq,
            count,
        } => {
            let Some(e) = entry_mut(ctx.tables, vni, &pair) else {
                return;
            };
            if e.retransmission_timer != Some(id) {
                trace!("stale retransmission timer {} of {}", id, pair);
                return;
            }
            e.retransmission_timer = None;
            transmit_tcp(ctx, vni, &pair, last_begin_seq, count);
        }
        TimerTask::DelayedAck { vni, pair } => {
            let Some(e) = entry_mut(ctx.tables, vni, &pair) else {
                return;
            };
            if e.delayed_ack_timer != Some(id) {
                trace!("stale delayed ack timer {} of {}", id, pair);
                return;
            }
            e.delayed_ack_timer = None;
            send_ack(ctx, vni, &pair);
        }
    }
}
