mod common;

use bytes::Bytes;
use common::*;
use rust_vswitch_common::packet::arp::ARP_OPCODE_REQUEST;
use rust_vswitch_common::packet::tcp::{
    TCP_FLAGS_ACK, TCP_FLAGS_FIN, TCP_FLAGS_PSH, TCP_FLAGS_RST, TCP_FLAGS_SYN, TCP_OPTION_MSS,
    TCP_OPTION_WINDOW_SCALE,
};
use rust_vswitch_common::packet::{ArpPacket, EthernetPacket, IpPacket, TcpOption, TcpPacket, VxlanPacket};
use rust_vswitch_common::types::{IpPort, MacAddress, Millis};
use rust_vswitch_stack::conntrack::MAX_SYN_BACKLOG_SIZE;
use rust_vswitch_stack::tcp::{RTO_MAX, RTO_MIN};
use rust_vswitch_stack::{ConnectionHandler, NetworkStack, SocketPair, TcpState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const PORT: u16 = 80;
const PEER_PORT: u16 = 40000;
const PEER_ISN: u32 = 1000;

fn local() -> IpPort {
    IpPort::new(syn_ip(), PORT)
}

fn pair_from(port: u16) -> SocketPair {
    SocketPair::new(IpPort::new(host_ip(), port), local())
}

fn pair() -> SocketPair {
    pair_from(PEER_PORT)
}

fn segment(src_port: u16, seq: u32, ack: u32, flags: u8, data: &[u8]) -> Bytes {
    let mut tcp = TcpPacket::new(src_port, PORT, seq, ack, flags, 65535);
    tcp.data = Bytes::copy_from_slice(data);
    frame_of(tcp)
}

fn frame_of(tcp: TcpPacket) -> Bytes {
    let ip = IpPacket::tcp(host_ip(), syn_ip(), tcp);
    vxlan_frame(VNI, EthernetPacket::from_ip(HOST_MAC, SYN_MAC, ip))
}

fn tcp_of(frame: &VxlanPacket) -> TcpPacket {
    frame
        .packet
        .ip()
        .and_then(|ip| ip.tcp_packet())
        .cloned()
        .expect("not a tcp segment")
}

fn only_segment(host: &RecordingIface) -> TcpPacket {
    let sent = host.take();
    assert_eq!(sent.len(), 1, "expected exactly one frame: {:?}", sent);
    tcp_of(&sent[0])
}

struct Peer {
    stack: NetworkStack,
    host: Arc<RecordingIface>,
    accepted: Arc<AtomicUsize>,
}

/// A stack listening on 10.0.0.1:80 that already knows the host.
fn listening() -> Peer {
    let (mut stack, host) = setup();
    let arp = ArpPacket::new(
        ARP_OPCODE_REQUEST,
        HOST_MAC,
        "10.0.0.2".parse().unwrap(),
        MacAddress::ZERO,
        "10.0.0.1".parse().unwrap(),
    );
    let frame = vxlan_frame(VNI, EthernetPacket::from_arp(HOST_MAC, MacAddress::BROADCAST, arp));
    stack.input_vxlan(&frame, host.iface(), 0);
    host.clear();

    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    stack
        .listen(
            VNI,
            local(),
            Box::new(move |_local: &IpPort| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    Peer { stack, host, accepted }
}

impl Peer {
    fn send(&mut self, frame: Bytes, now: Millis) {
        self.stack.input_vxlan(&frame, self.host.iface(), now);
    }

    /// Complete a handshake and return our initial sequence number.
    fn establish(&mut self, now: Millis) -> u32 {
        let mut syn = TcpPacket::new(PEER_PORT, PORT, PEER_ISN, 0, TCP_FLAGS_SYN, 65535);
        syn.options.push(TcpOption::mss(1460));
        syn.options.push(TcpOption::window_scale(7));
        self.send(frame_of(syn), now);
        let syn_ack = only_segment(&self.host);
        let isn = syn_ack.seq_num;
        self.send(segment(PEER_PORT, PEER_ISN + 1, isn + 1, TCP_FLAGS_ACK, b""), now);
        assert!(self.host.take().is_empty());
        assert_eq!(self.stack.accept(VNI, &local()), Some(pair()));
        isn
    }
}

#[derive(Default)]
struct Events {
    readable: usize,
    writable: usize,
    destroyed: usize,
}

struct Recorder(Arc<Mutex<Events>>);

impl ConnectionHandler for Recorder {
    fn readable(&mut self, _pair: &SocketPair) {
        self.0.lock().unwrap().readable += 1;
    }

    fn writable(&mut self, _pair: &SocketPair) {
        self.0.lock().unwrap().writable += 1;
    }

    fn destroyed(&mut self, _pair: &SocketPair) {
        self.0.lock().unwrap().destroyed += 1;
    }
}

fn record_events(peer: &mut Peer) -> Arc<Mutex<Events>> {
    let events = Arc::new(Mutex::new(Events::default()));
    peer.stack
        .set_connection_handler(VNI, &pair(), Box::new(Recorder(events.clone())))
        .unwrap();
    events
}

#[test]
fn test_handshake() {
    let mut peer = listening();
    let mut syn = TcpPacket::new(PEER_PORT, PORT, PEER_ISN, 0, TCP_FLAGS_SYN, 65535);
    syn.options.push(TcpOption::mss(1460));
    syn.options.push(TcpOption::window_scale(7));
    peer.send(frame_of(syn), 0);

    let syn_ack = only_segment(&peer.host);
    assert_eq!(syn_ack.flags, TCP_FLAGS_SYN | TCP_FLAGS_ACK);
    assert_eq!(syn_ack.ack_num, PEER_ISN + 1);
    assert_eq!(syn_ack.window, 65535);
    assert_eq!((syn_ack.src_port, syn_ack.dst_port), (PORT, PEER_PORT));
    assert!(syn_ack.options.iter().any(|o| o.kind == TCP_OPTION_MSS));
    assert_eq!(syn_ack.window_scale(), Some(6));
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), Some(TcpState::SynReceived));
    assert_eq!(peer.stack.accept(VNI, &local()), None);
    assert_eq!(peer.stack.metrics().conntrack_entries.value(), 1);

    let isn = syn_ack.seq_num;
    peer.send(segment(PEER_PORT, PEER_ISN + 1, isn + 1, TCP_FLAGS_ACK, b""), 1);
    assert!(peer.host.take().is_empty());
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), Some(TcpState::Established));
    assert_eq!(peer.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(peer.stack.accept(VNI, &local()), Some(pair()));
    assert_eq!(peer.stack.accept(VNI, &local()), None);
    assert_eq!(peer.stack.metrics().tcp_connections_accepted.value(), 1);
}

#[test]
fn test_syn_without_window_scale_is_not_scaled() {
    let mut peer = listening();
    peer.send(segment(PEER_PORT, PEER_ISN, 0, TCP_FLAGS_SYN, b""), 0);
    let syn_ack = only_segment(&peer.host);
    assert!(!syn_ack.options.iter().any(|o| o.kind == TCP_OPTION_WINDOW_SCALE));
}

#[test]
fn test_retransmitted_syn_gets_the_same_syn_ack() {
    let mut peer = listening();
    peer.send(segment(PEER_PORT, PEER_ISN, 0, TCP_FLAGS_SYN, b""), 0);
    let first = only_segment(&peer.host);
    peer.send(segment(PEER_PORT, PEER_ISN, 0, TCP_FLAGS_SYN, b""), 1);
    let second = only_segment(&peer.host);
    assert_eq!(first.seq_num, second.seq_num);
    assert_eq!(second.flags, TCP_FLAGS_SYN | TCP_FLAGS_ACK);
    assert_eq!(peer.stack.metrics().conntrack_entries.value(), 1);
}

#[test]
fn test_wrong_ack_does_not_establish() {
    let mut peer = listening();
    peer.send(segment(PEER_PORT, PEER_ISN, 0, TCP_FLAGS_SYN, b""), 0);
    let isn = only_segment(&peer.host).seq_num;
    peer.send(segment(PEER_PORT, PEER_ISN + 1, isn + 5, TCP_FLAGS_ACK, b""), 1);
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), Some(TcpState::SynReceived));
}

#[test]
fn test_syn_to_closed_port_gets_port_unreachable() {
    let mut peer = listening();
    let mut syn = TcpPacket::new(PEER_PORT, 8080, PEER_ISN, 0, TCP_FLAGS_SYN, 65535);
    syn.options.push(TcpOption::mss(1460));
    peer.send(frame_of(syn), 0);
    let sent = peer.host.take();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].packet.ip().unwrap().icmp_packet().is_some());
}

#[test]
fn test_segment_without_connection_is_reset() {
    let mut peer = listening();
    peer.send(segment(PEER_PORT, 5000, 7777, TCP_FLAGS_ACK, b""), 0);
    let rst = only_segment(&peer.host);
    assert_eq!(rst.flags, TCP_FLAGS_RST);
    assert_eq!(rst.seq_num, 7777);

    peer.send(segment(PEER_PORT, 5000, 0, TCP_FLAGS_FIN, b"abc"), 1);
    let rst = only_segment(&peer.host);
    assert_eq!(rst.flags, TCP_FLAGS_RST | TCP_FLAGS_ACK);
    assert_eq!(rst.seq_num, 0);
    assert_eq!(rst.ack_num, 5000 + 3 + 1);

    // a reset is never answered
    peer.send(segment(PEER_PORT, 5000, 0, TCP_FLAGS_RST, b""), 2);
    assert!(peer.host.take().is_empty());
    assert_eq!(peer.stack.metrics().tcp_resets_sent.value(), 2);
}

#[test]
fn test_syn_backlog_is_bounded() {
    let mut peer = listening();
    for i in 0..MAX_SYN_BACKLOG_SIZE as u16 {
        peer.send(segment(10000 + i, PEER_ISN, 0, TCP_FLAGS_SYN, b""), 0);
    }
    let sent = peer.host.take();
    assert_eq!(sent.len(), MAX_SYN_BACKLOG_SIZE);
    assert!(sent.iter().all(|f| tcp_of(f).flags == TCP_FLAGS_SYN | TCP_FLAGS_ACK));

    peer.send(segment(20000, PEER_ISN, 0, TCP_FLAGS_SYN, b""), 1);
    let rst = only_segment(&peer.host);
    assert_eq!(rst.flags, TCP_FLAGS_RST | TCP_FLAGS_ACK);
    assert_eq!(rst.ack_num, PEER_ISN + 1);
    assert_eq!(peer.stack.tcp_state(VNI, &pair_from(20000)), None);
    assert_eq!(
        peer.stack.table(VNI).unwrap().conntrack.count_tcp_entries(),
        MAX_SYN_BACKLOG_SIZE
    );
}

#[test]
fn test_data_is_stored_once_and_acked_late() {
    let mut peer = listening();
    let isn = peer.establish(0);
    let events = record_events(&mut peer);

    let data = segment(PEER_PORT, PEER_ISN + 1, isn + 1, TCP_FLAGS_PSH | TCP_FLAGS_ACK, b"hello");
    peer.send(data.clone(), 10);
    assert!(peer.host.take().is_empty());
    assert_eq!(events.lock().unwrap().readable, 1);

    // duplicate delivery changes nothing
    peer.send(data, 11);
    assert_eq!(events.lock().unwrap().readable, 1);

    assert_eq!(peer.stack.next_timer_deadline(), Some(30));
    assert_eq!(peer.stack.tick(30), 1);
    let ack = only_segment(&peer.host);
    assert_eq!(ack.flags, TCP_FLAGS_ACK);
    assert_eq!(ack.ack_num, PEER_ISN + 1 + 5);
    assert_eq!(ack.seq_num, isn + 1);

    let read = peer.stack.tcp_read(VNI, &pair(), 100, 40).unwrap();
    assert_eq!(&read[..], b"hello");
    let read = peer.stack.tcp_read(VNI, &pair(), 100, 41).unwrap();
    assert!(read.is_empty());
}

#[test]
fn test_out_of_order_data_is_discarded() {
    let mut peer = listening();
    let isn = peer.establish(0);
    let events = record_events(&mut peer);
    peer.send(segment(PEER_PORT, PEER_ISN + 50, isn + 1, TCP_FLAGS_PSH | TCP_FLAGS_ACK, b"late"), 1);
    assert_eq!(events.lock().unwrap().readable, 0);
    assert_eq!(peer.stack.next_timer_deadline(), None);
}

#[test]
fn test_retransmission_backs_off_and_resets_on_progress() {
    let mut peer = listening();
    let isn = peer.establish(0);
    let events = record_events(&mut peer);

    assert_eq!(peer.stack.tcp_write(VNI, &pair(), b"world", 0).unwrap(), 5);
    let psh = only_segment(&peer.host);
    assert_eq!(psh.flags, TCP_FLAGS_PSH | TCP_FLAGS_ACK);
    assert_eq!(psh.seq_num, isn + 1);
    assert_eq!(&psh.data[..], b"world");
    assert_eq!(peer.stack.next_timer_deadline(), Some(RTO_MIN));

    peer.stack.tick(200);
    assert_eq!(only_segment(&peer.host).seq_num, isn + 1);
    assert_eq!(peer.stack.next_timer_deadline(), Some(600));

    peer.stack.tick(600);
    assert_eq!(only_segment(&peer.host).seq_num, isn + 1);
    assert_eq!(peer.stack.next_timer_deadline(), Some(1400));
    assert_eq!(peer.stack.metrics().tcp_retransmissions.value(), 2);

    // the peer acks three bytes
    peer.send(segment(PEER_PORT, PEER_ISN + 1, isn + 4, TCP_FLAGS_ACK, b""), 1000);
    assert!(peer.host.take().is_empty());
    assert_eq!(events.lock().unwrap().writable, 1);

    peer.stack.tick(1400);
    let rest = only_segment(&peer.host);
    assert_eq!(rest.seq_num, isn + 4);
    assert_eq!(&rest.data[..], b"ld");
    assert_eq!(peer.stack.next_timer_deadline(), Some(1600));
    assert_eq!(peer.stack.metrics().tcp_retransmissions.value(), 2);
}

#[test]
fn test_retransmission_timeout_is_capped() {
    let mut peer = listening();
    peer.establish(0);
    peer.stack.tcp_write(VNI, &pair(), b"x", 0).unwrap();
    let mut now = 0;
    let mut gaps = Vec::new();
    for _ in 0..14 {
        let next = peer.stack.next_timer_deadline().unwrap();
        gaps.push(next - now);
        now = next;
        peer.stack.tick(now);
    }
    assert_eq!(gaps[..3], [RTO_MIN, 2 * RTO_MIN, 4 * RTO_MIN]);
    assert_eq!(gaps.last(), Some(&RTO_MAX));
    assert_eq!(peer.stack.next_timer_deadline(), Some(now + RTO_MAX));
}

#[test]
fn test_write_needs_an_established_connection() {
    let mut peer = listening();
    peer.send(segment(PEER_PORT, PEER_ISN, 0, TCP_FLAGS_SYN, b""), 0);
    assert!(peer.stack.tcp_write(VNI, &pair(), b"early", 1).is_err());
}

#[test]
fn test_remote_close() {
    let mut peer = listening();
    let isn = peer.establish(0);
    let events = record_events(&mut peer);

    peer.send(segment(PEER_PORT, PEER_ISN + 1, isn + 1, TCP_FLAGS_FIN | TCP_FLAGS_ACK, b""), 1);
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), Some(TcpState::CloseWait));
    assert_eq!(events.lock().unwrap().readable, 1);
    peer.stack.tick(21);
    let ack = only_segment(&peer.host);
    assert_eq!(ack.ack_num, PEER_ISN + 2);

    // the same fin again is acked again
    peer.send(segment(PEER_PORT, PEER_ISN + 1, isn + 1, TCP_FLAGS_FIN | TCP_FLAGS_ACK, b""), 30);
    peer.stack.tick(50);
    assert_eq!(only_segment(&peer.host).ack_num, PEER_ISN + 2);
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), Some(TcpState::CloseWait));

    // we may still write, then close
    peer.stack.tcp_write(VNI, &pair(), b"bye", 60).unwrap();
    let psh = only_segment(&peer.host);
    assert_eq!(&psh.data[..], b"bye");
    peer.stack.tcp_close(VNI, &pair(), 61).unwrap();
    peer.send(segment(PEER_PORT, PEER_ISN + 2, isn + 4, TCP_FLAGS_ACK, b""), 70);
    peer.stack.tick(300);
    let rst = only_segment(&peer.host);
    assert_eq!(rst.flags, TCP_FLAGS_RST);
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), None);
    assert_eq!(events.lock().unwrap().destroyed, 1);
}

#[test]
fn test_local_shutdown_then_remote_fin() {
    let mut peer = listening();
    let isn = peer.establish(0);

    peer.stack.tcp_shutdown_output(VNI, &pair(), 1).unwrap();
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), Some(TcpState::FinWait1));
    let fin = only_segment(&peer.host);
    assert_eq!(fin.flags, TCP_FLAGS_FIN | TCP_FLAGS_ACK);
    assert_eq!(fin.seq_num, isn + 1);

    peer.send(segment(PEER_PORT, PEER_ISN + 1, isn + 2, TCP_FLAGS_ACK, b""), 2);
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), Some(TcpState::FinWait2));

    peer.send(segment(PEER_PORT, PEER_ISN + 1, isn + 2, TCP_FLAGS_FIN | TCP_FLAGS_ACK, b""), 3);
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), Some(TcpState::Closing));
    let rst = only_segment(&peer.host);
    assert_eq!(rst.flags, TCP_FLAGS_RST);
    assert_eq!(rst.seq_num, isn + 2);
}

#[test]
fn test_close_without_pending_data_resets() {
    let mut peer = listening();
    peer.establish(0);
    peer.stack.tcp_close(VNI, &pair(), 1).unwrap();
    let rst = only_segment(&peer.host);
    assert_eq!(rst.flags, TCP_FLAGS_RST);
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), None);
    assert_eq!(peer.stack.metrics().conntrack_entries.value(), 0);
    assert!(peer.stack.tcp_close(VNI, &pair(), 2).is_err());
}

#[test]
fn test_inbound_reset_destroys_connection() {
    let mut peer = listening();
    let isn = peer.establish(0);
    peer.stack.tcp_write(VNI, &pair(), b"pending", 1).unwrap();
    peer.host.clear();
    peer.send(segment(PEER_PORT, PEER_ISN + 1, isn + 1, TCP_FLAGS_RST, b""), 2);
    assert_eq!(peer.stack.tcp_state(VNI, &pair()), None);
    assert_eq!(peer.stack.next_timer_deadline(), None);
    assert!(peer.host.take().is_empty());
}

#[test]
fn test_removing_table_drops_connections() {
    let mut peer = listening();
    peer.establish(0);
    peer.stack.tcp_write(VNI, &pair(), b"pending", 1).unwrap();
    let table = peer.stack.remove_table(VNI).unwrap();
    assert_eq!(table.conntrack.count_tcp_entries(), 0);
    assert!(peer.stack.event_loop().is_empty());
    assert_eq!(peer.stack.metrics().conntrack_entries.value(), 0);
}
