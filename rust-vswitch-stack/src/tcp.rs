//! Per-connection TCP state: the state machine enum, the send and receive
//! queues and the conntrack record that owns them.
//!
//! Sequence numbers are `u32` and compared modulo 2^32.

use bytes::{Bytes, BytesMut};
use log::error;
use rand::Rng;
use rust_vswitch_common::packet::tcp::{seq_ge, seq_gt, seq_le, seq_lt};
use rust_vswitch_common::types::IpPort;
use std::collections::VecDeque;
use std::fmt;

use crate::conntrack::SocketPair;
use crate::timer::TimerId;

pub const WMEM_MAX: usize = 212_992;
pub const RMEM_MAX: usize = 212_992;
pub const SND_DEFAULT_MSS: u32 = 1360;
pub const RCV_MSS: u16 = 1360;
pub const RTO_MIN: u64 = 200;
pub const RTO_MAX: u64 = 120_000;
pub const DELAYED_ACK_TIMEOUT: u64 = 20;
/// The remote window is capped at this many MSS.
pub const MAX_REMOTE_WINDOW_MSS_DUP: u32 = 45;
pub const MAX_RETRANSMISSION_AFTER_CLOSING: u32 = 7;
/// Receive window scale advertised when the peer supports window scaling.
pub const RCV_WINDOW_SCALE: u32 = 64;

const TCP_SEQ_INIT_MIN: u32 = i32::MAX as u32 / 3;
const TCP_SEQ_RAND: u32 = i32::MAX as u32 / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// The local side has queued its FIN.
    pub fn fin_sent(self) -> bool {
        matches!(
            self,
            TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait
        )
    }

    /// The remote side has sent its FIN.
    pub fn remote_closed(self) -> bool {
        matches!(
            self,
            TcpState::CloseWait | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::Closed => "CLOSED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(s)
    }
}

/// A contiguous run of stream bytes starting at `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u32,
    pub data: Bytes,
}

impl Segment {
    pub fn new(seq: u32, data: Bytes) -> Self {
        Self { seq, data }
    }

    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }
}

/// Application callbacks for an accepted connection.
pub trait ConnectionHandler: Send {
    /// New in-order data is stored, or the remote side closed.
    fn readable(&mut self, pair: &SocketPair);

    /// Acknowledged data left the send queue.
    fn writable(&mut self, _pair: &SocketPair) {}

    /// The connection was removed from conntrack.
    fn destroyed(&mut self, _pair: &SocketPair) {}
}

/* ---------------------------------------------------------------- *
 * Sending queue
 * ---------------------------------------------------------------- */

#[derive(Debug)]
pub struct SendingQueue {
    q: VecDeque<Segment>,
    current_size: usize,
    latest_seq: u32,
    ack_seq: u32,
    fetch_seq: u32,
    window: u32,
    mss: u32,
    window_scale: u32,
    fin_acked: bool,
}

impl SendingQueue {
    pub fn new(seq: u32) -> Self {
        Self {
            q: VecDeque::new(),
            current_size: 0,
            latest_seq: seq,
            ack_seq: seq,
            fetch_seq: seq,
            window: 0,
            mss: SND_DEFAULT_MSS,
            window_scale: 1,
            fin_acked: false,
        }
    }

    pub fn init(&mut self, window: u32, mss: u32, window_scale: u32) {
        self.window = window.min(MAX_REMOTE_WINDOW_MSS_DUP * mss);
        self.mss = mss;
        self.window_scale = window_scale;
    }

    pub fn inc_all_seq(&mut self) {
        self.latest_seq = self.latest_seq.wrapping_add(1);
        self.ack_seq = self.ack_seq.wrapping_add(1);
        self.fetch_seq = self.fetch_seq.wrapping_add(1);
    }

    pub fn dec_all_seq(&mut self) {
        self.latest_seq = self.latest_seq.wrapping_sub(1);
        self.ack_seq = self.ack_seq.wrapping_sub(1);
        self.fetch_seq = self.fetch_seq.wrapping_sub(1);
    }

    pub fn has_more_space(&self) -> bool {
        self.current_size < WMEM_MAX
    }

    pub fn has_more_data(&self) -> bool {
        !self.q.is_empty()
    }

    /// Queue as much of `data` as the send buffer allows, in MSS-sized segments.
    pub fn write(&mut self, mut data: &[u8]) -> usize {
        let mut total = 0;
        while !data.is_empty() {
            let len = data
                .len()
                .min(self.mss as usize)
                .min(WMEM_MAX.saturating_sub(self.current_size));
            if len == 0 {
                break;
            }
            let seg = Segment::new(self.latest_seq, Bytes::copy_from_slice(&data[..len]));
            self.latest_seq = seg.end();
            self.current_size += len;
            self.q.push_back(seg);
            data = &data[len..];
            total += len;
        }
        total
    }

    /// Segments from the lowest unacked byte, at most one window of them, each at most one MSS.
    pub fn fetch(&mut self) -> Vec<Segment> {
        let mut ret = Vec::new();
        let mut total: u32 = 0;
        loop {
            let len = self.mss.min(self.window.saturating_sub(total));
            if len == 0 {
                break;
            }
            let begin = self.ack_seq.wrapping_add(total);
            match self.fetch0(begin, begin.wrapping_add(len)) {
                Some(seg) => {
                    total += seg.data.len() as u32;
                    ret.push(seg);
                }
                None => break,
            }
        }
        ret
    }

    fn fetch0(&mut self, begin: u32, end_exclusive: u32) -> Option<Segment> {
        let first = self.q.front()?;
        if seq_gt(first.seq, begin) {
            return None;
        }
        let mut arr = BytesMut::new();
        for s in &self.q {
            if seq_ge(s.seq, end_exclusive) {
                break;
            }
            if seq_le(s.end(), begin) {
                continue;
            }
            let from = if seq_lt(s.seq, begin) {
                begin.wrapping_sub(s.seq) as usize
            } else {
                0
            };
            let to = if seq_gt(s.end(), end_exclusive) {
                end_exclusive.wrapping_sub(s.seq) as usize
            } else {
                s.data.len()
            };
            arr.extend_from_slice(&s.data[from..to]);
        }
        if arr.is_empty() {
            return None;
        }
        let seg = Segment::new(begin, arr.freeze());
        self.fetch_seq = seg.end();
        Some(seg)
    }

    /// Apply an inbound ack. Returns true when queued data was released.
    pub fn ack(&mut self, mut seq: u32, window: u16, fin_sent: bool) -> bool {
        if self.fin_acked {
            return false;
        }
        self.window = (window as u32)
            .saturating_mul(self.window_scale)
            .min(MAX_REMOTE_WINDOW_MSS_DUP * self.mss);

        if fin_sent && seq == self.latest_seq.wrapping_add(1) {
            self.ack_seq = seq;
            self.fetch_seq = seq;
            self.fin_acked = true;
            let released = !self.q.is_empty();
            self.q.clear();
            self.current_size = 0;
            return released;
        }
        if seq_lt(self.latest_seq, seq) {
            // acking bytes never sent, clamp to what is queued
            match self.q.back() {
                Some(last) => seq = last.end(),
                None => return false,
            }
        }
        if seq_lt(self.ack_seq, seq) {
            self.ack_seq = seq;
            if seq_lt(self.fetch_seq, seq) {
                self.fetch_seq = seq;
            }
        }
        let mut released = false;
        while let Some(front) = self.q.front_mut() {
            if seq_le(front.end(), seq) {
                self.current_size -= front.data.len();
                self.q.pop_front();
                released = true;
            } else {
                if seq_gt(seq, front.seq) {
                    let cut = seq.wrapping_sub(front.seq) as usize;
                    self.current_size -= cut;
                    front.data = front.data.slice(cut..);
                    front.seq = seq;
                    released = true;
                }
                break;
            }
        }
        released
    }

    pub fn need_to_send_fin(&self, fin_sent: bool) -> bool {
        fin_sent && !self.fin_acked
    }

    pub fn fin_acked(&self) -> bool {
        self.fin_acked
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn latest_seq(&self) -> u32 {
        self.latest_seq
    }

    pub fn ack_seq(&self) -> u32 {
        self.ack_seq
    }

    pub fn fetch_seq(&self) -> u32 {
        self.fetch_seq
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn mss(&self) -> u32 {
        self.mss
    }

    pub fn window_scale(&self) -> u32 {
        self.window_scale
    }
}

/* ---------------------------------------------------------------- *
 * Receiving queue
 * ---------------------------------------------------------------- */

#[derive(Debug)]
pub struct ReceivingQueue {
    q: VecDeque<Segment>,
    current_size: usize,
    expecting_seq: u32,
    acked_seq: u32,
    window: usize,
    window_scale: u32,
}

impl ReceivingQueue {
    pub fn new(seq: u32) -> Self {
        Self {
            q: VecDeque::new(),
            current_size: 0,
            expecting_seq: seq,
            acked_seq: seq,
            window: RMEM_MAX,
            window_scale: RCV_WINDOW_SCALE,
        }
    }

    pub fn set_window_scale(&mut self, scale: u32) {
        self.window_scale = scale;
    }

    /// Consume the remote FIN.
    pub fn inc_expecting_seq(&mut self) {
        if self.acked_seq == self.expecting_seq {
            self.acked_seq = self.acked_seq.wrapping_add(1);
        }
        self.expecting_seq = self.expecting_seq.wrapping_add(1);
    }

    /// Store in-order data. Gaps and already received bytes are ignored.
    /// Returns true if new bytes were stored.
    pub fn store(&mut self, segment: Segment) -> bool {
        if self.current_size > RMEM_MAX {
            return false;
        }
        if seq_gt(segment.seq, self.expecting_seq) {
            // out of order segments are not buffered
            return false;
        }
        if seq_le(segment.end(), self.expecting_seq) {
            return false;
        }
        let mut data = segment.data;
        if seq_lt(segment.seq, self.expecting_seq) {
            let incr = self.expecting_seq.wrapping_sub(segment.seq) as usize;
            data = data.slice(incr..);
        }
        let len = data.len();
        self.q.push_back(Segment::new(self.expecting_seq, data));
        self.expecting_seq = self.expecting_seq.wrapping_add(len as u32);
        self.current_size += len;
        self.window = self.window.saturating_sub(len);
        true
    }

    /// Drain at most `max_len` bytes in order.
    pub fn read(&mut self, max_len: usize) -> Bytes {
        let mut out = BytesMut::new();
        while out.len() < max_len {
            let Some(front) = self.q.front_mut() else {
                break;
            };
            let want = max_len - out.len();
            if front.data.len() <= want {
                out.extend_from_slice(&front.data);
                self.current_size -= front.data.len();
                self.acked_seq = front.end();
                self.q.pop_front();
            } else {
                out.extend_from_slice(&front.data[..want]);
                self.current_size -= want;
                front.data = front.data.slice(want..);
                front.seq = front.seq.wrapping_add(want as u32);
                self.acked_seq = front.seq;
            }
        }
        out.freeze()
    }

    pub fn reset_window(&mut self) {
        self.window = RMEM_MAX - self.current_size.min(RMEM_MAX);
    }

    pub fn has_more_data_to_read(&self) -> bool {
        !self.q.is_empty()
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn expecting_seq(&self) -> u32 {
        self.expecting_seq
    }

    pub fn acked_seq(&self) -> u32 {
        self.acked_seq
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn window_scale(&self) -> u32 {
        self.window_scale
    }

    /// Window value for the wire, in units of the window scale.
    pub fn advertised_window(&self) -> u16 {
        (self.window / self.window_scale.max(1) as usize).min(u16::MAX as usize) as u16
    }
}

/* ---------------------------------------------------------------- *
 * Conntrack record
 * ---------------------------------------------------------------- */

pub struct TcpEntry {
    pub remote: IpPort,
    pub local: IpPort,
    state: TcpState,
    need_closing: bool,
    pub sending_queue: SendingQueue,
    pub receiving_queue: ReceivingQueue,
    pub retransmission_timer: Option<TimerId>,
    pub delayed_ack_timer: Option<TimerId>,
    /// Listener this entry is queued on. Cleared once accepted.
    parent: Option<IpPort>,
    handler: Option<Box<dyn ConnectionHandler>>,
}

impl TcpEntry {
    /// A passively opened connection. `syn_seq` is the sequence of the peer's SYN.
    pub fn new(parent: IpPort, remote: IpPort, local: IpPort, syn_seq: u32) -> Self {
        let isn = rand::thread_rng().gen_range(0..TCP_SEQ_RAND) + TCP_SEQ_INIT_MIN;
        Self {
            remote,
            local,
            state: TcpState::Closed,
            need_closing: false,
            sending_queue: SendingQueue::new(isn),
            receiving_queue: ReceivingQueue::new(syn_seq.wrapping_add(1)),
            retransmission_timer: None,
            delayed_ack_timer: None,
            parent: Some(parent),
            handler: None,
        }
    }

    pub fn pair(&self) -> SocketPair {
        SocketPair::new(self.remote, self.local)
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn set_state(&mut self, state: TcpState) {
        let old = self.state;
        log::trace!("tcp {} state changing: {} -> {}", self.pair(), old, state);
        self.state = state;
        if !old.remote_closed() && state.remote_closed() {
            self.fire_readable();
        }
    }

    pub fn parent(&self) -> Option<IpPort> {
        self.parent
    }

    pub fn set_connection_handler(&mut self, handler: Box<dyn ConnectionHandler>) {
        if self.handler.is_some() {
            error!("connection handler of {} is replaced", self.pair());
        }
        self.handler = Some(handler);
        self.parent = None;
    }

    pub(crate) fn clear_parent(&mut self) {
        self.parent = None;
    }

    pub fn require_closing(&self) -> bool {
        self.need_closing
    }

    pub fn do_close(&mut self) {
        self.need_closing = true;
    }

    /// Store inbound data and notify the handler.
    pub fn store(&mut self, segment: Segment) -> bool {
        if self.state.remote_closed() {
            error!("FIN received but {} is still storing data", self.pair());
            return false;
        }
        let stored = self.receiving_queue.store(segment);
        if stored {
            self.fire_readable();
        }
        stored
    }

    /// Feed an inbound ack into the sending queue and notify the handler.
    pub fn ack(&mut self, seq: u32, window: u16) {
        let fin_sent = self.state.fin_sent();
        if self.sending_queue.ack(seq, window, fin_sent) {
            let pair = self.pair();
            if let Some(h) = self.handler.as_mut() {
                h.writable(&pair);
            }
        }
    }

    pub fn need_to_send_fin(&self) -> bool {
        self.sending_queue.need_to_send_fin(self.state.fin_sent())
    }

    /// Mark closed and hand back the timers that must be cancelled.
    pub fn destroy(&mut self) -> Vec<TimerId> {
        self.state = TcpState::Closed;
        let timers = self
            .retransmission_timer
            .take()
            .into_iter()
            .chain(self.delayed_ack_timer.take())
            .collect();
        let pair = self.pair();
        if let Some(h) = self.handler.as_mut() {
            h.destroyed(&pair);
        }
        timers
    }

    fn fire_readable(&mut self) {
        let pair = self.pair();
        if let Some(h) = self.handler.as_mut() {
            h.readable(&pair);
        }
    }

    pub fn description(&self) -> String {
        match self.parent {
            Some(p) => format!("{},remote={},local={}", p, self.remote, self.local),
            None => format!("null,remote={},local={}", self.remote, self.local),
        }
    }
}

impl fmt::Debug for TcpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpEntry")
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("state", &self.state)
            .field("parent", &self.parent)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(seq: u32, window: u32, mss: u32) -> SendingQueue {
        let mut q = SendingQueue::new(seq);
        q.init(window, mss, 1);
        q
    }

    #[test]
    fn test_fetch_splits_by_mss_and_window() {
        let mut q = queue(1000, 250, 100);
        assert_eq!(q.write(&[7u8; 300]), 300);
        let segs = q.fetch();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].seq, 1000);
        assert_eq!(segs[1].seq, 1100);
        assert_eq!(segs[2].seq, 1200);
        assert_eq!(segs[2].data.len(), 50);
        assert_eq!(q.fetch_seq(), 1250);

        // fetch always restarts from the lowest unacked byte
        let again = q.fetch();
        assert_eq!(again[0].seq, 1000);
    }

    #[test]
    fn test_ack_releases_and_trims() {
        let mut q = queue(0, 1000, 100);
        q.write(&[1u8; 250]);
        q.fetch();
        assert!(q.ack(150, 1000, false));
        assert_eq!(q.ack_seq(), 150);
        assert_eq!(q.current_size(), 100);
        let segs = q.fetch();
        assert_eq!(segs[0].seq, 150);
        assert_eq!(segs.iter().map(|s| s.data.len()).sum::<usize>(), 100);
    }

    #[test]
    fn test_ack_beyond_latest_is_clamped() {
        let mut q = queue(10, 1000, 100);
        q.write(&[1u8; 20]);
        q.ack(500, 1000, false);
        assert_eq!(q.ack_seq(), 30);
        assert!(!q.has_more_data());
    }

    #[test]
    fn test_fin_ack() {
        let mut q = queue(10, 1000, 100);
        assert!(q.need_to_send_fin(true));
        q.ack(11, 1000, true);
        assert!(q.fin_acked());
        assert!(!q.need_to_send_fin(true));
    }

    #[test]
    fn test_remote_window_is_capped() {
        let mut q = queue(0, u32::MAX, 100);
        assert_eq!(q.window(), 4500);
        q.ack(0, 60_000, false);
        assert_eq!(q.window(), 4500);
    }

    #[test]
    fn test_write_respects_buffer_limit() {
        let mut q = queue(0, 1000, 1360);
        let big = vec![0u8; WMEM_MAX + 10];
        assert_eq!(q.write(&big), WMEM_MAX);
        assert!(!q.has_more_space());
        assert_eq!(q.write(b"x"), 0);
    }

    #[test]
    fn test_receive_in_order_and_overlap() {
        let mut r = ReceivingQueue::new(100);
        assert!(r.store(Segment::new(100, Bytes::from_static(b"hello"))));
        // overlap: only "world" is new
        assert!(r.store(Segment::new(103, Bytes::from_static(b"loworld"))));
        // duplicate
        assert!(!r.store(Segment::new(100, Bytes::from_static(b"hello"))));
        // gap
        assert!(!r.store(Segment::new(200, Bytes::from_static(b"zzz"))));
        assert_eq!(r.expecting_seq(), 110);
        assert_eq!(r.window(), RMEM_MAX - 10);

        assert_eq!(&r.read(7)[..], b"hellowo");
        assert_eq!(r.acked_seq(), 107);
        assert_eq!(&r.read(100)[..], b"rld");
        assert_eq!(r.acked_seq(), 110);
        r.reset_window();
        assert_eq!(r.window(), RMEM_MAX);
    }

    #[test]
    fn test_advertised_window_uses_scale() {
        let r = ReceivingQueue::new(0);
        assert_eq!(r.advertised_window(), (RMEM_MAX / 64) as u16);
    }

    #[test]
    fn test_state_flags() {
        assert!(TcpState::FinWait1.fin_sent());
        assert!(!TcpState::CloseWait.fin_sent());
        assert!(TcpState::CloseWait.remote_closed());
        assert!(TcpState::Closing.remote_closed() && TcpState::Closing.fin_sent());
    }
}
