//! Timer queue driving TCP retransmission and delayed ACK.
//!
//! Tasks are plain data keyed by connection identity, so cancelling a timer
//! is an explicit operation on its id rather than dropping a closure.

use rust_vswitch_common::types::{Millis, Vni};
use std::collections::{BTreeMap, HashMap};

use crate::conntrack::SocketPair;

pub type TimerId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTask {
    /// Retransmit unacked data (or the FIN) of a connection.
    Retransmit {
        vni: Vni,
        pair: SocketPair,
        /// First unacked sequence sent by the previous attempt.
        last_begin_seq: Option<u32>,
        count: u32,
    },
    DelayedAck {
        vni: Vni,
        pair: SocketPair,
    },
}

#[derive(Debug, Default)]
pub struct EventLoop {
    next_id: TimerId,
    queue: BTreeMap<(Millis, TimerId), TimerTask>,
    deadlines: HashMap<TimerId, Millis>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` to fire `timeout` ms after `now`.
    pub fn delay(&mut self, now: Millis, timeout: Millis, task: TimerTask) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = now.saturating_add(timeout);
        self.queue.insert((deadline, id), task);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Returns false when the timer already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.queue.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    pub fn deadline(&self, id: TimerId) -> Option<Millis> {
        self.deadlines.get(&id).copied()
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest task due at `now`, ties in scheduling order.
    pub fn pop_expired(&mut self, now: Millis) -> Option<(TimerId, TimerTask)> {
        let (&(deadline, id), _) = self.queue.iter().next()?;
        if deadline > now {
            return None;
        }
        let task = self.queue.remove(&(deadline, id))?;
        self.deadlines.remove(&id);
        Some((id, task))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_vswitch_common::types::IpPort;

    fn ack_task(port: u16) -> TimerTask {
        let ip = "10.0.0.1".parse().unwrap();
        TimerTask::DelayedAck {
            vni: 1,
            pair: SocketPair::new(IpPort::new(ip, port), IpPort::new(ip, 80)),
        }
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let mut el = EventLoop::new();
        el.delay(0, 50, ack_task(2));
        el.delay(0, 20, ack_task(1));
        el.delay(10, 40, ack_task(3));

        assert_eq!(el.next_deadline(), Some(20));
        assert!(el.pop_expired(19).is_none());
        assert_eq!(el.pop_expired(100).unwrap().1, ack_task(1));
        // same deadline: scheduling order wins
        assert_eq!(el.pop_expired(100).unwrap().1, ack_task(2));
        assert_eq!(el.pop_expired(100).unwrap().1, ack_task(3));
        assert!(el.is_empty());
    }

    #[test]
    fn test_cancel() {
        let mut el = EventLoop::new();
        let id = el.delay(0, 20, ack_task(1));
        assert!(el.is_scheduled(id));
        assert_eq!(el.deadline(id), Some(20));
        assert!(el.cancel(id));
        assert!(!el.cancel(id));
        assert!(el.pop_expired(1000).is_none());
    }
}
