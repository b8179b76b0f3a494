//! TCP echo service on the configured listeners.
//!
//! Stack callbacks only push an [`AppEvent`] into a channel. The daemon
//! drains the channel after every call into the stack, so the echo logic
//! never runs while the stack is borrowed.

use bytes::{Buf, BytesMut};
use log::{debug, warn};
use rust_vswitch_common::types::{IpPort, Millis, Vni};
use rust_vswitch_stack::{ConnectionHandler, NetworkStack, SocketPair};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

const READ_CHUNK: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Accept { vni: Vni, local: IpPort },
    Readable { vni: Vni, pair: SocketPair },
    Writable { vni: Vni, pair: SocketPair },
    Destroyed { vni: Vni, pair: SocketPair },
}

struct EchoConnection {
    vni: Vni,
    tx: UnboundedSender<AppEvent>,
}

impl EchoConnection {
    fn send(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }
}

impl ConnectionHandler for EchoConnection {
    fn readable(&mut self, pair: &SocketPair) {
        self.send(AppEvent::Readable { vni: self.vni, pair: *pair });
    }

    fn writable(&mut self, pair: &SocketPair) {
        self.send(AppEvent::Writable { vni: self.vni, pair: *pair });
    }

    fn destroyed(&mut self, pair: &SocketPair) {
        self.send(AppEvent::Destroyed { vni: self.vni, pair: *pair });
    }
}

pub struct EchoService {
    tx: UnboundedSender<AppEvent>,
    rx: UnboundedReceiver<AppEvent>,
    /// Read but not yet accepted by the send queue.
    pending: HashMap<(Vni, SocketPair), BytesMut>,
    closing: HashSet<(Vni, SocketPair)>,
}

impl Default for EchoService {
    fn default() -> Self {
        Self::new()
    }
}

impl EchoService {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            tx,
            rx,
            pending: HashMap::new(),
            closing: HashSet::new(),
        }
    }

    /// Start echoing on `local` of table `vni`.
    pub fn listen(&self, stack: &mut NetworkStack, vni: Vni, local: IpPort) -> rust_vswitch_stack::Result<()> {
        let tx = self.tx.clone();
        stack.listen(
            vni,
            local,
            Box::new(move |local: &IpPort| {
                let _ = tx.send(AppEvent::Accept { vni, local: *local });
            }),
        )
    }

    /// Number of connections currently tracked by the service.
    pub fn connections(&self) -> usize {
        self.pending.len()
    }

    /// Handle every queued event, including those raised while handling.
    pub fn drain(&mut self, stack: &mut NetworkStack, now: Millis) {
        while let Ok(event) = self.rx.try_recv() {
            self.handle(stack, event, now);
        }
    }

    fn handle(&mut self, stack: &mut NetworkStack, event: AppEvent, now: Millis) {
        match event {
            AppEvent::Accept { vni, local } => {
                while let Some(pair) = stack.accept(vni, &local) {
                    debug!("echo accepted {} in table {}", pair, vni);
                    let handler = EchoConnection { vni, tx: self.tx.clone() };
                    if let Err(e) = stack.set_connection_handler(vni, &pair, Box::new(handler)) {
                        warn!("echo cannot attach to {}: {}", pair, e);
                        continue;
                    }
                    self.pending.insert((vni, pair), BytesMut::new());
                    self.echo(stack, vni, pair, now);
                }
            }
            AppEvent::Readable { vni, pair } | AppEvent::Writable { vni, pair } => {
                self.echo(stack, vni, pair, now);
            }
            AppEvent::Destroyed { vni, pair } => {
                debug!("echo connection {} in table {} is gone", pair, vni);
                self.pending.remove(&(vni, pair));
                self.closing.remove(&(vni, pair));
            }
        }
    }

    fn echo(&mut self, stack: &mut NetworkStack, vni: Vni, pair: SocketPair, now: Millis) {
        let key = (vni, pair);
        if self.closing.contains(&key) {
            return;
        }
        let Some(buf) = self.pending.get_mut(&key) else {
            return;
        };
        loop {
            match stack.tcp_read(vni, &pair, READ_CHUNK, now) {
                Ok(data) if data.is_empty() => break,
                Ok(data) => buf.extend_from_slice(&data),
                Err(e) => {
                    debug!("echo read from {}: {}", pair, e);
                    return;
                }
            }
        }
        if !buf.is_empty() {
            match stack.tcp_write(vni, &pair, buf, now) {
                Ok(n) => buf.advance(n),
                Err(e) => {
                    debug!("echo write to {}: {}", pair, e);
                    return;
                }
            }
        }
        let remote_closed = stack.tcp_state(vni, &pair).map_or(false, |s| s.remote_closed());
        if remote_closed && buf.is_empty() {
            debug!("echo closes {}", pair);
            self.closing.insert(key);
            if let Err(e) = stack.tcp_close(vni, &pair, now) {
                debug!("echo close {}: {}", pair, e);
            }
        }
    }
}
