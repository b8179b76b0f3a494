//! Connection tracking: listening sockets with their backlogs, and the
//! TCP entries keyed by socket pair.

use log::error;
use rust_vswitch_common::types::IpPort;
use rust_vswitch_common::{Error, Result};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::tcp::TcpEntry;

/// Half-open connections a listener may hold before new SYNs are reset.
pub const MAX_SYN_BACKLOG_SIZE: usize = 128;

/// The two ends of a connection as seen from the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketPair {
    pub remote: IpPort,
    pub local: IpPort,
}

impl SocketPair {
    pub fn new(remote: IpPort, local: IpPort) -> Self {
        Self { remote, local }
    }
}

impl fmt::Display for SocketPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.remote, self.local)
    }
}

/// Notified when a listener's accept backlog gains a connection.
pub trait ListenHandler: Send {
    fn readable(&mut self, local: &IpPort);
}

impl<F> ListenHandler for F
where
    F: FnMut(&IpPort) + Send,
{
    fn readable(&mut self, local: &IpPort) {
        self(local)
    }
}

pub struct ListenEntry {
    pub local: IpPort,
    pub syn_backlog: Vec<SocketPair>,
    pub backlog: VecDeque<SocketPair>,
    handler: Box<dyn ListenHandler>,
}

impl ListenEntry {
    pub fn new(local: IpPort, handler: Box<dyn ListenHandler>) -> Self {
        Self {
            local,
            syn_backlog: Vec::new(),
            backlog: VecDeque::new(),
            handler,
        }
    }

    pub fn syn_backlog_full(&self) -> bool {
        self.syn_backlog.len() >= MAX_SYN_BACKLOG_SIZE
    }

    /// Move a connection whose handshake completed into the accept backlog.
    pub fn established(&mut self, pair: SocketPair) {
        self.syn_backlog.retain(|p| *p != pair);
        self.backlog.push_back(pair);
        let local = self.local;
        self.handler.readable(&local);
    }

    fn forget(&mut self, pair: &SocketPair) {
        self.syn_backlog.retain(|p| p != pair);
        self.backlog.retain(|p| p != pair);
    }
}

impl fmt::Debug for ListenEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenEntry")
            .field("local", &self.local)
            .field("syn_backlog", &self.syn_backlog.len())
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Conntrack {
    listen_entries: HashMap<IpPort, ListenEntry>,
    // local => remote => entry
    tcp_entries: HashMap<IpPort, HashMap<IpPort, TcpEntry>>,
}

impl Conntrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&mut self, local: IpPort, handler: Box<dyn ListenHandler>) -> Result<()> {
        if self.listen_entries.contains_key(&local) {
            return Err(Error::AlreadyExists(format!("listening entry {}", local)));
        }
        self.listen_entries.insert(local, ListenEntry::new(local, handler));
        Ok(())
    }

    /// Stop listening. Connections still queued on it are detached from it.
    pub fn unlisten(&mut self, local: &IpPort) -> Result<ListenEntry> {
        let entry = self
            .listen_entries
            .remove(local)
            .ok_or_else(|| Error::NotFound(format!("listening entry {}", local)))?;
        for pair in entry.syn_backlog.iter().chain(entry.backlog.iter()) {
            if let Some(tcp) = self.lookup_tcp_mut(&pair.remote, &pair.local) {
                tcp.clear_parent();
            }
        }
        Ok(entry)
    }

    /// Exact match first, then the wildcard address of the same family.
    pub fn lookup_listen(&self, dst: &IpPort) -> Option<&ListenEntry> {
        self.listen_entries
            .get(dst)
            .or_else(|| self.listen_entries.get(&dst.any_of_family()))
    }

    /// Key of the listener [`lookup_listen`](Self::lookup_listen) would return.
    pub fn lookup_listen_key(&self, dst: &IpPort) -> Option<IpPort> {
        self.lookup_listen(dst).map(|l| l.local)
    }

    pub fn listen_entry_mut(&mut self, key: &IpPort) -> Option<&mut ListenEntry> {
        self.listen_entries.get_mut(key)
    }

    pub fn list_listen_entries(&self) -> impl Iterator<Item = &ListenEntry> {
        self.listen_entries.values()
    }

    pub fn lookup_tcp(&self, remote: &IpPort, local: &IpPort) -> Option<&TcpEntry> {
        self.tcp_entries.get(local)?.get(remote)
    }

    pub fn lookup_tcp_mut(&mut self, remote: &IpPort, local: &IpPort) -> Option<&mut TcpEntry> {
        self.tcp_entries.get_mut(local)?.get_mut(remote)
    }

    /// Create an entry for a SYN admitted by `listen_key` and queue it on the
    /// syn backlog. A tuple that is already tracked keeps its entry.
    pub fn create_tcp(&mut self, listen_key: IpPort, remote: IpPort, local: IpPort, syn_seq: u32) -> &mut TcpEntry {
        let pair = SocketPair::new(remote, local);
        match self.tcp_entries.entry(local).or_default().entry(remote) {
            Entry::Occupied(e) => {
                error!("connection {} is already tracked, not created again", pair);
                e.into_mut()
            }
            Entry::Vacant(e) => {
                if let Some(listen) = self.listen_entries.get_mut(&listen_key) {
                    listen.syn_backlog.push(pair);
                }
                e.insert(TcpEntry::new(listen_key, remote, local, syn_seq))
            }
        }
    }

    /// Remove an entry, detaching it from its listener's backlogs.
    pub fn remove_tcp(&mut self, remote: &IpPort, local: &IpPort) -> Option<TcpEntry> {
        let map = self.tcp_entries.get_mut(local)?;
        let entry = map.remove(remote)?;
        if map.is_empty() {
            self.tcp_entries.remove(local);
        }
        if let Some(parent) = entry.parent() {
            if let Some(listen) = self.listen_entries.get_mut(&parent) {
                listen.forget(&SocketPair::new(*remote, *local));
            }
        }
        Some(entry)
    }

    /// Pop the oldest established connection of a listener.
    pub fn accept(&mut self, local: &IpPort) -> Option<SocketPair> {
        let pair = self.listen_entries.get_mut(local)?.backlog.pop_front()?;
        if let Some(tcp) = self.lookup_tcp_mut(&pair.remote, &pair.local) {
            tcp.clear_parent();
        }
        Some(pair)
    }

    pub fn count_tcp_entries(&self) -> usize {
        self.tcp_entries.values().map(|m| m.len()).sum()
    }

    pub fn list_tcp_entries(&self) -> impl Iterator<Item = &TcpEntry> {
        self.tcp_entries.values().flat_map(|m| m.values())
    }

    pub fn tcp_pairs(&self) -> Vec<SocketPair> {
        self.list_tcp_entries().map(|e| e.pair()).collect()
    }
}
