//! The seam between the packet pipeline and the outside world.
//!
//! L2/L3/L4 never touch sockets directly: they send through
//! [`SwitchContext::send_frame`], enumerate ports with
//! [`SwitchContext::ifaces`], find VPCs with [`SwitchContext::table`] and
//! schedule timers on [`SwitchContext::event_loop`].

use log::warn;
use rust_vswitch_common::metrics::SwitchMetrics;
use rust_vswitch_common::types::{Millis, Vni};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::table::Table;
use crate::timer::EventLoop;

/// Identity of an interface, used for deduplication and mac learning.
pub type IfaceId = u64;

static NEXT_IFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique interface id.
pub fn next_iface_id() -> IfaceId {
    NEXT_IFACE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A network port: a VXLAN peer, a tap device, a client session.
pub trait Iface: fmt::Debug + Send + Sync {
    fn id(&self) -> IfaceId;

    /// The VNI this interface carries for `hint`. Interfaces bound to one
    /// VNI return that VNI; remote switches carry every VNI and return `hint`.
    fn local_side_vni(&self, hint: Vni) -> Vni;

    /// Transmit one encoded VXLAN frame.
    fn send_packet(&self, frame: &[u8]) -> io::Result<()>;
}

pub type IfaceRef = Arc<dyn Iface>;

pub struct SwitchContext<'a> {
    pub(crate) tables: &'a mut HashMap<Vni, Table>,
    pub(crate) ifaces: &'a [IfaceRef],
    pub(crate) event_loop: &'a mut EventLoop,
    pub(crate) metrics: &'a SwitchMetrics,
    pub now: Millis,
}

impl<'a> SwitchContext<'a> {
    pub fn new(
        tables: &'a mut HashMap<Vni, Table>,
        ifaces: &'a [IfaceRef],
        event_loop: &'a mut EventLoop,
        metrics: &'a SwitchMetrics,
        now: Millis,
    ) -> Self {
        Self {
            tables,
            ifaces,
            event_loop,
            metrics,
            now,
        }
    }

    /// Hand an encoded VXLAN frame to an interface. Send failures are logged, never surfaced.
    pub fn send_frame(&self, frame: &[u8], iface: &IfaceRef) {
        match iface.send_packet(frame) {
            Ok(()) => {
                self.metrics.frames_sent.increment();
                self.metrics.bytes_sent.add(frame.len() as u64);
            }
            Err(e) => {
                warn!("failed to send packet to {:?}: {}", iface, e);
                self.metrics.frames_dropped.increment();
            }
        }
    }

    pub fn ifaces(&self) -> &[IfaceRef] {
        self.ifaces
    }

    pub fn table(&self, vni: Vni) -> Option<&Table> {
        self.tables.get(&vni)
    }

    pub fn table_mut(&mut self, vni: Vni) -> Option<&mut Table> {
        self.tables.get_mut(&vni)
    }

    pub fn event_loop(&mut self) -> &mut EventLoop {
        &mut *self.event_loop
    }

    pub fn metrics(&self) -> &SwitchMetrics {
        self.metrics
    }
}
