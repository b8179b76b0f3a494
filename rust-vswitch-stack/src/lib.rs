//! Packet pipeline of the virtual switch.
//!
//! VXLAN frames enter through [`NetworkStack::input_vxlan`] and flow through
//! three layers:
//!
//! - L2 learns source macs, forwards unicast frames and floods broadcasts
//!   inside a table (a VPC identified by its VNI).
//! - L3 answers ARP, NDP and ICMP echo for the table's synthetic IPs and
//!   routes packets between tables.
//! - L4 terminates TCP connections on synthetic IPs with a passive state
//!   machine, retransmission and delayed ACK.
//!
//! Nothing in the pipeline touches a socket: frames leave through the
//! [`Iface`] trait and time is passed in explicitly, so the whole stack is
//! driven deterministically by its caller.

pub mod config;
pub mod conntrack;
pub mod context;
mod l2;
mod l3;
mod l4;
pub mod route;
pub mod skb;
pub mod stack;
pub mod table;
pub mod tcp;
pub mod timer;

pub use config::SwitchConfig;
pub use conntrack::{ListenHandler, SocketPair};
pub use context::{next_iface_id, Iface, IfaceId, IfaceRef, SwitchContext};
pub use route::{RouteRule, RouteTarget};
pub use stack::NetworkStack;
pub use table::Table;
pub use tcp::{ConnectionHandler, TcpState};

pub use rust_vswitch_common::{Error, Result};
