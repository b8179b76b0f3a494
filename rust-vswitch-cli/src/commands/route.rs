//! `route`: longest-prefix lookup against a configured table.

use anyhow::{anyhow, Result};
use rust_vswitch_common::types::Vni;
use rust_vswitch_stack::RouteTarget;
use std::net::IpAddr;
use std::path::PathBuf;

use super::load_stack;

pub fn handle_command(path: PathBuf, vni: Vni, ip: IpAddr) -> Result<()> {
    let (_, stack) = load_stack(&path)?;
    let table = stack.table(vni)?;
    let rule = table
        .route_table
        .lookup(&ip)
        .ok_or_else(|| anyhow!("no route to {} in table {}", ip, vni))?;

    println!("{}", rule);
    match rule.target {
        RouteTarget::Vni(target) if target == vni => println!("{} is local to table {}", ip, vni),
        RouteTarget::Vni(target) => println!("{} is routed to table {}", ip, target),
        RouteTarget::Gateway(gw) => println!("{} is forwarded via {}", ip, gw),
    }
    Ok(())
}
