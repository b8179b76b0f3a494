//! `check`: validate a configuration and print the resulting tables.

use anyhow::Result;
use log::info;
use std::path::PathBuf;

use super::load_stack;

pub fn handle_command(path: PathBuf) -> Result<()> {
    let (config, stack) = load_stack(&path)?;
    info!("configuration {} is valid", path.display());

    for t in stack.tables() {
        match t.v6network {
            Some(v6) => println!("table {} v4network {} v6network {}", t.vni, t.v4network, v6),
            None => println!("table {} v4network {}", t.vni, t.v4network),
        }
        for ip in t.ips.entries() {
            println!("  ip {} mac {}", ip.ip, ip.mac);
        }
        for rule in t.route_table.rules() {
            println!("  route {}", rule);
        }
    }
    for r in &config.remotes {
        match r.vni {
            Some(vni) => println!("remote {} vni {}", r.address, vni),
            None => println!("remote {} switch", r.address),
        }
    }
    for l in &config.listeners {
        println!("listener {}:{} vni {}", l.ip, l.port, l.vni);
    }
    println!("OK");
    Ok(())
}
