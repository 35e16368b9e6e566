//! Static peer-list ("flatfile") builder
//!
//! Every worker reads the flatfile once at startup to find its peers, so it
//! must be written (and, for remote launch, uploaded) before any worker
//! process starts.

use crate::config::ClusterConfig;
use rand::seq::SliceRandom;
use std::io::Write;
use std::path::Path;

/// Ports reserved per node: the REST port plus the internal peer port.
pub const PORTS_PER_NODE: u16 = 2;

/// One `host:port` entry per intended node.
///
/// With remote hosts the same port sequence repeats on every host; locally
/// every node gets its own port pair on the bind address.
pub fn peer_list(config: &ClusterConfig) -> Vec<String> {
    let base_port = config.effective_base_port();
    let mut entries = Vec::new();

    if config.hosts.is_empty() {
        for i in 0..config.node_count {
            let port = base_port + PORTS_PER_NODE * i as u16;
            entries.push(format!("{}:{}", config.bind_addr, port));
        }
    } else {
        for host in &config.hosts {
            for i in 0..config.node_count {
                let port = base_port + PORTS_PER_NODE * i as u16;
                entries.push(format!("{}:{}", host.addr, port));
            }
        }
    }

    entries
}

/// The ports assigned to local nodes, in node-id order.
pub fn port_list(config: &ClusterConfig) -> Vec<u16> {
    let base_port = config.effective_base_port();
    (0..config.node_count)
        .map(|i| base_port + PORTS_PER_NODE * i as u16)
        .collect()
}

/// Write the flatfile: one entry per line, newline-terminated, no header.
///
/// Shuffling the entry order exercises different join orders across runs;
/// it is opt-in and has no correctness effect.
pub fn write_flatfile(
    path: &Path,
    entries: &[String],
    shuffle: bool,
) -> Result<(), std::io::Error> {
    let mut entries = entries.to_vec();
    if shuffle {
        entries.shuffle(&mut rand::thread_rng());
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = std::fs::File::create(path)?;
    for entry in &entries {
        writeln!(file, "{}", entry)?;
    }
    Ok(())
}
