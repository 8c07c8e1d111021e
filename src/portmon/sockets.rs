//! Reads the kernel's textual socket tables (`/proc/net/tcp`, `/proc/net/udp`).
//!
//! Each line after the header looks like:
//! ```text
//!    sl  local_address rem_address   st tx_queue rx_queue ...
//!    0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 ...
//! ```
//! The local address is `HEXIP:HEXPORT`. The IP is the kernel's in-memory
//! representation of the 4 address bytes, so the hex string has to be
//! byte-swapped to get dotted-decimal order. The port is plain big-endian hex.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use super::{PortMonError, Protocol};

/// Interface filter value that matches every local address.
pub const ANY_INTERFACE: &str = "any";

/// Samples the socket tables under a proc root.
///
/// The root is `/proc` in production; tests point it at a temp directory
/// containing fake `net/tcp` and `net/udp` files.
#[derive(Debug, Clone)]
pub struct SocketTableReader {
    root: PathBuf,
}

impl SocketTableReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Return the distinct local ports present in the tables selected by
    /// `protocol`, filtered by `interface`.
    ///
    /// A table that cannot be read contributes nothing.
    pub fn sample(&self, protocol: Protocol, interface: &str) -> BTreeSet<u16> {
        let mut ports = BTreeSet::new();
        for table in protocol.tables() {
            let path = self.root.join("net").join(table);
            match std::fs::read_to_string(&path) {
                Ok(content) => ports.extend(parse_socket_table(&content, interface)),
                Err(e) => {
                    tracing::trace!(path = %path.display(), error = %e, "socket table unreadable");
                }
            }
        }
        ports
    }

    /// [`sample`](Self::sample) on the blocking pool.
    pub async fn sample_blocking(
        &self,
        protocol: Protocol,
        interface: &str,
    ) -> Result<BTreeSet<u16>, tokio::task::JoinError> {
        let reader = self.clone();
        let interface = interface.to_string();
        tokio::task::spawn_blocking(move || reader.sample(protocol, &interface)).await
    }
}

/// Parse one socket table, returning the local ports whose address matches
/// `interface` (or every port when the filter is `any`).
///
/// The header line and any line that does not parse are skipped.
pub fn parse_socket_table(content: &str, interface: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();

    for line in content.lines().skip(1) {
        let Some(local) = line.split_whitespace().nth(1) else {
            continue;
        };
        let (addr, port) = match parse_hex_addr_v4(local) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::trace!(line, error = %e, "skipping socket table line");
                continue;
            }
        };
        if interface == ANY_INTERFACE || addr.to_string() == interface {
            ports.insert(port);
        }
    }

    ports
}

/// Parse hex-encoded IPv4 address:port (e.g. "0100007F:1F90" is 127.0.0.1:8080).
pub fn parse_hex_addr_v4(s: &str) -> Result<(Ipv4Addr, u16), PortMonError> {
    let (addr_hex, port_hex) = s
        .split_once(':')
        .ok_or_else(|| PortMonError::Parse(format!("invalid address format: {}", s)))?;

    if addr_hex.len() != 8 {
        return Err(PortMonError::Parse(format!("invalid IPv4 address: {}", addr_hex)));
    }
    let raw = u32::from_str_radix(addr_hex, 16)
        .map_err(|_| PortMonError::Parse(format!("invalid IPv4 address: {}", addr_hex)))?;
    let addr = Ipv4Addr::from(raw.swap_bytes());

    let port = u16::from_str_radix(port_hex, 16)
        .map_err(|_| PortMonError::Parse(format!("invalid port: {}", port_hex)))?;

    Ok((addr, port))
}
