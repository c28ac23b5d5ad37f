//! Local port conflict checking.
//!
//! On Linux the kernel socket tables (`/proc/net/tcp`, `/proc/net/tcp6`) are
//! scanned for a listening socket on the port, and the owning process is
//! found by matching the socket inode against `/proc/<pid>/fd`. Elsewhere
//! `lsof` is asked instead.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Process holding a listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub name: String,
    /// `None` when the socket belongs to a process we cannot inspect.
    pub pid: Option<u32>,
}

impl fmt::Display for PortOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} (pid {pid})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A listening entry from a kernel socket table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListenEntry {
    addr: IpAddr,
    port: u16,
    inode: u64,
}

const TCP_LISTEN: &str = "0A";

/// Find the process listening on `port` on a loopback or wildcard address.
pub async fn find_port_owner(port: u16) -> Option<PortOwner> {
    #[cfg(target_os = "linux")]
    {
        linux::find_port_owner(port)
    }
    #[cfg(not(target_os = "linux"))]
    {
        lsof_port_owner(port).await
    }
}

/// Parse one data line of `/proc/net/tcp{,6}`. Only LISTEN sockets are returned.
fn parse_listen_line(line: &str) -> Option<ListenEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 || fields[3] != TCP_LISTEN {
        return None;
    }
    let (addr_hex, port_hex) = fields[1].split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let addr = parse_hex_addr(addr_hex)?;
    let inode = fields[9].parse().ok()?;
    Some(ListenEntry { addr, port, inode })
}

/// Kernel tables print addresses as 32-bit words in host byte order.
fn parse_hex_addr(hex: &str) -> Option<IpAddr> {
    match hex.len() {
        8 => {
            let word = u32::from_str_radix(hex, 16).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes())))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            Some(IpAddr::V6(Ipv6Addr::from(bytes)))
        }
        _ => None,
    }
}

/// Loopback or wildcard, including v4-mapped v6 forms.
fn is_local_bind(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.is_loopback() || v4.is_unspecified();
            }
            v6.is_loopback() || v6.is_unspecified()
        }
    }
}

fn matching_inodes(table: &str, port: u16) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(parse_listen_line)
        .filter(|e| e.port == port && is_local_bind(&e.addr))
        .map(|e| e.inode)
        .collect()
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs;

    use tracing::debug;

    use super::{matching_inodes, PortOwner};

    pub(super) fn find_port_owner(port: u16) -> Option<PortOwner> {
        let mut inodes = Vec::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match fs::read_to_string(table) {
                Ok(text) => inodes.extend(matching_inodes(&text, port)),
                Err(e) => debug!("Cannot read {table}: {e}"),
            }
        }
        if inodes.is_empty() {
            return None;
        }

        for inode in inodes.iter().filter(|i| **i != 0) {
            if let Some(pid) = pid_for_inode(*inode) {
                let name = fs::read_to_string(format!("/proc/{pid}/comm"))
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown process".to_string());
                return Some(PortOwner {
                    name,
                    pid: Some(pid),
                });
            }
        }
        Some(PortOwner {
            name: "unknown process".to_string(),
            pid: None,
        })
    }

    /// Scan every readable `/proc/<pid>/fd` for `socket:[inode]`.
    /// Processes we may not inspect are skipped.
    fn pid_for_inode(inode: u64) -> Option<u32> {
        let needle = format!("socket:[{inode}]");
        let proc_dir = fs::read_dir("/proc").ok()?;
        for entry in proc_dir.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let Ok(fds) = fs::read_dir(format!("/proc/{pid}/fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if link.to_string_lossy() == needle {
                        return Some(pid);
                    }
                }
            }
        }
        None
    }
}

#[cfg(not(target_os = "linux"))]
async fn lsof_port_owner(port: u16) -> Option<PortOwner> {
    let spec = format!("-iTCP:{port}");
    let result = crate::process::exec::run(
        "lsof",
        &["-nP", spec.as_str(), "-sTCP:LISTEN", "-Fpc"],
        std::time::Duration::from_secs(5),
    )
    .await
    .map_err(|e| tracing::debug!("lsof unavailable: {e}"))
    .ok()?;
    parse_lsof(&result.stdout)
}

/// Parse `lsof -F pc` field output: `p<pid>` then `c<command>`.
#[cfg_attr(target_os = "linux", allow(dead_code))]
fn parse_lsof(output: &str) -> Option<PortOwner> {
    let mut pid = None;
    for line in output.lines() {
        if let Some(p) = line.strip_prefix('p') {
            pid = p.trim().parse().ok();
        } else if let Some(name) = line.strip_prefix('c') {
            return Some(PortOwner {
                name: name.trim().to_string(),
                pid,
            });
        }
    }
    pid.map(|pid| PortOwner {
        name: "unknown process".to_string(),
        pid: Some(pid),
    })
}
