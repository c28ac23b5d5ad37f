//! Tunnel detection against the live process table.
//!
//! The OS is the source of truth. SSH is found by scanning for the `ssh`
//! process carrying the identifier's control path; the other backends are
//! found through their lock file, which is only trusted after the pid it
//! names is confirmed to be the expected program. A lock that fails that
//! check is stale and removed on the spot.

use tracing::{debug, warn};

use crate::artifacts::ArtifactSet;
use crate::error::TunnelError;
use crate::extract::{self, PortSources};
use crate::process::{ProcessInfo, ProcessTable};
use crate::profile::{Backend, ConnectionProfile};

/// Derived connection state. `socks_port` is always `None` when disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TunnelStatus {
    pub connected: bool,
    pub socks_port: Option<u16>,
    /// The process table could not be read; `connected` is a guess.
    pub undetermined: bool,
}

impl TunnelStatus {
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn connected(socks_port: Option<u16>) -> Self {
        Self {
            connected: true,
            socks_port,
            undetermined: false,
        }
    }

    /// Not known to be up because detection itself failed.
    pub fn undetermined() -> Self {
        Self {
            undetermined: true,
            ..Self::default()
        }
    }
}

/// Per-backend detection.
pub trait Detector {
    /// The live process managing this connection, if any.
    fn find(&self, table: &dyn ProcessTable) -> Option<ProcessInfo>;

    /// SOCKS port of a process returned by [`Detector::find`].
    fn socks_port(&self, process: &ProcessInfo) -> Option<u16>;

    fn detect(&self, table: &dyn ProcessTable) -> TunnelStatus {
        match self.find(table) {
            Some(process) => TunnelStatus::connected(self.socks_port(&process)),
            None => TunnelStatus::disconnected(),
        }
    }
}

/// Build the detector for `profile`'s backend.
pub fn detector<'a>(
    profile: &'a ConnectionProfile,
    artifacts: &'a ArtifactSet,
    fallback_port: u16,
) -> Box<dyn Detector + 'a> {
    match &profile.backend {
        Backend::Ssh(_) => Box::new(SshDetector { profile, artifacts }),
        Backend::OpenVpn(_) => Box::new(LockDetector {
            profile,
            artifacts,
            tokens: &["openvpn"],
            fallback_port,
        }),
        Backend::V2Ray(_) => Box::new(LockDetector {
            profile,
            artifacts,
            tokens: &["v2ray", "xray"],
            fallback_port,
        }),
        Backend::Shadowsocks(_) => Box::new(LockDetector {
            profile,
            artifacts,
            tokens: &["ss-local"],
            fallback_port,
        }),
    }
}

/// Matches `ssh` processes owned by us whose arguments carry the control path.
struct SshDetector<'a> {
    profile: &'a ConnectionProfile,
    artifacts: &'a ArtifactSet,
}

impl SshDetector<'_> {
    fn control_token(&self) -> String {
        format!("holocron.ssh.socket.{}", self.artifacts.identifier)
    }
}

/// True if some argument names exactly this control path, either bare, as
/// the last path component, or after `=` (`-oControlPath=...`).
fn references_control_path(cmdline: &[String], token: &str) -> bool {
    cmdline.iter().any(|arg| {
        arg == token
            || arg
                .strip_suffix(token)
                .is_some_and(|head| head.ends_with('/') || head.ends_with('='))
    })
}

impl SshDetector<'_> {
    fn scan(&self, table: &dyn ProcessTable) -> Result<Option<ProcessInfo>, TunnelError> {
        let token = self.control_token();
        Ok(table.snapshot()?.into_iter().find(|p| {
            p.name == "ssh" && p.owned_by_current_user && references_control_path(&p.cmdline, &token)
        }))
    }
}

impl Detector for SshDetector<'_> {
    fn find(&self, table: &dyn ProcessTable) -> Option<ProcessInfo> {
        self.scan(table)
            .map_err(|e| warn!("Process table unavailable for '{}': {e}", self.profile.identifier))
            .ok()
            .flatten()
    }

    fn detect(&self, table: &dyn ProcessTable) -> TunnelStatus {
        match self.scan(table) {
            Ok(Some(process)) => TunnelStatus::connected(self.socks_port(&process)),
            Ok(None) => TunnelStatus::disconnected(),
            Err(e) => {
                warn!("Cannot determine state of '{}': {e}", self.profile.identifier);
                TunnelStatus::undetermined()
            }
        }
    }

    fn socks_port(&self, process: &ProcessInfo) -> Option<u16> {
        extract::extract_socks_port(
            self.profile,
            PortSources {
                cmdline: Some(&process.cmdline_string()),
                ..PortSources::default()
            },
        )
    }
}

/// Lock-file backends: OpenVPN, V2Ray, Shadowsocks.
struct LockDetector<'a> {
    profile: &'a ConnectionProfile,
    artifacts: &'a ArtifactSet,
    /// The process name (or argv[0]) must contain one of these.
    tokens: &'static [&'static str],
    fallback_port: u16,
}

impl LockDetector<'_> {
    fn is_expected_program(&self, process: &ProcessInfo) -> bool {
        let argv0 = process
            .cmdline
            .first()
            .and_then(|a| a.rsplit('/').next())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let name = process.name.to_ascii_lowercase();
        self.tokens
            .iter()
            .any(|t| name.contains(t) || argv0.contains(t))
    }
}

impl Detector for LockDetector<'_> {
    fn find(&self, table: &dyn ProcessTable) -> Option<ProcessInfo> {
        if !self.artifacts.lock.exists() {
            return None;
        }
        let Some(pid) = self.artifacts.read_lock_pid() else {
            debug!("Unparsable lock {}", self.artifacts.lock.display());
            self.artifacts.remove_lock();
            return None;
        };
        match table.lookup(pid) {
            Some(process) if self.is_expected_program(&process) => Some(process),
            Some(process) => {
                debug!(
                    "Lock pid {pid} is '{}', not {:?}",
                    process.name, self.tokens
                );
                self.artifacts.remove_lock();
                None
            }
            None => {
                debug!("Lock pid {pid} is not running");
                self.artifacts.remove_lock();
                None
            }
        }
    }

    fn socks_port(&self, _process: &ProcessInfo) -> Option<u16> {
        let generated = std::fs::read_to_string(&self.artifacts.config).ok();
        if generated.is_none() && !matches!(self.profile.backend, Backend::OpenVpn(_)) {
            warn!(
                "Generated config {} unreadable, assuming SOCKS port {}",
                self.artifacts.config.display(),
                self.fallback_port
            );
        }
        extract::extract_socks_port(
            self.profile,
            PortSources {
                cmdline: None,
                generated_config: generated.as_deref(),
                fallback: self.fallback_port,
            },
        )
    }
}
