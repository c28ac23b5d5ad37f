//! Per-connection artifact files and their cleanup.
//!
//! Every `(backend, identifier)` pair owns a fixed set of files under the
//! runtime directory:
//!
//! ```text
//! holocron.<backend>.<id>.lock   pid of the verified tunnel process
//! holocron.<backend>.<id>.conf   sanitised OpenVPN profile
//! holocron.<backend>.<id>.json   generated V2Ray / Shadowsocks config
//! holocron.<backend>.<id>.log    backend stdout / log
//! holocron.<backend>.<id>.err    backend stderr
//! holocron.<backend>.<id>.auth   OpenVPN credentials (0600)
//! holocron.ssh.socket.<id>       SSH control path (owned by ssh, never removed here)
//! ```
//!
//! OpenVPN may run as root, so on POSIX its artifacts are removed with one
//! elevated `rm` covering every existing file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::TunnelError;
use crate::process::exec;
use crate::profile::BackendKind;
use crate::util::file_safe;

/// Paths of every artifact belonging to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    pub kind: BackendKind,
    pub identifier: String,
    pub lock: PathBuf,
    /// Generated config: `.conf` for OpenVPN, `.json` otherwise.
    pub config: PathBuf,
    pub log: PathBuf,
    pub stderr: PathBuf,
    /// OpenVPN only.
    pub credentials: Option<PathBuf>,
    /// SSH only.
    pub control_socket: Option<PathBuf>,
}

impl ArtifactSet {
    pub fn new(runtime_dir: &Path, kind: BackendKind, identifier: &str) -> Result<Self, TunnelError> {
        let id = file_safe(identifier).ok_or_else(|| {
            TunnelError::Configuration("Connection identifier cannot be empty".into())
        })?;
        let base = format!("holocron.{}.{id}", kind.as_str());
        let path = |ext: &str| runtime_dir.join(format!("{base}.{ext}"));
        let config_ext = if kind == BackendKind::OpenVpn {
            "conf"
        } else {
            "json"
        };

        Ok(Self {
            kind,
            identifier: id.clone(),
            lock: path("lock"),
            config: path(config_ext),
            log: path("log"),
            stderr: path("err"),
            credentials: (kind == BackendKind::OpenVpn).then(|| path("auth")),
            control_socket: (kind == BackendKind::Ssh)
                .then(|| runtime_dir.join(format!("holocron.ssh.socket.{id}"))),
        })
    }

    /// Files cleanup is responsible for.
    pub fn removable(&self) -> Vec<&Path> {
        let mut files = vec![
            self.lock.as_path(),
            self.config.as_path(),
            self.log.as_path(),
            self.stderr.as_path(),
        ];
        if let Some(cred) = &self.credentials {
            files.push(cred);
        }
        files
    }

    /// Removable files that currently exist.
    pub fn existing(&self) -> Vec<PathBuf> {
        self.removable()
            .into_iter()
            .filter(|p| p.symlink_metadata().is_ok())
            .map(Path::to_path_buf)
            .collect()
    }

    /// Pid recorded in the lock file, if it exists and parses.
    pub fn read_lock_pid(&self) -> Option<u32> {
        let text = std::fs::read_to_string(&self.lock).ok()?;
        text.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
    }

    /// Atomically write the lock file (tmp + rename).
    pub async fn write_lock(&self, pid: u32) -> Result<(), TunnelError> {
        let tmp = self.lock.with_extension("lock.tmp");
        let io_err =
            |e: std::io::Error| TunnelError::Process(format!("Failed to write lock file: {e}"));
        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
        file.write_all(format!("{pid}\n").as_bytes())
            .await
            .map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);
        tokio::fs::rename(&tmp, &self.lock).await.map_err(io_err)?;
        debug!("Lock {} -> pid {pid}", self.lock.display());
        Ok(())
    }

    /// Remove only the lock file (stale-lock healing).
    pub fn remove_lock(&self) {
        match std::fs::remove_file(&self.lock) {
            Ok(()) => info!("Removed stale lock {}", self.lock.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove stale lock {}: {e}", self.lock.display()),
        }
    }
}

/// Computes artifact sets and removes them, elevating when needed.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    runtime_dir: PathBuf,
    elevate_prefix: Vec<String>,
    openvpn_elevated: bool,
}

impl ArtifactManager {
    pub fn new(config: &Config) -> Self {
        Self {
            runtime_dir: config.runtime_dir(),
            elevate_prefix: config.privilege.elevate_command.clone(),
            openvpn_elevated: config.openvpn_elevated(),
        }
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn artifacts(&self, kind: BackendKind, identifier: &str) -> Result<ArtifactSet, TunnelError> {
        ArtifactSet::new(&self.runtime_dir, kind, identifier)
    }

    /// Create the runtime directory (owner-only on POSIX).
    pub async fn ensure_runtime_dir(&self) -> Result<(), TunnelError> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(&self.runtime_dir).await.map_err(|e| {
            TunnelError::Process(format!(
                "Failed to create runtime directory {}: {e}",
                self.runtime_dir.display()
            ))
        })
    }

    /// Whether files for `kind` may be root-owned.
    pub fn elevates(&self, kind: BackendKind) -> bool {
        kind == BackendKind::OpenVpn && self.openvpn_elevated
    }

    /// Remove every existing artifact. Idempotent; failures are logged only.
    pub async fn cleanup(&self, set: &ArtifactSet) {
        let files = set.existing();
        if files.is_empty() {
            return;
        }
        debug!(
            "Cleaning {} artifact(s) for {} '{}'",
            files.len(),
            set.kind,
            set.identifier
        );

        if cfg!(unix) && self.elevates(set.kind) {
            let mut args = vec!["-f".to_string(), "--".to_string()];
            args.extend(files.iter().map(|p| p.to_string_lossy().into_owned()));
            match exec::run_elevated(&self.elevate_prefix, "rm", &args, Duration::from_secs(15))
                .await
            {
                Ok(r) if r.exit_code == 0 => return,
                Ok(r) => warn!(
                    "Elevated cleanup exited {}: {}",
                    r.exit_code,
                    r.combined_output()
                ),
                Err(e) => warn!("Elevated cleanup failed: {e}"),
            }
        }

        for path in files {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {e}", path.display()),
            }
        }
    }
}
