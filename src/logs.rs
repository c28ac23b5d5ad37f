//! Log viewer support: `getLogs` and `clearLogs`.
//!
//! With a connection target the backend's own log and stderr artifacts are
//! served; without one, the agent's log file.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::artifacts::ArtifactManager;
use crate::config::Config;
use crate::error::TunnelError;
use crate::profile::BackendKind;
use crate::util::tail_file;

/// Where a log request points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    Agent(PathBuf),
    Connection {
        kind: BackendKind,
        identifier: String,
        log: PathBuf,
        stderr: PathBuf,
    },
}

impl LogSource {
    pub fn resolve(
        config: &Config,
        artifacts: &ArtifactManager,
        target: Option<(BackendKind, String)>,
    ) -> Result<Self, TunnelError> {
        match target {
            None => Ok(LogSource::Agent(config.log_file())),
            Some((kind, identifier)) => {
                let set = artifacts.artifacts(kind, &identifier)?;
                Ok(LogSource::Connection {
                    kind,
                    identifier,
                    log: set.log,
                    stderr: set.stderr,
                })
            }
        }
    }

    fn files(&self) -> Vec<&Path> {
        match self {
            LogSource::Agent(path) => vec![path.as_path()],
            LogSource::Connection { log, stderr, .. } => vec![log.as_path(), stderr.as_path()],
        }
    }
}

/// The last `lines` lines of each file behind `source`. Missing files are
/// skipped; a connection with no logs yields a short notice.
pub async fn read_logs(source: &LogSource, lines: usize) -> String {
    let mut sections = Vec::new();
    for path in source.files() {
        let tail = tail_file(path, lines).await;
        if tail.is_empty() {
            continue;
        }
        match source {
            LogSource::Agent(_) => sections.push(tail),
            LogSource::Connection { .. } => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                sections.push(format!("==> {name} <==\n{tail}"));
            }
        }
    }
    if sections.is_empty() {
        return match source {
            LogSource::Agent(path) => format!("No log entries in {}", path.display()),
            LogSource::Connection {
                kind, identifier, ..
            } => format!("No logs for {kind} connection '{identifier}'"),
        };
    }
    sections.join("\n")
}

/// Empty the files behind `source`. The agent log is truncated in place;
/// connection logs are removed.
pub async fn clear_logs(source: &LogSource) -> Result<String, TunnelError> {
    match source {
        LogSource::Agent(path) => {
            match tokio::fs::OpenOptions::new().write(true).open(path).await {
                Ok(file) => file.set_len(0).await.map_err(|e| {
                    TunnelError::Process(format!("Failed to truncate {}: {e}", path.display()))
                })?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(TunnelError::Process(format!(
                        "Failed to open {}: {e}",
                        path.display()
                    )))
                }
            }
            info!("Agent log cleared");
            Ok("Logs cleared".into())
        }
        LogSource::Connection {
            kind, identifier, ..
        } => {
            for path in source.files() {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove {}: {e}", path.display());
                        return Err(TunnelError::Process(format!(
                            "Failed to remove {}: {e}",
                            path.display()
                        )));
                    }
                }
            }
            info!("Logs cleared for {kind} '{identifier}'");
            Ok(format!("Logs cleared for {kind} connection '{identifier}'"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.paths.runtime_dir = dir.join("run").to_string_lossy().into_owned();
        config.paths.log_dir = dir.join("logs").to_string_lossy().into_owned();
        config
    }

    #[tokio::test]
    async fn test_agent_log_tail_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let manager = ArtifactManager::new(&config);
        let source = LogSource::resolve(&config, &manager, None).unwrap();
        let LogSource::Agent(path) = &source else {
            panic!("expected agent log");
        };
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let text: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        std::fs::write(path, text).unwrap();

        let logs = read_logs(&source, 3).await;
        assert_eq!(logs, "line 8\nline 9\nline 10");

        clear_logs(&source).await.unwrap();
        assert!(path.exists());
        assert!(read_logs(&source, 3).await.starts_with("No log entries"));
    }

    #[tokio::test]
    async fn test_connection_logs() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let manager = ArtifactManager::new(&config);
        manager.ensure_runtime_dir().await.unwrap();
        let source = LogSource::resolve(
            &config,
            &manager,
            Some((BackendKind::OpenVpn, "office".into())),
        )
        .unwrap();

        assert_eq!(
            read_logs(&source, 5).await,
            "No logs for openvpn connection 'office'"
        );

        let set = manager.artifacts(BackendKind::OpenVpn, "office").unwrap();
        std::fs::write(&set.log, "Initialization Sequence Completed\n").unwrap();
        std::fs::write(&set.stderr, "warning: weak cipher\n").unwrap();
        let logs = read_logs(&source, 5).await;
        assert!(logs.contains("==> holocron.openvpn.office.log <==\nInitialization Sequence Completed"));
        assert!(logs.contains("weak cipher"));

        clear_logs(&source).await.unwrap();
        assert!(!set.log.exists());
        assert!(!set.stderr.exists());
        clear_logs(&source).await.unwrap();
    }
}
