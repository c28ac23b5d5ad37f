//! Tunnel command facade.
//!
//! Combines detection, the launch engine and diagnostics into the four
//! tunnel operations the controller issues. The last known [`TunnelState`]
//! per `(backend, identifier)` is kept for reporting only; connectivity is
//! always re-derived from the process table.
//!
//! ```text
//! Unknown ─┬─> Stopped ──start──> Starting ──verified──> Connected
//!          │                         │                      │
//!          │                         └─failed─> Failed ─┐   stop / gone
//!          │                                            v   v
//!          └──────────────────────────────────────────> Stopped
//! ```

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, warn};

use crate::detect::TunnelStatus;
use crate::diagnostics::DiagnosticsReport;
use crate::error::TunnelError;
use crate::launch::{Engine, Started, Stopped};
use crate::profile::{BackendKind, ConnectionProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    #[default]
    Unknown,
    Stopped,
    Starting,
    Connected,
    Failed,
}

impl TunnelState {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Unknown => "unknown",
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Connected => "connected",
            TunnelState::Failed => "failed",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of `getStatus`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: TunnelStatus,
    pub state: TunnelState,
    pub diagnostics: DiagnosticsReport,
}

/// Result of `testConnection`.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub success: bool,
    pub message: String,
    pub status: TunnelStatus,
    /// The tunnel was started for this test and stopped again afterwards.
    pub started_for_test: bool,
    pub diagnostics: DiagnosticsReport,
}

/// Optional overrides carried by status and test requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeTargets<'a> {
    pub ping_host: Option<&'a str>,
    pub web_check_url: Option<&'a str>,
}

type StateKey = (BackendKind, String);

/// Owns the engine and the per-identifier state table. Every operation
/// takes `&mut self`, so start and stop for one identifier never overlap.
pub struct TunnelManager {
    engine: Engine,
    states: HashMap<StateKey, TunnelState>,
}

impl TunnelManager {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            states: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn state(&self, profile: &ConnectionProfile) -> TunnelState {
        self.states
            .get(&key(profile))
            .copied()
            .unwrap_or_default()
    }

    fn transition(&mut self, profile: &ConnectionProfile, next: TunnelState) {
        let previous = self.states.insert(key(profile), next).unwrap_or_default();
        if previous != next {
            debug!(
                "{} '{}': {previous} -> {next}",
                profile.kind(),
                profile.identifier
            );
        }
    }

    /// Re-derive the state from a fresh detection. A tunnel that was
    /// believed up but is gone is moved to `Stopped`; a detection that
    /// could not read the process table leaves it `Unknown`.
    fn observe(&mut self, profile: &ConnectionProfile, status: TunnelStatus) {
        if status.undetermined {
            self.transition(profile, TunnelState::Unknown);
            return;
        }
        let current = self.state(profile);
        match (status.connected, current) {
            (true, _) => self.transition(profile, TunnelState::Connected),
            (false, TunnelState::Connected) => {
                info!(
                    "{} tunnel '{}' is no longer running",
                    profile.kind(),
                    profile.identifier
                );
                self.transition(profile, TunnelState::Stopped);
            }
            (false, _) => self.transition(profile, TunnelState::Stopped),
        }
    }

    /// Detect the tunnel and probe connectivity, through it when it is up.
    pub async fn status(
        &mut self,
        profile: &ConnectionProfile,
        targets: ProbeTargets<'_>,
    ) -> Result<StatusReport, TunnelError> {
        let status = self.engine.detect(profile)?;
        self.observe(profile, status);
        let diagnostics = self.probe(status, targets).await;
        Ok(StatusReport {
            status,
            state: self.state(profile),
            diagnostics,
        })
    }

    pub async fn start(&mut self, profile: &ConnectionProfile) -> Result<Started, TunnelError> {
        self.transition(profile, TunnelState::Starting);
        match self.engine.start(profile).await {
            Ok(started) => {
                self.transition(profile, TunnelState::Connected);
                Ok(started)
            }
            Err(e) => {
                warn!(
                    "Start of {} '{}' failed: {e}",
                    profile.kind(),
                    profile.identifier
                );
                self.transition(profile, TunnelState::Failed);
                // The engine has already cleaned up the failed attempt.
                self.transition(profile, TunnelState::Stopped);
                Err(e)
            }
        }
    }

    pub async fn stop(&mut self, profile: &ConnectionProfile) -> Result<Stopped, TunnelError> {
        let result = self.engine.stop(profile).await;
        match &result {
            Ok(_) => self.transition(profile, TunnelState::Stopped),
            // The process may have survived; let the next detection decide.
            Err(_) => self.transition(profile, TunnelState::Unknown),
        }
        result
    }

    /// Run diagnostics through the tunnel, starting it first when it is
    /// down and stopping it again afterwards.
    pub async fn test_connection(
        &mut self,
        profile: &ConnectionProfile,
        targets: ProbeTargets<'_>,
    ) -> Result<TestReport, TunnelError> {
        let before = self.engine.detect(profile)?;
        self.observe(profile, before);

        let mut started_for_test = false;
        let mut status = before;
        let mut start_error = None;
        if !before.connected {
            info!(
                "Starting {} '{}' for a connection test",
                profile.kind(),
                profile.identifier
            );
            match self.start(profile).await {
                Ok(started) => {
                    started_for_test = !started.already_running;
                    status = TunnelStatus::connected(started.socks_port);
                }
                Err(e) => start_error = Some(e),
            }
        }

        let diagnostics = self.probe(status, targets).await;

        if started_for_test {
            if let Err(e) = self.stop(profile).await {
                warn!(
                    "Failed to stop {} '{}' after test: {e}",
                    profile.kind(),
                    profile.identifier
                );
            }
        }

        let (success, message) = match start_error {
            Some(e) => (false, format!("Test aborted: {e}")),
            None => {
                let ok = diagnostics.tcp.error_kind.is_none()
                    && diagnostics.web.error_kind.is_none()
                    && diagnostics.web.status == "OK";
                let message = if ok {
                    format!(
                        "Connection test passed (TCP {}ms, HTTP {}ms)",
                        diagnostics.tcp.latency_ms, diagnostics.web.latency_ms
                    )
                } else {
                    format!(
                        "Connection test failed (TCP: {}, HTTP: {})",
                        diagnostics.tcp.status, diagnostics.web.status
                    )
                };
                (ok, message)
            }
        };

        Ok(TestReport {
            success,
            message,
            status,
            started_for_test,
            diagnostics,
        })
    }

    async fn probe(&self, status: TunnelStatus, targets: ProbeTargets<'_>) -> DiagnosticsReport {
        let socks_port = if status.connected {
            status.socks_port
        } else {
            None
        };
        DiagnosticsReport::collect(
            self.engine.config(),
            targets.ping_host,
            targets.web_check_url,
            socks_port,
        )
        .await
    }
}

fn key(profile: &ConnectionProfile) -> StateKey {
    (profile.kind(), profile.identifier.clone())
}
