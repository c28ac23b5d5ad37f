//! Launch & verification engine.
//!
//! Start protocol per backend:
//!
//! | backend     | launch                         | verified by                      |
//! |-------------|--------------------------------|----------------------------------|
//! | SSH         | helper script, exit code       | settle delay + re-detection      |
//! | V2Ray       | helper script, exit code       | v2ray/xray process on our config |
//! | OpenVPN     | child, optionally elevated     | log tail patterns + liveness     |
//! | Shadowsocks | `ss-local` child               | liveness + local port listening  |
//!
//! Stale artifacts are removed before every start, and every failed start
//! cleans up after itself. The lock file is written only once a tunnel is
//! verified.
//!
//! - [`helper`]: exit-code helper protocol
//! - [`logtail`]: log-tail verifier
//! - [`openvpn`]: profile sanitiser, credentials
//! - [`generated`]: V2Ray / Shadowsocks JSON configs

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactManager, ArtifactSet};
use crate::config::Config;
use crate::detect::{self, Detector, TunnelStatus};
use crate::error::TunnelError;
use crate::extract;
use crate::ports;
use crate::process::{self, ProcessTable};
use crate::profile::{
    Backend, ConnectionProfile, OpenVpnSettings, ShadowsocksSettings, SshSettings, V2RaySettings,
};
use crate::util::tail_file;

pub mod generated;
pub mod helper;
pub mod logtail;
pub mod openvpn;

use logtail::{LogTail, Liveness, VerificationOutcome};

/// Lines of backend log appended to failure messages.
const FAILURE_TAIL_LINES: usize = 20;

/// A verified start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub socks_port: Option<u16>,
    /// The tunnel was already up; nothing was launched.
    pub already_running: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stopped {
    pub was_running: bool,
    pub message: String,
}

/// Starts, verifies and stops tunnels.
pub struct Engine {
    config: Arc<Config>,
    artifacts: ArtifactManager,
    table: Arc<dyn ProcessTable + Send + Sync>,
}

impl Engine {
    pub fn new(config: Arc<Config>, table: Arc<dyn ProcessTable + Send + Sync>) -> Self {
        let artifacts = ArtifactManager::new(&config);
        Self {
            config,
            artifacts,
            table,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn artifact_manager(&self) -> &ArtifactManager {
        &self.artifacts
    }

    pub fn artifacts_for(&self, profile: &ConnectionProfile) -> Result<ArtifactSet, TunnelError> {
        self.artifacts.artifacts(profile.kind(), &profile.identifier)
    }

    fn detector<'a>(
        &self,
        profile: &'a ConnectionProfile,
        set: &'a ArtifactSet,
    ) -> Box<dyn Detector + 'a> {
        detect::detector(profile, set, self.config.diagnostics.default_socks_port)
    }

    /// Current status, recomputed from the process table.
    pub fn detect(&self, profile: &ConnectionProfile) -> Result<TunnelStatus, TunnelError> {
        let set = self.artifacts_for(profile)?;
        let status = self.detector(profile, &set).detect(self.table.as_ref());
        Ok(status)
    }

    fn openvpn_elevation(&self) -> Option<&[String]> {
        self.config
            .openvpn_elevated()
            .then_some(self.config.privilege.elevate_command.as_slice())
    }

    /// Start and verify the tunnel for `profile`.
    pub async fn start(&self, profile: &ConnectionProfile) -> Result<Started, TunnelError> {
        profile.validate_for_start()?;
        let set = self.artifacts_for(profile)?;
        self.artifacts.ensure_runtime_dir().await?;

        {
            let detector = self.detector(profile, &set);
            if let Some(process) = detector.find(self.table.as_ref()) {
                info!("{} '{}' already running (pid {})", set.kind, set.identifier, process.pid);
                return Ok(Started {
                    socks_port: detector.socks_port(&process),
                    already_running: true,
                    message: format!(
                        "{} tunnel '{}' is already connected",
                        set.kind, profile.identifier
                    ),
                });
            }
        }

        self.artifacts.cleanup(&set).await;
        info!("Starting {} '{}'", set.kind, set.identifier);

        let result = match &profile.backend {
            Backend::Ssh(ssh) => self.start_ssh(profile, ssh, &set).await,
            Backend::OpenVpn(ovpn) => self.start_openvpn(ovpn, &set).await,
            Backend::V2Ray(v2) => self.start_v2ray(v2, &set).await,
            Backend::Shadowsocks(ss) => self.start_shadowsocks(ss, &set).await,
        };

        match result {
            Ok(socks_port) => {
                info!("{} '{}' connected, SOCKS port {socks_port:?}", set.kind, set.identifier);
                Ok(Started {
                    socks_port,
                    already_running: false,
                    message: format!("{} tunnel '{}' started", set.kind, profile.identifier),
                })
            }
            Err(e) => {
                warn!("{} '{}' failed to start: {e}", set.kind, set.identifier);
                self.artifacts.cleanup(&set).await;
                Err(e)
            }
        }
    }

    async fn start_ssh(
        &self,
        profile: &ConnectionProfile,
        ssh: &SshSettings,
        set: &ArtifactSet,
    ) -> Result<Option<u16>, TunnelError> {
        for forward in profile.port_forwards.iter().filter(|f| f.binds_locally()) {
            if let Some(owner) = ports::find_port_owner(forward.local_port).await {
                return Err(TunnelError::Precondition(format!(
                    "Local port {} is already in use by {owner}",
                    forward.local_port
                )));
            }
        }

        let args = helper::ssh_start_args(profile, ssh, set)?;
        let program = self.config.program(&self.config.programs.ssh_helper);
        helper::run_helper(&program, &args, self.config.timeouts.helper_start()).await?;

        tokio::time::sleep(self.config.timeouts.ssh_settle()).await;
        let detector = self.detector(profile, set);
        match detector.find(self.table.as_ref()) {
            Some(process) => Ok(detector.socks_port(&process)),
            None => Err(TunnelError::Process(
                "SSH helper reported success but no ssh process is running".into(),
            )
            .with_detail(&tail_file(&set.log, FAILURE_TAIL_LINES).await)),
        }
    }

    async fn start_openvpn(
        &self,
        settings: &OpenVpnSettings,
        set: &ArtifactSet,
    ) -> Result<Option<u16>, TunnelError> {
        openvpn::write_files(settings, set).await?;
        let with_credentials = settings.username.is_some() && settings.password.is_some();
        let program = self.config.program(&self.config.programs.openvpn);
        let elevate = self.openvpn_elevation();
        let args = openvpn::launch_args(set, with_credentials);
        let mut child = spawn_redirected(&program, &args, elevate, set)?;

        let mut tail = LogTail::new(&set.log);
        let outcome = logtail::verify_log(
            &mut tail,
            &mut child,
            &logtail::OPENVPN_PATTERNS,
            self.config.timeouts.openvpn_verify(),
            self.config.timeouts.log_poll(),
        )
        .await;
        debug!("OpenVPN '{}' verification: {outcome:?}", set.identifier);

        match outcome {
            VerificationOutcome::Connected(child_pid) => {
                let pid = find_process_using(self.table.as_ref(), &["openvpn"], &set.config)
                    .unwrap_or(child_pid);
                set.write_lock(pid).await?;
                if let Err(e) = tokio::fs::remove_file(&set.stderr).await {
                    debug!("stderr artifact not removed: {e}");
                }
                Ok(extract::openvpn_socks_port(&settings.profile_text))
            }
            VerificationOutcome::Failed(failure) => {
                logtail::terminate_child(&mut child, elevate, self.config.timeouts.terminate_grace()).await;
                Err(failure.into())
            }
            VerificationOutcome::TimedOut => {
                logtail::terminate_child(&mut child, elevate, self.config.timeouts.terminate_grace()).await;
                Err(TunnelError::Timeout(format!(
                    "OpenVPN did not connect within {}s",
                    self.config.timeouts.openvpn_verify().as_secs()
                ))
                .with_detail(&tail_file(&set.log, FAILURE_TAIL_LINES).await))
            }
            VerificationOutcome::Crashed(code) => Err(TunnelError::Process(format!(
                "OpenVPN exited with code {code} before connecting"
            ))
            .with_detail(&failure_output(set).await)),
        }
    }

    async fn start_v2ray(
        &self,
        settings: &V2RaySettings,
        set: &ArtifactSet,
    ) -> Result<Option<u16>, TunnelError> {
        let socks_port = settings
            .socks_port
            .unwrap_or(self.config.diagnostics.default_socks_port);
        let config = generated::v2ray_config(settings, socks_port)?;
        generated::write_config(&set.config, &config).await?;

        let program = self.config.program(&self.config.programs.v2ray_helper);
        let args = helper::v2ray_start_args(settings, set);
        helper::run_helper(&program, &args, self.config.timeouts.helper_start()).await?;

        let pid = self
            .wait_for_process(&["v2ray", "xray"], &set.config, self.config.timeouts.ssh_settle())
            .await
            .ok_or_else(|| {
                TunnelError::Process(
                    "V2Ray helper reported success but no v2ray/xray process uses its config".into(),
                )
            });
        let pid = match pid {
            Ok(pid) => pid,
            Err(e) => return Err(e.with_detail(&failure_output(set).await)),
        };
        set.write_lock(pid).await?;

        // The helper may have rewritten the config; its inbound port is authoritative.
        let written = tokio::fs::read_to_string(&set.config).await.ok();
        Ok(Some(
            written
                .as_deref()
                .and_then(extract::generated_socks_port)
                .unwrap_or(socks_port),
        ))
    }

    async fn start_shadowsocks(
        &self,
        settings: &ShadowsocksSettings,
        set: &ArtifactSet,
    ) -> Result<Option<u16>, TunnelError> {
        let endpoint = settings.resolve(self.config.diagnostics.default_socks_port)?;
        if let Some(owner) = ports::find_port_owner(endpoint.socks_port).await {
            return Err(TunnelError::Precondition(format!(
                "Local port {} is already in use by {owner}",
                endpoint.socks_port
            )));
        }
        generated::write_config(&set.config, &generated::shadowsocks_config(&endpoint)).await?;

        let program = self.config.program(&self.config.programs.ss_local);
        let args = vec!["-c".to_string(), set.config.to_string_lossy().into_owned()];
        let mut child = spawn_redirected(&program, &args, None, set)?;

        let deadline = tokio::time::Instant::now() + self.config.timeouts.openvpn_verify();
        loop {
            if let Some(code) = child.exit_code() {
                return Err(TunnelError::Process(format!(
                    "ss-local exited with code {code} before listening"
                ))
                .with_detail(&failure_output(set).await));
            }
            if ports::find_port_owner(endpoint.socks_port).await.is_some() {
                if let Some(pid) = child.id() {
                    set.write_lock(pid).await?;
                    return Ok(Some(endpoint.socks_port));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                logtail::terminate_child(&mut child, None, self.config.timeouts.terminate_grace()).await;
                return Err(TunnelError::Timeout(format!(
                    "ss-local did not listen on port {} within {}s",
                    endpoint.socks_port,
                    self.config.timeouts.openvpn_verify().as_secs()
                ))
                .with_detail(&failure_output(set).await));
            }
            tokio::time::sleep(self.config.timeouts.log_poll()).await;
        }
    }

    /// Poll the process table until a matching process appears.
    async fn wait_for_process(&self, tokens: &[&str], config: &Path, within: Duration) -> Option<u32> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if let Some(pid) = find_process_using(self.table.as_ref(), tokens, config) {
                return Some(pid);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.timeouts.log_poll()).await;
        }
    }

    /// Stop the tunnel for `profile`. Artifacts are always cleaned up, and
    /// stopping a tunnel that is not running succeeds.
    pub async fn stop(&self, profile: &ConnectionProfile) -> Result<Stopped, TunnelError> {
        let set = self.artifacts_for(profile)?;
        let running = self.detector(profile, &set).find(self.table.as_ref());
        let was_running = running.is_some();
        info!("Stopping {} '{}' (running: {was_running})", set.kind, set.identifier);

        let pid = running.as_ref().map(|p| p.pid);
        let result = match &profile.backend {
            Backend::Ssh(_) => {
                let program = self.config.program(&self.config.programs.ssh_helper);
                let socket_exists = set.control_socket.as_deref().is_some_and(Path::exists);
                self.stop_with_helper(&program, helper::ssh_stop_args(&set), pid, was_running || socket_exists)
                    .await
            }
            Backend::V2Ray(_) => {
                let program = self.config.program(&self.config.programs.v2ray_helper);
                self.stop_with_helper(&program, helper::v2ray_stop_args(&set), pid, was_running)
                    .await
            }
            Backend::OpenVpn(_) => self.terminate(pid, self.openvpn_elevation()).await,
            Backend::Shadowsocks(_) => self.terminate(pid, None).await,
        };

        self.artifacts.cleanup(&set).await;
        result?;

        Ok(Stopped {
            was_running,
            message: if was_running {
                format!("{} tunnel '{}' stopped", set.kind, profile.identifier)
            } else {
                format!("{} tunnel '{}' was not running", set.kind, profile.identifier)
            },
        })
    }

    /// Ask the helper to stop, then make sure the process is gone.
    async fn stop_with_helper(
        &self,
        program: &Path,
        args: Vec<String>,
        pid: Option<u32>,
        invoke_helper: bool,
    ) -> Result<(), TunnelError> {
        if invoke_helper {
            if let Err(e) = helper::run_helper(program, &args, self.config.timeouts.helper_stop()).await {
                warn!("Stop helper failed, terminating directly: {e}");
            }
        }
        self.terminate(pid, None).await
    }

    async fn terminate(&self, pid: Option<u32>, elevate: Option<&[String]>) -> Result<(), TunnelError> {
        let Some(pid) = pid else {
            return Ok(());
        };
        if process::terminate_pid(pid, elevate, self.config.timeouts.terminate_grace()).await {
            return Ok(());
        }
        if process::wait_for_exit(pid, self.config.timeouts.stop_wait()).await {
            return Ok(());
        }
        Err(TunnelError::Timeout(format!(
            "Process {pid} did not exit within {}ms",
            self.config.timeouts.stop_wait().as_millis()
        )))
    }
}

/// Pid of a process named like one of `tokens` whose command line mentions `config`.
fn find_process_using(table: &dyn ProcessTable, tokens: &[&str], config: &Path) -> Option<u32> {
    let config = config.to_string_lossy();
    let processes = table
        .snapshot()
        .map_err(|e| warn!("Process table unavailable: {e}"))
        .ok()?;
    processes
        .into_iter()
        .find(|p| {
            let name = p.name.to_ascii_lowercase();
            tokens.iter().any(|t| name.contains(t))
                && p.cmdline.iter().any(|a| a.contains(config.as_ref()))
        })
        .map(|p| p.pid)
}

/// Spawn `program args` (through `elevate` if given) with stdout/stderr
/// redirected into the log and stderr artifacts.
fn spawn_redirected(
    program: &Path,
    args: &[String],
    elevate: Option<&[String]>,
    set: &ArtifactSet,
) -> Result<Child, TunnelError> {
    let io_err =
        |e: std::io::Error| TunnelError::Process(format!("Failed to open log artifact: {e}"));
    let stdout = std::fs::File::create(&set.log).map_err(io_err)?;
    let stderr = std::fs::File::create(&set.stderr).map_err(io_err)?;

    let mut cmd = match elevate.and_then(|p| p.split_first()) {
        Some((elevator, rest)) => {
            let mut cmd = Command::new(elevator);
            cmd.args(rest).arg(program);
            cmd
        }
        None => Command::new(program),
    };
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    let child = cmd
        .spawn()
        .map_err(|e| TunnelError::Process(format!("Failed to start {}: {e}", program.display())))?;
    debug!("Spawned {} (pid {:?})", program.display(), child.id());
    Ok(child)
}

/// Tail of stderr then log, for crash reports.
async fn failure_output(set: &ArtifactSet) -> String {
    let stderr = tail_file(&set.stderr, FAILURE_TAIL_LINES).await;
    let log = tail_file(&set.log, FAILURE_TAIL_LINES).await;
    [stderr, log]
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SystemProcessTable;
    use serde_json::json;

    fn engine(dir: &Path) -> Engine {
        engine_with(dir, |_| {})
    }

    fn engine_with(dir: &Path, tweak: impl FnOnce(&mut Config)) -> Engine {
        let mut config = Config::default();
        config.paths.runtime_dir = dir.join("run").to_string_lossy().into_owned();
        config.paths.helpers_dir = dir.join("helpers").to_string_lossy().into_owned();
        config.privilege.elevate_openvpn = false;
        config.timeouts.openvpn_verify_secs = 5;
        config.timeouts.log_poll_ms = 20;
        config.timeouts.terminate_grace_ms = 500;
        config.timeouts.stop_wait_ms = 1000;
        config.timeouts.ssh_settle_ms = 100;
        tweak(&mut config);
        Engine::new(Arc::new(config), Arc::new(SystemProcessTable))
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn profile(value: serde_json::Value) -> ConnectionProfile {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_for_every_backend() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        for value in [
            json!({ "type": "openvpn", "identifier": "never" }),
            json!({ "type": "shadowsocks", "identifier": "never" }),
            json!({ "type": "v2ray", "identifier": "never" }),
        ] {
            let p = profile(value);
            let first = engine.stop(&p).await.unwrap();
            assert!(!first.was_running);
            assert!(engine.stop(&p).await.is_ok());
            assert_eq!(engine.detect(&p).unwrap(), TunnelStatus::disconnected());
        }
    }

    #[tokio::test]
    async fn test_ssh_port_conflict_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let p = profile(json!({
            "type": "ssh",
            "identifier": "work1",
            "user": "me",
            "host": "bastion",
            "portForwards": [{ "kind": "Dynamic", "localPort": port }]
        }));
        // The helper does not exist: reaching it would be a ProcessError.
        let err = engine.start(&p).await.unwrap_err();
        assert_eq!(err.kind(), "PreconditionError");
        assert!(err.message().contains(&port.to_string()));
        drop(listener);
    }

    #[tokio::test]
    async fn test_start_rejects_incomplete_profile() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let err = engine
            .start(&profile(json!({ "type": "v2ray", "identifier": "v" })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[tokio::test]
    async fn test_stale_lock_healed_on_start_path() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let p = profile(json!({ "type": "shadowsocks", "identifier": "s" }));
        let set = engine.artifacts_for(&p).unwrap();
        engine.artifact_manager().ensure_runtime_dir().await.unwrap();
        std::fs::write(&set.lock, "4194303\n").unwrap();
        assert!(!engine.detect(&p).unwrap().connected);
        assert!(!set.lock.exists());
    }

    /// Install an executable shell script as `helpers/<name>`.
    fn install_helper(dir: &Path, name: &str, body: &str) {
        let helpers = dir.join("helpers");
        std::fs::create_dir_all(&helpers).unwrap();
        let path = helpers.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_openvpn_auth_failure_leaves_no_lock() {
        let dir = tempfile::tempdir().unwrap();
        install_helper(
            dir.path(),
            "openvpn",
            "echo 'OpenVPN 2.6.8 x86_64'\necho 'AUTH: Received control message: AUTH_FAILED'\nsleep 30\n",
        );
        let engine = engine(dir.path());
        let p = profile(json!({
            "type": "openvpn",
            "identifier": "office",
            "ovpnProfile": "client\nremote vpn.example.com 1194\n",
            "username": "alice",
            "password": "wrong"
        }));
        let err = engine.start(&p).await.unwrap_err();
        assert_eq!(err.kind(), "AuthenticationError");
        assert!(err.message().contains("Authentication failed"));
        let set = engine.artifacts_for(&p).unwrap();
        assert!(!set.lock.exists());
        assert!(set.existing().is_empty());
    }

    #[tokio::test]
    async fn test_openvpn_start_detect_stop() {
        let dir = tempfile::tempdir().unwrap();
        install_helper(
            dir.path(),
            "openvpn",
            "echo 'Initialization Sequence Completed'\nsleep 30\n",
        );
        let engine = engine(dir.path());
        let p = profile(json!({
            "type": "openvpn",
            "identifier": "office",
            "ovpnProfile": "client\nsocks-proxy 127.0.0.1 9050\n"
        }));

        let started = engine.start(&p).await.unwrap();
        assert_eq!(started.socks_port, Some(9050));
        assert!(!started.already_running);
        let set = engine.artifacts_for(&p).unwrap();
        assert!(set.lock.exists());
        assert!(!set.stderr.exists());
        assert_eq!(engine.detect(&p).unwrap(), TunnelStatus::connected(Some(9050)));

        let again = engine.start(&p).await.unwrap();
        assert!(again.already_running);

        let stopped = engine.stop(&p).await.unwrap();
        assert!(stopped.was_running);
        assert!(set.existing().is_empty());
        assert_eq!(engine.detect(&p).unwrap(), TunnelStatus::disconnected());
    }

    /// SSH launcher that backgrounds `helpers/ssh` with the forwarded port
    /// and control path, the way the real helper leaves `ssh -N` running.
    const SSH_HELPER: &str = r#"[ "$1" = start ] || exit 0
while [ $# -gt 0 ]; do
  case "$1" in
    --control-path) ctl="$2"; shift ;;
    --log-file) log="$2"; shift ;;
    --dynamic) port="$2"; shift ;;
  esac
  shift
done
echo "debug1: Authentication succeeded (publickey)." > "$log"
"$(dirname "$0")/ssh" -N -D "$port" -S "$ctl" bastion >/dev/null 2>&1 &
exit 0
"#;

    #[tokio::test]
    async fn test_ssh_start_detect_stop() {
        let dir = tempfile::tempdir().unwrap();
        install_helper(dir.path(), "holocron-ssh", SSH_HELPER);
        install_helper(dir.path(), "ssh", "sleep 30\n");
        let engine = engine(dir.path());
        let port = free_port();
        let p = profile(json!({
            "type": "ssh",
            "identifier": "fwd-ok",
            "user": "me",
            "host": "bastion",
            "portForwards": [{ "kind": "Dynamic", "localPort": port }]
        }));

        let started = engine.start(&p).await.unwrap();
        assert_eq!(started.socks_port, Some(port));
        assert!(!started.already_running);
        assert_eq!(engine.detect(&p).unwrap(), TunnelStatus::connected(Some(port)));

        let again = engine.start(&p).await.unwrap();
        assert!(again.already_running);
        assert_eq!(again.socks_port, Some(port));

        let stopped = engine.stop(&p).await.unwrap();
        assert!(stopped.was_running);
        assert_eq!(engine.detect(&p).unwrap(), TunnelStatus::disconnected());
        assert!(engine.artifacts_for(&p).unwrap().existing().is_empty());
    }

    #[tokio::test]
    async fn test_ssh_helper_success_without_process_reports_log() {
        let dir = tempfile::tempdir().unwrap();
        install_helper(
            dir.path(),
            "holocron-ssh",
            r#"while [ $# -gt 0 ]; do
  [ "$1" = --log-file ] && log="$2"
  shift
done
echo "me@bastion: Permission denied (publickey)." > "$log"
exit 0
"#,
        );
        let engine = engine(dir.path());
        let p = profile(json!({
            "type": "ssh",
            "identifier": "fwd-gone",
            "user": "me",
            "host": "bastion",
            "portForwards": [{ "kind": "Dynamic", "localPort": free_port() }]
        }));

        let err = engine.start(&p).await.unwrap_err();
        assert_eq!(err.kind(), "ProcessError");
        assert!(err.message().contains("no ssh process is running"));
        assert!(err.message().contains("Permission denied (publickey)"));
        assert!(engine.artifacts_for(&p).unwrap().existing().is_empty());
    }

    #[tokio::test]
    async fn test_v2ray_start_detect_stop() {
        let dir = tempfile::tempdir().unwrap();
        install_helper(
            dir.path(),
            "holocron-v2ray",
            r#"[ "$1" = start ] || exit 0
while [ $# -gt 0 ]; do
  [ "$1" = --config ] && cfg="$2"
  shift
done
"$(dirname "$0")/xray" run -c "$cfg" >/dev/null 2>&1 &
exit 0
"#,
        );
        install_helper(dir.path(), "xray", "sleep 30\n");
        let engine = engine(dir.path());
        let p = profile(json!({
            "type": "v2ray",
            "identifier": "edge",
            "subscriptionUrl": "vless://0b1c2d3e-aaaa-bbbb-cccc-123456789abc@edge.example.com:443?security=tls#Edge",
            "socksPort": 10808
        }));

        let started = engine.start(&p).await.unwrap();
        assert_eq!(started.socks_port, Some(10808));
        let set = engine.artifacts_for(&p).unwrap();
        let pid: u32 = std::fs::read_to_string(&set.lock).unwrap().trim().parse().unwrap();
        assert!(process::pid_alive(pid));
        assert_eq!(engine.detect(&p).unwrap(), TunnelStatus::connected(Some(10808)));

        let stopped = engine.stop(&p).await.unwrap();
        assert!(stopped.was_running);
        assert!(set.existing().is_empty());
        assert!(process::wait_for_exit(pid, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_shadowsocks_verified_by_listening_port() {
        let dir = tempfile::tempdir().unwrap();
        install_helper(dir.path(), "ss-local", "sleep 30\n");
        let engine = engine(dir.path());
        let port = free_port();
        let p = profile(json!({
            "type": "shadowsocks",
            "identifier": "home",
            "server": "ss.example.com",
            "port": 8388,
            "password": "secret",
            "method": "aes-256-gcm",
            "socksPort": port
        }));

        // Stands in for ss-local opening its SOCKS listener.
        let listening = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(listener);
        });

        let started = engine.start(&p).await.unwrap();
        assert_eq!(started.socks_port, Some(port));
        let set = engine.artifacts_for(&p).unwrap();
        assert!(set.lock.exists());
        assert_eq!(engine.detect(&p).unwrap(), TunnelStatus::connected(Some(port)));

        let stopped = engine.stop(&p).await.unwrap();
        assert!(stopped.was_running);
        assert!(set.existing().is_empty());
        listening.abort();
    }

    #[tokio::test]
    async fn test_shadowsocks_never_listening_times_out() {
        let dir = tempfile::tempdir().unwrap();
        install_helper(dir.path(), "ss-local", "echo 'INFO: initializing ciphers'\nsleep 30\n");
        let engine = engine_with(dir.path(), |c| c.timeouts.openvpn_verify_secs = 1);
        let p = profile(json!({
            "type": "shadowsocks",
            "identifier": "silent",
            "server": "ss.example.com",
            "port": 8388,
            "password": "secret",
            "method": "aes-256-gcm",
            "socksPort": free_port()
        }));

        let err = engine.start(&p).await.unwrap_err();
        assert_eq!(err.kind(), "TimeoutError");
        assert!(err.message().contains("did not listen"));
        assert!(err.message().contains("initializing ciphers"));
        let set = engine.artifacts_for(&p).unwrap();
        assert!(!set.lock.exists());
        assert!(set.existing().is_empty());
        assert!(!engine.detect(&p).unwrap().connected);
    }
}
