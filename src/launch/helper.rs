//! Exit-code helper protocol (SSH and V2Ray launchers).
//!
//! | exit | meaning                         |
//! |------|---------------------------------|
//! | 0    | started / stopped               |
//! | 2    | precondition not met (message)  |
//! | 3    | already running, treated as ok  |
//! | *    | failure, output surfaced        |

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::artifacts::ArtifactSet;
use crate::error::TunnelError;
use crate::process::exec::{self, ExecError, ExecResult};
use crate::profile::{ConnectionProfile, SshSettings, V2RaySettings};

const EXIT_OK: i32 = 0;
const EXIT_PRECONDITION: i32 = 2;
const EXIT_ALREADY_RUNNING: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperOutcome {
    Done,
    AlreadyRunning,
}

/// Map a finished helper run onto the exit-code contract.
pub fn interpret_exit(result: &ExecResult, helper: &str) -> Result<HelperOutcome, TunnelError> {
    let output = result.combined_output();
    match result.exit_code {
        EXIT_OK => Ok(HelperOutcome::Done),
        EXIT_ALREADY_RUNNING => Ok(HelperOutcome::AlreadyRunning),
        EXIT_PRECONDITION => Err(TunnelError::Precondition(if output.is_empty() {
            format!("{helper}: precondition not met")
        } else {
            output
        })),
        code => Err(
            TunnelError::Process(format!("{helper} failed with exit code {code}"))
                .with_detail(&output),
        ),
    }
}

/// Run a helper to completion under `timeout` and interpret its exit code.
pub async fn run_helper(
    program: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<HelperOutcome, TunnelError> {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());
    debug!("Running {name} {}", args.join(" "));

    let result = exec::run(program, args, timeout).await.map_err(|e| match e {
        ExecError::Timeout(t) => TunnelError::Timeout(format!(
            "{name} did not finish within {}s",
            t.as_secs()
        )),
        other => TunnelError::from(other),
    })?;
    let outcome = interpret_exit(&result, &name)?;
    info!("{name} {} -> {outcome:?} in {}ms", args.first().map_or("", String::as_str), result.duration_ms);
    Ok(outcome)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn ssh_start_args(
    profile: &ConnectionProfile,
    ssh: &SshSettings,
    artifacts: &ArtifactSet,
) -> Result<Vec<String>, TunnelError> {
    let control = artifacts
        .control_socket
        .as_deref()
        .ok_or_else(|| TunnelError::Configuration("SSH artifacts lack a control path".into()))?;

    let mut args = vec![
        "start".to_string(),
        "--identifier".into(),
        artifacts.identifier.clone(),
        "--user".into(),
        ssh.user.clone(),
        "--host".into(),
        ssh.host.clone(),
        "--control-path".into(),
        path_arg(control),
        "--log-file".into(),
        path_arg(&artifacts.log),
    ];
    if let Some(cmd) = ssh.remote_command.as_deref().filter(|c| !c.trim().is_empty()) {
        args.push("--remote-command".into());
        args.push(cmd.to_string());
    }
    for ssid in &ssh.wifi_ssids {
        args.push("--wifi".into());
        args.push(ssid.clone());
    }
    for forward in &profile.port_forwards {
        args.extend(forward.helper_args()?);
    }
    Ok(args)
}

pub fn ssh_stop_args(artifacts: &ArtifactSet) -> Vec<String> {
    let mut args = vec![
        "stop".to_string(),
        "--identifier".into(),
        artifacts.identifier.clone(),
    ];
    if let Some(control) = &artifacts.control_socket {
        args.push("--control-path".into());
        args.push(path_arg(control));
    }
    args
}

pub fn v2ray_start_args(settings: &V2RaySettings, artifacts: &ArtifactSet) -> Vec<String> {
    vec![
        "start".to_string(),
        "--identifier".into(),
        artifacts.identifier.clone(),
        "--config".into(),
        path_arg(&artifacts.config),
        "--subscription-url".into(),
        settings.subscription_url.clone(),
        "--log-file".into(),
        path_arg(&artifacts.log),
    ]
}

pub fn v2ray_stop_args(artifacts: &ArtifactSet) -> Vec<String> {
    vec![
        "stop".to_string(),
        "--identifier".into(),
        artifacts.identifier.clone(),
        "--config".into(),
        path_arg(&artifacts.config),
    ]
}
