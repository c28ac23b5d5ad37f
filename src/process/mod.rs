//! OS process table access and signalling.
//!
//! Detection never trusts a stored pid alone: it asks the OS through a
//! [`ProcessTable`]. The production table is backed by `sysinfo`; tests plug
//! in a fixed list.
//!
//! - [`exec`]: bounded one-shot execution for helpers and elevated commands

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid as NixPid;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tracing::{debug, warn};

use crate::error::TunnelError;

pub mod exec;

/// The subset of a process-table entry the orchestrator looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Short program name (`comm` on Linux).
    pub name: String,
    pub cmdline: Vec<String>,
    /// Whether the process runs as the same user as this agent.
    pub owned_by_current_user: bool,
}

impl ProcessInfo {
    pub fn cmdline_string(&self) -> String {
        self.cmdline.join(" ")
    }
}

/// Read access to the OS process table.
pub trait ProcessTable {
    /// Every visible process. An error means the table itself could not be
    /// read; individual unreadable entries are simply absent.
    fn snapshot(&self) -> Result<Vec<ProcessInfo>, TunnelError>;

    /// A single process, or `None` if it does not exist (or is not visible).
    fn lookup(&self, pid: u32) -> Option<ProcessInfo>;
}

/// [`ProcessTable`] backed by `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessInfo>, TunnelError> {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
        );
        let me = current_uid(&sys);
        let list: Vec<ProcessInfo> = sys
            .processes()
            .values()
            .map(|p| to_info(p, me.as_ref()))
            .collect();
        // At minimum this agent itself must be listed.
        if list.is_empty() {
            return Err(TunnelError::Process(
                "Process table is empty or unreadable".into(),
            ));
        }
        Ok(list)
    }

    fn lookup(&self, pid: u32) -> Option<ProcessInfo> {
        let mut sys = System::new();
        let target = Pid::from_u32(pid);
        if !sys.refresh_process_specifics(target, ProcessRefreshKind::everything()) {
            return None;
        }
        if let Ok(own) = sysinfo::get_current_pid() {
            sys.refresh_process_specifics(own, ProcessRefreshKind::everything());
        }
        let me = current_uid(&sys);
        sys.process(target).map(|p| to_info(p, me.as_ref()))
    }
}

fn current_uid(sys: &System) -> Option<sysinfo::Uid> {
    sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid))
        .and_then(|p| p.user_id().cloned())
}

fn to_info(process: &sysinfo::Process, me: Option<&sysinfo::Uid>) -> ProcessInfo {
    ProcessInfo {
        pid: process.pid().as_u32(),
        name: process.name().to_string(),
        cmdline: process.cmd().to_vec(),
        owned_by_current_user: match (process.user_id(), me) {
            (Some(owner), Some(me)) => owner == me,
            _ => false,
        },
    }
}

/// Whether this agent runs with root privileges.
pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Whether a pid currently exists. A process we may not signal (EPERM)
/// still counts as alive; a zombie does not.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match signal::kill(NixPid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// An exited but unreaped process still answers signal 0.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let after_comm = stat.rsplit_once(')')?.1;
            after_comm.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Send `sig` to `pid`, through the elevation prefix when `elevate` is set.
///
/// A process that no longer exists is not an error.
pub async fn send_signal(
    pid: u32,
    sig: Signal,
    elevate: Option<&[String]>,
) -> Result<(), TunnelError> {
    let raw = i32::try_from(pid)
        .map_err(|_| TunnelError::Process(format!("Invalid pid {pid}")))?;

    if let Some(prefix) = elevate.filter(|p| !p.is_empty()) {
        let name = sig.as_str().trim_start_matches("SIG").to_string();
        let result = exec::run_elevated(
            prefix,
            "kill",
            &["-s".to_string(), name, pid.to_string()],
            Duration::from_secs(10),
        )
        .await?;
        if result.exit_code != 0 && pid_alive(pid) {
            return Err(TunnelError::Process(format!(
                "Elevated kill of pid {pid} failed: {}",
                result.combined_output()
            )));
        }
        return Ok(());
    }

    match signal::kill(NixPid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(TunnelError::Process(format!(
            "Failed to send {sig} to pid {pid}: {e}"
        ))),
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns whether the process is gone.
pub async fn terminate_pid(pid: u32, elevate: Option<&[String]>, grace: Duration) -> bool {
    if !pid_alive(pid) {
        return true;
    }
    if let Err(e) = send_signal(pid, Signal::SIGTERM, elevate).await {
        warn!("SIGTERM to pid {pid} failed: {e}");
    }
    if wait_for_exit(pid, grace).await {
        return true;
    }
    debug!("pid {pid} still alive after {}ms, sending SIGKILL", grace.as_millis());
    if let Err(e) = send_signal(pid, Signal::SIGKILL, elevate).await {
        warn!("SIGKILL to pid {pid} failed: {e}");
    }
    wait_for_exit(pid, Duration::from_secs(1)).await
}

/// Poll until `pid` disappears or `timeout` elapses.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Fixed process list for tests.
#[cfg(test)]
pub(crate) struct FakeProcessTable(pub Vec<ProcessInfo>);

#[cfg(test)]
impl ProcessTable for FakeProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessInfo>, TunnelError> {
        Ok(self.0.clone())
    }

    fn lookup(&self, pid: u32) -> Option<ProcessInfo> {
        self.0.iter().find(|p| p.pid == pid).cloned()
    }
}
