//! Log-tail establishment verification.
//!
//! The backend's log artifact is followed with a persistent byte cursor; each
//! complete new line is checked against failure and success patterns while
//! the child's liveness is polled on the same cycle. The loop is bounded by
//! an unconditional deadline.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use nix::sys::signal::Signal;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Child;
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::process;

/// Result of following a freshly launched backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Connected(u32),
    Failed(LogFailure),
    TimedOut,
    /// The child exited first; `-1` when killed by a signal.
    Crashed(i32),
}

/// A failure pattern that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFailure {
    pub reason: &'static str,
    pub line: String,
    pub authentication: bool,
}

impl From<LogFailure> for TunnelError {
    fn from(f: LogFailure) -> Self {
        let message = format!("{}: {}", f.reason, f.line);
        if f.authentication {
            TunnelError::Authentication(message)
        } else {
            TunnelError::Process(message)
        }
    }
}

struct FailurePattern {
    regex: Regex,
    reason: &'static str,
    authentication: bool,
}

/// Success and failure patterns for one backend's log.
pub struct LogPatterns {
    success: Regex,
    failures: Vec<FailurePattern>,
}

impl LogPatterns {
    fn classify(&self, line: &str) -> Option<Result<(), LogFailure>> {
        if let Some(f) = self.failures.iter().find(|f| f.regex.is_match(line)) {
            return Some(Err(LogFailure {
                reason: f.reason,
                line: line.trim().to_string(),
                authentication: f.authentication,
            }));
        }
        self.success.is_match(line).then_some(Ok(()))
    }
}

fn pattern(re: &str) -> Regex {
    Regex::new(re).expect("static regex")
}

pub static OPENVPN_PATTERNS: LazyLock<LogPatterns> = LazyLock::new(|| LogPatterns {
    success: pattern(r"Initialization Sequence Completed"),
    failures: vec![
        FailurePattern {
            regex: pattern(r"AUTH_FAILED|Auth username/password failed|auth-failure"),
            reason: "Authentication failed",
            authentication: true,
        },
        FailurePattern {
            regex: pattern(r"RESOLVE: Cannot resolve host|Cannot resolve host address"),
            reason: "Could not resolve VPN server address",
            authentication: false,
        },
        FailurePattern {
            regex: pattern(r"TLS Error|TLS handshake failed"),
            reason: "TLS handshake failed",
            authentication: false,
        },
        FailurePattern {
            regex: pattern(r"Exiting due to fatal error|Options error|ERROR: Cannot open TUN/TAP"),
            reason: "OpenVPN reported a fatal error",
            authentication: false,
        },
    ],
});

/// Incremental reader over a growing log file.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    /// Bytes of an unterminated last line; decoded once the line completes.
    partial: Vec<u8>,
}

impl LogTail {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    /// Complete lines appended since the last call. A missing file yields
    /// nothing; a truncated file is re-read from the start.
    pub async fn poll(&mut self) -> Vec<String> {
        let Ok(mut file) = tokio::fs::File::open(&self.path).await else {
            return Vec::new();
        };
        let len = match file.metadata().await {
            Ok(m) => m.len(),
            Err(_) => return Vec::new(),
        };
        if len < self.offset {
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset || file.seek(SeekFrom::Start(self.offset)).await.is_err() {
            return Vec::new();
        }

        let mut buf = Vec::new();
        if file.read_to_end(&mut buf).await.is_err() {
            return Vec::new();
        }
        self.offset += buf.len() as u64;
        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

/// Child-process liveness as seen by the verifier.
pub trait Liveness {
    fn pid(&self) -> Option<u32>;
    /// `Some(code)` once the process has exited.
    fn exit_code(&mut self) -> Option<i32>;
}

impl Liveness for Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    fn exit_code(&mut self) -> Option<i32> {
        match self.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                warn!("try_wait failed: {e}");
                None
            }
        }
    }
}

/// Follow `tail` until a pattern matches, the child exits, or `timeout` elapses.
pub async fn verify_log(
    tail: &mut LogTail,
    child: &mut impl Liveness,
    patterns: &LogPatterns,
    timeout: Duration,
    poll: Duration,
) -> VerificationOutcome {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for line in tail.poll().await {
            debug!("[log] {line}");
            match patterns.classify(&line) {
                Some(Err(failure)) => return VerificationOutcome::Failed(failure),
                Some(Ok(())) => {
                    return match child.pid() {
                        Some(pid) => VerificationOutcome::Connected(pid),
                        None => VerificationOutcome::Crashed(child.exit_code().unwrap_or(-1)),
                    }
                }
                None => {}
            }
        }

        if let Some(code) = child.exit_code() {
            // Last lines written before exit may explain it.
            for line in tail.poll().await {
                if let Some(Err(failure)) = patterns.classify(&line) {
                    return VerificationOutcome::Failed(failure);
                }
            }
            return VerificationOutcome::Crashed(code);
        }

        if tokio::time::Instant::now() >= deadline {
            return VerificationOutcome::TimedOut;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Graceful terminate, then force-kill after `grace`. With `elevate` the
/// signals go through the elevation prefix.
pub async fn terminate_child(child: &mut Child, elevate: Option<&[String]>, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = process::send_signal(pid, Signal::SIGTERM, elevate).await {
        warn!("SIGTERM to child {pid} failed: {e}");
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    debug!("child {pid} ignored SIGTERM, killing");
    if elevate.is_some() {
        if let Err(e) = process::send_signal(pid, Signal::SIGKILL, elevate).await {
            warn!("SIGKILL to child {pid} failed: {e}");
        }
    } else if let Err(e) = child.start_kill() {
        warn!("kill of child {pid} failed: {e}");
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::process::Stdio;

    use super::*;

    /// Liveness stub that never exits.
    struct AliveForever(u32);

    impl Liveness for AliveForever {
        fn pid(&self) -> Option<u32> {
            Some(self.0)
        }
        fn exit_code(&mut self) -> Option<i32> {
            None
        }
    }

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_tail_cursor_and_partial_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("o.log");
        let mut tail = LogTail::new(&log);
        assert!(tail.poll().await.is_empty());

        append(&log, "one\ntw");
        assert_eq!(tail.poll().await, vec!["one"]);
        append(&log, "o\nthree\n");
        assert_eq!(tail.poll().await, vec!["two", "three"]);
        assert!(tail.poll().await.is_empty());

        std::fs::write(&log, "fresh\n").unwrap();
        assert_eq!(tail.poll().await, vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_multibyte_char_split_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("o.log");
        let mut tail = LogTail::new(&log);

        let text = "peer CN=münchen-gw\n".as_bytes();
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;
        std::fs::write(&log, &text[..split]).unwrap();
        assert!(tail.poll().await.is_empty());

        let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        f.write_all(&text[split..]).unwrap();
        assert_eq!(tail.poll().await, vec!["peer CN=münchen-gw"]);
    }

    #[tokio::test]
    async fn test_failure_before_success_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("o.log");
        append(
            &log,
            "Mon Oct  5 OpenVPN 2.6\nAUTH: Received control message: AUTH_FAILED\nInitialization Sequence Completed\n",
        );
        let mut tail = LogTail::new(&log);
        let outcome = verify_log(
            &mut tail,
            &mut AliveForever(1),
            &OPENVPN_PATTERNS,
            Duration::from_secs(2),
            Duration::from_millis(20),
        )
        .await;
        let VerificationOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(failure.authentication);
        let err = TunnelError::from(failure);
        assert_eq!(err.kind(), "AuthenticationError");
        assert!(err.message().contains("Authentication failed"));
    }

    #[tokio::test]
    async fn test_success_line_connects() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("o.log");
        let mut tail = LogTail::new(&log);
        let writer = {
            let log = log.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                append(&log, "Peer Connection Initiated\nInitialization Sequence Completed\n");
            })
        };
        let outcome = verify_log(
            &mut tail,
            &mut AliveForever(4321),
            &OPENVPN_PATTERNS,
            Duration::from_secs(3),
            Duration::from_millis(20),
        )
        .await;
        writer.await.unwrap();
        assert_eq!(outcome, VerificationOutcome::Connected(4321));
    }

    #[tokio::test]
    async fn test_silent_child_times_out_and_is_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("o.log");
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let mut tail = LogTail::new(&log);
        let outcome = verify_log(
            &mut tail,
            &mut child,
            &OPENVPN_PATTERNS,
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(outcome, VerificationOutcome::TimedOut);

        terminate_child(&mut child, None, Duration::from_secs(2)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_child_exit_is_crash() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("o.log");
        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exit 4"])
            .spawn()
            .unwrap();
        let mut tail = LogTail::new(&log);
        let outcome = verify_log(
            &mut tail,
            &mut child,
            &OPENVPN_PATTERNS,
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(outcome, VerificationOutcome::Crashed(4));
    }
}
