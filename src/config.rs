//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `HOLOCRON_RUNTIME_DIR`, `HOLOCRON_LOG_DIR`,
//!    `HOLOCRON_HELPERS_DIR`, `HOLOCRON_LOG_LEVEL`
//! 2. **Config file**: path via `--config <path>`, or `holocron.toml` in CWD,
//!    or `~/.config/holocron/holocron.toml`
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The resulting [`Config`] is immutable and shared by every component.
//!
//! ```toml
//! [paths]
//! runtime_dir = "/tmp/holocron"       # lock, config, log, credential artifacts
//! log_dir = "~/.local/state/holocron" # agent log
//! helpers_dir = "/usr/lib/holocron"   # backend launcher scripts
//!
//! [logging]
//! level = "info"
//! file = "holocron.log"
//! tail_lines = 200
//!
//! [timeouts]
//! helper_start_secs = 45
//! helper_stop_secs = 10
//! ssh_settle_ms = 2000
//! openvpn_verify_secs = 20
//! log_poll_ms = 250
//! terminate_grace_ms = 3000
//! stop_wait_ms = 5000
//! tcp_ping_secs = 2
//! web_check_secs = 10
//!
//! [privilege]
//! elevate_command = ["sudo", "-n"]
//! elevate_openvpn = true
//!
//! [programs]
//! ssh_helper = "holocron-ssh"
//! v2ray_helper = "holocron-v2ray"
//! openvpn = "openvpn"
//! ss_local = "ss-local"
//!
//! [diagnostics]
//! ping_host = "youtube.com"
//! ping_port = 443
//! web_check_url = "https://www.google.com/generate_204"
//! user_agent = "HolocronStatusCheck/1.0"
//! default_socks_port = 1080
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::util::expand_tilde;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub privilege: PrivilegeConfig,
    #[serde(default)]
    pub programs: ProgramsConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

/// Filesystem locations.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Directory holding per-connection artifacts (default `$XDG_RUNTIME_DIR/holocron`
    /// or `<tmp>/holocron`). Override with `HOLOCRON_RUNTIME_DIR`.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: String,
    /// Directory for the agent's own log file. Override with `HOLOCRON_LOG_DIR`.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Directory containing the backend helper scripts. Relative program names
    /// in `[programs]` are resolved against it when the file exists there.
    #[serde(default = "default_helpers_dir")]
    pub helpers_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Agent log file name inside `paths.log_dir`.
    #[serde(default = "default_log_file")]
    pub file: String,
    /// Lines returned by `getLogs` (default 200).
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

/// Every bounded wait the orchestrator performs.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_helper_start_secs")]
    pub helper_start_secs: u64,
    #[serde(default = "default_helper_stop_secs")]
    pub helper_stop_secs: u64,
    /// Delay before re-detecting SSH after the helper reports success.
    #[serde(default = "default_ssh_settle_ms")]
    pub ssh_settle_ms: u64,
    /// Log-tail verification deadline (OpenVPN, also bounds Shadowsocks startup).
    #[serde(default = "default_openvpn_verify_secs")]
    pub openvpn_verify_secs: u64,
    #[serde(default = "default_log_poll_ms")]
    pub log_poll_ms: u64,
    /// Time between SIGTERM and SIGKILL when terminating a child.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    /// How long `stop` waits for the managed process to exit.
    #[serde(default = "default_stop_wait_ms")]
    pub stop_wait_ms: u64,
    #[serde(default = "default_tcp_ping_secs")]
    pub tcp_ping_secs: u64,
    #[serde(default = "default_web_check_secs")]
    pub web_check_secs: u64,
}

/// Privilege elevation for backends that need root.
#[derive(Debug, Clone, Deserialize)]
pub struct PrivilegeConfig {
    /// Command prefix used for elevated launches, signals and removals.
    #[serde(default = "default_elevate_command")]
    pub elevate_command: Vec<String>,
    /// Launch OpenVPN through `elevate_command` (POSIX only, default true).
    #[serde(default = "default_elevate_openvpn")]
    pub elevate_openvpn: bool,
}

/// Backend programs.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgramsConfig {
    #[serde(default = "default_ssh_helper")]
    pub ssh_helper: String,
    #[serde(default = "default_v2ray_helper")]
    pub v2ray_helper: String,
    #[serde(default = "default_openvpn")]
    pub openvpn: String,
    #[serde(default = "default_ss_local")]
    pub ss_local: String,
}

/// Defaults for connectivity probes.
#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_ping_host")]
    pub ping_host: String,
    #[serde(default = "default_ping_port")]
    pub ping_port: u16,
    #[serde(default = "default_web_check_url")]
    pub web_check_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// SOCKS port assumed for V2Ray/Shadowsocks when the generated config
    /// cannot be read.
    #[serde(default = "default_socks_port")]
    pub default_socks_port: u16,
}

fn default_runtime_dir() -> String {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => format!("{dir}/holocron"),
        _ => std::env::temp_dir()
            .join("holocron")
            .to_string_lossy()
            .into_owned(),
    }
}
fn default_log_dir() -> String {
    "~/.local/state/holocron".to_string()
}
fn default_helpers_dir() -> String {
    "/usr/lib/holocron".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> String {
    "holocron.log".to_string()
}
fn default_tail_lines() -> usize {
    200
}
fn default_helper_start_secs() -> u64 {
    45
}
fn default_helper_stop_secs() -> u64 {
    10
}
fn default_ssh_settle_ms() -> u64 {
    2000
}
fn default_openvpn_verify_secs() -> u64 {
    20
}
fn default_log_poll_ms() -> u64 {
    250
}
fn default_terminate_grace_ms() -> u64 {
    3000
}
fn default_stop_wait_ms() -> u64 {
    5000
}
fn default_tcp_ping_secs() -> u64 {
    2
}
fn default_web_check_secs() -> u64 {
    10
}
fn default_elevate_command() -> Vec<String> {
    vec!["sudo".to_string(), "-n".to_string()]
}
fn default_elevate_openvpn() -> bool {
    cfg!(unix)
}
fn default_ssh_helper() -> String {
    "holocron-ssh".to_string()
}
fn default_v2ray_helper() -> String {
    "holocron-v2ray".to_string()
}
fn default_openvpn() -> String {
    "openvpn".to_string()
}
fn default_ss_local() -> String {
    "ss-local".to_string()
}
fn default_ping_host() -> String {
    "youtube.com".to_string()
}
fn default_ping_port() -> u16 {
    443
}
fn default_web_check_url() -> String {
    "https://www.google.com/generate_204".to_string()
}
fn default_user_agent() -> String {
    "HolocronStatusCheck/1.0".to_string()
}
fn default_socks_port() -> u16 {
    1080
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            log_dir: default_log_dir(),
            helpers_dir: default_helpers_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            tail_lines: default_tail_lines(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            helper_start_secs: default_helper_start_secs(),
            helper_stop_secs: default_helper_stop_secs(),
            ssh_settle_ms: default_ssh_settle_ms(),
            openvpn_verify_secs: default_openvpn_verify_secs(),
            log_poll_ms: default_log_poll_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            stop_wait_ms: default_stop_wait_ms(),
            tcp_ping_secs: default_tcp_ping_secs(),
            web_check_secs: default_web_check_secs(),
        }
    }
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            elevate_command: default_elevate_command(),
            elevate_openvpn: default_elevate_openvpn(),
        }
    }
}

impl Default for ProgramsConfig {
    fn default() -> Self {
        Self {
            ssh_helper: default_ssh_helper(),
            v2ray_helper: default_v2ray_helper(),
            openvpn: default_openvpn(),
            ss_local: default_ss_local(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            ping_host: default_ping_host(),
            ping_port: default_ping_port(),
            web_check_url: default_web_check_url(),
            user_agent: default_user_agent(),
            default_socks_port: default_socks_port(),
        }
    }
}

impl TimeoutsConfig {
    pub fn helper_start(&self) -> Duration {
        Duration::from_secs(self.helper_start_secs)
    }
    pub fn helper_stop(&self) -> Duration {
        Duration::from_secs(self.helper_stop_secs)
    }
    pub fn ssh_settle(&self) -> Duration {
        Duration::from_millis(self.ssh_settle_ms)
    }
    pub fn openvpn_verify(&self) -> Duration {
        Duration::from_secs(self.openvpn_verify_secs)
    }
    pub fn log_poll(&self) -> Duration {
        Duration::from_millis(self.log_poll_ms)
    }
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
    pub fn stop_wait(&self) -> Duration {
        Duration::from_millis(self.stop_wait_ms)
    }
    pub fn tcp_ping(&self) -> Duration {
        Duration::from_secs(self.tcp_ping_secs)
    }
    pub fn web_check(&self) -> Duration {
        Duration::from_secs(self.web_check_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// An explicit `path` must exist and parse. Without one, `holocron.toml` in
    /// the current directory and then the per-user config file are tried.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(expand_tilde(p).as_ref()))?
        } else if let Some(found) = Self::discover() {
            Self::from_file(&found)?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(dir) = std::env::var("HOLOCRON_RUNTIME_DIR") {
            config.paths.runtime_dir = dir;
        }
        if let Ok(dir) = std::env::var("HOLOCRON_LOG_DIR") {
            config.paths.log_dir = dir;
        }
        if let Ok(dir) = std::env::var("HOLOCRON_HELPERS_DIR") {
            config.paths.helpers_dir = dir;
        }
        if let Ok(level) = std::env::var("HOLOCRON_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from("holocron.toml");
        if local.exists() {
            return Some(local);
        }
        let user = PathBuf::from(expand_tilde("~/.config/holocron/holocron.toml").as_ref());
        user.exists().then_some(user)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }

    /// Directory for per-connection artifacts, tilde-expanded.
    pub fn runtime_dir(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.paths.runtime_dir).as_ref())
    }

    /// Full path of the agent log file.
    pub fn log_file(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.paths.log_dir).as_ref()).join(&self.logging.file)
    }

    /// Resolve a backend program: a bare name that exists in `helpers_dir` wins,
    /// otherwise the name is returned as-is for `PATH` lookup.
    pub fn program(&self, name: &str) -> PathBuf {
        let expanded = expand_tilde(name);
        let as_path = Path::new(expanded.as_ref());
        if as_path.components().count() == 1 {
            let candidate =
                PathBuf::from(expand_tilde(&self.paths.helpers_dir).as_ref()).join(as_path);
            if candidate.exists() {
                return candidate;
            }
        }
        as_path.to_path_buf()
    }

    /// Whether OpenVPN should be launched, signalled and cleaned up elevated.
    pub fn openvpn_elevated(&self) -> bool {
        cfg!(unix)
            && self.privilege.elevate_openvpn
            && !self.privilege.elevate_command.is_empty()
            && !crate::process::running_as_root()
    }
}
