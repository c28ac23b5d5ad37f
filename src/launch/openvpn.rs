//! OpenVPN profile preparation and launch.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::artifacts::ArtifactSet;
use crate::error::TunnelError;
use crate::profile::OpenVpnSettings;

/// Directives that would move logging, daemonize, or otherwise fight the
/// orchestrator's control of the process.
const STRIPPED_DIRECTIVES: &[&str] = &[
    "log",
    "log-append",
    "status",
    "status-version",
    "daemon",
    "writepid",
    "syslog",
    "comp-lzo",
    "compress",
    "management",
    "management-hold",
    "management-query-passwords",
];

/// Copy of `profile` with conflicting directives removed. With
/// `own_credentials` any `auth-user-pass` line is dropped too; the
/// credential file goes on the command line. Inline blocks
/// (`<ca>...</ca>`) are passed through untouched.
pub fn sanitize_profile(profile: &str, own_credentials: bool) -> String {
    let mut out = String::with_capacity(profile.len());
    let mut inline_block: Option<String> = None;

    for line in profile.lines() {
        let trimmed = line.trim();
        if let Some(tag) = &inline_block {
            if trimmed.eq_ignore_ascii_case(&format!("</{tag}>")) {
                inline_block = None;
            }
            out.push_str(line);
            out.push('\n');
            continue;
        }
        if let Some(tag) = trimmed
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .filter(|t| !t.starts_with('/'))
        {
            inline_block = Some(tag.to_string());
            out.push_str(line);
            out.push('\n');
            continue;
        }

        let directive = trimmed
            .trim_start_matches("--")
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let strip = STRIPPED_DIRECTIVES.contains(&directive.as_str())
            || (own_credentials && directive == "auth-user-pass");
        if !strip {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Write the sanitised profile and, when given, the owner-only credential file.
pub async fn write_files(settings: &OpenVpnSettings, artifacts: &ArtifactSet) -> Result<(), TunnelError> {
    let creds = settings.username.as_deref().zip(settings.password.as_deref());
    let sanitized = sanitize_profile(&settings.profile_text, creds.is_some());
    tokio::fs::write(&artifacts.config, sanitized)
        .await
        .map_err(|e| TunnelError::Process(format!("Failed to write OpenVPN config: {e}")))?;

    if let (Some((user, pass)), Some(path)) = (creds, artifacts.credentials.as_deref()) {
        write_credentials(path, user, pass).await?;
    }
    Ok(())
}

async fn write_credentials(path: &Path, user: &str, pass: &str) -> Result<(), TunnelError> {
    let io_err = |e: std::io::Error| {
        TunnelError::Process(format!("Failed to write OpenVPN credentials: {e}"))
    };
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await.map_err(io_err)?;
    file.write_all(format!("{user}\n{pass}\n").as_bytes())
        .await
        .map_err(io_err)?;
    file.flush().await.map_err(io_err)
}

/// OpenVPN arguments: the sanitised config plus the credential file if any.
pub fn launch_args(artifacts: &ArtifactSet, with_credentials: bool) -> Vec<String> {
    let mut args = vec![
        "--config".to_string(),
        artifacts.config.to_string_lossy().into_owned(),
    ];
    if let Some(cred) = artifacts.credentials.as_ref().filter(|_| with_credentials) {
        args.push("--auth-user-pass".into());
        args.push(cred.to_string_lossy().into_owned());
    }
    args
}
