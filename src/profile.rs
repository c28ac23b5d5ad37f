//! Connection profiles as sent by the controller.
//!
//! A profile is decoded once per request into [`ConnectionProfile`]; the
//! `type` field selects a [`Backend`] variant and every later decision
//! dispatches on that variant rather than on the raw string.
//!
//! ```json
//! {
//!   "type": "ssh",
//!   "identifier": "work1",
//!   "user": "me",
//!   "host": "bastion.example.com",
//!   "wifiSsids": ["Office"],
//!   "portForwards": [{ "kind": "Dynamic", "localPort": 1080 }]
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;
use crate::uri::{self, ShareLink};

/// Backend discriminant, used wherever only the kind matters (artifact names,
/// `conn_type` request field, state keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "ssh")]
    Ssh,
    #[serde(rename = "openvpn")]
    OpenVpn,
    #[serde(rename = "v2ray")]
    V2Ray,
    #[serde(rename = "shadowsocks", alias = "ss")]
    Shadowsocks,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Ssh => "ssh",
            BackendKind::OpenVpn => "openvpn",
            BackendKind::V2Ray => "v2ray",
            BackendKind::Shadowsocks => "shadowsocks",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(BackendKind::Ssh),
            "openvpn" => Ok(BackendKind::OpenVpn),
            "v2ray" => Ok(BackendKind::V2Ray),
            "shadowsocks" | "ss" => Ok(BackendKind::Shadowsocks),
            other => Err(TunnelError::Configuration(format!(
                "Unknown connection type: {other}"
            ))),
        }
    }
}

/// One tunnel configuration, immutable for the duration of a request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    /// Stable key naming every artifact and correlating the live process.
    pub identifier: String,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
    #[serde(flatten)]
    pub backend: Backend,
}

/// Backend-specific settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Backend {
    #[serde(rename = "ssh")]
    Ssh(SshSettings),
    #[serde(rename = "openvpn")]
    OpenVpn(OpenVpnSettings),
    #[serde(rename = "v2ray")]
    V2Ray(V2RaySettings),
    #[serde(rename = "shadowsocks", alias = "ss")]
    Shadowsocks(ShadowsocksSettings),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshSettings {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub remote_command: Option<String>,
    /// The tunnel may only start while connected to one of these networks.
    #[serde(default, alias = "wifiRestriction")]
    pub wifi_ssids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenVpnSettings {
    /// Raw `.ovpn` profile text.
    #[serde(default, rename = "ovpnProfile", alias = "profile")]
    pub profile_text: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V2RaySettings {
    /// Subscription URL, or a single `vless://` share link.
    #[serde(default)]
    pub subscription_url: String,
    #[serde(default)]
    pub socks_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowsocksSettings {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub socks_port: Option<u16>,
    /// `ss://` share link; fills any field left empty above.
    #[serde(default)]
    pub uri: Option<String>,
}

/// Fully resolved Shadowsocks server parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowsocksEndpoint {
    pub server: String,
    pub port: u16,
    pub password: String,
    pub method: String,
    pub socks_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ForwardKind {
    Dynamic,
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    #[serde(alias = "type")]
    pub kind: ForwardKind,
    pub local_port: u16,
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
}

impl PortForward {
    /// Dynamic and Local forwards bind on this machine; Remote binds on the
    /// server and is exempt from the local port conflict check.
    pub fn binds_locally(&self) -> bool {
        matches!(self.kind, ForwardKind::Dynamic | ForwardKind::Local)
    }

    /// Helper flag pair for this forward, e.g. `["--local", "8080:db:5432"]`.
    pub fn helper_args(&self) -> Result<[String; 2], TunnelError> {
        match self.kind {
            ForwardKind::Dynamic => Ok(["--dynamic".into(), self.local_port.to_string()]),
            ForwardKind::Local | ForwardKind::Remote => {
                let (Some(host), Some(port)) = (self.remote_host.as_deref(), self.remote_port)
                else {
                    return Err(TunnelError::Configuration(format!(
                        "{:?} forward on port {} needs remoteHost and remotePort",
                        self.kind, self.local_port
                    )));
                };
                let flag = if self.kind == ForwardKind::Local {
                    "--local"
                } else {
                    "--remote"
                };
                Ok([flag.into(), format!("{}:{host}:{port}", self.local_port)])
            }
        }
    }
}

impl ConnectionProfile {
    pub fn kind(&self) -> BackendKind {
        match self.backend {
            Backend::Ssh(_) => BackendKind::Ssh,
            Backend::OpenVpn(_) => BackendKind::OpenVpn,
            Backend::V2Ray(_) => BackendKind::V2Ray,
            Backend::Shadowsocks(_) => BackendKind::Shadowsocks,
        }
    }

    /// Check the fields `start` needs. Status queries only need the identifier.
    pub fn validate_for_start(&self) -> Result<(), TunnelError> {
        if crate::util::file_safe(&self.identifier).is_none() {
            return Err(TunnelError::Configuration(
                "Connection identifier cannot be empty".into(),
            ));
        }
        match &self.backend {
            Backend::Ssh(s) => {
                if s.host.trim().is_empty() {
                    return Err(TunnelError::Configuration("SSH host is required".into()));
                }
                for forward in &self.port_forwards {
                    forward.helper_args()?;
                }
                Ok(())
            }
            Backend::OpenVpn(o) => {
                if o.profile_text.trim().is_empty() {
                    return Err(TunnelError::Configuration(
                        "OpenVPN profile text is required".into(),
                    ));
                }
                if o.username.is_some() != o.password.is_some() {
                    return Err(TunnelError::Configuration(
                        "OpenVPN username and password must be given together".into(),
                    ));
                }
                Ok(())
            }
            Backend::V2Ray(v) => {
                if v.subscription_url.trim().is_empty() {
                    return Err(TunnelError::Configuration(
                        "V2Ray subscription URL is required".into(),
                    ));
                }
                Ok(())
            }
            Backend::Shadowsocks(s) => s.resolve(1080).map(|_| ()),
        }
    }
}

impl ShadowsocksSettings {
    /// Merge discrete fields with the share link; discrete fields win.
    pub fn resolve(&self, default_socks_port: u16) -> Result<ShadowsocksEndpoint, TunnelError> {
        let from_link = match self.uri.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(link) => match uri::parse(link)? {
                ShareLink::Shadowsocks(ss) => Some(ss),
                ShareLink::Vless(_) => {
                    return Err(TunnelError::Configuration(
                        "Shadowsocks profile was given a vless:// link".into(),
                    ))
                }
            },
            None => None,
        };

        let pick = |own: &str, linked: Option<&str>| -> String {
            if own.trim().is_empty() {
                linked.unwrap_or_default().to_string()
            } else {
                own.to_string()
            }
        };

        let server = pick(&self.server, from_link.as_ref().map(|l| l.server.as_str()));
        let password = pick(&self.password, from_link.as_ref().map(|l| l.password.as_str()));
        let method = pick(&self.method, from_link.as_ref().map(|l| l.method.as_str()));
        let port = self.port.or(from_link.as_ref().map(|l| l.port));

        if server.is_empty() || password.is_empty() || method.is_empty() {
            return Err(TunnelError::Configuration(
                "Shadowsocks server, password and method are required".into(),
            ));
        }
        let Some(port) = port else {
            return Err(TunnelError::Configuration(
                "Shadowsocks server port is required".into(),
            ));
        };

        Ok(ShadowsocksEndpoint {
            server,
            port,
            password,
            method,
            socks_port: self.socks_port.unwrap_or(default_socks_port),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: serde_json::Value) -> ConnectionProfile {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_decode_ssh_profile() {
        let profile = decode(json!({
            "type": "ssh",
            "identifier": "work1",
            "user": "me",
            "host": "bastion",
            "wifiSsids": ["Office"],
            "portForwards": [
                { "kind": "Dynamic", "localPort": 1080 },
                { "type": "Remote", "localPort": 2222, "remoteHost": "localhost", "remotePort": 22 }
            ]
        }));
        assert_eq!(profile.kind(), BackendKind::Ssh);
        assert_eq!(profile.identifier, "work1");
        assert_eq!(profile.port_forwards[0].kind, ForwardKind::Dynamic);
        assert_eq!(profile.port_forwards[0].local_port, 1080);
        assert!(profile.port_forwards[0].binds_locally());
        assert!(!profile.port_forwards[1].binds_locally());
        let Backend::Ssh(ssh) = &profile.backend else {
            panic!("expected ssh backend");
        };
        assert_eq!(ssh.wifi_ssids, vec!["Office".to_string()]);
        assert!(profile.validate_for_start().is_ok());
    }

    #[test]
    fn test_decode_status_only_profile() {
        let profile = decode(json!({ "type": "openvpn", "identifier": "office" }));
        assert_eq!(profile.kind(), BackendKind::OpenVpn);
        assert!(matches!(
            profile.validate_for_start(),
            Err(TunnelError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_type_fails_to_decode() {
        let result: Result<ConnectionProfile, _> =
            serde_json::from_value(json!({ "type": "wireguard", "identifier": "x" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_forward_helper_args() {
        let local = PortForward {
            kind: ForwardKind::Local,
            local_port: 8080,
            remote_host: Some("db".into()),
            remote_port: Some(5432),
        };
        assert_eq!(local.helper_args().unwrap(), ["--local", "8080:db:5432"]);

        let incomplete = PortForward {
            kind: ForwardKind::Remote,
            local_port: 9000,
            remote_host: None,
            remote_port: None,
        };
        assert!(incomplete.helper_args().is_err());
    }

    #[test]
    fn test_shadowsocks_resolve_from_link() {
        // base64("aes-256-gcm:secret@ss.example.com:8388")
        let settings = ShadowsocksSettings {
            uri: Some("ss://YWVzLTI1Ni1nY206c2VjcmV0QHNzLmV4YW1wbGUuY29tOjgzODg=#home".into()),
            socks_port: Some(1086),
            ..ShadowsocksSettings::default()
        };
        let endpoint = settings.resolve(1080).unwrap();
        assert_eq!(endpoint.server, "ss.example.com");
        assert_eq!(endpoint.port, 8388);
        assert_eq!(endpoint.method, "aes-256-gcm");
        assert_eq!(endpoint.password, "secret");
        assert_eq!(endpoint.socks_port, 1086);
    }

    #[test]
    fn test_shadowsocks_missing_fields() {
        let settings = ShadowsocksSettings {
            server: "ss.example.com".into(),
            ..ShadowsocksSettings::default()
        };
        assert!(settings.resolve(1080).is_err());
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("SS".parse::<BackendKind>().unwrap(), BackendKind::Shadowsocks);
        assert_eq!("openvpn".parse::<BackendKind>().unwrap(), BackendKind::OpenVpn);
        assert!("tor".parse::<BackendKind>().is_err());
    }
}
