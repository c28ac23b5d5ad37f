//! SOCKS port extraction.
//!
//! Every function here is pure: callers hand in the text to inspect (a
//! captured command line, the caller-supplied OpenVPN profile, the generated
//! JSON config) and get `None` back when nothing matches.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::profile::{Backend, ConnectionProfile};

static SSH_DYNAMIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-D\s*(\d+)").expect("static regex"));

static OPENVPN_SOCKS_PROXY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*socks-proxy\s+127\.0\.0\.1\s+(\d+)").expect("static regex")
});

/// Port of the first `-D <port>` on an ssh command line.
pub fn ssh_socks_port(cmdline: &str) -> Option<u16> {
    SSH_DYNAMIC
        .captures(cmdline)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Port from a `socks-proxy 127.0.0.1 <port>` directive.
pub fn openvpn_socks_port(profile_text: &str) -> Option<u16> {
    OPENVPN_SOCKS_PROXY
        .captures(profile_text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Local SOCKS port from a generated config.
///
/// V2Ray configs list it as the `socks` inbound; Shadowsocks configs carry
/// `local_port`.
pub fn generated_socks_port(config_json: &str) -> Option<u16> {
    let value: Value = serde_json::from_str(config_json).ok()?;
    if let Some(port) = value.get("local_port").and_then(Value::as_u64) {
        return u16::try_from(port).ok();
    }
    value
        .get("inbounds")?
        .as_array()?
        .iter()
        .find(|inbound| inbound.get("protocol").and_then(Value::as_str) == Some("socks"))
        .and_then(|inbound| inbound.get("port"))
        .and_then(Value::as_u64)
        .and_then(|port| u16::try_from(port).ok())
}

/// Inputs gathered by the caller for [`extract_socks_port`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PortSources<'a> {
    /// Command line of the process found by detection.
    pub cmdline: Option<&'a str>,
    /// Contents of the generated config, if it could be read.
    pub generated_config: Option<&'a str>,
    /// Port assumed for V2Ray/Shadowsocks when the generated config is
    /// missing or has no port.
    pub fallback: u16,
}

/// Local SOCKS port for a connected tunnel.
pub fn extract_socks_port(profile: &ConnectionProfile, sources: PortSources<'_>) -> Option<u16> {
    match &profile.backend {
        Backend::Ssh(_) => sources.cmdline.and_then(ssh_socks_port),
        Backend::OpenVpn(settings) => openvpn_socks_port(&settings.profile_text),
        Backend::V2Ray(_) | Backend::Shadowsocks(_) => Some(
            sources
                .generated_config
                .and_then(generated_socks_port)
                .unwrap_or(sources.fallback),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile(value: Value) -> ConnectionProfile {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_ssh_port() {
        assert_eq!(
            ssh_socks_port("ssh -N -D 1080 -S /run/holocron.ssh.socket.w me@h"),
            Some(1080)
        );
        assert_eq!(ssh_socks_port("ssh -D1081 host"), Some(1081));
        assert_eq!(ssh_socks_port("ssh -L 8080:db:5432 host"), None);
    }

    #[test]
    fn test_openvpn_port_is_line_anchored() {
        let text = "client\nremote vpn.example.com 1194\n  socks-proxy 127.0.0.1 9050\n";
        assert_eq!(openvpn_socks_port(text), Some(9050));
        assert_eq!(openvpn_socks_port("# socks-proxy 127.0.0.1 9050"), None);
        assert_eq!(openvpn_socks_port("socks-proxy 10.0.0.1 9050"), None);
    }

    #[test]
    fn test_generated_port() {
        let v2ray = json!({
            "inbounds": [
                { "protocol": "http", "port": 8118 },
                { "protocol": "socks", "port": 10808, "listen": "127.0.0.1" }
            ]
        });
        assert_eq!(generated_socks_port(&v2ray.to_string()), Some(10808));
        assert_eq!(
            generated_socks_port(&json!({ "local_port": 1086 }).to_string()),
            Some(1086)
        );
        assert_eq!(generated_socks_port("garbage"), None);
    }

    #[test]
    fn test_extract_dispatch() {
        let ssh = profile(json!({ "type": "ssh", "identifier": "w" }));
        let sources = PortSources {
            cmdline: Some("ssh -D 1090 h"),
            ..PortSources::default()
        };
        assert_eq!(extract_socks_port(&ssh, sources), Some(1090));
        assert_eq!(extract_socks_port(&ssh, PortSources::default()), None);

        // A declared Dynamic forward is not evidence of a live SOCKS listener.
        let declared = profile(json!({
            "type": "ssh",
            "identifier": "w",
            "portForwards": [{ "kind": "Dynamic", "localPort": 1080 }]
        }));
        let without_dynamic = PortSources {
            cmdline: Some("ssh -N -L 8080:db:5432 -S /run/holocron.ssh.socket.w me@h"),
            ..PortSources::default()
        };
        assert_eq!(extract_socks_port(&declared, without_dynamic), None);

        let v2 = profile(json!({ "type": "v2ray", "identifier": "v" }));
        let fallback = PortSources {
            fallback: 1080,
            ..PortSources::default()
        };
        assert_eq!(extract_socks_port(&v2, fallback), Some(1080));

        let ovpn = profile(json!({ "type": "openvpn", "identifier": "o", "ovpnProfile": "client\n" }));
        assert_eq!(extract_socks_port(&ovpn, fallback), None);
    }
}
