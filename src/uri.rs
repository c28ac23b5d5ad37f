//! Proxy share-link parsing (`vless://` and `ss://`).
//!
//! These are the links users paste from providers. Only the fields needed to
//! generate a client config are kept.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use reqwest::Url;

use crate::error::TunnelError;

/// A parsed share link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareLink {
    Vless(VlessLink),
    Shadowsocks(ShadowsocksLink),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessLink {
    pub uuid: String,
    pub server: String,
    pub port: u16,
    pub remarks: String,
    /// `tls`, `reality` or `none`.
    pub security: String,
    /// Transport: `tcp`, `ws`, `grpc`, ...
    pub network: String,
    pub sni: Option<String>,
    pub alpn: Option<String>,
    pub path: Option<String>,
    pub host_header: Option<String>,
    pub flow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowsocksLink {
    pub server: String,
    pub port: u16,
    pub method: String,
    pub password: String,
    pub remarks: String,
}

/// Parse a share link, dispatching on its scheme.
pub fn parse(link: &str) -> Result<ShareLink, TunnelError> {
    let link = link.trim();
    if link.starts_with("vless://") {
        return parse_vless(link).map(ShareLink::Vless);
    }
    if link.starts_with("ss://") {
        return parse_shadowsocks(link).map(ShareLink::Shadowsocks);
    }
    Err(TunnelError::Configuration(format!(
        "Unsupported share link scheme: {}",
        link.split("://").next().unwrap_or(link)
    )))
}

fn parse_vless(link: &str) -> Result<VlessLink, TunnelError> {
    let bad = |why: &str| TunnelError::Configuration(format!("Invalid vless link: {why}"));
    let url = Url::parse(link).map_err(|e| bad(&e.to_string()))?;

    let uuid = url.username().to_string();
    if uuid.is_empty() {
        return Err(bad("missing user id"));
    }
    let server = url
        .host_str()
        .ok_or_else(|| bad("missing host"))?
        .trim_matches(|c| c == '[' || c == ']')
        .to_string();
    let port = url.port().ok_or_else(|| bad("missing port"))?;

    let query = |key: &str| {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    };

    let security = match query("security") {
        Some(s) => s,
        None if query("tls").as_deref() == Some("1") => "tls".to_string(),
        None => "none".to_string(),
    };

    Ok(VlessLink {
        uuid,
        server,
        port,
        remarks: percent_decode(url.fragment().unwrap_or_default()),
        security,
        network: query("type").unwrap_or_else(|| "tcp".to_string()),
        sni: query("sni").or_else(|| query("peer")),
        alpn: query("alpn"),
        path: query("path"),
        host_header: query("host"),
        flow: query("flow"),
    })
}

fn parse_shadowsocks(link: &str) -> Result<ShadowsocksLink, TunnelError> {
    let bad = |why: &str| TunnelError::Configuration(format!("Invalid ss link: {why}"));
    let rest = &link["ss://".len()..];
    let (body, remarks) = match rest.split_once('#') {
        Some((body, fragment)) => (body, percent_decode(fragment)),
        None => (rest, String::new()),
    };

    // SIP002: BASE64URL(method:password)@host:port[/?plugin]
    // Legacy: BASE64(method:password@host:port)
    let (credentials, host_port) = if let Some((user_info, host_part)) = body.rsplit_once('@') {
        let user_info =
            decode_base64(user_info).unwrap_or_else(|| percent_decode(user_info));
        let host_part = host_part
            .split(['/', '?'])
            .next()
            .unwrap_or_default()
            .to_string();
        (user_info, host_part)
    } else {
        let decoded = decode_base64(body).ok_or_else(|| bad("payload is not base64"))?;
        let (user_info, host_part) = decoded
            .rsplit_once('@')
            .ok_or_else(|| bad("missing server"))?;
        (user_info.to_string(), host_part.to_string())
    };

    let (method, password) = credentials
        .split_once(':')
        .ok_or_else(|| bad("missing method or password"))?;
    let (server, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| bad("missing port"))?;
    let port: u16 = port.parse().map_err(|_| bad("port is not a number"))?;
    let server = server.trim_matches(|c| c == '[' || c == ']');

    if method.is_empty() || server.is_empty() {
        return Err(bad("empty method or server"));
    }

    Ok(ShadowsocksLink {
        server: server.to_string(),
        port,
        method: method.to_string(),
        password: password.to_string(),
        remarks,
    })
}

fn decode_base64(input: &str) -> Option<String> {
    let input = input.trim();
    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(input).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

/// `decodeURIComponent` semantics: `%XX` escapes only, `+` is literal.
fn percent_decode(input: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(input.as_bytes())).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vless() {
        let link = "vless://0b1c2d3e-aaaa-bbbb-cccc-123456789abc@edge.example.com:443?security=tls&type=ws&path=%2Fray&sni=cdn.example.com#Frankfurt%201";
        let ShareLink::Vless(v) = parse(link).unwrap() else {
            panic!("expected vless");
        };
        assert_eq!(v.uuid, "0b1c2d3e-aaaa-bbbb-cccc-123456789abc");
        assert_eq!(v.server, "edge.example.com");
        assert_eq!(v.port, 443);
        assert_eq!(v.security, "tls");
        assert_eq!(v.network, "ws");
        assert_eq!(v.path.as_deref(), Some("/ray"));
        assert_eq!(v.sni.as_deref(), Some("cdn.example.com"));
        assert_eq!(v.remarks, "Frankfurt 1");
    }

    #[test]
    fn test_parse_vless_legacy_tls_flag() {
        let ShareLink::Vless(v) = parse("vless://id@1.2.3.4:8443?tls=1&peer=example.org").unwrap()
        else {
            panic!("expected vless");
        };
        assert_eq!(v.security, "tls");
        assert_eq!(v.sni.as_deref(), Some("example.org"));
        assert_eq!(v.network, "tcp");
    }

    #[test]
    fn test_parse_vless_missing_port() {
        assert!(parse("vless://id@example.org").is_err());
    }

    #[test]
    fn test_parse_ss_legacy() {
        let link = "ss://YWVzLTI1Ni1nY206c2VjcmV0QHNzLmV4YW1wbGUuY29tOjgzODg=#home";
        let ShareLink::Shadowsocks(ss) = parse(link).unwrap() else {
            panic!("expected ss");
        };
        assert_eq!(ss.method, "aes-256-gcm");
        assert_eq!(ss.password, "secret");
        assert_eq!(ss.server, "ss.example.com");
        assert_eq!(ss.port, 8388);
        assert_eq!(ss.remarks, "home");
    }

    #[test]
    fn test_parse_ss_sip002() {
        // base64url("aes-128-gcm:pw") without padding
        let link = "ss://YWVzLTEyOC1nY206cHc@198.51.100.7:8443/?plugin=obfs#Tokyo";
        let ShareLink::Shadowsocks(ss) = parse(link).unwrap() else {
            panic!("expected ss");
        };
        assert_eq!(ss.method, "aes-128-gcm");
        assert_eq!(ss.password, "pw");
        assert_eq!(ss.server, "198.51.100.7");
        assert_eq!(ss.port, 8443);
        assert_eq!(ss.remarks, "Tokyo");
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = parse("trojan://x@y:1").unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b+c"), "a b+c");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%E6%9D%B1%E4%BA%AC"), "東京");
    }

    #[test]
    fn test_remarks_keep_literal_plus() {
        let encoded = STANDARD.encode("aes-256-gcm:pw");
        let link = format!("ss://{encoded}@ss.example.com:8388#A+B%2BC");
        let ShareLink::Shadowsocks(ss) = parse(&link).unwrap() else {
            panic!("expected ss link");
        };
        assert_eq!(ss.remarks, "A+B+C");

        let ShareLink::Vless(v) = parse("vless://id@edge.example.com:443#Edge+1%2B2").unwrap() else {
            panic!("expected vless link");
        };
        assert_eq!(v.remarks, "Edge+1+2");
    }
}
