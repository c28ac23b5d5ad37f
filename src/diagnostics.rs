//! Connectivity probes, optionally through a tunnel's local SOCKS endpoint.
//!
//! Probes never fail: a problem is reported as `latency_ms = -1` plus an
//! error kind.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

use crate::config::Config;

/// Outcome of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticResult {
    /// Milliseconds, or `-1` on failure.
    pub latency_ms: i64,
    pub status: String,
    pub error_kind: Option<String>,
}

impl DiagnosticResult {
    fn ok(latency: Duration) -> Self {
        Self {
            latency_ms: i64::try_from(latency.as_millis()).unwrap_or(i64::MAX),
            status: "OK".into(),
            error_kind: None,
        }
    }

    fn failed(status: impl Into<String>, kind: &str) -> Self {
        Self {
            latency_ms: -1,
            status: status.into(),
            error_kind: Some(kind.to_string()),
        }
    }
}

fn proxy_label(socks_port: Option<u16>) -> String {
    match socks_port {
        Some(p) => format!("via SOCKS port {p}"),
        None => "direct".into(),
    }
}

/// Time a TCP connect to `host:port`. DNS is always resolved locally.
pub async fn tcp_ping(
    host: &str,
    port: u16,
    timeout: Duration,
    socks_port: Option<u16>,
) -> DiagnosticResult {
    let resolved = match tokio::time::timeout(timeout, tokio::net::lookup_host((host, port))).await {
        Ok(Ok(addrs)) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
        }
        Ok(Err(e)) => {
            warn!("TCP ping: cannot resolve {host}: {e}");
            None
        }
        Err(_) => return DiagnosticResult::failed("Failed (Timeout)", "Timeout"),
    };
    let Some(addr) = resolved else {
        return DiagnosticResult::failed("Failed (DNS Error)", "DnsError");
    };

    let started = Instant::now();
    let result = match socks_port {
        Some(proxy) => {
            match tokio::time::timeout(timeout, Socks5Stream::connect(("127.0.0.1", proxy), addr)).await {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(e)) => {
                    debug!("SOCKS connect to {addr} failed: {e}");
                    Err(DiagnosticResult::failed("Failed (Proxy Error)", "ProxyError"))
                }
                Err(_) => Err(DiagnosticResult::failed("Failed (Timeout)", "Timeout")),
            }
        }
        None => match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Err(
                DiagnosticResult::failed("Failed (Connection Refused)", "ConnectionRefused"),
            ),
            Ok(Err(e)) => {
                debug!("connect to {addr} failed: {e}");
                Err(DiagnosticResult::failed("Failed (OS Error)", "OsError"))
            }
            Err(_) => Err(DiagnosticResult::failed("Failed (Timeout)", "Timeout")),
        },
    };

    match result {
        Ok(()) => {
            let r = DiagnosticResult::ok(started.elapsed());
            debug!("TCP ping {host}:{port} {} ok in {}ms", proxy_label(socks_port), r.latency_ms);
            r
        }
        Err(r) => {
            warn!(
                "TCP ping {host}:{port} {} failed: {:?}",
                proxy_label(socks_port),
                r.error_kind
            );
            r
        }
    }
}

/// Time an HTTP HEAD of `url`. Through a proxy, DNS is resolved by the
/// proxy (`socks5h`).
pub async fn web_check(
    url: &str,
    socks_port: Option<u16>,
    timeout: Duration,
    user_agent: &str,
) -> DiagnosticResult {
    let invalid = || DiagnosticResult::failed("Invalid URL", "ConfigurationError");
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return invalid();
    }
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return invalid();
    };

    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent);
    if let Some(port) = socks_port {
        match socks_proxy(&format!("socks5h://127.0.0.1:{port}")) {
            Ok(proxy) => builder = builder.proxy(proxy),
            Err(r) => return r,
        }
    }
    let client = match builder.build() {
        Ok(c) => c,
        Err(e) => {
            warn!("Web check client could not be built: {e}");
            return DiagnosticResult::failed("Failed (Connection Error)", "ConnectionError");
        }
    };

    let started = Instant::now();
    match client.head(parsed).send().await {
        Ok(response) => {
            let code = response.status().as_u16();
            let mut result = DiagnosticResult::ok(started.elapsed());
            if !(200..400).contains(&code) {
                result.status = format!("Failed (Status {code})");
                warn!("Web check {url} returned {code}");
            } else {
                debug!("Web check {url} {} ok in {}ms", proxy_label(socks_port), result.latency_ms);
            }
            result
        }
        Err(e) => {
            warn!("Web check {url} {} failed: {e}", proxy_label(socks_port));
            if socks_port.is_some() && (e.is_connect() || e.is_timeout()) {
                DiagnosticResult::failed("Failed (Proxy Error)", "ProxyError")
            } else {
                DiagnosticResult::failed("Failed (Connection Error)", "ConnectionError")
            }
        }
    }
}

fn socks_proxy(proxy_url: &str) -> Result<reqwest::Proxy, DiagnosticResult> {
    reqwest::Proxy::all(proxy_url).map_err(|e| {
        warn!("SOCKS proxy {proxy_url} rejected: {e}");
        DiagnosticResult::failed(format!("Failed (Proxy Error: {e})"), "ProxyError")
    })
}

/// TCP and HTTP results reported together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsReport {
    pub tcp: DiagnosticResult,
    pub web: DiagnosticResult,
}

impl DiagnosticsReport {
    /// Run both probes. Without a SOCKS port the tunnel is down: TCP is
    /// pinged directly and the web check is skipped.
    pub async fn collect(
        config: &Config,
        ping_host: Option<&str>,
        web_check_url: Option<&str>,
        socks_port: Option<u16>,
    ) -> Self {
        let diag = &config.diagnostics;
        let host = ping_host.filter(|h| !h.trim().is_empty()).unwrap_or(&diag.ping_host);
        let tcp = tcp_ping(host, diag.ping_port, config.timeouts.tcp_ping(), socks_port).await;

        let web = match socks_port {
            Some(port) => {
                let url = web_check_url
                    .filter(|u| !u.trim().is_empty())
                    .unwrap_or(&diag.web_check_url);
                web_check(url, Some(port), config.timeouts.web_check(), &diag.user_agent).await
            }
            None => DiagnosticResult {
                latency_ms: -1,
                status: "N/A (Tunnel Down)".into(),
                error_kind: None,
            },
        };
        Self { tcp, web }
    }

    /// Insert the response keys (`tcp_ping_ms`, `web_check_status`, ...).
    pub fn write_into(&self, out: &mut Map<String, Value>) {
        out.insert("tcp_ping_ms".into(), json!(self.tcp.latency_ms));
        out.insert("tcp_ping_error".into(), json!(self.tcp.error_kind));
        out.insert("web_check_latency_ms".into(), json!(self.web.latency_ms));
        out.insert("web_check_status".into(), json!(self.web.status));
        out.insert("web_check_error".into(), json!(self.web.error_kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_web_check_rejects_non_http_without_network() {
        let started = Instant::now();
        let r = web_check("ftp://x", Some(1080), Duration::from_secs(10), "ua").await;
        assert_eq!(r.latency_ms, -1);
        assert_eq!(r.status, "Invalid URL");
        assert_eq!(r.error_kind.as_deref(), Some("ConfigurationError"));
        assert!(started.elapsed() < Duration::from_secs(1));

        let r = web_check("", None, Duration::from_secs(1), "ua").await;
        assert_eq!(r.error_kind.as_deref(), Some("ConfigurationError"));
    }

    #[test]
    fn test_bad_proxy_keeps_its_error() {
        assert!(socks_proxy("socks5h://127.0.0.1:1080").is_ok());
        let r = socks_proxy("socks5h://127.0.0.1:notaport").unwrap_err();
        assert_eq!(r.latency_ms, -1);
        assert_eq!(r.error_kind.as_deref(), Some("ProxyError"));
        assert!(r.status.starts_with("Failed (Proxy Error: "));
        assert_ne!(r.status, "Invalid URL");
    }

    #[tokio::test]
    async fn test_tcp_ping_direct_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let r = tcp_ping("127.0.0.1", port, Duration::from_secs(2), None).await;
        assert!(r.latency_ms >= 0);
        assert_eq!(r.status, "OK");
        assert_eq!(r.error_kind, None);
    }

    #[tokio::test]
    async fn test_tcp_ping_refused() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let r = tcp_ping("127.0.0.1", port, Duration::from_secs(2), None).await;
        assert_eq!(r.latency_ms, -1);
        assert_eq!(r.error_kind.as_deref(), Some("ConnectionRefused"));
    }

    #[tokio::test]
    async fn test_tcp_ping_dead_proxy_is_proxy_error() {
        let proxy_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let r = tcp_ping("127.0.0.1", 443, Duration::from_secs(2), Some(proxy_port)).await;
        assert_eq!(r.latency_ms, -1);
        assert_eq!(r.error_kind.as_deref(), Some("ProxyError"));
    }

    #[tokio::test]
    async fn test_report_when_tunnel_down() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.diagnostics.ping_port = listener.local_addr().unwrap().port();
        let report = DiagnosticsReport::collect(&config, Some("127.0.0.1"), None, None).await;
        assert_eq!(report.web.status, "N/A (Tunnel Down)");
        assert_eq!(report.web.latency_ms, -1);

        let mut map = Map::new();
        report.write_into(&mut map);
        assert_eq!(map["web_check_error"], Value::Null);
        assert_eq!(map["tcp_ping_error"], Value::Null);
        assert!(map["tcp_ping_ms"].as_i64().unwrap() >= 0);
    }
}
