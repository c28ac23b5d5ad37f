//! Generated client configs for V2Ray and Shadowsocks.
//!
//! The local SOCKS port written here is the one detection later reads back.

use std::path::Path;

use serde_json::{json, Value};

use crate::error::TunnelError;
use crate::profile::{ShadowsocksEndpoint, V2RaySettings};
use crate::uri::{self, ShareLink, VlessLink};

/// V2Ray/Xray config with a SOCKS inbound on `127.0.0.1:socks_port`.
///
/// A `vless://` subscription gets a complete outbound; for a remote
/// subscription the helper fills in the outbounds itself.
pub fn v2ray_config(settings: &V2RaySettings, socks_port: u16) -> Result<Value, TunnelError> {
    let mut outbounds = Vec::new();
    let url = settings.subscription_url.trim();
    if url.starts_with("vless://") {
        let ShareLink::Vless(link) = uri::parse(url)? else {
            return Err(TunnelError::Configuration("Expected a vless:// link".into()));
        };
        outbounds.push(vless_outbound(&link));
    } else if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(TunnelError::Configuration(format!(
            "Unsupported V2Ray subscription: {url}"
        )));
    }
    outbounds.push(json!({ "protocol": "freedom", "tag": "direct" }));

    Ok(json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "tag": "socks-in",
            "listen": "127.0.0.1",
            "port": socks_port,
            "protocol": "socks",
            "settings": { "auth": "noauth", "udp": true }
        }],
        "outbounds": outbounds
    }))
}

fn vless_outbound(link: &VlessLink) -> Value {
    let mut user = json!({ "id": link.uuid, "encryption": "none" });
    if let Some(flow) = &link.flow {
        user["flow"] = json!(flow);
    }

    let mut stream = json!({ "network": link.network, "security": link.security });
    if link.security == "tls" {
        let mut tls = json!({});
        if let Some(sni) = &link.sni {
            tls["serverName"] = json!(sni);
        }
        if let Some(alpn) = &link.alpn {
            tls["alpn"] = json!(alpn.split(',').collect::<Vec<_>>());
        }
        stream["tlsSettings"] = tls;
    }
    match link.network.as_str() {
        "ws" => {
            let mut ws = json!({ "path": link.path.as_deref().unwrap_or("/") });
            if let Some(host) = &link.host_header {
                ws["headers"] = json!({ "Host": host });
            }
            stream["wsSettings"] = ws;
        }
        "grpc" => {
            stream["grpcSettings"] = json!({ "serviceName": link.path.as_deref().unwrap_or_default() });
        }
        _ => {}
    }

    json!({
        "protocol": "vless",
        "tag": "proxy",
        "settings": {
            "vnext": [{
                "address": link.server,
                "port": link.port,
                "users": [user]
            }]
        },
        "streamSettings": stream
    })
}

/// `ss-local` config.
pub fn shadowsocks_config(endpoint: &ShadowsocksEndpoint) -> Value {
    json!({
        "server": endpoint.server,
        "server_port": endpoint.port,
        "local_address": "127.0.0.1",
        "local_port": endpoint.socks_port,
        "password": endpoint.password,
        "method": endpoint.method,
        "timeout": 300
    })
}

pub async fn write_config(path: &Path, config: &Value) -> Result<(), TunnelError> {
    let text = serde_json::to_string_pretty(config)
        .map_err(|e| TunnelError::Process(format!("Failed to encode config: {e}")))?;
    tokio::fs::write(path, text)
        .await
        .map_err(|e| TunnelError::Process(format!("Failed to write {}: {e}", path.display())))
}
