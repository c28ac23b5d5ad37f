//! Command loop over the framed controller channel.
//!
//! One request is handled to completion before the next is read. Per-request
//! failures become `{success: false, message, errorKind}` responses and the
//! loop keeps serving; only end of input or a broken frame stops it.

use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::error::TunnelError;
use crate::logs::{self, LogSource};
use crate::protocol::{self, ProtocolError, Request};
use crate::tunnel::{ProbeTargets, TunnelManager};

pub struct Server {
    manager: TunnelManager,
}

impl Server {
    pub fn new(manager: TunnelManager) -> Self {
        Self { manager }
    }

    /// Serve requests from `reader` until end of input.
    pub async fn run<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("Serving controller requests");
        loop {
            let frame = match protocol::read_frame(reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Controller closed the channel");
                    return Ok(());
                }
                Err(e) => {
                    error!("Controller channel broken: {e}");
                    return Err(e);
                }
            };
            let response = self.handle(&frame).await;
            protocol::write_message(writer, &response).await?;
        }
    }

    /// Handle one raw request frame.
    pub async fn handle(&mut self, frame: &[u8]) -> Value {
        let request = match Request::decode(frame) {
            Ok(r) => r,
            Err(e) => {
                warn!("Rejecting request: {e}");
                return failure(&e);
            }
        };
        debug!("Request: {}", request.command);

        let result = match request.command.as_str() {
            "getStatus" => self.get_status(&request).await,
            "startTunnel" => self.start_tunnel(&request).await,
            "stopTunnel" => self.stop_tunnel(&request).await,
            "testConnection" => self.test_connection(&request).await,
            "getLogs" => self.get_logs(&request).await,
            "clearLogs" => self.clear_logs(&request).await,
            other => {
                warn!("Unknown command: {other}");
                return json!({ "success": false, "message": format!("Unknown command: {other}") });
            }
        };
        result.unwrap_or_else(|e| {
            warn!("{} failed: {e}", request.command);
            failure(&e)
        })
    }

    async fn get_status(&mut self, request: &Request) -> Result<Value, TunnelError> {
        let profile = request.profile()?;
        let report = self.manager.status(&profile, targets(request)).await?;

        let mut out = Map::new();
        out.insert("connected".into(), json!(report.status.connected));
        out.insert("socks_port".into(), json!(report.status.socks_port));
        out.insert("state".into(), json!(report.state.as_str()));
        report.diagnostics.write_into(&mut out);
        Ok(Value::Object(out))
    }

    async fn start_tunnel(&mut self, request: &Request) -> Result<Value, TunnelError> {
        let profile = request.profile()?;
        let started = self.manager.start(&profile).await?;
        Ok(json!({
            "success": true,
            "message": started.message,
            "socks_port": started.socks_port,
        }))
    }

    async fn stop_tunnel(&mut self, request: &Request) -> Result<Value, TunnelError> {
        let profile = request.profile()?;
        let stopped = self.manager.stop(&profile).await?;
        Ok(json!({ "success": true, "message": stopped.message }))
    }

    async fn test_connection(&mut self, request: &Request) -> Result<Value, TunnelError> {
        let profile = request.profile()?;
        let report = self.manager.test_connection(&profile, targets(request)).await?;

        let mut out = Map::new();
        out.insert("success".into(), json!(report.success));
        out.insert("message".into(), json!(report.message));
        out.insert("connected".into(), json!(report.status.connected));
        out.insert("socks_port".into(), json!(report.status.socks_port));
        out.insert("started_for_test".into(), json!(report.started_for_test));
        report.diagnostics.write_into(&mut out);
        Ok(Value::Object(out))
    }

    fn log_source(&self, request: &Request) -> Result<LogSource, TunnelError> {
        let engine = self.manager.engine();
        LogSource::resolve(engine.config(), engine.artifact_manager(), request.log_target()?)
    }

    async fn get_logs(&mut self, request: &Request) -> Result<Value, TunnelError> {
        let source = self.log_source(request)?;
        let lines = self.manager.engine().config().logging.tail_lines;
        let text = logs::read_logs(&source, lines).await;
        Ok(json!({ "success": true, "logs": text }))
    }

    async fn clear_logs(&mut self, request: &Request) -> Result<Value, TunnelError> {
        let source = self.log_source(request)?;
        let message = logs::clear_logs(&source).await?;
        Ok(json!({ "success": true, "message": message }))
    }
}

fn targets(request: &Request) -> ProbeTargets<'_> {
    ProbeTargets {
        ping_host: request.ping_host.as_deref(),
        web_check_url: request.web_check_url.as_deref(),
    }
}

fn failure(e: &TunnelError) -> Value {
    json!({
        "success": false,
        "message": e.message(),
        "errorKind": e.kind(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::launch::Engine;
    use crate::process::SystemProcessTable;
    use std::path::Path;
    use std::sync::Arc;

    fn server(dir: &Path) -> Server {
        let mut config = Config::default();
        config.paths.runtime_dir = dir.join("run").to_string_lossy().into_owned();
        config.paths.log_dir = dir.join("logs").to_string_lossy().into_owned();
        config.paths.helpers_dir = dir.join("helpers").to_string_lossy().into_owned();
        config.diagnostics.ping_host = "127.0.0.1".into();
        config.diagnostics.ping_port = 9;
        config.timeouts.tcp_ping_secs = 1;
        let engine = Engine::new(Arc::new(config), Arc::new(SystemProcessTable));
        Server::new(TunnelManager::new(engine))
    }

    fn frame(message: &Value) -> Vec<u8> {
        let body = serde_json::to_vec(message).unwrap();
        let mut out = (body.len() as u32).to_ne_bytes().to_vec();
        out.extend(body);
        out
    }

    async fn responses(mut output: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(frame) = protocol::read_frame(&mut output).await.unwrap() {
            out.push(serde_json::from_slice(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_loop_survives_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server(dir.path());

        let mut input = Vec::new();
        input.extend(frame(&json!({ "command": "reboot" })));
        let garbage = b"{not json";
        input.extend((garbage.len() as u32).to_ne_bytes());
        input.extend(garbage);
        input.extend(frame(&json!({ "command": "startTunnel", "config": { "type": "telnet" } })));
        input.extend(frame(&json!({
            "command": "stopTunnel",
            "config": { "type": "v2ray", "identifier": "idle" }
        })));

        let mut output = Vec::new();
        server.run(&mut input.as_slice(), &mut output).await.unwrap();

        let replies = responses(&output).await;
        assert_eq!(replies.len(), 4);
        assert_eq!(replies[0]["success"], false);
        assert_eq!(replies[0]["message"], "Unknown command: reboot");
        assert_eq!(replies[1]["errorKind"], "ConfigurationError");
        assert_eq!(replies[2]["errorKind"], "ConfigurationError");
        assert_eq!(replies[3]["success"], true);
        assert!(replies[3]["message"].as_str().unwrap().contains("was not running"));
    }

    #[tokio::test]
    async fn test_get_status_keys_when_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server(dir.path());
        let request = json!({
            "command": "getStatus",
            "config": {
                "type": "ssh",
                "identifier": "work1",
                "user": "me",
                "host": "bastion",
                "portForwards": [{ "kind": "Dynamic", "localPort": 1080 }]
            }
        });
        let reply = server.handle(&serde_json::to_vec(&request).unwrap()).await;
        assert_eq!(reply["connected"], false);
        assert_eq!(reply["socks_port"], Value::Null);
        assert_eq!(reply["state"], "stopped");
        assert_eq!(reply["web_check_latency_ms"], -1);
        assert_eq!(reply["web_check_status"], "N/A (Tunnel Down)");
        assert_eq!(reply["web_check_error"], Value::Null);
        assert!(reply.get("tcp_ping_ms").is_some());
        assert!(reply.get("tcp_ping_error").is_some());
    }

    #[tokio::test]
    async fn test_logs_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server(dir.path());
        std::fs::create_dir_all(dir.path().join("run")).unwrap();
        std::fs::write(
            dir.path().join("run/holocron.ssh.work1.log"),
            "debug1: Authentication succeeded (publickey).\n",
        )
        .unwrap();

        let get = json!({ "command": "getLogs", "identifier": "work1", "conn_type": "ssh" });
        let reply = server.handle(&serde_json::to_vec(&get).unwrap()).await;
        assert_eq!(reply["success"], true);
        assert!(reply["logs"].as_str().unwrap().contains("Authentication succeeded"));

        let clear = json!({ "command": "clearLogs", "identifier": "work1", "conn_type": "ssh" });
        let reply = server.handle(&serde_json::to_vec(&clear).unwrap()).await;
        assert_eq!(reply["success"], true);
        assert!(!dir.path().join("run/holocron.ssh.work1.log").exists());

        let bad = json!({ "command": "getLogs", "identifier": "x", "conn_type": "telnet" });
        let reply = server.handle(&serde_json::to_vec(&bad).unwrap()).await;
        assert_eq!(reply["errorKind"], "ConfigurationError");
    }

    #[tokio::test]
    async fn test_oversized_frame_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = server(dir.path());
        let input = u32::MAX.to_ne_bytes();
        let mut output = Vec::new();
        let err = server.run(&mut input.as_slice(), &mut output).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
        assert!(output.is_empty());
    }
}
