//! Subprocess tool-server supervisor (spec §4.3, "C3"): spawns external
//! tool-server processes, keeps a persistent duplex connection to each,
//! probes them periodically, and restarts on failure with backoff.

use std::collections::HashMap;
use std::sync::Arc;

use ambit_config::SupervisorConfig;
use serde_json::Value;
use tokio::sync::Mutex;

use super::protocol::{initialize_params, ToolCallResult, ToolDef, ToolsListResult};
use super::transport::{StdioTransport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    Stopped { error: Option<String> },
    Starting,
    Running,
    Restarting { attempts: u32 },
    Stopping,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("tool-server '{0}' is not registered")]
    NotFound(String),
    #[error("tool-server '{0}' is not running (state: {1:?})")]
    NotRunning(String, ServerState),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(String),
}

struct ServerEntry {
    config: ServerConfig,
    transport: Option<Arc<StdioTransport>>,
    tools: Vec<ToolDef>,
    state: ServerState,
}

/// Backoff between restart attempts: `min(30s, 2^attempts)` (spec §4.3).
pub fn restart_backoff(attempts: u32) -> std::time::Duration {
    let secs = 2u64.saturating_pow(attempts).min(30);
    std::time::Duration::from_secs(secs)
}

pub struct ToolServerSupervisor {
    config: SupervisorConfig,
    servers: Mutex<HashMap<String, ServerEntry>>,
}

impl ToolServerSupervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn, handshake, and bring a server to `Running`; starts its health
    /// monitor task. On handshake failure, leaves the server `Stopped` with
    /// the error surfaced rather than panicking.
    pub async fn start_server(self: &Arc<Self>, config: ServerConfig) {
        let id = config.id.clone();
        {
            let mut servers = self.servers.lock().await;
            servers.insert(
                id.clone(),
                ServerEntry {
                    config: config.clone(),
                    transport: None,
                    tools: Vec::new(),
                    state: ServerState::Starting,
                },
            );
        }

        match self.spawn_and_handshake(&config).await {
            Ok((transport, tools)) => {
                let mut servers = self.servers.lock().await;
                if let Some(entry) = servers.get_mut(&id) {
                    entry.transport = Some(Arc::new(transport));
                    entry.tools = tools;
                    entry.state = ServerState::Running;
                }
                tracing::info!(server_id = %id, "tool-server running");
                self.clone().spawn_health_monitor(id);
            }
            Err(e) => {
                tracing::warn!(server_id = %id, error = %e, "tool-server failed to start");
                let mut servers = self.servers.lock().await;
                if let Some(entry) = servers.get_mut(&id) {
                    entry.state = ServerState::Stopped {
                        error: Some(e.to_string()),
                    };
                }
            }
        }
    }

    async fn spawn_and_handshake(
        &self,
        config: &ServerConfig,
    ) -> Result<(StdioTransport, Vec<ToolDef>), SupervisorError> {
        let transport = StdioTransport::spawn(&config.command, &config.args, &config.env)?;
        let probe_timeout = std::time::Duration::from_secs(self.config.probe_timeout_s);

        let resp = transport
            .send_request("initialize", Some(initialize_params()), probe_timeout)
            .await?;
        if resp.is_error() {
            return Err(SupervisorError::Protocol(format!(
                "initialize failed: {}",
                resp.error.unwrap()
            )));
        }
        transport.send_notification("notifications/initialized").await?;

        let tools_resp = transport
            .send_request("tools/list", None, probe_timeout)
            .await?;
        if tools_resp.is_error() {
            return Err(SupervisorError::Protocol(format!(
                "tools/list failed: {}",
                tools_resp.error.unwrap()
            )));
        }
        let result = tools_resp.result.unwrap_or(Value::Null);
        let tools: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| SupervisorError::Protocol(format!("bad tools/list result: {e}")))?;

        Ok((transport, tools.tools))
    }

    /// Cooperative task that probes the server roughly every
    /// `health_interval_s`; on failure, restarts it with the spec's backoff.
    fn spawn_health_monitor(self: Arc<Self>, id: String) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(self.config.health_interval_s)).await;

                let transport = {
                    let servers = self.servers.lock().await;
                    match servers.get(&id) {
                        Some(entry) if entry.state == ServerState::Running => entry.transport.clone(),
                        _ => return, // no longer our job to monitor
                    }
                };
                let Some(transport) = transport else { return };

                let probe_timeout = std::time::Duration::from_secs(self.config.probe_timeout_s);
                let healthy = transport
                    .send_request("tools/list", None, probe_timeout)
                    .await
                    .map(|r| !r.is_error())
                    .unwrap_or(false);

                if !healthy {
                    tracing::warn!(server_id = %id, "health probe failed, restarting");
                    self.restart(&id).await;
                }
            }
        });
    }

    async fn restart(self: &Arc<Self>, id: &str) {
        let (config, attempts) = {
            let mut servers = self.servers.lock().await;
            let Some(entry) = servers.get_mut(id) else { return };
            let attempts = match entry.state {
                ServerState::Restarting { attempts } => attempts + 1,
                _ => 1,
            };
            entry.state = ServerState::Restarting { attempts };
            (entry.config.clone(), attempts)
        };

        if attempts > self.config.max_restarts {
            tracing::error!(server_id = %id, attempts, "restart attempts exhausted, giving up");
            let mut servers = self.servers.lock().await;
            if let Some(entry) = servers.get_mut(id) {
                entry.state = ServerState::Stopped {
                    error: Some(format!("restart attempts exceeded ({attempts})")),
                };
            }
            return;
        }

        tokio::time::sleep(restart_backoff(attempts)).await;

        match self.spawn_and_handshake(&config).await {
            Ok((transport, tools)) => {
                let mut servers = self.servers.lock().await;
                if let Some(entry) = servers.get_mut(id) {
                    entry.transport = Some(Arc::new(transport));
                    entry.tools = tools;
                    entry.state = ServerState::Running;
                }
                tracing::info!(server_id = %id, "tool-server restarted, resetting attempt counter");
            }
            Err(e) => {
                tracing::warn!(server_id = %id, error = %e, attempts, "restart attempt failed");
            }
        }
    }

    pub async fn state(&self, id: &str) -> Option<ServerState> {
        self.servers.lock().await.get(id).map(|e| e.state.clone())
    }

    /// All discovered tools across every running server, as `(server_id, tool)`.
    pub async fn list_tools(&self) -> Vec<(String, ToolDef)> {
        let servers = self.servers.lock().await;
        servers
            .values()
            .filter(|e| e.state == ServerState::Running)
            .flat_map(|e| e.tools.iter().map(move |t| (e.config.id.clone(), t.clone())))
            .collect()
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, SupervisorError> {
        let transport = {
            let servers = self.servers.lock().await;
            let entry = servers
                .get(server_id)
                .ok_or_else(|| SupervisorError::NotFound(server_id.to_string()))?;
            if entry.state != ServerState::Running {
                return Err(SupervisorError::NotRunning(server_id.to_string(), entry.state.clone()));
            }
            entry.transport.clone()
        };
        let Some(transport) = transport else {
            return Err(SupervisorError::NotRunning(server_id.to_string(), ServerState::Stopped { error: None }));
        };

        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        let resp = transport
            .send_request("tools/call", Some(params), std::time::Duration::from_secs(30))
            .await?;
        if resp.is_error() {
            return Err(SupervisorError::Protocol(format!(
                "tools/call failed: {}",
                resp.error.unwrap()
            )));
        }
        let result = resp.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| SupervisorError::Protocol(format!("bad tools/call result: {e}")))
    }

    pub async fn stop_server(&self, id: &str) {
        let transport = {
            let mut servers = self.servers.lock().await;
            let Some(entry) = servers.get_mut(id) else { return };
            entry.state = ServerState::Stopping;
            entry.transport.take()
        };
        if let Some(transport) = transport {
            transport.shutdown().await;
        }
        let mut servers = self.servers.lock().await;
        if let Some(entry) = servers.get_mut(id) {
            entry.state = ServerState::Stopped { error: None };
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.servers.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_server(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_backoff_doubles_then_caps_at_30s() {
        assert_eq!(restart_backoff(1), std::time::Duration::from_secs(2));
        assert_eq!(restart_backoff(2), std::time::Duration::from_secs(4));
        assert_eq!(restart_backoff(5), std::time::Duration::from_secs(30));
        assert_eq!(restart_backoff(10), std::time::Duration::from_secs(30));
    }

    #[tokio::test]
    async fn unknown_server_call_returns_not_found() {
        let supervisor = ToolServerSupervisor::new(SupervisorConfig::default());
        let err = supervisor
            .call_tool("nope", "whatever", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound(_)));
    }

    #[tokio::test]
    async fn start_server_with_bad_command_ends_stopped_with_error() {
        let supervisor = ToolServerSupervisor::new(SupervisorConfig::default());
        supervisor
            .start_server(ServerConfig {
                id: "broken".to_string(),
                command: "/this/binary/does/not/exist".to_string(),
                args: vec![],
                env: HashMap::new(),
            })
            .await;

        let state = supervisor.state("broken").await.unwrap();
        assert!(matches!(state, ServerState::Stopped { error: Some(_) }));
    }
}
