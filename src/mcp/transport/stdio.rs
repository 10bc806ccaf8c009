//! Subprocess transport: newline-delimited JSON-RPC over the child's
//! standard streams. The child's lifetime belongs to this transport; it is
//! killed on close and (as a backstop) when the handle is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{InitializeRequestParams, InitializeResult, RequestId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::McpTransport;
use crate::core::config::McpServerConfig;
use crate::mcp::{protocol, TransportError};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    pending: PendingMap,
    next_request_id: i64,
    reader: JoinHandle<()>,
    server_name: String,
}

impl StdioTransport {
    pub fn spawn(config: &McpServerConfig) -> Result<Self, TransportError> {
        let command = config.command.as_deref().ok_or_else(|| {
            TransportError::Protocol("stdio transport requires `command`".to_string())
        })?;

        let mut cmd = Command::new(command);
        cmd.args(config.args.clone().unwrap_or_default())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &config.env {
            cmd.envs(env);
        }

        debug!(server = %config.name, command, "Spawning MCP stdio server");
        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("child stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            Self::drain_stderr(config.name.clone(), stderr);
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = Self::spawn_stdout_reader(config.name.clone(), pending.clone(), stdout);

        Ok(Self {
            child,
            stdin,
            pending,
            next_request_id: 0,
            reader,
            server_name: config.name.clone(),
        })
    }

    fn spawn_stdout_reader(
        server: String,
        pending: PendingMap,
        stdout: tokio::process::ChildStdout,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let value: serde_json::Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if let Some(batch) = value.as_array() {
                    for item in batch {
                        if let Ok(message) = serde_json::from_value::<ServerMessage>(item.clone()) {
                            Self::dispatch(&server, &pending, message).await;
                        }
                    }
                } else if let Ok(message) = serde_json::from_value::<ServerMessage>(value) {
                    Self::dispatch(&server, &pending, message).await;
                }
            }
            // Child stdout closed: wake every waiter with a closed channel.
            pending.lock().await.clear();
            debug!(server = %server, "MCP stdio stream ended");
        })
    }

    fn drain_stderr(server: String, stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %server, line = %line, "MCP server stderr");
            }
        });
    }

    async fn dispatch(server: &str, pending: &PendingMap, message: ServerMessage) {
        match &message {
            ServerMessage::Response(response) => {
                let id = response.id.clone();
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::Error(error) => {
                if let Some(id) = error.id.as_ref() {
                    if let Some(tx) = pending.lock().await.remove(id) {
                        let _ = tx.send(message);
                    }
                }
            }
            ServerMessage::Request(request) => {
                debug!(
                    server = %server,
                    method = %request.method(),
                    "Ignoring unsupported server-to-client request"
                );
            }
            ServerMessage::Notification(_) => {
                debug!(server = %server, "MCP server notification");
            }
        }
    }

    async fn write_payload(&mut self, payload: &str) -> Result<(), TransportError> {
        for step in [payload.as_bytes(), b"\n"] {
            tokio::time::timeout(WRITE_TIMEOUT, self.stdin.write_all(step))
                .await
                .map_err(|_| TransportError::Io("stdin write timed out".to_string()))?
                .map_err(|err| TransportError::Io(err.to_string()))?;
        }
        tokio::time::timeout(WRITE_TIMEOUT, self.stdin.flush())
            .await
            .map_err(|_| TransportError::Io("stdin flush timed out".to_string()))?
            .map_err(|err| TransportError::Io(err.to_string()))?;
        Ok(())
    }

    async fn send_notification(
        &mut self,
        notification: NotificationFromClient,
    ) -> Result<(), TransportError> {
        let message =
            ClientMessage::from_message(MessageFromClient::NotificationFromClient(notification), None)
                .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let payload = serde_json::to_string(&message)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.write_payload(&payload).await
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn initialize(
        &mut self,
        params: InitializeRequestParams,
    ) -> Result<InitializeResult, TransportError> {
        let response = self
            .send_request(RequestFromClient::InitializeRequest(params))
            .await?;
        let result = protocol::parse_initialize_result(response)?;
        self.send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        Ok(result)
    }

    async fn send_request(
        &mut self,
        request: RequestFromClient,
    ) -> Result<ServerMessage, TransportError> {
        let request_id = RequestId::Integer(self.next_request_id);
        self.next_request_id += 1;

        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let payload = serde_json::to_string(&message)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(err) = self.write_payload(&payload).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }
        debug!(server = %self.server_name, request_id = ?request_id, "MCP stdio request sent");

        // The overall deadline is the caller's; a dropped sender means the
        // child died and the connection is gone.
        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.reader.abort();
        self.pending.lock().await.clear();
        if let Err(err) = self.child.start_kill() {
            debug!(server = %self.server_name, error = %err, "MCP stdio child already gone");
        }
        let _ = self.child.wait().await;
        debug!(server = %self.server_name, "MCP stdio server terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio_config(command: &str) -> McpServerConfig {
        McpServerConfig {
            name: "alpha".to_string(),
            transport: Some("stdio".to_string()),
            command: Some(command.to_string()),
            ..McpServerConfig::default()
        }
    }

    #[test]
    fn missing_command_is_rejected() {
        let config = McpServerConfig {
            name: "alpha".to_string(),
            transport: Some("stdio".to_string()),
            ..McpServerConfig::default()
        };
        // Spawn is synchronous validation first, so no runtime is needed.
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        let _guard = rt.enter();
        assert!(matches!(
            StdioTransport::spawn(&config),
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_error() {
        let config = stdio_config("/definitely/not/a/binary");
        assert!(matches!(
            StdioTransport::spawn(&config),
            Err(TransportError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn request_against_dead_child_reports_closed() {
        // `true` exits immediately, so the pending entry is cleared by the
        // reader task and the response channel closes.
        let config = stdio_config("true");
        let mut transport = StdioTransport::spawn(&config).expect("spawn");
        let err = transport
            .send_request(RequestFromClient::PingRequest(None))
            .await
            .expect_err("expected closed transport");
        assert!(matches!(
            err,
            TransportError::Closed | TransportError::Io(_)
        ));
        transport.close().await;
    }
}
