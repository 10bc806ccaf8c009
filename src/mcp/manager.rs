//! Ownership of tool-server connections.
//!
//! The manager dials every configured server concurrently, tracks each
//! connection's state independently, and is the only component that touches
//! transports. Servers that fail to connect are recorded as `Failed` and
//! simply contribute no tools; they never block the session.

use std::time::Duration;

use futures_util::future::join_all;
use rust_mcp_schema::schema_utils::RequestFromClient;
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, Implementation,
    InitializeRequestParams, InitializeResult, PaginatedRequestParams, Tool,
    LATEST_PROTOCOL_VERSION,
};
use tracing::{debug, warn};

use super::protocol;
use super::transport::{
    http::HttpTransport, sse::SseTransport, stdio::StdioTransport, McpTransport, TransportKind,
};
use super::{ConnectionError, InvocationError, TransportError};
use crate::core::config::McpServerConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);
const MAX_TOOL_LIST: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Failed(String),
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

pub struct ServerConnection {
    pub descriptor: McpServerConfig,
    pub state: ConnectionState,
    pub server_info: Option<InitializeResult>,
    pub tools: Vec<Tool>,
    transport: Option<Box<dyn McpTransport>>,
}

impl ServerConnection {
    fn new(descriptor: McpServerConfig) -> Self {
        Self {
            descriptor,
            state: ConnectionState::Disconnected,
            server_info: None,
            tools: Vec::new(),
            transport: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

struct DialOutcome {
    transport: Box<dyn McpTransport>,
    server_info: InitializeResult,
    tools: Vec<Tool>,
}

#[derive(Default)]
pub struct ServerManager {
    connections: Vec<ServerConnection>,
}

impl ServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> &[ServerConnection] {
        &self.connections
    }

    pub fn connection(&self, server: &str) -> Option<&ServerConnection> {
        self.connections.iter().find(|c| c.name() == server)
    }

    fn connection_mut(&mut self, server: &str) -> Option<&mut ServerConnection> {
        self.connections.iter_mut().find(|c| c.name() == server)
    }

    /// Tools reported by a server when it reached Ready.
    pub fn tools(&self, server: &str) -> Option<&[Tool]> {
        self.connection(server).map(|c| c.tools.as_slice())
    }

    /// Dials every descriptor concurrently. Descriptor order is preserved in
    /// the resulting connection list, which downstream code relies on for
    /// deterministic tool registration.
    pub async fn connect_all(&mut self, descriptors: Vec<McpServerConfig>) {
        let dials = descriptors.into_iter().map(|descriptor| async move {
            if !descriptor.is_enabled() {
                debug!(server = %descriptor.name, "Server disabled in configuration; skipping");
                return (descriptor, None);
            }
            let outcome = tokio::time::timeout(CONNECT_TIMEOUT, Self::dial(&descriptor)).await;
            let outcome = match outcome {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(CONNECT_TIMEOUT)),
            };
            (descriptor, Some(outcome))
        });

        for (descriptor, outcome) in join_all(dials).await {
            let mut connection = ServerConnection::new(descriptor);
            match outcome {
                None => connection.state = ConnectionState::Disconnected,
                Some(Ok(dial)) => {
                    debug!(
                        server = %connection.descriptor.name,
                        tools = dial.tools.len(),
                        "Tool server ready"
                    );
                    connection.state = ConnectionState::Ready;
                    connection.server_info = Some(dial.server_info);
                    connection.tools = dial.tools;
                    connection.transport = Some(dial.transport);
                }
                Some(Err(err)) => {
                    warn!(server = %connection.descriptor.name, error = %err, "Tool server failed to connect");
                    connection.state = ConnectionState::Failed(err.to_string());
                }
            }
            self.connections.push(connection);
        }
    }

    async fn dial(descriptor: &McpServerConfig) -> Result<DialOutcome, ConnectionError> {
        let kind = TransportKind::from_descriptor(descriptor)?;
        debug!(server = %descriptor.name, transport = kind.label(), "Connecting to tool server");
        let mut transport: Box<dyn McpTransport> = match kind {
            TransportKind::Stdio => Box::new(StdioTransport::spawn(descriptor)?),
            TransportKind::Http => Box::new(HttpTransport::new(descriptor)?),
            TransportKind::Sse => Box::new(SseTransport::connect(descriptor).await?),
        };

        let server_info = match transport.initialize(client_details()).await {
            Ok(info) => info,
            Err(err) => {
                transport.close().await;
                return Err(err.into());
            }
        };
        let tools = match Self::fetch_tools(transport.as_mut()).await {
            Ok(tools) => tools,
            Err(err) => {
                transport.close().await;
                return Err(err.into());
            }
        };
        Ok(DialOutcome {
            transport,
            server_info,
            tools,
        })
    }

    /// Fetches the complete tool list, following pagination cursors up to a
    /// fixed cap. Servers that do not implement `tools/list` contribute an
    /// empty list.
    async fn fetch_tools(transport: &mut dyn McpTransport) -> Result<Vec<Tool>, TransportError> {
        let mut tools: Vec<Tool> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|cursor| PaginatedRequestParams {
                cursor: Some(cursor),
                meta: None,
            });
            let response = transport
                .send_request(RequestFromClient::ListToolsRequest(params))
                .await?;
            if protocol::is_method_not_found(&response) {
                return Ok(Vec::new());
            }
            let mut page = protocol::parse_list_tools(response)?;
            tools.append(&mut page.tools);
            if tools.len() >= MAX_TOOL_LIST {
                tools.truncate(MAX_TOOL_LIST);
                return Ok(tools);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    /// One tool invocation, bounded by `timeout`. Timeouts and transport
    /// faults surface as [`InvocationError`]; connection state only changes
    /// when the transport reports the connection itself is gone.
    pub async fn invoke(
        &mut self,
        server: &str,
        tool: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
        timeout: Duration,
    ) -> Result<CallToolResult, InvocationError> {
        let connection = self
            .connection_mut(server)
            .ok_or_else(|| InvocationError::ServerNotReady(server.to_string()))?;
        if !connection.state.is_ready() {
            return Err(InvocationError::ServerNotReady(server.to_string()));
        }
        let transport = connection
            .transport
            .as_mut()
            .ok_or_else(|| InvocationError::ServerNotReady(server.to_string()))?;

        let mut params = CallToolRequestParams::new(tool);
        if !arguments.is_empty() {
            params = params.with_arguments(arguments);
        }

        let response = tokio::time::timeout(
            timeout,
            transport.send_request(RequestFromClient::CallToolRequest(params)),
        )
        .await
        .map_err(|_| InvocationError::Timeout(timeout))?;

        match response {
            Ok(message) => Ok(protocol::parse_call_tool(message)?),
            Err(TransportError::Closed) => {
                connection.state = ConnectionState::Failed("connection closed".to_string());
                connection.transport = None;
                connection.tools.clear();
                Err(InvocationError::Transport(TransportError::Closed))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn disconnect(&mut self, server: &str) {
        if let Some(connection) = self.connection_mut(server) {
            if let Some(mut transport) = connection.transport.take() {
                transport.close().await;
            }
            connection.state = ConnectionState::Disconnected;
            connection.tools.clear();
            connection.server_info = None;
        }
    }

    pub async fn disconnect_all(&mut self) {
        for connection in &mut self.connections {
            if let Some(mut transport) = connection.transport.take() {
                transport.close().await;
            }
        }
        self.connections.clear();
    }

    /// Full teardown followed by a fresh fan-out against the supplied
    /// descriptor set. Used when the tool configuration is reloaded.
    pub async fn reconnect_all(&mut self, descriptors: Vec<McpServerConfig>) {
        self.disconnect_all().await;
        self.connect_all(descriptors).await;
    }

    #[cfg(test)]
    pub(crate) fn insert_ready_for_tests(
        &mut self,
        descriptor: McpServerConfig,
        transport: Box<dyn McpTransport>,
        tools: Vec<Tool>,
    ) {
        let mut connection = ServerConnection::new(descriptor);
        connection.state = ConnectionState::Ready;
        connection.tools = tools;
        connection.transport = Some(transport);
        self.connections.push(connection);
    }
}

fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "estafette".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Estafette MCP Client".to_string()),
            description: Some("Estafette MCP client runtime".to_string()),
            icons: Vec::new(),
            website_url: Some("https://github.com/permacommons/estafette".to_string()),
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}
