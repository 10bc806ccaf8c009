//! Shared fakes for exercising the manager, executor, and conversation
//! engine without live tool servers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{RequestFromClient, ServerMessage};
use rust_mcp_schema::{InitializeRequestParams, InitializeResult, Tool};
use serde_json::{json, Map, Value};

use super::transport::McpTransport;
use super::TransportError;
use crate::core::config::McpServerConfig;

pub(crate) type RecordedCalls = Arc<Mutex<Vec<(String, Map<String, Value>)>>>;

pub(crate) struct FakeTransport {
    responses: VecDeque<Result<ServerMessage, TransportError>>,
    delay: Option<Duration>,
    pub calls: RecordedCalls,
}

impl FakeTransport {
    pub(crate) fn new(responses: Vec<Result<ServerMessage, TransportError>>) -> Self {
        Self {
            responses: responses.into(),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn recorded_calls(&self) -> RecordedCalls {
        self.calls.clone()
    }
}

#[async_trait]
impl McpTransport for FakeTransport {
    async fn initialize(
        &mut self,
        _params: InitializeRequestParams,
    ) -> Result<InitializeResult, TransportError> {
        Ok(init_result())
    }

    async fn send_request(
        &mut self,
        request: RequestFromClient,
    ) -> Result<ServerMessage, TransportError> {
        if let RequestFromClient::CallToolRequest(params) = &request {
            self.calls
                .lock()
                .expect("calls lock")
                .push((params.name.clone(), params.arguments.clone().unwrap_or_default()));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .pop_front()
            .unwrap_or_else(|| Ok(call_tool_response("ok")))
    }

    async fn close(&mut self) {}
}

pub(crate) fn init_result() -> InitializeResult {
    serde_json::from_value(json!({
        "capabilities": {},
        "protocolVersion": "2025-11-25",
        "serverInfo": {"name": "fake-server", "version": "0.0.1"}
    }))
    .expect("initialize result should parse")
}

pub(crate) fn tool(name: &str) -> Tool {
    tool_with_schema(name, json!({"type": "object"}))
}

pub(crate) fn tool_with_schema(name: &str, schema: Value) -> Tool {
    serde_json::from_value(json!({
        "name": name,
        "description": format!("fake tool {name}"),
        "inputSchema": schema
    }))
    .expect("tool should parse")
}

pub(crate) fn call_tool_response(text: &str) -> ServerMessage {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": 0,
        "result": {"content": [{"type": "text", "text": text}]}
    }))
    .expect("call tool response should parse")
}

pub(crate) fn rpc_error_response(code: i64, message: &str) -> ServerMessage {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": 0,
        "error": {"code": code, "message": message}
    }))
    .expect("rpc error should parse")
}

pub(crate) fn stdio_descriptor(name: &str, command: &str) -> McpServerConfig {
    McpServerConfig {
        name: name.to_string(),
        transport: Some("stdio".to_string()),
        command: Some(command.to_string()),
        ..McpServerConfig::default()
    }
}
