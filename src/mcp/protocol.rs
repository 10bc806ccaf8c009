//! Helpers for turning raw MCP server messages into typed results.

use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{CallToolResult, InitializeResult, ListToolsResult, RpcError};
use serde_json::Value;

use super::TransportError;

/// JSON-RPC code servers use for list methods they do not implement.
pub const METHOD_NOT_FOUND: i64 = -32601;

pub fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, TransportError> {
    let value = response_value(message)?;
    let result: InitializeResult = serde_json::from_value(value)
        .map_err(|err| TransportError::Protocol(err.to_string()))?;
    if result.protocol_version.trim().is_empty() {
        return Err(TransportError::Protocol(
            "initialize response carried no protocol version".to_string(),
        ));
    }
    Ok(result)
}

pub fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, TransportError> {
    parse_response(message)
}

pub fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, TransportError> {
    parse_response(message)
}

/// Returns true when a server reports the JSON-RPC method-not-found code.
/// Treated as a soft capability signal, not a failure.
pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == METHOD_NOT_FOUND
    )
}

pub fn rpc_error(error: &RpcError) -> TransportError {
    TransportError::Rpc {
        code: error.code,
        message: error.message.clone(),
    }
}

fn parse_response<T: serde::de::DeserializeOwned>(
    message: ServerMessage,
) -> Result<T, TransportError> {
    let value = response_value(message)?;
    serde_json::from_value(value).map_err(|err| TransportError::Protocol(err.to_string()))
}

fn response_value(message: ServerMessage) -> Result<Value, TransportError> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| TransportError::Protocol(err.to_string())),
        ServerMessage::Error(error) => Err(rpc_error(&error.error)),
        other => Err(TransportError::Protocol(format!(
            "expected a response, received {}",
            message_kind(&other)
        ))),
    }
}

fn message_kind(message: &ServerMessage) -> &'static str {
    match message {
        ServerMessage::Request(_) => "a server request",
        ServerMessage::Notification(_) => "a notification",
        ServerMessage::Response(_) => "a response",
        ServerMessage::Error(_) => "an error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(value: serde_json::Value) -> ServerMessage {
        serde_json::from_value(value).expect("message should parse")
    }

    #[test]
    fn initialize_without_protocol_version_is_rejected() {
        let msg = message(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "capabilities": {},
                "protocolVersion": " ",
                "serverInfo": {"name": "x", "version": "1.0.0"}
            }
        }));
        assert!(parse_initialize_result(msg).is_err());
    }

    #[test]
    fn call_tool_result_parses_from_response() {
        let msg = message(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {"content": [{"type": "text", "text": "hi"}]}
        }));
        let result = parse_call_tool(msg).expect("result should parse");
        assert_eq!(result.content.len(), 1);
    }

    #[test]
    fn rpc_errors_carry_code_and_message() {
        let msg = message(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32000, "message": "boom"}
        }));
        let err = parse_call_tool(msg).expect_err("expected rpc error");
        assert!(matches!(err, TransportError::Rpc { code: -32000, .. }));
    }

    #[test]
    fn method_not_found_is_detected() {
        let msg = message(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "no such method"}
        }));
        assert!(is_method_not_found(&msg));
    }
}
