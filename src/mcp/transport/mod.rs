//! Transport abstraction for MCP servers.
//!
//! Three closed variants: a spawned subprocess speaking newline-delimited
//! JSON-RPC ([`stdio`]), streamable HTTP ([`http`]), and the legacy
//! HTTP+SSE pairing ([`sse`]). The manager owns one boxed transport per
//! connected server and never sees variant-specific faults.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{RequestFromClient, ServerMessage};
use rust_mcp_schema::{InitializeRequestParams, InitializeResult};

use super::{ConnectionError, TransportError};
use crate::core::config::McpServerConfig;

pub mod http;
pub mod sse;
pub mod stdio;

/// Transport selection from a server descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl TransportKind {
    pub fn from_descriptor(config: &McpServerConfig) -> Result<Self, ConnectionError> {
        let transport = config
            .transport
            .as_deref()
            .unwrap_or("http")
            .to_ascii_lowercase();
        match transport.as_str() {
            "stdio" => Ok(TransportKind::Stdio),
            "http" | "streamable-http" | "streamable_http" | "streamable" => Ok(TransportKind::Http),
            "sse" => Ok(TransportKind::Sse),
            other => Err(ConnectionError::UnsupportedTransport(other.to_string())),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Sse => "sse",
        }
    }
}

/// Capability set every transport provides. Request/response correlation and
/// framing are variant-internal; callers work in whole [`ServerMessage`]s.
#[async_trait]
pub trait McpTransport: Send {
    /// Runs the MCP handshake (initialize + initialized notification) and
    /// returns the server's self-description.
    async fn initialize(
        &mut self,
        params: InitializeRequestParams,
    ) -> Result<InitializeResult, TransportError>;

    /// Sends one request and resolves with the correlated response.
    async fn send_request(
        &mut self,
        request: RequestFromClient,
    ) -> Result<ServerMessage, TransportError>;

    /// Releases transport resources. For stdio this terminates the child
    /// process; background reader tasks stop.
    async fn close(&mut self);
}

/// Incremental decoder for `text/event-stream` bodies. Bytes go in as they
/// arrive; completed events (event name + joined data payload) come out once
/// their terminating blank line has been seen.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

/// One decoded SSE event. `name` defaults to `message` per the SSE spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub name: String,
    pub data: String,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(line) = self.take_line() {
            if let Some(event) = self.accept_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a final event that was not followed by a blank line before
    /// the stream ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if let Ok(tail) = std::str::from_utf8(&self.buffer) {
            let tail = tail.trim_end_matches('\r').to_string();
            if !tail.is_empty() {
                self.accept_line(&tail);
            }
        }
        self.buffer.clear();
        self.dispatch()
    }

    fn take_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut end = newline;
        if end > 0 && self.buffer[end - 1] == b'\r' {
            end -= 1;
        }
        let line = std::str::from_utf8(&self.buffer[..end])
            .ok()
            .map(str::to_string);
        self.buffer.drain(..=newline);
        // Undecodable lines are dropped; the blank-line protocol keeps the
        // decoder in sync regardless.
        Some(line.unwrap_or_default())
    }

    fn accept_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event = Some(name.trim().to_string());
        } else if let Some(payload) = line.strip_prefix("data:") {
            self.data.push(payload.trim().to_string());
        }
        // Comment lines (leading ':') and unknown fields are ignored.
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let event = SseEvent {
            name: self.event.take().unwrap_or_else(|| "message".to_string()),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(event)
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: par").is_empty());
        let events = decoder.push(b"tial\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                name: "message".to_string(),
                data: "partial".to_string()
            }]
        );
    }

    #[test]
    fn named_events_keep_their_name() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"event: endpoint\ndata: /messages?id=1\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "endpoint");
        assert_eq!(events[0].data, "/messages?id=1");
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        let event = decoder.finish().expect("tail event");
        assert_eq!(event.data, "tail");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn comments_and_crlf_are_tolerated() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": keepalive\r\ndata: ok\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ok");
    }

    #[test]
    fn detects_event_stream_content_type() {
        assert!(is_event_stream_content_type(
            "text/event-stream; charset=utf-8"
        ));
        assert!(!is_event_stream_content_type("application/json"));
    }

    #[test]
    fn transport_kind_accepts_streamable_aliases() {
        let config = McpServerConfig {
            transport: Some("streamable_http".to_string()),
            ..McpServerConfig::default()
        };
        assert_eq!(
            TransportKind::from_descriptor(&config).expect("kind"),
            TransportKind::Http
        );
        let config = McpServerConfig {
            transport: Some("carrier-pigeon".to_string()),
            ..McpServerConfig::default()
        };
        assert!(matches!(
            TransportKind::from_descriptor(&config),
            Err(ConnectionError::UnsupportedTransport(_))
        ));
    }
}
