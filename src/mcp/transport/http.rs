//! Streamable HTTP transport: every client message is POSTed to the server
//! URL; responses come back as JSON or as a short-lived SSE body. The
//! `mcp-session-id` issued during initialize is replayed on every later
//! request, as is the negotiated protocol version.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{InitializeRequestParams, InitializeResult, RequestId};
use tracing::debug;

use super::{is_event_stream_content_type, McpTransport, SseDecoder};
use crate::core::config::McpServerConfig;
use crate::mcp::{protocol, TransportError};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: Option<String>,
    protocol_version: Option<String>,
    next_request_id: i64,
    server_name: String,
}

impl HttpTransport {
    pub fn new(config: &McpServerConfig) -> Result<Self, TransportError> {
        let url = config.url.clone().ok_or_else(|| {
            TransportError::Protocol("http transport requires `url`".to_string())
        })?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Http(err.to_string()))?;
        Ok(Self {
            client,
            url,
            headers: config.headers.clone().unwrap_or_default(),
            session_id: None,
            protocol_version: None,
            next_request_id: 0,
            server_name: config.name.clone(),
        })
    }

    fn apply_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request = request
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("Accept", JSON_AND_SSE_ACCEPT);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(version) = self.protocol_version.as_deref().filter(|v| !v.trim().is_empty()) {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        request
    }

    /// POSTs one message; returns the response body (if any) plus a session
    /// id when the server issued one.
    async fn post_message(
        &mut self,
        message: &ClientMessage,
        expect_response: bool,
    ) -> Result<Option<ServerMessage>, TransportError> {
        let payload = serde_json::to_string(message)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let request = self.apply_headers(self.client.post(&self.url)).body(payload);
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }
        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }
        if !expect_response {
            return Ok(None);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        let message = if is_event_stream_content_type(&content_type) {
            next_response_from_stream(&self.server_name, response).await?
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|err| TransportError::Http(err.to_string()))?;
            serde_json::from_slice::<ServerMessage>(&body)
                .map_err(|err| TransportError::Protocol(err.to_string()))?
        };
        Ok(Some(message))
    }
}

/// Reads an SSE response body until the first response or error message; a
/// streamable-HTTP POST body carries exactly one of those for the request it
/// answers. Anything else on the stream is logged and skipped.
async fn next_response_from_stream(
    server: &str,
    response: reqwest::Response,
) -> Result<ServerMessage, TransportError> {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    let mut handle = |data: &str| -> Option<ServerMessage> {
        if data.is_empty() {
            return None;
        }
        match serde_json::from_str::<ServerMessage>(data) {
            Ok(message @ (ServerMessage::Response(_) | ServerMessage::Error(_))) => Some(message),
            Ok(_) => {
                debug!(server = %server, "Skipping non-response message on SSE body");
                None
            }
            Err(err) => {
                debug!(server = %server, error = %err, "Undecodable SSE payload");
                None
            }
        }
    };

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| TransportError::Http(err.to_string()))?;
        for event in decoder.push(&chunk) {
            if let Some(message) = handle(&event.data) {
                return Ok(message);
            }
        }
    }
    if let Some(event) = decoder.finish() {
        if let Some(message) = handle(&event.data) {
            return Ok(message);
        }
    }
    Err(TransportError::Protocol(
        "event stream ended without a response".to_string(),
    ))
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn initialize(
        &mut self,
        params: InitializeRequestParams,
    ) -> Result<InitializeResult, TransportError> {
        let response = self
            .send_request(RequestFromClient::InitializeRequest(params))
            .await?;
        let result = protocol::parse_initialize_result(response)?;
        self.protocol_version = Some(result.protocol_version.clone());
        if self.session_id.is_none() {
            debug!(server = %self.server_name, "Server issued no session id; continuing stateless");
        }

        let notification = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(NotificationFromClient::InitializedNotification(
                None,
            )),
            None,
        )
        .map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.post_message(&notification, false).await?;
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
            Some(request_id),
        )
        .map_err(|err| TransportError::Protocol(err.to_string()))?;

        self.post_message(&message, true)
            .await?
            .ok_or_else(|| TransportError::Protocol("empty response body".to_string()))
    }

    async fn close(&mut self) {
        // The logical session ends with the client; stateless POSTs need no
        // teardown handshake.
        self.session_id = None;
    }
}
