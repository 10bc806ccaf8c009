//! Legacy HTTP+SSE transport. A long-lived GET stream carries everything
//! the server pushes (including responses); the first `endpoint` event names
//! the URL that requests are POSTed to. Kept for servers that predate
//! streamable HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{InitializeRequestParams, InitializeResult, RequestId};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{is_event_stream_content_type, McpTransport, SseDecoder};
use crate::core::config::McpServerConfig;
use crate::mcp::{protocol, TransportError};

const ENDPOINT_WAIT: Duration = Duration::from_secs(10);
const POST_TIMEOUT: Duration = Duration::from_secs(60);

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

pub struct SseTransport {
    client: reqwest::Client,
    post_url: String,
    headers: HashMap<String, String>,
    pending: PendingMap,
    reader: JoinHandle<()>,
    next_request_id: i64,
    server_name: String,
}

impl SseTransport {
    pub async fn connect(config: &McpServerConfig) -> Result<Self, TransportError> {
        let stream_url = config.url.clone().ok_or_else(|| {
            TransportError::Protocol("sse transport requires `url`".to_string())
        })?;
        let headers = config.headers.clone().unwrap_or_default();

        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| TransportError::Http(err.to_string()))?;

        let mut request = client
            .get(&stream_url)
            .header("Accept", "text/event-stream");
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if !is_event_stream_content_type(content_type) {
            return Err(TransportError::Protocol(format!(
                "expected an event stream, server sent `{content_type}`"
            )));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = Self::spawn_stream_reader(
            config.name.clone(),
            pending.clone(),
            response,
            endpoint_tx,
        );

        let endpoint = match tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(TransportError::Closed);
            }
            Err(_) => {
                reader.abort();
                return Err(TransportError::Protocol(
                    "server never announced its message endpoint".to_string(),
                ));
            }
        };
        let post_url = resolve_endpoint(&stream_url, &endpoint)?;
        debug!(server = %config.name, post_url = %post_url, "SSE endpoint resolved");

        let http_client = reqwest::Client::builder()
            .timeout(POST_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Http(err.to_string()))?;

        Ok(Self {
            client: http_client,
            post_url,
            headers,
            pending,
            reader,
            next_request_id: 0,
            server_name: config.name.clone(),
        })
    }

    fn spawn_stream_reader(
        server: String,
        pending: PendingMap,
        response: reqwest::Response,
        endpoint_tx: oneshot::Sender<String>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut endpoint_tx = Some(endpoint_tx);

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        debug!(server = %server, error = %err, "SSE stream failed");
                        break;
                    }
                };
                for event in decoder.push(&chunk) {
                    match event.name.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(event.data);
                            }
                        }
                        _ => Self::dispatch(&server, &pending, &event.data).await,
                    }
                }
            }
            // Stream gone: every waiter sees a closed channel.
            pending.lock().await.clear();
            debug!(server = %server, "SSE stream ended");
        })
    }

    async fn dispatch(server: &str, pending: &PendingMap, data: &str) {
        if data.is_empty() {
            return;
        }
        let message = match serde_json::from_str::<ServerMessage>(data) {
            Ok(message) => message,
            Err(err) => {
                debug!(server = %server, error = %err, "Undecodable SSE payload");
                return;
            }
        };
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
                debug!(server = %server, "MCP server push event");
            }
        }
    }

    async fn post_message(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_string(message)
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        let mut request = self
            .client
            .post(&self.post_url)
            .header("Content-Type", "application/json")
            .body(payload);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }
        Ok(())
    }
}

/// The endpoint event may carry an absolute URL or a path relative to the
/// stream URL.
fn resolve_endpoint(stream_url: &str, endpoint: &str) -> Result<String, TransportError> {
    let base = reqwest::Url::parse(stream_url)
        .map_err(|err| TransportError::Protocol(format!("invalid stream url: {err}")))?;
    base.join(endpoint)
        .map(|url| url.to_string())
        .map_err(|err| TransportError::Protocol(format!("invalid endpoint `{endpoint}`: {err}")))
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn initialize(
        &mut self,
        params: InitializeRequestParams,
    ) -> Result<InitializeResult, TransportError> {
        let response = self
            .send_request(RequestFromClient::InitializeRequest(params))
            .await?;
        let result = protocol::parse_initialize_result(response)?;
        let notification = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(NotificationFromClient::InitializedNotification(
                None,
            )),
            None,
        )
        .map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.post_message(&notification).await?;
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

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(err) = self.post_message(&message).await {
            self.pending.lock().await.remove(&request_id);
            return Err(err);
        }
        debug!(server = %self.server_name, request_id = ?request_id, "MCP SSE request posted");

        rx.await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.reader.abort();
        self.pending.lock().await.clear();
        debug!(server = %self.server_name, "SSE transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_endpoints_resolve_against_the_stream_url() {
        let resolved = resolve_endpoint("https://mcp.example.com/sse", "/messages?session=7")
            .expect("endpoint should resolve");
        assert_eq!(resolved, "https://mcp.example.com/messages?session=7");
    }

    #[test]
    fn absolute_endpoints_pass_through() {
        let resolved = resolve_endpoint("https://mcp.example.com/sse", "https://other.example.com/rpc")
            .expect("endpoint should resolve");
        assert_eq!(resolved, "https://other.example.com/rpc");
    }

    #[test]
    fn garbage_endpoints_are_rejected() {
        assert!(resolve_endpoint("not a url", "/messages").is_err());
    }
}
