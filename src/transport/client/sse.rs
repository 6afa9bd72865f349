//! Push-stream transport, client side: an eventsource stream for
//! server-to-client messages plus HTTP POSTs to the session-scoped URL the
//! server announced in its first event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::watch;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{
    CloseHandler, ErrorHandler, Handlers, JsonRpcMessage, MessageContext, MessageHandler,
    Transport,
};

/// How long to wait for the server's `endpoint` event after opening the
/// stream.
const ENDPOINT_WAIT: Duration = Duration::from_secs(5);

/// Client transport over server-sent events.
#[derive(Clone)]
pub struct ClientSseTransport {
    inner: Arc<SseClientInner>,
}

struct SseClientInner {
    server_url: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
    headers: HashMap<String, String>,
    handlers: Handlers,
    message_endpoint: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    closed: AtomicBool,
}

/// Builder for [`ClientSseTransport`].
pub struct ClientSseTransportBuilder {
    server_url: String,
    bearer_token: Option<String>,
    headers: HashMap<String, String>,
}

impl ClientSseTransportBuilder {
    /// Creates a new builder for the given stream URL.
    ///
    /// # Arguments
    ///
    /// * `server_url` - The URL of the event-stream endpoint
    ///
    /// # Returns
    ///
    /// A new `ClientSseTransportBuilder` instance
    pub fn new(server_url: String) -> Self {
        Self {
            server_url,
            bearer_token: None,
            headers: HashMap::new(),
        }
    }

    /// Adds a bearer token for authentication.
    ///
    /// The token is sent as `Authorization: Bearer {token}` on every
    /// request.
    ///
    /// # Arguments
    ///
    /// * `token` - The bearer token
    ///
    /// # Returns
    ///
    /// The modified builder instance
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Adds a custom HTTP header to every request.
    ///
    /// # Arguments
    ///
    /// * `key` - The header name
    /// * `value` - The header value
    ///
    /// # Returns
    ///
    /// The modified builder instance
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builds the transport with the configured options.
    ///
    /// # Returns
    ///
    /// A new `ClientSseTransport` instance
    pub fn build(self) -> ClientSseTransport {
        ClientSseTransport {
            inner: Arc::new(SseClientInner {
                server_url: self.server_url,
                client: reqwest::Client::new(),
                bearer_token: self.bearer_token,
                headers: self.headers,
                handlers: Handlers::default(),
                message_endpoint: Mutex::new(None),
                shutdown: watch::channel(false).0,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl ClientSseTransport {
    /// Creates a new builder for configuring the transport.
    ///
    /// # Arguments
    ///
    /// * `url` - The URL of the event-stream endpoint (for example
    ///   `http://127.0.0.1:8001/mcp/sse`)
    ///
    /// # Returns
    ///
    /// A new `ClientSseTransportBuilder` instance
    pub fn builder(url: String) -> ClientSseTransportBuilder {
        ClientSseTransportBuilder::new(url)
    }

    fn resolve_endpoint(&self, data: &str) -> Result<String> {
        let base = Url::parse(&self.inner.server_url)
            .map_err(|e| Error::Transport(format!("invalid server URL: {e}")))?;
        let resolved = base
            .join(data)
            .map_err(|e| Error::Transport(format!("invalid endpoint event data: {e}")))?;
        Ok(resolved.to_string())
    }

    fn message_endpoint(&self) -> Result<String> {
        self.inner
            .message_endpoint
            .lock()
            .expect("endpoint lock poisoned")
            .clone()
            .ok_or_else(|| Error::Transport("no session endpoint available".into()))
    }
}

#[async_trait]
impl Transport for ClientSseTransport {
    /// Opens the event stream and waits for the session endpoint.
    ///
    /// This method:
    /// 1. Establishes the eventsource connection with the configured
    ///    headers and authentication
    /// 2. Starts a background task routing stream events to the handlers
    /// 3. Waits for the server's `endpoint` event announcing the session's
    ///    message URL
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut request = self.inner.client.get(&self.inner.server_url);
        for (key, value) in &self.inner.headers {
            request = request.header(key, value);
        }
        if let Some(token) = &self.inner.bearer_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let mut events = EventSource::new(request)
            .map_err(|e| Error::Transport(format!("failed to open event stream: {e}")))?;

        let transport = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        events.close();
                        break;
                    }
                    event = events.next() => match event {
                        Some(Ok(Event::Open)) => tracing::debug!("SSE stream open"),
                        Some(Ok(Event::Message(message))) => {
                            if message.event == "endpoint" {
                                match transport.resolve_endpoint(&message.data) {
                                    Ok(url) => {
                                        tracing::debug!("received session endpoint: {url}");
                                        *transport
                                            .inner
                                            .message_endpoint
                                            .lock()
                                            .expect("endpoint lock poisoned") = Some(url);
                                    }
                                    Err(e) => transport.inner.handlers.dispatch_error(e),
                                }
                            } else {
                                match serde_json::from_str::<JsonRpcMessage>(&message.data) {
                                    Ok(message) => {
                                        transport
                                            .inner
                                            .handlers
                                            .dispatch_message(MessageContext::default(), message)
                                            .await
                                    }
                                    Err(e) => transport.inner.handlers.dispatch_error(Error::Json(e)),
                                }
                            }
                        }
                        Some(Err(e)) => {
                            transport
                                .inner
                                .handlers
                                .dispatch_error(Error::Transport(format!("event stream error: {e}")));
                            events.close();
                            let _ = transport.close().await;
                            break;
                        }
                        None => {
                            let _ = transport.close().await;
                            break;
                        }
                    }
                }
            }
        });

        // The first event on the stream is the session endpoint.
        let deadline = tokio::time::Instant::now() + ENDPOINT_WAIT;
        while tokio::time::Instant::now() < deadline {
            if self
                .inner
                .message_endpoint
                .lock()
                .expect("endpoint lock poisoned")
                .is_some()
            {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(Error::Transport(
            "timed out waiting for the endpoint event".into(),
        ))
    }

    /// POSTs one envelope to the session's message URL.
    ///
    /// # Arguments
    ///
    /// * `message` - The envelope to send
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn send(&self, _ctx: &MessageContext, message: &JsonRpcMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        let endpoint = self.message_endpoint()?;

        let mut request = self.inner.client.post(&endpoint).json(message);
        for (key, value) in &self.inner.headers {
            request = request.header(key, value);
        }
        if let Some(token) = &self.inner.bearer_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpServer(format!(
                "failed to send message, status {status}: {body}"
            )));
        }
        Ok(())
    }

    /// Terminates the event stream and forgets the session endpoint.
    /// Idempotent.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success
    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.inner.shutdown.send(true);
        *self
            .inner
            .message_endpoint
            .lock()
            .expect("endpoint lock poisoned") = None;
        self.inner.handlers.dispatch_close();
        Ok(())
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        self.inner.handlers.set_message(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        self.inner.handlers.set_error(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        self.inner.handlers.set_close(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_event_data_resolves_against_the_stream_url() {
        let transport =
            ClientSseTransport::builder("http://127.0.0.1:8001/mcp/sse".to_string()).build();
        let resolved = transport
            .resolve_endpoint("/mcp/sse/message?session_id=1d9c3a7e0f4b5a6c2e1f3b0a4d8c9e7f")
            .unwrap();
        assert_eq!(
            resolved,
            "http://127.0.0.1:8001/mcp/sse/message?session_id=1d9c3a7e0f4b5a6c2e1f3b0a4d8c9e7f"
        );
    }

    #[test]
    fn absolute_endpoint_data_is_used_as_is() {
        let transport =
            ClientSseTransport::builder("http://127.0.0.1:8001/mcp/sse".to_string()).build();
        let resolved = transport
            .resolve_endpoint("http://other:9000/mcp/sse/message?session_id=aa")
            .unwrap();
        assert_eq!(resolved, "http://other:9000/mcp/sse/message?session_id=aa");
    }

    #[tokio::test]
    async fn send_without_endpoint_fails() {
        let transport =
            ClientSseTransport::builder("http://127.0.0.1:8001/mcp/sse".to_string()).build();
        let message = JsonRpcMessage::Notification(crate::transport::JsonRpcNotification::new(
            "test/notify",
            None,
        ));
        let err = transport
            .send(&MessageContext::default(), &message)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no session endpoint"));
    }
}
