//! Request/reply HTTP transport, client side: one POST per outgoing
//! envelope, with the correlated response parsed out of the same HTTP
//! exchange and delivered through the message handler inline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::transport::{
    CloseHandler, ErrorHandler, Handlers, JsonRpcMessage, MessageContext, MessageHandler,
    Transport,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client transport POSTing envelopes to a streamable HTTP server.
///
/// Holds no long-lived connections; standard reqwest connection pooling
/// applies underneath.
#[derive(Clone)]
pub struct ClientHttpTransport {
    inner: Arc<HttpClientInner>,
}

struct HttpClientInner {
    url: String,
    client: reqwest::Client,
    handlers: Handlers,
    closed: AtomicBool,
}

impl ClientHttpTransport {
    /// Creates a transport with the default 30-second HTTP timeout.
    ///
    /// # Arguments
    ///
    /// * `url` - The full endpoint URL (for example
    ///   `http://127.0.0.1:8000/mcp`)
    ///
    /// # Returns
    ///
    /// A new `ClientHttpTransport` instance
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    /// Creates a transport with a custom HTTP timeout.
    ///
    /// # Arguments
    ///
    /// * `url` - The full endpoint URL
    /// * `timeout` - The per-request HTTP timeout
    ///
    /// # Returns
    ///
    /// A new `ClientHttpTransport` instance
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(HttpClientInner {
                url: url.into(),
                client,
                handlers: Handlers::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl Transport for ClientHttpTransport {
    /// Starts the transport. A no-op for the stateless HTTP client.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        Ok(())
    }

    /// POSTs one envelope and feeds any response body back through the
    /// message handler on the calling task.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The context to deliver the correlated response with
    /// * `message` - The envelope to send
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn send(&self, ctx: &MessageContext, message: &JsonRpcMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }

        let response = self
            .inner
            .client
            .post(&self.inner.url)
            .json(message)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpServer(format!(
                "server returned status {status}: {body}"
            )));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            // Notification acknowledgement.
            return Ok(());
        }

        let reply: JsonRpcMessage = serde_json::from_slice(&body)?;
        self.inner
            .handlers
            .dispatch_message(ctx.clone(), reply)
            .await;
        Ok(())
    }

    /// Closes the transport. Idempotent.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success
    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
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

    #[tokio::test]
    async fn start_after_close_fails() {
        let transport = ClientHttpTransport::new("http://127.0.0.1:1/mcp");
        transport.close().await.unwrap();
        assert!(transport.start().await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = ClientHttpTransport::new("http://127.0.0.1:1/mcp");
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = count.clone();
        transport.set_close_handler(Arc::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
