//! Request/reply HTTP transport, server side.
//!
//! Stateless: each client POST carries one envelope and receives its
//! correlated response in the same HTTP exchange. Notifications are
//! acknowledged immediately with 200; envelopes with an id wait (bounded)
//! for the correlation engine to produce the matching response.
//!
//! Correlation relies on the envelope id being unique across in-flight
//! POSTs to the same process: clients MUST NOT reuse an id for a concurrent
//! request, or routing is undefined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::{web, App, HttpResponse, HttpServer};
use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::transport::{
    CloseHandler, ErrorHandler, Handlers, JsonRpcMessage, MessageContext, MessageHandler,
    RequestId, Transport,
};

/// How long the server waits for the correlated response before answering
/// 408.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

type PendingExchanges = Arc<Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcMessage>>>>;

/// Server transport answering one envelope per HTTP exchange.
#[derive(Clone)]
pub struct ServerHttpTransport {
    inner: Arc<HttpServerInner>,
}

struct HttpServerInner {
    host: String,
    port: u16,
    endpoint: String,
    handlers: Handlers,
    pending: PendingExchanges,
    server: Mutex<Option<actix_web::dev::ServerHandle>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl ServerHttpTransport {
    /// Creates a new `ServerHttpTransport` instance.
    ///
    /// # Arguments
    ///
    /// * `host` - The host address to bind the HTTP server to
    /// * `port` - The port to listen on
    /// * `endpoint` - The path of the POST endpoint (for example `/mcp`)
    ///
    /// # Returns
    ///
    /// A new `ServerHttpTransport` instance
    pub fn new(host: impl Into<String>, port: u16, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            inner: Arc::new(HttpServerInner {
                host: host.into(),
                port,
                endpoint: endpoint.trim_end_matches('/').to_string(),
                handlers: Handlers::default(),
                pending: Arc::new(Mutex::new(HashMap::new())),
                server: Mutex::new(None),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    async fn handle_post(self, body: web::Bytes) -> HttpResponse {
        let message: JsonRpcMessage = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(e) => return HttpResponse::BadRequest().body(format!("Invalid request: {e}")),
        };

        if !self.inner.handlers.has_message_handler() {
            return HttpResponse::InternalServerError().body("No message handler registered");
        }

        let Some(id) = message.id().cloned() else {
            // Notification: hand off and acknowledge immediately.
            let handlers = self.inner.handlers.clone();
            tokio::spawn(async move {
                handlers
                    .dispatch_message(MessageContext::default(), message)
                    .await;
            });
            return HttpResponse::Ok().finish();
        };

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id.clone(), tx);

        // Cleans up the slot on timeout or client disconnect; a completed
        // exchange has already removed it.
        let _guard = ExchangeGuard {
            pending: self.inner.pending.clone(),
            id: id.clone(),
        };

        let handlers = self.inner.handlers.clone();
        tokio::spawn(async move {
            handlers
                .dispatch_message(MessageContext::default(), message)
                .await;
        });

        match tokio::time::timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(response)) => HttpResponse::Ok().json(response),
            Ok(Err(_)) | Err(_) => {
                tracing::warn!("request timeout for id {id}");
                HttpResponse::RequestTimeout().body("Request timeout")
            }
        }
    }
}

#[async_trait]
impl Transport for ServerHttpTransport {
    /// Starts the HTTP server.
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

        let transport = self.clone();
        let base = self.inner.endpoint.clone();
        let health_path = format!("{base}/health");

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(transport.clone()))
                .route(&base, web::post().to(post_route))
                .route(&health_path, web::get().to(health_route))
        })
        .bind((self.inner.host.clone(), self.inner.port))?
        .run();

        *self.inner.server.lock().expect("server lock poisoned") = Some(server.handle());
        tracing::info!(
            "streamable HTTP server listening on {}:{}{}",
            self.inner.host,
            self.inner.port,
            self.inner.endpoint
        );

        let handlers = self.inner.handlers.clone();
        tokio::spawn(async move {
            if let Err(e) = server.await {
                handlers.dispatch_error(Error::Io(e));
            }
        });

        Ok(())
    }

    /// Routes a response back to the HTTP exchange waiting on its id.
    ///
    /// Envelopes with no id, or with no pending exchange, are dropped; the
    /// stateless transport has nowhere to deliver them.
    ///
    /// # Arguments
    ///
    /// * `message` - The envelope to deliver
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn send(&self, _ctx: &MessageContext, message: &JsonRpcMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }

        let Some(id) = message.id() else {
            // Server-originated notifications have no HTTP exchange to ride.
            tracing::debug!("dropping id-less message on request/reply transport");
            return Ok(());
        };

        let sender = self
            .inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(id);
        match sender {
            Some(tx) => tx.send(message.clone()).map_err(|_| Error::Cancelled),
            None => {
                tracing::debug!("no pending exchange for id {id}; dropping");
                Ok(())
            }
        }
    }

    /// Drains pending exchanges and shuts the HTTP server down. Idempotent.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success
    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Waiting exchanges answer 408 as their senders drop.
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .clear();

        let handle = self
            .inner
            .server
            .lock()
            .expect("server lock poisoned")
            .take();
        if let Some(handle) = handle {
            handle.stop(true).await;
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

struct ExchangeGuard {
    pending: PendingExchanges,
    id: RequestId,
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

async fn post_route(body: web::Bytes, transport: web::Data<ServerHttpTransport>) -> HttpResponse {
    transport.get_ref().clone().handle_post(body).await
}

async fn health_route() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}
