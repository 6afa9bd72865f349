//! Push-stream transport, server side.
//!
//! Binds a session-scoped message-receipt URL to a persistent server-sent
//! event stream. Opening `GET {base}` creates a session and announces its
//! POST URL in the first event; every outbound envelope for that session is
//! then emitted as a `message` event. Inbound envelopes arrive via
//! `POST {base}/message?session_id=<hex>` and are delivered to the message
//! handler with the session id in the context, so responses route back to
//! the originating stream. Sends with no session context broadcast to every
//! open session on a best-effort basis.
//!
//! A POST for a session that was never created (or has already been
//! deregistered) answers 404; in the window where the session record still
//! exists but its inbound queue has shut down the answer is 410.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::middleware::{run_chain, HttpMiddleware};
use crate::error::{Error, Result};
use crate::transport::{
    CloseHandler, ErrorHandler, Handlers, JsonRpcMessage, MessageContext, MessageHandler,
    Transport, CHANNEL_CAPACITY,
};

/// Grace period for draining connections on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Sessions = Arc<RwLock<HashMap<String, SseSession>>>;

/// Server transport that pushes envelopes to clients over server-sent
/// events and receives them via session-scoped POSTs.
#[derive(Clone)]
pub struct ServerSseTransport {
    inner: Arc<SseServerInner>,
}

struct SseServerInner {
    host: String,
    port: u16,
    endpoint: String,
    handlers: Handlers,
    sessions: Sessions,
    middleware: RwLock<Vec<Arc<dyn HttpMiddleware>>>,
    server: Mutex<Option<actix_web::dev::ServerHandle>>,
    started: AtomicBool,
    closed: AtomicBool,
}

struct SseSession {
    outbound_tx: mpsc::Sender<JsonRpcMessage>,
    inbound_tx: mpsc::Sender<JsonRpcMessage>,
}

impl ServerSseTransport {
    /// Creates a new `ServerSseTransport` instance.
    ///
    /// # Arguments
    ///
    /// * `host` - The host address to bind the HTTP server to
    /// * `port` - The port to listen on
    /// * `endpoint` - The path of the event-stream endpoint (for example
    ///   `/mcp/sse`)
    ///
    /// # Returns
    ///
    /// A new `ServerSseTransport` instance
    pub fn new(host: impl Into<String>, port: u16, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            inner: Arc::new(SseServerInner {
                host: host.into(),
                port,
                endpoint: endpoint.trim_end_matches('/').to_string(),
                handlers: Handlers::default(),
                sessions: Arc::new(RwLock::new(HashMap::new())),
                middleware: RwLock::new(Vec::new()),
                server: Mutex::new(None),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Adds an HTTP middleware layer.
    ///
    /// The last middleware added wraps first at the outside, so it sees the
    /// request first and the response last.
    ///
    /// # Arguments
    ///
    /// * `middleware` - The middleware layer to add
    ///
    /// # Returns
    ///
    /// The modified transport instance
    pub fn with_middleware(self, middleware: impl HttpMiddleware) -> Self {
        self.inner
            .middleware
            .write()
            .expect("middleware lock poisoned")
            .push(Arc::new(middleware));
        self
    }

    fn middleware_snapshot(&self) -> Vec<Arc<dyn HttpMiddleware>> {
        self.inner
            .middleware
            .read()
            .expect("middleware lock poisoned")
            .clone()
    }

    async fn handle_sse(self, req: HttpRequest) -> HttpResponse {
        let peer = req
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let session_id = Uuid::new_v4().simple().to_string();
        let (outbound_tx, outbound_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);

        self.inner
            .sessions
            .write()
            .expect("session lock poisoned")
            .insert(
                session_id.clone(),
                SseSession {
                    outbound_tx,
                    inbound_tx,
                },
            );
        tracing::info!("SSE session {session_id} opened for {peer}");

        // Per-session reader: deliver POSTed envelopes with the session
        // context so responses route back to this stream.
        let handlers = self.inner.handlers.clone();
        let reader_session = session_id.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                handlers
                    .dispatch_message(MessageContext::for_session(&reader_session), message)
                    .await;
            }
        });

        let endpoint_event = format!(
            "event: endpoint\ndata: {}/message?session_id={}\n\n",
            self.inner.endpoint, session_id
        );
        let guard = SessionGuard {
            sessions: self.inner.sessions.clone(),
            session_id,
        };

        let stream = futures::stream::once(async move {
            Ok::<_, Infallible>(web::Bytes::from(endpoint_event))
        })
        .chain(futures::stream::unfold(
            (outbound_rx, guard),
            |(mut rx, guard)| async move {
                let message = rx.recv().await?;
                let json = serde_json::to_string(&message).unwrap_or_default();
                let frame = format!("event: message\ndata: {json}\n\n");
                Some((Ok(web::Bytes::from(frame)), (rx, guard)))
            },
        ));

        HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header(("Cache-Control", "no-cache"))
            .insert_header(("Connection", "keep-alive"))
            .streaming(stream)
    }

    async fn handle_message_post(self, req: HttpRequest, body: web::Bytes) -> HttpResponse {
        let query = match web::Query::<MessageQuery>::from_query(req.query_string()) {
            Ok(query) => query.into_inner(),
            Err(_) => return HttpResponse::BadRequest().body("session_id is required"),
        };
        let Some(session_id) = query.session_id else {
            return HttpResponse::BadRequest().body("session_id is required");
        };

        let inbound_tx = {
            let sessions = self.inner.sessions.read().expect("session lock poisoned");
            sessions.get(&session_id).map(|s| s.inbound_tx.clone())
        };
        let Some(inbound_tx) = inbound_tx else {
            return HttpResponse::NotFound().body(format!("Could not find session {session_id}"));
        };

        let message: JsonRpcMessage = match serde_json::from_slice(&body) {
            Ok(message) => message,
            Err(_) => return HttpResponse::BadRequest().body("Invalid JSON"),
        };

        tracing::debug!("session {session_id} received: {message:?}");
        match inbound_tx.send(message).await {
            Ok(()) => HttpResponse::Accepted().finish(),
            Err(_) => HttpResponse::Gone().body("Session closed"),
        }
    }
}

#[async_trait]
impl Transport for ServerSseTransport {
    /// Starts the HTTP server.
    ///
    /// This method:
    /// 1. Sets up routes for the event stream, the message endpoint, and
    ///    the health check
    /// 2. Binds to the configured host and port
    /// 3. Runs the server in the background
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
        let message_path = format!("{base}/message");
        let health_path = format!("{base}/health");

        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(transport.clone()))
                .route(&base, web::get().to(sse_route))
                .route(&message_path, web::post().to(message_route))
                .route(&health_path, web::get().to(health_route))
        })
        .bind((self.inner.host.clone(), self.inner.port))?
        .run();

        *self.inner.server.lock().expect("server lock poisoned") = Some(server.handle());
        tracing::info!(
            "SSE server listening on {}:{}{}",
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

    /// Sends an envelope to the session named by the context, or broadcasts
    /// to every open session when the context carries none.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The context naming the destination session, if any
    /// * `message` - The envelope to emit as a `message` event
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure; targeted sends fail when
    /// the session is unknown, closed, or its queue is full
    async fn send(&self, ctx: &MessageContext, message: &JsonRpcMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }

        match ctx.session_id() {
            Some(session_id) => {
                let outbound_tx = {
                    let sessions = self.inner.sessions.read().expect("session lock poisoned");
                    sessions.get(session_id).map(|s| s.outbound_tx.clone())
                };
                let Some(tx) = outbound_tx else {
                    return Err(Error::SessionNotFound(session_id.to_string()));
                };
                match tx.try_send(message.clone()) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        Err(Error::SessionBufferFull(session_id.to_string()))
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        Err(Error::SessionClosed(session_id.to_string()))
                    }
                }
            }
            None => {
                // Best-effort broadcast; slow or closed sessions are skipped.
                let senders: Vec<(String, mpsc::Sender<JsonRpcMessage>)> = {
                    let sessions = self.inner.sessions.read().expect("session lock poisoned");
                    sessions
                        .iter()
                        .map(|(id, s)| (id.clone(), s.outbound_tx.clone()))
                        .collect()
                };
                for (session_id, tx) in senders {
                    if tx.try_send(message.clone()).is_err() {
                        tracing::debug!("skipping session {session_id} during broadcast");
                    }
                }
                Ok(())
            }
        }
    }

    /// Destroys every session and shuts the HTTP server down within the
    /// shutdown grace period. Idempotent.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success
    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Destroying the session records drops both queues; every stream
        // ends and every per-session task exits.
        self.inner
            .sessions
            .write()
            .expect("session lock poisoned")
            .clear();

        let handle = self
            .inner
            .server
            .lock()
            .expect("server lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle.stop(true)).await;
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

struct SessionGuard {
    sessions: Sessions,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut sessions) = self.sessions.write() {
            if sessions.remove(&self.session_id).is_some() {
                tracing::info!("SSE session {} closed", self.session_id);
            }
        }
    }
}

#[derive(Deserialize)]
struct MessageQuery {
    session_id: Option<String>,
}

async fn sse_route(req: HttpRequest, transport: web::Data<ServerSseTransport>) -> HttpResponse {
    let transport = transport.get_ref().clone();
    let middleware = transport.middleware_snapshot();
    run_chain(&middleware, req, web::Bytes::new(), move |req, _body| {
        let transport = transport.clone();
        Box::pin(async move { transport.handle_sse(req).await })
    })
    .await
}

async fn message_route(
    req: HttpRequest,
    body: web::Bytes,
    transport: web::Data<ServerSseTransport>,
) -> HttpResponse {
    let transport = transport.get_ref().clone();
    let middleware = transport.middleware_snapshot();
    run_chain(&middleware, req, body, move |req, body| {
        let transport = transport.clone();
        Box::pin(async move { transport.handle_message_post(req, body).await })
    })
    .await
}

async fn health_route(req: HttpRequest, transport: web::Data<ServerSseTransport>) -> HttpResponse {
    let transport = transport.get_ref().clone();
    let middleware = transport.middleware_snapshot();
    run_chain(&middleware, req, web::Bytes::new(), move |_req, _body| {
        Box::pin(async move { HttpResponse::Ok().body("OK") })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_32_hex_chars() {
        let id = Uuid::new_v4().simple().to_string();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn targeted_send_to_unknown_session_fails() {
        let transport = ServerSseTransport::new("127.0.0.1", 0, "/mcp/sse");
        let message = JsonRpcMessage::Notification(crate::transport::JsonRpcNotification::new(
            "notifications/tools/list_changed",
            None,
        ));
        let err = transport
            .send(&MessageContext::for_session("deadbeef"), &message)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn broadcast_without_sessions_is_a_no_op() {
        let transport = ServerSseTransport::new("127.0.0.1", 0, "/mcp/sse");
        let message = JsonRpcMessage::Notification(crate::transport::JsonRpcNotification::new(
            "notifications/tools/list_changed",
            None,
        ));
        transport
            .send(&MessageContext::default(), &message)
            .await
            .unwrap();
    }

    #[test]
    fn endpoint_is_normalized() {
        let transport = ServerSseTransport::new("127.0.0.1", 0, "/mcp/sse/");
        assert_eq!(transport.inner.endpoint, "/mcp/sse");
    }
}
