//! JSON-RPC correlation engine.
//!
//! [`Protocol`] turns a bidirectional envelope stream into request/reply
//! semantics: it allocates ids, keeps the pending-request table, classifies
//! inbound envelopes, and routes requests and notifications to typed
//! handlers. It is transport-agnostic and works with any [`Transport`]
//! implementation.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::transport::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    MessageContext, RequestId, Transport,
};
use crate::types::ErrorCode;

/// The default deadline for outbound requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for customizing a single outbound request.
pub struct RequestOptions {
    /// How long to wait for the correlated response.
    pub timeout: Duration,
}

impl RequestOptions {
    /// Sets the timeout for the request.
    ///
    /// # Arguments
    ///
    /// * `timeout` - The timeout duration
    ///
    /// # Returns
    ///
    /// The modified options instance
    pub fn timeout(self, timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

type PendingRequests = Arc<Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>>;

/// The correlation engine.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct Protocol {
    transport: Arc<OnceLock<Arc<dyn Transport>>>,
    request_id: Arc<AtomicU64>,
    pending_requests: PendingRequests,
    request_handlers: Arc<HashMap<String, Box<dyn RequestHandler>>>,
    notification_handlers: Arc<HashMap<String, Box<dyn NotificationHandler>>>,
    closed: Arc<AtomicBool>,
}

impl Protocol {
    /// Creates a new protocol builder.
    ///
    /// # Returns
    ///
    /// A `ProtocolBuilder` for configuring the protocol
    pub fn builder() -> ProtocolBuilder {
        ProtocolBuilder::new()
    }

    /// Attaches the protocol to a transport and starts it.
    ///
    /// Installs the inbound-message routing and a close hook that drains the
    /// pending-request table, then begins the transport's background I/O.
    ///
    /// # Arguments
    ///
    /// * `transport` - The transport to communicate over
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    pub async fn connect(&self, transport: Arc<dyn Transport>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        if self.transport.set(transport.clone()).is_err() {
            return Err(Error::Transport(
                "protocol is already connected to a transport".into(),
            ));
        }

        let protocol = self.clone();
        transport.set_message_handler(Arc::new(move |ctx, message| {
            let protocol = protocol.clone();
            Box::pin(async move { protocol.handle_message(ctx, message).await })
        }));

        let protocol = self.clone();
        transport.set_close_handler(Arc::new(move || protocol.drain_pending()));

        transport.start().await
    }

    /// Sends a request and waits for the correlated response.
    ///
    /// # Arguments
    ///
    /// * `method` - The method name for the request
    /// * `params` - Optional parameters for the request
    /// * `options` - Request options (like timeout)
    ///
    /// # Returns
    ///
    /// A `Result` containing the response `result`. Failure is an
    /// [`Error::Rpc`] carrying the peer's error, [`Error::Timeout`] past the
    /// deadline, or [`Error::TransportClosed`] if the transport shuts down
    /// underneath the request.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<serde_json::Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        let transport = self.transport.get().cloned().ok_or(Error::NotConnected)?;

        let id = RequestId::Number(self.request_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (tx, rx) = oneshot::channel();
        self.pending_requests
            .lock()
            .expect("pending-request lock poisoned")
            .insert(id.clone(), tx);

        // Removes the slot if the caller times out or drops this future;
        // completion removes it first and the guard becomes a no-op.
        let _guard = PendingGuard {
            pending: self.pending_requests.clone(),
            id: id.clone(),
        };

        let message = JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params));
        transport.send(&MessageContext::default(), &message).await?;

        match timeout(options.timeout, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(error) => Err(Error::Rpc {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                }),
                None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
            },
            // The sender was dropped: the table was drained on close.
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => Err(Error::Timeout(options.timeout)),
        }
    }

    /// Sends a notification. No id, no reply.
    ///
    /// # Arguments
    ///
    /// * `method` - The method name for the notification
    /// * `params` - Optional parameters for the notification
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure; never fails locally except
    /// on transport error
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        let transport = self.transport.get().cloned().ok_or(Error::NotConnected)?;
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        transport.send(&MessageContext::default(), &message).await
    }

    /// Shuts the protocol down.
    ///
    /// Drains every outstanding request with a transport-closed error, stops
    /// accepting new sends, and closes the transport. Idempotent.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.drain_pending();
        if let Some(transport) = self.transport.get() {
            transport.close().await?;
        }
        Ok(())
    }

    async fn handle_message(&self, ctx: MessageContext, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(response) => self.handle_response(response),
            JsonRpcMessage::Request(request) => self.handle_request(ctx, request).await,
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(notification).await
            }
        }
    }

    async fn handle_request(&self, ctx: MessageContext, request: JsonRpcRequest) {
        let response = match self.request_handlers.get(&request.method) {
            Some(handler) => handler.handle(request).await,
            None => JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(
                    ErrorCode::MethodNotFound as i32,
                    format!("Method not found: {}", request.method),
                ),
            ),
        };

        // The response goes back through the context that carried the
        // request in, so session-scoped transports route it correctly.
        if let Some(transport) = self.transport.get() {
            if let Err(e) = transport
                .send(&ctx, &JsonRpcMessage::Response(response))
                .await
            {
                tracing::error!("failed to send response: {e}");
            }
        }
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let sender = self
            .pending_requests
            .lock()
            .expect("pending-request lock poisoned")
            .remove(&response.id);

        match sender {
            Some(tx) => {
                let id = response.id.clone();
                if tx.send(response).is_err() {
                    tracing::warn!("dropping response for cancelled request {id}");
                }
            }
            None => tracing::warn!("dropping response for unknown request id {}", response.id),
        }
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        let method = notification.method.clone();
        match self.notification_handlers.get(&method) {
            Some(handler) => {
                if let Err(e) = handler.handle(notification).await {
                    tracing::error!("error handling notification {method}: {e}");
                }
            }
            None => tracing::debug!("no handler for notification: {method}"),
        }
    }

    fn drain_pending(&self) {
        // Dropping the senders completes every waiting request with a
        // transport-closed error.
        self.pending_requests
            .lock()
            .expect("pending-request lock poisoned")
            .clear();
    }
}

struct PendingGuard {
    pending: PendingRequests,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

/// Builder for configuring a [`Protocol`] with request and notification
/// handlers.
#[derive(Default)]
pub struct ProtocolBuilder {
    request_handlers: HashMap<String, Box<dyn RequestHandler>>,
    notification_handlers: HashMap<String, Box<dyn NotificationHandler>>,
}

impl ProtocolBuilder {
    /// Creates a new protocol builder.
    ///
    /// # Returns
    ///
    /// A new `ProtocolBuilder` instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed request handler.
    ///
    /// Params are deserialized into `Req` before invocation; a parse failure
    /// answers the peer with `-32602`, a handler failure with `-32603`.
    ///
    /// # Arguments
    ///
    /// * `method` - The method name to handle
    /// * `handler` - The handler function
    ///
    /// # Returns
    ///
    /// The modified builder instance
    pub fn request_handler<Req, Resp>(
        mut self,
        method: &str,
        handler: impl Fn(Req) -> Pin<Box<dyn Future<Output = anyhow::Result<Resp>> + Send>>
            + Send
            + Sync
            + 'static,
    ) -> Self
    where
        Req: DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + Send + Sync + 'static,
    {
        let handler = TypedRequestHandler {
            handler: Box::new(handler),
            _phantom: PhantomData,
        };
        self.request_handlers
            .insert(method.to_string(), Box::new(handler));
        self
    }

    /// Checks if a request handler exists for a method.
    ///
    /// # Arguments
    ///
    /// * `method` - The method name to check
    ///
    /// # Returns
    ///
    /// `true` if a handler exists, `false` otherwise
    pub fn has_request_handler(&self, method: &str) -> bool {
        self.request_handlers.contains_key(method)
    }

    /// Registers a typed notification handler.
    ///
    /// # Arguments
    ///
    /// * `method` - The method name to handle
    /// * `handler` - The handler function
    ///
    /// # Returns
    ///
    /// The modified builder instance
    pub fn notification_handler<N>(
        mut self,
        method: &str,
        handler: impl Fn(N) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
            + Send
            + Sync
            + 'static,
    ) -> Self
    where
        N: DeserializeOwned + Send + Sync + 'static,
    {
        let handler = TypedNotificationHandler {
            handler: Box::new(handler),
            _phantom: PhantomData,
        };
        self.notification_handlers
            .insert(method.to_string(), Box::new(handler));
        self
    }

    /// Checks if a notification handler exists for a method.
    ///
    /// # Arguments
    ///
    /// * `method` - The method name to check
    ///
    /// # Returns
    ///
    /// `true` if a handler exists, `false` otherwise
    pub fn has_notification_handler(&self, method: &str) -> bool {
        self.notification_handlers.contains_key(method)
    }

    /// Builds the protocol with the configured handlers.
    ///
    /// # Returns
    ///
    /// A new `Protocol` instance
    pub fn build(self) -> Protocol {
        Protocol {
            transport: Arc::new(OnceLock::new()),
            request_id: Arc::new(AtomicU64::new(0)),
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            request_handlers: Arc::new(self.request_handlers),
            notification_handlers: Arc::new(self.notification_handlers),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
trait RequestHandler: Send + Sync {
    async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse;
}

#[async_trait]
trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: JsonRpcNotification) -> anyhow::Result<()>;
}

struct TypedRequestHandler<Req, Resp>
where
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
{
    #[allow(clippy::type_complexity)]
    handler: Box<
        dyn Fn(Req) -> Pin<Box<dyn Future<Output = anyhow::Result<Resp>> + Send>> + Send + Sync,
    >,
    _phantom: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<Req, Resp> RequestHandler for TypedRequestHandler<Req, Resp>
where
    Req: DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + Send + Sync + 'static,
{
    async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let params_value = match request.params {
            Some(value) if !value.is_null() => value,
            _ => json!({}),
        };

        let params: Req = match serde_json::from_value(params_value) {
            Ok(params) => params,
            Err(e) => {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(
                        ErrorCode::InvalidParams as i32,
                        format!("Invalid params: {e}"),
                    ),
                )
            }
        };

        match (self.handler)(params).await {
            Ok(result) => match serde_json::to_value(result) {
                Ok(value) => JsonRpcResponse::success(request.id, value),
                Err(e) => JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::new(
                        ErrorCode::InternalError as i32,
                        format!("Failed to serialize result: {e}"),
                    ),
                ),
            },
            Err(e) => JsonRpcResponse::error(
                request.id,
                JsonRpcError::new(ErrorCode::InternalError as i32, e.to_string()),
            ),
        }
    }
}

struct TypedNotificationHandler<N>
where
    N: DeserializeOwned + Send + Sync + 'static,
{
    #[allow(clippy::type_complexity)]
    handler:
        Box<dyn Fn(N) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>,
    _phantom: PhantomData<fn(N)>,
}

#[async_trait]
impl<N> NotificationHandler for TypedNotificationHandler<N>
where
    N: DeserializeOwned + Send + Sync + 'static,
{
    async fn handle(&self, notification: JsonRpcNotification) -> anyhow::Result<()> {
        let params: N = match notification.params {
            Some(value) => serde_json::from_value(value)?,
            None => serde_json::from_value(serde_json::Value::Null)?,
        };
        (self.handler)(params).await
    }
}
