//! Transport layer.
//!
//! A [`Transport`] is a bidirectional channel for JSON-RPC envelopes. It is
//! neutral about whether a given envelope is a request, response, or
//! notification; classification happens in the protocol layer. Incoming
//! envelopes are delivered through the installed message handler, outgoing
//! envelopes are supplied via [`Transport::send`].
//!
//! Three implementations are provided on each side:
//! - stdio (newline-delimited JSON over standard streams / a subprocess)
//! - SSE (a persistent server-push event stream plus a POST ingress)
//! - streamable HTTP (one request/response envelope pair per HTTP exchange)

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

mod client;
pub use client::*;

mod server;
pub use server::*;

pub mod mock;

/// Queue depth of every bounded inter-task channel in the transports.
pub(crate) const CHANNEL_CAPACITY: usize = 10;

/// A message in the MCP protocol. Currently always a JSON-RPC envelope.
pub type Message = JsonRpcMessage;

/// Context travelling with an inbound envelope.
///
/// The push-stream transport stamps the originating session id here so that
/// the eventual response can be routed back to the same session; the other
/// transports leave it empty. A `send` with an empty context on the
/// push-stream transport broadcasts to every open session.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    session_id: Option<String>,
}

impl MessageContext {
    /// Creates a context bound to a specific push-stream session.
    ///
    /// # Arguments
    ///
    /// * `session_id` - The session the message belongs to
    ///
    /// # Returns
    ///
    /// A new `MessageContext` carrying the session id
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
        }
    }

    /// Gets the session id carried by this context.
    ///
    /// # Returns
    ///
    /// An `Option` containing the session id if one is attached
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

/// Callback invoked for every inbound envelope, from the transport's
/// delivery task.
pub type MessageHandler = Arc<
    dyn Fn(MessageContext, JsonRpcMessage) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// Callback invoked when the transport hits a non-fatal error (for example a
/// malformed frame, or a stderr line from a spawned server process).
pub type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Callback invoked once when the transport shuts down.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Core trait implemented by every MCP transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Begins background I/O.
    ///
    /// Idempotent after the first success; fails once the transport has
    /// been closed.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn start(&self) -> Result<()>;

    /// Enqueues one outgoing envelope.
    ///
    /// May wait on backpressure, and fails with a transport-closed condition
    /// after [`Transport::close`].
    ///
    /// # Arguments
    ///
    /// * `ctx` - The context the envelope travels with; session-scoped
    ///   transports use it to pick the destination
    /// * `message` - The envelope to send
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn send(&self, ctx: &MessageContext, message: &JsonRpcMessage) -> Result<()>;

    /// Terminates background I/O, releases resources, and invokes the close
    /// handler. Idempotent.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn close(&self) -> Result<()>;

    /// Installs the inbound-message callback.
    ///
    /// # Arguments
    ///
    /// * `handler` - Invoked from the transport's delivery task for every
    ///   inbound envelope
    fn set_message_handler(&self, handler: MessageHandler);

    /// Installs the error callback.
    ///
    /// # Arguments
    ///
    /// * `handler` - Invoked for non-fatal transport errors
    fn set_error_handler(&self, handler: ErrorHandler);

    /// Installs the close callback.
    ///
    /// # Arguments
    ///
    /// * `handler` - Invoked once when the transport shuts down
    fn set_close_handler(&self, handler: CloseHandler);
}

/// The handler slots shared by every transport implementation.
///
/// Handlers may be (re)installed concurrently with message delivery; each
/// dispatch snapshots the current handler before invoking it.
#[derive(Clone, Default)]
pub(crate) struct Handlers {
    message: Arc<RwLock<Option<MessageHandler>>>,
    error: Arc<RwLock<Option<ErrorHandler>>>,
    close: Arc<RwLock<Option<CloseHandler>>>,
}

impl Handlers {
    pub(crate) fn set_message(&self, handler: MessageHandler) {
        *self.message.write().expect("handler lock poisoned") = Some(handler);
    }

    pub(crate) fn set_error(&self, handler: ErrorHandler) {
        *self.error.write().expect("handler lock poisoned") = Some(handler);
    }

    pub(crate) fn set_close(&self, handler: CloseHandler) {
        *self.close.write().expect("handler lock poisoned") = Some(handler);
    }

    pub(crate) fn has_message_handler(&self) -> bool {
        self.message.read().expect("handler lock poisoned").is_some()
    }

    pub(crate) async fn dispatch_message(&self, ctx: MessageContext, message: JsonRpcMessage) {
        let handler = self
            .message
            .read()
            .expect("handler lock poisoned")
            .clone();
        match handler {
            Some(handler) => handler(ctx, message).await,
            None => tracing::debug!("inbound message dropped: no message handler installed"),
        }
    }

    pub(crate) fn dispatch_error(&self, error: Error) {
        let handler = self.error.read().expect("handler lock poisoned").clone();
        match handler {
            Some(handler) => handler(error),
            None => tracing::debug!("transport error with no error handler: {error}"),
        }
    }

    pub(crate) fn dispatch_close(&self) {
        let handler = self.close.read().expect("handler lock poisoned").clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// A JSON-RPC request or response identifier.
///
/// Integer and string ids are distinct on the wire and must round-trip
/// without changing kind. `null` is not a valid id and is rejected at decode
/// time; an absent id denotes a notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

/// The JSON-RPC protocol version marker, always `"2.0"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct JsonRpcVersion(String);

impl Default for JsonRpcVersion {
    fn default() -> Self {
        JsonRpcVersion("2.0".to_owned())
    }
}

impl JsonRpcVersion {
    /// Returns the version as a string slice.
    ///
    /// # Returns
    ///
    /// A string slice containing the version
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A JSON-RPC envelope: a response, a request, or a notification.
///
/// Decoding follows the classification rule of the protocol: `result` or
/// `error` present means response, `method` with an id means request,
/// `method` without an id means notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Response(JsonRpcResponse),
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Gets the envelope id.
    ///
    /// # Returns
    ///
    /// An `Option` containing the id; `None` for notifications
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Response(r) => Some(&r.id),
            JsonRpcMessage::Request(r) => Some(&r.id),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    /// Gets the method name.
    ///
    /// # Returns
    ///
    /// An `Option` containing the method; `None` for responses
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Response(_) => None,
            JsonRpcMessage::Request(r) => Some(&r.method),
            JsonRpcMessage::Notification(n) => Some(&n.method),
        }
    }
}

/// A request: expects a response carrying the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Creates a new request envelope.
    ///
    /// # Arguments
    ///
    /// * `id` - The request id, matched against the response
    /// * `method` - The method name to call
    /// * `params` - Optional parameters for the method
    ///
    /// # Returns
    ///
    /// A new `JsonRpcRequest` instance
    pub fn new(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: JsonRpcVersion::default(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A notification: fire-and-forget, no id, no response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JsonRpcNotification {
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    /// Creates a new notification envelope.
    ///
    /// # Arguments
    ///
    /// * `method` - The method name for the notification
    /// * `params` - Optional parameters for the notification
    ///
    /// # Returns
    ///
    /// A new `JsonRpcNotification` instance
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion::default(),
            method: method.into(),
            params,
        }
    }
}

/// A response: sent in reply to the request with the same id. Exactly one of
/// `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Creates a successful response envelope.
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the request being answered
    /// * `result` - The result value
    ///
    /// # Returns
    ///
    /// A new `JsonRpcResponse` instance
    pub fn success(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion::default(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates a failed response envelope.
    ///
    /// # Arguments
    ///
    /// * `id` - The id of the request being answered
    /// * `error` - The error information
    ///
    /// # Returns
    ///
    /// A new `JsonRpcResponse` instance
    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JsonRpcVersion::default(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// The error member of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    /// Creates a new error object.
    ///
    /// # Arguments
    ///
    /// * `code` - The error code
    /// * `message` - The error message
    ///
    /// # Returns
    ///
    /// A new `JsonRpcError` instance
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}
