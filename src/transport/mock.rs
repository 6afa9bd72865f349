//! In-memory transport for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::transport::{
    CloseHandler, ErrorHandler, Handlers, JsonRpcMessage, MessageContext, MessageHandler,
    Transport,
};

/// A [`Transport`] that records outgoing envelopes and lets tests inject
/// inbound ones.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    handlers: Handlers,
    sent: Mutex<Vec<JsonRpcMessage>>,
    send_error: Mutex<Option<String>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl MockTransport {
    /// Creates a new mock transport.
    ///
    /// # Returns
    ///
    /// A new `MockTransport` instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates receiving a message from the peer.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The context to deliver the message with
    /// * `message` - The envelope to deliver
    pub async fn receive(&self, ctx: MessageContext, message: JsonRpcMessage) {
        self.inner.handlers.dispatch_message(ctx, message).await;
    }

    /// Gets everything sent through this transport so far.
    ///
    /// # Returns
    ///
    /// A copy of the recorded envelopes, in send order
    pub fn sent_messages(&self) -> Vec<JsonRpcMessage> {
        self.inner.sent.lock().expect("mock lock poisoned").clone()
    }

    /// Clears the recorded messages.
    pub fn clear_sent(&self) {
        self.inner.sent.lock().expect("mock lock poisoned").clear();
    }

    /// Makes subsequent sends fail.
    ///
    /// # Arguments
    ///
    /// * `message` - The error message returned by failing sends
    pub fn fail_sends(&self, message: impl Into<String>) {
        *self.inner.send_error.lock().expect("mock lock poisoned") = Some(message.into());
    }

    /// Checks whether the transport was started.
    ///
    /// # Returns
    ///
    /// `true` if [`Transport::start`] succeeded, `false` otherwise
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Checks whether the transport was closed.
    ///
    /// # Returns
    ///
    /// `true` if [`Transport::close`] ran, `false` otherwise
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    /// Simulates starting the transport.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        self.inner.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Records the envelope, or fails if a send error is configured.
    ///
    /// # Arguments
    ///
    /// * `message` - The envelope to record
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn send(&self, _ctx: &MessageContext, message: &JsonRpcMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        if let Some(message) = self
            .inner
            .send_error
            .lock()
            .expect("mock lock poisoned")
            .clone()
        {
            return Err(Error::Transport(message));
        }
        self.inner
            .sent
            .lock()
            .expect("mock lock poisoned")
            .push(message.clone());
        Ok(())
    }

    /// Simulates closing the transport. Idempotent.
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
    use crate::transport::JsonRpcNotification;

    #[tokio::test]
    async fn records_sent_messages() {
        let mock = MockTransport::new();
        mock.start().await.unwrap();

        let message =
            JsonRpcMessage::Notification(JsonRpcNotification::new("test/notify", None));
        mock.send(&MessageContext::default(), &message).await.unwrap();

        assert_eq!(mock.sent_messages(), vec![message]);
        mock.clear_sent();
        assert!(mock.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn send_fails_after_close() {
        let mock = MockTransport::new();
        mock.start().await.unwrap();
        mock.close().await.unwrap();

        let message =
            JsonRpcMessage::Notification(JsonRpcNotification::new("test/notify", None));
        let err = mock
            .send(&MessageContext::default(), &message)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn simulated_send_failure() {
        let mock = MockTransport::new();
        mock.start().await.unwrap();
        mock.fail_sends("wire cut");

        let message =
            JsonRpcMessage::Notification(JsonRpcNotification::new("test/notify", None));
        let err = mock
            .send(&MessageContext::default(), &message)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("wire cut"));
    }

    #[tokio::test]
    async fn close_invokes_close_handler_once() {
        let mock = MockTransport::new();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counted = count.clone();
        mock.set_close_handler(Arc::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        mock.close().await.unwrap();
        mock.close().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
