//! Pipe transport, server side: one JSON envelope per line of stdin/stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::transport::{
    CloseHandler, ErrorHandler, Handlers, JsonRpcMessage, MessageContext, MessageHandler,
    Transport, CHANNEL_CAPACITY,
};

/// Server transport over standard input/output.
///
/// A reader task consumes stdin line by line and delivers each decoded
/// envelope to the message handler; a writer task drains a bounded queue to
/// stdout, flushing after every line so the peer is never left blocked.
/// End-of-file on stdin closes the transport.
#[derive(Clone, Default)]
pub struct ServerStdioTransport {
    inner: Arc<StdioServerInner>,
}

struct StdioServerInner {
    handlers: Handlers,
    outbound: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Default for StdioServerInner {
    fn default() -> Self {
        Self {
            handlers: Handlers::default(),
            outbound: Mutex::new(None),
            shutdown: watch::channel(false).0,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

impl ServerStdioTransport {
    /// Creates a new `ServerStdioTransport` instance.
    ///
    /// # Returns
    ///
    /// A new `ServerStdioTransport` instance
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for ServerStdioTransport {
    /// Starts the background reader and writer tasks.
    ///
    /// The reader consumes stdin line by line until EOF; the writer drains
    /// the outbound queue to stdout, flushing after each line.
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

        let (tx, mut rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);
        *self.inner.outbound.lock().expect("outbound lock poisoned") = Some(tx);

        // Writer: serialized sends, flushed per line.
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            loop {
                tokio::select! {
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        match serde_json::to_string(&message) {
                            Ok(mut line) => {
                                tracing::debug!("stdio send: {line}");
                                line.push('\n');
                                if stdout.write_all(line.as_bytes()).await.is_err() {
                                    break;
                                }
                                if stdout.flush().await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::error!("failed to encode outgoing message: {e}"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        // Reader: stdin until EOF.
        let transport = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            tracing::debug!("stdio recv: {line}");
                            match serde_json::from_str::<JsonRpcMessage>(&line) {
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
                        Ok(None) => {
                            // EOF on stdin shuts the transport down.
                            let _ = transport.close().await;
                            break;
                        }
                        Err(e) => {
                            transport.inner.handlers.dispatch_error(Error::Io(e));
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        Ok(())
    }

    /// Enqueues one envelope for the writer task.
    ///
    /// # Arguments
    ///
    /// * `message` - The envelope to write to stdout
    ///
    /// # Returns
    ///
    /// A `Result` indicating success or failure
    async fn send(&self, _ctx: &MessageContext, message: &JsonRpcMessage) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed);
        }
        let tx = self
            .inner
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .clone()
            .ok_or_else(|| Error::Transport("transport not started".into()))?;
        tx.send(message.clone())
            .await
            .map_err(|_| Error::TransportClosed)
    }

    /// Stops the background tasks and invokes the close handler. Idempotent.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success
    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.inner.shutdown.send(true);
        *self.inner.outbound.lock().expect("outbound lock poisoned") = None;
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
