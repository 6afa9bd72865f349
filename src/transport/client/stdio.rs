//! Pipe transport, client side: spawns the server as a subprocess and frames
//! envelopes over its standard streams.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::transport::{
    CloseHandler, ErrorHandler, Handlers, JsonRpcMessage, MessageContext, MessageHandler,
    Transport, CHANNEL_CAPACITY,
};

/// How long close waits for the child to exit before killing it.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Client transport that launches an MCP server executable and speaks
/// newline-delimited JSON over its stdin/stdout.
///
/// The child's stderr is consumed line by line; each line is surfaced
/// through the error handler for diagnostic logging. Close sends EOF on the
/// child's stdin and waits for it to exit.
#[derive(Clone)]
pub struct ClientStdioTransport {
    inner: Arc<StdioClientInner>,
}

struct StdioClientInner {
    program: String,
    args: Vec<String>,
    handlers: Handlers,
    outbound: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl ClientStdioTransport {
    /// Creates a transport that will spawn the server executable.
    ///
    /// # Arguments
    ///
    /// * `program` - The path or name of the program to execute
    /// * `args` - Command-line arguments to pass to the program
    ///
    /// # Returns
    ///
    /// A new `ClientStdioTransport` instance
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            inner: Arc::new(StdioClientInner {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                handlers: Handlers::default(),
                outbound: Mutex::new(None),
                child: tokio::sync::Mutex::new(None),
                shutdown: watch::channel(false).0,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl Transport for ClientStdioTransport {
    /// Spawns the server process and starts the communication tasks.
    ///
    /// This method:
    /// 1. Spawns the child with piped stdin, stdout, and stderr
    /// 2. Starts a writer task owning the child's stdin
    /// 3. Starts a reader task over the child's stdout (EOF closes the
    ///    transport)
    /// 4. Starts a task forwarding stderr lines to the error handler
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

        tracing::debug!("spawning {} {:?}", self.inner.program, self.inner.args);
        let mut child = Command::new(&self.inner.program)
            .args(&self.inner.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("child process stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("child process stdout not available".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Transport("child process stderr not available".into()))?;
        *self.inner.child.lock().await = Some(child);

        let (tx, mut rx) = mpsc::channel::<JsonRpcMessage>(CHANNEL_CAPACITY);
        *self.inner.outbound.lock().expect("outbound lock poisoned") = Some(tx);

        // Writer: owns the child's stdin; dropping it on exit is the EOF
        // signal the server shuts down on.
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut stdin = stdin;
            loop {
                tokio::select! {
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        match serde_json::to_string(&message) {
                            Ok(mut line) => {
                                tracing::debug!("stdio send: {line}");
                                line.push('\n');
                                if stdin.write_all(line.as_bytes()).await.is_err() {
                                    break;
                                }
                                if stdin.flush().await.is_err() {
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

        // Reader: the child's stdout until EOF.
        let transport = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
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

        // Stderr: each line becomes an error-handler invocation.
        let handlers = self.inner.handlers.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            handlers.dispatch_error(Error::Transport(format!("server stderr: {line}")));
                        }
                        Ok(None) | Err(_) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        Ok(())
    }

    /// Enqueues one envelope for the child's stdin.
    ///
    /// # Arguments
    ///
    /// * `message` - The envelope to write
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

    /// Sends EOF on the child's stdin and waits for it to exit. Idempotent.
    ///
    /// A child that does not exit within the grace period is killed.
    ///
    /// # Returns
    ///
    /// A `Result` indicating success
    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the writer queue drops the child's stdin, delivering EOF.
        *self.inner.outbound.lock().expect("outbound lock poisoned") = None;
        let _ = self.inner.shutdown.send(true);

        let child = self.inner.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!("server process exited with {status}"),
                Ok(Err(e)) => tracing::warn!("failed to wait for server process: {e}"),
                Err(_) => {
                    tracing::warn!("server process did not exit in time; killing");
                    let _ = child.kill().await;
                }
            }
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
