//! LSP client facade
//!
//! Combines the transport, framing, registry and dispatch layers into one
//! session: spawn the server, run the listen loop, perform the initialize
//! handshake, send requests/notifications, and tear everything down.
//!
//! Each [`Client`] owns one session's worth of state, so an editor can
//! drive several language servers at once (one client per language)
//! without cross-talk.

pub mod backoff;
pub mod dispatch;
pub mod registry;


use crate::client::backoff::RestartGate;
use crate::client::dispatch::{Dispatched, Dispatcher, HandlerResult};
use crate::client::registry::RequestRegistry;
use crate::io::process::{ProcessTransport, SpawnError, SpawnOptions};
use crate::io::{ChunkReceiver, Transport};
use crate::rpc::framing::StreamBuffer;
use crate::rpc::{framing, ErrorObject, Message, MessageError};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Method name of the initialize request
pub const METHOD_INITIALIZE: &str = "initialize";

/// Method name of the initialized notification
pub const METHOD_INITIALIZED: &str = "initialized";

/// Method name of the exit notification
pub const METHOD_EXIT: &str = "exit";

// ============================================================================
// Session State
// ============================================================================

/// Connection state machine.
///
/// `Offline -> Starting -> AwaitingInitializeResult -> Initialized`;
/// termination resets to `Offline` from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    Starting,
    AwaitingInitializeResult,
    Initialized,
}

// ============================================================================
// Client Errors
// ============================================================================

/// Errors surfaced to the embedding layer
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// No live server process; the caller is expected to restart the
    /// server and re-issue the failed operation
    #[error("server is offline")]
    ServerOffline,

    /// A document/request operation was attempted before the initialize
    /// handshake completed
    #[error("session not initialized")]
    NotInitialized,

    /// `initialize` was called while a handshake is in flight or done
    #[error("session already initialized")]
    AlreadyInitialized,

    /// The restart gate is still closed after recent failures
    #[error("server restart throttled; retry in {0:?}")]
    RestartThrottled(Duration),

    #[error(transparent)]
    Message(#[from] MessageError),
}

// ============================================================================
// Server Configuration
// ============================================================================

/// How to launch the language server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Executable followed by its arguments, e.g. `["gopls", "serve"]`
    pub command: Vec<String>,

    /// Environment and working-directory overrides
    pub options: SpawnOptions,
}

impl ServerConfig {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            options: SpawnOptions::default(),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// LSP client driving one external language server.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ServerConfig,

    /// Session state; read by callers, written by the listen loop and the
    /// lifecycle methods
    state: Mutex<SessionState>,

    /// In-flight outbound requests
    registry: Arc<RequestRegistry>,

    /// Inbound routing table
    dispatcher: Dispatcher,

    /// Active transport; the lock also serializes spawn attempts so two
    /// callers can never race a double spawn
    transport: tokio::sync::Mutex<Option<Box<dyn Transport>>>,

    /// Monotonic request id counter, session-local, never reused
    next_id: AtomicI64,

    /// Restart throttle
    restart: Mutex<RestartGate>,

    /// Listen loop handle
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RequestRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: Mutex::new(SessionState::Offline),
                registry,
                dispatcher,
                transport: tokio::sync::Mutex::new(None),
                next_id: AtomicI64::new(0),
                restart: Mutex::new(RestartGate::new()),
                listen_task: Mutex::new(None),
            }),
        }
    }

    /// Associate an inbound method name with a callback.
    ///
    /// The callback receives the full message (response handlers branch on
    /// `result()` vs `error()`); a returned value is used only when the
    /// inbound message was a server request expecting an answer. Callbacks
    /// run on the listener task and must not block at length.
    pub fn register_handler<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.dispatcher.register(method, handler);
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// True when the process is running and the handshake has completed
    pub async fn is_ready(&self) -> bool {
        if self.inner.state() != SessionState::Initialized {
            return false;
        }
        self.inner
            .transport
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| t.is_running())
    }

    /// Spawn the configured server and start the listen loop.
    ///
    /// A no-op when the server is already running. Fails fast with
    /// [`ClientError::RestartThrottled`] while the restart gate is closed
    /// after recent session failures.
    pub async fn run_server(&self) -> Result<(), ClientError> {
        let mut slot = self.inner.transport.lock().await;
        if slot.as_ref().is_some_and(|t| t.is_running()) {
            debug!("server already running");
            return Ok(());
        }

        if let Some(remaining) = self.inner.restart.lock().unwrap().holdoff() {
            return Err(ClientError::RestartThrottled(remaining));
        }

        self.inner.set_state(SessionState::Starting);

        let mut transport = ProcessTransport::new(
            self.inner.config.command.clone(),
            self.inner.config.options.clone(),
        );
        if let Err(err) = transport.spawn() {
            self.inner.set_state(SessionState::Offline);
            self.inner.restart.lock().unwrap().record_failure();
            return Err(err.into());
        }

        self.attach(&mut slot, Box::new(transport));
        Ok(())
    }

    /// Start a session over a pre-built transport.
    ///
    /// This is the seam [`run_server`](Self::run_server) goes through
    /// after spawning; tests drive it directly with a
    /// [`MockTransport`](crate::testing::MockTransport).
    pub async fn run_with_transport(
        &self,
        transport: Box<dyn Transport>,
    ) -> Result<(), ClientError> {
        let mut slot = self.inner.transport.lock().await;
        if slot.as_ref().is_some_and(|t| t.is_running()) {
            return Ok(());
        }
        self.inner.set_state(SessionState::Starting);
        self.attach(&mut slot, transport);
        Ok(())
    }

    fn attach(&self, slot: &mut Option<Box<dyn Transport>>, mut transport: Box<dyn Transport>) {
        let reader = transport.take_reader();
        *slot = Some(transport);

        // fresh server generation: stale ids must never match its responses
        self.inner.registry.clear();

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            match reader {
                Some(reader) => inner.listen(reader).await,
                None => {
                    error!("transport has no reader stream");
                    inner.go_offline("transport unusable").await;
                }
            }
        });

        if let Some(stale) = self.inner.listen_task.lock().unwrap().replace(task) {
            stale.abort();
        }
    }

    /// Send the initialize request.
    ///
    /// Completion is signaled through the handler registered for
    /// `initialize`; once the response arrives the client sends the
    /// `initialized` notification itself and the session becomes ready.
    pub async fn initialize(
        &self,
        root_path: &Path,
        capabilities: Value,
    ) -> Result<i64, ClientError> {
        {
            // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                SessionState::Starting => *state = SessionState::AwaitingInitializeResult,
                SessionState::Offline => return Err(ClientError::ServerOffline),
                _ => return Err(ClientError::AlreadyInitialized),
            }
        }

        let root = root_path.display().to_string();
        let params = json!({
            "processId": std::process::id(),
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "rootPath": root.as_str(),
            "rootUri": path_to_uri(root_path),
            "capabilities": capabilities,
        });

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.registry.add(id, METHOD_INITIALIZE);
        info!(id, root = %root, "sending initialize request");

        if let Err(err) = self
            .write_checked(&Message::request(id, METHOD_INITIALIZE, params))
            .await
        {
            self.inner.registry.remove(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Send a request, superseding any in-flight request of the same
    /// method.
    ///
    /// Only the latest request per method is meaningful: a cancellation
    /// notification is emitted for every superseded id before the new
    /// request is written, over the same serialized write path, so the
    /// server sees them in order. Returns the assigned request id; the
    /// result is delivered later to the handler registered for `method`.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<i64, ClientError> {
        self.ensure_session(method)?;

        for superseded in self.inner.registry.supersede(method) {
            debug!(id = superseded, method, "canceling superseded request");
            self.write_checked(&Message::cancel_request(superseded))
                .await?;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.registry.add(id, method);
        trace!(id, method, "sending request");

        if let Err(err) = self
            .write_checked(&Message::request(id, method, params))
            .await
        {
            self.inner.registry.remove(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Send a notification; no id, no registry interaction
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<(), ClientError> {
        // `initialized` and `exit` are the only notifications legal
        // before the handshake completes
        if method != METHOD_INITIALIZED && method != METHOD_EXIT {
            self.ensure_session(method)?;
        }
        trace!(method, "sending notification");
        self.write_checked(&Message::notification(method, params))
            .await
    }

    /// Answer a server-to-client request
    pub async fn send_response(
        &self,
        id: i64,
        result: Option<Value>,
        error: Option<ErrorObject>,
    ) -> Result<(), ClientError> {
        let message = Message::response(id, result, error)?;
        self.write_checked(&message).await
    }

    /// Cancel an in-flight request.
    ///
    /// Safe to call for an id that was already resolved or canceled; that
    /// case is a no-op. Cancellation is advisory - the server may still
    /// answer, and the late response is then dropped by the registry.
    pub async fn cancel_request(&self, id: i64) -> Result<(), ClientError> {
        if !self.inner.registry.remove(id) {
            trace!(id, "cancel for untracked request ignored");
            return Ok(());
        }
        debug!(id, "canceling request");
        self.write_checked(&Message::cancel_request(id)).await
    }

    /// Stop the listen loop, kill the server process and reset the
    /// session. Idempotent and safe to call from any task.
    pub async fn terminate_server(&self) {
        info!("terminating server session");

        if let Some(task) = self.inner.listen_task.lock().unwrap().take() {
            task.abort();
        }

        let mut slot = self.inner.transport.lock().await;
        if let Some(mut transport) = slot.take() {
            transport.terminate();
        }
        drop(slot);

        self.inner.registry.clear();
        self.inner.set_state(SessionState::Offline);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Guard document/request operations until the handshake completed
    fn ensure_session(&self, method: &str) -> Result<(), ClientError> {
        if method == METHOD_INITIALIZE {
            return Ok(());
        }
        match self.inner.state() {
            SessionState::Initialized => Ok(()),
            SessionState::Offline => Err(ClientError::ServerOffline),
            SessionState::Starting | SessionState::AwaitingInitializeResult => {
                Err(ClientError::NotInitialized)
            }
        }
    }

    /// Write a message; a dead pipe takes the whole session offline so
    /// the caller sees `ServerOffline` exactly once and can restart
    async fn write_checked(&self, message: &Message) -> Result<(), ClientError> {
        match self.inner.write_message(message).await {
            Ok(()) => Ok(()),
            Err(ClientError::ServerOffline) => {
                warn!("transport write failed, taking session offline");
                self.inner.go_offline("write failure").await;
                Err(ClientError::ServerOffline)
            }
            Err(other) => Err(other),
        }
    }
}

impl ClientInner {
    fn state(&self) -> SessionState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = state;
    }

    /// Frame and write one message through the live transport
    async fn write_message(&self, message: &Message) -> Result<(), ClientError> {
        let body = message.encode()?;
        let framed = framing::wrap(&body);

        let slot = self.transport.lock().await;
        let transport = slot.as_ref().ok_or(ClientError::ServerOffline)?;
        transport.write(&framed).await.map_err(|err| {
            debug!("transport write failed: {err}");
            ClientError::ServerOffline
        })
    }

    /// The listen loop: pull chunks, reassemble frames, decode and
    /// dispatch, until EOF or an unrecoverable protocol error.
    async fn listen(self: Arc<Self>, mut reader: ChunkReceiver) {
        let mut buffer = StreamBuffer::new();
        debug!("listen loop started");

        while let Some(chunk) = reader.recv().await {
            buffer.put(&chunk);
            loop {
                match buffer.try_take() {
                    Ok(Some(body)) => match Message::decode(&body) {
                        Ok(message) => {
                            if !self.handle_inbound(message).await {
                                return;
                            }
                        }
                        Err(err) => {
                            // the stream can no longer be trusted
                            error!("undecodable message, closing session: {err}");
                            self.go_offline("protocol error").await;
                            return;
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        error!("framing error, closing session: {err}");
                        self.go_offline("framing error").await;
                        return;
                    }
                }
            }
        }

        // EOF: orderly shutdown and process death look identical here
        info!("server stream closed");
        self.go_offline("stream closed").await;
    }

    /// Returns false when the session had to be closed
    async fn handle_inbound(self: &Arc<Self>, message: Message) -> bool {
        trace!(?message, "inbound message");
        match self.dispatcher.dispatch(message) {
            Dispatched::Response { method, response } if method == METHOD_INITIALIZE => {
                self.finish_handshake(&response).await
            }
            Dispatched::Reply(reply) => match self.write_message(&reply).await {
                Ok(()) => true,
                Err(err) => {
                    error!("failed to write reply: {err}");
                    self.go_offline("write failure").await;
                    false
                }
            },
            _ => true,
        }
    }

    /// Complete the handshake once the initialize response arrives:
    /// acknowledge with `initialized` and open the session
    async fn finish_handshake(self: &Arc<Self>, response: &Message) -> bool {
        if let Some(err) = response.error() {
            error!(%err, "server rejected initialize");
            self.go_offline("initialize rejected").await;
            return false;
        }

        let notification = Message::notification(METHOD_INITIALIZED, json!({}));
        if let Err(err) = self.write_message(&notification).await {
            error!("failed to acknowledge initialize: {err}");
            self.go_offline("write failure").await;
            return false;
        }

        self.set_state(SessionState::Initialized);
        self.restart.lock().unwrap().reset();
        info!("session initialized");
        true
    }

    /// Close the session after a failure or EOF. Idempotent; the restart
    /// gate only records a failure for the transition that actually
    /// closed the session.
    async fn go_offline(&self, reason: &str) {
        let previous = {
            // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut *state, SessionState::Offline)
        };
        if previous == SessionState::Offline {
            return;
        }
        info!(reason, "session offline");

        let mut slot = self.transport.lock().await;
        if let Some(mut transport) = slot.take() {
            transport.terminate();
        }
        drop(slot);

        self.registry.clear();
        self.restart.lock().unwrap().record_failure();
    }
}

/// Minimal file URI for the workspace root; drive-letter and
/// percent-encoding edge cases are the embedder's concern
fn path_to_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}
