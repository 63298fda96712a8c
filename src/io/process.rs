//! Child process transport
//!
//! Owns the language server process: spawn with redirected standard
//! streams, liveness tracking, framed-bytes writes to stdin, and the two
//! background loops reading stdout (message stream) and stderr
//! (diagnostic log) for the lifetime of the process.

use crate::io::{ChunkReceiver, Transport, TransportError};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Size of the read buffer for stdout reading operations
const READ_BUFFER_SIZE: usize = 4096;

// ============================================================================
// Process State
// ============================================================================

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been spawned yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited or was terminated
    Stopped,
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Spawn Errors
// ============================================================================

/// Errors produced while launching the server process
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("'{command}' not found in PATH")]
    NotFound { command: String },

    #[error("failed to spawn '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("empty server command")]
    EmptyCommand,

    #[error("process already spawned")]
    AlreadySpawned,

    #[error("child stdio pipes unavailable")]
    PipesUnavailable,
}

// ============================================================================
// Spawn Options
// ============================================================================

/// Environment and working-directory overrides for the child process
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Extra environment variables, appended to the inherited environment
    pub env: Vec<(String, String)>,

    /// Working directory for the process (inherited when unset)
    pub cwd: Option<PathBuf>,
}

// ============================================================================
// Process Transport
// ============================================================================

type StderrSink = Arc<dyn Fn(String) + Send + Sync>;

/// Transport backed by a spawned child process.
///
/// The child handle is owned exclusively by the wait task; every other
/// component observes liveness only through the shared [`ProcessState`].
pub struct ProcessTransport {
    /// Command line: executable followed by its arguments
    command: Vec<String>,

    /// Spawn-time options
    options: SpawnOptions,

    /// Thread-safe process state, updated by the wait task on exit
    state: Arc<Mutex<ProcessState>>,

    /// Child stdin; one lock serializes writers so frames never interleave
    stdin: Option<Arc<tokio::sync::Mutex<ChildStdin>>>,

    /// Inbound chunk stream, handed to the listen loop via `take_reader`
    reader: Option<ChunkReceiver>,

    /// Sink for stderr lines; defaults to the debug log
    stderr_sink: Option<StderrSink>,

    /// Background task handles
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    wait_task: Option<JoinHandle<()>>,
}

impl ProcessTransport {
    /// Create a transport for the given command line; does not spawn yet
    pub fn new(command: Vec<String>, options: SpawnOptions) -> Self {
        Self {
            command,
            options,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdin: None,
            reader: None,
            stderr_sink: None,
            stdout_task: None,
            stderr_task: None,
            wait_task: None,
        }
    }

    /// Install a sink for stderr lines.
    ///
    /// Must be called before [`spawn`](Self::spawn); installing a sink
    /// replaces the previous one. Without a sink, lines go to the debug
    /// log so the child can never block on a full stderr pipe.
    pub fn on_stderr_line<F>(&mut self, sink: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_sink = Some(Arc::new(sink));
    }

    /// Get current process state (thread-safe)
    pub fn state(&self) -> ProcessState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    /// Launch the child process and start the stdout/stderr/wait tasks
    pub fn spawn(&mut self) -> Result<(), SpawnError> {
        if self.state().is_running() {
            return Err(SpawnError::AlreadySpawned);
        }

        let Some((program, args)) = self.command.split_first() else {
            return Err(SpawnError::EmptyCommand);
        };

        info!("spawning server: {} {:?}", program, args);

        let mut builder = Command::new(program);
        builder
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.options.env {
            builder.env(key, value);
        }
        if let Some(cwd) = &self.options.cwd {
            builder.current_dir(cwd);
        }

        #[cfg(windows)]
        {
            // suppress the console window that would otherwise flash up
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            builder.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = builder.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                SpawnError::NotFound {
                    command: program.clone(),
                }
            } else {
                SpawnError::Io {
                    command: program.clone(),
                    source,
                }
            }
        })?;

        let Some(pid) = child.id() else {
            return Err(SpawnError::Io {
                command: program.clone(),
                source: io::Error::other("failed to get process ID"),
            });
        };
        info!("server process started with PID {}", pid);

        let stdin = child.stdin.take().ok_or(SpawnError::PipesUnavailable)?;
        let stdout = child.stdout.take().ok_or(SpawnError::PipesUnavailable)?;
        let stderr = child.stderr.take().ok_or(SpawnError::PipesUnavailable)?;

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ProcessState::Running { pid };

        self.stdin = Some(Arc::new(tokio::sync::Mutex::new(stdin)));

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        self.reader = Some(chunk_rx);
        self.stdout_task = Some(tokio::spawn(stdout_loop(stdout, chunk_tx)));
        self.stderr_task = Some(tokio::spawn(stderr_loop(stderr, self.stderr_sink.clone())));
        self.wait_task = Some(tokio::spawn(wait_loop(child, Arc::clone(&self.state))));

        Ok(())
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.state().is_running() {
            return Err(TransportError::Offline);
        }

        let stdin = self.stdin.as_ref().ok_or(TransportError::Offline)?;
        let mut stdin = stdin.lock().await;

        trace!(bytes = bytes.len(), "writing to server stdin");
        stdin.write_all(bytes).await.map_err(map_write_error)?;
        // one flush per logical message, no batching
        stdin.flush().await.map_err(map_write_error)?;
        Ok(())
    }

    fn take_reader(&mut self) -> Option<ChunkReceiver> {
        self.reader.take()
    }

    fn is_running(&self) -> bool {
        self.state().is_running()
    }

    fn terminate(&mut self) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let pid = self.state.lock().unwrap().pid();

        if let Some(pid) = pid {
            info!("terminating server process with PID {}", pid);

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        }

        // closing stdin makes well-behaved servers exit on every platform
        self.stdin.take();

        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        // the wait task keeps running so the child is reaped

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ProcessState::Stopped;
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn map_write_error(err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::BrokenPipe {
        TransportError::Offline
    } else {
        TransportError::Io(err)
    }
}

// ============================================================================
// Background Loops
// ============================================================================

/// Read stdout in bounded chunks and forward them until EOF.
///
/// EOF stops the loop silently; an orderly shutdown and a crash look the
/// same here, and telling them apart is the session layer's job.
async fn stdout_loop(stdout: ChildStdout, sender: mpsc::UnboundedSender<Vec<u8>>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                trace!("server stdout reached EOF");
                break;
            }
            Ok(n) => {
                if sender.send(buf[..n].to_vec()).is_err() {
                    trace!("chunk receiver dropped, stopping stdout loop");
                    break;
                }
            }
            Err(err) => {
                error!("failed to read server stdout: {err}");
                break;
            }
        }
    }
}

/// Forward stderr lines to the diagnostic sink until EOF.
///
/// stderr is an unstructured text stream; it is never parsed for control
/// flow. Draining it unconditionally keeps the child from blocking on a
/// full pipe.
async fn stderr_loop(stderr: ChildStderr, sink: Option<StderrSink>) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                trace!("server stderr reached EOF");
                break;
            }
            Ok(_) => {
                let content = line.trim_end().to_string();
                if content.is_empty() {
                    continue;
                }
                match &sink {
                    Some(sink) => sink(content),
                    None => debug!("server stderr: {content}"),
                }
            }
            Err(err) => {
                error!("failed to read server stderr: {err}");
                break;
            }
        }
    }
}

/// Reap the child and flip the shared state once it exits
async fn wait_loop(mut child: Child, state: Arc<Mutex<ProcessState>>) {
    match child.wait().await {
        Ok(status) => info!("server process exited with status {status}"),
        Err(err) => error!("error waiting for server process: {err}"),
    }

    if let Ok(mut state) = state.lock() {
        *state = ProcessState::Stopped;
    }
}

// ============================================================================
// Tests
// ============================================================================
