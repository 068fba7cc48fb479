//! Process management layer
//!
//! Handles external process lifecycle and stderr monitoring,
//! completely separate from transport concerns.

use crate::io::transport::StreamTransport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
// warn! is used in non-unix code blocks
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

/// Time a gracefully stopped process gets before it is killed
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, then SIGKILL once the grace period runs out
    Graceful,
    /// SIGKILL immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited or was stopped
    Stopped,
}

impl ProcessState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Fired once when the child exits, whoever caused it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExitEvent {
    pub pid: Option<u32>,
    /// Exit code, `None` when terminated by a signal or when waiting failed
    pub code: Option<i32>,
}

#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Stderr Monitoring Trait
// ============================================================================

/// Trait for monitoring stderr output from external processes
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines
    ///
    /// Only one handler can be active at a time. It must be installed before
    /// the process starts; stderr is drained either way so the child never
    /// blocks on a full pipe.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to spawn {}: {source}", command.display())]
    Spawn {
        command: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Trait for managing external process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the external process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Stop the external process
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;

    /// Take the transport over the process stdin/stdout (only once)
    fn create_stdio_transport(&mut self) -> Result<StreamTransport, Self::Error>;

    /// Synchronous force kill for Drop implementations
    fn kill_sync(&mut self);
}

/// Manages one child process spawned via `tokio::process::Command`
pub struct ChildProcessManager {
    command: PathBuf,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    env: HashMap<String, String>,
    shutdown_grace: Duration,
    state: Arc<Mutex<ProcessState>>,
    stdio_transport: Option<StreamTransport>,
    stderr_handler: Option<Box<dyn Fn(String) + Send + Sync>>,
    stderr_task: Option<JoinHandle<()>>,
    /// Flips to `true` once the wait task has observed the exit
    exited: Option<watch::Receiver<bool>>,
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ChildProcessManager {
    /// Create a new child process manager
    ///
    /// # Arguments
    /// * `command` - Executable to run
    /// * `args` - Command line arguments
    /// * `working_dir` - Optional working directory for the process
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args,
            working_directory: working_dir,
            env: HashMap::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio_transport: None,
            stderr_handler: None,
            stderr_task: None,
            exited: None,
            exit_handler: None,
        }
    }

    /// Extra environment variables, on top of the inherited environment
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Install a handler invoked when the child exits
    pub fn on_process_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.exit_handler = Some(handler);
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    pub fn get_state(&self) -> ProcessState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: ProcessState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Always drains stderr; forwards lines when a handler is installed
    fn spawn_stderr_monitor(&mut self, stderr: tokio::process::ChildStderr) {
        if self.stderr_task.is_some() {
            return;
        }

        let handler = self.stderr_handler.take();
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        let content = line.trim_end();
                        if content.is_empty() {
                            continue;
                        }
                        match handler {
                            Some(ref handler) => handler(content.to_string()),
                            None => trace!("ChildProcessManager: stderr drained: {}", content),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }
        });

        self.stderr_task = Some(task);
    }

    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let exit_handler = self.exit_handler.clone();
        let state = Arc::clone(&self.state);
        let (exited_tx, exited_rx) = watch::channel(false);
        self.exited = Some(exited_rx);

        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    info!("Process PID {} exited with status: {}", pid, status);
                    status.code()
                }
                Err(e) => {
                    error!("Error waiting for child process {}: {}", pid, e);
                    None
                }
            };

            *state.lock().unwrap_or_else(PoisonError::into_inner) = ProcessState::Stopped;
            let _ = exited_tx.send(true);

            if let Some(handler) = &exit_handler {
                handler
                    .on_process_exit(ProcessExitEvent {
                        pid: Some(pid),
                        code,
                    })
                    .await;
            }
        });
    }

    /// Wait until the wait task reports exit, bounded by `timeout`
    async fn wait_for_exit(&self, timeout: Duration) -> bool {
        let Some(mut exited) = self.exited.clone() else {
            return true;
        };
        match tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    #[cfg(unix)]
    fn signal(pid: u32, signal: libc::c_int) -> bool {
        // SAFETY: kill(2) has no memory-safety preconditions
        unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!(
            "Starting process: {} {:?} (cwd: {:?})",
            self.command.display(),
            self.args,
            self.working_directory
        );

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;
        info!("Process started with PID: {}", pid);
        self.set_state(ProcessState::Running { pid });

        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdio_transport = Some(StreamTransport::from_child(stdin, stdout));
        self.spawn_stderr_monitor(stderr);
        self.spawn_wait_task(child, pid);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = self.get_state().pid().ok_or(ProcessError::NotStarted)?;

        // Dropping the transport closes stdin, which most servers treat as exit
        self.stdio_transport.take();

        #[cfg(unix)]
        {
            match mode {
                StopMode::Graceful => {
                    info!("Gracefully stopping process with PID: {}", pid);
                    if Self::signal(pid, libc::SIGTERM) {
                        debug!("Sent SIGTERM to process {}", pid);
                    }
                    if !self.wait_for_exit(self.shutdown_grace).await {
                        warn!(
                            "Process {} did not exit within {:?}, killing",
                            pid, self.shutdown_grace
                        );
                        Self::signal(pid, libc::SIGKILL);
                    }
                }
                StopMode::Force => {
                    info!("Force killing process with PID: {}", pid);
                    Self::signal(pid, libc::SIGKILL);
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = mode;
            warn!("Process termination by signal is only implemented on unix");
            self.wait_for_exit(self.shutdown_grace).await;
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn create_stdio_transport(&mut self) -> Result<StreamTransport, Self::Error> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    fn kill_sync(&mut self) {
        let Some(pid) = self.get_state().pid() else {
            return;
        };

        info!("Synchronously force killing process with PID: {}", pid);

        #[cfg(unix)]
        {
            Self::signal(pid, libc::SIGKILL);
        }

        #[cfg(not(unix))]
        {
            warn!("Synchronous kill is only implemented on unix, PID {} may remain", pid);
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.set_state(ProcessState::Stopped);
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}
