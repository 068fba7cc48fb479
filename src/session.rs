//! Language Session Manager
//!
//! [`SessionManager`] owns the one language-client session of an extension
//! instance. Lifecycle is an explicit state machine:
//!
//! ```text
//! Idle ──start──▶ Starting ──handshake ok──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                    │                          │
//!                    └──launch/handshake error──┴──server died──▶ Failed
//! ```
//!
//! `start` returns as soon as the launch is issued; the handshake completes
//! on a background task. Callers that need the server await the returned
//! [`ReadyHandle`] or watch [`SessionManager::subscribe`].

use crate::config::BridgeConfig;
use crate::io::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    StderrMonitor, StopMode, StreamTransport,
};
use crate::log_timing;
use crate::lsp::{
    ClientOptions, LspClient, LspError, OutputChannel, OutputLevel, ServerOptions, file_uri,
    initialize_params,
};
use crate::protocol::jsonrpc::{
    JsonRpcErrorCode, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use async_trait::async_trait;
use lsp_types::notification::{LogMessage, Notification, ShowMessage};
use lsp_types::request::{
    RegisterCapability, Request, UnregisterCapability, WorkDoneProgressCreate,
    WorkspaceConfiguration,
};
use lsp_types::{
    ConfigurationParams, FileChangeType, FileEvent, LogMessageParams, ShowMessageParams,
    TextDocumentItem,
};
use serde_json::{Value, json};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Level, debug, error, info, warn};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Launch or handshake failed, or the server died while running
    Failed(String),
}

impl SessionState {
    /// States in which no session is active and `start` is accepted
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Stopped | SessionState::Failed(_)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A language session is already {state}")]
    AlreadyStarted { state: SessionState },

    #[error("Failed to launch language server: {0}")]
    Launch(#[from] ProcessError),

    #[error("LSP error: {0}")]
    Lsp(#[from] LspError),

    #[error("Language server did not finish initializing within {timeout:?}")]
    InitializationTimeout { timeout: Duration },

    #[error("Language session failed: {0}")]
    StartFailed(String),

    #[error("Language session is {state}")]
    NotRunning { state: SessionState },
}

// ============================================================================
// Readiness
// ============================================================================

/// Resolves once the session leaves `Starting`
#[derive(Debug, Clone)]
pub struct ReadyHandle {
    state: watch::Receiver<SessionState>,
}

impl ReadyHandle {
    pub async fn wait(mut self) -> Result<(), SessionError> {
        let state = match self
            .state
            .wait_for(|state| *state != SessionState::Starting)
            .await
        {
            Ok(state) => state.clone(),
            Err(_) => SessionState::Stopped,
        };

        match state {
            SessionState::Running => Ok(()),
            SessionState::Failed(reason) => Err(SessionError::StartFailed(reason)),
            state => Err(SessionError::NotRunning { state }),
        }
    }
}

// ============================================================================
// Launching
// ============================================================================

/// A started server: the transport to talk to it and, for real processes,
/// the process handle
pub struct LaunchedServer {
    pub transport: StreamTransport,
    pub process: Option<ChildProcessManager>,
}

impl LaunchedServer {
    pub fn new(transport: StreamTransport, process: ChildProcessManager) -> Self {
        Self {
            transport,
            process: Some(process),
        }
    }

    /// A server whose lifetime is not owned by the session
    pub fn detached(transport: StreamTransport) -> Self {
        Self {
            transport,
            process: None,
        }
    }
}

/// Starts the language server described by [`ServerOptions`]
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(
        &self,
        options: &ServerOptions,
        output: &OutputChannel,
        on_exit: Arc<dyn ProcessExitHandler>,
    ) -> Result<LaunchedServer, SessionError>;
}

/// Spawns the server as a child process speaking LSP on stdio
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    shutdown_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(shutdown_grace: Duration) -> Self {
        Self { shutdown_grace }
    }
}

#[async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        options: &ServerOptions,
        output: &OutputChannel,
        on_exit: Arc<dyn ProcessExitHandler>,
    ) -> Result<LaunchedServer, SessionError> {
        let mut process =
            ChildProcessManager::new(&options.command, options.args.clone(), options.cwd.clone())
                .with_shutdown_grace(self.shutdown_grace);

        let stderr_output = output.clone();
        process.on_stderr_line(move |line| stderr_output.append(OutputLevel::Info, line));
        process.on_process_exit(on_exit);

        process.start().await?;
        let transport = process.create_stdio_transport()?;
        Ok(LaunchedServer::new(transport, process))
    }
}

/// Marks a starting or running session failed when its server exits on its own
struct ExitWatcher {
    state: Arc<watch::Sender<SessionState>>,
    output: OutputChannel,
}

#[async_trait]
impl ProcessExitHandler for ExitWatcher {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        let reason = match event.code {
            Some(code) => format!("language server exited unexpectedly with code {code}"),
            None => "language server was terminated unexpectedly".to_string(),
        };
        let changed = self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Starting | SessionState::Running) {
                *state = SessionState::Failed(reason.clone());
                true
            } else {
                false
            }
        });
        if changed {
            self.output.append(OutputLevel::Error, reason);
        }
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// A file change reported by the host's file watcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFileChange {
    pub path: PathBuf,
    pub kind: FileChangeType,
}

impl WatchedFileChange {
    pub fn new(path: impl Into<PathBuf>, kind: FileChangeType) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// The live connection; owning it means owning the server
struct LanguageSession {
    client: LspClient,
    process: Option<ChildProcessManager>,
}

impl Drop for LanguageSession {
    fn drop(&mut self) {
        if let Some(process) = &mut self.process {
            process.kill_sync();
        }
    }
}

type SharedSettings = Arc<Mutex<Value>>;

pub struct SessionManager {
    client_id: String,
    client_name: String,
    client_options: ClientOptions,
    initialization_timeout: Duration,
    request_timeout: Duration,
    launcher: Arc<dyn ServerLauncher>,
    output: OutputChannel,
    state: Arc<watch::Sender<SessionState>>,
    settings: SharedSettings,
    server_options: Option<ServerOptions>,
    active: Arc<tokio::sync::Mutex<Option<LanguageSession>>>,
    start_task: Option<JoinHandle<()>>,
}

impl SessionManager {
    pub fn new(
        client_id: impl Into<String>,
        client_name: impl Into<String>,
        client_options: ClientOptions,
        config: &BridgeConfig,
    ) -> Self {
        let output = OutputChannel::new(
            &client_options.output_channel_name,
            client_options.reveal_output_channel_on,
        );
        let (state, _) = watch::channel(SessionState::Idle);

        Self {
            client_id: client_id.into(),
            client_name: client_name.into(),
            client_options,
            initialization_timeout: config.initialization_timeout,
            request_timeout: config.request_timeout,
            launcher: Arc::new(ProcessLauncher::new(config.shutdown_timeout)),
            output,
            state: Arc::new(state),
            settings: Arc::new(Mutex::new(Value::Object(Default::default()))),
            server_options: None,
            active: Arc::new(tokio::sync::Mutex::new(None)),
            start_task: None,
        }
    }

    /// Replace how the server is started
    pub fn with_launcher(mut self, launcher: Arc<dyn ServerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        *self.state.borrow() == SessionState::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn output(&self) -> &OutputChannel {
        &self.output
    }

    pub fn client_options(&self) -> &ClientOptions {
        &self.client_options
    }

    /// Options of the most recent launch
    pub fn server_options(&self) -> Option<&ServerOptions> {
        self.server_options.as_ref()
    }

    /// Launch the server and begin the handshake without waiting for it
    pub fn start(
        &mut self,
        server_path: &Path,
        workspace_root: Option<&Path>,
    ) -> Result<ReadyHandle, SessionError> {
        let current = self.state();
        if !current.is_settled() {
            return Err(SessionError::AlreadyStarted { state: current });
        }

        let options = ServerOptions::new(server_path, workspace_root.map(Path::to_path_buf));
        info!(
            client = self.client_id.as_str(),
            "Starting language session: {} (cwd: {:?})",
            options.command.display(),
            options.cwd
        );

        self.state.send_replace(SessionState::Starting);
        let ready = ReadyHandle {
            state: self.state.subscribe(),
        };

        let launch = Launch {
            launcher: Arc::clone(&self.launcher),
            options: options.clone(),
            client_name: self.client_name.clone(),
            section: self.client_options.synchronize.configuration_section.clone(),
            initialization_timeout: self.initialization_timeout,
            request_timeout: self.request_timeout,
            output: self.output.clone(),
            state: Arc::clone(&self.state),
            settings: Arc::clone(&self.settings),
        };
        let active = Arc::clone(&self.active);
        let state = Arc::clone(&self.state);
        let output = self.output.clone();

        self.server_options = Some(options);
        self.start_task = Some(tokio::spawn(async move {
            let started = Instant::now();
            match launch.run().await {
                Ok(session) => {
                    // Held across the transition so readiness waiters find the session
                    let mut slot = active.lock().await;
                    let promoted = state.send_if_modified(|current| {
                        if *current == SessionState::Starting {
                            *current = SessionState::Running;
                            true
                        } else {
                            false
                        }
                    });
                    if promoted {
                        *slot = Some(session);
                        log_timing!(Level::INFO, "language_session_start", started.elapsed());
                    } else {
                        // The exit watcher already failed the session
                        warn!("Language server exited during start-up");
                        drop(session);
                    }
                }
                Err(e) => {
                    error!("Language session failed to start: {}", e);
                    output.append(OutputLevel::Error, e.to_string());
                    state.send_replace(SessionState::Failed(e.to_string()));
                }
            }
        }));

        Ok(ready)
    }

    /// Shut the session down; completes immediately when nothing is active
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        if let Some(task) = self.start_task.take() {
            if let Err(e) = task.await {
                warn!("Language session start task ended abnormally: {}", e);
            }
        }

        let session = self.active.lock().await.take();
        let current = self.state();
        if current != SessionState::Running {
            if let Some(session) = session {
                // The server died on its own; release what is left
                Self::shutdown_session(session).await;
            }
            debug!("Language session is {}, nothing to stop", current);
            return Ok(());
        }

        info!(client = self.client_id.as_str(), "Stopping language session");
        self.state.send_replace(SessionState::Stopping);
        if let Some(session) = session {
            Self::shutdown_session(session).await;
        }
        self.state.send_replace(SessionState::Stopped);
        info!(client = self.client_id.as_str(), "Language session stopped");
        Ok(())
    }

    async fn shutdown_session(mut session: LanguageSession) {
        if let Err(e) = session.client.close().await {
            warn!("Language server shutdown was not clean: {}", e);
        }

        if let Some(mut process) = session.process.take() {
            match process.stop(StopMode::Graceful).await {
                Ok(()) | Err(ProcessError::NotStarted) => {}
                Err(e) => {
                    warn!("Failed to stop language server process: {}", e);
                    process.kill_sync();
                }
            }
        }
    }

    /// Store the host settings tree and push the synchronized section
    pub async fn did_change_configuration(&self, settings: Value) -> Result<(), SessionError> {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;

        let active = self.active.lock().await;
        let Some(session) = active.as_ref().filter(|_| self.is_running()) else {
            debug!("Settings stored; language session is {}", self.state());
            return Ok(());
        };
        let section = &self.client_options.synchronize.configuration_section;
        session
            .client
            .did_change_configuration(section_payload(&self.settings, section))
            .await?;
        Ok(())
    }

    /// Forward the changes matching the file-watch globs; returns how many
    pub async fn did_change_watched_files(
        &self,
        changes: &[WatchedFileChange],
    ) -> Result<usize, SessionError> {
        let root = self
            .server_options
            .as_ref()
            .and_then(|options| options.cwd.as_deref());
        let filter = &self.client_options.synchronize.file_events;

        let mut events = Vec::new();
        for change in changes.iter().filter(|c| filter.matches(&c.path, root)) {
            events.push(FileEvent::new(file_uri(&change.path)?, change.kind));
        }
        if events.is_empty() {
            return Ok(0);
        }

        let active = self.active.lock().await;
        let Some(session) = active.as_ref().filter(|_| self.is_running()) else {
            return Ok(0);
        };
        let count = events.len();
        session.client.did_change_watched_files(events).await?;
        Ok(count)
    }

    /// Forward `textDocument/didOpen` if the document selector accepts it
    pub async fn did_open(
        &self,
        path: &Path,
        language_id: &str,
        version: i32,
        text: impl Into<String>,
    ) -> Result<bool, SessionError> {
        if !self.client_options.document_selector.matches(language_id, "file") {
            return Ok(false);
        }

        let active = self.active.lock().await;
        let Some(session) = active.as_ref().filter(|_| self.is_running()) else {
            return Ok(false);
        };
        let document = TextDocumentItem::new(file_uri(path)?, language_id.to_string(), version, text.into());
        session.client.did_open(document).await?;
        Ok(true)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(task) = self.start_task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Launch task
// ============================================================================

/// Everything the background launch needs, detached from the manager
struct Launch {
    launcher: Arc<dyn ServerLauncher>,
    options: ServerOptions,
    client_name: String,
    section: String,
    initialization_timeout: Duration,
    request_timeout: Duration,
    output: OutputChannel,
    state: Arc<watch::Sender<SessionState>>,
    settings: SharedSettings,
}

impl Launch {
    async fn run(self) -> Result<LanguageSession, SessionError> {
        let exit_watcher = Arc::new(ExitWatcher {
            state: Arc::clone(&self.state),
            output: self.output.clone(),
        });
        let launched = self
            .launcher
            .launch(&self.options, &self.output, exit_watcher)
            .await?;

        let mut session = LanguageSession {
            client: LspClient::new(launched.transport, self.request_timeout),
            process: launched.process,
        };
        self.install_handlers(&session.client).await;

        let params = initialize_params(&self.client_name, self.options.cwd.as_deref())?;
        match session
            .client
            .initialize(params, self.initialization_timeout)
            .await
        {
            Ok(_) => {}
            Err(LspError::RequestTimeout { .. }) => {
                return Err(SessionError::InitializationTimeout {
                    timeout: self.initialization_timeout,
                });
            }
            Err(e) => return Err(e.into()),
        }

        session
            .client
            .did_change_configuration(section_payload(&self.settings, &self.section))
            .await?;
        Ok(session)
    }

    async fn install_handlers(&self, client: &LspClient) {
        let output = self.output.clone();
        client
            .rpc_client()
            .on_notification(move |notification| route_notification(&output, notification))
            .await;

        let settings = Arc::clone(&self.settings);
        client
            .rpc_client()
            .on_request(move |request| answer_request(&settings, request))
            .await;
    }
}

fn route_notification(output: &OutputChannel, notification: JsonRpcNotification) {
    let params = notification.params.unwrap_or(Value::Null);
    match notification.method.as_str() {
        LogMessage::METHOD => match serde_json::from_value::<LogMessageParams>(params) {
            Ok(message) => output.append_message(message.typ, message.message),
            Err(e) => warn!("Malformed window/logMessage: {}", e),
        },
        ShowMessage::METHOD => match serde_json::from_value::<ShowMessageParams>(params) {
            Ok(message) => output.append_message(message.typ, message.message),
            Err(e) => warn!("Malformed window/showMessage: {}", e),
        },
        method => debug!("Ignoring server notification: {}", method),
    }
}

fn answer_request(settings: &SharedSettings, request: JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        WorkspaceConfiguration::METHOD => {
            let params = request.params.unwrap_or(Value::Null);
            match serde_json::from_value::<ConfigurationParams>(params) {
                Ok(params) => {
                    let tree = settings.lock().unwrap_or_else(PoisonError::into_inner);
                    let items: Vec<Value> = params
                        .items
                        .iter()
                        .map(|item| match item.section.as_deref() {
                            Some(section) => lookup_section(&tree, section).clone(),
                            None => tree.clone(),
                        })
                        .collect();
                    JsonRpcResponse::success(request.id, Value::Array(items))
                }
                Err(e) => JsonRpcResponse::error(
                    request.id,
                    JsonRpcErrorCode::InvalidParams,
                    e.to_string(),
                ),
            }
        }
        WorkDoneProgressCreate::METHOD | RegisterCapability::METHOD | UnregisterCapability::METHOD => {
            JsonRpcResponse::success(request.id, Value::Null)
        }
        method => {
            debug!("Unhandled server request: {}", method);
            JsonRpcResponse::method_not_found(request.id, method)
        }
    }
}

static NULL: Value = Value::Null;

/// Value at a dotted path such as `java.format.enabled`; `null` when absent
pub fn lookup_section<'a>(tree: &'a Value, section: &str) -> &'a Value {
    section
        .split('.')
        .filter(|part| !part.is_empty())
        .try_fold(tree, |node, part| node.get(part))
        .unwrap_or(&NULL)
}

/// `{"<section>": ...}`; the client wraps it as the `settings` param
fn section_payload(settings: &SharedSettings, section: &str) -> Value {
    let tree = settings.lock().unwrap_or_else(PoisonError::into_inner);
    json!({ section: lookup_section(&tree, section) })
}
