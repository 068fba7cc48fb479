//! Host-side debug subsystem
//!
//! Holds the configuration providers and descriptor factories registered per
//! debugger type and runs a session start through them:
//! resolve the configuration, create a [`DebugSession`], ask the factory how
//! to reach the adapter, connect, and drive the DAP start-up sequence.

use crate::debug::configuration::{DebugConfigurationProvider, LaunchConfiguration, WorkspaceFolder};
use crate::debug::descriptor::{
    DebugAdapterDescriptor, DebugAdapterDescriptorFactory, DebugAdapterExecutable, DebugEndpoint,
    DebugSession,
};
use crate::io::{ChildProcessManager, ProcessError, ProcessManager, StopMode, StreamTransport};
use crate::protocol::dap::{DapClient, DapError};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CLIENT_ID: &str = "nbjava-bridge";

#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    #[error("Launch configuration has no 'type'")]
    MissingType,

    #[error("Debug session start was cancelled")]
    Cancelled,

    #[error("No debug adapter descriptor factory registered for '{debug_type}'")]
    NoDescriptorFactory { debug_type: String },

    #[error("Unsupported debug request '{request}'")]
    UnsupportedRequest { request: String },

    #[error("Cannot connect to debug adapter at {endpoint}: {source}")]
    Connect {
        endpoint: DebugEndpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("Debug adapter process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Debug adapter protocol error: {0}")]
    Protocol(#[from] DapError),
}

// ============================================================================
// Disposables
// ============================================================================

/// Undoes a registration when disposed
pub struct Disposable {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Disposable {
    pub fn new(dispose: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn dispose(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.dispose.is_none())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

type Registrations<T> = Arc<Mutex<HashMap<String, Vec<(u64, Arc<T>)>>>>;

fn register<T: ?Sized + Send + Sync + 'static>(
    registrations: &Registrations<T>,
    id: u64,
    debug_type: &str,
    item: Arc<T>,
) -> Disposable {
    registrations
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(debug_type.to_string())
        .or_default()
        .push((id, item));

    let registrations = Arc::clone(registrations);
    let debug_type = debug_type.to_string();
    Disposable::new(move || {
        let mut map = registrations.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = map.get_mut(&debug_type) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                map.remove(&debug_type);
            }
        }
    })
}

fn registered<T: ?Sized>(registrations: &Registrations<T>, debug_type: &str) -> Vec<Arc<T>> {
    registrations
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(debug_type)
        .map(|entries| entries.iter().map(|(_, item)| Arc::clone(item)).collect())
        .unwrap_or_default()
}

pub struct DebugRegistry {
    providers: Registrations<dyn DebugConfigurationProvider>,
    factories: Registrations<dyn DebugAdapterDescriptorFactory>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl DebugRegistry {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            providers: Arc::default(),
            factories: Arc::default(),
            next_id: AtomicU64::new(1),
            request_timeout,
        }
    }

    pub fn register_configuration_provider(
        &self,
        debug_type: &str,
        provider: Arc<dyn DebugConfigurationProvider>,
    ) -> Disposable {
        debug!("Registering debug configuration provider for '{}'", debug_type);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        register(&self.providers, id, debug_type, provider)
    }

    pub fn register_descriptor_factory(
        &self,
        debug_type: &str,
        factory: Arc<dyn DebugAdapterDescriptorFactory>,
    ) -> Disposable {
        debug!("Registering debug adapter descriptor factory for '{}'", debug_type);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        register(&self.factories, id, debug_type, factory)
    }

    pub fn has_provider(&self, debug_type: &str) -> bool {
        !registered(&self.providers, debug_type).is_empty()
    }

    pub fn has_descriptor_factory(&self, debug_type: &str) -> bool {
        !registered(&self.factories, debug_type).is_empty()
    }

    /// Run every provider registered for the configuration's type, in order
    pub fn resolve_configuration(
        &self,
        folder: Option<&WorkspaceFolder>,
        config: LaunchConfiguration,
        token: Option<&CancellationToken>,
    ) -> Result<LaunchConfiguration, DebugError> {
        let debug_type = config.debug_type().ok_or(DebugError::MissingType)?.to_string();

        let mut config = config;
        for provider in registered(&self.providers, &debug_type) {
            config = provider
                .resolve_debug_configuration(folder, config, token)
                .ok_or(DebugError::Cancelled)?;
        }
        if token.is_some_and(CancellationToken::is_cancelled) {
            return Err(DebugError::Cancelled);
        }
        Ok(config)
    }

    /// Descriptor from the most recently registered factory for the session type
    pub fn descriptor_for(
        &self,
        session: &DebugSession,
        executable: Option<&DebugAdapterExecutable>,
    ) -> Result<DebugAdapterDescriptor, DebugError> {
        let factory = registered(&self.factories, &session.debug_type)
            .pop()
            .ok_or_else(|| DebugError::NoDescriptorFactory {
                debug_type: session.debug_type.clone(),
            })?;
        Ok(factory.create_debug_adapter_descriptor(session, executable))
    }

    /// Start a debug session: resolve, describe, connect, launch or attach
    pub async fn start_debugging(
        &self,
        folder: Option<&WorkspaceFolder>,
        config: LaunchConfiguration,
        token: Option<&CancellationToken>,
    ) -> Result<DebugConnection, DebugError> {
        let config = self.resolve_configuration(folder, config, token)?;
        let request = config.request().unwrap_or("launch").to_string();
        if request != "launch" && request != "attach" {
            return Err(DebugError::UnsupportedRequest { request });
        }

        let session = DebugSession::new(config);
        info!(
            session = %session.id,
            "Starting debug session '{}' ({})",
            session.name,
            session.debug_type
        );

        let descriptor = self.descriptor_for(&session, None)?;
        let (transport, endpoint, process) = match descriptor {
            DebugAdapterDescriptor::Server(endpoint) => {
                let transport = StreamTransport::connect(endpoint.socket_addr())
                    .await
                    .map_err(|source| DebugError::Connect { endpoint, source })?;
                (transport, Some(endpoint), None)
            }
            DebugAdapterDescriptor::Executable(executable) => {
                let mut process =
                    ChildProcessManager::new(executable.command, executable.args, executable.cwd)
                        .with_env(executable.env);
                process.start().await?;
                let transport = process.create_stdio_transport()?;
                (transport, None, Some(process))
            }
        };

        let client = DapClient::new(transport, self.request_timeout);
        let mut connection = DebugConnection {
            session,
            endpoint,
            capabilities: Value::Null,
            client,
            process,
        };
        connection.begin(&request).await?;
        Ok(connection)
    }
}

impl Default for DebugRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::config::DEFAULT_REQUEST_TIMEOUT_SECS))
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A started debug session and its adapter connection
pub struct DebugConnection {
    session: DebugSession,
    endpoint: Option<DebugEndpoint>,
    capabilities: Value,
    client: DapClient,
    process: Option<ChildProcessManager>,
}

impl DebugConnection {
    /// `initialize`, then `launch`/`attach`, then `configurationDone`
    ///
    /// The launch response may arrive only after `configurationDone`, so the
    /// request is written first and awaited last.
    async fn begin(&mut self, request: &str) -> Result<(), DebugError> {
        self.capabilities = self
            .client
            .initialize(CLIENT_ID, &self.session.debug_type)
            .await?;

        let arguments = self.session.configuration.clone().into_value();
        let started = self.client.send_request(request, Some(arguments)).await?;

        let timeout = self.client.request_timeout();
        loop {
            match self.client.next_event(timeout).await {
                Some(event) if event.event == "initialized" => break,
                Some(event) => debug!("Debug event before initialized: {}", event.event),
                None => {
                    warn!("Debug adapter sent no 'initialized' event");
                    break;
                }
            }
        }

        if self.capabilities["supportsConfigurationDoneRequest"] == json!(true) {
            self.client.request("configurationDone", None).await?;
        }
        started.wait(timeout).await?;

        info!(session = %self.session.id, "Debug session started");
        Ok(())
    }

    pub fn session(&self) -> &DebugSession {
        &self.session
    }

    /// Endpoint connected to, for server descriptors
    pub fn endpoint(&self) -> Option<DebugEndpoint> {
        self.endpoint
    }

    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    pub fn client(&self) -> &DapClient {
        &self.client
    }

    /// `disconnect`, then close the connection and stop a spawned adapter
    pub async fn disconnect(mut self) -> Result<(), DebugError> {
        let terminate = self.session.configuration.request() != Some("attach");
        let result = self
            .client
            .request("disconnect", Some(json!({"terminateDebuggee": terminate})))
            .await;
        self.client.close().await;

        if let Some(mut process) = self.process.take() {
            match process.stop(StopMode::Graceful).await {
                Ok(()) | Err(ProcessError::NotStarted) => {}
                Err(e) => warn!("Failed to stop debug adapter: {}", e),
            }
        }

        info!(session = %self.session.id, "Debug session disconnected");
        result.map(|_| ()).map_err(DebugError::from)
    }
}

impl Drop for DebugConnection {
    fn drop(&mut self) {
        if let Some(process) = &mut self.process {
            process.kill_sync();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::configuration::JavaConfigurationProvider;
    use crate::debug::descriptor::ServerDescriptorFactory;
    use crate::test_utils::FakeDebugAdapter;

    fn config(value: Value) -> LaunchConfiguration {
        serde_json::from_value(value).unwrap()
    }

    fn java_registry(port: u16) -> (DebugRegistry, Vec<Disposable>) {
        let registry = DebugRegistry::new(Duration::from_secs(5));
        let disposables = vec![
            registry.register_configuration_provider("java", Arc::new(JavaConfigurationProvider)),
            registry.register_descriptor_factory(
                "java",
                Arc::new(ServerDescriptorFactory::new(DebugEndpoint::loopback(port))),
            ),
        ];
        (registry, disposables)
    }

    struct Abort;

    impl DebugConfigurationProvider for Abort {
        fn resolve_debug_configuration(
            &self,
            _folder: Option<&WorkspaceFolder>,
            _config: LaunchConfiguration,
            _token: Option<&CancellationToken>,
        ) -> Option<LaunchConfiguration> {
            None
        }
    }

    #[tokio::test]
    async fn test_launch_against_running_adapter() {
        let adapter = FakeDebugAdapter::start().await;
        let (registry, _disposables) = java_registry(adapter.port());

        let connection = registry
            .start_debugging(
                None,
                config(json!({"type": "java", "name": "Run Main", "request": "launch", "program": "/proj/Main"})),
                None,
            )
            .await
            .unwrap();

        assert_eq!(connection.endpoint(), Some(DebugEndpoint::loopback(adapter.port())));
        assert_eq!(connection.session().name, "Run Main");
        assert_eq!(connection.capabilities()["supportsConfigurationDoneRequest"], true);
        assert_eq!(adapter.commands(), ["initialize", "launch", "configurationDone"]);

        let launch = adapter.request("launch").unwrap();
        assert_eq!(launch["arguments"]["mainClass"], "/proj/Main");
        assert_eq!(launch["arguments"]["classPaths"], json!(["any"]));
        assert_eq!(launch["arguments"]["program"], "/proj/Main");

        connection.disconnect().await.unwrap();
        let disconnect = adapter.request("disconnect").unwrap();
        assert_eq!(disconnect["arguments"]["terminateDebuggee"], true);
    }

    #[tokio::test]
    async fn test_attach_request_is_forwarded() {
        let adapter = FakeDebugAdapter::start().await;
        let (registry, _disposables) = java_registry(adapter.port());

        let connection = registry
            .start_debugging(
                None,
                config(json!({"type": "java", "name": "Attach", "request": "attach", "hostName": "localhost", "port": 5005})),
                None,
            )
            .await
            .unwrap();

        let attach = adapter.request("attach").unwrap();
        assert_eq!(attach["arguments"]["port"], 5005);
        assert_eq!(attach["arguments"]["classPaths"], json!(["any"]));
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_nothing_listening_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (registry, _disposables) = java_registry(port);
        let err = registry
            .start_debugging(None, config(json!({"type": "java", "program": "Main"})), None)
            .await
            .err()
            .unwrap();

        match err {
            DebugError::Connect { endpoint, source } => {
                assert_eq!(endpoint, DebugEndpoint::loopback(port));
                assert_eq!(source.kind(), std::io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_type_and_unknown_type() {
        let (registry, _disposables) = java_registry(1);

        assert!(matches!(
            registry.start_debugging(None, config(json!({"program": "Main"})), None).await,
            Err(DebugError::MissingType)
        ));
        assert!(matches!(
            registry.start_debugging(None, config(json!({"type": "node"})), None).await,
            Err(DebugError::NoDescriptorFactory { ref debug_type }) if debug_type == "node"
        ));
    }

    #[tokio::test]
    async fn test_provider_abort_cancels_start() {
        let (registry, _disposables) = java_registry(1);
        let _abort = registry.register_configuration_provider("java", Arc::new(Abort));

        assert!(matches!(
            registry.start_debugging(None, config(json!({"type": "java"})), None).await,
            Err(DebugError::Cancelled)
        ));
    }

    #[test]
    fn test_cancelled_token_aborts_resolution() {
        let (registry, _disposables) = java_registry(1);
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            registry.resolve_configuration(None, config(json!({"type": "java"})), Some(&token)),
            Err(DebugError::Cancelled)
        ));
    }

    #[test]
    fn test_dispose_unregisters() {
        let (registry, disposables) = java_registry(1);
        assert!(registry.has_provider("java"));
        assert!(registry.has_descriptor_factory("java"));

        for disposable in disposables {
            disposable.dispose();
        }
        assert!(!registry.has_provider("java"));
        assert!(!registry.has_descriptor_factory("java"));

        // Without a provider the configuration passes through untouched
        let resolved = registry
            .resolve_configuration(None, config(json!({"type": "java", "program": "P"})), None)
            .unwrap();
        assert!(resolved.main_class().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_request() {
        let (registry, _disposables) = java_registry(1);
        let result = registry
            .start_debugging(None, config(json!({"type": "java", "request": "restart"})), None)
            .await;
        assert!(matches!(
            result,
            Err(DebugError::UnsupportedRequest { ref request }) if request == "restart"
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_for_executable_descriptor() {
        struct Spawn;
        impl DebugAdapterDescriptorFactory for Spawn {
            fn create_debug_adapter_descriptor(
                &self,
                _session: &DebugSession,
                _executable: Option<&DebugAdapterExecutable>,
            ) -> DebugAdapterDescriptor {
                DebugAdapterDescriptor::Executable(DebugAdapterExecutable::new(
                    "/nonexistent/java-debug-adapter",
                ))
            }
        }

        let registry = DebugRegistry::default();
        let _factory = registry.register_descriptor_factory("java", Arc::new(Spawn));
        let result = registry
            .start_debugging(None, config(json!({"type": "java"})), None)
            .await;
        assert!(matches!(
            result,
            Err(DebugError::Process(ProcessError::Spawn { .. }))
        ));
    }
}
