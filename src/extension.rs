//! Extension entry points
//!
//! [`activate`] is called once by the host. It computes where the bundled
//! server lives, starts the language session without waiting for it and
//! registers the Java debug providers. The returned [`Extension`] owns the
//! session until [`Extension::deactivate`].

use crate::config::BridgeConfig;
use crate::debug::{
    DebugRegistry, Disposable, JavaConfigurationProvider, ServerDescriptorFactory,
};
use crate::error::BridgeError;
use crate::locator::ServerLocation;
use crate::session::{ReadyHandle, ServerLauncher, SessionError, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// What the host hands to `activate`
#[derive(Debug, Default)]
pub struct ExtensionContext {
    /// Directory the extension is installed in
    pub extension_path: PathBuf,
    /// Root of the open workspace, if any
    pub workspace_root: Option<PathBuf>,
    /// Registrations released when the extension goes away
    pub subscriptions: Vec<Disposable>,
}

impl ExtensionContext {
    pub fn new(extension_path: impl Into<PathBuf>, workspace_root: Option<PathBuf>) -> Self {
        Self {
            extension_path: extension_path.into(),
            workspace_root,
            subscriptions: Vec::new(),
        }
    }

    /// Dispose every subscription, most recent first
    pub fn dispose(&mut self) {
        while let Some(subscription) = self.subscriptions.pop() {
            subscription.dispose();
        }
    }
}

/// The activated extension; owns the single language session
pub struct Extension {
    session: SessionManager,
    server_location: ServerLocation,
    ready: ReadyHandle,
}

impl Extension {
    /// Wait until the language server finished its handshake
    pub async fn ready(&self) -> Result<(), SessionError> {
        self.ready.clone().wait().await
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionManager {
        &mut self.session
    }

    pub fn server_location(&self) -> &ServerLocation {
        &self.server_location
    }

    /// Stop the language session
    pub async fn deactivate(mut self) -> Result<(), BridgeError> {
        info!("Deactivating extension");
        self.session.stop().await?;
        Ok(())
    }
}

/// Activate against the real server executable
pub fn activate(
    ctx: &mut ExtensionContext,
    debug: &DebugRegistry,
    config: &BridgeConfig,
) -> Result<Extension, BridgeError> {
    activate_with(ctx, debug, config, None)
}

/// Activate with a custom way of starting the server
pub fn activate_with_launcher(
    ctx: &mut ExtensionContext,
    debug: &DebugRegistry,
    config: &BridgeConfig,
    launcher: Arc<dyn ServerLauncher>,
) -> Result<Extension, BridgeError> {
    activate_with(ctx, debug, config, Some(launcher))
}

fn activate_with(
    ctx: &mut ExtensionContext,
    debug: &DebugRegistry,
    config: &BridgeConfig,
    launcher: Option<Arc<dyn ServerLauncher>>,
) -> Result<Extension, BridgeError> {
    let server_location = match &config.server_path {
        Some(path) => ServerLocation::explicit(path),
        None => ServerLocation::resolve(&ctx.extension_path, &config.server_bundle),
    };
    info!(
        "Activating {} support; server: {}",
        config.language_id, server_location
    );
    if !server_location.path().exists() {
        warn!("Language server executable not found at {}", server_location);
    }

    let mut session = SessionManager::new(
        &config.language_id,
        &config.client_name,
        config.client_options()?,
        config,
    );
    if let Some(launcher) = launcher {
        session = session.with_launcher(launcher);
    }
    let ready = session.start(server_location.path(), ctx.workspace_root.as_deref())?;

    ctx.subscriptions.push(debug.register_configuration_provider(
        &config.language_id,
        Arc::new(JavaConfigurationProvider),
    ));
    ctx.subscriptions.push(debug.register_descriptor_factory(
        &config.language_id,
        Arc::new(ServerDescriptorFactory::new(config.debug_endpoint())),
    ));

    Ok(Extension {
        session,
        server_location,
        ready,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::{DebugAdapterDescriptor, DebugEndpoint, DebugSession};
    use crate::session::SessionState;
    use crate::test_utils::{FakeLanguageServer, FakeServerBehavior, FakeServerLauncher};
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;

    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    fn context() -> ExtensionContext {
        ExtensionContext::new("/ext", Some(PathBuf::from("/proj")))
    }

    #[tokio::test]
    async fn test_activate_starts_session_and_registers_debug() {
        let launcher = Arc::new(FakeServerLauncher::new(FakeLanguageServer::default()));
        let registry = DebugRegistry::default();
        let config = BridgeConfig::default();
        let mut ctx = context();

        let extension =
            activate_with_launcher(&mut ctx, &registry, &config, launcher.clone()).unwrap();

        // Registered synchronously, before the server is ready
        assert!(registry.has_provider("java"));
        assert!(registry.has_descriptor_factory("java"));
        assert_eq!(ctx.subscriptions.len(), 2);
        assert_eq!(
            extension.server_location().path(),
            Path::new("/ext/nb-java-lsp-server/bin/nb-java-lsp-server")
        );

        extension.ready().await.unwrap();
        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(
            launches[0].command,
            PathBuf::from("/ext/nb-java-lsp-server/bin/nb-java-lsp-server")
        );
        assert_eq!(launches[0].cwd.as_deref(), Some(Path::new("/proj")));

        let options = extension.session().client_options();
        assert!(options.document_selector.matches("java", "file"));
        assert_eq!(options.synchronize.configuration_section, "java");
        assert_eq!(options.output_channel_name, "Java");

        extension.deactivate().await.unwrap();
        assert!(
            launcher
                .server
                .wait_for_method("exit", Duration::from_secs(2))
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_registered_factory_uses_configured_port() {
        let launcher = Arc::new(FakeServerLauncher::new(FakeLanguageServer::default()));
        let registry = DebugRegistry::default();
        let config = BridgeConfig::builder().debug_port(4711).build().unwrap();
        let mut ctx = context();

        let extension = activate_with_launcher(&mut ctx, &registry, &config, launcher).unwrap();

        let session = DebugSession::new(
            serde_json::from_value(json!({"type": "java", "name": "Run"})).unwrap(),
        );
        assert_eq!(
            registry.descriptor_for(&session, None).unwrap(),
            DebugAdapterDescriptor::Server(DebugEndpoint::loopback(4711))
        );

        ctx.dispose();
        assert!(!registry.has_descriptor_factory("java"));
        extension.deactivate().await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_server_path_bypasses_bundle() {
        let launcher = Arc::new(FakeServerLauncher::new(FakeLanguageServer::default()));
        let registry = DebugRegistry::default();
        let config = BridgeConfig::builder()
            .server_path("/opt/nbcode/bin/nb-java-lsp-server")
            .build()
            .unwrap();
        let mut ctx = context();

        let extension =
            activate_with_launcher(&mut ctx, &registry, &config, launcher.clone()).unwrap();
        extension.ready().await.unwrap();

        assert_eq!(
            launcher.launches()[0].command,
            PathBuf::from("/opt/nbcode/bin/nb-java-lsp-server")
        );
        extension.deactivate().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_still_deactivates() {
        let launcher = Arc::new(FakeServerLauncher::failing("no such file"));
        let registry = DebugRegistry::default();
        let mut ctx = context();

        let extension =
            activate_with_launcher(&mut ctx, &registry, &BridgeConfig::default(), launcher)
                .unwrap();

        assert!(matches!(
            extension.ready().await,
            Err(SessionError::StartFailed(_))
        ));
        assert!(matches!(extension.session().state(), SessionState::Failed(_)));
        // Debug routing does not depend on the language server
        assert!(registry.has_descriptor_factory("java"));
        extension.deactivate().await.unwrap();
    }

    #[tokio::test]
    async fn test_deactivate_before_ready() {
        let server = FakeLanguageServer::new(FakeServerBehavior {
            initialize_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let launcher = Arc::new(FakeServerLauncher::new(server));
        let registry = DebugRegistry::default();
        let mut ctx = ExtensionContext::new("/ext", None);

        let extension =
            activate_with_launcher(&mut ctx, &registry, &BridgeConfig::default(), launcher.clone())
                .unwrap();
        extension.deactivate().await.unwrap();

        assert_eq!(launcher.launches()[0].cwd, None);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_through_process_launcher() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DebugRegistry::default();
        let mut ctx = ExtensionContext::new(dir.path(), None);

        let extension = activate(&mut ctx, &registry, &BridgeConfig::default()).unwrap();
        assert!(matches!(
            extension.ready().await,
            Err(SessionError::StartFailed(_))
        ));
        extension.deactivate().await.unwrap();
    }
}
