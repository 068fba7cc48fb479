//! Bridge configuration
//!
//! [`BridgeConfig`] gathers everything that is fixed for one extension
//! instance: client identity, synchronization scope, server bundle layout,
//! the debug endpoint and protocol timeouts. Built through
//! [`BridgeConfigBuilder`], which validates, and optionally seeded from the
//! environment.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::debug::descriptor::{DEFAULT_DEBUG_PORT, DebugEndpoint};
use crate::locator::ServerBundle;
use crate::lsp::{ClientOptions, LspError};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default timeout for the initialize handshake (30 seconds)
///
/// The NetBeans server loads its module system and scans the workspace
/// before answering `initialize`.
pub const DEFAULT_INITIALIZATION_TIMEOUT_SECS: u64 = 30;

/// Default timeout for individual LSP requests (10 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default wait between SIGTERM and SIGKILL when stopping the server
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Maximum allowed initialization timeout (5 minutes)
pub const MAX_INITIALIZATION_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_LANGUAGE_ID: &str = "java";
pub const DEFAULT_CLIENT_NAME: &str = "NetBeans Java";
pub const DEFAULT_FILE_EVENT_GLOB: &str = "**/*.java";
pub const DEFAULT_OUTPUT_CHANNEL_NAME: &str = "Java";

/// Debug adapter port override
pub const ENV_DEBUG_PORT: &str = "NBJAVA_DEBUG_PORT";

/// Explicit server executable, bypassing the bundle layout
pub const ENV_SERVER_PATH: &str = "NBJAVA_SERVER_PATH";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration field '{field}' cannot be empty")]
    EmptyField { field: &'static str },

    #[error("Invalid debug port '{value}': {reason}")]
    InvalidPort { value: String, reason: String },

    #[error("Invalid file-watch glob '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },

    #[error("Invalid path: {path} - {reason}")]
    InvalidPath { path: String, reason: String },
}

impl ConfigError {
    fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Core Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Language id used for the document selector and the debugger type
    pub language_id: String,

    /// Human-readable client name sent in `clientInfo`
    pub client_name: String,

    /// Settings namespace synchronized with the server
    pub settings_section: String,

    pub file_event_glob: String,

    pub output_channel_name: String,

    pub server_bundle: ServerBundle,

    /// When set, used instead of the bundled server
    pub server_path: Option<PathBuf>,

    pub debug_host: IpAddr,
    pub debug_port: u16,

    pub initialization_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            language_id: DEFAULT_LANGUAGE_ID.to_string(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            settings_section: DEFAULT_LANGUAGE_ID.to_string(),
            file_event_glob: DEFAULT_FILE_EVENT_GLOB.to_string(),
            output_channel_name: DEFAULT_OUTPUT_CHANNEL_NAME.to_string(),
            server_bundle: ServerBundle::default(),
            server_path: None,
            debug_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            debug_port: DEFAULT_DEBUG_PORT,
            initialization_timeout: Duration::from_secs(DEFAULT_INITIALIZATION_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl BridgeConfig {
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::new()
    }

    /// Defaults plus `NBJAVA_DEBUG_PORT` / `NBJAVA_SERVER_PATH`
    pub fn from_env() -> Result<Self, ConfigError> {
        BridgeConfigBuilder::new().apply_env()?.build()
    }

    pub fn debug_endpoint(&self) -> DebugEndpoint {
        DebugEndpoint::new(self.debug_host, self.debug_port)
    }

    pub fn client_options(&self) -> Result<ClientOptions, LspError> {
        let mut options = ClientOptions::for_language(
            &self.language_id,
            &self.file_event_glob,
            &self.output_channel_name,
        )?;
        options.synchronize.configuration_section = self.settings_section.clone();
        Ok(options)
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

#[derive(Debug, Default)]
pub struct BridgeConfigBuilder {
    language_id: Option<String>,
    client_name: Option<String>,
    settings_section: Option<String>,
    file_event_glob: Option<String>,
    output_channel_name: Option<String>,
    server_bundle: Option<ServerBundle>,
    server_path: Option<PathBuf>,
    debug_host: Option<IpAddr>,
    debug_port: Option<u16>,
    initialization_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
}

impl BridgeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the language id; the settings section follows unless set explicitly
    pub fn language_id(mut self, id: impl Into<String>) -> Self {
        self.language_id = Some(id.into());
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn settings_section(mut self, section: impl Into<String>) -> Self {
        self.settings_section = Some(section.into());
        self
    }

    pub fn file_event_glob(mut self, glob: impl Into<String>) -> Self {
        self.file_event_glob = Some(glob.into());
        self
    }

    pub fn output_channel_name(mut self, name: impl Into<String>) -> Self {
        self.output_channel_name = Some(name.into());
        self
    }

    pub fn server_bundle(mut self, bundle: ServerBundle) -> Self {
        self.server_bundle = Some(bundle);
        self
    }

    pub fn server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_path = Some(path.into());
        self
    }

    pub fn debug_host(mut self, host: IpAddr) -> Self {
        self.debug_host = Some(host);
        self
    }

    pub fn debug_port(mut self, port: u16) -> Self {
        self.debug_port = Some(port);
        self
    }

    pub fn initialization_timeout(mut self, timeout: Duration) -> Self {
        self.initialization_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Apply overrides from the process environment
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_lookup<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DEBUG_PORT) {
            self.debug_port = Some(parse_port(&value)?);
        }
        if let Some(value) = lookup(ENV_SERVER_PATH).filter(|v| !v.is_empty()) {
            self.server_path = Some(PathBuf::from(value));
        }
        Ok(self)
    }

    pub fn build(self) -> Result<BridgeConfig, ConfigError> {
        let default = BridgeConfig::default();
        let language_id = self.language_id.unwrap_or(default.language_id);

        let config = BridgeConfig {
            settings_section: self.settings_section.unwrap_or_else(|| language_id.clone()),
            language_id,
            client_name: self.client_name.unwrap_or(default.client_name),
            file_event_glob: self.file_event_glob.unwrap_or(default.file_event_glob),
            output_channel_name: self
                .output_channel_name
                .unwrap_or(default.output_channel_name),
            server_bundle: self.server_bundle.unwrap_or(default.server_bundle),
            server_path: self.server_path,
            debug_host: self.debug_host.unwrap_or(default.debug_host),
            debug_port: self.debug_port.unwrap_or(default.debug_port),
            initialization_timeout: self
                .initialization_timeout
                .unwrap_or(default.initialization_timeout),
            request_timeout: self.request_timeout.unwrap_or(default.request_timeout),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(default.shutdown_timeout),
        };

        Self::validate_identifiers(&config)?;
        Self::validate_glob(&config.file_event_glob)?;
        Self::validate_server_path(&config)?;
        Self::validate_timeouts(&config)?;
        if config.debug_port == 0 {
            return Err(ConfigError::InvalidPort {
                value: "0".to_string(),
                reason: "Port must be between 1 and 65535".to_string(),
            });
        }

        Ok(config)
    }

    fn validate_identifiers(config: &BridgeConfig) -> Result<(), ConfigError> {
        let fields = [
            ("language_id", &config.language_id),
            ("client_name", &config.client_name),
            ("settings_section", &config.settings_section),
            ("output_channel_name", &config.output_channel_name),
            ("server_bundle.subdir", &config.server_bundle.subdir),
            ("server_bundle.executable", &config.server_bundle.executable),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyField { field });
            }
        }
        Ok(())
    }

    fn validate_glob(pattern: &str) -> Result<(), ConfigError> {
        globset::Glob::new(pattern)
            .map(|_| ())
            .map_err(|e| ConfigError::InvalidGlob {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    fn validate_server_path(config: &BridgeConfig) -> Result<(), ConfigError> {
        // Existence is not checked; a missing executable is a spawn error later
        let Some(path) = &config.server_path else {
            return Ok(());
        };
        if path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidPath {
                path: String::new(),
                reason: "Server path cannot be empty".to_string(),
            });
        }
        if path.to_string_lossy().contains('\0') {
            return Err(ConfigError::InvalidPath {
                path: path.display().to_string(),
                reason: "Server path contains null character".to_string(),
            });
        }
        Ok(())
    }

    fn validate_timeouts(config: &BridgeConfig) -> Result<(), ConfigError> {
        let named = [
            ("Initialization", config.initialization_timeout),
            ("Request", config.request_timeout),
            ("Shutdown", config.shutdown_timeout),
        ];
        for (name, timeout) in named {
            if timeout.is_zero() {
                return Err(ConfigError::invalid_timeout(
                    timeout,
                    format!("{name} timeout must be greater than zero"),
                ));
            }
        }

        if config.initialization_timeout > Duration::from_secs(MAX_INITIALIZATION_TIMEOUT_SECS) {
            return Err(ConfigError::invalid_timeout(
                config.initialization_timeout,
                "Initialization timeout too long (max 5 minutes)",
            ));
        }
        Ok(())
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidPort {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    match value.trim().parse::<u16>() {
        Ok(0) => Err(invalid("Port must be between 1 and 65535")),
        Ok(port) => Ok(port),
        Err(_) => Err(invalid("Not a valid port number")),
    }
}
