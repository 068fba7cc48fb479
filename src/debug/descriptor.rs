//! Debug adapter descriptors
//!
//! A descriptor tells the host how to reach a debug adapter: spawn an
//! executable, or connect to a server that is already listening. The Java
//! factory always answers with the same loopback endpoint and never starts
//! or probes anything.

use crate::debug::configuration::LaunchConfiguration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use uuid::Uuid;

/// Port the Java debug adapter listens on unless configured otherwise
pub const DEFAULT_DEBUG_PORT: u16 = 10001;

/// A fixed host/port pair where a debug adapter is assumed to be listening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DebugEndpoint {
    pub host: IpAddr,
    pub port: u16,
}

impl DebugEndpoint {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    pub fn loopback(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for DebugEndpoint {
    fn default() -> Self {
        Self::loopback(DEFAULT_DEBUG_PORT)
    }
}

impl fmt::Display for DebugEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Adapter launched as a child process speaking DAP on stdio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugAdapterExecutable {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl DebugAdapterExecutable {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugAdapterDescriptor {
    /// Connect to an adapter already listening at the endpoint
    Server(DebugEndpoint),
    /// Spawn the adapter
    Executable(DebugAdapterExecutable),
}

/// One debug session as seen by the host
#[derive(Debug, Clone)]
pub struct DebugSession {
    pub id: Uuid,
    pub name: String,
    pub debug_type: String,
    pub configuration: LaunchConfiguration,
}

impl DebugSession {
    pub fn new(configuration: LaunchConfiguration) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: configuration.name().unwrap_or_default().to_string(),
            debug_type: configuration.debug_type().unwrap_or_default().to_string(),
            configuration,
        }
    }
}

/// Decides how the host reaches the adapter for a session
pub trait DebugAdapterDescriptorFactory: Send + Sync {
    fn create_debug_adapter_descriptor(
        &self,
        session: &DebugSession,
        executable: Option<&DebugAdapterExecutable>,
    ) -> DebugAdapterDescriptor;
}

/// Always points at one pre-existing adapter server
#[derive(Debug, Clone, Default)]
pub struct ServerDescriptorFactory {
    endpoint: DebugEndpoint,
}

impl ServerDescriptorFactory {
    pub fn new(endpoint: DebugEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> DebugEndpoint {
        self.endpoint
    }
}

impl DebugAdapterDescriptorFactory for ServerDescriptorFactory {
    fn create_debug_adapter_descriptor(
        &self,
        _session: &DebugSession,
        _executable: Option<&DebugAdapterExecutable>,
    ) -> DebugAdapterDescriptor {
        DebugAdapterDescriptor::Server(self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(config: serde_json::Value) -> DebugSession {
        DebugSession::new(serde_json::from_value(config).unwrap())
    }

    #[test]
    fn test_default_endpoint_is_loopback_10001() {
        let endpoint = DebugEndpoint::default();
        assert_eq!(endpoint.to_string(), "127.0.0.1:10001");
        assert!(endpoint.host.is_loopback());
    }

    #[test]
    fn test_factory_ignores_session_and_executable() {
        let factory = ServerDescriptorFactory::default();
        let launch = session(json!({"type": "java", "name": "Run", "request": "launch"}));
        let attach = session(json!({"type": "java", "name": "Attach", "request": "attach", "port": 5005}));
        let exe = DebugAdapterExecutable::new("/usr/bin/java-debug");

        let expected = DebugAdapterDescriptor::Server(DebugEndpoint::loopback(10001));
        assert_eq!(factory.create_debug_adapter_descriptor(&launch, None), expected);
        assert_eq!(factory.create_debug_adapter_descriptor(&attach, Some(&exe)), expected);
        assert_eq!(factory.create_debug_adapter_descriptor(&launch, None), expected);
    }

    #[test]
    fn test_configured_port() {
        let factory = ServerDescriptorFactory::new(DebugEndpoint::loopback(4711));
        let descriptor = factory.create_debug_adapter_descriptor(&session(json!({})), None);
        assert_eq!(
            descriptor,
            DebugAdapterDescriptor::Server(DebugEndpoint::loopback(4711))
        );
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let a = session(json!({"type": "java", "name": "Run"}));
        let b = session(json!({"type": "java", "name": "Run"}));
        assert_ne!(a.id, b.id);
        assert_eq!(a.debug_type, "java");
        assert_eq!(a.name, "Run");
    }
}
