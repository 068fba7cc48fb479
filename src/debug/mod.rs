//! Debug session routing
//!
//! Resolves Java launch configurations and points the host at a debug
//! adapter that is already listening on a loopback port.

pub mod configuration;
pub mod descriptor;
pub mod registry;

pub use configuration::{
    CLASS_PATH_PLACEHOLDER, DebugConfigurationProvider, JavaConfigurationProvider,
    LaunchConfiguration, WorkspaceFolder,
};
pub use descriptor::{
    DEFAULT_DEBUG_PORT, DebugAdapterDescriptor, DebugAdapterDescriptorFactory,
    DebugAdapterExecutable, DebugEndpoint, DebugSession, ServerDescriptorFactory,
};
pub use registry::{DebugConnection, DebugError, DebugRegistry, Disposable};
