//! Bridge between an editor extension host and the NetBeans Java tooling
//!
//! Locates the bundled `nb-java-lsp-server`, runs one LSP client session
//! against it, and routes Java debug sessions to an adapter already listening
//! on a loopback port.

pub mod config;
pub mod debug;
pub mod error;
pub mod extension;
pub mod io;
pub mod locator;
pub mod logging;
pub mod lsp;
pub mod protocol;
pub mod session;

#[cfg(test)]
mod test_utils;

pub use config::{BridgeConfig, BridgeConfigBuilder, ConfigError};
pub use error::BridgeError;
pub use extension::{Extension, ExtensionContext, activate, activate_with_launcher};
