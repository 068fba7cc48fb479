use crate::config::ConfigError;
use crate::debug::DebugError;
use crate::lsp::LspError;
use crate::session::SessionError;

/// Errors surfaced through the extension entry points
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Language session error: {0}")]
    Session(#[from] SessionError),

    #[error("Debug error: {0}")]
    Debug(#[from] DebugError),

    #[error("LSP error: {0}")]
    Lsp(#[from] LspError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
