use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::jsonrpc::JsonRpcError;

#[derive(Error, Debug)]
pub enum LspError {
    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("LSP client not initialized")]
    NotInitialized,

    #[error("LSP protocol error: {0}")]
    Protocol(String),

    #[error(
        "LSP request timeout: {method} - consider using a longer timeout or checking server responsiveness"
    )]
    RequestTimeout { method: String },

    #[error("Invalid file-watch glob '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("Path cannot be expressed as a file URI: {path}")]
    InvalidUri { path: PathBuf },
}

impl LspError {
    /// Lift a JSON-RPC error, turning timeouts into [`LspError::RequestTimeout`]
    pub fn from_rpc(error: JsonRpcError) -> Self {
        match error {
            JsonRpcError::Timeout { method } => LspError::RequestTimeout { method },
            other => LspError::JsonRpc(other),
        }
    }
}
