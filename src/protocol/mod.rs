//! Wire protocols spoken with the external processes
//!
//! - **framing**: `Content-Length` headers, shared by LSP and DAP
//! - **jsonrpc**: JSON-RPC 2.0 correlation for the language server
//! - **dap**: the Debug Adapter Protocol envelope for the debugger

pub mod dap;
pub mod framing;
pub mod jsonrpc;

pub use dap::{DapClient, DapError, DapEvent, DapResponse};
pub use framing::{FramingError, MessageFraming};
pub use jsonrpc::{
    JsonRpcClient, JsonRpcError, JsonRpcErrorCode, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse,
};
