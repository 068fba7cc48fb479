//! Language-server client building blocks
//!
//! `client` speaks LSP over a transport, `options` describes what the client
//! is responsible for, `output` collects what the server prints.

pub mod client;
pub mod error;
pub mod options;
pub mod output;

pub use client::{LspClient, file_uri, initialize_params};
pub use error::LspError;
pub use options::{
    ClientOptions, DocumentFilter, DocumentSelector, FileEventFilter, RevealOutputChannelOn,
    ServerOptions, SynchronizeOptions,
};
pub use output::{OutputChannel, OutputLevel, OutputLine};
