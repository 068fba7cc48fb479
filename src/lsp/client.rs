//! High-level LSP client
//!
//! Typed wrapper over [`JsonRpcClient`] using `lsp-types` for the handful of
//! messages the bridge exchanges with the language server: the
//! initialize handshake, shutdown/exit, settings and file-change
//! synchronization, and `textDocument/didOpen`.

use crate::io::transport::Transport;
use crate::lsp::error::LspError;
use crate::protocol::jsonrpc::JsonRpcClient;
use lsp_types::notification::{
    DidChangeConfiguration, DidChangeWatchedFiles, DidOpenTextDocument, Exit, Initialized,
    Notification,
};
use lsp_types::request::{Initialize, Request, Shutdown};
use lsp_types::{
    ClientCapabilities, ClientInfo, DidChangeConfigurationParams,
    DidChangeWatchedFilesClientCapabilities, DidChangeWatchedFilesParams,
    DidOpenTextDocumentParams, DynamicRegistrationClientCapabilities, FileEvent,
    InitializeParams, InitializeResult, InitializedParams, ServerCapabilities,
    TextDocumentClientCapabilities, TextDocumentItem, TextDocumentSyncClientCapabilities, Uri,
    WindowClientCapabilities, WorkspaceClientCapabilities, WorkspaceFolder,
};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Convert a filesystem path into an LSP `file://` URI
pub fn file_uri(path: &Path) -> Result<Uri, LspError> {
    let invalid = || LspError::InvalidUri {
        path: path.to_path_buf(),
    };
    let url = url::Url::from_file_path(path).map_err(|_| invalid())?;
    url.as_str().parse::<Uri>().map_err(|_| invalid())
}

/// Build `initialize` parameters for a client named `client_name`
pub fn initialize_params(
    client_name: &str,
    workspace_root: Option<&Path>,
) -> Result<InitializeParams, LspError> {
    let workspace_folders = workspace_root
        .map(|root| -> Result<Vec<WorkspaceFolder>, LspError> {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| root.display().to_string());
            Ok(vec![WorkspaceFolder {
                uri: file_uri(root)?,
                name,
            }])
        })
        .transpose()?;

    #[allow(deprecated)]
    let params = InitializeParams {
        process_id: Some(std::process::id()),
        root_uri: workspace_folders
            .as_ref()
            .and_then(|folders| folders.first())
            .map(|folder| folder.uri.clone()),
        capabilities: ClientCapabilities {
            workspace: Some(WorkspaceClientCapabilities {
                configuration: Some(true),
                workspace_folders: Some(true),
                did_change_configuration: Some(DynamicRegistrationClientCapabilities {
                    dynamic_registration: Some(false),
                }),
                did_change_watched_files: Some(DidChangeWatchedFilesClientCapabilities {
                    dynamic_registration: Some(false),
                    relative_pattern_support: Some(false),
                }),
                ..Default::default()
            }),
            text_document: Some(TextDocumentClientCapabilities {
                synchronization: Some(TextDocumentSyncClientCapabilities {
                    dynamic_registration: Some(false),
                    will_save: Some(false),
                    will_save_wait_until: Some(false),
                    did_save: Some(false),
                }),
                ..Default::default()
            }),
            window: Some(WindowClientCapabilities {
                work_done_progress: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        workspace_folders,
        client_info: Some(ClientInfo {
            name: client_name.to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        ..Default::default()
    };
    Ok(params)
}

/// LSP client over any transport
pub struct LspClient {
    rpc_client: JsonRpcClient,
    initialized: bool,
    server_capabilities: Option<ServerCapabilities>,
    request_timeout: Duration,
}

impl LspClient {
    pub fn new<T: Transport + 'static>(transport: T, request_timeout: Duration) -> Self {
        Self {
            rpc_client: JsonRpcClient::new(transport),
            initialized: false,
            server_capabilities: None,
            request_timeout,
        }
    }

    /// Run the `initialize` request and send `initialized`
    pub async fn initialize(
        &mut self,
        params: InitializeParams,
        timeout: Duration,
    ) -> Result<InitializeResult, LspError> {
        if self.initialized {
            return Err(LspError::Protocol("Client already initialized".to_string()));
        }

        info!("Initializing LSP client");
        let result: InitializeResult = self
            .rpc_client
            .request_with_timeout(Initialize::METHOD, Some(params), timeout)
            .await
            .map_err(LspError::from_rpc)?;

        debug!("LSP server capabilities: {:?}", result.capabilities);
        self.server_capabilities = Some(result.capabilities.clone());

        self.rpc_client
            .notify(Initialized::METHOD, Some(InitializedParams {}))
            .await?;

        self.initialized = true;
        info!("LSP client initialized successfully");
        Ok(result)
    }

    /// `shutdown` request followed by the `exit` notification
    pub async fn shutdown(&mut self) -> Result<(), LspError> {
        if !self.initialized {
            return Ok(());
        }

        info!("Shutting down LSP client");
        // Cleared first so a failed shutdown is not retried from close()
        self.initialized = false;

        let () = self
            .rpc_client
            .request_with_timeout(Shutdown::METHOD, None::<Value>, self.request_timeout)
            .await
            .map_err(LspError::from_rpc)?;
        self.rpc_client.notify(Exit::METHOD, None::<Value>).await?;

        info!("LSP client shutdown complete");
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), LspError> {
        if self.initialized {
            Ok(())
        } else {
            Err(LspError::NotInitialized)
        }
    }

    pub async fn did_change_configuration(&self, settings: Value) -> Result<(), LspError> {
        self.ensure_initialized()?;
        self.rpc_client
            .notify(
                DidChangeConfiguration::METHOD,
                Some(DidChangeConfigurationParams { settings }),
            )
            .await?;
        Ok(())
    }

    pub async fn did_change_watched_files(&self, changes: Vec<FileEvent>) -> Result<(), LspError> {
        self.ensure_initialized()?;
        self.rpc_client
            .notify(
                DidChangeWatchedFiles::METHOD,
                Some(DidChangeWatchedFilesParams { changes }),
            )
            .await?;
        Ok(())
    }

    pub async fn did_open(&self, text_document: TextDocumentItem) -> Result<(), LspError> {
        self.ensure_initialized()?;
        self.rpc_client
            .notify(
                DidOpenTextDocument::METHOD,
                Some(DidOpenTextDocumentParams { text_document }),
            )
            .await?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.server_capabilities.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.rpc_client.is_connected()
    }

    /// Shut down if initialized, then close the connection (the process is left alone)
    pub async fn close(&mut self) -> Result<(), LspError> {
        let shutdown = self.shutdown().await;
        self.rpc_client.close().await?;
        shutdown
    }

    pub fn rpc_client(&self) -> &JsonRpcClient {
        &self.rpc_client
    }
}
