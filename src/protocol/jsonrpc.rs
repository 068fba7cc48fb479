//! JSON-RPC 2.0 protocol layer
//!
//! Request/response correlation, notification dispatch and answering
//! server-initiated requests, on top of a framed transport.

use crate::io::transport::Transport;
use crate::log_protocol_message;
use crate::protocol::framing::MessageFraming;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Level, debug, error, trace, warn};

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// Default timeout for requests issued with [`JsonRpcClient::request`]
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `close` waits for queued outbound messages to flush
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// JSON-RPC Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC error codes as defined in the specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JsonRpcErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: JsonRpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcErrorObject {
                code: code as i32,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error(
            id,
            JsonRpcErrorCode::MethodNotFound,
            format!("Method not found: {method}"),
        )
    }
}

/// Inbound message, classified by which members are present
#[derive(Debug)]
enum Inbound {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

impl Inbound {
    fn parse(message: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(message)?;
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some_and(|id| !id.is_null());

        Ok(match (has_method, has_id) {
            (true, true) => Inbound::Request(serde_json::from_value(value)?),
            (true, false) => Inbound::Notification(serde_json::from_value(value)?),
            (false, _) => Inbound::Response(serde_json::from_value(value)?),
        })
    }
}

// ============================================================================
// JSON-RPC Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    #[error("JSON-RPC server error ({code}): {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),

    #[error("Request timeout: {method}")]
    Timeout { method: String },

    #[error("Request was cancelled")]
    RequestCancelled,
}

// ============================================================================
// JSON-RPC Client
// ============================================================================

type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;
type RequestHandler = Arc<dyn Fn(JsonRpcRequest) -> JsonRpcResponse + Send + Sync>;
type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// JSON-RPC client with request/response correlation
///
/// A background task owns the framed transport. It writes queued outbound
/// messages in order, routes responses to waiting callers and answers
/// server-initiated requests through the installed request handler.
pub struct JsonRpcClient {
    outbound_sender: Option<mpsc::UnboundedSender<String>>,
    request_id: AtomicU64,
    pending_requests: PendingRequests,
    notification_handler: Arc<Mutex<Option<NotificationHandler>>>,
    request_handler: Arc<Mutex<Option<RequestHandler>>>,
    io_task: Option<JoinHandle<()>>,
}

impl JsonRpcClient {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel::<String>();
        let pending_requests: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let notification_handler = Arc::new(Mutex::new(None::<NotificationHandler>));
        let request_handler = Arc::new(Mutex::new(None::<RequestHandler>));

        let io_task = tokio::spawn(Self::io_loop(
            MessageFraming::new(transport),
            outbound_receiver,
            Arc::clone(&pending_requests),
            Arc::clone(&notification_handler),
            Arc::clone(&request_handler),
        ));

        Self {
            outbound_sender: Some(outbound_sender),
            request_id: AtomicU64::new(1),
            pending_requests,
            notification_handler,
            request_handler,
            io_task: Some(io_task),
        }
    }

    async fn io_loop<T: Transport + 'static>(
        mut framed: MessageFraming<T>,
        mut outbound: mpsc::UnboundedReceiver<String>,
        pending: PendingRequests,
        notification_handler: Arc<Mutex<Option<NotificationHandler>>>,
        request_handler: Arc<Mutex<Option<RequestHandler>>>,
    ) {
        loop {
            tokio::select! {
                biased;

                message = outbound.recv() => {
                    let Some(message) = message else {
                        trace!("JsonRpcClient: outbound channel closed");
                        break;
                    };
                    if let Err(e) = framed.send(&message).await {
                        error!("Failed to send message: {}", e);
                        break;
                    }
                }
                inbound = framed.receive() => {
                    let message = match inbound {
                        Ok(message) => message,
                        Err(e) => {
                            debug!("JsonRpcClient: receive loop ended: {}", e);
                            break;
                        }
                    };
                    let reply = Self::dispatch(
                        &message,
                        &pending,
                        &notification_handler,
                        &request_handler,
                    )
                    .await;
                    if let Some(reply) = reply {
                        if let Err(e) = framed.send(&reply).await {
                            error!("Failed to answer server request: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        let _ = framed.close().await;
        // Wake up callers still waiting on a response
        pending.lock().await.clear();
        trace!("JsonRpcClient: I/O task finished");
    }

    /// Route one inbound message; returns a reply to send for server requests
    async fn dispatch(
        message: &str,
        pending: &PendingRequests,
        notification_handler: &Arc<Mutex<Option<NotificationHandler>>>,
        request_handler: &Arc<Mutex<Option<RequestHandler>>>,
    ) -> Option<String> {
        match Inbound::parse(message) {
            Ok(Inbound::Response(response)) => {
                log_protocol_message!(Level::TRACE, "lsp", "incoming", "response", &response.id);
                let Some(id) = response.id.as_u64() else {
                    warn!("Response with non-numeric id: {}", response.id);
                    return None;
                };
                match pending.lock().await.remove(&id) {
                    Some(sender) => {
                        let _ = sender.send(response);
                    }
                    None => debug!("Received response for unknown request {}", id),
                }
                None
            }
            Ok(Inbound::Notification(notification)) => {
                log_protocol_message!(Level::DEBUG, "lsp", "incoming", notification.method.as_str(), &notification.params);
                let handler = notification_handler.lock().await.clone();
                if let Some(handler) = handler {
                    handler(notification);
                }
                None
            }
            Ok(Inbound::Request(request)) => {
                log_protocol_message!(Level::DEBUG, "lsp", "incoming", request.method.as_str(), &request.params);
                let handler = request_handler.lock().await.clone();
                let response = match handler {
                    Some(handler) => handler(request),
                    None => JsonRpcResponse::method_not_found(request.id, &request.method),
                };
                match serde_json::to_string(&response) {
                    Ok(json) => Some(json),
                    Err(e) => {
                        error!("Failed to serialize reply to server request: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("Dropping unparseable message ({}): {}", e, message);
                None
            }
        }
    }

    pub async fn on_notification<F>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) + Send + Sync + 'static,
    {
        *self.notification_handler.lock().await = Some(Arc::new(handler));
    }

    pub async fn on_request<F>(&self, handler: F)
    where
        F: Fn(JsonRpcRequest) -> JsonRpcResponse + Send + Sync + 'static,
    {
        *self.request_handler.lock().await = Some(Arc::new(handler));
    }

    fn enqueue(&self, message: String) -> Result<(), JsonRpcError> {
        self.outbound_sender
            .as_ref()
            .ok_or_else(|| JsonRpcError::Transport("Client closed".to_string()))?
            .send(message)
            .map_err(|_| JsonRpcError::Transport("Outbound channel closed".to_string()))
    }

    /// `None` and `null` params are both omitted from the message
    fn encode_params<P: Serialize>(params: Option<P>) -> Result<Option<Value>, JsonRpcError> {
        let value = params
            .map(|p| serde_json::to_value(p).map_err(JsonRpcError::Serialization))
            .transpose()?;
        Ok(value.filter(|v| !v.is_null()))
    }

    /// Send a request with [`DEFAULT_REQUEST_TIMEOUT`]
    pub async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R, JsonRpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.request_with_timeout(method, params, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    pub async fn request_with_timeout<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        timeout: Duration,
    ) -> Result<R, JsonRpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params: Self::encode_params(params)?,
        };
        let request_json = serde_json::to_string(&request).map_err(JsonRpcError::Serialization)?;

        let (response_sender, response_receiver) = oneshot::channel();
        self.pending_requests
            .lock()
            .await
            .insert(id, response_sender);

        log_protocol_message!(Level::DEBUG, "lsp", "outgoing", method, &request.params);
        if let Err(e) = self.enqueue(request_json) {
            self.pending_requests.lock().await.remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, response_receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(JsonRpcError::RequestCancelled),
            Err(_) => {
                self.pending_requests.lock().await.remove(&id);
                return Err(JsonRpcError::Timeout {
                    method: method.to_string(),
                });
            }
        };

        if let Some(error) = response.error {
            return Err(JsonRpcError::Server {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        // An absent result and `null` both deserialize as null (e.g. shutdown)
        serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(JsonRpcError::Deserialization)
    }

    pub async fn notify<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
    ) -> Result<(), JsonRpcError> {
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: Self::encode_params(params)?,
        };
        let json = serde_json::to_string(&notification).map_err(JsonRpcError::Serialization)?;

        log_protocol_message!(Level::DEBUG, "lsp", "outgoing", method, &notification.params);
        self.enqueue(json)
    }

    pub fn is_connected(&self) -> bool {
        self.outbound_sender
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Flush queued messages, then stop the I/O task and drop the transport
    pub async fn close(&mut self) -> Result<(), JsonRpcError> {
        self.outbound_sender.take();

        if let Some(mut task) = self.io_task.take() {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                debug!("JsonRpcClient: I/O task still running after flush, aborting");
                task.abort();
            }
        }

        self.pending_requests.lock().await.clear();
        Ok(())
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
    }
}
