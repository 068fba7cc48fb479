//! Debug Adapter Protocol client
//!
//! DAP shares LSP's `Content-Length` framing but uses its own envelope:
//! every message carries a `seq`, a `type` of `request`, `response` or
//! `event`, and responses point back at the request through `request_seq`.

use crate::io::transport::Transport;
use crate::log_protocol_message;
use crate::protocol::framing::MessageFraming;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Level, debug, error, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DapMessage {
    Request(DapRequest),
    Response(DapResponse),
    Event(DapEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DapRequest {
    pub seq: i64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DapResponse {
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DapEvent {
    pub seq: i64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error("Debug adapter rejected '{command}': {message}")]
    Rejected { command: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Debug adapter did not answer '{command}' within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Debug adapter connection closed")]
    Closed,
}

type PendingResponses = Arc<Mutex<HashMap<i64, oneshot::Sender<DapResponse>>>>;

/// Adapter events kept for [`DapClient::next_event`]; newer events are dropped when full
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// A request that has been written but whose response is still outstanding
pub struct PendingResponse {
    seq: i64,
    command: String,
    receiver: oneshot::Receiver<DapResponse>,
    pending: PendingResponses,
}

impl PendingResponse {
    /// Wait for the matching response; unsuccessful responses become errors
    pub async fn wait(self, timeout: Duration) -> Result<DapResponse, DapError> {
        let response = match tokio::time::timeout(timeout, self.receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(DapError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&self.seq);
                return Err(DapError::Timeout {
                    command: self.command,
                    timeout,
                });
            }
        };

        if !response.success {
            return Err(DapError::Rejected {
                command: response.command,
                message: response.message.unwrap_or_default(),
            });
        }
        Ok(response)
    }
}

/// DAP client: the editor side of a debug-adapter connection
pub struct DapClient {
    outbound_sender: Option<mpsc::UnboundedSender<String>>,
    seq: Arc<AtomicI64>,
    pending: PendingResponses,
    events: Mutex<mpsc::Receiver<DapEvent>>,
    request_timeout: Duration,
    io_task: Option<JoinHandle<()>>,
}

impl DapClient {
    pub fn new<T: Transport + 'static>(transport: T, request_timeout: Duration) -> Self {
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let pending: PendingResponses = Arc::new(Mutex::new(HashMap::new()));
        let seq = Arc::new(AtomicI64::new(1));

        let io_task = tokio::spawn(Self::io_loop(
            MessageFraming::new(transport),
            outbound_receiver,
            Arc::clone(&pending),
            event_sender,
            Arc::clone(&seq),
        ));

        Self {
            outbound_sender: Some(outbound_sender),
            seq,
            pending,
            events: Mutex::new(event_receiver),
            request_timeout,
            io_task: Some(io_task),
        }
    }

    async fn io_loop<T: Transport + 'static>(
        mut framed: MessageFraming<T>,
        mut outbound: mpsc::UnboundedReceiver<String>,
        pending: PendingResponses,
        events: mpsc::Sender<DapEvent>,
        seq: Arc<AtomicI64>,
    ) {
        loop {
            tokio::select! {
                biased;

                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = framed.send(&message).await {
                        error!("Failed to write to debug adapter: {}", e);
                        break;
                    }
                }
                inbound = framed.receive() => {
                    let message = match inbound {
                        Ok(message) => message,
                        Err(e) => {
                            debug!("DapClient: receive loop ended: {}", e);
                            break;
                        }
                    };
                    match serde_json::from_str::<DapMessage>(&message) {
                        Ok(DapMessage::Response(response)) => {
                            log_protocol_message!(Level::DEBUG, "dap", "incoming", response.command.as_str(), &response.body);
                            match pending.lock().await.remove(&response.request_seq) {
                                Some(sender) => {
                                    let _ = sender.send(response);
                                }
                                None => debug!("Response for unknown request_seq {}", response.request_seq),
                            }
                        }
                        Ok(DapMessage::Event(event)) => {
                            log_protocol_message!(Level::DEBUG, "dap", "incoming", event.event.as_str(), &event.body);
                            if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
                                trace!("DapClient: event queue full, dropping '{}'", event.event);
                            }
                        }
                        Ok(DapMessage::Request(request)) => {
                            // Reverse requests (runInTerminal, startDebugging) are not supported
                            let reply = DapMessage::Response(DapResponse {
                                seq: seq.fetch_add(1, Ordering::SeqCst),
                                request_seq: request.seq,
                                success: false,
                                command: request.command.clone(),
                                message: Some(format!("'{}' is not supported", request.command)),
                                body: None,
                            });
                            let sent = match serde_json::to_string(&reply) {
                                Ok(json) => framed.send(&json).await.is_ok(),
                                Err(_) => false,
                            };
                            if !sent {
                                warn!("Failed to reject reverse request '{}'", request.command);
                            }
                        }
                        Err(e) => warn!("Dropping unparseable adapter message ({}): {}", e, message),
                    }
                }
            }
        }

        let _ = framed.close().await;
        pending.lock().await.clear();
        trace!("DapClient: I/O task finished");
    }

    /// Write a request without waiting for its response
    pub async fn send_request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<PendingResponse, DapError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let message = DapMessage::Request(DapRequest {
            seq,
            command: command.to_string(),
            arguments,
        });
        let json = serde_json::to_string(&message)?;

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(seq, sender);

        log_protocol_message!(Level::DEBUG, "dap", "outgoing", command, seq);
        let enqueued = self
            .outbound_sender
            .as_ref()
            .is_some_and(|outbound| outbound.send(json).is_ok());
        if !enqueued {
            self.pending.lock().await.remove(&seq);
            return Err(DapError::Transport("Outbound channel closed".to_string()));
        }

        Ok(PendingResponse {
            seq,
            command: command.to_string(),
            receiver,
            pending: Arc::clone(&self.pending),
        })
    }

    pub async fn request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<DapResponse, DapError> {
        self.send_request(command, arguments)
            .await?
            .wait(self.request_timeout)
            .await
    }

    /// `initialize` request; returns the adapter capabilities
    pub async fn initialize(&self, client_id: &str, adapter_id: &str) -> Result<Value, DapError> {
        let arguments = json!({
            "clientID": client_id,
            "clientName": client_id,
            "adapterID": adapter_id,
            "pathFormat": "path",
            "linesStartAt1": true,
            "columnsStartAt1": true,
            "supportsRunInTerminalRequest": false,
        });
        let response = self.request("initialize", Some(arguments)).await?;
        Ok(response.body.unwrap_or(Value::Null))
    }

    /// Next adapter event, waiting at most `timeout`
    pub async fn next_event(&self, timeout: Duration) -> Option<DapEvent> {
        let mut events = self.events.lock().await;
        tokio::time::timeout(timeout, events.recv()).await.ok().flatten()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Requests written but not yet answered
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn close(&mut self) {
        self.outbound_sender.take();
        if let Some(mut task) = self.io_task.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }
}

impl Drop for DapClient {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
    }
}
