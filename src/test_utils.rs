//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and in-process stand-ins
//! for the two external processes: a fake language server reached over an
//! in-memory pipe and a fake debug adapter listening on a loopback port.

use crate::io::transport::{StreamTransport, Transport};
use crate::io::{ProcessExitEvent, ProcessExitHandler};
use crate::lsp::{OutputChannel, OutputLevel, ServerOptions};
use crate::protocol::framing::MessageFraming;
use crate::session::{LaunchedServer, ServerLauncher, SessionError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Test logging utilities
#[cfg(feature = "test-logging")]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, writes through the test writer so output is
    /// captured per test.
    ///
    /// ```bash
    /// RUST_LOG=nbjava_bridge::session=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok(); // Ignore errors if already initialized by another test
        });
    }
}

/// Poll `check` until it yields a value or `timeout` elapses
pub async fn eventually<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Framed peer
// ============================================================================

/// The far end of an in-memory connection, exchanging whole JSON messages
pub struct FramedPeer {
    framed: MessageFraming<StreamTransport>,
}

impl FramedPeer {
    /// A client-side transport and the peer connected to it
    pub fn pair() -> (StreamTransport, FramedPeer) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (near_reader, near_writer) = tokio::io::split(near);
        let (far_reader, far_writer) = tokio::io::split(far);

        let transport = StreamTransport::new(near_reader, near_writer);
        let peer = FramedPeer {
            framed: MessageFraming::new(StreamTransport::new(far_reader, far_writer)),
        };
        (transport, peer)
    }

    pub fn from_transport(transport: StreamTransport) -> Self {
        Self {
            framed: MessageFraming::new(transport),
        }
    }

    /// Next message, or `None` once the other side hung up
    pub async fn next(&mut self) -> Option<Value> {
        let message = self.framed.receive().await.ok()?;
        serde_json::from_str(&message).ok()
    }

    pub async fn send(&mut self, message: Value) {
        let _ = self.framed.send(&message.to_string()).await;
    }
}

// ============================================================================
// Fake language server
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FakeServerBehavior {
    /// Delay before answering `initialize`
    pub initialize_delay: Duration,
    /// Answer `initialize` with an error
    pub fail_initialize: bool,
    /// Never answer `shutdown`
    pub ignore_shutdown: bool,
    /// Messages pushed to the client right after `initialized`
    pub after_initialized: Vec<Value>,
}

/// Records everything it receives; clones share the record
#[derive(Debug, Clone, Default)]
pub struct FakeLanguageServer {
    behavior: FakeServerBehavior,
    received: Arc<Mutex<Vec<Value>>>,
}

impl FakeLanguageServer {
    pub fn new(behavior: FakeServerBehavior) -> Self {
        Self {
            behavior,
            received: Arc::default(),
        }
    }

    /// Start serving a fresh connection; returns the client side
    pub fn connect(&self) -> StreamTransport {
        let (transport, peer) = FramedPeer::pair();
        tokio::spawn(self.clone().serve(peer));
        transport
    }

    async fn serve(self, mut peer: FramedPeer) {
        while let Some(message) = peer.next().await {
            self.received.lock().unwrap().push(message.clone());

            let method = message["method"].as_str().unwrap_or_default().to_string();
            let id = message.get("id").cloned();
            match (method.as_str(), id) {
                ("initialize", Some(id)) => {
                    tokio::time::sleep(self.behavior.initialize_delay).await;
                    let reply = if self.behavior.fail_initialize {
                        json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32603, "message": "initialization failed"}})
                    } else {
                        json!({"jsonrpc": "2.0", "id": id, "result": {
                            "capabilities": {"textDocumentSync": 1},
                            "serverInfo": {"name": "fake-java-server"}
                        }})
                    };
                    peer.send(reply).await;
                }
                ("initialized", None) => {
                    for pushed in &self.behavior.after_initialized {
                        peer.send(pushed.clone()).await;
                    }
                }
                ("shutdown", Some(_)) if self.behavior.ignore_shutdown => {}
                ("exit", None) => break,
                ("", _) => {} // a response to one of our pushed requests
                (_, Some(id)) => {
                    peer.send(json!({"jsonrpc": "2.0", "id": id, "result": null}))
                        .await;
                }
                (_, None) => {}
            }
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m["method"].as_str().map(str::to_string))
            .collect()
    }

    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Option<Value>
    where
        F: Fn(&Value) -> bool,
    {
        eventually(timeout, || self.received().into_iter().find(|m| predicate(m))).await
    }

    pub async fn wait_for_method(&self, method: &str, timeout: Duration) -> Option<Value> {
        self.wait_for(timeout, |m| m["method"] == method).await
    }
}

/// Launches [`FakeLanguageServer`] connections instead of processes
#[derive(Default)]
pub struct FakeServerLauncher {
    pub server: FakeLanguageServer,
    launched: Mutex<Vec<ServerOptions>>,
    fail_with: Option<String>,
    on_exit: Mutex<Option<Arc<dyn ProcessExitHandler>>>,
}

impl FakeServerLauncher {
    pub fn new(server: FakeLanguageServer) -> Self {
        Self {
            server,
            ..Self::default()
        }
    }

    /// A launcher whose every launch fails like a missing executable
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn launches(&self) -> Vec<ServerOptions> {
        self.launched.lock().unwrap().clone()
    }

    /// Report an exit of the most recently launched server
    pub async fn exit(&self, code: i32) {
        let handler = self.on_exit.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler
                .on_process_exit(ProcessExitEvent {
                    pid: None,
                    code: Some(code),
                })
                .await;
        }
    }
}

#[async_trait]
impl ServerLauncher for FakeServerLauncher {
    async fn launch(
        &self,
        options: &ServerOptions,
        output: &OutputChannel,
        on_exit: Arc<dyn ProcessExitHandler>,
    ) -> Result<LaunchedServer, SessionError> {
        self.launched.lock().unwrap().push(options.clone());
        *self.on_exit.lock().unwrap() = Some(on_exit);
        if let Some(message) = &self.fail_with {
            return Err(SessionError::Launch(crate::io::ProcessError::Spawn {
                command: options.command.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, message.clone()),
            }));
        }
        output.append(OutputLevel::Info, "fake server started");
        Ok(LaunchedServer::detached(self.server.connect()))
    }
}

// ============================================================================
// Fake debug adapter
// ============================================================================

/// DAP server on a loopback port that accepts any launch or attach
///
/// Like real adapters it holds the `launch`/`attach` response until
/// `configurationDone` arrives.
pub struct FakeDebugAdapter {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl FakeDebugAdapter {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<Value>>> = Arc::default();

        let recorded = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (reader, writer) = socket.into_split();
                let peer = FramedPeer::from_transport(StreamTransport::new(reader, writer));
                tokio::spawn(Self::serve(peer, Arc::clone(&recorded)));
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    async fn serve(mut peer: FramedPeer, requests: Arc<Mutex<Vec<Value>>>) {
        let mut seq = 0;
        let mut held_launch: Option<Value> = None;
        let mut next_seq = move || {
            seq += 1;
            seq
        };

        while let Some(request) = peer.next().await {
            requests.lock().unwrap().push(request.clone());
            let command = request["command"].as_str().unwrap_or_default().to_string();
            let response = |seq: i64, body: Value| {
                json!({
                    "seq": seq, "type": "response", "request_seq": request["seq"],
                    "success": true, "command": command, "body": body
                })
            };

            match command.as_str() {
                "initialize" => {
                    let reply = response(next_seq(), json!({"supportsConfigurationDoneRequest": true}));
                    peer.send(reply).await;
                    peer.send(json!({"seq": next_seq(), "type": "event", "event": "initialized"}))
                        .await;
                }
                "launch" | "attach" => held_launch = Some(response(next_seq(), json!({}))),
                "configurationDone" => {
                    peer.send(response(next_seq(), json!({}))).await;
                    if let Some(launch) = held_launch.take() {
                        peer.send(launch).await;
                    }
                }
                "disconnect" => {
                    peer.send(response(next_seq(), json!({}))).await;
                    break;
                }
                _ => peer.send(response(next_seq(), json!({}))).await,
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.requests()
            .iter()
            .filter_map(|r| r["command"].as_str().map(str::to_string))
            .collect()
    }

    pub fn request(&self, command: &str) -> Option<Value> {
        self.requests().into_iter().find(|r| r["command"] == command)
    }
}

impl Drop for FakeDebugAdapter {
    fn drop(&mut self) {
        self.task.abort();
    }
}
