//! Transport layer - Pure I/O abstraction for message exchange
//!
//! Moves raw text between this process and a peer without knowing anything
//! about message framing. The same stream transport carries the language
//! server's stdio pipes and the debug adapter's TCP socket.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Size of the read buffer for stream reading operations
const READ_BUFFER_SIZE: usize = 4096;

/// Default capacity for UTF-8 accumulation buffer
const UTF8_ACCUMULATION_BUFFER_CAPACITY: usize = 8192;

/// Core transport trait for bidirectional message exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a message (raw string)
    async fn send(&mut self, message: &str) -> Result<(), Self::Error>;

    /// Receive the next chunk of text from the peer
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stream Transport Implementation
// ============================================================================

/// Error types for stream transports
#[derive(Debug, thiserror::Error)]
pub enum StreamTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport over any async reader/writer pair
///
/// Reading and writing happen on background tasks; the transport itself only
/// holds the channel ends, so dropping it closes the writer side of the peer.
#[derive(Debug)]
pub struct StreamTransport {
    /// Channel feeding the writer task
    outbound: Option<mpsc::UnboundedSender<String>>,

    /// Channel fed by the reader task
    inbound: Option<mpsc::UnboundedReceiver<String>>,

    /// Connection status
    connected: bool,
}

/// Byte accumulator that only releases complete UTF-8 sequences
struct ReaderState {
    byte_buffer: Vec<u8>,
    buffer_capacity: usize,
}

impl ReaderState {
    fn new() -> Self {
        Self {
            byte_buffer: Vec::with_capacity(UTF8_ACCUMULATION_BUFFER_CAPACITY),
            buffer_capacity: UTF8_ACCUMULATION_BUFFER_CAPACITY,
        }
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        self.byte_buffer.extend_from_slice(bytes);
    }

    /// Take the longest valid UTF-8 prefix, leaving a split sequence behind
    ///
    /// Invalid bytes are replaced with U+FFFD so the stream keeps flowing.
    fn extract_valid_utf8(&mut self) -> Option<String> {
        let mut text = String::new();
        loop {
            let (valid_end, invalid_len) = match std::str::from_utf8(&self.byte_buffer) {
                Ok(_) => (self.byte_buffer.len(), None),
                Err(e) => (e.valid_up_to(), e.error_len()),
            };

            let valid: Vec<u8> = self.byte_buffer.drain(..valid_end).collect();
            text.push_str(&String::from_utf8_lossy(&valid));

            // None: everything consumed, or an incomplete sequence awaiting more bytes
            let Some(len) = invalid_len else { break };
            warn!("StreamTransport: replacing {} invalid UTF-8 byte(s)", len);
            self.byte_buffer.drain(..len);
            text.push(char::REPLACEMENT_CHARACTER);
        }

        (!text.is_empty()).then_some(text)
    }

    fn compact(&mut self) {
        if self.byte_buffer.capacity() > self.buffer_capacity * 2 {
            self.byte_buffer.shrink_to(self.buffer_capacity);
        }
    }
}

impl StreamTransport {
    /// Create a transport from an arbitrary reader/writer pair
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel();
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(writer, outbound_receiver));
        tokio::spawn(Self::reader_task(reader, inbound_sender));

        Self {
            outbound: Some(outbound_sender),
            inbound: Some(inbound_receiver),
            connected: true,
        }
    }

    /// Create a transport from child process pipes
    pub fn from_child(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::new(stdout, stdin)
    }

    /// Open a TCP connection and wrap it in a transport
    pub async fn connect(addr: SocketAddr) -> Result<Self, io::Error> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("StreamTransport: connected to {}", addr);
        let (read_half, write_half) = stream.into_split();
        Ok(Self::new(read_half, write_half))
    }

    async fn writer_task<W>(mut writer: W, mut receiver: mpsc::UnboundedReceiver<String>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(message) = receiver.recv().await {
            trace!("StreamTransport: writing {} bytes", message.len());

            if let Err(e) = writer.write_all(message.as_bytes()).await {
                error!("Failed to write to peer: {}", e);
                break;
            }

            if let Err(e) = writer.flush().await {
                error!("Failed to flush peer stream: {}", e);
                break;
            }
        }

        let _ = writer.shutdown().await;
        trace!("StreamTransport: writer task finished");
    }

    async fn reader_task<R>(reader: R, sender: mpsc::UnboundedSender<String>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(reader);
        let mut state = ReaderState::new();
        let mut read_buffer = Box::new([0u8; READ_BUFFER_SIZE]);

        loop {
            match reader.read(read_buffer.as_mut()).await {
                Ok(0) => {
                    trace!("StreamTransport: reader reached EOF");
                    if let Some(rest) = state.extract_valid_utf8() {
                        let _ = sender.send(rest);
                    }
                    if !state.byte_buffer.is_empty() {
                        error!(
                            "StreamTransport: {} incomplete UTF-8 bytes remaining at EOF",
                            state.byte_buffer.len()
                        );
                    }
                    break;
                }
                Ok(n) => {
                    state.add_bytes(&read_buffer[..n]);

                    while let Some(text) = state.extract_valid_utf8() {
                        if sender.send(text).is_err() {
                            trace!("StreamTransport: receiver dropped, stopping reader");
                            return;
                        }
                    }

                    state.compact();
                }
                Err(e) => {
                    error!("Failed to read from peer: {}", e);
                    break;
                }
            }
        }

        trace!("StreamTransport: reader task finished");
    }
}

#[async_trait]
impl Transport for StreamTransport {
    type Error = StreamTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StreamTransportError::Disconnected);
        }

        let sender = self
            .outbound
            .as_ref()
            .ok_or(StreamTransportError::Disconnected)?;

        sender
            .send(message.to_string())
            .map_err(|e| StreamTransportError::Channel(e.to_string()))
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(StreamTransportError::Disconnected);
        }

        let receiver = self
            .inbound
            .as_mut()
            .ok_or(StreamTransportError::Disconnected)?;

        match receiver.recv().await {
            Some(text) => Ok(text),
            None => {
                self.connected = false;
                Err(StreamTransportError::Disconnected)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.outbound.take();
        self.inbound.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

#[cfg(test)]
pub use mock::{MockTransport, MockTransportError};

#[cfg(test)]
mod mock {
    use super::Transport;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, thiserror::Error)]
    pub enum MockTransportError {
        #[error("Transport is disconnected")]
        Disconnected,
        #[error("No more responses available")]
        NoMoreResponses,
    }

    /// Scripted transport: records what is sent, replays queued chunks
    #[derive(Default)]
    pub struct MockTransport {
        sent_messages: Arc<Mutex<Vec<String>>>,
        responses: VecDeque<String>,
        closed: bool,
    }

    impl MockTransport {
        pub fn with_responses<I, S>(responses: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                responses: responses.into_iter().map(Into::into).collect(),
                ..Self::default()
            }
        }

        pub fn sent_messages(&self) -> Vec<String> {
            self.sent_messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        type Error = MockTransportError;

        async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
            if self.closed {
                return Err(MockTransportError::Disconnected);
            }
            self.sent_messages.lock().unwrap().push(message.to_string());
            Ok(())
        }

        async fn receive(&mut self) -> Result<String, Self::Error> {
            if self.closed {
                return Err(MockTransportError::Disconnected);
            }
            self.responses
                .pop_front()
                .ok_or(MockTransportError::NoMoreResponses)
        }

        async fn close(&mut self) -> Result<(), Self::Error> {
            self.closed = true;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.closed
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
