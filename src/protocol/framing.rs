//! Message framing layer
//!
//! Both LSP and DAP frame every JSON payload with a header block:
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <content>
//! ```
//!
//! `<length>` counts bytes of the UTF-8 encoded content.

use crate::io::transport::Transport;
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::trace;

/// Maximum message size to prevent memory exhaustion
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_SEPARATOR: &str = "\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum FramingError<T: std::error::Error + Send + Sync + 'static> {
    #[error("Transport error: {0}")]
    Transport(T),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Invalid content length: {0}")]
    InvalidContentLength(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Wraps a raw transport so that `send`/`receive` operate on whole messages
pub struct MessageFraming<T: Transport> {
    transport: T,
    receive_buffer: String,
    message_queue: VecDeque<String>,
}

impl<T: Transport> MessageFraming<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            receive_buffer: String::new(),
            message_queue: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Parse one complete message off the front of the buffer, if present
    fn try_parse_message(&mut self) -> Result<Option<String>, FramingError<T::Error>> {
        let Some(header_end) = self.receive_buffer.find(HEADER_SEPARATOR) else {
            return Ok(None);
        };

        let content_length = parse_content_length(&self.receive_buffer[..header_end])?;
        let content_start = header_end + HEADER_SEPARATOR.len();
        let available = self.receive_buffer.len() - content_start;

        if available < content_length {
            trace!(
                "MessageFraming: incomplete message, need {} more bytes",
                content_length - available
            );
            return Ok(None);
        }

        let content_end = content_start + content_length;
        let message = self
            .receive_buffer
            .get(content_start..content_end)
            .ok_or_else(|| {
                FramingError::InvalidFormat(
                    "Content-Length does not end on a character boundary".to_string(),
                )
            })?
            .to_string();
        self.receive_buffer.drain(..content_end);

        trace!("MessageFraming: parsed message ({} bytes)", content_length);
        Ok(Some(message))
    }

    async fn fill_queue(&mut self) -> Result<(), FramingError<T::Error>> {
        let chunk = self
            .transport
            .receive()
            .await
            .map_err(FramingError::Transport)?;
        self.receive_buffer.push_str(&chunk);

        while let Some(message) = self.try_parse_message()? {
            self.message_queue.push_back(message);
        }
        Ok(())
    }
}

/// Extracts `Content-Length` from a header block; other headers are ignored
fn parse_content_length<E>(header: &str) -> Result<usize, FramingError<E>>
where
    E: std::error::Error + Send + Sync + 'static,
{
    for line in header.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("Content-Length") {
            continue;
        }

        let value = value.trim();
        let length = value
            .parse::<usize>()
            .map_err(|_| FramingError::InvalidContentLength(value.to_string()))?;
        if length > MAX_MESSAGE_SIZE {
            return Err(FramingError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }
        return Ok(length);
    }

    Err(FramingError::InvalidFormat(
        "Missing Content-Length header".to_string(),
    ))
}

/// Frame a payload for the wire
pub fn frame(message: &str) -> String {
    format!("Content-Length: {}\r\n\r\n{}", message.len(), message)
}

#[async_trait]
impl<T: Transport> Transport for MessageFraming<T> {
    type Error = FramingError<T::Error>;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        trace!("MessageFraming: sending {} bytes", message.len());
        self.transport
            .send(&frame(message))
            .await
            .map_err(FramingError::Transport)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        loop {
            if let Some(message) = self.message_queue.pop_front() {
                return Ok(message);
            }
            self.fill_queue().await?;
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.transport
            .close()
            .await
            .map_err(FramingError::Transport)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
