//! Testing utilities and mock implementations
//!
//! Provides a scriptable in-memory [`Transport`] so client sessions can be
//! exercised without spawning real server processes.

use crate::io::{ChunkReceiver, Transport, TransportError};
use crate::rpc::framing::{self, StreamBuffer};
use crate::rpc::Message;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Mock transport - records written frames and replays scripted inbound
/// bytes.
///
/// Create it together with its [`MockHandle`]; the transport is handed to
/// the client while the handle stays with the test to feed inbound data
/// and inspect outbound traffic.
pub struct MockTransport {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    reader: Option<ChunkReceiver>,
    running: Arc<AtomicBool>,
}

/// Test-side controls for a [`MockTransport`]
pub struct MockHandle {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    feeder: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    running: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let (feeder, reader) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(true));

        let transport = Self {
            sent: Arc::clone(&sent),
            reader: Some(reader),
            running: Arc::clone(&running),
        };
        let handle = MockHandle {
            sent,
            feeder: Mutex::new(Some(feeder)),
            running,
        };
        (transport, handle)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::Offline);
        }
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn take_reader(&mut self) -> Option<ChunkReceiver> {
        self.reader.take()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // closing the feeder ends the scripted stream like a process exit
        // would; the handle side observes `is_running` flip instead
    }
}

impl MockHandle {
    /// Feed raw bytes into the inbound stream, as fragmented as desired
    pub fn feed(&self, bytes: impl Into<Vec<u8>>) {
        if let Some(feeder) = self.feeder.lock().unwrap().as_ref() {
            let _ = feeder.send(bytes.into());
        }
    }

    /// Frame and feed one message, the way a server would send it
    pub fn feed_message(&self, message: &Message) {
        let body = message.encode().expect("test message must encode");
        self.feed(framing::wrap(&body));
    }

    /// Close the inbound stream, simulating server death / stdout EOF
    pub fn close_stream(&self) {
        self.feeder.lock().unwrap().take();
    }

    /// Whether the client side still considers the transport live
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// All frames written by the client, in write order
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Written frames, unframed and decoded
    pub fn sent_messages(&self) -> Vec<Message> {
        let mut buffer = StreamBuffer::new();
        for frame in self.sent_frames() {
            buffer.put(&frame);
        }

        let mut messages = Vec::new();
        while let Some(body) = buffer
            .try_take()
            .expect("client wrote a corrupt frame header")
        {
            messages.push(Message::decode(&body).expect("client wrote an undecodable message"));
        }
        assert_eq!(buffer.pending(), 0, "client wrote a truncated frame");
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_written_frames_as_messages() {
        let (transport, handle) = MockTransport::new();

        let message = Message::notification("initialized", json!({}));
        let framed = framing::wrap(&message.encode().unwrap());
        transport.write(&framed).await.unwrap();

        assert_eq!(handle.sent_messages(), vec![message]);
    }

    #[tokio::test]
    async fn feed_reaches_the_reader() {
        let (mut transport, handle) = MockTransport::new();
        let mut reader = transport.take_reader().unwrap();

        handle.feed(b"abc".to_vec());
        assert_eq!(reader.recv().await.unwrap(), b"abc");

        handle.close_stream();
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn terminate_refuses_writes() {
        let (mut transport, handle) = MockTransport::new();
        transport.terminate();

        assert!(!handle.is_running());
        assert!(matches!(
            transport.write(b"x").await,
            Err(TransportError::Offline)
        ));
    }
}
