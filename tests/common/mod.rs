//! Shared fakes for the integration tests: a recording socket writer and
//! helpers for standing in as the device agent.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use livesync::protocol::{DoSync, Handshake};
use livesync::LiveSync;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};

pub const APP_ID: &str = "com.example.app";
pub const VERSION: &str = "v1.";

pub fn handshake() -> Vec<u8> {
    Handshake {
        protocol_version: VERSION.into(),
        application_id: APP_ID.into(),
    }
    .encode()
    .unwrap()
    .to_vec()
}

/// Every buffer handed to the socket, one entry per write call.
#[derive(Clone, Default)]
pub struct Writes(Arc<Mutex<Vec<Vec<u8>>>>);

impl Writes {
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// All bytes written so far, in order.
    pub fn stream(&self) -> Vec<u8> {
        self.0.lock().unwrap().concat()
    }

    /// Whether a do-sync for `id` has been written.
    pub fn has_sync(&self, sync: &DoSync) -> bool {
        let encoded = sync.encode();
        self.0.lock().unwrap().iter().any(|w| w[..] == encoded[..])
    }
}

pub struct RecordingWriter {
    writes: Writes,
}

impl RecordingWriter {
    pub fn new(writes: Writes) -> Self {
        Self { writes }
    }
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.writes.0.lock().unwrap().push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Attaches `engine` to an in-memory agent. Returns the agent's end of the
/// report stream (dropping it closes the connection) and the recorded writes.
pub async fn attach_recording(engine: &LiveSync) -> (DuplexStream, Writes) {
    let (local, mut agent) = tokio::io::duplex(64 * 1024);
    agent.write_all(&handshake()).await.unwrap();

    let writes = Writes::default();
    engine
        .attach(local, RecordingWriter::new(writes.clone()))
        .await
        .unwrap();
    (agent, writes)
}

/// Polls `cond` until it holds, panicking after a few seconds.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
