//! Connection lifecycle: retrying connect, handshake, report dispatch and
//! failure propagation.
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingHandshake -> Live -> Closed | Errored
//! ```
//!
//! `Closed` and `Errored` are terminal for one connection; the next connect
//! starts over with a fresh [`ConnectionId`]. The manager owns the socket.
//! Other components only see it through [`LiveWriter`] and state queries.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::operations::{OperationReceiver, OperationTable};
use crate::protocol::{Handshake, OperationId, Report};

/// Read buffer for inbound chunks (handshake and reports are tiny).
const READ_BUFFER_SIZE: usize = 64 * 1024;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Callback for connection-level errors and agent error reports.
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingHandshake,
    Live,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_live(self) -> bool {
        self == Self::Live
    }
}

/// Random identifier minted when a connection goes live; never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; 16]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of the current (or most recent) connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub id: Option<ConnectionId>,
    pub protocol_version: Option<String>,
    pub application_id: Option<String>,
    pub last_error: Option<Error>,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            id: None,
            protocol_version: None,
            application_id: None,
            last_error: None,
        }
    }
}

/// Bounds for the connect retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Overall budget for the loop.
    pub timeout: Duration,
    /// Pause between attempts.
    pub interval: Duration,
}

struct LiveLink {
    id: ConnectionId,
    writer: BoxWriter,
}

/// Owns the one live connection and the table of operations pending on it.
pub struct ConnectionManager {
    info: Mutex<ConnectionInfo>,
    link: tokio::sync::Mutex<Option<LiveLink>>,
    reader: Mutex<Option<(ConnectionId, JoinHandle<()>)>>,
    operations: Mutex<OperationTable>,
    on_error: Mutex<Option<ErrorHandler>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("info", &self.info())
            .field("pending", &self.pending_operations())
            .finish_non_exhaustive()
    }
}

// std mutexes here are never held across an await; a poisoned lock still
// holds consistent data.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(ConnectionInfo::default()),
            link: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            operations: Mutex::new(OperationTable::new()),
            on_error: Mutex::new(None),
        })
    }

    pub fn info(&self) -> ConnectionInfo {
        lock(&self.info).clone()
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.info).state
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *lock(&self.on_error) = Some(handler);
    }

    pub fn pending_operations(&self) -> usize {
        lock(&self.operations).len()
    }

    fn set_state(&self, state: ConnectionState) {
        lock(&self.info).state = state;
    }

    fn notify(&self, error: &Error) {
        let handler = lock(&self.on_error).clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    /// `NotConnected`, carrying whatever ended the previous connection.
    pub fn not_connected(&self) -> Error {
        Error::NotConnected {
            last: lock(&self.info).last_error.clone().map(Box::new),
        }
    }

    /// Identifier of the live connection, or `NotConnected`.
    pub fn live_id(&self) -> Result<ConnectionId> {
        let info = lock(&self.info);
        match (&info.state, &info.id) {
            (ConnectionState::Live, Some(id)) => Ok(id.clone()),
            _ => Err(Error::NotConnected {
                last: info.last_error.clone().map(Box::new),
            }),
        }
    }

    // =========================================================================
    // Connect
    // =========================================================================

    /// Dials `addr` until a socket delivers its first bytes, then goes live.
    ///
    /// A socket that closes or errors before sending anything is a transient
    /// failure: the loop waits `policy.interval` and tries again until
    /// `policy.timeout` is spent.
    pub async fn connect(self: &Arc<Self>, addr: &str, policy: RetryPolicy) -> Result<Handshake> {
        self.end().await;
        self.set_state(ConnectionState::Connecting);

        let started = Instant::now();
        let deadline = started + policy.timeout;
        let mut last: Option<Arc<io::Error>> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            tracing::debug!(addr, attempt, "connecting to device agent");

            match tokio::time::timeout_at(deadline, self.open_socket(addr)).await {
                Ok(Ok((stream, first))) => {
                    let (reader, writer) = stream.into_split();
                    return self.go_live(&first, Box::new(reader), Box::new(writer)).await;
                }
                Ok(Err(e)) => {
                    tracing::debug!(addr, attempt, error = %e, "connect attempt failed");
                    last = Some(Arc::new(e));
                    self.set_state(ConnectionState::Connecting);
                }
                Err(_) => break,
            }

            let resume = (Instant::now() + policy.interval).min(deadline);
            tokio::time::sleep_until(resume).await;
            if Instant::now() >= deadline {
                break;
            }
        }

        let err = Error::ConnectTimeout {
            addr: addr.to_string(),
            elapsed: started.elapsed(),
            last,
        };
        let mut info = lock(&self.info);
        info.state = ConnectionState::Errored;
        info.last_error = Some(err.clone());
        Err(err)
    }

    async fn open_socket(&self, addr: &str) -> io::Result<(TcpStream, Vec<u8>)> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        self.set_state(ConnectionState::AwaitingHandshake);

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "socket closed before handshake",
            ));
        }
        buf.truncate(n);
        Ok((stream, buf))
    }

    /// Goes live over an already-open stream whose first chunk is the handshake.
    pub async fn attach<R, W>(self: &Arc<Self>, mut reader: R, writer: W) -> Result<Handshake>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.end().await;
        self.set_state(ConnectionState::AwaitingHandshake);

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let n = match reader.read(&mut buf).await {
            Ok(0) => Err(Error::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(e) => Err(Error::socket(e)),
        };
        let n = match n {
            Ok(n) => n,
            Err(err) => {
                let mut info = lock(&self.info);
                info.state = ConnectionState::Errored;
                info.last_error = Some(err.clone());
                return Err(err);
            }
        };

        self.go_live(&buf[..n], Box::new(reader), Box::new(writer))
            .await
    }

    async fn go_live(
        self: &Arc<Self>,
        first: &[u8],
        reader: BoxReader,
        writer: BoxWriter,
    ) -> Result<Handshake> {
        let handshake = match Handshake::decode(first) {
            Ok(hs) => hs,
            Err(err) => {
                let mut info = lock(&self.info);
                info.state = ConnectionState::Errored;
                info.last_error = Some(err.clone());
                return Err(err);
            }
        };

        let id = ConnectionId::generate();
        *self.link.lock().await = Some(LiveLink {
            id: id.clone(),
            writer,
        });
        {
            let mut info = lock(&self.info);
            *info = ConnectionInfo {
                state: ConnectionState::Live,
                id: Some(id.clone()),
                protocol_version: Some(handshake.protocol_version.clone()),
                application_id: Some(handshake.application_id.clone()),
                last_error: None,
            };
        }

        let task = tokio::spawn(Arc::clone(self).read_reports(id.clone(), reader));
        if let Some((_, old)) = lock(&self.reader).replace((id.clone(), task)) {
            old.abort();
        }

        tracing::info!(
            connection = %id,
            version = %handshake.protocol_version,
            application = %handshake.application_id,
            "connection live"
        );
        Ok(handshake)
    }

    // =========================================================================
    // Inbound reports
    // =========================================================================

    async fn read_reports(self: Arc<Self>, id: ConnectionId, mut reader: BoxReader) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let error = loop {
            match reader.read(&mut buf).await {
                Ok(0) => break Error::ConnectionClosed,
                Ok(n) => self.dispatch_reports(&buf[..n]),
                Err(e) => break Error::socket(e),
            }
        };
        self.fail_connection(&id, error);
    }

    fn dispatch_reports(&self, chunk: &[u8]) {
        let reports = match Report::decode_chunk(chunk) {
            Ok(reports) => reports,
            Err(e) => {
                tracing::warn!(error = %e, len = chunk.len(), "ignoring undecodable report");
                return;
            }
        };

        for report in reports {
            match report {
                Report::OperationEnd(op) => {
                    if lock(&self.operations).complete(&op) {
                        tracing::debug!(operation = %op, "sync operation finished");
                    } else {
                        tracing::debug!(operation = %op, "report for unknown operation");
                    }
                }
                Report::Error(message) => {
                    tracing::warn!(%message, "device agent reported an error");
                    self.notify(&Error::Remote(message));
                }
            }
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Exclusive access to the live socket.
    ///
    /// The guard is held for a whole message (header, body and digests) so
    /// that no other writer can interleave bytes inside it.
    pub async fn lock_writer(&self) -> Result<LiveWriter<'_>> {
        let guard = self.link.lock().await;
        let id = self.live_id()?;
        match guard.as_ref() {
            Some(link) if link.id == id => Ok(LiveWriter {
                manager: self,
                guard,
                id,
                in_message: false,
            }),
            _ => Err(self.not_connected()),
        }
    }

    /// Writes `bytes` and flushes, as one message.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut link = self.lock_writer().await?;
        link.write(bytes).await?;
        link.flush().await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Registers a do-sync and arms its deadline.
    ///
    /// The deadline fires from its own task, so the record expires even if
    /// nobody is awaiting the receiver any more.
    pub fn register_operation(
        self: &Arc<Self>,
        id: OperationId,
        connection: ConnectionId,
        timeout: Duration,
    ) -> Result<OperationReceiver> {
        let rx = lock(&self.operations).register(id, connection, timeout)?;

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.expire_overdue();
            }
        });
        Ok(rx)
    }

    /// Forgets a registered operation whose do-sync was never fully written.
    pub fn discard_operation(&self, id: &OperationId) -> bool {
        lock(&self.operations).remove(id)
    }

    /// Fails operation `id` with `OperationTimeout` if it is still pending.
    ///
    /// There is no way to abort a single operation on the wire, so the
    /// connection it was issued on is torn down and everything else pending
    /// there fails with the same timeout.
    pub fn expire_operation(&self, id: &OperationId, timeout: Duration) -> bool {
        let err = Error::OperationTimeout {
            id: id.to_string(),
            timeout,
        };
        let expired = lock(&self.operations).expire(id, err.clone());
        match expired {
            Some(conn) => {
                tracing::warn!(operation = %id, connection = %conn, "sync operation timed out");
                self.fail_connection(&conn, err);
                true
            }
            None => false,
        }
    }

    /// Expires every operation whose deadline has passed.
    pub fn expire_overdue(&self) -> usize {
        let overdue = lock(&self.operations).overdue(Instant::now());
        overdue
            .iter()
            .filter(|(id, timeout)| self.expire_operation(id, *timeout))
            .count()
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Marks connection `id` dead and fails everything pending on it.
    ///
    /// Stale calls (for a connection that is already gone) are ignored.
    pub fn fail_connection(&self, id: &ConnectionId, error: Error) {
        {
            let mut info = lock(&self.info);
            if info.id.as_ref() != Some(id) || !info.state.is_live() {
                return;
            }
            info.state = match error {
                Error::ConnectionClosed => ConnectionState::Closed,
                _ => ConnectionState::Errored,
            };
            info.last_error = Some(error.clone());
        }

        let failed = lock(&self.operations).fail_all_for(id, &error);
        tracing::warn!(connection = %id, error = %error, failed, "connection lost");

        // A writer holding the lock keeps the dead link until it is dropped;
        // its live-id check in LiveWriter::writer refuses further writes.
        if let Ok(mut link) = self.link.try_lock() {
            if link.as_ref().is_some_and(|l| l.id == *id) {
                *link = None;
            }
        }
        self.stop_reader(id);
        self.notify(&error);
    }

    fn stop_reader(&self, id: &ConnectionId) {
        let mut reader = lock(&self.reader);
        if reader.as_ref().is_some_and(|(rid, _)| rid == id) {
            if let Some((_, task)) = reader.take() {
                task.abort();
            }
        }
    }

    /// Gracefully closes the live connection, if any.
    ///
    /// Pending operations fail with `ConnectionClosed`. The error callback is
    /// not invoked since the close was requested.
    pub async fn end(&self) {
        let mut link = self.link.lock().await;
        let Some(mut live) = link.take() else {
            return;
        };
        drop(link);

        if let Err(e) = live.writer.shutdown().await {
            tracing::debug!(error = %e, "shutdown of device socket failed");
        }

        let was_live = {
            let mut info = lock(&self.info);
            let live_now = info.id.as_ref() == Some(&live.id) && info.state.is_live();
            if live_now {
                info.state = ConnectionState::Closed;
                info.last_error = Some(Error::ConnectionClosed);
            }
            live_now
        };
        if was_live {
            let failed = lock(&self.operations).fail_all_for(&live.id, &Error::ConnectionClosed);
            tracing::info!(connection = %live.id, failed, "connection closed");
        }
        self.stop_reader(&live.id);
    }
}

/// Exclusive writer for the live connection.
///
/// A message runs from the first `write` to the next `flush`. Dropping the
/// writer in between (a cancelled future) leaves a truncated frame on the
/// wire, so the connection is failed with `Cancelled`.
pub struct LiveWriter<'a> {
    manager: &'a ConnectionManager,
    guard: tokio::sync::MutexGuard<'a, Option<LiveLink>>,
    id: ConnectionId,
    in_message: bool,
}

impl fmt::Debug for LiveWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveWriter").field("id", &self.id).finish()
    }
}

impl LiveWriter<'_> {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    fn writer(&mut self) -> Result<&mut BoxWriter> {
        if self.manager.live_id().ok().as_ref() != Some(&self.id) {
            return Err(self.manager.not_connected());
        }
        match self.guard.as_mut() {
            Some(link) => Ok(&mut link.writer),
            None => Err(self.manager.not_connected()),
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer()?;
        self.in_message = true;
        let result = self.writer()?.write_all(bytes).await;
        result.map_err(|e| self.abort(Error::socket(e)))
    }

    /// Flushes and ends the current message.
    pub async fn flush(&mut self) -> Result<()> {
        let result = self.writer()?.flush().await;
        result.map_err(|e| self.abort(Error::socket(e)))?;
        self.in_message = false;
        Ok(())
    }

    /// Tears the connection down from the writing side, for failures that
    /// leave the stream out of sync with the agent.
    pub fn abort(&mut self, error: Error) -> Error {
        self.in_message = false;
        self.manager.fail_connection(&self.id, error.clone());
        *self.guard = None;
        error
    }
}

impl Drop for LiveWriter<'_> {
    fn drop(&mut self) {
        if self.in_message && self.guard.is_some() {
            tracing::warn!(connection = %self.id, "write abandoned mid-message");
            self.abort(Error::Cancelled);
        }
    }
}
