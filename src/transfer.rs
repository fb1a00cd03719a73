//! Transfer orchestration: the public face of the engine.
//!
//! File bodies are streamed in chunks, and the wire has no delimiter besides
//! the declared lengths, so two file streams must never interleave. Batches
//! of sends therefore run one file at a time. Deletes and do-syncs are a
//! single header plus digest each and may be issued concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Config;
use crate::connection::{ConnectionInfo, ConnectionManager, ConnectionState};
use crate::error::{Error, Result};
use crate::files::{self, ChunkReader};
use crate::protocol::{
    digest, CreateFileHeader, DeleteFileHeader, DoSync, Handshake, OperationId, RunningDigest,
    DIGEST_LEN,
};
use crate::tunnel::{AdbTunnel, Tunnel};

/// Client for one device agent.
///
/// Instances are independent: each owns its connection and its table of
/// pending operations.
pub struct LiveSync {
    config: Config,
    tunnel: Arc<dyn Tunnel>,
    manager: Arc<ConnectionManager>,
}

impl std::fmt::Debug for LiveSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSync")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl LiveSync {
    /// Engine that forwards the agent port with adb before connecting.
    pub fn new(config: Config) -> Self {
        let tunnel = AdbTunnel::new(config.adb_path.clone());
        Self::with_tunnel(config, tunnel)
    }

    pub fn with_tunnel(config: Config, tunnel: impl Tunnel + 'static) -> Self {
        Self {
            config,
            tunnel: Arc::new(tunnel),
            manager: ConnectionManager::new(),
        }
    }

    /// Called with connection-level errors and agent error reports.
    pub fn on_error(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        self.manager.set_error_handler(Arc::new(handler));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn info(&self) -> ConnectionInfo {
        self.manager.info()
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Number of do-syncs still waiting for their report.
    pub fn pending_operations(&self) -> usize {
        self.manager.pending_operations()
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Sets up the tunnel, then connects with bounded retry.
    ///
    /// A tunnel failure is returned at once: it means no device is reachable.
    pub async fn connect(&self) -> Result<Handshake> {
        self.config.validate()?;

        if let Err(e) = self.tunnel.establish(&self.config.tunnel()).await {
            tracing::warn!(error = %e, "a connected device or emulator is required");
            return Err(e);
        }

        self.manager
            .connect(&self.config.address(), self.config.retry_policy())
            .await
    }

    /// Goes live over an already-open stream instead of dialling.
    pub async fn attach<R, W>(&self, reader: R, writer: W) -> Result<Handshake>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.config.validate()?;
        self.manager.attach(reader, writer).await
    }

    /// Closes the connection. Pending do-syncs fail with `ConnectionClosed`.
    pub async fn end(&self) {
        self.manager.end().await;
    }

    // =========================================================================
    // Single-file operations
    // =========================================================================

    /// Streams one file to the agent.
    ///
    /// Resolves after the trailing content digest has been written and
    /// flushed. `base` overrides the configured base directory.
    pub async fn send_file(&self, path: &Path, base: Option<&Path>) -> Result<()> {
        self.manager.live_id()?;

        let rel = files::relative_wire_path(path, base.unwrap_or(&self.config.base_dir))?;
        let meta = files::stat(path).await.map_err(|e| Error::io(path, e))?;
        let header = CreateFileHeader {
            path: rel,
            content_length: meta.size,
        }
        .encode()?;
        let header_digest = digest(&header);
        let mut body = ChunkReader::open(path, meta.size).await?;

        let mut link = self.manager.lock_writer().await?;
        link.write(&header).await?;
        link.write(&header_digest).await?;

        let mut content = RunningDigest::new();
        let mut sent = 0u64;
        loop {
            let chunk = match body.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                // the header promised bytes we can no longer deliver
                Err(e) => return Err(link.abort(e)),
            };
            content.update(chunk);
            link.write(chunk).await?;
            sent += chunk.len() as u64;
        }

        if sent != meta.size {
            return Err(link.abort(Error::io(
                path,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("file shrank while sending: {sent} of {} bytes", meta.size),
                ),
            )));
        }

        link.write(&content.finish()).await?;
        link.flush().await?;

        tracing::debug!(path = %path.display(), bytes = sent, "sent file");
        Ok(())
    }

    /// Asks the agent to remove one file.
    pub async fn delete_file(&self, path: &Path, base: Option<&Path>) -> Result<()> {
        let message = self.delete_message(path, base)?;
        self.write_delete(path, &message).await
    }

    /// Delete header for `path` and its digest.
    fn delete_message(&self, path: &Path, base: Option<&Path>) -> Result<(Bytes, [u8; DIGEST_LEN])> {
        let rel = files::relative_wire_path(path, base.unwrap_or(&self.config.base_dir))?;
        let header = DeleteFileHeader { path: rel }.encode()?;
        let header_digest = digest(&header);
        Ok((header, header_digest))
    }

    async fn write_delete(&self, path: &Path, message: &(Bytes, [u8; DIGEST_LEN])) -> Result<()> {
        let (header, header_digest) = message;
        let mut link = self.manager.lock_writer().await?;
        link.write(header).await?;
        link.write(header_digest).await?;
        link.flush().await?;

        tracing::debug!(path = %path.display(), "deleted file");
        Ok(())
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// Sends every file under `dir`. Returns the files that were sent.
    pub async fn send_directory(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let listed = files::list_recursive(dir).await?;
        tracing::debug!(dir = %dir.display(), files = listed.len(), "sending directory");
        self.send_files(&listed).await
    }

    /// Sends files strictly one after another.
    ///
    /// Missing paths are skipped with a warning and directories are skipped
    /// silently. Returns the files that were sent.
    pub async fn send_files(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut sent = Vec::with_capacity(paths.len());
        for path in paths {
            match files::stat(path).await {
                Ok(meta) if meta.is_dir => continue,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(
                        path = %path.display(),
                        "file doesn't exist, skipping (paths must be absolute)"
                    );
                    continue;
                }
                Err(e) => return Err(Error::io(path, e)),
            }

            self.send_file(path, None).await?;
            sent.push(path.clone());
        }
        Ok(sent)
    }

    /// Deletes files concurrently; fails with the first error.
    ///
    /// Every path is encoded up front, so a path that can't go on the wire
    /// fails the batch before any delete is written.
    pub async fn delete_files(&self, paths: &[PathBuf]) -> Result<()> {
        let messages = paths
            .iter()
            .map(|path| self.delete_message(path, None))
            .collect::<Result<Vec<_>>>()?;

        futures::future::try_join_all(
            paths
                .iter()
                .zip(&messages)
                .map(|(path, message)| self.write_delete(path, message)),
        )
        .await?;
        Ok(())
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Asks the agent to apply everything sent so far and waits for its
    /// operation-end report.
    ///
    /// Without a report before `timeout` (default from the config) the
    /// operation fails with `OperationTimeout` and the connection is torn
    /// down, since a hung agent leaves the stream in an unknown state. The
    /// deadline is armed on its own task and fires even if this future is
    /// dropped.
    pub async fn send_sync(
        &self,
        id: Option<OperationId>,
        timeout: Option<Duration>,
    ) -> Result<OperationId> {
        let id = id.unwrap_or_else(OperationId::generate);
        let timeout = timeout.unwrap_or_else(|| self.config.operation_timeout());
        let message = DoSync { id: id.clone() }.encode();
        let message_digest = digest(&message);

        let mut link = self.manager.lock_writer().await?;
        let mut done =
            self.manager
                .register_operation(id.clone(), link.connection_id().clone(), timeout)?;

        let written = async {
            link.write(&message).await?;
            link.write(&message_digest).await?;
            link.flush().await
        }
        .await;
        drop(link);
        if let Err(e) = written {
            // the agent never saw this id, so no report will come for it
            self.manager.discard_operation(&id);
            return Err(e);
        }
        tracing::debug!(operation = %id, ?timeout, "sync requested");

        match tokio::time::timeout(timeout, &mut done).await {
            Ok(result) => result.map_err(|_| Error::ConnectionClosed)?,
            Err(_) => {
                self.manager.expire_operation(&id, timeout);
                match done.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::OperationTimeout {
                        id: id.to_string(),
                        timeout,
                    }),
                }
            }
        }
    }
}
