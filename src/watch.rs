//! Watch mode: push changes under a directory as they happen.
//!
//! Filesystem events are gathered until the tree has been quiet for the
//! debounce window, then flushed as one batch: changed files are sent,
//! vanished ones deleted, and a do-sync asks the agent to apply them.

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::files;
use crate::transfer::LiveSync;

/// Quiet period that ends a batch.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Paths touched since the last flush.
#[derive(Debug, Default)]
pub struct PendingChanges {
    paths: BTreeSet<PathBuf>,
}

impl PendingChanges {
    /// Records the paths of a create, modify or remove event. Returns whether
    /// the event was relevant.
    pub fn record(&mut self, event: &Event) -> bool {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                self.paths.extend(event.paths.iter().cloned());
                !event.paths.is_empty()
            }
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Splits the batch by what is on disk now: files to send and paths to
    /// delete. Paths outside `base` are dropped, directories are expanded.
    pub async fn resolve(self, base: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
        let mut send = Vec::new();
        let mut delete = Vec::new();

        for path in self.paths {
            if !path.starts_with(base) || path == base {
                continue;
            }
            match files::stat(&path).await {
                Ok(meta) if meta.is_dir => send.extend(files::list_recursive(&path).await?),
                Ok(_) => send.push(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => delete.push(path),
                Err(e) => return Err(Error::io(&path, e)),
            }
        }

        send.sort();
        send.dedup();
        Ok((send, delete))
    }
}

/// Recursive watcher feeding events into a tokio channel.
pub struct DirWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl std::fmt::Debug for DirWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirWatcher").finish_non_exhaustive()
    }
}

impl DirWatcher {
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| watch_error(root, e))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| watch_error(root, e))?;

        tracing::info!(root = %root.display(), "watching for changes");
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Waits for a relevant event, then keeps collecting until `quiet` passes
    /// with nothing new. `None` once the watcher has shut down.
    pub async fn next_batch(&mut self, quiet: Duration) -> Option<PendingChanges> {
        let mut batch = PendingChanges::default();
        while batch.is_empty() {
            let event = self.rx.recv().await?;
            absorb(&mut batch, event);
        }

        loop {
            match tokio::time::timeout(quiet, self.rx.recv()).await {
                Ok(Some(event)) => absorb(&mut batch, event),
                Ok(None) | Err(_) => return Some(batch),
            }
        }
    }
}

fn absorb(batch: &mut PendingChanges, event: notify::Result<Event>) {
    match event {
        Ok(event) => {
            batch.record(&event);
        }
        Err(e) => tracing::warn!(error = %e, "file watcher error"),
    }
}

fn watch_error(root: &Path, e: notify::Error) -> Error {
    Error::io(root, io::Error::other(e))
}

/// Pushes every change under `root` until `shutdown` resolves.
///
/// A failed flush is logged and the loop carries on; the next batch
/// reconnects first if the connection was lost.
pub async fn watch<F>(engine: &LiveSync, root: &Path, debounce: Duration, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let mut watcher = DirWatcher::new(root)?;
    tokio::pin!(shutdown);

    loop {
        let batch = tokio::select! {
            _ = &mut shutdown => break,
            batch = watcher.next_batch(debounce) => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        match flush(engine, batch).await {
            Ok(()) => {}
            Err(e) if e.is_connection_level() || e.is_not_connected() => {
                tracing::warn!(error = %e, "connection lost, reconnecting on the next change");
            }
            Err(e) => tracing::warn!(error = %e, "failed to push changes"),
        }
    }

    tracing::info!("stopped watching");
    Ok(())
}

/// Sends one batch and waits for the agent to apply it.
pub async fn flush(engine: &LiveSync, batch: PendingChanges) -> Result<()> {
    let (send, delete) = batch.resolve(&engine.config().base_dir).await?;
    if send.is_empty() && delete.is_empty() {
        return Ok(());
    }

    if !engine.is_live() {
        tracing::info!("connection is down, reconnecting");
        engine.connect().await?;
    }

    let sent = engine.send_files(&send).await?;
    engine.delete_files(&delete).await?;
    let op = engine.send_sync(None, None).await?;

    tracing::info!(
        sent = sent.len(),
        deleted = delete.len(),
        operation = %op,
        "changes applied"
    );
    Ok(())
}
