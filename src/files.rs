//! Local filesystem access for outgoing transfers.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, Take};

use crate::error::{Error, Result};

/// Read size for streamed file bodies.
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

pub async fn stat(path: &Path) -> io::Result<FileStat> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(FileStat {
        size: meta.len(),
        is_dir: meta.is_dir(),
    })
}

pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Every regular file under `dir`, sorted. Hidden and ignored files are
/// included: the device gets exactly what is on disk.
pub async fn list_recursive(dir: &Path) -> Result<Vec<PathBuf>> {
    let root = dir.to_path_buf();
    let walk_root = root.clone();

    let listed = tokio::task::spawn_blocking(move || -> io::Result<Vec<PathBuf>> {
        let walker = ignore::WalkBuilder::new(&walk_root)
            .standard_filters(false)
            .follow_links(true)
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_some_and(|t| t.is_file()) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    })
    .await
    .map_err(|e| Error::io(&root, io::Error::other(e)))?;

    listed.map_err(|e| Error::io(&root, e))
}

/// `path` relative to `base`, with `/` separators on every platform.
pub fn relative_wire_path(path: &Path, base: &Path) -> Result<String> {
    let outside = || Error::PathOutsideBase {
        path: path.to_path_buf(),
        base: base.to_path_buf(),
    };

    let rel = path.strip_prefix(base).map_err(|_| outside())?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err(Error::NonUtf8Path(path.to_path_buf())),
            },
            Component::CurDir => {}
            _ => return Err(outside()),
        }
    }

    if parts.is_empty() {
        return Err(outside());
    }
    Ok(parts.join("/"))
}

/// Streams a file body in fixed-size chunks, never yielding more than the
/// length announced in its header.
pub struct ChunkReader {
    inner: Take<BufReader<File>>,
    buf: Vec<u8>,
    path: PathBuf,
}

impl ChunkReader {
    pub async fn open(path: &Path, limit: u64) -> Result<Self> {
        let file = File::open(path).await.map_err(|e| Error::io(path, e))?;
        Ok(Self {
            inner: BufReader::new(file).take(limit),
            buf: vec![0u8; DATA_CHUNK_SIZE],
            path: path.to_path_buf(),
        })
    }

    /// Next chunk, or `None` at end of file (or once `limit` bytes were read).
    pub async fn next_chunk(&mut self) -> Result<Option<&[u8]>> {
        let n = read_some(&mut self.inner, &mut self.buf)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(&self.buf[..n]))
    }
}

async fn read_some<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match r.read(buf).await {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
