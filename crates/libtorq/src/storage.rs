// Torrent data storage. The trait is positional file I/O by file id; the
// filesystem implementation below keeps an LRU pool of open handles so
// large multi-file torrents don't pin hundreds of descriptors.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use lru::LruCache;
use parking_lot::Mutex;
use torq_core::metainfo::Metainfo;
use tracing::debug;

const MAX_OPEN_FILES: usize = 64;

pub trait TorrentStorage: Send + Sync + 'static {
    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<()>;
    fn pwrite_all(&self, file_id: usize, offset: u64, buf: &[u8]) -> anyhow::Result<()>;
    /// Grow (or truncate) the file to its final length. Sparse where the
    /// platform allows.
    fn ensure_file_length(&self, file_id: usize, length: u64) -> anyhow::Result<()>;
    fn remove_file(&self, file_id: usize) -> anyhow::Result<()>;
}

struct StoredFile {
    full_path: PathBuf,
    length: u64,
}

pub struct FilesystemStorage {
    output_dir: PathBuf,
    files: Vec<StoredFile>,
    handles: Mutex<LruCache<usize, Arc<std::fs::File>>>,
}

pub struct InitOutcome {
    /// Whether any target file already existed: if so the torrent has to
    /// re-check what's on disk.
    pub any_existing: bool,
}

impl FilesystemStorage {
    pub fn new(output_dir: &Path, meta: &Metainfo) -> Self {
        let files = meta
            .files
            .iter()
            .map(|f| StoredFile {
                full_path: output_dir.join(&f.relative_path),
                length: f.length,
            })
            .collect();
        Self {
            output_dir: output_dir.to_owned(),
            files,
            handles: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_OPEN_FILES).unwrap(),
            )),
        }
    }

    /// Create directories and files, pre-allocating lengths.
    pub fn init(&self) -> anyhow::Result<InitOutcome> {
        let mut any_existing = false;
        for (file_id, file) in self.files.iter().enumerate() {
            if let Some(parent) = file.full_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("error creating {parent:?}"))?;
            }
            if file.full_path.try_exists()? {
                any_existing = true;
            }
            self.ensure_file_length(file_id, file.length)?;
        }
        Ok(InitOutcome { any_existing })
    }

    fn handle(&self, file_id: usize) -> anyhow::Result<Arc<std::fs::File>> {
        let mut pool = self.handles.lock();
        if let Some(f) = pool.get(&file_id) {
            return Ok(f.clone());
        }
        let path = &self
            .files
            .get(file_id)
            .with_context(|| format!("no file with id {file_id}"))?
            .full_path;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("error opening {path:?}"))?;
        let file = Arc::new(file);
        pool.put(file_id, file.clone());
        Ok(file)
    }

    /// Remove every data file and any directories that became empty.
    pub fn delete_all(&self) -> anyhow::Result<()> {
        self.handles.lock().clear();
        for (file_id, file) in self.files.iter().enumerate() {
            if let Err(e) = self.remove_file(file_id) {
                debug!("error removing {:?}: {e:#}", file.full_path);
            }
        }
        for file in &self.files {
            let mut dir = file.full_path.parent();
            while let Some(d) = dir {
                if d == self.output_dir || std::fs::remove_dir(d).is_err() {
                    break;
                }
                dir = d.parent();
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn pread(f: &std::fs::File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    f.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn pwrite(f: &std::fs::File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    f.write_all_at(buf, offset)
}

#[cfg(windows)]
fn pread(f: &std::fs::File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = f.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        offset += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

#[cfg(windows)]
fn pwrite(f: &std::fs::File, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = f.seek_write(buf, offset)?;
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

impl TorrentStorage for FilesystemStorage {
    fn pread_exact(&self, file_id: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let f = self.handle(file_id)?;
        pread(&f, offset, buf)
            .with_context(|| format!("error reading {} bytes at {offset}", buf.len()))
    }

    fn pwrite_all(&self, file_id: usize, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
        let f = self.handle(file_id)?;
        pwrite(&f, offset, buf)
            .with_context(|| format!("error writing {} bytes at {offset}", buf.len()))
    }

    fn ensure_file_length(&self, file_id: usize, length: u64) -> anyhow::Result<()> {
        let f = self.handle(file_id)?;
        if f.metadata()?.len() != length {
            f.set_len(length)
                .with_context(|| format!("error sizing file {file_id} to {length}"))?;
        }
        Ok(())
    }

    fn remove_file(&self, file_id: usize) -> anyhow::Result<()> {
        self.handles.lock().pop(&file_id);
        let path = &self
            .files
            .get(file_id)
            .with_context(|| format!("no file with id {file_id}"))?
            .full_path;
        std::fs::remove_file(path).with_context(|| format!("error removing {path:?}"))
    }
}
