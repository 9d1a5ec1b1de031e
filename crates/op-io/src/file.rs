//! Async file abstraction and its native and in-memory backends

use crate::dispatcher::IoDispatcher;
use crate::request::{IoCallback, IoRequest};
use op_core::error::ArchiveError;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Blocking random-access source executed by I/O workers
pub trait BlockSource: Send + Sync {
    fn size(&self) -> Result<u64, ArchiveError>;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ArchiveError>;
    /// Name used in logs and errors
    fn describe(&self) -> String;
}

/// A file on disk
pub struct NativeFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl NativeFile {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(File::open(path)?),
        })
    }

    fn error(&self, e: std::io::Error) -> ArchiveError {
        ArchiveError::ReadFailed {
            path: self.path.display().to_string(),
            message: e.to_string(),
        }
    }
}

impl BlockSource for NativeFile {
    fn size(&self) -> Result<u64, ArchiveError> {
        let file = self.file.lock();
        file.metadata().map(|m| m.len()).map_err(|e| self.error(e))
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ArchiveError> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(|e| self.error(e))?;
        file.read_exact(buf).map_err(|e| self.error(e))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Bytes held in memory
pub struct MemoryBlob {
    name: String,
    data: Arc<[u8]>,
    failing: bool,
}

impl MemoryBlob {
    pub fn new(name: &str, data: Arc<[u8]>) -> Self {
        Self {
            name: name.to_string(),
            data,
            failing: false,
        }
    }

    /// Blob whose reads always fail
    pub fn failing(name: &str, data: Arc<[u8]>) -> Self {
        Self {
            failing: true,
            ..Self::new(name, data)
        }
    }
}

impl BlockSource for MemoryBlob {
    fn size(&self) -> Result<u64, ArchiveError> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), ArchiveError> {
        if self.failing {
            return Err(ArchiveError::ReadFailed {
                path: self.name.clone(),
                message: "injected read failure".to_string(),
            });
        }
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(ArchiveError::OutOfBounds {
                offset,
                len: buf.len() as u64,
                size: self.data.len() as u64,
            });
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Handle to a file opened for asynchronous reads
pub trait AsyncReadFile: Send + Sync {
    fn path(&self) -> &Path;

    /// Query the file size; `callback` runs on the completing thread
    fn size_request(&self, callback: Option<IoCallback>) -> Arc<IoRequest>;

    /// Read `len` bytes at `offset`; `callback` runs on the completing thread
    fn read_request(&self, offset: u64, len: u64, callback: Option<IoCallback>) -> Arc<IoRequest>;
}

/// Async handle executing its reads on an [`IoDispatcher`]
pub struct DispatchedFile {
    path: PathBuf,
    source: Arc<dyn BlockSource>,
    dispatcher: Arc<IoDispatcher>,
}

impl DispatchedFile {
    pub fn new(path: &Path, source: Arc<dyn BlockSource>, dispatcher: Arc<IoDispatcher>) -> Self {
        Self {
            path: path.to_path_buf(),
            source,
            dispatcher,
        }
    }
}

impl AsyncReadFile for DispatchedFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size_request(&self, callback: Option<IoCallback>) -> Arc<IoRequest> {
        self.dispatcher.submit_size(Arc::clone(&self.source), callback)
    }

    fn read_request(&self, offset: u64, len: u64, callback: Option<IoCallback>) -> Arc<IoRequest> {
        self.dispatcher
            .submit_read(Arc::clone(&self.source), offset, len, callback)
    }
}

/// Platform file layer consumed by the loader
pub trait FileSystem: Send + Sync {
    /// Open `path` for async reads; `None` when it does not exist
    fn open_async_read(&self, path: &Path) -> Option<Arc<dyn AsyncReadFile>>;

    fn exists(&self, path: &Path) -> bool;

    /// Synchronous size query, `None` when the file does not exist
    fn file_size(&self, path: &Path) -> Option<u64>;
}

/// Files on the local disk
pub struct NativeFileSystem {
    dispatcher: Arc<IoDispatcher>,
}

impl NativeFileSystem {
    pub fn new(dispatcher: Arc<IoDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl FileSystem for NativeFileSystem {
    fn open_async_read(&self, path: &Path) -> Option<Arc<dyn AsyncReadFile>> {
        let file = NativeFile::open(path).ok()?;
        Some(Arc::new(DispatchedFile::new(
            path,
            Arc::new(file),
            Arc::clone(&self.dispatcher),
        )))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        std::fs::metadata(path).ok().map(|m| m.len())
    }
}

/// In-memory file tree, used by tests and tools
pub struct MemoryFileSystem {
    files: RwLock<HashMap<PathBuf, Arc<[u8]>>>,
    failing: RwLock<HashSet<PathBuf>>,
    dispatcher: Arc<IoDispatcher>,
}

impl MemoryFileSystem {
    pub fn new(dispatcher: Arc<IoDispatcher>) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
            dispatcher,
        }
    }

    pub fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.files.write().insert(path.into(), Arc::from(data));
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.files.write().remove(path).is_some()
    }

    /// Make every read of `path` fail while keeping it visible
    pub fn set_failing(&self, path: impl Into<PathBuf>) {
        self.failing.write().insert(path.into());
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl FileSystem for MemoryFileSystem {
    fn open_async_read(&self, path: &Path) -> Option<Arc<dyn AsyncReadFile>> {
        let data = self.files.read().get(path).cloned()?;
        let name = path.display().to_string();
        let source: Arc<dyn BlockSource> = if self.failing.read().contains(path) {
            Arc::new(MemoryBlob::failing(&name, data))
        } else {
            Arc::new(MemoryBlob::new(&name, data))
        };
        Some(Arc::new(DispatchedFile::new(
            path,
            source,
            Arc::clone(&self.dispatcher),
        )))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        self.files.read().get(path).map(|d| d.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_native_file_read() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();
        tmp.flush().unwrap();

        let fs = NativeFileSystem::new(Arc::new(IoDispatcher::new(1)));
        assert!(fs.exists(tmp.path()));
        assert_eq!(fs.file_size(tmp.path()), Some(11));

        let file = fs.open_async_read(tmp.path()).unwrap();
        let request = file.read_request(6, 5, None);
        request.wait();
        assert_eq!(&*request.bytes().unwrap().unwrap(), b"world");
    }

    #[test]
    fn test_native_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = NativeFileSystem::new(Arc::new(IoDispatcher::new(1)));
        let path = dir.path().join("absent.pak");
        assert!(!fs.exists(&path));
        assert!(fs.open_async_read(&path).is_none());
    }

    #[test]
    fn test_memory_file_system() {
        let fs = MemoryFileSystem::new(Arc::new(IoDispatcher::new(1)));
        fs.insert("a.pak", vec![1, 2, 3]);
        assert_eq!(fs.len(), 1);
        let file = fs.open_async_read(Path::new("a.pak")).unwrap();
        let size = file.size_request(None);
        size.wait();
        assert_eq!(size.size().unwrap().unwrap(), 3);

        fs.set_failing("a.pak");
        let file = fs.open_async_read(Path::new("a.pak")).unwrap();
        let read = file.read_request(0, 3, None);
        read.wait();
        assert!(matches!(
            read.bytes().unwrap(),
            Err(ArchiveError::ReadFailed { .. })
        ));
        assert!(fs.remove(Path::new("a.pak")));
        assert!(fs.is_empty());
    }
}
