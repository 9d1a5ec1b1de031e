//! Asynchronous file layer for oxidized-pak
//!
//! - [`file`]: the platform file abstraction with native and in-memory backends
//! - [`dispatcher`]: worker threads that run the blocking reads
//! - [`archive`]: the per-package precaching archive
//! - [`coalesce`]: merging export ranges into larger reads
//! - [`handler`]: the completion inbox drained by the loading thread

pub mod archive;
pub mod coalesce;
pub mod dispatcher;
pub mod file;
pub mod handler;
pub mod paths;
pub mod request;

pub use archive::{ArchiveNotify, ArchivePhase, PrecacheArchive};
pub use coalesce::{coalesce, ExportRange, MergedRead};
pub use dispatcher::{IoDispatcher, IoStats};
pub use file::{AsyncReadFile, BlockSource, FileSystem, MemoryFileSystem, NativeFileSystem};
pub use handler::{CompletedRead, IoNotice, PrecacheHandler, ReadId, Wakeup};
pub use paths::{ContentPaths, PackagePaths};
pub use request::{IoCallback, IoData, IoRequest};
