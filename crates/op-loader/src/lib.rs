//! Asynchronous dependency-aware package loader
//!
//! Requests enter through [`AsyncLoader::enqueue`]. A loading thread (or the
//! owning thread, ticking cooperatively) reads each package's header, links
//! its imports against other in-flight packages through a shared
//! [`DependencyGraph`], creates and serializes its exports as their
//! prerequisites fire, and hands finished packages back to the owning thread
//! for postload, clustering and callbacks.

pub mod event_queue;
mod finalize;
pub mod graph;
pub mod handle;
mod loader;
mod loading;
pub mod missing;
pub mod object;
pub mod package;
pub mod reader;
pub mod request;
pub mod resolve;
pub mod signal;
pub mod stats;

pub use event_queue::{Event, EventKind, EventQueue};
pub use graph::{DependencyGraph, FiredNode, NodeId, NodePhase, NodeRange, NodeSpec, StallReport};
pub use handle::{PackageHandle, PackageTable, RequestId};
pub use loader::{AsyncLoader, LoaderServices};
pub use loading::TickResult;
pub use missing::MissingPackageCache;
pub use object::{
    child_path, ClassRegistry, Cluster, ConstructArgs, Object, ObjectData, ObjectFactory,
    ObjectFlags, ObjectRef, ObjectStore, RawData,
};
pub use package::PackageState;
pub use reader::{ExportReader, ObjectResolver};
pub use request::{CompletionCallback, LoadCompletion, LoadFlags, LoadResult};
pub use resolve::{ExportLookup, ImportIdentity};
pub use stats::{LoadStats, LoadStatsSnapshot};
