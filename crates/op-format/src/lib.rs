//! Package container format for oxidized-pak
//!
//! A package is laid out as
//!
//! ```text
//! [Summary] [Import Table] [Export Table] [Dependency Array] | [Export Bodies...]
//! ```
//!
//! Everything left of `|` is the header (`total_header_size` bytes). In the
//! split layout the bodies live in a second file that continues the same
//! logical offset space.

pub mod builder;
pub mod bytes;
pub mod export;
pub mod header;
pub mod import;
pub mod index;
pub mod summary;

// Re-export main types
pub use builder::{BuiltPackage, Layout, PackageBuilder};
pub use export::{DependencyEdge, DependencyKind, ExportEntry, ExportFlags};
pub use header::PackageHeader;
pub use import::{ImportEntry, CLASS_CLASS, CORE_SCRIPT_PACKAGE, PACKAGE_CLASS, SCRIPT_PREFIX};
pub use index::{ObjectSlot, PackageIndex};
pub use summary::{
    PackageFlags, PackageGuid, PackageSummary, FILE_VERSION_CURRENT, FILE_VERSION_MIN,
    PACKAGE_MAGIC, SUMMARY_PEEK_SIZE,
};
