//! Error types for the oxidized-pak loader

use thiserror::Error;

/// Main error type for the loader
#[derive(Error, Debug)]
pub enum PakError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Container format errors raised while parsing a package header
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Bad magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("File version {found} is older than the minimum supported {minimum}")]
    VersionTooOld { found: u32, minimum: u32 },

    #[error("File version {found} is newer than the current {current}")]
    VersionTooNew { found: u32, current: u32 },

    #[error("Corrupt summary: {0}")]
    CorruptSummary(String),

    #[error("Truncated data: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Invalid object index {index} ({imports} imports, {exports} exports)")]
    InvalidIndex {
        index: i32,
        imports: usize,
        exports: usize,
    },

    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),
}

/// Errors raised by the precache archive and the async file layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    #[error("Read failed for {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("Read canceled")]
    Canceled,

    #[error("Read of {len} bytes at {offset} is outside the file ({size} bytes)")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("Archive is in an error state")]
    Sticky,

    #[error("Archive not open: {0}")]
    NotOpen(String),
}

/// Errors surfaced for a single package load
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Missing package: {0}")]
    MissingPackage(String),

    #[error("GUID mismatch for {package}: requested {requested}, found {found}")]
    GuidMismatch {
        package: String,
        requested: String,
        found: String,
    },

    #[error("Size mismatch serializing {object}: expected {expected} bytes, consumed {consumed}")]
    SizeMismatch {
        object: String,
        expected: u64,
        consumed: u64,
    },

    #[error("Failed to construct {object}: {message}")]
    ConstructionFailed { object: String, message: String },

    #[error("Failed to resolve import {import} of {package}")]
    ImportFailed { package: String, import: String },

    #[error("Dependency cycle detected: {0}")]
    GraphCycle(String),

    #[error("Load canceled")]
    Canceled,
}

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, PakError>;
