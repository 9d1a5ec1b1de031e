//! Core types for the oxidized-pak loader
//!
//! This crate provides the foundational error types, configuration,
//! logging setup and the narrow collaborator interfaces (platform,
//! memory-scope tracking, crash context) the loader consumes.

pub mod config;
pub mod error;
pub mod instrumentation;
pub mod logging;
pub mod platform;

pub use config::{Config, PrecacheConfig};
pub use error::{ArchiveError, FormatError, LoadError, PakError, Result};
pub use instrumentation::{CrashContext, MemoryScopeTracker, TrackedScope};
pub use platform::{HostPlatform, Platform};
