//! Load requests and their completion results

use crate::handle::RequestId;
use crate::object::ObjectRef;
use bitflags::bitflags;
use op_core::error::PakError;
use op_format::PackageGuid;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Caller-supplied request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadFlags: u32 {
        /// Skip cluster creation for this package
        const NO_CLUSTERS     = 0b0000_0001;
        /// Do not record the package in the missing cache if absent
        const NO_MISSING_CACHE = 0b0000_0010;
    }
}

/// Outcome reported to completion callbacks
#[derive(Debug, Clone)]
pub enum LoadResult {
    Succeeded,
    Failed(Arc<PakError>),
    Canceled,
}

impl LoadResult {
    pub fn is_success(&self) -> bool {
        matches!(self, LoadResult::Succeeded)
    }

    pub fn error(&self) -> Option<&PakError> {
        match self {
            LoadResult::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for LoadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadResult::Succeeded => write!(f, "Succeeded"),
            LoadResult::Failed(e) => write!(f, "Failed ({})", e),
            LoadResult::Canceled => write!(f, "Canceled"),
        }
    }
}

/// What a completion callback receives
#[derive(Debug, Clone)]
pub struct LoadCompletion {
    pub request: RequestId,
    pub name: String,
    /// The package object on success
    pub object: Option<ObjectRef>,
    pub result: LoadResult,
}

/// Invoked exactly once per request, on the owning thread
pub type CompletionCallback = Box<dyn FnOnce(&LoadCompletion) + Send>;

/// A queued request
pub struct LoadRequest {
    pub id: RequestId,
    pub name: String,
    /// File to read when different from `name`
    pub load_from: Option<String>,
    pub guid: Option<PackageGuid>,
    pub priority: i32,
    pub flags: LoadFlags,
    pub callback: Option<CompletionCallback>,
}

impl LoadRequest {
    /// Name whose files are read
    pub fn source_name(&self) -> &str {
        self.load_from.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("load_from", &self.load_from)
            .field("priority", &self.priority)
            .finish()
    }
}

/// A callback waiting on a package
pub struct PendingCallback {
    pub request: RequestId,
    pub callback: Option<CompletionCallback>,
}

impl PendingCallback {
    /// Fire the callback with `completion` built for this request
    pub fn fire(self, name: &str, object: Option<ObjectRef>, result: &LoadResult) {
        let completion = LoadCompletion {
            request: self.request,
            name: name.to_string(),
            object,
            result: result.clone(),
        };
        if let Some(callback) = self.callback {
            callback(&completion);
        }
    }
}
