//! Precaching archive over one package
//!
//! The archive walks a package through its read phases:
//!
//! ```text
//! WaitingForSize -> WaitingForSummary -> WaitingForHeader -> WaitingForFirstExport -> ProcessingExports
//! ```
//!
//! Split packages skip the summary peek: the header file size is the header
//! size. Once the first export is touched the archive opens the body file and
//! maps logical offsets at or past the header onto it.
//!
//! Resident data is kept as a set of blocks keyed by logical offset. Any read
//! failure or cancellation is sticky.

use crate::file::{AsyncReadFile, FileSystem};
use crate::paths::PackagePaths;
use crate::request::{IoCallback, IoRequest};
use op_core::error::{ArchiveError, FormatError, PakError};
use op_format::{PackageSummary, SUMMARY_PEEK_SIZE};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Wakes whoever polls this archive
pub type ArchiveNotify = Arc<dyn Fn() + Send + Sync>;

/// Read phase of a [`PrecacheArchive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArchivePhase {
    WaitingForSize,
    WaitingForSummary,
    WaitingForHeader,
    WaitingForFirstExport,
    ProcessingExports,
}

struct PendingRead {
    offset: u64,
    request: Arc<IoRequest>,
}

/// Archive that prefetches ranges asynchronously and serves resident bytes
pub struct PrecacheArchive {
    name: String,
    fs: Arc<dyn FileSystem>,
    header_file: Arc<dyn AsyncReadFile>,
    body_path: Option<PathBuf>,
    body_file: Option<Arc<dyn AsyncReadFile>>,
    phase: ArchivePhase,
    notify: ArchiveNotify,
    size_request: Option<Arc<IoRequest>>,
    header_file_size: u64,
    header_size: u64,
    logical_size: u64,
    blocks: BTreeMap<u64, Arc<[u8]>>,
    pending: Option<PendingRead>,
    pos: u64,
    error: Option<ArchiveError>,
    min_read_size: u64,
    reading_header: bool,
}

impl PrecacheArchive {
    /// Open the header file of `name` and issue the size request.
    ///
    /// A body file next to the header selects the split layout.
    pub fn open(
        name: &str,
        fs: Arc<dyn FileSystem>,
        paths: &PackagePaths,
        min_read_size: u64,
        notify: ArchiveNotify,
    ) -> Result<Self, ArchiveError> {
        let header_file = fs
            .open_async_read(&paths.header)
            .ok_or_else(|| ArchiveError::NotOpen(paths.header.display().to_string()))?;
        let body_path = fs.exists(&paths.body).then(|| paths.body.clone());

        let mut archive = Self {
            name: name.to_string(),
            fs,
            header_file,
            body_path,
            body_file: None,
            phase: ArchivePhase::WaitingForSize,
            notify,
            size_request: None,
            header_file_size: 0,
            header_size: 0,
            logical_size: 0,
            blocks: BTreeMap::new(),
            pending: None,
            pos: 0,
            error: None,
            min_read_size: min_read_size.max(SUMMARY_PEEK_SIZE as u64),
            reading_header: false,
        };
        let callback = archive.callback();
        archive.size_request = Some(archive.header_file.size_request(Some(callback)));
        debug!(
            "Opened archive for {} ({})",
            archive.name,
            if archive.is_split() { "split" } else { "combined" }
        );
        Ok(archive)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> ArchivePhase {
        self.phase
    }

    pub fn is_split(&self) -> bool {
        self.body_path.is_some()
    }

    /// Header length, valid once the header is resident
    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Size of the logical offset space (header plus bodies)
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    pub fn error(&self) -> Option<&ArchiveError> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// True while a phase read is outstanding
    pub fn is_waiting(&self) -> bool {
        self.error.is_none() && (self.size_request.is_some() || self.pending.is_some())
    }

    fn callback(&self) -> IoCallback {
        let notify = Arc::clone(&self.notify);
        Box::new(move |_| notify())
    }

    fn fail(&mut self, error: ArchiveError) -> ArchiveError {
        if self.error.is_none() {
            warn!("Archive {} failed: {}", self.name, error);
            self.error = Some(error.clone());
        }
        error
    }

    fn fail_format(&mut self, error: FormatError) -> PakError {
        self.fail(ArchiveError::ReadFailed {
            path: self.header_file.path().display().to_string(),
            message: error.to_string(),
        });
        error.into()
    }

    /// Advance through the header phases.
    ///
    /// Returns `Ok(true)` once the header is resident and `Ok(false)` while
    /// reads are outstanding.
    pub fn poll(&mut self) -> Result<bool, PakError> {
        if self.error.is_some() {
            return Err(ArchiveError::Sticky.into());
        }
        loop {
            match self.phase {
                ArchivePhase::WaitingForSize => {
                    let result = match self.size_request.as_ref().map(|r| r.size()) {
                        Some(Some(result)) => result,
                        Some(None) => return Ok(false),
                        None => return Err(self.fail(ArchiveError::NotOpen(self.name.clone())).into()),
                    };
                    self.size_request = None;
                    let size = result.map_err(|e| self.fail(e))?;
                    self.header_file_size = size;
                    self.logical_size = size;
                    if self.is_split() {
                        self.header_size = size;
                        self.start_read(0, size)?;
                        self.phase = ArchivePhase::WaitingForHeader;
                    } else {
                        self.start_read(0, self.min_read_size.min(size))?;
                        self.phase = ArchivePhase::WaitingForSummary;
                    }
                }
                ArchivePhase::WaitingForSummary => {
                    if !self.install_pending()? {
                        return Ok(false);
                    }
                    let block = self.blocks.get(&0).cloned().unwrap_or_else(|| Arc::from(Vec::new()));
                    let header_size = self.peek_header_size(&block)?;
                    self.header_size = header_size;
                    if block.len() as u64 >= header_size {
                        self.phase = ArchivePhase::WaitingForFirstExport;
                    } else {
                        self.start_read(0, header_size)?;
                        self.phase = ArchivePhase::WaitingForHeader;
                    }
                }
                ArchivePhase::WaitingForHeader => {
                    if !self.install_pending()? {
                        return Ok(false);
                    }
                    let block = self.blocks.get(&0).cloned().unwrap_or_else(|| Arc::from(Vec::new()));
                    let header_size = self.peek_header_size(&block)?;
                    if (block.len() as u64) < header_size {
                        return Err(self
                            .fail(ArchiveError::OutOfBounds {
                                offset: 0,
                                len: header_size,
                                size: block.len() as u64,
                            })
                            .into());
                    }
                    self.header_size = header_size;
                    self.phase = ArchivePhase::WaitingForFirstExport;
                }
                ArchivePhase::WaitingForFirstExport | ArchivePhase::ProcessingExports => {
                    return Ok(true)
                }
            }
        }
    }

    fn peek_header_size(&mut self, block: &[u8]) -> Result<u64, PakError> {
        match PackageSummary::peek_header_size(block) {
            Ok(Some(size)) if size as u64 <= self.header_file_size => Ok(size as u64),
            Ok(Some(size)) => Err(self.fail_format(FormatError::CorruptSummary(format!(
                "header size {} exceeds file size {}",
                size, self.header_file_size
            )))),
            Ok(None) => Err(self.fail_format(FormatError::Truncated {
                offset: 0,
                needed: SUMMARY_PEEK_SIZE,
                available: block.len(),
            })),
            Err(e) => Err(self.fail_format(e)),
        }
    }

    /// Move a completed pending read into the resident set.
    ///
    /// Returns `Ok(false)` while the read is still in flight.
    fn install_pending(&mut self) -> Result<bool, ArchiveError> {
        let result = match &self.pending {
            None => return Ok(true),
            Some(pending) => match pending.request.bytes() {
                None => return Ok(false),
                Some(result) => (pending.offset, result),
            },
        };
        self.pending = None;
        match result {
            (offset, Ok(bytes)) => {
                trace!("{}: installed {} bytes at {}", self.name, bytes.len(), offset);
                self.blocks.insert(offset, bytes);
                Ok(true)
            }
            (_, Err(e)) => Err(self.fail(e)),
        }
    }

    fn start_read(&mut self, offset: u64, len: u64) -> Result<(), ArchiveError> {
        let callback = self.callback();
        match self.issue_read(offset, len, Some(callback)) {
            Ok(request) => {
                self.pending = Some(PendingRead { offset, request });
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Issue a read of the logical range `[offset, offset + len)` without
    /// tracking it. Used for coalesced export reads.
    pub fn issue_read(
        &self,
        offset: u64,
        len: u64,
        callback: Option<IoCallback>,
    ) -> Result<Arc<IoRequest>, ArchiveError> {
        if self.error.is_some() {
            return Err(ArchiveError::Sticky);
        }
        let out_of_bounds = ArchiveError::OutOfBounds {
            offset,
            len,
            size: self.logical_size,
        };
        let end = offset.checked_add(len).ok_or_else(|| out_of_bounds.clone())?;
        if end > self.logical_size {
            return Err(out_of_bounds);
        }
        match &self.body_file {
            Some(body) if offset >= self.header_size => {
                Ok(body.read_request(offset - self.header_size, len, callback))
            }
            Some(_) if end > self.header_size => Err(out_of_bounds),
            _ => Ok(self.header_file.read_request(offset, len, callback)),
        }
    }

    fn read_limit(&self, offset: u64) -> u64 {
        if self.body_file.is_some() && offset < self.header_size {
            self.header_size
        } else {
            self.logical_size
        }
    }

    fn block_containing(&self, offset: u64, len: u64) -> Option<(u64, Arc<[u8]>)> {
        let (start, block) = self.blocks.range(..=offset).next_back()?;
        (start + block.len() as u64 >= offset + len).then(|| (*start, Arc::clone(block)))
    }

    pub fn is_resident(&self, offset: u64, len: u64) -> bool {
        self.block_containing(offset, len).is_some()
    }

    /// Make `[offset, offset + len)` resident.
    ///
    /// Returns true when the range is already resident (or the archive has
    /// failed, so there is nothing to wait for); otherwise a read is in flight.
    pub fn precache(&mut self, offset: u64, len: u64) -> bool {
        if self.error.is_some() || len == 0 || self.is_resident(offset, len) {
            return true;
        }
        if self.install_pending().is_err() {
            return true;
        }
        if self.is_resident(offset, len) {
            return true;
        }
        if let Some(pending) = &self.pending {
            if pending.offset <= offset && pending.offset + pending.request.len() >= offset + len {
                return false;
            }
            pending.request.cancel();
            self.pending = None;
        }
        let limit = self.read_limit(offset);
        let read_len = len.max(self.min_read_size.min(limit.saturating_sub(offset)));
        if self.start_read(offset, read_len).is_err() {
            return true;
        }
        false
    }

    /// Copy bytes at the cursor into `dst`, blocking only when not resident
    pub fn serialize(&mut self, dst: &mut [u8]) -> Result<(), ArchiveError> {
        if self.error.is_some() {
            return Err(ArchiveError::Sticky);
        }
        let len = dst.len() as u64;
        if len == 0 {
            return Ok(());
        }
        let offset = self.pos;
        if !self.precache(offset, len) {
            if let Some(pending) = &self.pending {
                pending.request.wait();
            }
            self.install_pending()?;
        }
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let (start, block) =
            self.block_containing(offset, len)
                .ok_or(ArchiveError::OutOfBounds {
                    offset,
                    len,
                    size: self.logical_size,
                })?;
        let local = (offset - start) as usize;
        dst.copy_from_slice(&block[local..local + dst.len()]);
        self.pos += len;
        Ok(())
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// The resident header block, once the header phases are done
    pub fn header_block(&self) -> Option<Arc<[u8]>> {
        if self.phase < ArchivePhase::WaitingForFirstExport {
            return None;
        }
        self.blocks.get(&0).cloned()
    }

    pub fn start_reading_header(&mut self) {
        self.reading_header = true;
        self.pos = 0;
    }

    /// Finish header parsing and drop the header block
    pub fn end_reading_header(&mut self) {
        self.reading_header = false;
        if let Some(block) = self.blocks.remove(&0) {
            trace!("{}: released {} header bytes", self.name, block.len());
        }
    }

    pub fn is_reading_header(&self) -> bool {
        self.reading_header
    }

    /// Switch to export processing, opening the body file in the split layout
    pub fn first_export_starting(&mut self) -> Result<(), ArchiveError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        match self.phase {
            ArchivePhase::ProcessingExports => return Ok(()),
            ArchivePhase::WaitingForFirstExport => {}
            _ => return Err(ArchiveError::NotOpen(self.name.clone())),
        }
        if let Some(body_path) = self.body_path.clone() {
            let opened = self
                .fs
                .open_async_read(&body_path)
                .zip(self.fs.file_size(&body_path));
            let Some((file, size)) = opened else {
                return Err(self.fail(ArchiveError::NotOpen(body_path.display().to_string())));
            };
            self.body_file = Some(file);
            self.logical_size = self.header_size + size;
            debug!(
                "{}: reading bodies from {} ({} bytes)",
                self.name,
                body_path.display(),
                size
            );
        }
        self.phase = ArchivePhase::ProcessingExports;
        Ok(())
    }

    /// Install an externally read block
    pub fn add_block(&mut self, offset: u64, bytes: Arc<[u8]>) {
        self.blocks.insert(offset, bytes);
    }

    /// Drop the block at `offset`, returning its length
    pub fn release_block(&mut self, offset: u64) -> Option<usize> {
        self.blocks.remove(&offset).map(|b| b.len())
    }

    pub fn resident_bytes(&self) -> u64 {
        self.blocks.values().map(|b| b.len() as u64).sum()
    }

    /// Cancel outstanding reads and put the archive in the error state
    pub fn cancel(&mut self) {
        if let Some(request) = self.size_request.take() {
            request.cancel();
        }
        if let Some(pending) = self.pending.take() {
            pending.request.cancel();
        }
        self.blocks.clear();
        if self.error.is_none() {
            self.error = Some(ArchiveError::Canceled);
        }
    }
}

impl Drop for PrecacheArchive {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.request.cancel();
        }
    }
}
