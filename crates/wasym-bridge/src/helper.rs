//! Helper contract
//!
//! The caller of an entry point supplies a helper: the domain collaborator
//! the module consults for candidate file paths and file contents. Path
//! lookups are synchronous; `read_file` is asynchronous and yields a file
//! handle the module reads through, directly into its own memory.

use futures_util::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

/// Failures reported by a helper implementation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HelperError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("{0}")]
    Other(String),
}

/// Identity of the library a path lookup is about.
///
/// `breakpad_id` disambiguates between builds of the same library name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInfo {
    pub debug_name: String,
    pub breakpad_id: String,
}

impl CandidateInfo {
    pub fn new(debug_name: impl Into<String>, breakpad_id: impl Into<String>) -> Self {
        Self {
            debug_name: debug_name.into(),
            breakpad_id: breakpad_id.into(),
        }
    }
}

/// An open file the module reads ranges out of.
///
/// `read_bytes_into` fills a caller-provided buffer from `offset`; with the
/// import surface in between, that buffer is a view directly into the
/// module's linear memory, so no intermediate copy is made.
pub trait FileHandle: Send + Sync {
    fn size(&self) -> u64;

    fn read_bytes_into(&self, buffer: &mut [u8], offset: u64) -> Result<(), HelperError>;

    fn close(&self);
}

/// The caller-supplied collaborator behind the domain imports.
///
/// Path lookups return a possibly empty list of candidates; an unmapped
/// library is an empty list, not an error.
pub trait SymbolicationHelper: Send + Sync {
    fn candidate_paths_for_debug_file(
        &self,
        info: CandidateInfo,
    ) -> Result<Vec<String>, HelperError>;

    fn candidate_paths_for_binary(&self, info: CandidateInfo) -> Result<Vec<String>, HelperError>;

    fn read_file(
        &self,
        filename: &str,
    ) -> BoxFuture<'static, Result<Arc<dyn FileHandle>, HelperError>>;
}
