//! Shared test utilities for bridge integration tests
//!
//! `MapHelper` is an in-memory helper implementation backed by two maps:
//! `debugName/breakpadId` to candidate path, and path to file contents.
//! `engine` hosts the scripted module engine that drives the real import
//! catalogue the way a compiled module would.

// Each test binary uses a different slice of these helpers.
#![allow(dead_code)]

pub mod engine;

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wasym_bridge::{CandidateInfo, FileHandle, HelperError, SymbolicationHelper};

// Re-export testing utilities
pub use pretty_assertions::assert_eq;

/// In-memory helper: candidate paths from a map, files from a map.
#[derive(Default)]
pub struct MapHelper {
    paths: HashMap<String, String>,
    files: HashMap<String, Vec<u8>>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl MapHelper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `debugName/breakpadId` to a candidate path.
    pub fn with_path(
        mut self,
        debug_name: &str,
        breakpad_id: &str,
        path: &str,
    ) -> Self {
        self.paths
            .insert(format!("{debug_name}/{breakpad_id}"), path.to_string());
        self
    }

    /// Provide file contents for a path.
    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.to_string(), contents.into());
        self
    }

    /// Names of files that have been closed.
    pub fn closed_files(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }

    /// Shared view of the closed-file log, for use after the helper moved
    /// into the bridge.
    pub fn closed_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.closed.clone()
    }
}

impl SymbolicationHelper for MapHelper {
    fn candidate_paths_for_debug_file(
        &self,
        info: CandidateInfo,
    ) -> Result<Vec<String>, HelperError> {
        let key = format!("{}/{}", info.debug_name, info.breakpad_id);
        Ok(self.paths.get(&key).cloned().into_iter().collect())
    }

    fn candidate_paths_for_binary(&self, _info: CandidateInfo) -> Result<Vec<String>, HelperError> {
        Ok(Vec::new())
    }

    fn read_file(
        &self,
        filename: &str,
    ) -> BoxFuture<'static, Result<Arc<dyn FileHandle>, HelperError>> {
        let name = filename.to_string();
        let contents = self.files.get(filename).cloned();
        let closed = self.closed.clone();
        Box::pin(async move {
            match contents {
                Some(bytes) => Ok(Arc::new(MemFile {
                    name,
                    bytes,
                    closed,
                }) as Arc<dyn FileHandle>),
                None => Err(HelperError::FileNotFound(name)),
            }
        })
    }
}

/// A file handle over an in-memory byte buffer.
pub struct MemFile {
    name: String,
    bytes: Vec<u8>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl FileHandle for MemFile {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_bytes_into(&self, buffer: &mut [u8], offset: u64) -> Result<(), HelperError> {
        let offset = offset as usize;
        let end = offset + buffer.len();
        if end > self.bytes.len() {
            return Err(HelperError::ReadFailed(format!(
                "range {offset}..{end} out of bounds for {}",
                self.name
            )));
        }
        buffer.copy_from_slice(&self.bytes[offset..end]);
        Ok(())
    }

    fn close(&self) {
        self.closed.lock().unwrap().push(self.name.clone());
    }
}

/// Helper that resolves candidate paths from a map and serves files from
/// the real file system.
#[derive(Default)]
pub struct DiskHelper {
    paths: HashMap<String, String>,
}

impl DiskHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, debug_name: &str, breakpad_id: &str, path: &str) -> Self {
        self.paths
            .insert(format!("{debug_name}/{breakpad_id}"), path.to_string());
        self
    }
}

impl SymbolicationHelper for DiskHelper {
    fn candidate_paths_for_debug_file(
        &self,
        info: CandidateInfo,
    ) -> Result<Vec<String>, HelperError> {
        let key = format!("{}/{}", info.debug_name, info.breakpad_id);
        Ok(self.paths.get(&key).cloned().into_iter().collect())
    }

    fn candidate_paths_for_binary(&self, _info: CandidateInfo) -> Result<Vec<String>, HelperError> {
        Ok(Vec::new())
    }

    fn read_file(
        &self,
        filename: &str,
    ) -> BoxFuture<'static, Result<Arc<dyn FileHandle>, HelperError>> {
        let name = filename.to_string();
        Box::pin(async move {
            let file =
                std::fs::File::open(&name).map_err(|_| HelperError::FileNotFound(name.clone()))?;
            let size = file
                .metadata()
                .map_err(|e| HelperError::ReadFailed(e.to_string()))?
                .len();
            Ok(Arc::new(DiskFile {
                size,
                file: Mutex::new(file),
            }) as Arc<dyn FileHandle>)
        })
    }
}

/// A file handle reading ranges out of a file on disk.
pub struct DiskFile {
    size: u64,
    file: Mutex<std::fs::File>,
}

impl FileHandle for DiskFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_bytes_into(&self, buffer: &mut [u8], offset: u64) -> Result<(), HelperError> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| HelperError::ReadFailed(e.to_string()))?;
        file.read_exact(buffer)
            .map_err(|e| HelperError::ReadFailed(e.to_string()))?;
        Ok(())
    }

    fn close(&self) {}
}
