//! Memory-mapped model file access.
//!
//! Maps the file read-only into the process address space so a loader can
//! parse it without copying it into owned memory first.

use std::fs::File;
use std::path::Path;

use llama_engine::{EngineError, Result};
use memmap2::Mmap;

/// A memory-mapped file handle.
///
/// The mapped region remains valid for the lifetime of this struct.
/// Dropping it unmaps the file.
pub struct MappedFile {
    mmap: Mmap,
    size: usize,
}

impl MappedFile {
    /// Map a file into memory.
    ///
    /// The file must not be modified while mapped. Model files are treated as
    /// read-only for the life of the mapping.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            EngineError::ModelLoad(format!("failed to open {}: {e}", path.display()))
        })?;

        let metadata = file.metadata().map_err(|e| {
            EngineError::ModelLoad(format!("failed to read metadata for {}: {e}", path.display()))
        })?;
        if metadata.is_dir() {
            return Err(EngineError::ModelLoad(format!("{} is a directory", path.display())));
        }

        let size = metadata.len() as usize;

        // Safety: the file is only read through this mapping and is not
        // modified externally while mapped.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                EngineError::ModelLoad(format!("failed to mmap {}: {e}", path.display()))
            })?
        };

        Ok(MappedFile { mmap, size })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Total file size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}
