use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("file '{path}' not found")]
    NotFound { path: String },
    #[error("failed to read '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// File access for `embed` expressions. The compiler never touches the
/// filesystem directly, so tests can supply in-memory sources.
pub trait SourceReader {
    fn read(&self, path: &Path) -> Result<Vec<u8>, ReadError>;
}

#[derive(Debug, Default)]
pub struct StdSourceReader;

impl SourceReader for StdSourceReader {
    fn read(&self, path: &Path) -> Result<Vec<u8>, ReadError> {
        std::fs::read(path).map_err(|source| ReadError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Debug, Default)]
pub struct MemorySourceReader {
    files: FxHashMap<PathBuf, Vec<u8>>,
}

impl MemorySourceReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), bytes.into());
    }
}

impl SourceReader for MemorySourceReader {
    fn read(&self, path: &Path) -> Result<Vec<u8>, ReadError> {
        self.files.get(path).cloned().ok_or_else(|| ReadError::NotFound {
            path: path.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_reader_round_trips() {
        let mut reader = MemorySourceReader::new();
        reader.insert("tiles.chr", vec![0x55, 0xAA]);
        assert_eq!(
            reader.read(Path::new("tiles.chr")).expect("read"),
            vec![0x55, 0xAA]
        );
        assert!(reader.read(Path::new("missing.chr")).is_err());
    }
}
