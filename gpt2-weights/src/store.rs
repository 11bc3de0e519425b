#[cfg(test)]
#[path = "../tests/unit/store_test.rs"]
mod tests;

use crate::error::{Result, WeightsError};
use crate::utils::{MemoryMapper, for_each_le_chunk};
use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A key-value store holding a single weight blob under a fixed key.
///
/// Implementations overwrite on `put`, report [`WeightsError::CacheMiss`] from `get`
/// when empty, and treat `delete` of an absent entry as success.
pub trait BlobStore {
    /// Stores `values`, replacing any existing entry.
    fn put(&mut self, values: &[f32]) -> Result<()>;

    /// Returns the stored values.
    fn get(&self) -> Result<Vec<f32>>;

    /// Removes the stored entry.
    fn delete(&mut self) -> Result<()>;

    /// Reports whether an entry is present without reading its payload.
    fn exists(&self) -> Result<bool>;
}

/// Blob store backed by a single file in a cache directory.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    const ENTRY_FILE_NAME: &'static str = "params.bin";
    const TEMP_SUFFIX: &'static str = "partial";

    /// Creates a store whose entry lives inside `cache_dir`. The directory is created lazily on `put`.
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self { path: cache_dir.as_ref().join(Self::ENTRY_FILE_NAME) }
    }

    /// Location of the cached entry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entry(&self, values: &[f32]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension(Self::TEMP_SUFFIX);
        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            for_each_le_chunk(values, |bytes| writer.write_all(bytes))?;
            writer.flush()?;
        }

        fs::rename(&temp_path, &self.path)
    }
}

impl BlobStore for FileBlobStore {
    fn put(&mut self, values: &[f32]) -> Result<()> {
        info!("💾 Caching {} weights at {}", values.len(), self.path.display());

        self.write_entry(values).map_err(|e| {
            // leave no half-written sibling behind
            let _ = fs::remove_file(self.path.with_extension(Self::TEMP_SUFFIX));
            WeightsError::CacheWrite(format!("{}: {e}", self.path.display()))
        })
    }

    fn get(&self) -> Result<Vec<f32>> {
        if !self.exists()? {
            return Err(WeightsError::CacheMiss);
        }

        let file = File::open(&self.path)
            .map_err(|e| WeightsError::CacheRead(format!("{}: {e}", self.path.display())))?;

        // Mapping an empty file fails on some platforms.
        if file.metadata()?.len() == 0 {
            return Ok(Vec::new());
        }

        let mapper = MemoryMapper::new(&file)?;
        debug!("Mapped {} cached bytes from {}", mapper.len(), self.path.display());
        mapper.read_f32_all()
    }

    fn delete(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("🗑️ Removed cached weights at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.path.try_exists()?)
    }
}

/// Blob store kept in process memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    entry: Option<Vec<f32>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for InMemoryStore {
    fn put(&mut self, values: &[f32]) -> Result<()> {
        self.entry = Some(values.to_vec());
        Ok(())
    }

    fn get(&self) -> Result<Vec<f32>> {
        self.entry.clone().ok_or(WeightsError::CacheMiss)
    }

    fn delete(&mut self) -> Result<()> {
        self.entry = None;
        Ok(())
    }

    fn exists(&self) -> Result<bool> {
        Ok(self.entry.is_some())
    }
}
