//! Encrypted JSON documents on disk.
//!
//! Each file holds the base64 text produced by [`CryptoEngine::encrypt`].
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so a failed write leaves the previous version readable.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::crypto::CryptoEngine;
use crate::error::{CryptoError, VaultError, VaultResult};

#[derive(Debug, Clone)]
pub struct EncryptedFile {
    path: PathBuf,
}

impl EncryptedFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// `Ok(None)` when the file does not exist yet.
    pub fn load<T: DeserializeOwned>(
        &self,
        engine: &CryptoEngine,
        password: &str,
    ) -> VaultResult<Option<T>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(VaultError::Io(err)),
        };
        // damaged bytes must fail exactly like a wrong password
        let text = String::from_utf8(bytes).map_err(|_| CryptoError::Decrypt)?;
        Ok(Some(engine.decrypt(&text, password)?))
    }

    pub fn save<T: Serialize + ?Sized>(
        &self,
        engine: &CryptoEngine,
        password: &str,
        value: &T,
    ) -> VaultResult<()> {
        let blob = engine.encrypt(value, password)?;
        self.write_blob(&blob)
    }

    pub(crate) fn write_blob(&self, blob: &str) -> VaultResult<()> {
        self.stage_blob(blob)?.commit()
    }

    /// Write `blob` beside the destination without replacing it yet.
    pub(crate) fn stage_blob(&self, blob: &str) -> VaultResult<StagedBlob> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut staged = NamedTempFile::new_in(&dir)?;
        staged.write_all(blob.as_bytes())?;
        staged.flush()?;
        Ok(StagedBlob {
            path: self.path.clone(),
            staged,
        })
    }

    pub fn remove(&self) -> VaultResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(VaultError::Io(err)),
        }
    }
}

/// A fully written temporary file waiting to be renamed over its destination.
/// Dropping it without committing deletes the temporary file.
pub(crate) struct StagedBlob {
    path: PathBuf,
    staged: NamedTempFile,
}

impl StagedBlob {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn commit(self) -> VaultResult<()> {
        self.staged
            .persist(&self.path)
            .map_err(|err| VaultError::Io(err.error))?;
        Ok(())
    }
}
