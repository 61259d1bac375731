//! Directory-backed reference store: one JPEG per resident, `<root>/<key>.jpg`.
//!
//! Writes go to a hidden staging file in the same directory and are renamed
//! into place, so a concurrent reader sees either the old reference or the
//! new one, never a partial file. A staged write that is not committed is
//! deleted when it goes out of scope.
//!
//! Staging files are created owner-only; references are widened to
//! `0644` before they are committed so other local readers can open them.

use crate::codec::{self, REFERENCE_JPEG_QUALITY};
use crate::error::FaceError;
use image::DynamicImage;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const REFERENCE_EXTENSION: &str = "jpg";
const STAGING_PREFIX: &str = ".staging-";
const MAX_KEY_LEN: usize = 128;
#[cfg(unix)]
const REFERENCE_MODE: u32 = 0o644;

/// Check that `key` can be used verbatim as a file stem.
pub fn validate_key(key: &str) -> Result<(), FaceError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(FaceError::InvalidIdentity(format!(
            "must be 1-{MAX_KEY_LEN} characters"
        )));
    }
    if key.starts_with('.') {
        return Err(FaceError::InvalidIdentity(format!("{key:?} must not start with '.'")));
    }
    if let Some(bad) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(FaceError::InvalidIdentity(format!(
            "{key:?} contains unsupported character {bad:?}"
        )));
    }
    Ok(())
}

/// Flat directory of reference images keyed by resident id.
#[derive(Debug, Clone)]
pub struct ReferenceStore {
    root: PathBuf,
}

impl ReferenceStore {
    /// The root directory is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location of the reference for `key`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, FaceError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.{REFERENCE_EXTENSION}")))
    }

    /// Encode `image` into a staging file next to its final location.
    pub fn stage(&self, key: &str, image: &DynamicImage) -> Result<StagedReference, FaceError> {
        let target = self.path_for(key)?;
        let jpeg = codec::encode_jpeg(image, REFERENCE_JPEG_QUALITY)?;

        fs::create_dir_all(&self.root).map_err(FaceError::StoreWrite)?;
        let mut file = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(&format!(".{REFERENCE_EXTENSION}"))
            .tempfile_in(&self.root)
            .map_err(FaceError::StoreWrite)?;
        file.write_all(&jpeg).map_err(FaceError::StoreWrite)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(fs::Permissions::from_mode(REFERENCE_MODE))
                .map_err(FaceError::StoreWrite)?;
        }
        file.as_file().sync_all().map_err(FaceError::StoreWrite)?;

        tracing::debug!(key, staged = %file.path().display(), bytes = jpeg.len(), "reference staged");

        Ok(StagedReference {
            key: key.to_string(),
            file,
            target,
        })
    }

    /// Store `image` as the reference for `key`, replacing any previous one.
    pub fn put(&self, key: &str, image: &DynamicImage) -> Result<PathBuf, FaceError> {
        self.stage(key, image)?.commit()
    }

    /// Reference image for `key`, or `None` if nothing is enrolled under it.
    pub fn get(&self, key: &str) -> Result<Option<DynamicImage>, FaceError> {
        let path = self.path_for(key)?;
        read_reference(&path)
    }

    /// Every enrolled `(key, path)`, sorted by key. A missing root is an empty store.
    pub fn list(&self) -> Result<Vec<(String, PathBuf)>, FaceError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FaceError::StoreRead(e)),
        };

        let mut refs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(FaceError::StoreRead)?;
            let path = entry.path();
            if !entry.file_type().map_err(FaceError::StoreRead)?.is_file() {
                continue;
            }
            let is_reference = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == REFERENCE_EXTENSION);
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_reference || validate_key(key).is_err() {
                continue;
            }
            refs.push((key.to_string(), path.clone()));
        }
        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }

    /// Delete the reference for `key`. Returns whether one existed.
    pub fn remove(&self, key: &str) -> Result<bool, FaceError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FaceError::StoreWrite(e)),
        }
    }

    pub fn len(&self) -> Result<usize, FaceError> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, FaceError> {
        Ok(self.len()? == 0)
    }
}

/// Read and decode a stored reference; `None` if the file does not exist.
pub fn read_reference(path: &Path) -> Result<Option<DynamicImage>, FaceError> {
    match fs::read(path) {
        Ok(bytes) => codec::decode_bytes(&bytes).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FaceError::StoreRead(e)),
    }
}

/// A fully written reference that is not yet visible under its key.
///
/// Dropping it without [`commit`](Self::commit) removes the staging file.
pub struct StagedReference {
    key: String,
    file: NamedTempFile,
    target: PathBuf,
}

impl StagedReference {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Decode the staged JPEG exactly as it will be stored.
    pub fn load(&self) -> Result<DynamicImage, FaceError> {
        let bytes = fs::read(self.file.path()).map_err(FaceError::StoreRead)?;
        codec::decode_bytes(&bytes)
    }

    /// Atomically move the staged file onto the key's path.
    pub fn commit(self) -> Result<PathBuf, FaceError> {
        self.file
            .persist(&self.target)
            .map_err(|e| FaceError::StoreWrite(e.error))?;
        tracing::debug!(key = %self.key, path = %self.target.display(), "reference committed");
        Ok(self.target)
    }
}
