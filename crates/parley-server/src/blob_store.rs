use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use parley_shared::constants::MAX_TEXT_LEN;

use crate::error::ServerError;

/// Longest extension kept from an uploaded file name.
const MAX_EXTENSION_LEN: usize = 10;

/// Hex hash, a dot and the longest extension.
const MAX_KEY_LEN: usize = 64 + 1 + MAX_EXTENSION_LEN;

/// Verify that a resolved path stays within the expected base directory.
/// Prevents path traversal attacks.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Lowercased ASCII-alphanumeric extension of `file_name`, if it has a usable one.
fn sanitize_extension(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > MAX_EXTENSION_LEN {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// A stored key is `<64 hex chars>` optionally followed by `.<ext>`.
fn is_valid_key(key: &str) -> bool {
    let (hash, ext) = match key.split_once('.') {
        Some((hash, ext)) => (hash, Some(ext)),
        None => (key, None),
    };
    let hash_ok = hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit());
    let ext_ok = ext.map_or(true, |e| {
        !e.is_empty() && e.len() <= MAX_EXTENSION_LEN && e.chars().all(|c| c.is_ascii_alphanumeric())
    });
    hash_ok && ext_ok
}

/// Content-addressed attachment storage on the local filesystem.
///
/// Objects are named by the BLAKE3 hash of their bytes, so uploading the same
/// file twice yields the same key and a single file on disk.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
    public_base_url: String,
    max_size: usize,
}

impl BlobStore {
    pub async fn new(
        base_path: PathBuf,
        public_base_url: impl Into<String>,
        max_size: usize,
    ) -> Result<Self, ServerError> {
        let public_base_url = public_base_url.into().trim_end_matches('/').to_string();

        // Attachment links are sent as message text and must fit its limit.
        let longest_link = public_base_url.chars().count() + "/files/".len() + MAX_KEY_LEN;
        if longest_link > MAX_TEXT_LEN {
            return Err(ServerError::BlobStorage(format!(
                "Public base URL '{public_base_url}' is too long: attachment links would reach \
                 {longest_link} characters (max {MAX_TEXT_LEN})"
            )));
        }

        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::BlobStorage(format!(
                "Failed to create blob directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Blob store initialized");

        Ok(Self {
            base_path,
            public_base_url,
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Store `data` and return the public URL it is served from.
    pub async fn upload(&self, file_name: &str, data: &[u8]) -> Result<String, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest(format!("File '{file_name}' is empty")));
        }
        if data.len() > self.max_size {
            return Err(ServerError::BlobTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let hash = blake3::hash(data).to_hex();
        let key = match sanitize_extension(file_name) {
            Some(ext) => format!("{hash}.{ext}"),
            None => hash.to_string(),
        };
        let path = self.safe_blob_path(&key)?;

        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(key = %key, "Blob already stored");
        } else {
            fs::write(&path, data).await.map_err(|e| {
                ServerError::BlobStorage(format!("Failed to write blob {}: {}", key, e))
            })?;
            debug!(key = %key, size = data.len(), "Stored blob");
        }

        Ok(self.url_for(&key))
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.safe_blob_path(key)?;

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ServerError::BlobNotFound(key.to_string()));
        }

        let data = fs::read(&path)
            .await
            .map_err(|e| ServerError::BlobStorage(format!("Failed to read blob {}: {}", key, e)))?;

        debug!(key = %key, size = data.len(), "Retrieved blob");
        Ok(data)
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/files/{}", self.public_base_url, key)
    }

    fn safe_blob_path(&self, key: &str) -> Result<PathBuf, ServerError> {
        if !is_valid_key(key) {
            return Err(ServerError::BadRequest(format!("Invalid file key '{key}'")));
        }
        ensure_within(&self.base_path, &self.base_path.join(key))
    }
}

/// Best-effort `Content-Type` for a stored key.
pub fn content_type_for(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain; charset=utf-8",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
