//! Filesystem storage adapter.
//!
//! Each key maps to one file: components become nested directory entries,
//! percent-encoded so arbitrary component strings stay within portable
//! filename alphabets and decode losslessly on range loads.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

use super::{StorageAdapter, StorageError, StorageKey, StoredChunk};

/// Filesystem storage adapter rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Create an adapter rooted at `root`. The directory is created lazily
    /// on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &StorageKey) -> PathBuf {
        let mut path = self.root.clone();
        for component in key.components() {
            path.push(encode_component(component));
        }
        path
    }
}

/// Encode one key component as a single safe path segment.
///
/// ASCII alphanumerics plus `. _ -` pass through; every other byte becomes
/// `%XX`, including `%` itself so decoding is unambiguous.
fn encode_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Invert [`encode_component`]. Returns `None` for malformed escapes.
fn decode_component(segment: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(segment.len());
    let mut chars = segment.bytes();
    while let Some(byte) = chars.next() {
        if byte == b'%' {
            let hi = chars.next()?;
            let lo = chars.next()?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
        } else {
            bytes.push(byte);
        }
    }
    String::from_utf8(bytes).ok()
}

fn is_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

#[async_trait]
impl StorageAdapter for FsStorage {
    async fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, key: &StorageKey, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_range(&self, prefix: &StorageKey) -> Result<Vec<StoredChunk>, StorageError> {
        let base = self.path_for(prefix);

        // The prefix may name a single file (key == prefix) or a directory
        // of deeper keys.
        match tokio::fs::metadata(&base).await {
            Ok(meta) if meta.is_file() => {
                let data = tokio::fs::read(&base).await?;
                return Ok(vec![StoredChunk {
                    key: prefix.clone(),
                    data,
                }]);
            }
            Ok(_) => {}
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut chunks = Vec::new();
        let mut pending: Vec<(PathBuf, StorageKey)> = vec![(base, prefix.clone())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let segment = entry.file_name();
                let Some(component) = segment.to_str().and_then(decode_component) else {
                    tracing::warn!(path = %entry.path().display(), "skipping undecodable entry");
                    continue;
                };
                let key = key_prefix.clone().with_component(component);
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else {
                    let data = tokio::fs::read(entry.path()).await?;
                    chunks.push(StoredChunk { key, data });
                }
            }
        }
        chunks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(chunks)
    }

    async fn remove_range(&self, prefix: &StorageKey) -> Result<(), StorageError> {
        let base = self.path_for(prefix);
        match tokio::fs::metadata(&base).await {
            Ok(meta) if meta.is_file() => Ok(tokio::fs::remove_file(base).await?),
            Ok(_) => Ok(tokio::fs::remove_dir_all(base).await?),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
