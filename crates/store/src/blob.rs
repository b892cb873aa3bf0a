//! Blob store for transcripts, media, and agent workspace files.
//!
//! Objects carry a content type plus free-form custom metadata (archival
//! counters, expiry stamps). `FsBlobStore` keeps the bytes at the key path
//! and the metadata in a `.meta.json` sidecar.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sy_domain::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeta {
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

impl BlobMeta {
    pub fn of(content_type: &str) -> Self {
        Self {
            content_type: content_type.to_owned(),
            custom: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.custom.insert(key.to_owned(), value.into());
        self
    }
}

pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8], meta: BlobMeta) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, BlobMeta)>>;
    fn delete(&self, key: &str) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MemoryBlobStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryBlobStore {
    map: RwLock<BTreeMap<String, (Vec<u8>, BlobMeta)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8], meta: BlobMeta) -> Result<()> {
        self.map
            .write()
            .insert(key.to_owned(), (bytes.to_vec(), meta));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, BlobMeta)>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .map
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FsBlobStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(Error::Io)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are slash-separated object paths; refuse traversal.
        if key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
            return Err(Error::Validation(format!("invalid blob key: {key}")));
        }
        Ok(self.root.join(key))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".meta.json");
        path.with_file_name(name)
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8], meta: BlobMeta) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        std::fs::write(&path, bytes).map_err(Error::Io)?;
        let meta_json = serde_json::to_string(&meta).map_err(Error::Json)?;
        std::fs::write(Self::meta_path(&path), meta_json).map_err(Error::Io)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(Vec<u8>, BlobMeta)>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(Error::Io)?;
        let meta = match std::fs::read_to_string(Self::meta_path(&path)) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => BlobMeta::default(),
        };
        Ok(Some((bytes, meta)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        for target in [Self::meta_path(&path), path] {
            match std::fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            for entry in entries {
                let entry = entry.map_err(Error::Io)?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel.to_string_lossy().replace('\\', "/");
                if key.ends_with(".meta.json") {
                    continue;
                }
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn BlobStore) {
        let meta = BlobMeta::of("application/gzip")
            .with("sessionId", "s1")
            .with("messageCount", "4");
        store.put("agents/main/sessions/s1.jsonl.gz", b"payload", meta).unwrap();

        let (bytes, meta) = store.get("agents/main/sessions/s1.jsonl.gz").unwrap().unwrap();
        assert_eq!(bytes, b"payload");
        assert_eq!(meta.content_type, "application/gzip");
        assert_eq!(meta.custom.get("messageCount").map(String::as_str), Some("4"));

        assert!(store.get("agents/main/sessions/other.jsonl.gz").unwrap().is_none());

        let keys = store.list("agents/main/").unwrap();
        assert_eq!(keys, vec!["agents/main/sessions/s1.jsonl.gz"]);

        store.delete("agents/main/sessions/s1.jsonl.gz").unwrap();
        assert!(store.get("agents/main/sessions/s1.jsonl.gz").unwrap().is_none());
        assert!(store.list("agents/").unwrap().is_empty());
    }

    #[test]
    fn memory_store_contract() {
        exercise(&MemoryBlobStore::new());
    }

    #[test]
    fn fs_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsBlobStore::new(dir.path()).unwrap());
    }

    #[test]
    fn fs_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path()).unwrap();
        assert!(store.put("../escape", b"x", BlobMeta::default()).is_err());
        assert!(store.get("a//b").is_err());
    }
}
