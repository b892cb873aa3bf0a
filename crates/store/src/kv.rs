//! Key-value backends.
//!
//! One JSON document per top-level key. `FileKv` keeps each key in its own
//! file under a state directory and writes atomically (tmp + rename);
//! `MemoryKv` backs tests and ephemeral runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value;

use sy_domain::error::{Error, Result};

/// Storage behind the persisted-object store. Keys are flat strings with
/// `:`-separated segments (`session:agent:main:…`, `config:channels`).
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn put(&self, key: &str, value: &Value) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`, unordered.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MemoryKv
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryKv {
    map: RwLock<HashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.map.write().insert(key.to_owned(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
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
// FileKv
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File-per-key store. Key characters outside `[A-Za-z0-9._-]` are
/// percent-encoded in the filename so arbitrary ids round-trip.
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let mut out = Vec::with_capacity(name.len());
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

impl KvBackend for FileKv {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let value = serde_json::from_str(&raw)
            .map_err(|e| Error::Store(format!("corrupt document for key {key}: {e}")))?;
        Ok(Some(value))
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string(value).map_err(Error::Json)?;
        std::fs::write(&tmp, json).map_err(Error::Io)?;
        std::fs::rename(&tmp, &path).map_err(Error::Io)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(Error::Io(e)),
        };
        for entry in entries {
            let entry = entry.map_err(Error::Io)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if let Some(key) = decode_key(stem) {
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
    use serde_json::json;

    #[test]
    fn memory_kv_roundtrip() {
        let kv = MemoryKv::new();
        kv.put("a:1", &json!({"x": 1})).unwrap();
        kv.put("a:2", &json!({"x": 2})).unwrap();
        kv.put("b:1", &json!(true)).unwrap();

        assert_eq!(kv.get("a:1").unwrap(), Some(json!({"x": 1})));
        assert_eq!(kv.get("missing").unwrap(), None);

        let mut keys = kv.keys("a:").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a:1", "a:2"]);

        kv.delete("a:1").unwrap();
        assert_eq!(kv.get("a:1").unwrap(), None);
    }

    #[test]
    fn file_kv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::new(dir.path()).unwrap();

        kv.put("session:agent:main", &json!({"id": "s1"})).unwrap();
        assert_eq!(
            kv.get("session:agent:main").unwrap(),
            Some(json!({"id": "s1"}))
        );

        // Survives a fresh handle over the same directory.
        let kv2 = FileKv::new(dir.path()).unwrap();
        assert_eq!(
            kv2.get("session:agent:main").unwrap(),
            Some(json!({"id": "s1"}))
        );
    }

    #[test]
    fn file_kv_encodes_awkward_keys() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::new(dir.path()).unwrap();

        let key = "pair:whatsapp:+33 6/12";
        kv.put(key, &json!(1)).unwrap();
        assert_eq!(kv.get(key).unwrap(), Some(json!(1)));
        assert_eq!(kv.keys("pair:").unwrap(), vec![key.to_string()]);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::new(dir.path()).unwrap();
        kv.delete("never-existed").unwrap();
    }

    #[test]
    fn key_encoding_roundtrips() {
        for key in ["plain", "a:b:c", "with space", "pct%41", "emoji✓"] {
            assert_eq!(decode_key(&encode_key(key)).as_deref(), Some(key));
        }
    }
}
