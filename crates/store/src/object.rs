//! Typed persisted objects over a [`KvBackend`].
//!
//! `PersistedMap<T>` caches one record per id under a shared key prefix and
//! writes through on every mutation. Reads hand out clones; there is no way
//! to observe a live handle, which is what makes every read JSON-plain.
//! `PersistedCell<T>` is the single-record variant for singleton state.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sy_domain::error::{Error, Result};

use crate::kv::KvBackend;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Nested references
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A reference to another persisted prefix, stored in place of the value so
/// nothing is duplicated. Serializes as `{"__persistedRef__": "<prefix>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRef {
    #[serde(rename = "__persistedRef__")]
    pub prefix: String,
}

impl StoreRef {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Rehydrate the reference to a live typed handle.
    pub fn resolve<T>(&self, kv: Arc<dyn KvBackend>) -> PersistedMap<T>
    where
        T: Serialize + DeserializeOwned + Clone + PartialEq,
    {
        PersistedMap::new(kv, &self.prefix)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PersistedMap
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Typed map persisted one record per key (`{prefix}:{id}`), with a
/// read-through cache hydrated lazily per id.
pub struct PersistedMap<T> {
    kv: Arc<dyn KvBackend>,
    prefix: String,
    cache: RwLock<HashMap<String, T>>,
    _marker: PhantomData<T>,
}

impl<T> PersistedMap<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq,
{
    pub fn new(kv: Arc<dyn KvBackend>, prefix: &str) -> Self {
        Self {
            kv,
            prefix: prefix.to_owned(),
            cache: RwLock::new(HashMap::new()),
            _marker: PhantomData,
        }
    }

    fn key_for(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    pub fn get(&self, id: &str) -> Result<Option<T>> {
        if let Some(value) = self.cache.read().get(id) {
            return Ok(Some(value.clone()));
        }
        let Some(raw) = self.kv.get(&self.key_for(id))? else {
            return Ok(None);
        };
        let value: T = serde_json::from_value(raw)
            .map_err(|e| Error::Store(format!("decoding {}:{id}: {e}", self.prefix)))?;
        self.cache.write().insert(id.to_owned(), value.clone());
        Ok(Some(value))
    }

    /// Write through. A value shallow-equal to the cached one is a no-op.
    pub fn put(&self, id: &str, value: T) -> Result<()> {
        if let Some(existing) = self.cache.read().get(id) {
            if *existing == value {
                return Ok(());
            }
        }
        let raw = serde_json::to_value(&value).map_err(Error::Json)?;
        self.kv.put(&self.key_for(id), &raw)?;
        self.cache.write().insert(id.to_owned(), value);
        Ok(())
    }

    /// Clone-mutate-commit. Returns `Ok(false)` when the id is absent.
    pub fn patch(&self, id: &str, mutate: impl FnOnce(&mut T)) -> Result<bool> {
        let Some(mut value) = self.get(id)? else {
            return Ok(false);
        };
        let before = value.clone();
        mutate(&mut value);
        if value != before {
            let raw = serde_json::to_value(&value).map_err(Error::Json)?;
            self.kv.put(&self.key_for(id), &raw)?;
            self.cache.write().insert(id.to_owned(), value);
        }
        Ok(true)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.kv.delete(&self.key_for(id))?;
        self.cache.write().remove(id);
        Ok(())
    }

    /// All ids currently persisted under the prefix.
    pub fn ids(&self) -> Result<Vec<String>> {
        let full_prefix = format!("{}:", self.prefix);
        Ok(self
            .kv
            .keys(&full_prefix)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&full_prefix).map(str::to_owned))
            .collect())
    }

    /// All `(id, record)` pairs, reading through the cache.
    pub fn entries(&self) -> Result<Vec<(String, T)>> {
        let mut out = Vec::new();
        for id in self.ids()? {
            if let Some(value) = self.get(&id)? {
                out.push((id, value));
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.ids()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.ids()?.is_empty())
    }

    /// A [`StoreRef`] pointing at this map, for nesting under another record.
    pub fn as_ref_marker(&self) -> StoreRef {
        StoreRef::new(self.prefix.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PersistedCell
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single persisted record under one fixed key.
pub struct PersistedCell<T> {
    kv: Arc<dyn KvBackend>,
    key: String,
    cache: RwLock<Option<T>>,
}

impl<T> PersistedCell<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq,
{
    pub fn new(kv: Arc<dyn KvBackend>, key: &str) -> Self {
        Self {
            kv,
            key: key.to_owned(),
            cache: RwLock::new(None),
        }
    }

    pub fn get(&self) -> Result<Option<T>> {
        if let Some(value) = self.cache.read().as_ref() {
            return Ok(Some(value.clone()));
        }
        let Some(raw) = self.kv.get(&self.key)? else {
            return Ok(None);
        };
        let value: T = serde_json::from_value(raw)
            .map_err(|e| Error::Store(format!("decoding {}: {e}", self.key)))?;
        *self.cache.write() = Some(value.clone());
        Ok(Some(value))
    }

    pub fn put(&self, value: T) -> Result<()> {
        if let Some(existing) = self.cache.read().as_ref() {
            if *existing == value {
                return Ok(());
            }
        }
        let raw = serde_json::to_value(&value).map_err(Error::Json)?;
        self.kv.put(&self.key, &raw)?;
        *self.cache.write() = Some(value);
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.kv.delete(&self.key)?;
        *self.cache.write() = None;
        Ok(())
    }
}

/// Check that a value is JSON-plain (serializable and free of any live
/// handle). Used by preview/snapshot paths that feed RPC responses.
pub fn to_plain_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        linked: Option<StoreRef>,
    }

    fn map(kv: &Arc<MemoryKv>) -> PersistedMap<Record> {
        PersistedMap::new(kv.clone() as Arc<dyn KvBackend>, "rec")
    }

    #[test]
    fn put_get_roundtrip() {
        let kv = Arc::new(MemoryKv::new());
        let records = map(&kv);
        records
            .put(
                "a",
                Record {
                    name: "alpha".into(),
                    count: 1,
                    linked: None,
                },
            )
            .unwrap();

        let got = records.get("a").unwrap().unwrap();
        assert_eq!(got.name, "alpha");

        // The raw key is prefixed.
        assert!(kv.get("rec:a").unwrap().is_some());
    }

    #[test]
    fn patch_writes_back_under_same_key() {
        let kv = Arc::new(MemoryKv::new());
        let records = map(&kv);
        records
            .put(
                "a",
                Record {
                    name: "alpha".into(),
                    count: 0,
                    linked: None,
                },
            )
            .unwrap();

        let found = records.patch("a", |r| r.count += 1).unwrap();
        assert!(found);
        assert_eq!(records.get("a").unwrap().unwrap().count, 1);
        assert_eq!(kv.get("rec:a").unwrap().unwrap()["count"], 1);

        assert!(!records.patch("missing", |r| r.count += 1).unwrap());
    }

    #[test]
    fn equal_put_skips_write() {
        let kv = Arc::new(MemoryKv::new());
        let records = map(&kv);
        let record = Record {
            name: "alpha".into(),
            count: 1,
            linked: None,
        };
        records.put("a", record.clone()).unwrap();
        kv.delete("rec:a").unwrap();
        // Equal value short-circuits before reaching the backend.
        records.put("a", record).unwrap();
        assert!(kv.get("rec:a").unwrap().is_none());
    }

    #[test]
    fn store_ref_marker_roundtrips_and_resolves() {
        let kv = Arc::new(MemoryKv::new());
        let children: PersistedMap<Record> =
            PersistedMap::new(kv.clone() as Arc<dyn KvBackend>, "child");
        children
            .put(
                "c1",
                Record {
                    name: "kid".into(),
                    count: 7,
                    linked: None,
                },
            )
            .unwrap();

        let records = map(&kv);
        records
            .put(
                "parent",
                Record {
                    name: "p".into(),
                    count: 0,
                    linked: Some(children.as_ref_marker()),
                },
            )
            .unwrap();

        // The marker, not the child value, is what landed on disk.
        let raw = kv.get("rec:parent").unwrap().unwrap();
        assert_eq!(raw["linked"]["__persistedRef__"], "child");

        let parent = records.get("parent").unwrap().unwrap();
        let resolved: PersistedMap<Record> =
            parent.linked.unwrap().resolve(kv as Arc<dyn KvBackend>);
        assert_eq!(resolved.get("c1").unwrap().unwrap().count, 7);
    }

    #[test]
    fn entries_survive_cold_cache() {
        let kv = Arc::new(MemoryKv::new());
        {
            let records = map(&kv);
            records
                .put(
                    "a",
                    Record {
                        name: "alpha".into(),
                        count: 1,
                        linked: None,
                    },
                )
                .unwrap();
            records
                .put(
                    "b",
                    Record {
                        name: "beta".into(),
                        count: 2,
                        linked: None,
                    },
                )
                .unwrap();
        }
        // Fresh handle, empty cache: rehydrates from the backend.
        let records = map(&kv);
        let mut entries = records.entries().unwrap();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].1.name, "beta");
    }

    #[test]
    fn cell_roundtrip() {
        let kv = Arc::new(MemoryKv::new());
        let cell: PersistedCell<Record> =
            PersistedCell::new(kv.clone() as Arc<dyn KvBackend>, "singleton");
        assert!(cell.get().unwrap().is_none());
        cell.put(Record {
            name: "one".into(),
            count: 1,
            linked: None,
        })
        .unwrap();
        assert_eq!(cell.get().unwrap().unwrap().name, "one");
        cell.clear().unwrap();
        assert!(cell.get().unwrap().is_none());
    }

    #[test]
    fn plain_json_snapshot_roundtrips() {
        let record = Record {
            name: "alpha".into(),
            count: 3,
            linked: None,
        };
        let value = to_plain_json(&record).unwrap();
        let text = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, back);
    }
}
