//! Layered config store.
//!
//! The baked-in defaults come from `GatewayConfig::default()`; the override
//! tree is free-form JSON persisted one document per top-level section
//! (`config:model`, `config:channels`, …). Reads deep-merge the two:
//! primitives and arrays replace, objects recurse. Every read returns a
//! plain detached `Value`; snapshots always survive stringify/parse.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use sy_domain::config::GatewayConfig;
use sy_domain::error::{Error, Result};
use sy_store::KvBackend;

const KEY_PREFIX: &str = "config:";

/// Paths whose string values are masked in the safe view.
const SECRET_SECTIONS: &[&str] = &["apiKeys"];
const SECRET_PATHS: &[&str] = &["auth.token"];
const MASK: &str = "***";

pub struct ConfigStore {
    kv: Arc<dyn KvBackend>,
    /// Top-level section → override document.
    overrides: RwLock<Map<String, Value>>,
}

impl ConfigStore {
    pub fn load(kv: Arc<dyn KvBackend>) -> Result<Self> {
        let mut overrides = Map::new();
        for key in kv.keys(KEY_PREFIX)? {
            let Some(section) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            if let Some(value) = kv.get(&key)? {
                overrides.insert(section.to_owned(), value);
            }
        }
        tracing::info!(sections = overrides.len(), "config overrides loaded");
        Ok(Self {
            kv,
            overrides: RwLock::new(overrides),
        })
    }

    /// Seed overrides from a TOML bootstrap document (`switchyard.toml`).
    /// Persisted like any other write, section by section.
    pub fn seed_from_toml(&self, raw: &str) -> Result<()> {
        let parsed: toml::Value = raw
            .parse()
            .map_err(|e| Error::Config(format!("parsing bootstrap config: {e}")))?;
        let json = serde_json::to_value(parsed).map_err(Error::Json)?;
        let Value::Object(sections) = json else {
            return Err(Error::Config("bootstrap config must be a table".into()));
        };
        for (section, value) in sections {
            self.kv.put(&format!("{KEY_PREFIX}{section}"), &value)?;
            self.overrides.write().insert(section, value);
        }
        Ok(())
    }

    fn defaults() -> Value {
        serde_json::to_value(GatewayConfig::default()).unwrap_or(Value::Null)
    }

    /// The merged config tree as a plain JSON value.
    pub fn merged(&self) -> Value {
        let mut base = Self::defaults();
        let overrides = self.overrides.read();
        if let Value::Object(base_map) = &mut base {
            for (section, value) in overrides.iter() {
                match base_map.entry(section.clone()) {
                    serde_json::map::Entry::Occupied(mut slot) => {
                        deep_merge(slot.get_mut(), value)
                    }
                    serde_json::map::Entry::Vacant(slot) => {
                        slot.insert(value.clone());
                    }
                }
            }
        }
        base
    }

    /// The merged tree deserialized into the typed config. Unknown override
    /// keys are carried in the JSON view but ignored here.
    pub fn typed(&self) -> GatewayConfig {
        serde_json::from_value(self.merged()).unwrap_or_default()
    }

    /// Read a dotted path (`None`/empty = the whole tree). Missing paths
    /// read as `Null`.
    pub fn get(&self, path: Option<&str>) -> Value {
        let merged = self.merged();
        let Some(path) = path.filter(|p| !p.is_empty()) else {
            return merged;
        };
        let mut cursor = &merged;
        for segment in path.split('.') {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => return Value::Null,
            }
        }
        cursor.clone()
    }

    /// The safe view: secret strings replaced with `"***"`.
    pub fn get_masked(&self, path: Option<&str>) -> Value {
        let mut merged = self.merged();
        for section in SECRET_SECTIONS {
            if let Some(Value::Object(map)) = merged.get_mut(*section) {
                for (_, slot) in map.iter_mut() {
                    if slot.is_string() {
                        *slot = Value::String(MASK.into());
                    }
                }
            }
        }
        for secret_path in SECRET_PATHS {
            mask_path(&mut merged, secret_path);
        }
        let Some(path) = path.filter(|p| !p.is_empty()) else {
            return merged;
        };
        let mut cursor = &merged;
        for segment in path.split('.') {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => return Value::Null,
            }
        }
        cursor.clone()
    }

    /// Write a dotted path, creating intermediate objects. `Null` deletes
    /// the addressed key. Only the affected top-level section is rewritten.
    pub fn set(&self, path: &str, value: Value) -> Result<()> {
        let mut segments = path.split('.').filter(|s| !s.is_empty());
        let Some(section) = segments.next() else {
            return Err(Error::Validation("empty config path".into()));
        };
        let rest: Vec<&str> = segments.collect();

        let mut overrides = self.overrides.write();
        let mut doc = overrides
            .get(section)
            .cloned()
            .unwrap_or(Value::Object(Map::new()));

        if rest.is_empty() {
            doc = value;
        } else {
            set_nested(&mut doc, &rest, value)?;
        }

        if doc.is_null() {
            self.kv.delete(&format!("{KEY_PREFIX}{section}"))?;
            overrides.remove(section);
        } else {
            self.kv.put(&format!("{KEY_PREFIX}{section}"), &doc)?;
            overrides.insert(section.to_owned(), doc);
        }
        Ok(())
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.entry(key.clone()) {
                    serde_json::map::Entry::Occupied(mut slot) => deep_merge(slot.get_mut(), value),
                    serde_json::map::Entry::Vacant(slot) => {
                        slot.insert(value.clone());
                    }
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay.clone(),
    }
}

fn set_nested(doc: &mut Value, path: &[&str], value: Value) -> Result<()> {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let Some((head, rest)) = path.split_first() else {
        *doc = value;
        return Ok(());
    };
    let Value::Object(map) = doc else {
        return Err(Error::Validation("config path traverses a non-object".into()));
    };
    if rest.is_empty() {
        if value.is_null() {
            map.remove(*head);
        } else {
            map.insert((*head).to_owned(), value);
        }
        return Ok(());
    }
    let slot = map
        .entry((*head).to_owned())
        .or_insert(Value::Object(Map::new()));
    set_nested(slot, rest, value)
}

fn mask_path(root: &mut Value, path: &str) {
    let mut cursor = root;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let Some(next) = cursor.get_mut(*segment) else {
            return;
        };
        if i == segments.len() - 1 {
            if next.is_string() {
                *next = Value::String(MASK.into());
            }
            return;
        }
        cursor = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sy_store::MemoryKv;

    fn store() -> (Arc<MemoryKv>, ConfigStore) {
        let kv = Arc::new(MemoryKv::new());
        let store = ConfigStore::load(kv.clone() as Arc<dyn KvBackend>).unwrap();
        (kv, store)
    }

    #[test]
    fn set_then_get_roundtrip() {
        let (_, store) = store();
        store.set("systemPrompt", json!("test-123")).unwrap();
        assert_eq!(store.get(Some("systemPrompt")), json!("test-123"));
    }

    #[test]
    fn nested_set_creates_intermediates() {
        let (kv, store) = store();
        store
            .set("channels.whatsapp.dmPolicy", json!("pairing"))
            .unwrap();
        assert_eq!(store.get(Some("channels.whatsapp.dmPolicy")), json!("pairing"));
        // Only the affected top-level section landed on disk.
        let keys = kv.keys("config:").unwrap();
        assert_eq!(keys, vec!["config:channels"]);
        // And defaults still merge underneath.
        assert_eq!(store.get(Some("timeouts.toolMs")), json!(60_000));
    }

    #[test]
    fn typed_view_reflects_overrides() {
        let (_, store) = store();
        store.set("timeouts.toolMs", json!(1234)).unwrap();
        assert_eq!(store.typed().timeouts.tool_ms, 1234);
        // Defaults elsewhere untouched.
        assert_eq!(store.typed().timeouts.llm_ms, 120_000);
    }

    #[test]
    fn arrays_replace_instead_of_merging() {
        let (_, store) = store();
        store
            .set("channels.wa.allowFrom", json!(["+331", "+332"]))
            .unwrap();
        store.set("channels.wa.allowFrom", json!(["+333"])).unwrap();
        assert_eq!(store.get(Some("channels.wa.allowFrom")), json!(["+333"]));
    }

    #[test]
    fn null_deletes() {
        let (_, store) = store();
        store.set("session.mainKey", json!("primary")).unwrap();
        store.set("session.mainKey", Value::Null).unwrap();
        // Falls back to the default.
        assert_eq!(store.get(Some("session.mainKey")), json!("main"));
    }

    #[test]
    fn masked_view_hides_secrets() {
        let (_, store) = store();
        store.set("apiKeys.anthropic", json!("sk-secret")).unwrap();
        store.set("auth.token", json!("hunter2")).unwrap();

        assert_eq!(store.get_masked(Some("apiKeys.anthropic")), json!("***"));
        assert_eq!(store.get_masked(Some("auth.token")), json!("***"));
        // The real view still has them.
        assert_eq!(store.get(Some("apiKeys.anthropic")), json!("sk-secret"));
    }

    #[test]
    fn snapshot_is_json_plain() {
        let (_, store) = store();
        store.set("channels.wa.dmPolicy", json!("open")).unwrap();
        let snapshot = store.get(Some("channels"));
        let text = serde_json::to_string(&snapshot).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(snapshot, back);
    }

    #[test]
    fn overrides_survive_reload() {
        let kv = Arc::new(MemoryKv::new());
        {
            let store = ConfigStore::load(kv.clone() as Arc<dyn KvBackend>).unwrap();
            store.set("model.id", json!("claude-opus-4-20250514")).unwrap();
        }
        let store = ConfigStore::load(kv as Arc<dyn KvBackend>).unwrap();
        assert_eq!(store.get(Some("model.id")), json!("claude-opus-4-20250514"));
    }

    #[test]
    fn toml_seed_lands_in_sections() {
        let (_, store) = store();
        store
            .seed_from_toml("[timeouts]\ntoolMs = 5000\n")
            .unwrap();
        assert_eq!(store.get(Some("timeouts.toolMs")), json!(5000));
    }
}
