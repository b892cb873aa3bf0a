//! Skill enumeration and eligibility.
//!
//! The registry walks the blob workspace for SKILL.md files, applies config
//! overrides, and evaluates eligibility against the host-binary status the
//! gateway collected through node probes. Agent-scoped skills shadow global
//! skills of the same name.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use sy_domain::config::SkillsConfig;
use sy_domain::error::Result;
use sy_store::BlobStore;

use crate::manifest::parse_frontmatter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillScope {
    Global,
    Agent,
}

/// One enumerated skill with its evaluated eligibility.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillStatus {
    pub name: String,
    pub description: String,
    pub scope: SkillScope,
    pub enabled: bool,
    pub always: bool,
    pub required_bins: Vec<String>,
    /// Bins satisfied by at least one probed node.
    pub eligible: bool,
    pub missing_bins: Vec<String>,
}

pub struct SkillsRegistry {
    blob: Arc<dyn BlobStore>,
    /// agent_id → enumerated skills (agent scope already folded in).
    cache: RwLock<BTreeMap<String, Vec<SkillStatus>>>,
}

impl SkillsRegistry {
    pub fn new(blob: Arc<dyn BlobStore>) -> Self {
        Self {
            blob,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Drop cached enumerations (after a workspace write or `skills.refresh`).
    pub fn invalidate(&self) {
        self.cache.write().clear();
    }

    /// Every binary any enumerated skill requires (the probe set).
    pub fn required_bins(&self, agent_id: &str, config: &SkillsConfig) -> Result<Vec<String>> {
        let skills = self.enumerate(agent_id, config, &BTreeMap::new())?;
        let mut bins = BTreeSet::new();
        for skill in skills {
            bins.extend(skill.required_bins);
        }
        Ok(bins.into_iter().collect())
    }

    /// Enumerate skills for an agent, evaluating eligibility against the
    /// per-node bin status maps (`node_id → bin → present`).
    pub fn enumerate(
        &self,
        agent_id: &str,
        config: &SkillsConfig,
        host_bins: &BTreeMap<String, BTreeMap<String, bool>>,
    ) -> Result<Vec<SkillStatus>> {
        let raw = self.scan(agent_id)?;
        let mut out = Vec::with_capacity(raw.len());

        for (name, description, scope, manifest_bins, manifest_always) in raw {
            let overrides = config.entries.get(&name);
            let enabled = overrides.and_then(|o| o.enabled).unwrap_or(true);
            let always = overrides.and_then(|o| o.always).unwrap_or(manifest_always);
            let required_bins = overrides
                .and_then(|o| o.requires.as_ref().map(|r| r.bins.clone()))
                .unwrap_or(manifest_bins);

            let missing_bins: Vec<String> = required_bins
                .iter()
                .filter(|bin| {
                    !host_bins
                        .values()
                        .any(|bins| bins.get(bin.as_str()).copied().unwrap_or(false))
                })
                .cloned()
                .collect();
            let eligible = enabled && (always || missing_bins.is_empty());

            out.push(SkillStatus {
                name,
                description,
                scope,
                enabled,
                always,
                required_bins,
                eligible,
                missing_bins,
            });
        }
        Ok(out)
    }

    /// Scan the workspace: global skills first, then agent-scoped ones
    /// replacing same-named entries.
    #[allow(clippy::type_complexity)]
    fn scan(
        &self,
        agent_id: &str,
    ) -> Result<Vec<(String, String, SkillScope, Vec<String>, bool)>> {
        if let Some(cached) = self.cache.read().get(agent_id) {
            return Ok(cached
                .iter()
                .map(|s| {
                    (
                        s.name.clone(),
                        s.description.clone(),
                        s.scope,
                        s.required_bins.clone(),
                        s.always,
                    )
                })
                .collect());
        }

        let mut by_name: BTreeMap<String, (String, String, SkillScope, Vec<String>, bool)> =
            BTreeMap::new();

        for (prefix, scope) in [
            ("skills/".to_string(), SkillScope::Global),
            (format!("agents/{agent_id}/skills/"), SkillScope::Agent),
        ] {
            for key in self.blob.list(&prefix)? {
                if !key.ends_with("/SKILL.md") {
                    continue;
                }
                let Some((bytes, _)) = self.blob.get(&key)? else {
                    continue;
                };
                let content = String::from_utf8_lossy(&bytes);
                let (manifest, _body) = parse_frontmatter(&content);
                let Some(manifest) = manifest else {
                    tracing::debug!(key = %key, "skipping SKILL.md without frontmatter");
                    continue;
                };
                if !manifest.validate().is_empty() {
                    continue;
                }
                let Some(name) = manifest.name else { continue };
                let description = manifest.description.unwrap_or_default();
                by_name.insert(
                    name.clone(),
                    (name, description, scope, manifest.requires.bins, manifest.always),
                );
            }
        }

        let scanned: Vec<_> = by_name.into_values().collect();
        let statuses: Vec<SkillStatus> = scanned
            .iter()
            .map(|(name, description, scope, bins, always)| SkillStatus {
                name: name.clone(),
                description: description.clone(),
                scope: *scope,
                enabled: true,
                always: *always,
                required_bins: bins.clone(),
                eligible: false,
                missing_bins: bins.clone(),
            })
            .collect();
        self.cache.write().insert(agent_id.to_owned(), statuses);
        Ok(scanned)
    }
}
