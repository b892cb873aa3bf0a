//! Skill manifest — parsed from SKILL.md YAML frontmatter.
//!
//! Only SKILL.md is required per skill directory. The frontmatter is a YAML
//! block delimited by `---` at the top of the file:
//!
//! ```yaml
//! ---
//! name: github-triage
//! description: Triage GitHub notifications with the gh CLI
//! requires:
//!   bins: [gh]
//! ---
//! ```

use serde::{Deserialize, Serialize};

/// Validates a skill name: `^[a-z0-9]+(-[a-z0-9]+)*$`
pub fn is_valid_skill_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let mut expect_alnum = true;
    for ch in name.chars() {
        if expect_alnum {
            if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() {
                return false;
            }
            expect_alnum = false;
        } else if ch == '-' {
            expect_alnum = true;
        } else if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() {
            return false;
        }
    }
    !expect_alnum
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillManifest {
    #[serde(default)]
    pub name: Option<String>,
    /// Trigger description: tells the LLM when to invoke this skill.
    #[serde(default)]
    pub description: Option<String>,
    /// Include the skill regardless of requirement checks.
    #[serde(default)]
    pub always: bool,
    #[serde(default)]
    pub requires: SkillRequirements,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SkillRequirements {
    /// Required binaries on the executing host's PATH.
    #[serde(default)]
    pub bins: Vec<String>,
}

impl SkillManifest {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match &self.name {
            None => errors.push("missing required field: name".into()),
            Some(n) if !is_valid_skill_name(n) => errors.push(format!(
                "invalid skill name '{n}': must match ^[a-z0-9]+(-[a-z0-9]+)*$"
            )),
            _ => {}
        }
        match &self.description {
            None => errors.push("missing required field: description".into()),
            Some(d) if d.trim().is_empty() => errors.push("description must not be empty".into()),
            _ => {}
        }
        errors
    }
}

/// Parse YAML frontmatter from a SKILL.md file.
///
/// Returns `(manifest, body)` where body is the markdown after the
/// frontmatter. A file without a frontmatter block yields `(None, content)`.
pub fn parse_frontmatter(content: &str) -> (Option<SkillManifest>, String) {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        return (None, content.to_string());
    }

    let after_open = &trimmed[3..];
    let Some(close_idx) = after_open.find("\n---") else {
        return (None, content.to_string());
    };
    let yaml_str = &after_open[..close_idx];
    let body = after_open[close_idx + 4..].trim_start_matches('\n').to_string();

    match serde_yaml::from_str::<SkillManifest>(yaml_str) {
        Ok(manifest) => {
            for err in manifest.validate() {
                tracing::warn!(error = %err, "SKILL.md manifest validation error");
            }
            (Some(manifest), body)
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse SKILL.md frontmatter");
            (None, content.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_frontmatter() {
        let md = "---\nname: github-triage\ndescription: Triage with gh\nrequires:\n  bins: [gh]\n---\n\nUse `gh` to list notifications.\n";
        let (manifest, body) = parse_frontmatter(md);
        let manifest = manifest.unwrap();
        assert_eq!(manifest.name.as_deref(), Some("github-triage"));
        assert_eq!(manifest.requires.bins, vec!["gh"]);
        assert!(manifest.validate().is_empty());
        assert!(body.starts_with("Use `gh`"));
    }

    #[test]
    fn parse_no_frontmatter() {
        let (manifest, body) = parse_frontmatter("just markdown\n");
        assert!(manifest.is_none());
        assert_eq!(body, "just markdown\n");
    }

    #[test]
    fn always_flag_defaults_false() {
        let md = "---\nname: a\ndescription: d\nalways: true\n---\nbody";
        let (manifest, _) = parse_frontmatter(md);
        assert!(manifest.unwrap().always);
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_skill_name("apple-notes"));
        assert!(is_valid_skill_name("a2"));
        assert!(!is_valid_skill_name(""));
        assert!(!is_valid_skill_name("Apple"));
        assert!(!is_valid_skill_name("a--b"));
        assert!(!is_valid_skill_name("trailing-"));
    }

    #[test]
    fn missing_fields_reported() {
        let errors = SkillManifest::default().validate();
        assert_eq!(errors.len(), 2);
    }
}
