//! Identity linking and sender-id normalization.
//!
//! Identity links collapse the same person across channels: raw peer ids
//! (`telegram:123`, `whatsapp:+33612345678`) map to one canonical name so
//! replies share a session. Phone-like ids are canonicalized to E.164
//! *before* any lookup or storage — allowlists, pairing records, and session
//! keys all see the same form.

use std::collections::HashMap;

use sy_domain::config::IdentityLink;
use sy_domain::trace::TraceEvent;

/// Canonicalize a sender id. Phone-like ids (`06 12 34 56 78`,
/// `+33-6-12-34-56-78`, `tel:+336…`) become `+<digits>`; everything else is
/// returned trimmed and otherwise verbatim.
pub fn normalize_sender_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let candidate = trimmed.strip_prefix("tel:").unwrap_or(trimmed);

    let mut digits = String::new();
    let mut phone_like = !candidate.is_empty();
    for (i, ch) in candidate.chars().enumerate() {
        match ch {
            '+' if i == 0 => {}
            '0'..='9' => digits.push(ch),
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => {
                phone_like = false;
                break;
            }
        }
    }

    // E.164 is 7..=15 digits.
    if phone_like && (7..=15).contains(&digits.len()) {
        format!("+{digits}")
    } else {
        trimmed.to_owned()
    }
}

/// Resolves raw peer ids to canonical identities.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    /// normalized peer_id → canonical
    map: HashMap<String, String>,
}

impl IdentityResolver {
    /// Build a resolver from the configured identity links. Link entries are
    /// normalized at build time so lookups never re-normalize.
    pub fn from_config(links: &[IdentityLink]) -> Self {
        let mut map = HashMap::new();
        for link in links {
            for pid in &link.peer_ids {
                map.insert(normalize_sender_id(pid), link.canonical.clone());
            }
        }
        Self { map }
    }

    /// Resolve a raw peer id. If the normalized id matches a configured
    /// link, returns the canonical identity; otherwise the normalized id.
    pub fn resolve(&self, raw_peer_id: &str) -> String {
        let normalized = normalize_sender_id(raw_peer_id);
        if let Some(canonical) = self.map.get(&normalized) {
            TraceEvent::IdentityResolved {
                raw_peer_id: raw_peer_id.to_owned(),
                canonical: canonical.clone(),
            }
            .emit();
            canonical.clone()
        } else {
            normalized
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_ids_canonicalize_to_e164() {
        assert_eq!(normalize_sender_id("+33 6 12 34 56 78"), "+33612345678");
        assert_eq!(normalize_sender_id("33-6-12-34-56-78"), "+33612345678");
        assert_eq!(normalize_sender_id("tel:+33612345678"), "+33612345678");
        assert_eq!(normalize_sender_id("(415) 555-0100"), "+4155550100");
    }

    #[test]
    fn non_phone_ids_pass_through() {
        assert_eq!(normalize_sender_id("discord:987"), "discord:987");
        assert_eq!(normalize_sender_id("  alice  "), "alice");
        // Too short to be a number.
        assert_eq!(normalize_sender_id("42"), "42");
    }

    #[test]
    fn resolve_known_peer() {
        let links = vec![IdentityLink {
            canonical: "alice".into(),
            peer_ids: vec!["telegram:123".into(), "+33 612 345 678".into()],
        }];
        let resolver = IdentityResolver::from_config(&links);
        assert_eq!(resolver.resolve("telegram:123"), "alice");
        // Differently formatted phone id still folds.
        assert_eq!(resolver.resolve("33612345678"), "alice");
    }

    #[test]
    fn resolve_unknown_peer_normalizes() {
        let resolver = IdentityResolver::from_config(&[]);
        assert_eq!(resolver.resolve("telegram:999"), "telegram:999");
        assert_eq!(resolver.resolve("+1 415 555 0100"), "+14155550100");
    }
}
