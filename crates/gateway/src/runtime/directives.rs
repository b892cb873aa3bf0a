//! Inline directive parsing.
//!
//! Directives are `/x:value` tokens embedded anywhere in a message. They are
//! stripped before the text reaches the agent and yield per-message
//! overrides. A message that is *only* directives is acknowledged without
//! starting a run.

use regex::Regex;
use std::sync::OnceLock;

use sy_llm::ThinkLevel;

#[derive(Debug, Clone, Default)]
pub struct Directives {
    pub think_level: Option<ThinkLevel>,
    /// Raw model name or alias; resolved at call time.
    pub model: Option<String>,
    pub status_requested: bool,
    /// Message text with directive tokens removed.
    pub cleaned: String,
    /// The message carried directives and nothing else.
    pub directive_only: bool,
}

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)/(?:t|think):([A-Za-z]+)").expect("static regex"))
}

fn model_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)/(?:m|model):([A-Za-z0-9._/-]+)").expect("static regex"))
}

fn status_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)/status(?:\s|$)").expect("static regex"))
}

pub fn parse_directives(text: &str) -> Directives {
    let mut directives = Directives::default();
    let mut found_any = false;
    let mut invalid_think = false;

    let mut cleaned = text.to_string();

    if let Some(captures) = think_re().captures(&cleaned) {
        found_any = true;
        let level = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        match ThinkLevel::parse(level) {
            Some(level) => directives.think_level = Some(level),
            None => invalid_think = true,
        }
        cleaned = think_re().replace_all(&cleaned, " ").into_owned();
    }
    if let Some(captures) = model_re().captures(&cleaned) {
        found_any = true;
        directives.model = captures.get(1).map(|m| m.as_str().to_owned());
        cleaned = model_re().replace_all(&cleaned, " ").into_owned();
    }
    if status_re().is_match(&cleaned) {
        found_any = true;
        directives.status_requested = true;
        cleaned = status_re().replace_all(&cleaned, " ").into_owned();
    }

    // An unparseable think level still strips; the message falls through
    // with no override rather than reaching the model with the token.
    if invalid_think {
        tracing::debug!("ignoring invalid think level directive");
    }

    directives.cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    directives.directive_only = found_any && directives.cleaned.is_empty();
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_directive_strips_and_overrides() {
        let d = parse_directives("/t:high what is the plan?");
        assert_eq!(d.think_level, Some(ThinkLevel::High));
        assert_eq!(d.cleaned, "what is the plan?");
        assert!(!d.directive_only);
    }

    #[test]
    fn long_forms_work() {
        let d = parse_directives("check this /think:low and /model:sonnet please");
        assert_eq!(d.think_level, Some(ThinkLevel::Low));
        assert_eq!(d.model.as_deref(), Some("sonnet"));
        assert_eq!(d.cleaned, "check this and please");
    }

    #[test]
    fn directive_only_message() {
        let d = parse_directives("/m:opus");
        assert_eq!(d.model.as_deref(), Some("opus"));
        assert!(d.directive_only);
        assert!(d.cleaned.is_empty());
    }

    #[test]
    fn status_directive() {
        let d = parse_directives("/status");
        assert!(d.status_requested);
        assert!(d.directive_only);
    }

    #[test]
    fn invalid_think_level_is_stripped_without_override() {
        let d = parse_directives("/t:ultra do it");
        assert_eq!(d.think_level, None);
        assert_eq!(d.cleaned, "do it");
    }

    #[test]
    fn plain_text_untouched() {
        let d = parse_directives("no directives here, 1/2 done");
        assert!(d.think_level.is_none() && d.model.is_none());
        assert_eq!(d.cleaned, "no directives here, 1/2 done");
        assert!(!d.directive_only);
    }

    #[test]
    fn mid_word_slash_is_not_a_directive() {
        let d = parse_directives("ratio a/t:b stays");
        assert!(d.think_level.is_none());
        assert_eq!(d.cleaned, "ratio a/t:b stays");
    }
}
