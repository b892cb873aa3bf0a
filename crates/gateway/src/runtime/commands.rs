//! Slash commands.
//!
//! A message of the form `/cmd [args]` with a known alias is handled by the
//! gateway against the resolved session and answered on the originating
//! channel; it never reaches the model. Unknown slash text falls through as
//! a normal message.

use serde_json::json;

use sy_domain::error::{Error, Result};
use sy_llm::{resolve_model_alias, ThinkLevel};

use crate::runtime::{SessionPatch, SessionManager};
use crate::state::GatewayState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Reset,
    Compact,
    Stop,
    Status,
    Model,
    Think,
    Help,
}

impl SlashCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SlashCommand::Reset => "reset",
            SlashCommand::Compact => "compact",
            SlashCommand::Stop => "stop",
            SlashCommand::Status => "status",
            SlashCommand::Model => "model",
            SlashCommand::Think => "think",
            SlashCommand::Help => "help",
        }
    }
}

/// Parse a full-message slash command. Returns `None` when the text is not
/// a known command (it then flows to the agent unchanged).
pub fn parse_command(text: &str) -> Option<(SlashCommand, String)> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next()?.to_lowercase();
    let args = parts.next().unwrap_or("").trim().to_owned();

    let command = match name.as_str() {
        "new" | "reset" => SlashCommand::Reset,
        "compact" => SlashCommand::Compact,
        "stop" => SlashCommand::Stop,
        "status" => SlashCommand::Status,
        "model" => SlashCommand::Model,
        "think" => SlashCommand::Think,
        "help" | "?" => SlashCommand::Help,
        _ => return None,
    };
    Some((command, args))
}

pub struct CommandOutcome {
    pub command: &'static str,
    pub response: String,
}

pub async fn execute_command(
    state: &GatewayState,
    sessions: &SessionManager,
    session_key: &str,
    command: SlashCommand,
    args: &str,
) -> Result<CommandOutcome> {
    let response = match command {
        SlashCommand::Status => {
            let view = sessions.get(state, session_key).await?;
            let model = view["settings"]["model"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| state.config.typed().model.id);
            format!(
                "Session: {session_key}\nSession id: {}\nMessages: {}\nTokens: {} in / {} out\nModel: {}",
                view["sessionId"].as_str().unwrap_or("?"),
                view["messageCount"].as_u64().unwrap_or(0),
                view["inputTokens"].as_u64().unwrap_or(0),
                view["outputTokens"].as_u64().unwrap_or(0),
                model,
            )
        }
        SlashCommand::Reset => {
            let outcome = sessions.reset(state, session_key).await?;
            format!("Session reset. New session id: {}", outcome.new_session_id)
        }
        SlashCommand::Compact => {
            let keep = if args.is_empty() {
                20
            } else {
                args.parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| Error::Validation("Invalid count".into()))?
            };
            let outcome = sessions.compact(state, session_key, keep).await?;
            format!(
                "Compacted: archived {} messages, kept {}.",
                outcome.archived, outcome.kept
            )
        }
        SlashCommand::Stop => {
            let outcome = sessions.abort(state, session_key).await?;
            if outcome.was_running {
                format!(
                    "Stopped run {} ({} pending tools cancelled).",
                    outcome.run_id.as_deref().unwrap_or("?"),
                    outcome.pending_tools_cancelled
                )
            } else {
                "No run in progress.".to_string()
            }
        }
        SlashCommand::Model => {
            if args.is_empty() {
                let view = sessions.get(state, session_key).await?;
                let model = view["settings"]["model"]
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| state.config.typed().model.id);
                format!("Model: {model}")
            } else {
                let resolved = resolve_model_alias(args)
                    .map(|(_, id)| id.to_owned())
                    .unwrap_or_else(|| args.to_owned());
                sessions
                    .patch(
                        state,
                        session_key,
                        SessionPatch {
                            settings: Some(json!({"model": resolved.clone()})),
                            ..Default::default()
                        },
                    )
                    .await?;
                format!("Model set to {resolved}.")
            }
        }
        SlashCommand::Think => {
            if args.is_empty() {
                "Usage: /think <none|minimal|low|medium|high|xhigh>".to_string()
            } else {
                let level = ThinkLevel::parse(args)
                    .ok_or_else(|| Error::Validation(format!("Invalid think level: {args}")))?;
                sessions
                    .patch(
                        state,
                        session_key,
                        SessionPatch {
                            settings: Some(json!({"thinkLevel": level})),
                            ..Default::default()
                        },
                    )
                    .await?;
                format!("Think level set to {args}.")
            }
        }
        SlashCommand::Help => "Commands: /new (/reset), /compact [keep], /stop, /status, \
             /model [name], /think <level>, /help (/?)\n\
             Inline directives: /t:<level>, /m:<model>, /status"
            .to_string(),
    };

    Ok(CommandOutcome {
        command: command.name(),
        response,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_parse() {
        assert_eq!(parse_command("/status"), Some((SlashCommand::Status, String::new())));
        assert_eq!(parse_command("/new"), Some((SlashCommand::Reset, String::new())));
        assert_eq!(
            parse_command("/compact 10"),
            Some((SlashCommand::Compact, "10".into()))
        );
        assert_eq!(parse_command("/?"), Some((SlashCommand::Help, String::new())));
    }

    #[test]
    fn unknown_slash_text_falls_through() {
        assert_eq!(parse_command("/frobnicate now"), None);
        assert_eq!(parse_command("not a command"), None);
        // Inline directives are not commands.
        assert_eq!(parse_command("/t:high hello"), None);
    }
}
