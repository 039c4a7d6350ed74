//! Alert action configuration and the dispatch boundary.
//!
//! Rules store an `action_type` string plus a JSON config blob. Both are
//! decoded here, once, into a typed [`ActionConfig`] variant before any
//! dispatcher sees them. The concrete mail/webhook/shell senders live
//! outside this crate behind [`ActionDispatcher`]; the built-in
//! [`LogDispatcher`] routes firings into the tracing log.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// SMTP delivery settings for the `email` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAction {
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_user: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    #[serde(default)]
    pub from_addr: Option<String>,
    pub to_addr: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_subject_prefix() -> String {
    "[PathWatch]".to_string()
}

/// HTTP POST settings for the `webhook` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookAction {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// File-append settings for the `log` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogAction {
    #[serde(default = "default_log_path")]
    pub path: String,
}

fn default_log_path() -> String {
    "pathwatch_alerts.log".to_string()
}

impl Default for LogAction {
    fn default() -> Self {
        Self {
            path: default_log_path(),
        }
    }
}

/// Shell settings for the `command` action. The literal `{message}`
/// placeholder in the command string is replaced with the alert text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAction {
    pub command: String,
}

/// A decoded per-action configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    Email(EmailAction),
    Webhook(WebhookAction),
    Log(LogAction),
    Command(CommandAction),
}

impl ActionConfig {
    /// Decode a rule's `action_type` / `action_config` columns.
    ///
    /// Returns `None` for an unknown type or a blob that does not match
    /// the type's schema; the caller logs and skips dispatch.
    pub fn decode(action_type: &str, action_config: Option<&str>) -> Option<Self> {
        let raw = action_config.unwrap_or("{}");
        match action_type {
            "email" => serde_json::from_str(raw).ok().map(Self::Email),
            "webhook" => serde_json::from_str(raw).ok().map(Self::Webhook),
            "log" => Some(Self::Log(serde_json::from_str(raw).unwrap_or_default())),
            "command" => serde_json::from_str(raw).ok().map(Self::Command),
            _ => None,
        }
    }

    /// The wire name of this action's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::Webhook(_) => "webhook",
            Self::Log(_) => "log",
            Self::Command(_) => "command",
        }
    }
}

/// Delivers a fired alert. Best-effort: implementations swallow and log
/// their own failures so one broken sender never aborts evaluation of
/// other rules or targets.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, action: &ActionConfig, message: &str);
}

/// Default dispatcher: routes every firing into the tracing log.
pub struct LogDispatcher;

#[async_trait]
impl ActionDispatcher for LogDispatcher {
    async fn dispatch(&self, action: &ActionConfig, message: &str) {
        tracing::warn!("ALERT [{}] {}", action.type_name(), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_email() {
        let config = ActionConfig::decode(
            "email",
            Some(r#"{"to_addr":"ops@example.com","smtp_host":"mail.example.com"}"#),
        )
        .unwrap();
        match config {
            ActionConfig::Email(email) => {
                assert_eq!(email.to_addr, "ops@example.com");
                assert_eq!(email.smtp_host, "mail.example.com");
                assert_eq!(email.smtp_port, 587);
                assert_eq!(email.subject_prefix, "[PathWatch]");
            }
            other => panic!("expected email, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_email_requires_recipient() {
        assert!(ActionConfig::decode("email", Some("{}")).is_none());
    }

    #[test]
    fn test_decode_webhook() {
        let config = ActionConfig::decode(
            "webhook",
            Some(r#"{"url":"https://hooks.example.com/alert","headers":{"Authorization":"Bearer abc"}}"#),
        )
        .unwrap();
        match config {
            ActionConfig::Webhook(hook) => {
                assert_eq!(hook.url, "https://hooks.example.com/alert");
                assert_eq!(hook.headers.get("Authorization").unwrap(), "Bearer abc");
            }
            other => panic!("expected webhook, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_log_defaults_path() {
        let config = ActionConfig::decode("log", None).unwrap();
        assert_eq!(
            config,
            ActionConfig::Log(LogAction {
                path: "pathwatch_alerts.log".to_string()
            })
        );
    }

    #[test]
    fn test_decode_command_and_unknown() {
        let config = ActionConfig::decode("command", Some(r#"{"command":"notify {message}"}"#));
        assert!(matches!(config, Some(ActionConfig::Command(_))));
        assert!(ActionConfig::decode("pager", Some("{}")).is_none());
        assert_eq!(config.unwrap().type_name(), "command");
    }
}
