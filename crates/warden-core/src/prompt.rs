//! Classification of server output lines.
//!
//! Everything here is pure: the same line always yields the same answer, and no state is kept
//! between calls. The phrase tables are the single place where output matching rules live.

use crate::log::Channel;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    AdminPassword,
    Confirmation,
    Continue,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::AdminPassword => "admin_password",
            PromptKind::Confirmation => "confirmation",
            PromptKind::Continue => "continue",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            PromptKind::AdminPassword => "awaiting administrator password",
            PromptKind::Confirmation => "awaiting confirmation (y/n)",
            PromptKind::Continue => "awaiting enter to continue",
        }
    }

    /// Whether `reply` plausibly answers this prompt.
    pub fn accepts(&self, reply: &str) -> bool {
        let reply = reply.trim();
        match self {
            PromptKind::AdminPassword => !reply.is_empty(),
            PromptKind::Confirmation => matches!(
                reply.to_ascii_lowercase().as_str(),
                "y" | "n" | "yes" | "no"
            ),
            PromptKind::Continue => true,
        }
    }

    /// Replies to these prompts must not be echoed in clear text.
    pub fn is_secret(&self) -> bool {
        matches!(self, PromptKind::AdminPassword)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "prompt", rename_all = "snake_case")]
pub enum LineKind {
    Plain,
    Error,
    PromptRequest(PromptKind),
    TerminalExit,
}

const PROMPT_PHRASES: &[(&str, PromptKind)] = &[
    ("enter admin password", PromptKind::AdminPassword),
    ("enter an admin password", PromptKind::AdminPassword),
    ("enter the admin password", PromptKind::AdminPassword),
    ("enter administrator password", PromptKind::AdminPassword),
    ("set admin password", PromptKind::AdminPassword),
    ("set an admin password", PromptKind::AdminPassword),
    ("set the admin password", PromptKind::AdminPassword),
    ("admin password:", PromptKind::AdminPassword),
    ("(y/n)", PromptKind::Confirmation),
    ("[y/n]", PromptKind::Confirmation),
    ("press enter to continue", PromptKind::Continue),
];

const TERMINAL_PHRASES: &[&str] = &[
    "press any key to continue",
    "server process finished",
    "server has shut down",
    "shutdown complete",
];

fn error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\b(error|fatal|critical|failed|failure)\b|exception\b)")
            .expect("valid regex")
    })
}

fn chat_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)(\[chat\]|\bchat:|\bchat \()").expect("valid regex"))
}

fn connection_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(\b(player|client)\b.*\b(connected|disconnected|joined|left|kicked)\b|\b(joined|left) the (game|server)\b)",
        )
        .expect("valid regex")
    })
}

pub fn classify(line: &str) -> LineKind {
    let lowered = line.to_lowercase();
    if let Some((_, kind)) = PROMPT_PHRASES
        .iter()
        .find(|(phrase, _)| lowered.contains(phrase))
    {
        return LineKind::PromptRequest(*kind);
    }
    if TERMINAL_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
        return LineKind::TerminalExit;
    }
    if error_pattern().is_match(line) {
        return LineKind::Error;
    }
    LineKind::Plain
}

/// Secondary channel a server line should be mirrored onto, if any.
pub fn route_line(line: &str) -> Option<Channel> {
    if chat_pattern().is_match(line) {
        return Some(Channel::Chat);
    }
    if connection_pattern().is_match(line) {
        return Some(Channel::Connection);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let cases: &[(&str, LineKind)] = &[
            ("Loading world 'Navezgane'...", LineKind::Plain),
            ("", LineKind::Plain),
            ("   ", LineKind::Plain),
            (
                "Please enter admin password:",
                LineKind::PromptRequest(PromptKind::AdminPassword),
            ),
            (
                "No administrator configured. Set admin password now",
                LineKind::PromptRequest(PromptKind::AdminPassword),
            ),
            (
                "ERROR: admin password missing, enter admin password",
                LineKind::PromptRequest(PromptKind::AdminPassword),
            ),
            (
                "Overwrite existing save? (y/n)",
                LineKind::PromptRequest(PromptKind::Confirmation),
            ),
            (
                "Press Enter to continue",
                LineKind::PromptRequest(PromptKind::Continue),
            ),
            ("Press any key to continue . . .", LineKind::TerminalExit),
            ("Server process finished with code 0", LineKind::TerminalExit),
            ("ERROR: could not bind port 26900", LineKind::Error),
            ("NullReferenceException: Object reference", LineKind::Error),
            ("Unhandled exception in worker thread", LineKind::Error),
            ("FATAL crash in GameManager", LineKind::Error),
            ("Save failed, retrying", LineKind::Error),
            ("0 errors, 2 warnings", LineKind::Plain),
            ("ErrorReporting initialized", LineKind::Plain),
        ];
        for (line, expected) in cases {
            assert_eq!(classify(line), *expected, "line: {line:?}");
        }
    }

    #[test]
    fn classify_is_stable_across_calls() {
        for line in [
            "Please enter admin password:",
            "ERROR: disk full",
            "Player joined the game",
            "plain",
        ] {
            assert_eq!(classify(line), classify(line));
        }
    }

    #[test]
    fn prompt_replies_are_checked_per_kind() {
        assert!(PromptKind::AdminPassword.accepts("secret"));
        assert!(!PromptKind::AdminPassword.accepts("   "));
        assert!(PromptKind::Confirmation.accepts("Y"));
        assert!(PromptKind::Confirmation.accepts("no"));
        assert!(!PromptKind::Confirmation.accepts("maybe"));
        assert!(PromptKind::Continue.accepts(""));
        assert!(PromptKind::AdminPassword.is_secret());
        assert!(!PromptKind::Confirmation.is_secret());
    }

    #[test]
    fn routes_chat_and_connection_lines() {
        assert_eq!(route_line("[Chat] Alice: hello"), Some(Channel::Chat));
        assert_eq!(route_line("Chat (from 'Steam_1', entity id '171'): 'hi'"), Some(Channel::Chat));
        assert_eq!(
            route_line("Player 'Bob' connected, entity id 171"),
            Some(Channel::Connection)
        );
        assert_eq!(route_line("Carol left the game"), Some(Channel::Connection));
        assert_eq!(route_line("GameServer.LogOn successful"), None);
    }

    #[test]
    fn line_kind_serializes_with_prompt_kind() {
        let value = serde_json::to_value(LineKind::PromptRequest(PromptKind::AdminPassword))
            .expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"kind": "prompt_request", "prompt": "admin_password"})
        );
    }
}
