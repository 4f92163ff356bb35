use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const ERROR_PREFIX: &str = "[ERROR]";

/// Logical log stream. Each channel has its own ring and its own sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Server,
    System,
    Chat,
    Connection,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Server,
        Channel::System,
        Channel::Chat,
        Channel::Connection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Server => "server",
            Channel::System => "system",
            Channel::Chat => "chat",
            Channel::Connection => "connection",
        }
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::Server
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown channel '{0}'")]
pub struct ParseChannelError(pub String);

impl FromStr for Channel {
    type Err = ParseChannelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "server" | "output" => Ok(Channel::Server),
            "system" => Ok(Channel::System),
            "chat" => Ok(Channel::Chat),
            "connection" | "connections" => Ok(Channel::Connection),
            _ => Err(ParseChannelError(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub channel: Channel,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub error: bool,
}

impl LogEntry {
    /// Text as shown to stream viewers: error lines carry the `[ERROR]` marker.
    pub fn display_text(&self) -> String {
        if self.error {
            format!("{ERROR_PREFIX} {}", self.text)
        } else {
            self.text.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips_through_str() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>(), Ok(channel));
        }
        assert_eq!(" System ".parse::<Channel>(), Ok(Channel::System));
        assert!("audit".parse::<Channel>().is_err());
    }

    #[test]
    fn error_entries_are_prefixed_for_display() {
        let mut entry = LogEntry {
            channel: Channel::Server,
            sequence: 7,
            timestamp: Utc::now(),
            text: "NullReferenceException".to_string(),
            error: true,
        };
        assert_eq!(entry.display_text(), "[ERROR] NullReferenceException");
        entry.error = false;
        assert_eq!(entry.display_text(), "NullReferenceException");
    }

    #[test]
    fn channel_serializes_snake_case() {
        let value = serde_json::to_value(Channel::Connection).expect("serialize");
        assert_eq!(value, serde_json::json!("connection"));
    }
}
