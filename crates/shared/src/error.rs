use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the REST endpoints. Codes are free-form strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Codes carried by `channel_error` push frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChannelErrorCode {
    BlockedByTarget,
    YouBlockedTarget,
    ChatNotFound,
    Other(String),
}

impl ChannelErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::BlockedByTarget => "blocked_by_target",
            Self::YouBlockedTarget => "you_blocked_target",
            Self::ChatNotFound => "chat_not_found",
            Self::Other(code) => code,
        }
    }

    /// Text suitable for showing to the user.
    pub fn describe(&self) -> &str {
        match self {
            Self::BlockedByTarget => "This user has blocked you",
            Self::YouBlockedTarget => "Unblock this user to continue",
            Self::ChatNotFound => "Chat not found",
            Self::Other(_) => "The request was rejected",
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Self::BlockedByTarget | Self::YouBlockedTarget)
    }
}

impl From<String> for ChannelErrorCode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "blocked_by_target" => Self::BlockedByTarget,
            "you_blocked_target" => Self::YouBlockedTarget,
            "chat_not_found" => Self::ChatNotFound,
            _ => Self::Other(value),
        }
    }
}

impl From<ChannelErrorCode> for String {
    fn from(value: ChannelErrorCode) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ChannelErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ChannelError {
    pub code: ChannelErrorCode,
    pub message: String,
}

impl ChannelError {
    pub fn new(code: ChannelErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
