//! Error types for the portal core.
//!
//! Every handler failure is classified here and, where the originating
//! Matrix event is known, converted into a message-status event so the user
//! sees whether their action went through.

use thiserror::Error;

/// A connector capability that an action may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Threads,
    Replies,
    Edits,
    Reactions,
    Redactions,
    Captions,
    LocationMessages,
    ReadReceipts,
    Typing,
    RoomMetadata,
    Membership,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Threads => "threads",
            Self::Replies => "replies",
            Self::Edits => "edits",
            Self::Reactions => "reactions",
            Self::Redactions => "redactions",
            Self::Captions => "captions",
            Self::LocationMessages => "location messages",
            Self::ReadReceipts => "read receipts",
            Self::Typing => "typing notifications",
            Self::RoomMetadata => "room metadata changes",
            Self::Membership => "membership changes",
        };
        f.write_str(name)
    }
}

/// Main error type for portal operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("you're not logged in and relaying is not available here")]
    NotLoggedIn,

    #[error("{0} are not supported on this network")]
    CapabilityUnsupported(Capability),

    #[error("{0} not found")]
    TargetNotFound(&'static str),

    #[error("the message is too old to be edited")]
    EditTooOld,

    #[error("the message has been edited too many times")]
    EditLimitExceeded,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unexpected event content: {0}")]
    UnexpectedContent(String),

    #[error("handler panicked: {0}")]
    PanicInHandler(String),

    #[error("event dropped by converter: {0}")]
    IgnoringRemoteEvent(String),

    /// Sentinel that suppresses the status report entirely.
    #[error("no status")]
    NoStatus,

    #[error("matrix error: {0}")]
    Matrix(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("portal event queue is full")]
    QueueFull,

    #[error("room creation was abandoned before completing")]
    CreateAbandoned,
}

/// How a failure (or success) is reported back to the Matrix side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// The sender may retry the exact same event.
    Retriable,
    NonRetriable,
}

/// Message-status payload delivered through the Matrix façade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStatus {
    pub class: StatusClass,
    pub message: String,
    /// Set for remote delivery receipts on outgoing messages.
    pub delivered: bool,
}

impl MessageStatus {
    #[must_use]
    pub fn success() -> Self {
        Self {
            class: StatusClass::Success,
            message: String::new(),
            delivered: false,
        }
    }

    #[must_use]
    pub fn delivered() -> Self {
        Self {
            class: StatusClass::Success,
            message: String::new(),
            delivered: true,
        }
    }
}

impl BridgeError {
    /// Maps the error onto a status report, or `None` when the failure must
    /// stay silent (`NoStatus`, dropped remote events).
    #[must_use]
    pub fn status(&self) -> Option<MessageStatus> {
        let class = match self {
            Self::NoStatus | Self::IgnoringRemoteEvent(_) => return None,
            Self::Database(_)
            | Self::UnexpectedContent(_)
            | Self::PanicInHandler(_)
            | Self::QueueFull
            | Self::CreateAbandoned
            | Self::Matrix(_)
            | Self::Network(_) => StatusClass::Retriable,
            Self::NotLoggedIn
            | Self::CapabilityUnsupported(_)
            | Self::TargetNotFound(_)
            | Self::EditTooOld
            | Self::EditLimitExceeded => StatusClass::NonRetriable,
        };
        Some(MessageStatus {
            class,
            message: self.to_string(),
            delivered: false,
        })
    }

    /// Whether the error should be surfaced as a user-visible notice when it
    /// happens outside the context of a specific Matrix event.
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::NoStatus | Self::IgnoringRemoteEvent(_))
    }
}
