//! Identifier newtypes shared across the bridge.
//!
//! Remote-network identifiers are opaque tokens minted by the connector, so
//! they carry no validation beyond the newtype boundary. Matrix identifiers
//! are equally opaque here; parsing them is the homeserver façade's problem.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Remote-network chat (conversation) identifier.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct NetworkChatId(String);

/// Remote-network user identifier.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct NetworkUserId(String);

/// Remote-network message identifier.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct NetworkMessageId(String);

/// Part of a multi-part message. The first (or only) part uses the empty
/// string.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct PartId(String);

impl PartId {
    /// The identifier of the first part of a message.
    #[must_use]
    pub fn first() -> Self {
        Self::new(String::new())
    }
}

/// Reaction emoji identifier. Connectors that identify reactions by the
/// emoji itself store the emoji here too.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct EmojiId(String);

/// Identifier of a user's login session on the remote network.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct UserLoginId(String);

/// Transaction id correlating an outgoing send with its remote echo.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct TransactionId(String);

impl TransactionId {
    /// Mints a fresh transaction id for an outgoing send.
    #[must_use]
    pub fn random() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }
}

/// Matrix user id (`@localpart:server`).
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct MatrixUserId(String);

/// Matrix room id (`!opaque:server`).
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct MatrixRoomId(String);

/// Matrix event id (`$opaque`).
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    Deref,
    From,
    Into
))]
pub struct MatrixEventId(String);

/// Reference to a remote message, optionally narrowed to a single part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub message_id: NetworkMessageId,
    pub part_id: Option<PartId>,
}

impl MessageRef {
    #[must_use]
    pub fn new(message_id: NetworkMessageId, part_id: Option<PartId>) -> Self {
        Self {
            message_id,
            part_id,
        }
    }

    #[must_use]
    pub fn whole(message_id: NetworkMessageId) -> Self {
        Self {
            message_id,
            part_id: None,
        }
    }
}

/// Capacity of a portal's event mailbox.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 4096),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 64
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    /// Gets the value as usize for use with tokio channels.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Key of a portal: one remote chat, optionally split per receiving login
/// for networks where different logins see different copies of the same
/// conversation (DMs, mostly).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortalKey {
    pub chat_id: NetworkChatId,
    pub receiver: Option<UserLoginId>,
}

impl PortalKey {
    #[must_use]
    pub fn new(chat_id: NetworkChatId, receiver: Option<UserLoginId>) -> Self {
        Self { chat_id, receiver }
    }

    /// Shared portal key with no per-login receiver.
    #[must_use]
    pub fn shared(chat_id: NetworkChatId) -> Self {
        Self {
            chat_id,
            receiver: None,
        }
    }

    /// The receiver column value used by persistence (empty = shared).
    #[must_use]
    pub fn receiver_str(&self) -> &str {
        self.receiver.as_ref().map_or("", |r| r.as_str())
    }
}

impl std::fmt::Display for PortalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.receiver {
            Some(receiver) => write!(f, "{}/{}", self.chat_id, receiver),
            None => write!(f, "{}", self.chat_id),
        }
    }
}
