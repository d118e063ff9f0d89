//! Matrix-side façade: event content models and the homeserver API trait.
//!
//! The portal core never talks to a homeserver directly. Everything goes
//! through [`MatrixApi`], which the surrounding bridge implements on top of
//! its appservice transport. Tests implement it with an in-memory recorder.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{BridgeError, MessageStatus};
use crate::ids::{
    MatrixEventId, MatrixRoomId, MatrixUserId, NetworkMessageId, NetworkUserId, PartId, PortalKey,
};

/// Event type identifiers used by the portal.
pub mod event_type {
    pub const MESSAGE: &str = "m.room.message";
    pub const STICKER: &str = "m.sticker";
    pub const REACTION: &str = "m.reaction";
    pub const REDACTION: &str = "m.room.redaction";

    pub const ROOM_NAME: &str = "m.room.name";
    pub const ROOM_TOPIC: &str = "m.room.topic";
    pub const ROOM_AVATAR: &str = "m.room.avatar";
    pub const ROOM_MEMBER: &str = "m.room.member";
    pub const POWER_LEVELS: &str = "m.room.power_levels";
    pub const JOIN_RULES: &str = "m.room.join_rules";
    pub const TOMBSTONE: &str = "m.room.tombstone";
    pub const SERVER_ACL: &str = "m.room.server_acl";
    pub const ENCRYPTION: &str = "m.room.encryption";
    pub const SPACE_PARENT: &str = "m.space.parent";
    pub const SPACE_CHILD: &str = "m.space.child";
    pub const FUNCTIONAL_MEMBERS: &str = "io.element.functional_members";
    pub const BRIDGE_INFO: &str = "m.bridge";
    pub const BRIDGE_INFO_LEGACY: &str = "uk.half-shot.bridge";
}

/// `msgtype` values for `m.room.message` content.
pub mod msgtype {
    pub const TEXT: &str = "m.text";
    pub const EMOTE: &str = "m.emote";
    pub const NOTICE: &str = "m.notice";
    pub const IMAGE: &str = "m.image";
    pub const FILE: &str = "m.file";
    pub const AUDIO: &str = "m.audio";
    pub const VIDEO: &str = "m.video";
    pub const LOCATION: &str = "m.location";
}

/// Raw fields attached to bridge-generated events.
pub mod raw_field {
    pub const SET_BY: &str = "fi.mau.bridge.set_by";
    pub const INTERNAL_ERROR: &str = "fi.mau.bridge.internal_error";
}

pub const REL_THREAD: &str = "m.thread";
pub const REL_REPLACE: &str = "m.replace";
pub const REL_ANNOTATION: &str = "m.annotation";

/// `m.mentions` content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mentions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<MatrixUserId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub room: bool,
}

impl Mentions {
    pub fn add_user(&mut self, user: MatrixUserId) {
        if !self.user_ids.contains(&user) {
            self.user_ids.push(user);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: MatrixEventId,
}

/// `m.relates_to` content covering replies, threads, edits and annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatesTo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<MatrixEventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(
        rename = "m.in_reply_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub in_reply_to: Option<InReplyTo>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_falling_back: bool,
}

impl RelatesTo {
    #[must_use]
    pub fn reply(target: MatrixEventId) -> Self {
        Self {
            in_reply_to: Some(InReplyTo { event_id: target }),
            ..Self::default()
        }
    }

    /// Thread continuation with a reply-fallback pointing at the previous
    /// event in the thread.
    #[must_use]
    pub fn thread(root: MatrixEventId, previous: MatrixEventId, fallback: bool) -> Self {
        Self {
            rel_type: Some(REL_THREAD.to_owned()),
            event_id: Some(root),
            in_reply_to: Some(InReplyTo { event_id: previous }),
            is_falling_back: fallback,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn annotation(target: MatrixEventId, key: String) -> Self {
        Self {
            rel_type: Some(REL_ANNOTATION.to_owned()),
            event_id: Some(target),
            key: Some(key),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn replace(target: MatrixEventId) -> Self {
        Self {
            rel_type: Some(REL_REPLACE.to_owned()),
            event_id: Some(target),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn thread_root(&self) -> Option<&MatrixEventId> {
        if self.rel_type.as_deref() == Some(REL_THREAD) {
            self.event_id.as_ref()
        } else {
            None
        }
    }

    #[must_use]
    pub fn reply_target(&self) -> Option<&MatrixEventId> {
        // The in_reply_to of a thread relation is a fallback, not a reply.
        if self.rel_type.is_none() {
            self.in_reply_to.as_ref().map(|r| &r.event_id)
        } else {
            None
        }
    }
}

/// `m.room.message` (and `m.sticker`) content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub msgtype: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(
        rename = "m.mentions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub mentions: Option<Mentions>,
    #[serde(
        rename = "m.relates_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub relates_to: Option<RelatesTo>,
    #[serde(
        rename = "m.new_content",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub new_content: Option<Box<MessageContent>>,
}

impl MessageContent {
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: msgtype::TEXT.to_owned(),
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn notice(body: impl Into<String>) -> Self {
        Self {
            msgtype: msgtype::NOTICE.to_owned(),
            body: body.into(),
            ..Self::default()
        }
    }

    /// The event id this content replaces, when the content is an edit.
    #[must_use]
    pub fn edit_target(&self) -> Option<&MatrixEventId> {
        let relates = self.relates_to.as_ref()?;
        if relates.rel_type.as_deref() == Some(REL_REPLACE) && self.new_content.is_some() {
            relates.event_id.as_ref()
        } else {
            None
        }
    }

    /// Whether the content carries a caption (file with a body that differs
    /// from the file name).
    #[must_use]
    pub fn has_caption(&self) -> bool {
        match &self.filename {
            Some(filename) => !filename.is_empty() && *filename != self.body,
            None => false,
        }
    }

    pub fn add_mention(&mut self, user: MatrixUserId) {
        self.mentions.get_or_insert_with(Mentions::default).add_user(user);
    }
}

/// Room membership states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Invite => "invite",
            Self::Leave => "leave",
            Self::Ban => "ban",
            Self::Knock => "knock",
        }
    }
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Room tag applied through account data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomTag(pub String);

impl RoomTag {
    pub const FAVOURITE: &'static str = "m.favourite";
    pub const LOW_PRIORITY: &'static str = "m.lowpriority";
}

/// Typing notification variants a connector may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingType {
    Text,
    UploadingMedia,
}

/// Member state as seen by the homeserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub membership: Membership,
    pub displayname: Option<String>,
    pub avatar_url: Option<String>,
}

/// Which identity an [`Intent`] acts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    Ghost,
    DoublePuppet,
    Bot,
}

/// A capability to act on the Matrix side as a specific identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub user_id: MatrixUserId,
    pub kind: IntentKind,
}

impl Intent {
    #[must_use]
    pub fn ghost(user_id: MatrixUserId) -> Self {
        Self {
            user_id,
            kind: IntentKind::Ghost,
        }
    }

    #[must_use]
    pub fn double_puppet(user_id: MatrixUserId) -> Self {
        Self {
            user_id,
            kind: IntentKind::DoublePuppet,
        }
    }

    #[must_use]
    pub fn bot(user_id: MatrixUserId) -> Self {
        Self {
            user_id,
            kind: IntentKind::Bot,
        }
    }
}

/// Synthetic sender attribution for relayed messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrigSender {
    pub user_id: MatrixUserId,
    pub formatted_name: String,
}

/// `m.room.power_levels` content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerLevelContent {
    pub users: BTreeMap<MatrixUserId, i64>,
    pub users_default: i64,
    pub events: BTreeMap<String, i64>,
    pub events_default: i64,
    pub state_default: i64,
    pub ban: i64,
    pub kick: i64,
    pub redact: i64,
    pub invite: i64,
}

impl Default for PowerLevelContent {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            users_default: 0,
            events: BTreeMap::new(),
            events_default: 0,
            state_default: 50,
            ban: 50,
            kick: 50,
            redact: 50,
            invite: 0,
        }
    }
}

impl PowerLevelContent {
    #[must_use]
    pub fn user_level(&self, user: &MatrixUserId) -> i64 {
        self.users.get(user).copied().unwrap_or(self.users_default)
    }

    pub fn set_user_level(&mut self, user: MatrixUserId, level: i64) {
        self.users.insert(user, level);
    }

    #[must_use]
    pub fn event_level(&self, event_type: &str) -> i64 {
        self.events
            .get(event_type)
            .copied()
            .unwrap_or(self.events_default)
    }
}

/// Custom transform hook applied after the regular power-level diff.
pub type PowerLevelTransform = Box<dyn Fn(&mut PowerLevelContent) -> bool + Send + Sync>;

/// A requested set of power-level changes.
///
/// Changes are only applied when both the current and the requested level
/// are within the acting user's own level, so a sync can never escalate
/// anyone past the actor. With no actor the bridge bot is assumed and the
/// limit is effectively infinite.
#[derive(Default)]
pub struct PowerLevelChanges {
    /// `None` resets the user to the default level.
    pub users: BTreeMap<MatrixUserId, Option<i64>>,
    pub events: BTreeMap<String, i64>,
    pub users_default: Option<i64>,
    pub events_default: Option<i64>,
    pub state_default: Option<i64>,
    pub ban: Option<i64>,
    pub kick: Option<i64>,
    pub redact: Option<i64>,
    pub invite: Option<i64>,
    pub custom: Option<PowerLevelTransform>,
}

impl std::fmt::Debug for PowerLevelChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerLevelChanges")
            .field("users", &self.users)
            .field("events", &self.events)
            .field("custom", &self.custom.is_some())
            .finish_non_exhaustive()
    }
}

impl PowerLevelChanges {
    /// Applies the requested changes to `content`, honoring the actor's own
    /// level. Returns whether anything changed.
    pub fn apply(&self, actor: Option<&MatrixUserId>, content: &mut PowerLevelContent) -> bool {
        let actor_level = actor.map_or(i64::MAX, |a| content.user_level(a));
        let mut changed = false;

        for (user, requested) in &self.users {
            let old = content.user_level(user);
            let new = requested.unwrap_or(content.users_default);
            if old == new || old > actor_level || new > actor_level {
                continue;
            }
            match requested {
                Some(level) => {
                    content.users.insert(user.clone(), *level);
                }
                None => {
                    content.users.remove(user);
                }
            }
            changed = true;
        }

        for (event_type, level) in &self.events {
            let old = content.event_level(event_type);
            if old == *level || old > actor_level || *level > actor_level {
                continue;
            }
            content.events.insert(event_type.clone(), *level);
            changed = true;
        }

        let mut apply_scalar = |field: &mut i64, requested: Option<i64>| {
            if let Some(new) = requested {
                if *field != new && *field <= actor_level && new <= actor_level {
                    *field = new;
                    changed = true;
                }
            }
        };
        apply_scalar(&mut content.users_default, self.users_default);
        apply_scalar(&mut content.events_default, self.events_default);
        apply_scalar(&mut content.state_default, self.state_default);
        apply_scalar(&mut content.ban, self.ban);
        apply_scalar(&mut content.kick, self.kick);
        apply_scalar(&mut content.redact, self.redact);
        apply_scalar(&mut content.invite, self.invite);

        if let Some(custom) = &self.custom {
            changed |= custom(content);
        }
        changed
    }
}

/// A state event included in the room creation request.
#[derive(Debug, Clone, Serialize)]
pub struct InitialStateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomVisibility {
    Private,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPreset {
    PrivateChat,
    TrustedPrivateChat,
    PublicChat,
}

/// Room creation request assembled by the portal.
#[derive(Debug, Clone)]
pub struct RoomCreateRequest {
    pub visibility: RoomVisibility,
    pub preset: RoomPreset,
    pub is_direct: bool,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub room_alias_local_part: Option<String>,
    pub invite: Vec<MatrixUserId>,
    pub initial_state: Vec<InitialStateEvent>,
    pub power_levels: PowerLevelContent,
    pub creation_content: serde_json::Map<String, Value>,
}

/// Bridge-info state event content, emitted under both the current and the
/// legacy state event type with identical payloads.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeInfoContent {
    pub bridgebot: MatrixUserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<MatrixUserId>,
    pub protocol: BridgeInfoSection,
    pub channel: BridgeInfoSection,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeInfoSection {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Builds notice content, optionally carrying the machine-readable error in
/// a raw field.
#[must_use]
pub fn notice_content(message: &str, internal_error: Option<&str>) -> Value {
    let mut content = json!({
        "msgtype": msgtype::NOTICE,
        "body": message,
    });
    if let Some(err) = internal_error {
        content[raw_field::INTERNAL_ERROR] = Value::String(err.to_owned());
    }
    content
}

/// A native event handed to the portal.
#[derive(Debug, Clone)]
pub struct MatrixEvent {
    /// Absent for edge events that have no event of their own (receipts,
    /// typing updates).
    pub id: Option<MatrixEventId>,
    pub room_id: MatrixRoomId,
    pub sender: MatrixUserId,
    pub timestamp: DateTime<Utc>,
    pub kind: MatrixEventKind,
}

/// Decoded native event payloads.
#[derive(Debug, Clone)]
pub enum MatrixEventKind {
    Message {
        event_type: String,
        content: MessageContent,
    },
    Reaction {
        target: MatrixEventId,
        key: String,
    },
    Redaction {
        redacts: MatrixEventId,
        reason: Option<String>,
    },
    Membership {
        target: MatrixUserId,
        prev: Membership,
        next: Membership,
    },
    ReadReceipt {
        event_id: MatrixEventId,
        receipt_ts: DateTime<Utc>,
    },
    Typing {
        user_ids: Vec<MatrixUserId>,
    },
    RoomName {
        name: String,
    },
    RoomTopic {
        topic: String,
    },
    RoomAvatar {
        url: String,
    },
    MarkedUnread {
        unread: bool,
    },
    RoomTag {
        tag: Option<RoomTag>,
    },
    Mute {
        muted_until: Option<DateTime<Utc>>,
    },
}

/// Homeserver façade used by the portal for every native-side effect.
#[async_trait]
pub trait MatrixApi: Send + Sync {
    fn bot_user_id(&self) -> MatrixUserId;
    fn server_name(&self) -> &str;
    fn server_supports_auto_join_invites(&self) -> bool {
        false
    }

    async fn create_room(&self, req: &RoomCreateRequest) -> Result<MatrixRoomId, BridgeError>;
    async fn delete_room(&self, room: &MatrixRoomId) -> Result<(), BridgeError>;

    /// Sends a timeline event as `sender` and returns the new event id.
    async fn send_message(
        &self,
        sender: &MatrixUserId,
        room: &MatrixRoomId,
        event_type: &str,
        content: &Value,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<MatrixEventId, BridgeError>;

    async fn send_state(
        &self,
        sender: &MatrixUserId,
        room: &MatrixRoomId,
        event_type: &str,
        state_key: &str,
        content: &Value,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<MatrixEventId, BridgeError>;

    async fn redact(
        &self,
        sender: &MatrixUserId,
        room: &MatrixRoomId,
        target: &MatrixEventId,
        reason: Option<&str>,
    ) -> Result<MatrixEventId, BridgeError>;

    async fn mark_read(
        &self,
        sender: &MatrixUserId,
        room: &MatrixRoomId,
        event_id: &MatrixEventId,
        timestamp: DateTime<Utc>,
    ) -> Result<(), BridgeError>;

    async fn mark_typing(
        &self,
        sender: &MatrixUserId,
        room: &MatrixRoomId,
        typing_type: TypingType,
        timeout: Duration,
    ) -> Result<(), BridgeError>;

    async fn mark_as_dm(
        &self,
        user: &MatrixUserId,
        room: &MatrixRoomId,
        peer: &MatrixUserId,
    ) -> Result<(), BridgeError>;

    async fn mark_unread(
        &self,
        user: &MatrixUserId,
        room: &MatrixRoomId,
        unread: bool,
    ) -> Result<(), BridgeError>;

    async fn mute_room(
        &self,
        user: &MatrixUserId,
        room: &MatrixRoomId,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), BridgeError>;

    async fn tag_room(
        &self,
        user: &MatrixUserId,
        room: &MatrixRoomId,
        tag: Option<&RoomTag>,
    ) -> Result<(), BridgeError>;

    async fn get_member_info(
        &self,
        room: &MatrixRoomId,
        user: &MatrixUserId,
    ) -> Result<Option<MemberInfo>, BridgeError>;

    async fn get_members(
        &self,
        room: &MatrixRoomId,
    ) -> Result<HashMap<MatrixUserId, Membership>, BridgeError>;

    async fn get_power_levels(&self, room: &MatrixRoomId)
    -> Result<PowerLevelContent, BridgeError>;

    /// Makes sure a ghost or double puppet is joined to the room, inviting
    /// first when necessary.
    async fn ensure_joined(&self, room: &MatrixRoomId, user: &MatrixUserId)
    -> Result<(), BridgeError>;

    async fn set_membership(
        &self,
        actor: &MatrixUserId,
        room: &MatrixRoomId,
        target: &MatrixUserId,
        membership: Membership,
        reason: Option<&str>,
    ) -> Result<(), BridgeError>;

    /// Reports the processing outcome of a native event. Infallible by
    /// design: a failed status report is only worth a log line.
    async fn send_message_status(
        &self,
        room: &MatrixRoomId,
        event_id: &MatrixEventId,
        status: &MessageStatus,
    );

    /// Derives a deterministic event id so backfilled messages can
    /// reference parents that have not been sent yet.
    fn generate_deterministic_event_id(
        &self,
        room: &MatrixRoomId,
        portal: &PortalKey,
        message: &NetworkMessageId,
        part: &PartId,
    ) -> MatrixEventId;

    /// Extracts the remote user id from a ghost mxid, if it is one.
    fn parse_ghost_user_id(&self, user: &MatrixUserId) -> Option<NetworkUserId>;

    /// Optional capability: whether `name` is confusable with another
    /// member of the room. `None` means the check is unsupported.
    async fn is_confusable_name(
        &self,
        room: &MatrixRoomId,
        user: &MatrixUserId,
        name: &str,
    ) -> Option<bool> {
        let _ = (room, user, name);
        None
    }
}
