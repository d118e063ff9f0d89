//! Capability gating for inbound Matrix events.
//!
//! Every check runs before the connector is called, so an unsupported
//! action is rejected with a typed status without any remote traffic.

use chrono::{DateTime, Utc};

use crate::error::{BridgeError, Capability};
use crate::matrix::{MessageContent, msgtype};
use crate::network::RoomCapabilities;
use crate::storage::MessageRecord;

/// Gates a plain message or sticker. Text and emote content has no
/// content-level gate; length limits are the connector's business after
/// conversion.
pub fn gate_matrix_message(
    caps: &RoomCapabilities,
    content: &MessageContent,
) -> Result<(), BridgeError> {
    if content.msgtype == msgtype::LOCATION && !caps.location_messages {
        return Err(BridgeError::CapabilityUnsupported(
            Capability::LocationMessages,
        ));
    }
    if content.has_caption() && !caps.captions {
        return Err(BridgeError::CapabilityUnsupported(Capability::Captions));
    }
    Ok(())
}

/// Gates an edit against the connector's flags and limits.
pub fn gate_matrix_edit(
    caps: &RoomCapabilities,
    target: &MessageRecord,
    now: DateTime<Utc>,
) -> Result<(), BridgeError> {
    if !caps.edits {
        return Err(BridgeError::CapabilityUnsupported(Capability::Edits));
    }
    if let Some(max_age) = caps.edit_max_age {
        let age = now.signed_duration_since(target.timestamp);
        if age > chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX) {
            return Err(BridgeError::EditTooOld);
        }
    }
    if let Some(max_count) = caps.edit_max_count {
        if target.edit_count >= i64::from(max_count) {
            return Err(BridgeError::EditLimitExceeded);
        }
    }
    Ok(())
}

/// Gates a reaction.
pub fn gate_matrix_reaction(caps: &RoomCapabilities) -> Result<(), BridgeError> {
    if !caps.reactions {
        return Err(BridgeError::CapabilityUnsupported(Capability::Reactions));
    }
    Ok(())
}
