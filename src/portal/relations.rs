//! Resolves reply/thread pointers between remote message ids and Matrix
//! event ids, in both directions.

use crate::bridge::BridgeContext;
use crate::error::BridgeError;
use crate::ids::{MatrixEventId, MatrixUserId, MessageRef, NetworkMessageId, PartId, PortalKey};
use crate::matrix::{MessageContent, RelatesTo};
use crate::network::RoomCapabilities;
use crate::storage::{MessageRecord, PortalRecord};

/// Matrix-side relation metadata resolved for an incoming remote message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolvedRelations {
    pub thread_root_mxid: Option<MatrixEventId>,
    /// Latest event in the thread, for proper thread continuation.
    pub thread_prev_mxid: Option<MatrixEventId>,
    pub reply_to_mxid: Option<MatrixEventId>,
    pub reply_to_sender: Option<MatrixUserId>,
}

fn deterministic_id(
    ctx: &BridgeContext,
    portal: &PortalRecord,
    message: &NetworkMessageId,
    part: &PartId,
) -> Option<MatrixEventId> {
    let room_id = portal.room_id.as_ref()?;
    Some(
        ctx.matrix
            .generate_deterministic_event_id(room_id, &portal.key, message, part),
    )
}

async fn lookup_ref(
    ctx: &BridgeContext,
    portal: &PortalKey,
    target: &MessageRef,
) -> Result<Option<MessageRecord>, BridgeError> {
    match &target.part_id {
        Some(part) => ctx.db.messages.get_part(portal, &target.message_id, part).await,
        None => ctx.db.messages.get_first_part(portal, &target.message_id).await,
    }
}

/// Resolves the Matrix event ids a converted remote message should relate
/// to. In batch-send mode missing targets are synthesized as deterministic
/// event ids so backfill can reference parents that have not been sent yet.
pub(crate) async fn resolve_remote_relations(
    ctx: &BridgeContext,
    portal: &PortalRecord,
    thread_root: Option<&NetworkMessageId>,
    reply_to: Option<&MessageRef>,
    batch_send: bool,
) -> Result<ResolvedRelations, BridgeError> {
    let mut resolved = ResolvedRelations::default();

    if let Some(reply) = reply_to {
        match lookup_ref(ctx, &portal.key, reply).await? {
            Some(record) => {
                resolved.reply_to_sender = Some(record.sender_mxid.clone());
                resolved.reply_to_mxid = Some(record.mxid);
            }
            None if batch_send => {
                let part = reply.part_id.clone().unwrap_or_else(PartId::first);
                resolved.reply_to_mxid =
                    deterministic_id(ctx, portal, &reply.message_id, &part);
            }
            None => {}
        }
    }

    if let Some(root) = thread_root {
        let root_mxid = match ctx.db.messages.get_first_part(&portal.key, root).await? {
            Some(record) => Some(record.mxid),
            None if batch_send => deterministic_id(ctx, portal, root, &PartId::first()),
            None => None,
        };
        if let Some(root_mxid) = root_mxid {
            // Continue the thread from its latest message, falling back to
            // the root itself for a fresh thread.
            let prev = ctx
                .db
                .messages
                .get_last_in_thread(&portal.key, root)
                .await?
                .map_or_else(|| root_mxid.clone(), |record| record.mxid);
            resolved.thread_root_mxid = Some(root_mxid);
            resolved.thread_prev_mxid = Some(prev);
        }
    }

    Ok(resolved)
}

/// Applies resolved relations to outgoing Matrix content. A reply also adds
/// the target's sender to the mention set.
pub(crate) fn apply_relations_to_content(
    resolved: &ResolvedRelations,
    content: &mut MessageContent,
) {
    if let Some(root) = &resolved.thread_root_mxid {
        let (in_reply_to, falling_back) = match &resolved.reply_to_mxid {
            Some(reply) => (reply.clone(), false),
            None => (
                resolved
                    .thread_prev_mxid
                    .clone()
                    .unwrap_or_else(|| root.clone()),
                true,
            ),
        };
        content.relates_to = Some(RelatesTo::thread(root.clone(), in_reply_to, falling_back));
    } else if let Some(reply) = &resolved.reply_to_mxid {
        content.relates_to = Some(RelatesTo::reply(reply.clone()));
    }

    if let Some(sender) = &resolved.reply_to_sender {
        content.add_mention(sender.clone());
    }
}

/// Thread root and reply target of an outgoing Matrix message, resolved to
/// bridged message rows with the reply-to-thread fallback applied.
#[derive(Debug, Default)]
pub struct MatrixRelations {
    pub thread_root: Option<MessageRecord>,
    pub reply_to: Option<MessageRecord>,
}

/// Resolves the relation targets of a Matrix message before handing it to
/// the connector. When the network supports only threads, a plain reply
/// becomes a thread continuation rooted at the replied message's thread (or
/// the replied message itself).
pub(crate) async fn resolve_matrix_relations(
    ctx: &BridgeContext,
    portal: &PortalRecord,
    caps: &RoomCapabilities,
    content: &MessageContent,
) -> Result<MatrixRelations, BridgeError> {
    let mut relations = MatrixRelations::default();
    let Some(relates_to) = &content.relates_to else {
        return Ok(relations);
    };

    if let Some(root_mxid) = relates_to.thread_root() {
        relations.thread_root = ctx.db.messages.get_by_mxid(&portal.key, root_mxid).await?;
        if let (Some(reply_mxid), false) = (
            relates_to.in_reply_to.as_ref().map(|r| &r.event_id),
            relates_to.is_falling_back,
        ) {
            relations.reply_to = ctx.db.messages.get_by_mxid(&portal.key, reply_mxid).await?;
        }
    } else if let Some(reply_mxid) = relates_to.reply_target() {
        relations.reply_to = ctx.db.messages.get_by_mxid(&portal.key, reply_mxid).await?;
    }

    if caps.threads && !caps.replies && relations.thread_root.is_none() {
        if let Some(reply) = relations.reply_to.take() {
            relations.thread_root = match &reply.thread_root {
                Some(root_id) => ctx
                    .db
                    .messages
                    .get_first_part(&portal.key, root_id)
                    .await?
                    .or(Some(reply)),
                None => Some(reply),
            };
        }
    }

    Ok(relations)
}
