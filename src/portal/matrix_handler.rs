//! Dispatches native Matrix events to the network connector.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::bridge::UserLogin;
use crate::disappearing::DisappearingMessage;
use crate::error::{BridgeError, Capability, MessageStatus};
use crate::ids::{MatrixEventId, MatrixRoomId, MatrixUserId, PartId};
use crate::matrix::{MatrixEvent, MatrixEventKind, Membership, MessageContent, OrigSender};
use crate::network::{
    MatrixEditRequest, MatrixMembershipRequest, MatrixMessageRequest, MatrixReactionRequest,
    MatrixReadReceiptRequest, MatrixRedactionRequest,
};
use crate::portal::Portal;
use crate::portal::capabilities::{gate_matrix_edit, gate_matrix_message, gate_matrix_reaction};
use crate::portal::pending::PendingEcho;
use crate::portal::relations::resolve_matrix_relations;
use crate::portal::lifecycle::send_bridge_info;
use crate::storage::MessageRecord;

/// Whether this event kind reports message statuses back to the sender.
pub(crate) fn wants_status(kind: &MatrixEventKind) -> bool {
    matches!(
        kind,
        MatrixEventKind::Message { .. }
            | MatrixEventKind::Reaction { .. }
            | MatrixEventKind::Redaction { .. }
    )
}

async fn send_success_status(portal: &Portal, event: &MatrixEvent) {
    if let Some(event_id) = &event.id {
        portal
            .ctx
            .matrix
            .send_message_status(&event.room_id, event_id, &MessageStatus::success())
            .await;
    }
}

pub(crate) async fn handle_matrix_event(
    portal: &Portal,
    event: &MatrixEvent,
) -> Result<(), BridgeError> {
    match &event.kind {
        MatrixEventKind::Message {
            event_type,
            content,
        } => handle_message(portal, event, event_type, content).await,
        MatrixEventKind::Reaction { target, key } => {
            handle_reaction(portal, event, target, key).await
        }
        MatrixEventKind::Redaction { redacts, reason } => {
            handle_redaction(portal, event, redacts, reason.as_deref()).await
        }
        MatrixEventKind::ReadReceipt {
            event_id,
            receipt_ts,
        } => handle_read_receipt(portal, event, event_id, *receipt_ts).await,
        MatrixEventKind::Typing { user_ids } => handle_typing(portal, user_ids).await,
        MatrixEventKind::RoomName { .. }
        | MatrixEventKind::RoomTopic { .. }
        | MatrixEventKind::RoomAvatar { .. } => handle_room_meta(portal, event).await,
        MatrixEventKind::MarkedUnread { .. }
        | MatrixEventKind::RoomTag { .. }
        | MatrixEventKind::Mute { .. } => handle_account_data(portal, event).await,
        MatrixEventKind::Membership { target, prev, next } => {
            handle_membership(portal, event, target, *prev, *next).await
        }
    }
}

/// Builds the synthetic sender attribution for a relayed message,
/// disambiguating homonyms when the façade can detect them.
async fn build_orig_sender(portal: &Portal, room_id: &MatrixRoomId, sender: &MatrixUserId) -> OrigSender {
    let ctx = &portal.ctx;
    let name = ctx
        .matrix
        .get_member_info(room_id, sender)
        .await
        .ok()
        .flatten()
        .and_then(|m| m.displayname)
        .unwrap_or_else(|| sender.to_string());
    let displayed = match ctx.matrix.is_confusable_name(room_id, sender, &name).await {
        Some(true) => sender.to_string(),
        _ => name,
    };
    OrigSender {
        user_id: sender.clone(),
        formatted_name: ctx.config.relay.format_displayname(&displayed, sender.as_str()),
    }
}

/// Fills the unset fields of a connector-returned message draft.
fn finalize_db_message(
    portal: &Portal,
    draft: Option<MessageRecord>,
    event: &MatrixEvent,
    login: &Arc<UserLogin>,
    thread_root: Option<&MessageRecord>,
    reply_to: Option<&MessageRecord>,
) -> MessageRecord {
    let event_id = event
        .id
        .clone()
        .unwrap_or_else(|| MatrixEventId::from(""));
    let mut message = draft.unwrap_or_else(|| MessageRecord {
        portal: portal.key.clone(),
        id: crate::ids::NetworkMessageId::from(""),
        part_id: PartId::first(),
        mxid: MatrixEventId::from(""),
        fake_mxid: false,
        sender_id: crate::ids::NetworkUserId::from(""),
        sender_mxid: MatrixUserId::from(""),
        timestamp: chrono::DateTime::<Utc>::default(),
        thread_root: None,
        reply_to: None,
        edit_count: 0,
        metadata: serde_json::Value::Null,
    });
    message.portal = portal.key.clone();
    if message.mxid.is_empty() {
        message.mxid = event_id;
    }
    if message.sender_id.is_empty() {
        message.sender_id = login.remote_user_id.clone();
    }
    if message.sender_mxid.is_empty() {
        message.sender_mxid = event.sender.clone();
    }
    if message.timestamp.timestamp_millis() == 0 {
        message.timestamp = event.timestamp;
    }
    if message.thread_root.is_none() {
        message.thread_root = thread_root.map(|t| t.thread_root.clone().unwrap_or_else(|| t.id.clone()));
    }
    if message.reply_to.is_none() {
        message.reply_to = reply_to.map(|r| crate::ids::MessageRef::new(r.id.clone(), Some(r.part_id.clone())));
    }
    message
}

async fn handle_message(
    portal: &Portal,
    event: &MatrixEvent,
    event_type: &str,
    content: &MessageContent,
) -> Result<(), BridgeError> {
    if content.edit_target().is_some() {
        return handle_edit(portal, event, content).await;
    }
    let ctx = &portal.ctx;
    let record = portal.record.read().await.clone();
    let (login, is_relay) = portal.find_preferred_login(&event.sender, true).await?;
    let caps = login.client.room_capabilities(&portal.key).await;
    gate_matrix_message(&caps, content)?;

    let mut content = content.clone();
    let orig_sender = if is_relay {
        let orig = build_orig_sender(portal, &event.room_id, &event.sender).await;
        ctx.config.relay.apply_to_content(&orig, &mut content);
        Some(orig)
    } else {
        None
    };

    let relations = resolve_matrix_relations(ctx, &record, &caps, &content).await?;
    let response = login
        .client
        .handle_matrix_message(MatrixMessageRequest {
            portal: &record,
            event,
            event_type,
            content: &content,
            orig_sender: orig_sender.as_ref(),
            thread_root: relations.thread_root.as_ref(),
            reply_to: relations.reply_to.as_ref(),
        })
        .await?;

    let message = finalize_db_message(
        portal,
        response.db_message,
        event,
        &login,
        relations.thread_root.as_ref(),
        relations.reply_to.as_ref(),
    );

    if let Some(pending) = response.pending {
        debug!(portal_id = %portal.key, transaction_id = %pending.transaction_id,
            "send pending remote echo");
        portal.pending.register(
            pending.transaction_id,
            PendingEcho {
                draft: message,
                room_id: event.room_id.clone(),
                source_event_id: event.id.clone(),
                on_echo: pending.on_echo,
                registered_at: Utc::now(),
            },
        );
        return Ok(());
    }

    if message.id.is_empty() {
        warn!(portal_id = %portal.key,
            "connector returned neither a remote message id nor a pending transaction");
    } else {
        ctx.db.messages.save(&message).await?;
    }
    if record.disappear.is_enabled() {
        if let Some(schedule) = DisappearingMessage::for_new_event(
            &record.disappear,
            event.room_id.clone(),
            message.mxid.clone(),
            message.timestamp,
        ) {
            ctx.disappearing.enqueue(schedule).await;
        }
    }
    send_success_status(portal, event).await;
    Ok(())
}

async fn handle_edit(
    portal: &Portal,
    event: &MatrixEvent,
    content: &MessageContent,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let record = portal.record.read().await.clone();
    let target_mxid = content
        .edit_target()
        .ok_or_else(|| BridgeError::UnexpectedContent("edit without target".to_owned()))?
        .clone();
    let (login, is_relay) = portal.find_preferred_login(&event.sender, true).await?;
    let handler = login
        .client
        .edit_handler()
        .ok_or(BridgeError::CapabilityUnsupported(Capability::Edits))?;
    let caps = login.client.room_capabilities(&portal.key).await;

    let mut target = ctx
        .db
        .messages
        .get_by_mxid(&portal.key, &target_mxid)
        .await?
        .ok_or(BridgeError::TargetNotFound("edit target"))?;
    gate_matrix_edit(&caps, &target, event.timestamp)?;

    let mut content = content.clone();
    let orig_sender = if is_relay {
        let orig = build_orig_sender(portal, &event.room_id, &event.sender).await;
        if let Some(new_content) = content.new_content.as_deref_mut() {
            ctx.config.relay.apply_to_content(&orig, new_content);
        }
        Some(orig)
    } else {
        None
    };

    handler
        .handle_matrix_edit(
            MatrixEditRequest {
                portal: &record,
                event,
                content: &content,
                orig_sender: orig_sender.as_ref(),
            },
            &mut target,
        )
        .await?;
    target.edit_count += 1;
    ctx.db.messages.save(&target).await?;
    send_success_status(portal, event).await;
    Ok(())
}

async fn handle_reaction(
    portal: &Portal,
    event: &MatrixEvent,
    target_mxid: &MatrixEventId,
    key: &str,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let record = portal.record.read().await.clone();
    // Relayed users cannot react: resolve without the relay fallback.
    let (login, _) = portal.find_preferred_login(&event.sender, false).await?;
    let handler = login
        .client
        .reaction_handler()
        .ok_or(BridgeError::CapabilityUnsupported(Capability::Reactions))?;
    let caps = login.client.room_capabilities(&portal.key).await;
    gate_matrix_reaction(&caps)?;

    let target = ctx
        .db
        .messages
        .get_by_mxid(&portal.key, target_mxid)
        .await?
        .ok_or(BridgeError::TargetNotFound("reaction target"))?;

    let request = MatrixReactionRequest {
        portal: &record,
        event,
        target: &target,
        key,
    };
    let pre = handler.pre_handle_matrix_reaction(&request).await?;

    let existing = ctx
        .db
        .reactions
        .get(
            &portal.key,
            &target.id,
            &target.part_id,
            &pre.sender_id,
            &pre.emoji_id,
        )
        .await?;
    if let Some(existing) = &existing {
        if existing.emoji == pre.emoji {
            debug!(portal_id = %portal.key, "ignoring duplicate reaction");
            send_success_status(portal, event).await;
            return Ok(());
        }
    }

    let actor = login
        .intent()
        .map_or_else(|| ctx.matrix.bot_user_id(), |i| i.user_id);

    if pre.max_reactions > 0 {
        // Rolling window: keep the newest max-1 existing reactions to make
        // room for the new one.
        let mut all = ctx
            .db
            .reactions
            .get_by_sender(&portal.key, &target.id, &pre.sender_id)
            .await?;
        all.retain(|r| {
            !(r.emoji_id == pre.emoji_id && r.message_part_id == target.part_id)
        });
        let max = pre.max_reactions as usize;
        if all.len() + 1 > max {
            let excess = all.len() + 1 - max;
            for victim in all.iter().take(excess) {
                ctx.matrix
                    .redact(&actor, &event.room_id, &victim.mxid, None)
                    .await?;
                ctx.db.reactions.delete(victim).await?;
            }
        }
    }

    let metadata = handler.handle_matrix_reaction(&request, &pre).await?;

    if let Some(overridden) = existing {
        ctx.matrix
            .redact(&actor, &event.room_id, &overridden.mxid, None)
            .await?;
    }

    let event_id = event
        .id
        .clone()
        .ok_or_else(|| BridgeError::UnexpectedContent("reaction without event id".to_owned()))?;
    ctx.db
        .reactions
        .save(&crate::storage::ReactionRecord {
            portal: portal.key.clone(),
            message_id: target.id.clone(),
            message_part_id: target.part_id.clone(),
            sender_id: pre.sender_id,
            emoji_id: pre.emoji_id,
            emoji: pre.emoji,
            mxid: event_id,
            timestamp: event.timestamp,
            metadata,
        })
        .await?;
    send_success_status(portal, event).await;
    Ok(())
}

async fn handle_redaction(
    portal: &Portal,
    event: &MatrixEvent,
    redacts: &MatrixEventId,
    reason: Option<&str>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let record = portal.record.read().await.clone();
    let (login, _) = portal.find_preferred_login(&event.sender, true).await?;
    let request = MatrixRedactionRequest {
        portal: &record,
        event,
        reason,
    };

    if let Some(message) = ctx.db.messages.get_by_mxid(&portal.key, redacts).await? {
        let handler = login
            .client
            .redaction_handler()
            .ok_or(BridgeError::CapabilityUnsupported(Capability::Redactions))?;
        handler.handle_matrix_message_remove(&request, &message).await?;
        ctx.db
            .messages
            .delete_part(&portal.key, &message.id, &message.part_id)
            .await?;
    } else if let Some(reaction) = ctx.db.reactions.get_by_mxid(&portal.key, redacts).await? {
        let handler = login
            .client
            .reaction_handler()
            .ok_or(BridgeError::CapabilityUnsupported(Capability::Reactions))?;
        handler.handle_matrix_reaction_remove(&request, &reaction).await?;
        ctx.db.reactions.delete(&reaction).await?;
    } else {
        return Err(BridgeError::TargetNotFound("redaction target"));
    }
    send_success_status(portal, event).await;
    Ok(())
}

async fn handle_read_receipt(
    portal: &Portal,
    event: &MatrixEvent,
    event_id: &MatrixEventId,
    receipt_ts: chrono::DateTime<Utc>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let record = portal.record.read().await.clone();
    let login = match portal.find_preferred_login(&event.sender, false).await {
        Ok((login, _)) => login,
        Err(BridgeError::NotLoggedIn) => return Ok(()),
        Err(err) => return Err(err),
    };
    let Some(handler) = login.client.read_receipt_handler() else {
        return Ok(());
    };

    let target = ctx.db.messages.get_by_mxid(&portal.key, event_id).await?;
    handler
        .handle_matrix_read_receipt(&MatrixReadReceiptRequest {
            portal: &record,
            user: &event.sender,
            event_id,
            receipt_ts,
            target: target.as_ref(),
        })
        .await?;
    ctx.db
        .user_portals
        .set_last_read(&login.id, &portal.key, receipt_ts)
        .await?;
    ctx.disappearing.sweep(&event.room_id).await;
    Ok(())
}

async fn handle_typing(portal: &Portal, user_ids: &[MatrixUserId]) -> Result<(), BridgeError> {
    let (started, stopped) = {
        let mut current = portal
            .currently_typing
            .lock()
            .expect("typing lock poisoned");
        let mut new_state: Vec<MatrixUserId> = user_ids.to_vec();
        new_state.sort();
        new_state.dedup();
        let started: Vec<MatrixUserId> = new_state
            .iter()
            .filter(|u| !current.contains(u))
            .cloned()
            .collect();
        let stopped: Vec<MatrixUserId> = current
            .iter()
            .filter(|u| !new_state.contains(u))
            .cloned()
            .collect();
        *current = new_state;
        (started, stopped)
    };

    for (users, typing) in [(started, true), (stopped, false)] {
        for user in users {
            let login = match portal.find_preferred_login(&user, false).await {
                Ok((login, _)) => login,
                Err(_) => continue,
            };
            let Some(handler) = login.client.typing_handler() else {
                continue;
            };
            let record = portal.record.read().await.clone();
            if let Err(err) = handler.handle_matrix_typing(&record, typing).await {
                debug!(portal_id = %portal.key, user = %user, error = %err,
                    "failed to bridge typing status");
            }
        }
    }
    Ok(())
}

async fn handle_room_meta(portal: &Portal, event: &MatrixEvent) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let record = portal.record.read().await.clone();

    enum Meta<'a> {
        Name(&'a str),
        Topic(&'a str),
        Avatar(&'a str),
    }
    let change = match &event.kind {
        MatrixEventKind::RoomName { name } => {
            if record.name.as_deref() == Some(name.as_str()) {
                return Ok(());
            }
            Meta::Name(name)
        }
        MatrixEventKind::RoomTopic { topic } => {
            if record.topic.as_deref() == Some(topic.as_str()) {
                return Ok(());
            }
            Meta::Topic(topic)
        }
        MatrixEventKind::RoomAvatar { url } => {
            if record.avatar_mxc.as_deref() == Some(url.as_str()) {
                return Ok(());
            }
            Meta::Avatar(url)
        }
        _ => return Ok(()),
    };

    let (login, _) = portal.find_preferred_login(&event.sender, true).await?;
    let changed = match change {
        Meta::Name(name) => {
            let handler = login
                .client
                .room_name_handler()
                .ok_or(BridgeError::CapabilityUnsupported(Capability::RoomMetadata))?;
            handler.handle_matrix_room_name(&record, name).await?
        }
        Meta::Topic(topic) => {
            let handler = login
                .client
                .room_topic_handler()
                .ok_or(BridgeError::CapabilityUnsupported(Capability::RoomMetadata))?;
            handler.handle_matrix_room_topic(&record, topic).await?
        }
        Meta::Avatar(url) => {
            let handler = login
                .client
                .room_avatar_handler()
                .ok_or(BridgeError::CapabilityUnsupported(Capability::RoomMetadata))?;
            handler.handle_matrix_room_avatar(&record, url).await?
        }
    };

    if changed {
        let mut stored = portal.record.write().await;
        match &event.kind {
            MatrixEventKind::RoomName { name } => {
                stored.name = Some(name.clone());
                stored.name_set = true;
                stored.name_is_custom = true;
            }
            MatrixEventKind::RoomTopic { topic } => {
                stored.topic = Some(topic.clone());
                stored.topic_set = true;
            }
            MatrixEventKind::RoomAvatar { url } => {
                stored.avatar_mxc = Some(url.clone());
                stored.avatar_set = true;
            }
            _ => {}
        }
        let snapshot = stored.clone();
        drop(stored);
        ctx.db.portals.save(&snapshot).await?;
        send_bridge_info(ctx, &snapshot).await;
    }
    Ok(())
}

async fn handle_account_data(portal: &Portal, event: &MatrixEvent) -> Result<(), BridgeError> {
    let record = portal.record.read().await.clone();
    let login = match portal.find_preferred_login(&event.sender, false).await {
        Ok((login, _)) => login,
        Err(BridgeError::NotLoggedIn) => return Ok(()),
        Err(err) => return Err(err),
    };

    let result = match &event.kind {
        MatrixEventKind::MarkedUnread { unread } => match login.client.marked_unread_handler() {
            Some(handler) => handler.handle_matrix_marked_unread(&record, *unread).await,
            None => Ok(()),
        },
        MatrixEventKind::RoomTag { tag } => match login.client.room_tag_handler() {
            Some(handler) => handler.handle_matrix_room_tag(&record, tag.as_ref()).await,
            None => Ok(()),
        },
        MatrixEventKind::Mute { muted_until } => match login.client.mute_handler() {
            Some(handler) => handler.handle_matrix_mute(&record, *muted_until).await,
            None => Ok(()),
        },
        _ => Ok(()),
    };
    if let Err(err) = result {
        debug!(portal_id = %portal.key, error = %err, "failed to bridge account data update");
    }
    Ok(())
}

async fn handle_membership(
    portal: &Portal,
    event: &MatrixEvent,
    target: &MatrixUserId,
    prev: Membership,
    next: Membership,
) -> Result<(), BridgeError> {
    if next == Membership::Leave && !portal.ctx.config.bridge_matrix_leave {
        debug!(portal_id = %portal.key, "dropping native leave, bridging is disabled");
        return Ok(());
    }
    let record = portal.record.read().await.clone();
    let (login, _) = portal.find_preferred_login(&event.sender, true).await?;
    let handler = login
        .client
        .membership_handler()
        .ok_or(BridgeError::CapabilityUnsupported(Capability::Membership))?;
    handler
        .handle_matrix_membership(&MatrixMembershipRequest {
            portal: &record,
            event,
            target,
            prev,
            next,
            is_self: event.sender == *target,
        })
        .await?;
    Ok(())
}
