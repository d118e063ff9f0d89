//! Dispatches remote-network events to the Matrix side via intents.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;

use crate::bridge::UserLogin;
use crate::disappearing::DisappearingMessage;
use crate::error::{BridgeError, MessageStatus};
use crate::ids::{EmojiId, MatrixRoomId, MatrixUserId, MessageRef, NetworkMessageId, NetworkUserId};
use crate::matrix::{Intent, MessageContent, RelatesTo, event_type};
use crate::network::{
    ConvertedPart, EventSender, RemoteEvent, RemoteEventType, RemoteMessage,
};
use crate::portal::Portal;
use crate::portal::intents::resolve_intent;
use crate::portal::lifecycle;
use crate::portal::pending::PendingEcho;
use crate::portal::relations::{
    ResolvedRelations, apply_relations_to_content, resolve_remote_relations,
};
use crate::storage::{MessageRecord, PortalRecord, ReactionRecord, RoomType};

fn require_room(record: &PortalRecord) -> Result<MatrixRoomId, BridgeError> {
    record
        .room_id
        .clone()
        .ok_or_else(|| BridgeError::Matrix("portal has no room".to_owned()))
}

pub(crate) async fn handle_remote_event(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let event_type = event.event_type();
    debug!(portal_id = %portal.key, remote_event = %event_type,
        context = ?event.log_context(), "handling remote event");

    if portal.record.read().await.room_id.is_none() {
        if event_type == RemoteEventType::ChatDelete {
            return portal.delete_now().await;
        }
        if !event.should_create_portal() {
            debug!(portal_id = %portal.key, remote_event = %event_type,
                "dropping remote event for portal without room");
            return Ok(());
        }
        lifecycle::create_room(portal, source, event.get_chat_info()).await?;
        if event_type == RemoteEventType::ChatResync {
            // The creation path already applied the chat info.
            return Ok(());
        }
    }

    if let Some(pre) = event.as_pre_handler() {
        let record = portal.record.read().await.clone();
        pre.pre_handle(&record).await;
    }

    match event_type {
        RemoteEventType::Message => handle_message(portal, event, source).await,
        RemoteEventType::Edit => handle_edit(portal, event, source).await,
        RemoteEventType::Reaction => handle_reaction(portal, event, source).await,
        RemoteEventType::ReactionSync => handle_reaction_sync(portal, event, source).await,
        RemoteEventType::ReactionRemove => handle_reaction_remove(portal, event, source).await,
        RemoteEventType::MessageRemove => handle_message_remove(portal, event, source).await,
        RemoteEventType::ReadReceipt => handle_read_receipt(portal, event, source).await,
        RemoteEventType::MarkUnread => handle_mark_unread(portal, event, source).await,
        RemoteEventType::DeliveryReceipt => handle_delivery_receipt(portal, event).await,
        RemoteEventType::Typing => handle_typing(portal, event, source).await,
        RemoteEventType::ChatInfoChange => handle_chat_info_change(portal, event, source).await,
        RemoteEventType::ChatResync => handle_resync(portal, event, source).await,
        RemoteEventType::ChatDelete => portal.delete_now().await,
    }
}

async fn handle_message(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let message = event
        .as_message()
        .ok_or_else(|| BridgeError::UnexpectedContent("message event without payload".to_owned()))?;

    if let Some(txn) = event.transaction_id() {
        if let Some(pending) = portal.pending.take(&txn) {
            debug!(portal_id = %portal.key, transaction_id = %txn, "received remote echo");
            return finish_pending(portal, event, message, pending).await;
        }
    }

    let id = message.id();
    let existing = portal.ctx.db.messages.get_all_parts(&portal.key, &id).await?;
    if !existing.is_empty() {
        let Some(upsert) = event.as_upsert() else {
            debug!(portal_id = %portal.key, message_id = %id, "ignoring duplicate message");
            return Ok(());
        };
        let record = portal.record.read().await.clone();
        let result = upsert.handle_existing(&record, &existing).await?;
        for part in &result.save_parts {
            portal.ctx.db.messages.save(part).await?;
        }
        for sub in result.sub_events {
            Box::pin(handle_remote_event(portal, sub.as_ref(), source)).await?;
        }
        if !result.continue_message_handling {
            return Ok(());
        }
    }

    convert_and_send(portal, event, message, source).await
}

/// Finalizes a pending send whose echo arrived: one-shot removal already
/// happened, so this owns persistence and the status report.
async fn finish_pending(
    portal: &Portal,
    event: &dyn RemoteEvent,
    message: &dyn RemoteMessage,
    pending: PendingEcho,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let PendingEcho {
        draft: mut row,
        room_id,
        source_event_id,
        on_echo,
        ..
    } = pending;

    row.id = message.id();
    if row.sender_id.is_empty() {
        row.sender_id = event.sender().sender_id;
    }
    if let Some(ts) = event.timestamp() {
        row.timestamp = ts;
    }

    let mut should_save = true;
    let mut status_error = None;
    if let Some(handler) = on_echo {
        match handler(event, &mut row) {
            Ok(save) => should_save = save,
            Err(err) => {
                should_save = false;
                status_error = Some(err);
            }
        }
    }

    if should_save {
        ctx.db.messages.save(&row).await?;
        let disappear = portal.record.read().await.disappear;
        if disappear.is_enabled() {
            if let Some(schedule) = DisappearingMessage::for_new_event(
                &disappear,
                room_id.clone(),
                row.mxid.clone(),
                row.timestamp,
            ) {
                ctx.disappearing.enqueue(schedule).await;
            }
        }
    }

    if let Some(event_id) = source_event_id {
        let status = match &status_error {
            None => Some(MessageStatus::success()),
            Some(err) => err.status(),
        };
        if let Some(status) = status {
            ctx.matrix
                .send_message_status(&room_id, &event_id, &status)
                .await;
        }
    }
    Ok(())
}

async fn convert_and_send(
    portal: &Portal,
    event: &dyn RemoteEvent,
    message: &dyn RemoteMessage,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let mut record = portal.record.read().await.clone();
    let sender = event.sender();
    let resolved = resolve_intent(ctx, &record, &sender, source, false, &[]).await;

    let converted = match message.convert(&record, &resolved.intent).await {
        Ok(converted) => converted,
        Err(BridgeError::IgnoringRemoteEvent(reason)) => {
            debug!(portal_id = %portal.key, reason = %reason, "remote message dropped by converter");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    if let Some(setting) = converted.disappear {
        if setting != record.disappear {
            let mut stored = portal.record.write().await;
            if lifecycle::update_disappearing(ctx, &mut stored, setting, true).await {
                record = stored.clone();
                drop(stored);
                ctx.db.portals.save(&record).await?;
            }
        }
    }

    let relations = resolve_remote_relations(
        ctx,
        &record,
        converted.thread_root.as_ref(),
        converted.reply_to.as_ref(),
        false,
    )
    .await?;

    send_parts(
        portal,
        &record,
        &resolved.intent,
        &resolved.sender_id,
        &message.id(),
        event.timestamp(),
        converted.parts,
        relations,
        converted.thread_root.clone(),
        converted.reply_to.clone(),
    )
    .await?;

    if let Some(extra) = &resolved.extra_user {
        // The actor is also a real logged-in user; make sure their account
        // is in the room for attribution.
        if let Some(room_id) = &record.room_id {
            let _ = ctx.matrix.ensure_joined(room_id, extra).await;
        }
    }
    Ok(())
}

/// Sends converted parts through the intent, persisting a row per part.
/// The thread-prev cursor advances across non-fake parts so later parts
/// thread-continue the previous one.
#[allow(clippy::too_many_arguments)]
async fn send_parts(
    portal: &Portal,
    record: &PortalRecord,
    intent: &Intent,
    sender_id: &NetworkUserId,
    message_id: &NetworkMessageId,
    timestamp: Option<DateTime<Utc>>,
    parts: Vec<ConvertedPart>,
    mut relations: ResolvedRelations,
    thread_root: Option<NetworkMessageId>,
    reply_to: Option<MessageRef>,
) -> Result<Vec<MessageRecord>, BridgeError> {
    let ctx = &portal.ctx;
    let room_id = require_room(record)?;
    let ts = timestamp.unwrap_or_else(Utc::now);
    let mut saved = Vec::with_capacity(parts.len());

    for part in parts {
        let (mxid, fake) = if part.dont_bridge {
            (
                ctx.matrix.generate_deterministic_event_id(
                    &room_id,
                    &portal.key,
                    message_id,
                    &part.id,
                ),
                true,
            )
        } else {
            let mut content = part.content;
            apply_relations_to_content(&relations, &mut content);
            let mut value = serde_json::to_value(&content)
                .map_err(|e| BridgeError::UnexpectedContent(e.to_string()))?;
            if let Some(extra) = &part.extra {
                merge_extra(&mut value, extra);
            }
            let event_id = ctx
                .matrix
                .send_message(&intent.user_id, &room_id, &part.event_type, &value, Some(ts))
                .await?;
            if relations.thread_root_mxid.is_some() {
                relations.thread_prev_mxid = Some(event_id.clone());
                relations.reply_to_mxid = None;
                relations.reply_to_sender = None;
            }
            (event_id, false)
        };

        let row = MessageRecord {
            portal: portal.key.clone(),
            id: message_id.clone(),
            part_id: part.id,
            mxid: mxid.clone(),
            fake_mxid: fake,
            sender_id: sender_id.clone(),
            sender_mxid: intent.user_id.clone(),
            timestamp: ts,
            thread_root: thread_root.clone(),
            reply_to: reply_to.clone(),
            edit_count: 0,
            metadata: part.metadata,
        };
        ctx.db.messages.save(&row).await?;

        if !fake && record.disappear.is_enabled() {
            if let Some(schedule) = DisappearingMessage::for_new_event(
                &record.disappear,
                room_id.clone(),
                mxid,
                ts,
            ) {
                ctx.disappearing.enqueue(schedule).await;
            }
        }
        saved.push(row);
    }
    Ok(saved)
}

fn merge_extra(content: &mut Value, extra: &Value) {
    if let (Value::Object(content), Value::Object(extra)) = (content, extra) {
        for (key, value) in extra {
            content.insert(key.clone(), value.clone());
        }
    }
}

async fn handle_edit(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let edit = event
        .as_edit()
        .ok_or_else(|| BridgeError::UnexpectedContent("edit event without payload".to_owned()))?;
    let record = portal.record.read().await.clone();
    let room_id = require_room(&record)?;

    let existing = match edit.target_parts() {
        Some(parts) => parts,
        None => {
            ctx.db
                .messages
                .get_all_parts(&portal.key, &edit.target_message())
                .await?
        }
    };
    if existing.is_empty() {
        return Err(BridgeError::TargetNotFound("edit target"));
    }

    let sender = event.sender();
    let resolved = resolve_intent(ctx, &record, &sender, source, false, &[]).await;
    let converted = match edit.convert_edit(&record, &resolved.intent, &existing).await {
        Ok(converted) => converted,
        Err(BridgeError::IgnoringRemoteEvent(reason)) => {
            debug!(portal_id = %portal.key, reason = %reason, "remote edit dropped by converter");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    for edited in converted.modified {
        let mut row = edited.record;
        row.edit_count += 1;
        if row.fake_mxid {
            // Tracked but never bridged: the edit only updates storage.
            ctx.db.messages.save(&row).await?;
            continue;
        }
        let mut content = edited.content.clone();
        content.relates_to = None;
        let wrapper = MessageContent {
            msgtype: content.msgtype.clone(),
            body: format!("* {}", content.body),
            relates_to: Some(RelatesTo::replace(row.mxid.clone())),
            new_content: Some(Box::new(content)),
            ..MessageContent::default()
        };
        let mut value = serde_json::to_value(&wrapper)
            .map_err(|e| BridgeError::UnexpectedContent(e.to_string()))?;
        if let Some(extra) = &edited.extra {
            merge_extra(&mut value, extra);
        }
        ctx.matrix
            .send_message(
                &resolved.intent.user_id,
                &room_id,
                &edited.event_type,
                &value,
                event.timestamp(),
            )
            .await?;
        ctx.db.messages.save(&row).await?;
    }

    for deleted in converted.deleted {
        if !deleted.fake_mxid {
            ctx.matrix
                .redact(&resolved.intent.user_id, &room_id, &deleted.mxid, None)
                .await?;
        }
        ctx.db
            .messages
            .delete_part(&portal.key, &deleted.id, &deleted.part_id)
            .await?;
    }

    if !converted.added.is_empty() {
        let first = &existing[0];
        let relations = resolve_remote_relations(
            ctx,
            &record,
            first.thread_root.as_ref(),
            None,
            false,
        )
        .await?;
        send_parts(
            portal,
            &record,
            &resolved.intent,
            &resolved.sender_id,
            &edit.target_message(),
            event.timestamp(),
            converted.added,
            relations,
            first.thread_root.clone(),
            first.reply_to.clone(),
        )
        .await?;
    }
    Ok(())
}

async fn lookup_target_part(
    portal: &Portal,
    target: &MessageRef,
) -> Result<Option<MessageRecord>, BridgeError> {
    match &target.part_id {
        Some(part) => {
            portal
                .ctx
                .db
                .messages
                .get_part(&portal.key, &target.message_id, part)
                .await
        }
        None => {
            portal
                .ctx
                .db
                .messages
                .get_first_part(&portal.key, &target.message_id)
                .await
        }
    }
}

async fn handle_reaction(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let reaction = event.as_reaction().ok_or_else(|| {
        BridgeError::UnexpectedContent("reaction event without payload".to_owned())
    })?;
    let record = portal.record.read().await.clone();
    let room_id = require_room(&record)?;

    let target = lookup_target_part(portal, &reaction.target_message())
        .await?
        .ok_or(BridgeError::TargetNotFound("reaction target"))?;

    let sender = event.sender();
    let resolved = resolve_intent(ctx, &record, &sender, source, false, &[]).await;
    let emoji = reaction.emoji();
    let emoji_id = reaction.emoji_id();

    let existing = ctx
        .db
        .reactions
        .get(&portal.key, &target.id, &target.part_id, &resolved.sender_id, &emoji_id)
        .await?;
    if let Some(existing) = &existing {
        if existing.emoji == emoji {
            debug!(portal_id = %portal.key, "ignoring duplicate remote reaction");
            return Ok(());
        }
    }

    let content = json!({
        "m.relates_to": RelatesTo::annotation(target.mxid.clone(), emoji.clone()),
    });
    let event_id = ctx
        .matrix
        .send_message(
            &resolved.intent.user_id,
            &room_id,
            event_type::REACTION,
            &content,
            event.timestamp(),
        )
        .await?;

    if let Some(old) = existing {
        // Same reaction identity with different emoji text: replace.
        ctx.matrix
            .redact(&resolved.intent.user_id, &room_id, &old.mxid, None)
            .await?;
    }

    ctx.db
        .reactions
        .save(&ReactionRecord {
            portal: portal.key.clone(),
            message_id: target.id.clone(),
            message_part_id: target.part_id.clone(),
            sender_id: resolved.sender_id.clone(),
            emoji_id,
            emoji,
            mxid: event_id,
            timestamp: event.timestamp().unwrap_or_else(Utc::now),
            metadata: reaction.reaction_metadata(),
        })
        .await?;
    Ok(())
}

/// Redacts and deletes a stored reaction, acting as its original sender
/// when possible.
async fn remove_reaction(
    portal: &Portal,
    room_id: &MatrixRoomId,
    fallback_actor: &MatrixUserId,
    row: &ReactionRecord,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let actor = match ctx.ghosts.get(&row.sender_id).await {
        Ok(ghost) => ghost.intent().user_id,
        Err(_) => fallback_actor.clone(),
    };
    ctx.matrix.redact(&actor, room_id, &row.mxid, None).await?;
    ctx.db.reactions.delete(row).await?;
    Ok(())
}

async fn handle_reaction_sync(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let sync = event.as_reaction_sync().ok_or_else(|| {
        BridgeError::UnexpectedContent("reaction sync event without payload".to_owned())
    })?;
    let record = portal.record.read().await.clone();
    let room_id = require_room(&record)?;
    let message_id = sync.target_message();
    let target = ctx
        .db
        .messages
        .get_first_part(&portal.key, &message_id)
        .await?
        .ok_or(BridgeError::TargetNotFound("reaction sync target"))?;

    let data = sync.reactions();
    let mut existing_by_user: HashMap<NetworkUserId, Vec<ReactionRecord>> = HashMap::new();
    for row in ctx
        .db
        .reactions
        .get_all_by_message(&portal.key, &message_id)
        .await?
    {
        existing_by_user
            .entry(row.sender_id.clone())
            .or_default()
            .push(row);
    }

    for (user_id, user_data) in &data.users {
        let sender = EventSender {
            sender_id: user_id.clone(),
            sender_login: None,
            is_from_me: *user_id == source.remote_user_id,
            force_dm_user: false,
        };
        let resolved = resolve_intent(ctx, &record, &sender, source, false, &[]).await;
        let mut remaining = existing_by_user.remove(user_id).unwrap_or_default();
        let mut kept: HashSet<EmojiId> = HashSet::new();
        let mut added = 0usize;

        for incoming in &user_data.reactions {
            let emoji_id = incoming.emoji_id.clone();
            if let Some(pos) = remaining.iter().position(|r| r.emoji_id == emoji_id) {
                if !incoming.emoji_id.is_empty() || remaining[pos].emoji == incoming.emoji {
                    kept.insert(emoji_id);
                    continue;
                }
                let old = remaining.remove(pos);
                remove_reaction(portal, &room_id, &resolved.intent.user_id, &old).await?;
            }
            let content = json!({
                "m.relates_to": RelatesTo::annotation(target.mxid.clone(), incoming.emoji.clone()),
            });
            let event_id = ctx
                .matrix
                .send_message(
                    &resolved.intent.user_id,
                    &room_id,
                    event_type::REACTION,
                    &content,
                    incoming.timestamp,
                )
                .await?;
            ctx.db
                .reactions
                .save(&ReactionRecord {
                    portal: portal.key.clone(),
                    message_id: message_id.clone(),
                    message_part_id: target.part_id.clone(),
                    sender_id: resolved.sender_id.clone(),
                    emoji_id: emoji_id.clone(),
                    emoji: incoming.emoji.clone(),
                    mxid: event_id,
                    timestamp: incoming.timestamp.unwrap_or_else(Utc::now),
                    metadata: incoming.metadata.clone(),
                })
                .await?;
            kept.insert(emoji_id);
            added += 1;
        }

        if user_data.has_all_reactions {
            for leftover in remaining {
                if !kept.contains(&leftover.emoji_id) {
                    remove_reaction(portal, &room_id, &resolved.intent.user_id, &leftover).await?;
                }
            }
        } else if user_data.max_count > 0 {
            // Evict the oldest surviving reactions beyond the cap; the
            // store returns them oldest-first with emoji id as tie-break.
            let mut survivors: Vec<ReactionRecord> = remaining
                .into_iter()
                .filter(|r| kept.contains(&r.emoji_id))
                .collect();
            let max = user_data.max_count as usize;
            while survivors.len() + added > max && !survivors.is_empty() {
                let victim = survivors.remove(0);
                remove_reaction(portal, &room_id, &resolved.intent.user_id, &victim).await?;
            }
        }
    }

    if data.has_all_users {
        let bot = ctx.matrix.bot_user_id();
        for rows in existing_by_user.into_values() {
            for row in rows {
                remove_reaction(portal, &room_id, &bot, &row).await?;
            }
        }
    }
    Ok(())
}

async fn handle_reaction_remove(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let removal = event.as_reaction_remove().ok_or_else(|| {
        BridgeError::UnexpectedContent("reaction remove event without payload".to_owned())
    })?;
    let record = portal.record.read().await.clone();
    let room_id = require_room(&record)?;

    let Some(target) = lookup_target_part(portal, &removal.target_message()).await? else {
        debug!(portal_id = %portal.key, "reaction removal target not found");
        return Ok(());
    };
    let sender = event.sender();
    let resolved = resolve_intent(ctx, &record, &sender, source, false, &[]).await;

    let Some(row) = ctx
        .db
        .reactions
        .get(
            &portal.key,
            &target.id,
            &target.part_id,
            &resolved.sender_id,
            &removal.emoji_id(),
        )
        .await?
    else {
        debug!(portal_id = %portal.key, "reaction to remove is not bridged");
        return Ok(());
    };
    remove_reaction(portal, &room_id, &resolved.intent.user_id, &row).await
}

async fn handle_message_remove(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let removal = event.as_message_remove().ok_or_else(|| {
        BridgeError::UnexpectedContent("message remove event without payload".to_owned())
    })?;
    let record = portal.record.read().await.clone();
    let room_id = require_room(&record)?;
    let message_id = removal.target_message();

    let parts = ctx.db.messages.get_all_parts(&portal.key, &message_id).await?;
    if parts.is_empty() {
        debug!(portal_id = %portal.key, message_id = %message_id,
            "message to remove is not bridged");
        return Ok(());
    }
    let sender = event.sender();
    let resolved = resolve_intent(ctx, &record, &sender, source, false, &[]).await;
    for part in &parts {
        if part.fake_mxid {
            continue;
        }
        ctx.matrix
            .redact(&resolved.intent.user_id, &room_id, &part.mxid, None)
            .await?;
    }
    ctx.db
        .messages
        .delete_all_parts(&portal.key, &message_id)
        .await?;
    Ok(())
}

async fn handle_read_receipt(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let receipt = event.as_read_receipt().ok_or_else(|| {
        BridgeError::UnexpectedContent("read receipt event without payload".to_owned())
    })?;
    let record = portal.record.read().await.clone();
    let room_id = require_room(&record)?;
    let sender = event.sender();
    let resolved = resolve_intent(ctx, &record, &sender, source, false, &[]).await;

    let target_mxid = if let Some(last) = receipt.last_target() {
        ctx.db
            .messages
            .get_last_part(&portal.key, &last)
            .await?
            .map(|m| m.mxid)
    } else {
        let mut best: Option<MessageRecord> = None;
        for target in receipt.targets() {
            if let Some(found) = ctx.db.messages.get_last_part(&portal.key, &target).await? {
                if best.as_ref().is_none_or(|b| found.timestamp > b.timestamp) {
                    best = Some(found);
                }
            }
        }
        match best {
            Some(found) => Some(found.mxid),
            None => match receipt.read_up_to() {
                Some(up_to) => ctx
                    .db
                    .messages
                    .get_last_before(&portal.key, up_to)
                    .await?
                    .map(|m| m.mxid),
                None => None,
            },
        }
    };

    if let Some(target) = target_mxid {
        let ts = event.timestamp().unwrap_or_else(Utc::now);
        ctx.matrix
            .mark_read(&resolved.intent.user_id, &room_id, &target, ts)
            .await?;
    } else {
        debug!(portal_id = %portal.key, "no bridged target for remote read receipt");
    }

    if sender.is_from_me {
        let ts = event.timestamp().unwrap_or_else(Utc::now);
        ctx.db
            .user_portals
            .set_last_read(&source.id, &portal.key, ts)
            .await?;
        ctx.disappearing.sweep(&room_id).await;
    }
    Ok(())
}

async fn handle_mark_unread(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let mark = event.as_mark_unread().ok_or_else(|| {
        BridgeError::UnexpectedContent("mark unread event without payload".to_owned())
    })?;
    if !event.sender().is_from_me {
        debug!(portal_id = %portal.key, "ignoring mark-unread from another user");
        return Ok(());
    }
    let record = portal.record.read().await.clone();
    let room_id = require_room(&record)?;
    let Some(double_puppet) = &source.double_puppet else {
        return Ok(());
    };
    portal
        .ctx
        .matrix
        .mark_unread(double_puppet, &room_id, mark.unread())
        .await
}

async fn handle_delivery_receipt(
    portal: &Portal,
    event: &dyn RemoteEvent,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let receipt = event.as_delivery_receipt().ok_or_else(|| {
        BridgeError::UnexpectedContent("delivery receipt event without payload".to_owned())
    })?;
    let record = portal.record.read().await.clone();
    if record.room_type != RoomType::Dm {
        return Ok(());
    }
    let room_id = require_room(&record)?;
    for message_id in receipt.target_messages() {
        for part in ctx.db.messages.get_all_parts(&portal.key, &message_id).await? {
            if part.fake_mxid {
                continue;
            }
            // Parts sent by ghosts are remote messages; only locally-sent
            // parts get delivery feedback.
            if ctx.matrix.parse_ghost_user_id(&part.sender_mxid).is_some() {
                continue;
            }
            ctx.matrix
                .send_message_status(&room_id, &part.mxid, &MessageStatus::delivered())
                .await;
        }
    }
    Ok(())
}

async fn handle_typing(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let typing = event
        .as_typing()
        .ok_or_else(|| BridgeError::UnexpectedContent("typing event without payload".to_owned()))?;
    let record = portal.record.read().await.clone();
    let room_id = require_room(&record)?;
    let sender = event.sender();
    let resolved = resolve_intent(ctx, &record, &sender, source, false, &[]).await;
    ctx.matrix
        .mark_typing(
            &resolved.intent.user_id,
            &room_id,
            typing.typing_type(),
            typing.timeout(),
        )
        .await
}

async fn handle_chat_info_change(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let change = event.as_chat_info_change().ok_or_else(|| {
        BridgeError::UnexpectedContent("chat info change event without payload".to_owned())
    })?;
    let info = change.chat_info_change();
    let sender = event.sender();
    let record = portal.record.read().await.clone();
    let resolved = resolve_intent(ctx, &record, &sender, source, false, &[]).await;

    let mut stored = portal.record.write().await;
    lifecycle::update_info(ctx, &mut stored, Some(&resolved.intent), source, &info).await?;
    Ok(())
}

async fn handle_resync(
    portal: &Portal,
    event: &dyn RemoteEvent,
    source: &Arc<UserLogin>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let info = match event.get_chat_info() {
        Some(info) => info,
        None => source.client.get_chat_info(&portal.key).await?,
    };
    {
        let mut stored = portal.record.write().await;
        lifecycle::update_info(ctx, &mut stored, None, source, &info).await?;
    }

    if ctx.config.backfill_enabled {
        if let Some(resync) = event.as_resync() {
            let latest = ctx.db.messages.get_last(&portal.key).await?;
            if resync.check_needs_backfill(latest.as_ref()) {
                ctx.db.backfill.ensure_task(&portal.key, &source.id).await?;
            }
        }
    }
    Ok(())
}
