//! Matrix room lifecycle: creation, metadata updates, space linkage and
//! bridge-info state events.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeContext, UserLogin};
use crate::disappearing::DisappearingSetting;
use crate::error::BridgeError;
use crate::ids::{MatrixRoomId, PortalKey};
use crate::matrix::{
    BridgeInfoContent, BridgeInfoSection, InitialStateEvent, Intent, IntentKind,
    PowerLevelContent, RoomCreateRequest, RoomPreset, RoomVisibility, event_type, notice_content,
    raw_field,
};
use crate::network::ChatInfo;
use crate::portal::Portal;
use crate::portal::intents::resolve_intent;
use crate::portal::membership::sync_members;
use crate::storage::{PortalRecord, RoomType, UserPortalRecord};

/// Power level granted to the bridge bot in portal rooms.
const BOT_POWER_LEVEL: i64 = 9001;
/// Level pinned onto state events nobody but admins should touch.
const PROTECTED_STATE_LEVEL: i64 = 100;

/// Derives the predictable room alias localpart for a portal.
pub(crate) fn derive_alias_localpart(network_id: &str, key: &PortalKey) -> String {
    let mut localpart = format!("{network_id}_{key}");
    localpart = localpart
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    localpart
}

/// Builds the bridge-info state key and content for a portal.
pub(crate) fn bridge_info(ctx: &BridgeContext, record: &PortalRecord) -> (String, Value) {
    let network = &ctx.config.network;
    let state_key = format!("{}://{}", network.id, record.key.chat_id);
    let content = BridgeInfoContent {
        bridgebot: ctx.matrix.bot_user_id(),
        creator: None,
        protocol: BridgeInfoSection {
            id: network.id.clone(),
            displayname: Some(network.displayname.clone()),
            avatar_url: None,
        },
        channel: BridgeInfoSection {
            id: record.key.chat_id.to_string(),
            displayname: record.name.clone(),
            avatar_url: record.avatar_mxc.clone(),
        },
    };
    (
        state_key,
        serde_json::to_value(content).unwrap_or(Value::Null),
    )
}

/// Emits the two parallel bridge-info state events. Treated as one logical
/// write; a failure of either is logged, not propagated.
pub(crate) async fn send_bridge_info(ctx: &BridgeContext, record: &PortalRecord) {
    let Some(room_id) = &record.room_id else {
        return;
    };
    let bot = ctx.matrix.bot_user_id();
    let (state_key, content) = bridge_info(ctx, record);
    for evt_type in [event_type::BRIDGE_INFO, event_type::BRIDGE_INFO_LEGACY] {
        if let Err(err) = ctx
            .matrix
            .send_state(&bot, room_id, evt_type, &state_key, &content, None)
            .await
        {
            warn!(portal_id = %record.key, error = %err, "failed to update bridge info");
        }
    }
}

/// Sends a state event through the acting intent, falling back to the bot
/// with a set_by annotation when the intent lacks permission.
async fn send_state_with_fallback(
    ctx: &BridgeContext,
    room_id: &MatrixRoomId,
    sender: Option<&Intent>,
    evt_type: &str,
    state_key: &str,
    content: Value,
) -> Result<(), BridgeError> {
    let bot = ctx.matrix.bot_user_id();
    if let Some(intent) = sender {
        if intent.kind != IntentKind::Bot {
            match ctx
                .matrix
                .send_state(&intent.user_id, room_id, evt_type, state_key, &content, None)
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) => {
                    debug!(sender = %intent.user_id, error = %err,
                        "state event send failed, falling back to bot");
                }
            }
            let mut annotated = content;
            if let Value::Object(map) = &mut annotated {
                map.insert(
                    raw_field::SET_BY.to_owned(),
                    Value::String(intent.user_id.to_string()),
                );
            }
            ctx.matrix
                .send_state(&bot, room_id, evt_type, state_key, &annotated, None)
                .await?;
            return Ok(());
        }
    }
    ctx.matrix
        .send_state(&bot, room_id, evt_type, state_key, &content, None)
        .await?;
    Ok(())
}

/// Updates the disappearing-message setting, posting the explanatory
/// notice. `implicit` marks auto-enabling caused by an incoming
/// disappearing message.
pub(crate) async fn update_disappearing(
    ctx: &BridgeContext,
    record: &mut PortalRecord,
    setting: DisappearingSetting,
    implicit: bool,
) -> bool {
    if record.disappear == setting {
        return false;
    }
    record.disappear = setting;
    if let Some(room_id) = &record.room_id {
        let text = if !setting.is_enabled() {
            "Disappearing messages disabled".to_owned()
        } else if implicit {
            format!(
                "Automatically enabled disappearing message timer ({}) because incoming message is disappearing",
                setting.describe_timer(),
            )
        } else {
            format!("Disappearing messages set to {}", setting.describe_timer())
        };
        let bot = ctx.matrix.bot_user_id();
        if let Err(err) = ctx
            .matrix
            .send_message(
                &bot,
                room_id,
                event_type::MESSAGE,
                &notice_content(&text, None),
                None,
            )
            .await
        {
            warn!(portal_id = %record.key, error = %err,
                "failed to send disappearing-setting notice");
        }
    }
    true
}

async fn update_parent(
    ctx: &BridgeContext,
    record: &mut PortalRecord,
    parent: &crate::network::ParentRef,
) -> Result<bool, BridgeError> {
    let new_key = PortalKey::shared(parent.chat_id.clone());
    if record.parent_key.as_ref() == Some(&new_key) {
        return Ok(false);
    }
    let bot = ctx.matrix.bot_user_id();
    let server_name = ctx.matrix.server_name().to_owned();

    // Leave the old space before joining the new one.
    if let (Some(old_parent), Some(room_id)) = (&record.parent_key, &record.room_id) {
        if let Some(old_record) = ctx.db.portals.get(old_parent).await? {
            if let Some(old_space) = &old_record.room_id {
                let _ = ctx
                    .matrix
                    .send_state(&bot, old_space, event_type::SPACE_CHILD, room_id.as_str(), &json!({}), None)
                    .await;
            }
        }
    }

    let parent_record = match ctx.db.portals.get(&new_key).await? {
        Some(existing) => existing,
        None if parent.create => {
            let mut created = PortalRecord::new(new_key.clone());
            created.room_type = RoomType::Space;
            ctx.db.portals.save(&created).await?;
            created
        }
        None => {
            record.parent_key = Some(new_key);
            record.in_space = false;
            return Ok(true);
        }
    };

    record.parent_key = Some(new_key);
    record.in_space = false;
    if let (Some(space_room), Some(room_id)) = (&parent_record.room_id, &record.room_id) {
        let via = json!({ "via": [server_name], "canonical": true });
        ctx.matrix
            .send_state(&bot, space_room, event_type::SPACE_CHILD, room_id.as_str(), &via, None)
            .await?;
        ctx.matrix
            .send_state(&bot, room_id, event_type::SPACE_PARENT, space_room.as_str(), &via, None)
            .await?;
        record.in_space = true;
    } else {
        debug!(portal_id = %record.key, "parent space has no room yet, deferring linkage");
    }
    Ok(true)
}

/// Diffs the provided chat metadata against the portal and applies every
/// change, emitting the corresponding state events. Persists the record and
/// refreshes the bridge-info events when anything changed.
pub(crate) async fn update_info(
    ctx: &BridgeContext,
    record: &mut PortalRecord,
    sender: Option<&Intent>,
    source: &Arc<UserLogin>,
    info: &ChatInfo,
) -> Result<bool, BridgeError> {
    let mut changed = false;

    if let Some(room_type) = info.room_type {
        if record.room_type != room_type && record.room_id.is_none() {
            record.room_type = room_type;
            changed = true;
        }
    }

    if let Some(name) = &info.name {
        if !record.name_is_custom && (!record.name_set || record.name.as_deref() != Some(name)) {
            record.name = Some(name.clone());
            record.name_set = true;
            changed = true;
            if let Some(room_id) = &record.room_id.clone() {
                send_state_with_fallback(
                    ctx,
                    room_id,
                    sender,
                    event_type::ROOM_NAME,
                    "",
                    json!({ "name": name }),
                )
                .await?;
            }
        }
    }

    if let Some(topic) = &info.topic {
        if !record.topic_set || record.topic.as_deref() != Some(topic) {
            record.topic = Some(topic.clone());
            record.topic_set = true;
            changed = true;
            if let Some(room_id) = &record.room_id.clone() {
                send_state_with_fallback(
                    ctx,
                    room_id,
                    sender,
                    event_type::ROOM_TOPIC,
                    "",
                    json!({ "topic": topic }),
                )
                .await?;
            }
        }
    }

    if let Some(avatar) = &info.avatar {
        if !record.avatar_set || record.avatar_id.as_deref() != Some(avatar.id.as_str()) {
            record.avatar_id = Some(avatar.id.clone());
            record.avatar_hash = avatar.hash.clone();
            record.avatar_mxc = avatar.mxc.clone();
            record.avatar_set = true;
            changed = true;
            if let Some(room_id) = &record.room_id.clone() {
                send_state_with_fallback(
                    ctx,
                    room_id,
                    sender,
                    event_type::ROOM_AVATAR,
                    "",
                    json!({ "url": avatar.mxc.clone().unwrap_or_default() }),
                )
                .await?;
            }
        }
    }

    if let Some(parent) = &info.parent {
        changed |= update_parent(ctx, record, parent).await?;
    }

    if let Some(setting) = info.disappear {
        changed |= update_disappearing(ctx, record, setting, false).await;
    }

    if let Some(members) = &info.members {
        changed |= sync_members(ctx, record, source, members).await?;
    }

    if changed {
        ctx.db.portals.save(record).await?;
        send_bridge_info(ctx, record).await;
    }
    Ok(changed)
}

fn apply_info_before_create(record: &mut PortalRecord, info: &ChatInfo) {
    if let Some(room_type) = info.room_type {
        record.room_type = room_type;
    }
    if let Some(name) = &info.name {
        record.name = Some(name.clone());
    }
    if let Some(topic) = &info.topic {
        record.topic = Some(topic.clone());
    }
    if let Some(avatar) = &info.avatar {
        record.avatar_id = Some(avatar.id.clone());
        record.avatar_hash = avatar.hash.clone();
        record.avatar_mxc = avatar.mxc.clone();
    }
    if let Some(setting) = info.disappear {
        record.disappear = setting;
    }
    if let Some(members) = &info.members {
        if members.other_user_id.is_some() {
            record.other_user_id = members.other_user_id.clone();
        }
    }
    if let Some(parent) = &info.parent {
        record.parent_key = Some(PortalKey::shared(parent.chat_id.clone()));
    }
}

/// Creates the Matrix room for a portal. Runs inside the portal worker;
/// the create lock covers the rare out-of-queue path.
pub(crate) async fn create_room(
    portal: &Portal,
    source: &Arc<UserLogin>,
    info: Option<ChatInfo>,
) -> Result<(), BridgeError> {
    let ctx = &portal.ctx;
    let _guard = portal.room_create_lock.lock().await;
    if portal.record.read().await.room_id.is_some() {
        return Ok(());
    }

    let info = match info {
        Some(provided) if provided.members.is_some() => provided,
        _ => source.client.get_chat_info(&portal.key).await?,
    };

    let mut record = portal.record.read().await.clone();
    apply_info_before_create(&mut record, &info);

    let bot = ctx.matrix.bot_user_id();
    let mut power_levels = PowerLevelContent::default();
    power_levels.set_user_level(bot.clone(), BOT_POWER_LEVEL);
    for pinned in [
        event_type::TOMBSTONE,
        event_type::SERVER_ACL,
        event_type::ENCRYPTION,
    ] {
        power_levels
            .events
            .insert(pinned.to_owned(), PROTECTED_STATE_LEVEL);
    }

    let mut invites = Vec::new();
    let mut functional_members = vec![bot.clone()];
    if let Some(members) = &info.members {
        if let Some(changes) = &members.power_levels {
            changes.apply(None, &mut power_levels);
        }
        for member in &members.members {
            let resolved = resolve_intent(ctx, &record, &member.sender, source, false, &[]).await;
            match resolved.intent.kind {
                IntentKind::DoublePuppet => {
                    invites.push(resolved.intent.user_id.clone());
                }
                IntentKind::Ghost => {
                    invites.push(resolved.intent.user_id.clone());
                    if let Some(extra) = &resolved.extra_user {
                        invites.push(extra.clone());
                        functional_members.push(resolved.intent.user_id.clone());
                    }
                }
                IntentKind::Bot => {}
            }
            if let Some(extra) = &resolved.extra_user {
                if !invites.contains(extra) {
                    invites.push(extra.clone());
                }
            }
            if let Some(level) = member.power_level {
                power_levels.set_user_level(resolved.intent.user_id.clone(), level);
                if let Some(extra) = &resolved.extra_user {
                    power_levels.set_user_level(extra.clone(), level);
                }
            }
        }
    }
    invites.sort();
    invites.dedup();

    let mut initial_state = vec![InitialStateEvent {
        event_type: event_type::FUNCTIONAL_MEMBERS.to_owned(),
        state_key: String::new(),
        content: json!({ "service_members": functional_members }),
    }];
    let (bridge_state_key, bridge_content) = bridge_info(ctx, &record);
    for evt_type in [event_type::BRIDGE_INFO, event_type::BRIDGE_INFO_LEGACY] {
        initial_state.push(InitialStateEvent {
            event_type: evt_type.to_owned(),
            state_key: bridge_state_key.clone(),
            content: bridge_content.clone(),
        });
    }
    if let Some(mxc) = &record.avatar_mxc {
        initial_state.push(InitialStateEvent {
            event_type: event_type::ROOM_AVATAR.to_owned(),
            state_key: String::new(),
            content: json!({ "url": mxc }),
        });
    }
    if let Some(join_rule) = &info.join_rule {
        initial_state.push(InitialStateEvent {
            event_type: event_type::JOIN_RULES.to_owned(),
            state_key: String::new(),
            content: join_rule.clone(),
        });
    }
    if let Some(parent_key) = &record.parent_key {
        if let Some(parent_record) = ctx.db.portals.get(parent_key).await? {
            if let Some(space_room) = &parent_record.room_id {
                initial_state.push(InitialStateEvent {
                    event_type: event_type::SPACE_PARENT.to_owned(),
                    state_key: space_room.to_string(),
                    content: json!({
                        "via": [ctx.matrix.server_name()],
                        "canonical": true,
                    }),
                });
                record.in_space = true;
            }
        }
    }

    let mut creation_content = serde_json::Map::new();
    if record.room_type == RoomType::Space {
        creation_content.insert("type".to_owned(), Value::String("m.space".to_owned()));
    }

    let request = RoomCreateRequest {
        visibility: RoomVisibility::Private,
        preset: RoomPreset::PrivateChat,
        is_direct: record.room_type == RoomType::Dm,
        name: record.name.clone(),
        // An explicit empty topic keeps later topic syncs diffable.
        topic: Some(record.topic.clone().unwrap_or_default()),
        room_alias_local_part: Some(derive_alias_localpart(
            &ctx.config.network.id,
            &record.key,
        )),
        invite: invites,
        initial_state,
        power_levels,
        creation_content,
    };

    let room_id = ctx.matrix.create_room(&request).await?;
    info!(portal_id = %record.key, room_id = %room_id, "created matrix room");

    record.room_id = Some(room_id.clone());
    record.name_set = record.name.is_some();
    record.topic_set = true;
    record.avatar_set = record.avatar_mxc.is_some();
    ctx.db.portals.save(&record).await?;
    portal.index.map_room(room_id.clone(), record.key.clone());

    ctx.db
        .user_portals
        .save(&UserPortalRecord {
            login_id: source.id.clone(),
            user_mxid: source.user_mxid.clone(),
            portal: record.key.clone(),
            in_portal: true,
            in_space: false,
            preference: 0,
            last_read: None,
        })
        .await?;

    if record.room_type == RoomType::Dm {
        if let Some(other) = &record.other_user_id {
            if let Ok(ghost) = ctx.ghosts.get(other).await {
                let _ = ctx
                    .matrix
                    .mark_as_dm(&source.user_mxid, &room_id, &ghost.mxid)
                    .await;
            }
        }
    }

    if !ctx.matrix.server_supports_auto_join_invites() {
        match &info.members {
            Some(members) => {
                sync_members(ctx, &mut record, source, members).await?;
                ctx.db.portals.save(&record).await?;
            }
            None => {
                ctx.matrix.ensure_joined(&room_id, &source.user_mxid).await?;
            }
        }
    }

    if ctx.config.backfill_enabled {
        ctx.db.backfill.ensure_task(&record.key, &source.id).await?;
    }

    *portal.record.write().await = record;
    Ok(())
}
