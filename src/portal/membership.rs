//! Reconciles remote member snapshots against the Matrix room.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bridge::{BridgeContext, UserLogin};
use crate::error::BridgeError;
use crate::ids::MatrixUserId;
use crate::matrix::{IntentKind, Membership, PowerLevelChanges, event_type};
use crate::network::ChatMemberList;
use crate::portal::intents::resolve_intent;
use crate::storage::PortalRecord;

/// Applies a member list snapshot or diff to the portal room. Returns
/// whether the portal record was modified (DM peer updates).
pub(crate) async fn sync_members(
    ctx: &BridgeContext,
    record: &mut PortalRecord,
    source: &Arc<UserLogin>,
    members: &ChatMemberList,
) -> Result<bool, BridgeError> {
    let Some(room_id) = record.room_id.clone() else {
        return Ok(false);
    };
    let bot = ctx.matrix.bot_user_id();

    let mut other_logins: Vec<Arc<UserLogin>> = Vec::new();
    if members.check_all_logins {
        for row in ctx.db.user_portals.get_all_in_portal(&record.key).await? {
            if let Some(login) = ctx.logins.get(&row.login_id).await {
                other_logins.push(login);
            }
        }
    }

    let mut current = ctx.matrix.get_members(&room_id).await?;
    current.remove(&bot);

    let mut power_levels = ctx.matrix.get_power_levels(&room_id).await?;
    let mut levels_changed = false;
    if let Some(changes) = &members.power_levels {
        levels_changed |= changes.apply(None, &mut power_levels);
    }
    let mut member_levels = PowerLevelChanges::default();

    let mut seen: HashSet<MatrixUserId> = HashSet::new();
    for member in &members.members {
        let resolved = resolve_intent(
            ctx,
            record,
            &member.sender,
            source,
            members.check_all_logins,
            &other_logins,
        )
        .await;

        if let Some(info) = &member.user_info {
            if let Err(err) = ctx.ghosts.update_info(&resolved.sender_id, info).await {
                warn!(portal_id = %record.key, sender_id = %resolved.sender_id,
                    error = %err, "failed to update ghost profile during member sync");
            }
        }

        let mut targets = Vec::new();
        if resolved.intent.kind != IntentKind::Bot {
            targets.push(resolved.intent.user_id.clone());
        }
        if let Some(extra) = &resolved.extra_user {
            targets.push(extra.clone());
        }

        for target in targets {
            seen.insert(target.clone());
            let current_membership = current.get(&target).copied().unwrap_or(Membership::Leave);
            let desired = member.membership;

            if let Some(level) = member.power_level {
                if power_levels.user_level(&target) != level {
                    member_levels.users.insert(target.clone(), Some(level));
                }
            }

            if let Some(prev) = member.prev_membership {
                if prev != current_membership {
                    debug!(portal_id = %record.key, member = %target,
                        expected = %prev, current = %current_membership,
                        "skipping membership transition with mismatched previous state");
                    continue;
                }
            }
            if current_membership == desired {
                continue;
            }

            // Banned users need an unban before any other transition.
            if current_membership == Membership::Ban && desired != Membership::Ban {
                ctx.matrix
                    .set_membership(&bot, &room_id, &target, Membership::Leave, None)
                    .await?;
            }

            let actor = if resolved.intent.user_id == target {
                bot.clone()
            } else {
                resolved.intent.user_id.clone()
            };

            match desired {
                Membership::Join => {
                    if current_membership != Membership::Invite {
                        ctx.matrix
                            .set_membership(&bot, &room_id, &target, Membership::Invite, None)
                            .await?;
                    }
                    ctx.matrix.ensure_joined(&room_id, &target).await?;
                }
                Membership::Invite | Membership::Leave | Membership::Ban | Membership::Knock => {
                    ctx.matrix
                        .set_membership(&actor, &room_id, &target, desired, None)
                        .await?;
                }
            }
        }
    }

    if members.is_full {
        let relay_configured = record.relay_login_id.is_some();
        for (member, membership) in &current {
            if seen.contains(member) {
                continue;
            }
            if !matches!(membership, Membership::Join | Membership::Invite) {
                continue;
            }
            if ctx.matrix.parse_ghost_user_id(member).is_some() {
                continue;
            }
            if relay_configured {
                continue;
            }
            ctx.matrix
                .set_membership(&bot, &room_id, member, Membership::Leave, None)
                .await?;
        }
    }

    levels_changed |= member_levels.apply(None, &mut power_levels);
    if levels_changed {
        let content = serde_json::to_value(&power_levels)
            .map_err(|e| BridgeError::UnexpectedContent(e.to_string()))?;
        ctx.matrix
            .send_state(&bot, &room_id, event_type::POWER_LEVELS, "", &content, None)
            .await?;
    }

    Ok(update_other_user(record, members))
}

/// Maintains the DM-peer attribute from a member snapshot.
pub(crate) fn update_other_user(record: &mut PortalRecord, members: &ChatMemberList) -> bool {
    let Some(other) = &members.other_user_id else {
        return false;
    };
    if record.other_user_id.as_ref() == Some(other) {
        return false;
    }
    record.other_user_id = Some(other.clone());
    true
}
