//! Picks the Matrix identity used to mirror a remote sender.

use std::sync::Arc;

use tracing::warn;

use crate::bridge::{BridgeContext, Ghost, UserLogin};
use crate::ids::{MatrixUserId, NetworkUserId};
use crate::matrix::Intent;
use crate::network::EventSender;
use crate::storage::{PortalRecord, RoomType};

/// Outcome of intent resolution.
pub struct ResolvedIntent {
    pub intent: Intent,
    /// A real Matrix user who is simultaneously the actor, for callers that
    /// want to invite or attribute them explicitly.
    pub extra_user: Option<MatrixUserId>,
    /// The ghost of the (possibly rewritten) sender, when one exists.
    pub ghost: Option<Arc<Ghost>>,
    /// Sender id after DM-peer rewriting.
    pub sender_id: NetworkUserId,
}

/// Resolves the intent for a remote sender.
///
/// Preference order: the source login's double puppet for own events, a
/// known login's double puppet, a login matched via `is_this_user` when
/// `check_all_logins` is requested, the sender's ghost, and finally the
/// bridge bot.
pub(crate) async fn resolve_intent(
    ctx: &BridgeContext,
    portal: &PortalRecord,
    sender: &EventSender,
    source: &Arc<UserLogin>,
    check_all_logins: bool,
    other_logins: &[Arc<UserLogin>],
) -> ResolvedIntent {
    let mut sender_id = sender.sender_id.clone();
    if portal.room_type == RoomType::Dm && sender.force_dm_user && !sender.is_from_me {
        if let Some(peer) = &portal.other_user_id {
            if sender_id != *peer {
                warn!(
                    portal_id = %portal.key,
                    sender_id = %sender_id,
                    dm_peer = %peer,
                    "overriding DM event sender with the chat peer"
                );
                sender_id = peer.clone();
            }
        }
    }

    let ghost = match ctx.ghosts.get(&sender_id).await {
        Ok(ghost) => Some(ghost),
        Err(err) => {
            warn!(portal_id = %portal.key, sender_id = %sender_id, error = %err,
                "failed to get ghost for remote sender");
            None
        }
    };

    let mut extra_user = None;
    if sender.is_from_me {
        if let Some(intent) = source.intent() {
            return ResolvedIntent {
                intent,
                extra_user: None,
                ghost,
                sender_id,
            };
        }
        extra_user = Some(source.user_mxid.clone());
    } else if let Some(login_id) = &sender.sender_login {
        if let Some(login) = ctx.logins.get(login_id).await {
            if let Some(intent) = login.intent() {
                return ResolvedIntent {
                    intent,
                    extra_user: None,
                    ghost,
                    sender_id,
                };
            }
            extra_user = Some(login.user_mxid.clone());
        }
    } else if check_all_logins {
        for login in other_logins {
            if login.client.is_this_user(&sender_id).await {
                if let Some(intent) = login.intent() {
                    return ResolvedIntent {
                        intent,
                        extra_user: None,
                        ghost,
                        sender_id,
                    };
                }
                extra_user = Some(login.user_mxid.clone());
                break;
            }
        }
    }

    match &ghost {
        Some(ghost_ref) => ResolvedIntent {
            intent: ghost_ref.intent(),
            extra_user,
            ghost,
            sender_id,
        },
        None => ResolvedIntent {
            intent: ctx.bot_intent(),
            extra_user,
            ghost: None,
            sender_id,
        },
    }
}
