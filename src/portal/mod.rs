//! The portal: per-conversation state machine bridging one remote chat
//! with one Matrix room.
//!
//! All mutations to a portal flow through its bounded event mailbox, which
//! a single worker task drains in arrival order. That per-portal
//! serialization is the invariant everything else leans on; portals
//! themselves run in parallel. Enqueueing never blocks: when the mailbox is
//! full the event is dropped with an error log, and the remote side is
//! expected to resync (or the Matrix side to retry).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::{Mutex as AsyncMutex, RwLock, mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::bridge::{BridgeContext, UserLogin};
use crate::error::{BridgeError, MessageStatus, StatusClass};
use crate::ids::{MatrixUserId, PortalKey};
use crate::matrix::{MatrixEvent, event_type, notice_content};
use crate::network::{ChatInfo, RemoteEvent};
use crate::storage::PortalRecord;

pub mod capabilities;
pub mod intents;
pub mod lifecycle;
pub mod matrix_handler;
pub mod membership;
pub mod pending;
pub mod registry;
pub mod relations;
pub mod remote_handler;

pub use pending::{PendingEcho, PendingEchoTable};
pub use registry::PortalRegistry;

use registry::PortalIndex;

/// Events delivered to a portal's serial worker.
pub(crate) enum PortalEvent {
    Matrix {
        event: MatrixEvent,
    },
    Remote {
        event: Box<dyn RemoteEvent>,
        source: Arc<UserLogin>,
    },
    CreateRoom {
        source: Arc<UserLogin>,
        info: Option<ChatInfo>,
        done: oneshot::Sender<Result<(), BridgeError>>,
    },
    Stop,
}

/// Per-conversation bridging unit. Owns its mailbox, pending-echo table,
/// typing state and room-create lock.
pub struct Portal {
    pub key: PortalKey,
    pub(crate) ctx: Arc<BridgeContext>,
    pub(crate) record: RwLock<PortalRecord>,
    pub(crate) index: Arc<PortalIndex>,
    events: mpsc::Sender<PortalEvent>,
    /// Covers room creation triggered outside the event queue.
    pub(crate) room_create_lock: AsyncMutex<()>,
    pub(crate) pending: PendingEchoTable,
    pub(crate) currently_typing: std::sync::Mutex<Vec<MatrixUserId>>,
    stopped: AtomicBool,
}

impl Portal {
    pub(crate) fn spawn(
        ctx: Arc<BridgeContext>,
        index: Arc<PortalIndex>,
        record: PortalRecord,
    ) -> Arc<Self> {
        let capacity = ctx.config.portal_queue_capacity.as_usize();
        let (events, receiver) = mpsc::channel(capacity);
        let portal = Arc::new(Self {
            key: record.key.clone(),
            ctx,
            record: RwLock::new(record),
            index,
            events,
            room_create_lock: AsyncMutex::new(()),
            pending: PendingEchoTable::new(),
            currently_typing: std::sync::Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });
        let worker = Arc::clone(&portal);
        tokio::spawn(async move { worker.run(receiver).await });
        portal
    }

    /// Snapshot of the persisted portal state.
    pub async fn record_snapshot(&self) -> PortalRecord {
        self.record.read().await.clone()
    }

    /// Queues a native event for the serial worker. Non-blocking; drops the
    /// event when the mailbox is full.
    pub fn queue_matrix_event(&self, event: MatrixEvent) {
        if self
            .events
            .try_send(PortalEvent::Matrix { event })
            .is_err()
        {
            error!(portal_id = %self.key, "dropping matrix event, portal queue is full");
        }
    }

    /// Queues a remote event for the serial worker. Non-blocking; drops the
    /// event when the mailbox is full.
    pub fn queue_remote_event(&self, event: Box<dyn RemoteEvent>, source: Arc<UserLogin>) {
        if self
            .events
            .try_send(PortalEvent::Remote { event, source })
            .is_err()
        {
            error!(portal_id = %self.key, "dropping remote event, portal queue is full");
        }
    }

    /// Creates the Matrix room for this portal, waiting for the worker to
    /// finish. Dropping the future abandons the wait; creation still runs
    /// to completion inside the worker.
    pub async fn create_matrix_room(
        &self,
        source: &Arc<UserLogin>,
        info: Option<ChatInfo>,
    ) -> Result<(), BridgeError> {
        if self.record.read().await.room_id.is_some() {
            return Ok(());
        }
        let (done, wait) = oneshot::channel();
        self.events
            .try_send(PortalEvent::CreateRoom {
                source: Arc::clone(source),
                info,
                done,
            })
            .map_err(|_| BridgeError::QueueFull)?;
        match wait.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::CreateAbandoned),
        }
    }

    /// Deletes the portal: database rows, the Matrix room, the cache entry
    /// and finally the worker.
    pub async fn delete(&self) -> Result<(), BridgeError> {
        self.delete_now().await
    }

    pub(crate) async fn delete_now(&self) -> Result<(), BridgeError> {
        let record = self.record.read().await.clone();
        self.ctx.db.messages.delete_all_in_portal(&self.key).await?;
        self.ctx.db.reactions.delete_all_in_portal(&self.key).await?;
        self.ctx
            .db
            .user_portals
            .delete_all_in_portal(&self.key)
            .await?;
        self.ctx.db.portals.delete(&self.key).await?;
        if let Some(room_id) = &record.room_id {
            if let Err(err) = self.ctx.matrix.delete_room(room_id).await {
                warn!(portal_id = %self.key, error = %err, "failed to delete matrix room");
            }
        }
        self.index.remove(&self.key, record.room_id.as_ref());
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.events.try_send(PortalEvent::Stop);
        debug!(portal_id = %self.key, "portal deleted");
        Ok(())
    }

    /// Forgets the Matrix room without touching the remote chat, so a new
    /// room can be created later.
    pub async fn remove_matrix_room_id(&self) -> Result<(), BridgeError> {
        let mut record = self.record.write().await;
        if let Some(room_id) = record.room_id.take() {
            self.index.unmap_room(&room_id);
        }
        record.name_set = false;
        record.topic_set = false;
        record.avatar_set = false;
        record.in_space = false;
        let snapshot = record.clone();
        drop(record);
        self.ctx.db.portals.save(&snapshot).await
    }

    /// Configures (or clears) the relay login used for users without their
    /// own login.
    pub async fn set_relay(&self, login: Option<&Arc<UserLogin>>) -> Result<(), BridgeError> {
        let mut record = self.record.write().await;
        record.relay_login_id = login.map(|l| l.id.clone());
        let snapshot = record.clone();
        drop(record);
        self.ctx.db.portals.save(&snapshot).await
    }

    /// Picks the login acting for a Matrix user in this portal: the first
    /// logged-in login by stored preference, else the relay when permitted.
    /// The boolean is true when the relay was chosen.
    pub(crate) async fn find_preferred_login(
        &self,
        user: &MatrixUserId,
        allow_relay: bool,
    ) -> Result<(Arc<UserLogin>, bool), BridgeError> {
        let rows = self
            .ctx
            .db
            .user_portals
            .get_all_for_user(user, &self.key)
            .await?;
        for row in rows {
            if let Some(login) = self.ctx.logins.get(&row.login_id).await {
                if login.client.is_logged_in() {
                    return Ok((login, false));
                }
            }
        }
        if allow_relay && self.ctx.config.relay.enabled {
            let relay_id = self.record.read().await.relay_login_id.clone();
            if let Some(relay_id) = relay_id {
                if let Some(login) = self.ctx.logins.get(&relay_id).await {
                    return Ok((login, true));
                }
            }
        }
        Err(BridgeError::NotLoggedIn)
    }

    async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<PortalEvent>) {
        debug!(portal_id = %self.key, "portal worker started");
        while let Some(event) = receiver.recv().await {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.expire_pending().await;
            match event {
                PortalEvent::Matrix { event } => self.handle_matrix_guarded(event).await,
                PortalEvent::Remote { event, source } => {
                    self.handle_remote_guarded(event, source).await;
                }
                PortalEvent::CreateRoom { source, info, done } => {
                    let result =
                        AssertUnwindSafe(lifecycle::create_room(&self, &source, info))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                Err(BridgeError::PanicInHandler(panic_message(&panic)))
                            });
                    // The caller may have abandoned the wait.
                    let _ = done.send(result);
                }
                PortalEvent::Stop => break,
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
        }
        debug!(portal_id = %self.key, "portal worker stopped");
    }

    async fn handle_matrix_guarded(&self, event: MatrixEvent) {
        let result = AssertUnwindSafe(matrix_handler::handle_matrix_event(self, &event))
            .catch_unwind()
            .await;
        let (err, panicked) = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => (err, false),
            Err(panic) => (BridgeError::PanicInHandler(panic_message(&panic)), true),
        };
        error!(portal_id = %self.key, event_id = ?event.id, error = %err,
            "failed to handle matrix event");
        if panicked || matrix_handler::wants_status(&event.kind) {
            if let (Some(event_id), Some(status)) = (&event.id, err.status()) {
                self.ctx
                    .matrix
                    .send_message_status(&event.room_id, event_id, &status)
                    .await;
            }
        }
    }

    async fn handle_remote_guarded(&self, event: Box<dyn RemoteEvent>, source: Arc<UserLogin>) {
        let result = AssertUnwindSafe(remote_handler::handle_remote_event(
            self,
            event.as_ref(),
            &source,
        ))
        .catch_unwind()
        .await;
        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(panic) => BridgeError::PanicInHandler(panic_message(&panic)),
        };
        error!(portal_id = %self.key, remote_event = %event.event_type(), error = %err,
            "failed to handle remote event");
        if err.is_user_visible() {
            let room_id = self.record.read().await.room_id.clone();
            if let Some(room_id) = room_id {
                let content = notice_content(
                    "An internal error occurred while handling a remote event",
                    Some(&err.to_string()),
                );
                let bot = self.ctx.matrix.bot_user_id();
                if let Err(send_err) = self
                    .ctx
                    .matrix
                    .send_message(&bot, &room_id, event_type::MESSAGE, &content, None)
                    .await
                {
                    warn!(portal_id = %self.key, error = %send_err,
                        "failed to send error notice");
                }
            }
        }
    }

    /// Drops pending echoes past their timeout, reporting a retriable
    /// status so the sender can retry.
    async fn expire_pending(&self) {
        let ttl = Duration::from_secs(self.ctx.config.pending_echo_timeout_secs);
        for expired in self.pending.drain_expired(ttl, Utc::now()) {
            warn!(portal_id = %self.key, "pending message was never echoed by the network");
            if let Some(event_id) = expired.source_event_id {
                let status = MessageStatus {
                    class: StatusClass::Retriable,
                    message: "the network did not confirm the message in time".to_owned(),
                    delivered: false,
                };
                self.ctx
                    .matrix
                    .send_message_status(&expired.room_id, &event_id, &status)
                    .await;
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
