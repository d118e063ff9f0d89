//! Shared bridge services the portal borrows: login and ghost lookup plus
//! the context bundle wiring every collaborator together.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BridgeConfig;
use crate::disappearing::DisappearingScheduler;
use crate::error::BridgeError;
use crate::ids::{MatrixUserId, NetworkUserId, UserLoginId};
use crate::matrix::{Intent, MatrixApi};
use crate::network::{NetworkClient, UserInfo};
use crate::storage::Database;

/// A native user's session on the remote network.
pub struct UserLogin {
    pub id: UserLoginId,
    /// The Matrix user owning this login.
    pub user_mxid: MatrixUserId,
    /// This login's own identity on the remote network.
    pub remote_user_id: NetworkUserId,
    pub remote_name: Option<String>,
    /// Double-puppet identity, when the user granted one.
    pub double_puppet: Option<MatrixUserId>,
    pub client: Arc<dyn NetworkClient>,
}

impl UserLogin {
    /// Intent acting as the user themselves, when double puppeting is set
    /// up.
    #[must_use]
    pub fn intent(&self) -> Option<Intent> {
        self.double_puppet.clone().map(Intent::double_puppet)
    }
}

impl std::fmt::Debug for UserLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserLogin")
            .field("id", &self.id)
            .field("user_mxid", &self.user_mxid)
            .field("remote_user_id", &self.remote_user_id)
            .field("double_puppet", &self.double_puppet)
            .finish_non_exhaustive()
    }
}

/// Lookup of logins by id; the cache behind it lives outside the portal
/// core.
#[async_trait]
pub trait UserLoginRegistry: Send + Sync {
    async fn get(&self, id: &UserLoginId) -> Option<Arc<UserLogin>>;
}

/// Puppet identity representing a remote user on the Matrix side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ghost {
    pub id: NetworkUserId,
    pub mxid: MatrixUserId,
    pub name: Option<String>,
}

impl Ghost {
    #[must_use]
    pub fn intent(&self) -> Intent {
        Intent::ghost(self.mxid.clone())
    }
}

/// Ghost lookup and profile maintenance. `get` creates the ghost when
/// missing and refreshes a stale profile.
#[async_trait]
pub trait GhostDirectory: Send + Sync {
    async fn get(&self, id: &NetworkUserId) -> Result<Arc<Ghost>, BridgeError>;

    /// Applies connector-provided profile data to the ghost.
    async fn update_info(&self, id: &NetworkUserId, info: &UserInfo) -> Result<(), BridgeError>;
}

/// Everything a portal needs from the surrounding bridge.
#[derive(Clone)]
pub struct BridgeContext {
    pub config: BridgeConfig,
    pub matrix: Arc<dyn MatrixApi>,
    pub db: Database,
    pub logins: Arc<dyn UserLoginRegistry>,
    pub ghosts: Arc<dyn GhostDirectory>,
    pub disappearing: Arc<dyn DisappearingScheduler>,
}

impl BridgeContext {
    /// Intent acting as the bridge bot.
    #[must_use]
    pub fn bot_intent(&self) -> Intent {
        Intent::bot(self.matrix.bot_user_id())
    }
}
