//! Bridge configuration.
//!
//! Only the knobs consumed by the portal core live here; transport and
//! appservice settings belong to the surrounding binary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::QueueCapacity;
use crate::matrix::{MessageContent, OrigSender};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

/// Identity of the bridged network, used in bridge-info state events and
/// room alias derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfoConfig {
    /// Stable protocol identifier, e.g. `examplechat`.
    pub id: String,
    /// Human-readable network name, e.g. `Example Chat`.
    pub displayname: String,
}

impl Default for NetworkInfoConfig {
    fn default() -> Self {
        Self {
            id: "remotenetwork".to_owned(),
            displayname: "Remote Network".to_owned(),
        }
    }
}

/// Relay-mode formatting for messages sent by users without a login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub enabled: bool,
    /// Template for the displayed sender name. Supports `{displayname}` and
    /// `{user_id}`.
    pub displayname_format: String,
    /// Template wrapping the message body. Supports `{displayname}` and
    /// `{body}`.
    pub message_format: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            displayname_format: "{displayname}".to_owned(),
            message_format: "{displayname}: {body}".to_owned(),
        }
    }
}

impl RelayConfig {
    /// Formats a relayed sender's display name.
    #[must_use]
    pub fn format_displayname(&self, displayname: &str, user_id: &str) -> String {
        self.displayname_format
            .replace("{displayname}", displayname)
            .replace("{user_id}", user_id)
    }

    /// Rewrites a message body so the remote side shows who actually sent it.
    pub fn apply_to_content(&self, sender: &OrigSender, content: &mut MessageContent) {
        content.body = self
            .message_format
            .replace("{displayname}", &sender.formatted_name)
            .replace("{body}", &content.body);
        if let Some(formatted) = content.formatted_body.take() {
            content.formatted_body = Some(
                self.message_format
                    .replace("{displayname}", &sender.formatted_name)
                    .replace("{body}", &formatted),
            );
        }
    }
}

/// Complete portal-core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Capacity of each portal's event mailbox.
    pub portal_queue_capacity: QueueCapacity,
    /// Whether Matrix-side leave events are forwarded to the network.
    pub bridge_matrix_leave: bool,
    /// Whether forward backfill tasks are enqueued on room creation/resync.
    pub backfill_enabled: bool,
    /// Seconds before an unanswered pending echo is dropped with a
    /// retriable status.
    pub pending_echo_timeout_secs: u64,
    pub relay: RelayConfig,
    pub network: NetworkInfoConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            portal_queue_capacity: QueueCapacity::default(),
            bridge_matrix_leave: true,
            backfill_enabled: false,
            pending_echo_timeout_secs: 300,
            relay: RelayConfig::default(),
            network: NetworkInfoConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.id.is_empty() {
            return Err(ConfigError::ValidationError {
                field: "network.id".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        if self.pending_echo_timeout_secs == 0 {
            return Err(ConfigError::ValidationError {
                field: "pending_echo_timeout_secs".to_owned(),
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.relay.enabled && !self.relay.message_format.contains("{body}") {
            return Err(ConfigError::ValidationError {
                field: "relay.message_format".to_owned(),
                reason: "must contain {body}".to_owned(),
            });
        }
        Ok(())
    }
}
