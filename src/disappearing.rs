//! Disappearing-message types and the external scheduler interface.
//!
//! The portal only computes when an event should vanish and hands the tuple
//! to a [`DisappearingScheduler`]; actually deleting events on time is an
//! external subsystem.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ids::{MatrixEventId, MatrixRoomId};

/// When messages in a chat disappear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisappearingType {
    #[default]
    None,
    /// Timer starts when the recipient reads the message.
    AfterRead,
    /// Timer starts when the message is sent.
    AfterSend,
}

impl DisappearingType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AfterRead => "after_read",
            Self::AfterSend => "after_send",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "after_read" => Self::AfterRead,
            "after_send" => Self::AfterSend,
            _ => Self::None,
        }
    }
}

/// Per-chat disappearing-message setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisappearingSetting {
    pub disappear_type: DisappearingType,
    pub timer: Option<Duration>,
}

impl DisappearingSetting {
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.disappear_type != DisappearingType::None && self.timer.is_some()
    }

    /// Human-readable timer for notices, e.g. "1h 30m".
    #[must_use]
    pub fn describe_timer(&self) -> String {
        let Some(timer) = self.timer else {
            return "off".to_owned();
        };
        let total = timer.as_secs();
        let (days, hours, minutes, seconds) =
            (total / 86_400, (total % 86_400) / 3600, (total % 3600) / 60, total % 60);
        let mut out = String::new();
        for (value, unit) in [(days, "d"), (hours, "h"), (minutes, "m"), (seconds, "s")] {
            if value > 0 {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&format!("{value}{unit}"));
            }
        }
        if out.is_empty() {
            out.push_str("0s");
        }
        out
    }
}

/// A scheduled deletion handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisappearingMessage {
    pub room_id: MatrixRoomId,
    pub event_id: MatrixEventId,
    pub disappear_type: DisappearingType,
    pub timer: Duration,
    /// Absolute deadline; unset for after-read messages that have not been
    /// read yet.
    pub disappear_at: Option<DateTime<Utc>>,
}

impl DisappearingMessage {
    /// Builds the schedule entry for a freshly bridged event, or `None` when
    /// the setting is disabled.
    #[must_use]
    pub fn for_new_event(
        setting: &DisappearingSetting,
        room_id: MatrixRoomId,
        event_id: MatrixEventId,
        sent_at: DateTime<Utc>,
    ) -> Option<Self> {
        let timer = setting.timer?;
        let disappear_at = match setting.disappear_type {
            DisappearingType::None => return None,
            DisappearingType::AfterRead => None,
            DisappearingType::AfterSend => {
                Some(sent_at + chrono::Duration::from_std(timer).unwrap_or_default())
            }
        };
        Some(Self {
            room_id,
            event_id,
            disappear_type: setting.disappear_type,
            timer,
            disappear_at,
        })
    }
}

/// External scheduler consuming disappearing-message tuples.
#[async_trait]
pub trait DisappearingScheduler: Send + Sync {
    /// Registers a message for future deletion.
    async fn enqueue(&self, message: DisappearingMessage);

    /// Starts the timers of after-read messages in the room that have just
    /// become eligible.
    async fn sweep(&self, room: &MatrixRoomId);
}
