//! Typed notifications shared between the gateway and worker processes.
//!
//! A notification is a kind plus an optional row identifier, published on the
//! channel named after its kind.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{IbcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Every cached view is stale
    RefreshAll,
    /// One account needs refreshing
    AccountRefresh,
    /// An account feed finished writing
    AccountFeedDone,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 3] = [
        NotificationKind::RefreshAll,
        NotificationKind::AccountRefresh,
        NotificationKind::AccountFeedDone,
    ];

    /// Channel name used on the bus
    pub fn channel(&self) -> &'static str {
        match self {
            Self::RefreshAll => "refreshall",
            Self::AccountRefresh => "accountrefresh",
            Self::AccountFeedDone => "accountfeeddone",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.channel())
    }
}

impl FromStr for NotificationKind {
    type Err = IbcError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.channel() == raw)
            .ok_or_else(|| IbcError::Validation(format!("unregistered notification type '{raw}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    #[serde(default)]
    pub id: i64,
}

impl Notification {
    pub fn new(kind: NotificationKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
