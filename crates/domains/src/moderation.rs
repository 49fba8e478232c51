//! # Moderation
//!
//! Action types, staff levels and the append-only moderation log.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::models::PostId;

/// Actor recorded on entries written by scheduled maintenance.
pub const SYSTEM_ACTOR: &str = "system";

/// Account allowed to perform every action on every board.
pub const ADMIN_ACCOUNT: &str = "admin";

/// Kind of a moderation log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModerationAction {
    BanPost,
    UnbanPost,
    DeletePost,
    DeleteImage,
    SpoilerImage,
    LockThread,
    DeleteBoard,
    PurgePost,
    DeletePostsByIp,
    ChangeStaff,
}

impl ModerationAction {
    pub const ALL: [ModerationAction; 10] = [
        Self::BanPost,
        Self::UnbanPost,
        Self::DeletePost,
        Self::DeleteImage,
        Self::SpoilerImage,
        Self::LockThread,
        Self::DeleteBoard,
        Self::PurgePost,
        Self::DeletePostsByIp,
        Self::ChangeStaff,
    ];

    /// Stable name, used as the storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BanPost => "ban-post",
            Self::UnbanPost => "unban-post",
            Self::DeletePost => "delete-post",
            Self::DeleteImage => "delete-image",
            Self::SpoilerImage => "spoiler-image",
            Self::LockThread => "lock-thread",
            Self::DeleteBoard => "delete-board",
            Self::PurgePost => "purge-post",
            Self::DeletePostsByIp => "delete-posts-by-ip",
            Self::ChangeStaff => "change-staff",
        }
    }
}

impl fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModerationAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| DomainError::store(format!("unknown moderation action {s:?}")))
    }
}

/// Staff position on a board. Ordered: a higher level may do everything a
/// lower one can.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ModerationLevel {
    NotLoggedIn,
    NotStaff,
    Janitor,
    Moderator,
    BoardOwner,
    Admin,
}

impl ModerationLevel {
    pub fn as_i16(self) -> i16 {
        match self {
            Self::NotLoggedIn => -1,
            Self::NotStaff => 0,
            Self::Janitor => 1,
            Self::Moderator => 2,
            Self::BoardOwner => 3,
            Self::Admin => 4,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        Some(match v {
            -1 => Self::NotLoggedIn,
            0 => Self::NotStaff,
            1 => Self::Janitor,
            2 => Self::Moderator,
            3 => Self::BoardOwner,
            4 => Self::Admin,
            _ => return None,
        })
    }
}

/// Staff of one board, keyed by position.
pub type Staff = BTreeMap<ModerationLevel, Vec<String>>;

/// A moderation log entry that has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewModLogEntry {
    pub action: ModerationAction,
    /// Board the action was taken on, or `all` for global entries
    pub board: String,
    pub post_id: Option<PostId>,
    pub by: String,
    /// Duration in seconds, for actions that have one
    pub length: u64,
    pub data: String,
}

impl NewModLogEntry {
    pub fn new(action: ModerationAction, board: impl Into<String>, by: impl Into<String>) -> Self {
        Self {
            action,
            board: board.into(),
            post_id: None,
            by: by.into(),
            length: 0,
            data: String::new(),
        }
    }

    pub fn post(mut self, id: PostId) -> Self {
        self.post_id = Some(id);
        self
    }

    pub fn length(mut self, seconds: u64) -> Self {
        self.length = seconds;
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }
}

/// A persisted, immutable moderation log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModLogEntry {
    pub id: u64,
    #[serde(rename = "type")]
    pub action: ModerationAction,
    pub board: String,
    pub post_id: Option<PostId>,
    pub by: String,
    pub length: u64,
    pub data: String,
    pub created: DateTime<Utc>,
}
