//! # Domain Models
//!
//! These structs represent the entities the maintenance engine and the
//! moderation tools operate on. Post and thread ids share one sequence, so
//! a thread's id is the id of its opening post.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Id of the aggregate meta-board. It never holds threads of its own and is
/// also the target board of global moderation log entries.
pub const AGGREGATE_BOARD: &str = "all";

/// Post and thread identifier.
pub type PostId = u64;

/// Represents a single board (e.g., /a/, /g/)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    /// The URL slug, unique across the site
    pub id: String,
    pub title: String,
    pub created: DateTime<Utc>,
}

/// Board-level settings the body parser needs when closing a post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfigs {
    pub id: String,
    /// Answers for the `#8ball` command
    pub eightball: Vec<String>,
    /// Enables the `#pyu` counter command
    pub pyu: bool,
}

/// A thread. Its `post_count` is derived from the live posts, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: PostId,
    pub board: String,
    /// The timestamp used for sorting threads by activity and for retention
    pub bump_time: DateTime<Utc>,
    pub sticky: bool,
    pub locked: bool,
}

/// Reference to an uploaded file, enough to remove it from media storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub sha1: String,
    pub file_type: u8,
    pub thumb_type: u8,
}

/// An image attached to a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostImage {
    #[serde(flatten)]
    pub file: ImageRef,
    pub spoiler: bool,
}

/// A link from a post body to another post: (target post, target thread).
pub type Link = (PostId, PostId);

/// A hash command embedded in a post body, e.g. `#flip` or `#8ball`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "val", rename_all = "snake_case")]
pub enum Command {
    Flip(bool),
    Dice(Vec<u16>),
    EightBall(String),
    Pyu(u64),
}

/// The fundamental unit of conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    /// Id of the thread the post belongs to
    pub op: PostId,
    pub board: String,
    /// Open posts still accept body edits from their author
    pub editing: bool,
    /// Set by moderators; deleted posts are kept for the moderation view but
    /// no longer count towards their thread
    pub deleted: bool,
    pub body: String,
    pub created: DateTime<Utc>,
    pub image: Option<PostImage>,
    /// Poster-identifying fields, cleared after a retention period
    pub ip: Option<String>,
    pub password: Option<String>,
    pub links: Vec<Link>,
    pub commands: Vec<Command>,
}

/// Open post that has been idle long enough to be force-closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPost {
    pub id: PostId,
    pub board: String,
    pub body: String,
}

/// Input of the thread retention rule, fetched once per pruning pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadActivity {
    pub id: PostId,
    pub bump_time: DateTime<Utc>,
    pub post_count: u64,
    /// Some post in the thread was deleted by a moderator
    pub deleted_by_moderation: bool,
}

/// Post deleted or altered by a moderation action, with its board for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeratedPost {
    pub id: PostId,
    pub board: String,
}

/// Outcome of deleting posts by IP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpDeletion {
    pub deleted: Vec<ModeratedPost>,
    /// A keep-deleting window was stored. Never set when the target post
    /// has no IP left to match on.
    pub window_set: bool,
}

/// What a purge removed, so the caller can clean up media and log the action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeTarget {
    pub board: String,
    pub image: Option<ImageRef>,
}

/// Restriction against an IP address on a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    pub board: String,
    pub ip: String,
    pub reason: String,
    pub by: String,
    pub expires: DateTime<Utc>,
}

/// Window during which new posts from an IP on a board are deleted on sight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpDeletionWindow {
    pub board: String,
    pub ip: String,
    pub by: String,
    pub expires: DateTime<Utc>,
}

/// Accumulated spam score for a client IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpamScore {
    pub ip: String,
    pub score: i64,
    pub expires: DateTime<Utc>,
}

/// Counts reported by the expired-row sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiredRows {
    pub bans: u64,
    pub spam_scores: u64,
    pub ip_deletions: u64,
}

impl ExpiredRows {
    pub fn total(&self) -> u64 {
        self.bans + self.spam_scores + self.ip_deletions
    }
}
