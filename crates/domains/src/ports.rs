//! # Ports
//!
//! Contracts the services depend on. Storage adapters implement [`Store`]
//! and [`StoreTx`]; the body parser and media storage are external
//! collaborators provided by the host application.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::MaintenanceConfig;
use crate::errors::{DomainResult, ParseError};
use crate::models::{
    BoardConfigs, Command, ExpiredRows, ImageRef, IpDeletion, Link, ModeratedPost, OpenPost, Post,
    PostId, PurgeTarget, ThreadActivity,
};
use crate::moderation::{ModLogEntry, ModerationLevel, NewModLogEntry, Staff};

/// Connection to the persistent store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a transaction.
    async fn begin(&self) -> DomainResult<Box<dyn StoreTx>>;

    /// Asks the storage engine to reclaim space. Runs outside any transaction.
    async fn vacuum(&self) -> DomainResult<()>;
}

/// An open transaction.
///
/// Nothing written through it is visible to other transactions until
/// [`StoreTx::commit`]. Dropping the handle without committing rolls the
/// transaction back; implementations must guarantee this.
///
/// Operations taking a `by` account check its permissions inside the store
/// and fail with `DomainError::NoPermission` when it lacks them.
#[async_trait]
pub trait StoreTx: Send {
    async fn commit(self: Box<Self>) -> DomainResult<()>;

    // Moderation log
    async fn log_moderation(&mut self, entry: &NewModLogEntry) -> DomainResult<u64>;
    async fn get_mod_log(&mut self, board: &str) -> DomainResult<Vec<ModLogEntry>>;
    async fn get_mod_log_entry(&mut self, id: u64) -> DomainResult<Option<ModLogEntry>>;

    // Posts
    async fn get_post_board(&mut self, id: PostId) -> DomainResult<Option<String>>;
    /// Locates a post for purging; `None` if it does not exist.
    async fn purge_post(&mut self, id: PostId) -> DomainResult<Option<PurgeTarget>>;
    /// Clears a post's body and detaches its image.
    async fn clear_post_body(&mut self, id: PostId) -> DomainResult<()>;
    async fn delete_images(&mut self, ids: &[PostId], by: &str) -> DomainResult<Vec<ModeratedPost>>;
    async fn spoiler_images(&mut self, ids: &[PostId], by: &str) -> DomainResult<Vec<ModeratedPost>>;
    async fn delete_posts(&mut self, ids: &[PostId], by: &str) -> DomainResult<Vec<ModeratedPost>>;
    /// Deletes every post on the target post's board sharing its IP.
    /// `keep_deleting_until` also deletes later posts from that IP until then.
    /// A post whose identity info was already removed matches nothing and
    /// stores no window. `None` if the target post does not exist.
    async fn delete_posts_by_ip(
        &mut self,
        id: PostId,
        by: &str,
        keep_deleting_until: Option<DateTime<Utc>>,
    ) -> DomainResult<Option<IpDeletion>>;
    async fn get_same_ip_posts(&mut self, id: PostId, by: &str) -> DomainResult<Option<Vec<Post>>>;
    async fn open_posts_before(&mut self, cutoff: DateTime<Utc>) -> DomainResult<Vec<OpenPost>>;
    /// Closes a post that is still open for editing. Returns `false`, and
    /// writes nothing, if it was already closed or no longer exists.
    async fn close_post(
        &mut self,
        id: PostId,
        body: &str,
        links: &[Link],
        commands: &[Command],
    ) -> DomainResult<bool>;
    /// Persists bodies of posts still open for editing. Returns rows written.
    async fn write_open_bodies(&mut self, bodies: &[(PostId, String)]) -> DomainResult<u64>;
    /// Clears IP and password of posts created before `cutoff`.
    async fn remove_identity_info(&mut self, cutoff: DateTime<Utc>) -> DomainResult<u64>;

    // Threads
    /// Returns `false` if the thread does not exist.
    async fn set_thread_lock(&mut self, id: PostId, locked: bool) -> DomainResult<bool>;
    /// Returns `false` if the thread does not exist.
    async fn set_thread_sticky(&mut self, id: PostId, sticky: bool) -> DomainResult<bool>;
    async fn thread_activity(&mut self) -> DomainResult<Vec<ThreadActivity>>;
    async fn delete_thread(&mut self, id: PostId) -> DomainResult<()>;

    // Boards
    async fn board_configs(&mut self, board: &str) -> DomainResult<Option<BoardConfigs>>;
    /// Boards created before `cutoff` with no thread bumped since.
    async fn inactive_boards(&mut self, cutoff: DateTime<Utc>) -> DomainResult<Vec<String>>;
    /// Deletes a board with its threads and posts. Returns the images no
    /// longer referenced by any post, already removed from the store, or
    /// `None` if the board does not exist.
    async fn delete_board(&mut self, id: &str) -> DomainResult<Option<Vec<ImageRef>>>;

    // Staff
    async fn get_staff(&mut self, board: &str) -> DomainResult<Staff>;
    async fn find_position(&mut self, board: &str, account: &str) -> DomainResult<Option<ModerationLevel>>;
    /// Replaces all staff positions of a board.
    async fn replace_staff(&mut self, board: &str, staff: &Staff) -> DomainResult<()>;

    // Images
    async fn unreferenced_images(&mut self) -> DomainResult<Vec<ImageRef>>;
    async fn delete_image(&mut self, sha1: &str) -> DomainResult<()>;

    // Expiring rows
    async fn add_spam_scores(&mut self, scores: &[(String, i64)], expires: DateTime<Utc>) -> DomainResult<()>;
    async fn clean_up_expiries(&mut self, now: DateTime<Utc>) -> DomainResult<ExpiredRows>;
}

/// Parsed artifacts of a post body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBody {
    pub links: Vec<Link>,
    pub commands: Vec<Command>,
}

/// External post body parser.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait BodyParser: Send + Sync {
    fn parse(&self, body: &str, conf: &BoardConfigs, is_closing: bool) -> Result<ParsedBody, ParseError>;
}

/// Removes uploaded files and their thumbnails.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MediaStorage: Send + Sync {
    async fn delete(&self, sha1: &str, file_type: u8, thumb_type: u8) -> DomainResult<()>;
}

/// Read-only view of the current maintenance settings.
pub trait ConfigProvider: Send + Sync {
    fn snapshot(&self) -> Arc<MaintenanceConfig>;
}

/// Settings fixed at startup.
impl ConfigProvider for Arc<MaintenanceConfig> {
    fn snapshot(&self) -> Arc<MaintenanceConfig> {
        Arc::clone(self)
    }
}

/// Wall clock source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug)]
pub struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

#[cfg(any(test, feature = "testing"))]
impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(std::sync::Mutex::new(now)))
    }

    pub fn advance(&self, by: chrono::TimeDelta) {
        let mut now = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += by;
    }
}

#[cfg(any(test, feature = "testing"))]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let start = DateTime::<Utc>::UNIX_EPOCH;
        let clock = ManualClock::at(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::TimeDelta::minutes(15));
        assert_eq!(clock.now(), start + chrono::TimeDelta::minutes(15));
    }
}
