//! # In-memory store
//!
//! A `Store` held entirely in process memory. Transactions work on a copy
//! of the state and publish it on commit, so a dropped transaction leaves
//! no trace. Transactions are serialized by an owned async mutex, which
//! gives the same guarantees as serializable isolation.
//!
//! Used by tests and single-node development setups.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use domains::{
    Ban, Board, BoardConfigs, Clock, Command, DomainError, DomainResult, ExpiredRows, ImageRef,
    IpDeletion, IpDeletionWindow, Link, ModLogEntry, ModeratedPost, ModerationAction,
    ModerationLevel, NewModLogEntry, OpenPost, Post, PostId, PurgeTarget, SpamScore, Staff, Store,
    StoreTx, SystemClock, Thread, ThreadActivity, ADMIN_ACCOUNT, AGGREGATE_BOARD,
};

/// Full contents of a [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub boards: BTreeMap<String, Board>,
    pub board_configs: BTreeMap<String, BoardConfigs>,
    pub threads: BTreeMap<PostId, Thread>,
    pub posts: BTreeMap<PostId, Post>,
    pub images: BTreeMap<String, ImageRef>,
    pub mod_log: Vec<ModLogEntry>,
    pub staff: BTreeMap<String, Staff>,
    pub bans: Vec<Ban>,
    pub spam_scores: BTreeMap<String, SpamScore>,
    pub ip_deletions: Vec<IpDeletionWindow>,
    pub vacuums: u64,
}

impl MemoryState {
    fn position(&self, board: &str, account: &str) -> Option<ModerationLevel> {
        self.staff.get(board).and_then(|staff| {
            staff
                .iter()
                .filter(|(_, accounts)| accounts.iter().any(|a| a == account))
                .map(|(level, _)| *level)
                .max()
        })
    }

    /// Same rule the Postgres `assert_can_perform` function enforces.
    fn assert_can_perform(&self, account: &str, board: &str, level: ModerationLevel) -> DomainResult<()> {
        if account == ADMIN_ACCOUNT {
            return Ok(());
        }
        let allowed = level < ModerationLevel::Admin
            && self.position(board, account).is_some_and(|p| p >= level);
        if allowed {
            Ok(())
        } else {
            Err(DomainError::NoPermission)
        }
    }

    /// Checks `account` may act at `level` on the boards of all existing
    /// posts in `ids`, which are returned.
    fn authorize_posts(
        &self,
        ids: &[PostId],
        account: &str,
        level: ModerationLevel,
    ) -> DomainResult<Vec<PostId>> {
        let existing: Vec<PostId> = ids.iter().copied().filter(|id| self.posts.contains_key(id)).collect();
        let boards: BTreeSet<&str> = existing.iter().map(|id| self.posts[id].board.as_str()).collect();
        for board in boards {
            self.assert_can_perform(account, board, level)?;
        }
        Ok(existing)
    }

    fn moderated(&self, id: PostId) -> ModeratedPost {
        ModeratedPost {
            id,
            board: self.posts[&id].board.clone(),
        }
    }

    /// Pulls bump times of `threads` back to their newest live post.
    fn recompute_bump_times(&mut self, threads: BTreeSet<PostId>) {
        for op in threads {
            let newest = self
                .posts
                .values()
                .filter(|p| p.op == op && !p.deleted)
                .map(|p| p.created)
                .max();
            if let (Some(thread), Some(newest)) = (self.threads.get_mut(&op), newest) {
                thread.bump_time = thread.bump_time.min(newest);
            }
        }
    }

    fn referenced_images(&self) -> BTreeSet<&str> {
        self.posts
            .values()
            .filter_map(|p| p.image.as_ref().map(|i| i.file.sha1.as_str()))
            .collect()
    }

    fn delete_posts_where(&mut self, pred: impl Fn(&Post) -> bool) -> Vec<ModeratedPost> {
        let ids: Vec<PostId> = self
            .posts
            .values()
            .filter(|p| !p.deleted && pred(p))
            .map(|p| p.id)
            .collect();
        let mut threads = BTreeSet::new();
        for id in &ids {
            if let Some(post) = self.posts.get_mut(id) {
                post.deleted = true;
                threads.insert(post.op);
            }
        }
        self.recompute_bump_times(threads);
        ids.into_iter().map(|id| self.moderated(id)).collect()
    }
}

/// Process-local `Store` implementation.
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    /// `clock` stamps moderation log entries.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
        }
    }

    /// Mutates the committed state directly, bypassing transactions.
    pub async fn seed(&self, f: impl FnOnce(&mut MemoryState)) {
        f(&mut *self.state.lock().await);
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub async fn mod_log(&self) -> Vec<ModLogEntry> {
        self.state.lock().await.mod_log.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> DomainResult<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            clock: Arc::clone(&self.clock),
        }))
    }

    async fn vacuum(&self) -> DomainResult<()> {
        self.state.lock().await.vacuums += 1;
        Ok(())
    }
}

/// Transaction over a [`MemoryStore`]. Holds the store lock until dropped.
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(self: Box<Self>) -> DomainResult<()> {
        let MemoryTx { mut guard, work, .. } = *self;
        *guard = work;
        Ok(())
    }

    async fn log_moderation(&mut self, entry: &NewModLogEntry) -> DomainResult<u64> {
        let id = self.work.mod_log.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        self.work.mod_log.push(ModLogEntry {
            id,
            action: entry.action,
            board: entry.board.clone(),
            post_id: entry.post_id,
            by: entry.by.clone(),
            length: entry.length,
            data: entry.data.clone(),
            created: self.clock.now(),
        });
        Ok(id)
    }

    async fn get_mod_log(&mut self, board: &str) -> DomainResult<Vec<ModLogEntry>> {
        let mut entries: Vec<ModLogEntry> =
            self.work.mod_log.iter().filter(|e| e.board == board).cloned().collect();
        entries.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));
        Ok(entries)
    }

    async fn get_mod_log_entry(&mut self, id: u64) -> DomainResult<Option<ModLogEntry>> {
        Ok(self.work.mod_log.iter().find(|e| e.id == id).cloned())
    }

    async fn get_post_board(&mut self, id: PostId) -> DomainResult<Option<String>> {
        Ok(self.work.posts.get(&id).map(|p| p.board.clone()))
    }

    async fn purge_post(&mut self, id: PostId) -> DomainResult<Option<PurgeTarget>> {
        Ok(self.work.posts.get(&id).map(|p| PurgeTarget {
            board: p.board.clone(),
            image: p.image.as_ref().map(|i| i.file.clone()),
        }))
    }

    async fn clear_post_body(&mut self, id: PostId) -> DomainResult<()> {
        if let Some(post) = self.work.posts.get_mut(&id) {
            post.body.clear();
            post.image = None;
            post.links.clear();
            post.commands.clear();
        }
        Ok(())
    }

    async fn delete_images(&mut self, ids: &[PostId], by: &str) -> DomainResult<Vec<ModeratedPost>> {
        let ids = self.work.authorize_posts(ids, by, ModerationLevel::Janitor)?;
        let mut done = Vec::new();
        for id in ids {
            if let Some(post) = self.work.posts.get_mut(&id) {
                if post.image.take().is_some() {
                    done.push(self.work.moderated(id));
                }
            }
        }
        Ok(done)
    }

    async fn spoiler_images(&mut self, ids: &[PostId], by: &str) -> DomainResult<Vec<ModeratedPost>> {
        let ids = self.work.authorize_posts(ids, by, ModerationLevel::Janitor)?;
        let mut done = Vec::new();
        for id in ids {
            let Some(image) = self.work.posts.get_mut(&id).and_then(|p| p.image.as_mut()) else {
                continue;
            };
            if !image.spoiler {
                image.spoiler = true;
                done.push(self.work.moderated(id));
            }
        }
        Ok(done)
    }

    async fn delete_posts(&mut self, ids: &[PostId], by: &str) -> DomainResult<Vec<ModeratedPost>> {
        let ids: BTreeSet<PostId> = self
            .work
            .authorize_posts(ids, by, ModerationLevel::Janitor)?
            .into_iter()
            .collect();
        Ok(self.work.delete_posts_where(|p| ids.contains(&p.id)))
    }

    async fn delete_posts_by_ip(
        &mut self,
        id: PostId,
        by: &str,
        keep_deleting_until: Option<DateTime<Utc>>,
    ) -> DomainResult<Option<IpDeletion>> {
        let Some(target) = self.work.posts.get(&id) else {
            return Ok(None);
        };
        let (board, ip) = (target.board.clone(), target.ip.clone());
        self.work.assert_can_perform(by, &board, ModerationLevel::Moderator)?;

        let Some(ip) = ip else {
            return Ok(Some(IpDeletion::default()));
        };
        let window_set = keep_deleting_until.is_some();
        if let Some(expires) = keep_deleting_until {
            self.work.ip_deletions.retain(|w| !(w.board == board && w.ip == ip));
            self.work.ip_deletions.push(IpDeletionWindow {
                board: board.clone(),
                ip: ip.clone(),
                by: by.to_string(),
                expires,
            });
        }
        let deleted = self
            .work
            .delete_posts_where(|p| p.board == board && p.ip.as_deref() == Some(ip.as_str()));
        Ok(Some(IpDeletion { deleted, window_set }))
    }

    async fn get_same_ip_posts(&mut self, id: PostId, by: &str) -> DomainResult<Option<Vec<Post>>> {
        let Some(target) = self.work.posts.get(&id) else {
            return Ok(None);
        };
        self.work.assert_can_perform(by, &target.board, ModerationLevel::Moderator)?;
        let Some(ip) = target.ip.as_deref() else {
            return Ok(Some(Vec::new()));
        };
        Ok(Some(
            self.work
                .posts
                .values()
                .filter(|p| p.board == target.board && p.ip.as_deref() == Some(ip))
                .cloned()
                .collect(),
        ))
    }

    async fn open_posts_before(&mut self, cutoff: DateTime<Utc>) -> DomainResult<Vec<OpenPost>> {
        // BTreeMap iteration is already ordered by id.
        Ok(self
            .work
            .posts
            .values()
            .filter(|p| p.editing && p.created < cutoff)
            .map(|p| OpenPost {
                id: p.id,
                board: p.board.clone(),
                body: p.body.clone(),
            })
            .collect())
    }

    async fn close_post(
        &mut self,
        id: PostId,
        body: &str,
        links: &[Link],
        commands: &[Command],
    ) -> DomainResult<bool> {
        let Some(post) = self.work.posts.get_mut(&id).filter(|p| p.editing) else {
            return Ok(false);
        };
        post.editing = false;
        post.body = body.to_string();
        post.links = links.to_vec();
        post.commands = commands.to_vec();
        Ok(true)
    }

    async fn write_open_bodies(&mut self, bodies: &[(PostId, String)]) -> DomainResult<u64> {
        let mut written = 0;
        for (id, body) in bodies {
            if let Some(post) = self.work.posts.get_mut(id).filter(|p| p.editing) {
                post.body = body.clone();
                written += 1;
            }
        }
        Ok(written)
    }

    async fn remove_identity_info(&mut self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let mut cleared = 0;
        for post in self.work.posts.values_mut() {
            if post.created < cutoff && post.ip.is_some() {
                post.ip = None;
                post.password = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn set_thread_lock(&mut self, id: PostId, locked: bool) -> DomainResult<bool> {
        Ok(self.work.threads.get_mut(&id).map(|t| t.locked = locked).is_some())
    }

    async fn set_thread_sticky(&mut self, id: PostId, sticky: bool) -> DomainResult<bool> {
        Ok(self.work.threads.get_mut(&id).map(|t| t.sticky = sticky).is_some())
    }

    async fn thread_activity(&mut self) -> DomainResult<Vec<ThreadActivity>> {
        let moderated: BTreeSet<PostId> = self
            .work
            .mod_log
            .iter()
            .filter(|e| {
                matches!(e.action, ModerationAction::DeletePost | ModerationAction::DeletePostsByIp)
            })
            .filter_map(|e| e.post_id)
            .filter_map(|id| self.work.posts.get(&id).map(|p| p.op))
            .collect();

        Ok(self
            .work
            .threads
            .values()
            .map(|t| ThreadActivity {
                id: t.id,
                bump_time: t.bump_time,
                post_count: self.work.posts.values().filter(|p| p.op == t.id && !p.deleted).count() as u64,
                deleted_by_moderation: moderated.contains(&t.id),
            })
            .collect())
    }

    async fn delete_thread(&mut self, id: PostId) -> DomainResult<()> {
        self.work.threads.remove(&id);
        self.work.posts.retain(|_, p| p.op != id);
        Ok(())
    }

    async fn board_configs(&mut self, board: &str) -> DomainResult<Option<BoardConfigs>> {
        Ok(self.work.board_configs.get(board).cloned())
    }

    async fn inactive_boards(&mut self, cutoff: DateTime<Utc>) -> DomainResult<Vec<String>> {
        Ok(self
            .work
            .boards
            .values()
            .filter(|b| b.id != AGGREGATE_BOARD && b.created < cutoff)
            .filter(|b| {
                let last_bump = self
                    .work
                    .threads
                    .values()
                    .filter(|t| t.board == b.id)
                    .map(|t| t.bump_time)
                    .max()
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                last_bump < cutoff
            })
            .map(|b| b.id.clone())
            .collect())
    }

    async fn delete_board(&mut self, id: &str) -> DomainResult<Option<Vec<ImageRef>>> {
        if self.work.boards.remove(id).is_none() {
            return Ok(None);
        }
        self.work.board_configs.remove(id);
        self.work.staff.remove(id);
        self.work.threads.retain(|_, t| t.board != id);

        let mut candidates = BTreeSet::new();
        self.work.posts.retain(|_, p| {
            if p.board != id {
                return true;
            }
            if let Some(image) = &p.image {
                candidates.insert(image.file.sha1.clone());
            }
            false
        });

        let referenced: BTreeSet<String> =
            self.work.referenced_images().into_iter().map(str::to_string).collect();
        let orphans = candidates
            .difference(&referenced)
            .filter_map(|sha1| self.work.images.remove(sha1))
            .collect();
        Ok(Some(orphans))
    }

    async fn get_staff(&mut self, board: &str) -> DomainResult<Staff> {
        Ok(self.work.staff.get(board).cloned().unwrap_or_default())
    }

    async fn find_position(&mut self, board: &str, account: &str) -> DomainResult<Option<ModerationLevel>> {
        Ok(self.work.position(board, account))
    }

    async fn replace_staff(&mut self, board: &str, staff: &Staff) -> DomainResult<()> {
        self.work.staff.insert(board.to_string(), staff.clone());
        Ok(())
    }

    async fn unreferenced_images(&mut self) -> DomainResult<Vec<ImageRef>> {
        let referenced = self.work.referenced_images();
        Ok(self
            .work
            .images
            .values()
            .filter(|i| !referenced.contains(i.sha1.as_str()))
            .cloned()
            .collect())
    }

    async fn delete_image(&mut self, sha1: &str) -> DomainResult<()> {
        self.work.images.remove(sha1);
        for post in self.work.posts.values_mut() {
            if post.image.as_ref().is_some_and(|i| i.file.sha1 == sha1) {
                post.image = None;
            }
        }
        Ok(())
    }

    async fn add_spam_scores(&mut self, scores: &[(String, i64)], expires: DateTime<Utc>) -> DomainResult<()> {
        for (ip, score) in scores {
            let entry = self.work.spam_scores.entry(ip.clone()).or_insert_with(|| SpamScore {
                ip: ip.clone(),
                score: 0,
                expires,
            });
            entry.score += score;
            entry.expires = expires;
        }
        Ok(())
    }

    async fn clean_up_expiries(&mut self, now: DateTime<Utc>) -> DomainResult<ExpiredRows> {
        let state = &mut self.work;
        let before = (state.bans.len(), state.spam_scores.len(), state.ip_deletions.len());
        state.bans.retain(|b| b.expires >= now);
        state.spam_scores.retain(|_, s| s.expires >= now);
        state.ip_deletions.retain(|w| w.expires >= now);
        Ok(ExpiredRows {
            bans: (before.0 - state.bans.len()) as u64,
            spam_scores: (before.1 - state.spam_scores.len()) as u64,
            ip_deletions: (before.2 - state.ip_deletions.len()) as u64,
        })
    }
}
