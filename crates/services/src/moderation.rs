//! # Moderation service
//!
//! Admin operations invoked by request handlers. Each destructive action is
//! one transaction: the mutation, then its moderation log entries, then the
//! commit. Errors reach the caller unchanged.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;

use domains::{
    Clock, DomainError, DomainResult, ImageRef, MediaStorage, ModLogEntry, ModerationAction,
    ModerationLevel, NewModLogEntry, Post, PostId, Staff, ADMIN_ACCOUNT, AGGREGATE_BOARD,
};

use crate::executor::{Executor, Transaction};

pub struct ModerationService {
    executor: Executor,
    media: Arc<dyn MediaStorage>,
    clock: Arc<dyn Clock>,
}

impl ModerationService {
    pub fn new(executor: Executor, media: Arc<dyn MediaStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { executor, media, clock }
    }

    /// Clears a post's contents and removes its uploaded file from the server.
    #[tracing::instrument(skip(self, reason))]
    pub async fn purge_post(&self, id: PostId, by: &str, reason: &str) -> DomainResult<()> {
        let mut tx = self.executor.begin().await?;
        let target = tx
            .purge_post(id)
            .await?
            .ok_or_else(|| DomainError::not_found("post", id))?;

        if let Some(image) = &target.image {
            tx.delete_image(&image.sha1).await?;
            self.media
                .delete(&image.sha1, image.file_type, image.thumb_type)
                .await?;
        }
        tx.clear_post_body(id).await?;

        tx.log_moderation(
            NewModLogEntry::new(ModerationAction::PurgePost, target.board, by)
                .post(id)
                .data(reason),
        )
        .await?;
        tx.commit().await
    }

    /// Removes the images of the given posts.
    #[tracing::instrument(skip(self))]
    pub async fn delete_images(&self, ids: &[PostId], by: &str) -> DomainResult<()> {
        let mut tx = self.executor.begin().await?;
        for post in tx.delete_images(ids, by).await? {
            tx.log_moderation(
                NewModLogEntry::new(ModerationAction::DeleteImage, post.board, by).post(post.id),
            )
            .await?;
        }
        tx.commit().await
    }

    /// Spoilers the images of the given posts.
    #[tracing::instrument(skip(self))]
    pub async fn spoiler_images(&self, ids: &[PostId], by: &str) -> DomainResult<()> {
        let mut tx = self.executor.begin().await?;
        for post in tx.spoiler_images(ids, by).await? {
            tx.log_moderation(
                NewModLogEntry::new(ModerationAction::SpoilerImage, post.board, by).post(post.id),
            )
            .await?;
        }
        tx.commit().await
    }

    /// Deletes a board and all of its threads and posts.
    #[tracing::instrument(skip(self))]
    pub async fn delete_board(&self, board: &str, by: &str) -> DomainResult<()> {
        if board == AGGREGATE_BOARD {
            return Err(DomainError::InvalidInput(format!("can not delete /{AGGREGATE_BOARD}/")));
        }
        let mut tx = self.executor.begin().await?;
        let reason = format!("board {board} deleted by user");
        let orphans = delete_board(&mut tx, board, by, reason)
            .await?
            .ok_or_else(|| DomainError::not_found("board", board))?;
        tx.commit().await?;
        remove_files(self.media.as_ref(), &orphans).await;
        Ok(())
    }

    /// Marks posts as deleted.
    #[tracing::instrument(skip(self))]
    pub async fn delete_posts(&self, ids: &[PostId], by: &str) -> DomainResult<()> {
        let mut tx = self.executor.begin().await?;
        for post in tx.delete_posts(ids, by).await? {
            tx.log_moderation(
                NewModLogEntry::new(ModerationAction::DeletePost, post.board, by).post(post.id),
            )
            .await?;
        }
        tx.commit().await
    }

    /// Deletes every post on the target post's board made from the same IP.
    /// A non-zero `keep_deleting` keeps deleting new posts from that IP for
    /// that long.
    #[tracing::instrument(skip(self, reason))]
    pub async fn delete_posts_by_ip(
        &self,
        id: PostId,
        by: &str,
        keep_deleting: Duration,
        reason: &str,
    ) -> DomainResult<()> {
        let seconds = keep_deleting.as_secs();
        let until = if seconds == 0 {
            None
        } else {
            let delta = i64::try_from(seconds)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .ok_or_else(|| DomainError::InvalidInput(format!("deletion window of {seconds}s is too long")))?;
            Some(self.clock.now() + delta)
        };

        let mut tx = self.executor.begin().await?;
        let board = tx
            .get_post_board(id)
            .await?
            .ok_or_else(|| DomainError::not_found("post", id))?;
        let outcome = tx
            .delete_posts_by_ip(id, by, until)
            .await?
            .ok_or_else(|| DomainError::not_found("post", id))?;

        let entry = |post: PostId| {
            NewModLogEntry::new(ModerationAction::DeletePostsByIp, board.clone(), by)
                .post(post)
                .length(seconds)
                .data(reason)
        };
        if outcome.deleted.is_empty() && outcome.window_set {
            // Nothing to delete yet, but the stored window is itself an action.
            tx.log_moderation(entry(id)).await?;
        }
        for post in &outcome.deleted {
            tx.log_moderation(entry(post.id)).await?;
        }
        tx.commit().await
    }

    /// Posts on the same board and from the same IP as the target post.
    pub async fn get_same_ip_posts(&self, id: PostId, by: &str) -> DomainResult<Vec<Post>> {
        let mut tx = self.executor.begin().await?;
        let posts = tx
            .get_same_ip_posts(id, by)
            .await?
            .ok_or_else(|| DomainError::not_found("post", id))?;
        tx.commit().await?;
        Ok(posts)
    }

    /// Sets whether users may reply in a thread.
    #[tracing::instrument(skip(self))]
    pub async fn set_thread_lock(&self, id: PostId, locked: bool, by: &str) -> DomainResult<()> {
        let mut tx = self.executor.begin().await?;
        let board = tx
            .get_post_board(id)
            .await?
            .ok_or_else(|| DomainError::not_found("thread", id))?;
        if !tx.set_thread_lock(id, locked).await? {
            return Err(DomainError::not_found("thread", id));
        }
        tx.log_moderation(
            NewModLogEntry::new(ModerationAction::LockThread, board, by)
                .post(id)
                .data(locked.to_string()),
        )
        .await?;
        tx.commit().await
    }

    /// Pins or unpins a thread. Not a moderation log event.
    pub async fn set_thread_sticky(&self, id: PostId, sticky: bool) -> DomainResult<()> {
        let mut tx = self.executor.begin().await?;
        if !tx.set_thread_sticky(id, sticky).await? {
            return Err(DomainError::not_found("thread", id));
        }
        tx.commit().await
    }

    /// Replaces the staff of a board.
    #[tracing::instrument(skip(self, staff))]
    pub async fn write_staff(&self, board: &str, staff: &Staff, by: &str) -> DomainResult<()> {
        let data = serde_json::to_string(staff).map_err(|e| DomainError::store(e.to_string()))?;
        let mut tx = self.executor.begin().await?;
        tx.replace_staff(board, staff).await?;
        tx.log_moderation(NewModLogEntry::new(ModerationAction::ChangeStaff, board, by).data(data))
            .await?;
        tx.commit().await
    }

    pub async fn get_staff(&self, board: &str) -> DomainResult<Staff> {
        let mut tx = self.executor.begin().await?;
        let staff = tx.get_staff(board).await?;
        tx.commit().await?;
        Ok(staff)
    }

    /// Whether `account` may perform an action of `level` on `board`.
    pub async fn can_perform(&self, account: &str, board: &str, level: ModerationLevel) -> DomainResult<bool> {
        if account == ADMIN_ACCOUNT {
            return Ok(true);
        }
        if level == ModerationLevel::Admin {
            return Ok(false);
        }
        let mut tx = self.executor.begin().await?;
        let position = tx.find_position(board, account).await?;
        tx.commit().await?;
        Ok(position.is_some_and(|p| p >= level))
    }

    /// Moderation log of a board, newest first. `all` holds global entries.
    pub async fn get_mod_log(&self, board: &str) -> DomainResult<Vec<ModLogEntry>> {
        let mut tx = self.executor.begin().await?;
        let log = tx.get_mod_log(board).await?;
        tx.commit().await?;
        Ok(log)
    }

    pub async fn get_mod_log_entry(&self, id: u64) -> DomainResult<ModLogEntry> {
        let mut tx = self.executor.begin().await?;
        let entry = tx
            .get_mod_log_entry(id)
            .await?
            .ok_or_else(|| DomainError::not_found("mod log entry", id))?;
        tx.commit().await?;
        Ok(entry)
    }
}

/// Deletes a board inside `tx` and writes a global log entry. Returns the
/// images only its posts used, already gone from the store, or `None` if the
/// board does not exist.
pub(crate) async fn delete_board(
    tx: &mut Transaction,
    board: &str,
    by: &str,
    reason: String,
) -> DomainResult<Option<Vec<ImageRef>>> {
    let Some(orphans) = tx.delete_board(board).await? else {
        return Ok(None);
    };
    tx.log_moderation(
        NewModLogEntry::new(ModerationAction::DeleteBoard, AGGREGATE_BOARD, by).data(reason),
    )
    .await?;
    tracing::info!(board, by, images = orphans.len(), "Board deleted");
    Ok(Some(orphans))
}

/// Removes the files of images whose rows were already committed away.
/// A failure only leaves a stray file behind, so it is logged and skipped.
pub(crate) async fn remove_files(media: &dyn MediaStorage, images: &[ImageRef]) {
    for image in images {
        if let Err(error) = media.delete(&image.sha1, image.file_type, image.thumb_type).await {
            tracing::warn!(sha1 = %image.sha1, %error, "Failed to remove image files");
        }
    }
}
