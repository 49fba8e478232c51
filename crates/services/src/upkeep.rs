//! # Upkeep tasks
//!
//! The periodic database cleanup jobs the [`Scheduler`](crate::scheduler::Scheduler)
//! runs. Each task is a single pass that returns its first error; the
//! scheduler decides what a failure means.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;

use domains::{
    BodyParser, BoardConfigs, Clock, ConfigProvider, DomainResult, ImagerMode, MediaStorage,
    ParseError, ParsedBody, PostId, SYSTEM_ACTOR,
};

use crate::buffers::{OpenBodyBuffer, SpamScoreBuffer};
use crate::executor::Executor;
use crate::moderation::{delete_board, remove_files};
use crate::retention::RetentionPolicy;
use crate::scheduler::Upkeep;

/// Open posts idle for longer than this are closed by the system.
pub const DANGLING_POST_TIMEOUT: TimeDelta = TimeDelta::seconds(900);

/// How long a flushed spam score keeps counting against its IP.
pub const SPAM_SCORE_TTL: TimeDelta = TimeDelta::hours(1);

/// Collaborators of the upkeep tasks.
pub struct Janitor {
    executor: Executor,
    parser: Arc<dyn BodyParser>,
    media: Arc<dyn MediaStorage>,
    config: Arc<dyn ConfigProvider>,
    clock: Arc<dyn Clock>,
    bodies: Arc<OpenBodyBuffer>,
    spam: Arc<SpamScoreBuffer>,
}

impl Janitor {
    pub fn new(
        executor: Executor,
        parser: Arc<dyn BodyParser>,
        media: Arc<dyn MediaStorage>,
        config: Arc<dyn ConfigProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            parser,
            media,
            config,
            clock,
            bodies: Arc::new(OpenBodyBuffer::new()),
            spam: Arc::new(SpamScoreBuffer::new()),
        }
    }

    /// Shares the body and spam buffers with the code that fills them.
    pub fn with_buffers(mut self, bodies: Arc<OpenBodyBuffer>, spam: Arc<SpamScoreBuffer>) -> Self {
        self.bodies = bodies;
        self.spam = spam;
        self
    }

    pub fn body_buffer(&self) -> &Arc<OpenBodyBuffer> {
        &self.bodies
    }

    pub fn spam_buffer(&self) -> &Arc<SpamScoreBuffer> {
        &self.spam
    }

    async fn write_bodies(&self, bodies: &[(PostId, String)]) -> DomainResult<u64> {
        let mut tx = self.executor.begin().await?;
        let written = tx.write_open_bodies(bodies).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn write_spam_scores(&self, scores: &[(String, i64)]) -> DomainResult<()> {
        let expires = self.clock.now() + SPAM_SCORE_TTL;
        let mut tx = self.executor.begin().await?;
        tx.add_spam_scores(scores, expires).await?;
        tx.commit().await
    }

    /// Re-parses a post body for closing. Bad input still closes the post,
    /// just without links or commands.
    fn parse_for_close(&self, id: PostId, body: &str, conf: &BoardConfigs) -> DomainResult<ParsedBody> {
        match self.parser.parse(body, conf, true) {
            Ok(parsed) => Ok(parsed),
            Err(ParseError::BadInput(reason)) => {
                tracing::debug!(post = id, %reason, "Closing post with unparsable body");
                Ok(ParsedBody::default())
            }
            Err(err @ ParseError::Fatal(_)) => Err(err.into()),
        }
    }

    async fn delete_inactive_board(&self, board: &str) -> DomainResult<()> {
        let mut tx = self.executor.begin().await?;
        let reason = format!("board {board} deleted for inactivity");
        let orphans = delete_board(&mut tx, board, SYSTEM_ACTOR, reason).await?;
        tx.commit().await?;
        if let Some(orphans) = orphans {
            remove_files(self.media.as_ref(), &orphans).await;
        }
        Ok(())
    }

    /// Returns `false` if the post was closed by its author in the meantime.
    async fn close_post(&self, id: PostId, board: &str, body: &str) -> DomainResult<bool> {
        let mut tx = self.executor.begin().await?;
        let conf = tx.board_configs(board).await?.unwrap_or_else(|| BoardConfigs {
            id: board.to_string(),
            ..BoardConfigs::default()
        });
        let parsed = self.parse_for_close(id, body, &conf)?;
        let closed = tx.close_post(id, body, &parsed.links, &parsed.commands).await?;
        tx.commit().await?;
        Ok(closed)
    }
}

#[async_trait]
impl Upkeep for Janitor {
    fn imager_mode(&self) -> ImagerMode {
        self.config.snapshot().imager_mode
    }

    async fn flush_open_post_bodies(&self) -> DomainResult<()> {
        let bodies = self.bodies.drain();
        if bodies.is_empty() {
            return Ok(());
        }
        match self.write_bodies(&bodies).await {
            Ok(written) => {
                tracing::trace!(written, "Flushed open post bodies");
                Ok(())
            }
            Err(e) => {
                self.bodies.restore(bodies);
                Err(e)
            }
        }
    }

    async fn sync_spam_scores(&self) -> DomainResult<()> {
        let scores = self.spam.drain();
        if scores.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.write_spam_scores(&scores).await {
            self.spam.restore(scores);
            return Err(e);
        }
        Ok(())
    }

    async fn close_dangling_posts(&self) -> DomainResult<()> {
        // Close with the newest bodies, not whatever the last flush wrote.
        self.flush_open_post_bodies().await?;

        let cutoff = self.clock.now() - DANGLING_POST_TIMEOUT;
        let posts = {
            let mut tx = self.executor.begin().await?;
            let posts = tx.open_posts_before(cutoff).await?;
            tx.commit().await?;
            posts
        };

        let mut closed = 0;
        for post in &posts {
            if self.close_post(post.id, &post.board, &post.body).await? {
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!(closed, "Closed dangling open posts");
        }
        Ok(())
    }

    async fn clean_up_expiries(&self) -> DomainResult<()> {
        let mut tx = self.executor.begin().await?;
        let expired = tx.clean_up_expiries(self.clock.now()).await?;
        tx.commit().await?;
        if expired.total() > 0 {
            tracing::debug!(
                bans = expired.bans,
                spam_scores = expired.spam_scores,
                ip_deletions = expired.ip_deletions,
                "Removed expired rows"
            );
        }
        Ok(())
    }

    async fn remove_identity_info(&self) -> DomainResult<()> {
        let cutoff = self.clock.now() - self.config.snapshot().identity_retention();
        let mut tx = self.executor.begin().await?;
        let cleared = tx.remove_identity_info(cutoff).await?;
        tx.commit().await?;
        if cleared > 0 {
            tracing::info!(cleared, "Removed poster identity from old posts");
        }
        Ok(())
    }

    async fn delete_old_threads(&self) -> DomainResult<()> {
        let conf = self.config.snapshot();
        if !conf.prune_threads {
            return Ok(());
        }
        let policy = RetentionPolicy::from_config(&conf);
        let now = self.clock.now();

        let mut tx = self.executor.begin().await?;
        let expired: Vec<PostId> = tx
            .thread_activity()
            .await?
            .iter()
            .filter(|t| policy.should_delete(t, now))
            .map(|t| t.id)
            .collect();
        for id in &expired {
            tx.delete_thread(*id).await?;
        }
        tx.commit().await?;

        if !expired.is_empty() {
            tracing::info!(deleted = expired.len(), "Pruned stale threads");
        }
        Ok(())
    }

    async fn delete_unused_boards(&self) -> DomainResult<()> {
        let conf = self.config.snapshot();
        if !conf.prune_boards {
            return Ok(());
        }
        let cutoff = self.clock.now() - conf.board_expiry();
        let boards = {
            let mut tx = self.executor.begin().await?;
            let boards = tx.inactive_boards(cutoff).await?;
            tx.commit().await?;
            boards
        };

        // One board failing does not hold back the rest.
        let mut first_error = None;
        for board in &boards {
            if let Err(error) = self.delete_inactive_board(board).await {
                tracing::warn!(board, %error, "Failed to prune board");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn vacuum(&self) -> DomainResult<()> {
        self.executor.vacuum().await
    }

    async fn delete_unused_images(&self) -> DomainResult<()> {
        let mut tx = self.executor.begin().await?;
        let images = tx.unreferenced_images().await?;
        for image in &images {
            tx.delete_image(&image.sha1).await?;
            self.media
                .delete(&image.sha1, image.file_type, image.thumb_type)
                .await?;
        }
        tx.commit().await?;
        if !images.is_empty() {
            tracing::info!(deleted = images.len(), "Deleted unreferenced images");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{DateTime, Duration, Utc};
    use domains::{
        Board, DomainError, ImageRef, MaintenanceConfig, ManualClock, MockBodyParser,
        MockMediaStorage, ModerationAction, Post, PostImage, Thread, AGGREGATE_BOARD,
    };
    use storage_adapters::memory::MemoryStore;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::days(100)
    }

    fn post(id: u64, op: u64, board: &str, created: DateTime<Utc>) -> Post {
        Post {
            id,
            op,
            board: board.into(),
            editing: false,
            deleted: false,
            body: format!("body {id}"),
            created,
            image: None,
            ip: Some("10.0.0.1".into()),
            password: Some("hunter2".into()),
            links: Vec::new(),
            commands: Vec::new(),
        }
    }

    fn thread(id: u64, board: &str, bump_time: DateTime<Utc>) -> Thread {
        Thread { id, board: board.into(), bump_time, sticky: false, locked: false }
    }

    fn image(sha1: &str) -> ImageRef {
        ImageRef { sha1: sha1.into(), file_type: 0, thumb_type: 0 }
    }

    fn janitor(
        store: &Arc<MemoryStore>,
        parser: MockBodyParser,
        media: MockMediaStorage,
        conf: MaintenanceConfig,
    ) -> Janitor {
        Janitor::new(
            Executor::new(store.clone()),
            Arc::new(parser),
            Arc::new(media),
            Arc::new(Arc::new(conf)),
            ManualClock::at(now()),
        )
    }

    fn quiet_parser() -> MockBodyParser {
        let mut parser = MockBodyParser::new();
        parser.expect_parse().never();
        parser
    }

    fn quiet_media() -> MockMediaStorage {
        let mut media = MockMediaStorage::new();
        media.expect_delete().never();
        media
    }

    async fn store_with_open_posts() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new(ManualClock::at(now())));
        store
            .seed(|s| {
                s.threads.insert(1, thread(1, "a", now() - Duration::seconds(901)));
                for (id, age) in [(1, 901), (2, 899)] {
                    let mut p = post(id, 1, "a", now() - Duration::seconds(age));
                    p.editing = true;
                    s.posts.insert(id, p);
                }
            })
            .await;
        store
    }

    #[tokio::test]
    async fn closes_only_posts_idle_past_the_timeout() {
        let store = store_with_open_posts().await;
        let mut parser = MockBodyParser::new();
        parser
            .expect_parse()
            .withf(|body, conf, closing| body == "body 1" && conf.id == "a" && *closing)
            .times(1)
            .returning(|_, _, _| Ok(ParsedBody { links: vec![(2, 1)], commands: Vec::new() }));

        let janitor = janitor(&store, parser, quiet_media(), MaintenanceConfig::default());
        janitor.close_dangling_posts().await.unwrap();

        let state = store.snapshot().await;
        assert!(!state.posts[&1].editing);
        assert_eq!(state.posts[&1].links, vec![(2, 1)]);
        assert!(state.posts[&2].editing);
    }

    #[tokio::test]
    async fn closing_uses_the_latest_buffered_body() {
        let store = store_with_open_posts().await;
        let mut parser = MockBodyParser::new();
        parser
            .expect_parse()
            .withf(|body, _, _| body == "edited")
            .times(1)
            .returning(|_, _, _| Ok(ParsedBody::default()));

        let janitor = janitor(&store, parser, quiet_media(), MaintenanceConfig::default());
        janitor.body_buffer().set(1, "edited");
        janitor.close_dangling_posts().await.unwrap();

        assert_eq!(store.snapshot().await.posts[&1].body, "edited");
        assert!(janitor.body_buffer().is_empty());
    }

    #[tokio::test]
    async fn unparsable_body_still_closes() {
        let store = store_with_open_posts().await;
        let mut parser = MockBodyParser::new();
        parser
            .expect_parse()
            .returning(|_, _, _| Err(ParseError::BadInput("unbalanced quote".into())));

        let janitor = janitor(&store, parser, quiet_media(), MaintenanceConfig::default());
        janitor.close_dangling_posts().await.unwrap();

        let state = store.snapshot().await;
        assert!(!state.posts[&1].editing);
        assert!(state.posts[&1].links.is_empty());
    }

    #[tokio::test]
    async fn fatal_parser_error_leaves_post_open() {
        let store = store_with_open_posts().await;
        let mut parser = MockBodyParser::new();
        parser
            .expect_parse()
            .returning(|_, _, _| Err(ParseError::Fatal("dictionary missing".into())));

        let janitor = janitor(&store, parser, quiet_media(), MaintenanceConfig::default());
        let err = janitor.close_dangling_posts().await.unwrap_err();

        assert!(matches!(err, DomainError::ParserFailure(_)));
        assert!(store.snapshot().await.posts[&1].editing);
    }

    async fn store_with_threads() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new(ManualClock::at(now())));
        store
            .seed(|s| {
                // Stale with no replies: 15 days beats the 14 day allowance.
                s.threads.insert(1, thread(1, "a", now() - Duration::days(15)));
                s.posts.insert(1, post(1, 1, "a", now() - Duration::days(15)));
                // Recent enough to survive anything.
                s.threads.insert(2, thread(2, "a", now() - Duration::days(3)));
                s.posts.insert(2, post(2, 2, "a", now() - Duration::days(3)));
                // Ten days would be fine, but a moderator deleted a reply.
                s.threads.insert(3, thread(3, "a", now() - Duration::days(10)));
                s.posts.insert(3, post(3, 3, "a", now() - Duration::days(10)));
                let mut reply = post(4, 3, "a", now() - Duration::days(11));
                reply.deleted = true;
                s.posts.insert(4, reply);
                s.mod_log.push(domains::ModLogEntry {
                    id: 1,
                    action: ModerationAction::DeletePost,
                    board: "a".into(),
                    post_id: Some(4),
                    by: "mod".into(),
                    length: 0,
                    data: String::new(),
                    created: now() - Duration::days(10),
                });
            })
            .await;
        store
    }

    #[tokio::test]
    async fn prunes_threads_past_their_allowance() {
        let store = store_with_threads().await;
        let janitor = janitor(&store, quiet_parser(), quiet_media(), MaintenanceConfig::default());
        janitor.delete_old_threads().await.unwrap();

        let state = store.snapshot().await;
        let left: Vec<u64> = state.threads.keys().copied().collect();
        assert_eq!(left, vec![2]);
        // Thread pruning is not a moderation action.
        assert_eq!(state.mod_log.len(), 1);
    }

    #[tokio::test]
    async fn thread_pruning_can_be_disabled() {
        let store = store_with_threads().await;
        let conf = MaintenanceConfig { prune_threads: false, ..MaintenanceConfig::default() };
        let janitor = janitor(&store, quiet_parser(), quiet_media(), conf);
        janitor.delete_old_threads().await.unwrap();

        assert_eq!(store.snapshot().await.threads.len(), 3);
    }

    async fn store_with_boards() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new(ManualClock::at(now())));
        store
            .seed(|s| {
                for (id, age) in [("old", 31), ("busy", 31), ("new", 2)] {
                    s.boards.insert(
                        id.into(),
                        Board { id: id.into(), title: id.into(), created: now() - Duration::days(age) },
                    );
                }
                s.threads.insert(1, thread(1, "old", now() - Duration::days(31)));
                let mut op = post(1, 1, "old", now() - Duration::days(31));
                op.image = Some(PostImage { file: image("dead"), spoiler: false });
                s.posts.insert(1, op);
                s.images.insert("dead".into(), image("dead"));
                s.threads.insert(2, thread(2, "busy", now() - Duration::hours(1)));
                s.posts.insert(2, post(2, 2, "busy", now() - Duration::hours(1)));
            })
            .await;
        store
    }

    #[tokio::test]
    async fn deletes_inactive_boards_with_their_media() {
        let store = store_with_boards().await;
        let mut media = MockMediaStorage::new();
        media
            .expect_delete()
            .withf(|sha1, _, _| sha1 == "dead")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let conf = MaintenanceConfig { board_expiry: 30, ..MaintenanceConfig::default() };

        let janitor = janitor(&store, quiet_parser(), media, conf);
        janitor.delete_unused_boards().await.unwrap();

        let state = store.snapshot().await;
        let boards: Vec<&str> = state.boards.keys().map(String::as_str).collect();
        assert_eq!(boards, vec!["busy", "new"]);
        assert!(state.images.is_empty());

        let entry = &state.mod_log[0];
        assert_eq!(entry.action, ModerationAction::DeleteBoard);
        assert_eq!(entry.board, AGGREGATE_BOARD);
        assert_eq!(entry.by, SYSTEM_ACTOR);
        assert_eq!(entry.data, "board old deleted for inactivity");
    }

    #[tokio::test]
    async fn stubborn_file_does_not_bring_a_pruned_board_back() {
        let store = store_with_boards().await;
        store
            .seed(|s| {
                // Sorts after "old", so it is pruned second.
                s.boards.insert(
                    "stale".into(),
                    Board {
                        id: "stale".into(),
                        title: "stale".into(),
                        created: now() - Duration::days(40),
                    },
                );
                s.threads.insert(3, thread(3, "stale", now() - Duration::days(40)));
                let mut op = post(3, 3, "stale", now() - Duration::days(40));
                op.image = Some(PostImage { file: image("stuck"), spoiler: false });
                s.posts.insert(3, op);
                s.images.insert("stuck".into(), image("stuck"));
            })
            .await;
        let mut media = MockMediaStorage::new();
        media
            .expect_delete()
            .withf(|sha1, _, _| sha1 == "stuck")
            .times(1)
            .returning(|_, _, _| Err(DomainError::store("read-only file system")));
        media
            .expect_delete()
            .withf(|sha1, _, _| sha1 == "dead")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let conf = MaintenanceConfig { board_expiry: 30, ..MaintenanceConfig::default() };

        let janitor = janitor(&store, quiet_parser(), media, conf);
        janitor.delete_unused_boards().await.unwrap();

        let state = store.snapshot().await;
        let boards: Vec<&str> = state.boards.keys().map(String::as_str).collect();
        assert_eq!(boards, vec!["busy", "new"]);
        assert!(!state.posts.contains_key(&1) && !state.posts.contains_key(&3));
        assert!(state.images.is_empty());
        assert_eq!(state.mod_log.len(), 2);
    }

    #[tokio::test]
    async fn flushes_spam_scores_with_expiry() {
        let store = Arc::new(MemoryStore::new(ManualClock::at(now())));
        let janitor = janitor(&store, quiet_parser(), quiet_media(), MaintenanceConfig::default());
        janitor.spam_buffer().add("10.0.0.1", 4);
        janitor.spam_buffer().add("10.0.0.1", 6);

        janitor.sync_spam_scores().await.unwrap();

        let state = store.snapshot().await;
        let score = &state.spam_scores["10.0.0.1"];
        assert_eq!(score.score, 10);
        assert_eq!(score.expires, now() + SPAM_SCORE_TTL);
        assert!(janitor.spam_buffer().is_empty());
    }

    #[tokio::test]
    async fn strips_identity_from_old_posts() {
        let store = Arc::new(MemoryStore::new(ManualClock::at(now())));
        store
            .seed(|s| {
                s.posts.insert(1, post(1, 1, "a", now() - Duration::days(8)));
                s.posts.insert(2, post(2, 1, "a", now() - Duration::days(1)));
            })
            .await;
        let janitor = janitor(&store, quiet_parser(), quiet_media(), MaintenanceConfig::default());
        janitor.remove_identity_info().await.unwrap();

        let state = store.snapshot().await;
        assert_eq!(state.posts[&1].ip, None);
        assert_eq!(state.posts[&1].password, None);
        assert!(state.posts[&2].ip.is_some());
    }

    #[tokio::test]
    async fn removes_unreferenced_images() {
        let store = Arc::new(MemoryStore::new(ManualClock::at(now())));
        store
            .seed(|s| {
                s.images.insert("loose".into(), image("loose"));
            })
            .await;
        let mut media = MockMediaStorage::new();
        media
            .expect_delete()
            .withf(|sha1, _, _| sha1 == "loose")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let janitor = janitor(&store, quiet_parser(), media, MaintenanceConfig::default());
        janitor.delete_unused_images().await.unwrap();

        assert!(store.snapshot().await.images.is_empty());
    }
}
