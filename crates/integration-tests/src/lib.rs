//! Shared fixtures for the cross-crate tests in `tests/`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

pub use domains::ManualClock;
use domains::{
    Board, BodyParser, DomainError, DomainResult, ImageRef, MaintenanceConfig, MediaStorage,
    ModerationLevel, Post, PostId, PostImage, Thread,
};
use services::{Executor, Janitor, ModerationService};
use storage_adapters::memory::{MemoryState, MemoryStore};

/// Media storage that records deletions, or refuses them all.
#[derive(Default)]
pub struct RecordingMedia {
    deleted: Mutex<Vec<String>>,
    broken: bool,
}

impl RecordingMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self { broken: true, ..Self::default() })
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaStorage for RecordingMedia {
    async fn delete(&self, sha1: &str, _file_type: u8, _thumb_type: u8) -> DomainResult<()> {
        if self.broken {
            return Err(DomainError::store(format!("unlink {sha1}: read-only file system")));
        }
        self.deleted.lock().unwrap().push(sha1.to_string());
        Ok(())
    }
}

/// Fixed "now" of every fixture.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub fn ago(d: Duration) -> DateTime<Utc> {
    t0() - d
}

pub fn board(id: &str, created: DateTime<Utc>) -> Board {
    Board { id: id.into(), title: format!("/{id}/"), created }
}

pub fn thread(id: PostId, board: &str, bump_time: DateTime<Utc>) -> Thread {
    Thread { id, board: board.into(), bump_time, sticky: false, locked: false }
}

pub fn post(id: PostId, op: PostId, board: &str, created: DateTime<Utc>) -> Post {
    Post {
        id,
        op,
        board: board.into(),
        editing: false,
        deleted: false,
        body: format!("post number {id}"),
        created,
        image: None,
        ip: Some(format!("10.0.0.{}", id % 4)),
        password: None,
        links: Vec::new(),
        commands: Vec::new(),
    }
}

pub fn image(sha1: &str) -> ImageRef {
    ImageRef { sha1: sha1.into(), file_type: 0, thumb_type: 0 }
}

pub fn with_image(mut post: Post, sha1: &str) -> Post {
    post.image = Some(PostImage { file: image(sha1), spoiler: false });
    post
}

/// Inserts a board, one thread on it and its posts. The thread is bumped
/// by its newest post.
pub fn seed_thread(state: &mut MemoryState, board_id: &str, posts: Vec<Post>) {
    let op = posts[0].id;
    let bump = posts.iter().map(|p| p.created).max().unwrap();
    state
        .boards
        .entry(board_id.to_string())
        .or_insert_with(|| board(board_id, posts[0].created));
    state.threads.insert(op, thread(op, board_id, bump));
    for p in posts {
        if let Some(img) = &p.image {
            state.images.insert(img.file.sha1.clone(), img.file.clone());
        }
        state.posts.insert(p.id, p);
    }
}

pub fn add_staff(state: &mut MemoryState, board: &str, level: ModerationLevel, account: &str) {
    state
        .staff
        .entry(board.to_string())
        .or_default()
        .entry(level)
        .or_default()
        .push(account.to_string());
}

/// A memory store and a clock set to [`t0`].
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Fixture {
    pub async fn new(seed: impl FnOnce(&mut MemoryState)) -> Self {
        let clock = ManualClock::at(t0());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        store.seed(seed).await;
        Self { store, clock }
    }

    pub fn executor(&self) -> Executor {
        Executor::new(self.store.clone())
    }

    pub fn moderation(&self, media: Arc<dyn MediaStorage>) -> ModerationService {
        ModerationService::new(self.executor(), media, self.clock.clone())
    }

    pub fn janitor(
        &self,
        parser: Arc<dyn BodyParser>,
        media: Arc<dyn MediaStorage>,
        conf: MaintenanceConfig,
    ) -> Janitor {
        Janitor::new(self.executor(), parser, media, Arc::new(Arc::new(conf)), self.clock.clone())
    }

    pub async fn state(&self) -> MemoryState {
        self.store.snapshot().await
    }
}
