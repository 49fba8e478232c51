//! Row types decoded from query results and their mapping to domain models.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

use domains::{
    Command, DomainError, DomainResult, ImageRef, Link, ModLogEntry, ModeratedPost, OpenPost, Post,
    PostId, PostImage, PurgeTarget, ThreadActivity,
};

pub(crate) fn to_db_id(id: PostId) -> DomainResult<i64> {
    i64::try_from(id).map_err(|_| DomainError::InvalidInput(format!("id {id} out of range")))
}

pub(crate) fn to_db_ids(ids: &[PostId]) -> DomainResult<Vec<i64>> {
    ids.iter().copied().map(to_db_id).collect()
}

/// Ids and lengths are never negative in the schema.
pub(crate) fn from_db(v: i64) -> u64 {
    u64::try_from(v).unwrap_or_default()
}

fn image_ref(sha1: Option<String>, file_type: Option<i16>, thumb_type: Option<i16>) -> Option<ImageRef> {
    Some(ImageRef {
        sha1: sha1?,
        file_type: u8::try_from(file_type?).ok()?,
        thumb_type: u8::try_from(thumb_type?).ok()?,
    })
}

#[derive(FromRow)]
pub(crate) struct ModLogRow {
    id: i64,
    #[sqlx(rename = "type")]
    action: String,
    board: String,
    post_id: Option<i64>,
    by: String,
    length: i64,
    data: String,
    created: DateTime<Utc>,
}

impl TryFrom<ModLogRow> for ModLogEntry {
    type Error = DomainError;

    fn try_from(row: ModLogRow) -> DomainResult<Self> {
        Ok(ModLogEntry {
            id: from_db(row.id),
            action: row.action.parse()?,
            board: row.board,
            post_id: row.post_id.map(from_db),
            by: row.by,
            length: from_db(row.length),
            data: row.data,
            created: row.created,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct ModeratedRow {
    id: i64,
    board: String,
}

impl From<ModeratedRow> for ModeratedPost {
    fn from(row: ModeratedRow) -> Self {
        ModeratedPost {
            id: from_db(row.id),
            board: row.board,
        }
    }
}

/// Sorts rows from an `update ... returning`, which has no defined order.
pub(crate) fn moderated(rows: Vec<ModeratedRow>) -> Vec<ModeratedPost> {
    let mut posts: Vec<ModeratedPost> = rows.into_iter().map(Into::into).collect();
    posts.sort_by_key(|p| p.id);
    posts
}

#[derive(FromRow)]
pub(crate) struct OpenPostRow {
    id: i64,
    board: String,
    body: String,
}

impl From<OpenPostRow> for OpenPost {
    fn from(row: OpenPostRow) -> Self {
        OpenPost {
            id: from_db(row.id),
            board: row.board,
            body: row.body,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct ThreadActivityRow {
    id: i64,
    bump_time: DateTime<Utc>,
    post_count: i64,
    deleted_by_moderation: bool,
}

impl From<ThreadActivityRow> for ThreadActivity {
    fn from(row: ThreadActivityRow) -> Self {
        ThreadActivity {
            id: from_db(row.id),
            bump_time: row.bump_time,
            post_count: from_db(row.post_count),
            deleted_by_moderation: row.deleted_by_moderation,
        }
    }
}

#[derive(FromRow)]
pub(crate) struct ImageRow {
    sha1: String,
    file_type: i16,
    thumb_type: i16,
}

impl TryFrom<ImageRow> for ImageRef {
    type Error = DomainError;

    fn try_from(row: ImageRow) -> DomainResult<Self> {
        let sha1 = row.sha1.clone();
        image_ref(Some(row.sha1), Some(row.file_type), Some(row.thumb_type))
            .ok_or_else(|| DomainError::store(format!("image {sha1} has an invalid file type")))
    }
}

#[derive(FromRow)]
pub(crate) struct PurgeRow {
    board: String,
    sha1: Option<String>,
    file_type: Option<i16>,
    thumb_type: Option<i16>,
}

impl From<PurgeRow> for PurgeTarget {
    fn from(row: PurgeRow) -> Self {
        PurgeTarget {
            board: row.board,
            image: image_ref(row.sha1, row.file_type, row.thumb_type),
        }
    }
}

#[derive(FromRow)]
pub(crate) struct PostRow {
    id: i64,
    op: i64,
    board: String,
    editing: bool,
    deleted: bool,
    body: String,
    created: DateTime<Utc>,
    spoiler: bool,
    ip: Option<String>,
    password: Option<String>,
    links: Json<Vec<Link>>,
    commands: Json<Vec<Command>>,
    sha1: Option<String>,
    file_type: Option<i16>,
    thumb_type: Option<i16>,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        let spoiler = row.spoiler;
        Post {
            id: from_db(row.id),
            op: from_db(row.op),
            board: row.board,
            editing: row.editing,
            deleted: row.deleted,
            body: row.body,
            created: row.created,
            image: image_ref(row.sha1, row.file_type, row.thumb_type)
                .map(|file| PostImage { file, spoiler }),
            ip: row.ip,
            password: row.password,
            links: row.links.0,
            commands: row.commands.0,
        }
    }
}
