//! # PostgreSQL store
//!
//! Implements `Store` over a sqlx connection pool. Permission checks run in
//! the database (`assert_can_perform`) and surface as SQLSTATE 42501, which
//! [`map_err`] turns into `DomainError::NoPermission`.

mod rows;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};

use domains::{
    BoardConfigs, Command, DomainError, DomainResult, ExpiredRows, ImageRef, IpDeletion, Link,
    ModLogEntry, ModeratedPost, ModerationAction, ModerationLevel, NewModLogEntry, OpenPost, Post,
    PostId, PurgeTarget, Staff, Store, StoreTx, ThreadActivity, AGGREGATE_BOARD,
};

use rows::{
    from_db, moderated, to_db_id, to_db_ids, ImageRow, ModLogRow, ModeratedRow, OpenPostRow,
    PostRow, PurgeRow, ThreadActivityRow,
};

/// SQLSTATE raised by `assert_can_perform`.
const INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Maps a sqlx error onto the domain taxonomy by its structured error code.
pub fn map_err(err: sqlx::Error) -> DomainError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(INSUFFICIENT_PRIVILEGE) {
            return DomainError::NoPermission;
        }
    }
    DomainError::StoreFailure(err.to_string())
}

/// Mod log actions that mark a thread as holding moderator-deleted posts.
fn deletion_actions() -> Vec<&'static str> {
    vec![
        ModerationAction::DeletePost.as_str(),
        ModerationAction::DeletePostsByIp.as_str(),
    ]
}

const POST_COLUMNS: &str = "p.id, p.op, p.board, p.editing, p.deleted, p.body, p.created, \
    p.spoiler, p.ip, p.password, p.links, p.commands, i.sha1, i.file_type, i.thumb_type";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32, acquire_timeout: Duration) -> DomainResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(map_err)?;
        Ok(Self::new(pool))
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> DomainResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DomainError::store(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> DomainResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.map_err(map_err)?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn vacuum(&self) -> DomainResult<()> {
        // VACUUM refuses to run inside a transaction block, so it goes over
        // the simple query protocol on a pooled connection.
        sqlx::raw_sql("vacuum").execute(&self.pool).await.map_err(map_err)?;
        Ok(())
    }
}

/// sqlx rolls the transaction back when it is dropped uncommitted.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn authorize_posts(&mut self, ids: &[i64], by: &str, level: ModerationLevel) -> DomainResult<()> {
        sqlx::query(
            "select assert_can_perform($2, b.board, $3)
            from (select distinct board from posts where id = any($1)) b",
        )
        .bind(ids)
        .bind(by)
        .bind(level.as_i16())
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn authorize_board(&mut self, board: &str, by: &str, level: ModerationLevel) -> DomainResult<()> {
        sqlx::query("select assert_can_perform($1, $2, $3)")
            .bind(by)
            .bind(board)
            .bind(level.as_i16())
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    /// Pulls bump times of the threads of `post_ids` back to their newest
    /// live post.
    async fn recompute_bump_times(&mut self, post_ids: &[i64]) -> DomainResult<()> {
        sqlx::query(
            "update threads t
            set bump_time = least(t.bump_time, live.newest)
            from (
                select op, max(created) as newest
                from posts
                where not deleted
                    and op in (select op from posts where id = any($1))
                group by op
            ) live
            where t.id = live.op",
        )
        .bind(post_ids)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    /// Board and IP of a post, if it exists.
    async fn post_origin(&mut self, id: PostId) -> DomainResult<Option<(String, Option<String>)>> {
        sqlx::query_as("select board, ip from posts where id = $1")
            .bind(to_db_id(id)?)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_err)
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self: Box<Self>) -> DomainResult<()> {
        self.tx.commit().await.map_err(map_err)
    }

    async fn log_moderation(&mut self, entry: &NewModLogEntry) -> DomainResult<u64> {
        let length = i64::try_from(entry.length)
            .map_err(|_| DomainError::InvalidInput(format!("length {} out of range", entry.length)))?;
        let post_id = entry.post_id.map(to_db_id).transpose()?;
        let id: i64 = sqlx::query_scalar(
            "insert into mod_log (type, board, post_id, by, length, data)
            values ($1, $2, $3, $4, $5, $6)
            returning id",
        )
        .bind(entry.action.as_str())
        .bind(&entry.board)
        .bind(post_id)
        .bind(&entry.by)
        .bind(length)
        .bind(&entry.data)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(from_db(id))
    }

    async fn get_mod_log(&mut self, board: &str) -> DomainResult<Vec<ModLogEntry>> {
        sqlx::query_as::<_, ModLogRow>(
            "select id, type, board, post_id, by, length, data, created
            from mod_log
            where board = $1
            order by created desc, id desc",
        )
        .bind(board)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(ModLogEntry::try_from)
        .collect()
    }

    async fn get_mod_log_entry(&mut self, id: u64) -> DomainResult<Option<ModLogEntry>> {
        let id = i64::try_from(id).map_err(|_| DomainError::not_found("mod log entry", id))?;
        sqlx::query_as::<_, ModLogRow>(
            "select id, type, board, post_id, by, length, data, created
            from mod_log
            where id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?
        .map(ModLogEntry::try_from)
        .transpose()
    }

    async fn get_post_board(&mut self, id: PostId) -> DomainResult<Option<String>> {
        sqlx::query_scalar("select board from posts where id = $1")
            .bind(to_db_id(id)?)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_err)
    }

    async fn purge_post(&mut self, id: PostId) -> DomainResult<Option<PurgeTarget>> {
        let row = sqlx::query_as::<_, PurgeRow>(
            "select p.board, i.sha1, i.file_type, i.thumb_type
            from posts p
            left join images i on i.sha1 = p.sha1
            where p.id = $1",
        )
        .bind(to_db_id(id)?)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(row.map(Into::into))
    }

    async fn clear_post_body(&mut self, id: PostId) -> DomainResult<()> {
        sqlx::query(
            "update posts
            set body = '', sha1 = null, spoiler = false,
                links = '[]'::jsonb, commands = '[]'::jsonb
            where id = $1",
        )
        .bind(to_db_id(id)?)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn delete_images(&mut self, ids: &[PostId], by: &str) -> DomainResult<Vec<ModeratedPost>> {
        let ids = to_db_ids(ids)?;
        self.authorize_posts(&ids, by, ModerationLevel::Janitor).await?;
        let rows = sqlx::query_as::<_, ModeratedRow>(
            "update posts set sha1 = null, spoiler = false
            where id = any($1) and sha1 is not null
            returning id, board",
        )
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(moderated(rows))
    }

    async fn spoiler_images(&mut self, ids: &[PostId], by: &str) -> DomainResult<Vec<ModeratedPost>> {
        let ids = to_db_ids(ids)?;
        self.authorize_posts(&ids, by, ModerationLevel::Janitor).await?;
        let rows = sqlx::query_as::<_, ModeratedRow>(
            "update posts set spoiler = true
            where id = any($1) and sha1 is not null and not spoiler
            returning id, board",
        )
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(moderated(rows))
    }

    async fn delete_posts(&mut self, ids: &[PostId], by: &str) -> DomainResult<Vec<ModeratedPost>> {
        let ids = to_db_ids(ids)?;
        self.authorize_posts(&ids, by, ModerationLevel::Janitor).await?;
        let rows = sqlx::query_as::<_, ModeratedRow>(
            "update posts set deleted = true
            where id = any($1) and not deleted
            returning id, board",
        )
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        self.recompute_bump_times(&ids).await?;
        Ok(moderated(rows))
    }

    async fn delete_posts_by_ip(
        &mut self,
        id: PostId,
        by: &str,
        keep_deleting_until: Option<DateTime<Utc>>,
    ) -> DomainResult<Option<IpDeletion>> {
        let Some((board, ip)) = self.post_origin(id).await? else {
            return Ok(None);
        };
        self.authorize_board(&board, by, ModerationLevel::Moderator).await?;
        let Some(ip) = ip else {
            return Ok(Some(IpDeletion::default()));
        };

        if let Some(expires) = keep_deleting_until {
            sqlx::query(
                "insert into ip_deletions (board, ip, by, expires)
                values ($1, $2, $3, $4)
                on conflict (board, ip) do update
                set by = excluded.by, expires = excluded.expires",
            )
            .bind(&board)
            .bind(&ip)
            .bind(by)
            .bind(expires)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        }

        let rows = sqlx::query_as::<_, ModeratedRow>(
            "update posts set deleted = true
            where board = $1 and ip = $2 and not deleted
            returning id, board",
        )
        .bind(&board)
        .bind(&ip)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        let deleted = moderated(rows);
        let ids = to_db_ids(&deleted.iter().map(|p| p.id).collect::<Vec<_>>())?;
        self.recompute_bump_times(&ids).await?;
        Ok(Some(IpDeletion {
            deleted,
            window_set: keep_deleting_until.is_some(),
        }))
    }

    async fn get_same_ip_posts(&mut self, id: PostId, by: &str) -> DomainResult<Option<Vec<Post>>> {
        let Some((board, ip)) = self.post_origin(id).await? else {
            return Ok(None);
        };
        self.authorize_board(&board, by, ModerationLevel::Moderator).await?;
        let Some(ip) = ip else {
            return Ok(Some(Vec::new()));
        };
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            "select {POST_COLUMNS}
            from posts p
            left join images i on i.sha1 = p.sha1
            where p.board = $1 and p.ip = $2
            order by p.id"
        ))
        .bind(&board)
        .bind(&ip)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(Some(rows.into_iter().map(Into::into).collect()))
    }

    async fn open_posts_before(&mut self, cutoff: DateTime<Utc>) -> DomainResult<Vec<OpenPost>> {
        let rows = sqlx::query_as::<_, OpenPostRow>(
            "select id, board, body
            from posts
            where editing and created < $1
            order by id",
        )
        .bind(cutoff)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn close_post(
        &mut self,
        id: PostId,
        body: &str,
        links: &[Link],
        commands: &[Command],
    ) -> DomainResult<bool> {
        let res = sqlx::query(
            "update posts
            set editing = false, body = $2, links = $3, commands = $4
            where id = $1 and editing",
        )
        .bind(to_db_id(id)?)
        .bind(body)
        .bind(Json(links))
        .bind(Json(commands))
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn write_open_bodies(&mut self, bodies: &[(PostId, String)]) -> DomainResult<u64> {
        let ids = to_db_ids(&bodies.iter().map(|(id, _)| *id).collect::<Vec<_>>())?;
        let texts: Vec<&str> = bodies.iter().map(|(_, body)| body.as_str()).collect();
        let res = sqlx::query(
            "update posts p
            set body = v.body
            from unnest($1::bigint[], $2::text[]) as v(id, body)
            where p.id = v.id and p.editing",
        )
        .bind(&ids)
        .bind(&texts)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(res.rows_affected())
    }

    async fn remove_identity_info(&mut self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let res = sqlx::query(
            "update posts set ip = null, password = null
            where created < $1 and ip is not null",
        )
        .bind(cutoff)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(res.rows_affected())
    }

    async fn set_thread_lock(&mut self, id: PostId, locked: bool) -> DomainResult<bool> {
        let res = sqlx::query("update threads set locked = $2 where id = $1")
            .bind(to_db_id(id)?)
            .bind(locked)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_thread_sticky(&mut self, id: PostId, sticky: bool) -> DomainResult<bool> {
        let res = sqlx::query("update threads set sticky = $2 where id = $1")
            .bind(to_db_id(id)?)
            .bind(sticky)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected() > 0)
    }

    async fn thread_activity(&mut self) -> DomainResult<Vec<ThreadActivity>> {
        let rows = sqlx::query_as::<_, ThreadActivityRow>(
            "select t.id, t.bump_time,
                (select count(*) from posts p where p.op = t.id and not p.deleted) as post_count,
                exists (
                    select 1
                    from mod_log m
                    join posts p on p.id = m.post_id
                    where p.op = t.id and m.type = any($1)
                ) as deleted_by_moderation
            from threads t",
        )
        .bind(deletion_actions())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_thread(&mut self, id: PostId) -> DomainResult<()> {
        sqlx::query("delete from threads where id = $1")
            .bind(to_db_id(id)?)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn board_configs(&mut self, board: &str) -> DomainResult<Option<BoardConfigs>> {
        let conf: Option<Json<BoardConfigs>> = sqlx::query_scalar("select configs from boards where id = $1")
            .bind(board)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(conf.map(|Json(mut conf)| {
            conf.id = board.to_string();
            conf
        }))
    }

    async fn inactive_boards(&mut self, cutoff: DateTime<Utc>) -> DomainResult<Vec<String>> {
        sqlx::query_scalar(
            "select b.id
            from boards b
            where b.created < $1
                and b.id != $2
                and coalesce(
                    (select max(t.bump_time) from threads t where t.board = b.id),
                    'epoch'::timestamptz
                ) < $1
            order by b.id",
        )
        .bind(cutoff)
        .bind(AGGREGATE_BOARD)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)
    }

    async fn delete_board(&mut self, id: &str) -> DomainResult<Option<Vec<ImageRef>>> {
        let candidates: Vec<String> = sqlx::query_scalar(
            "select distinct sha1 from posts where board = $1 and sha1 is not null",
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;

        // Threads and posts go with the board through cascading foreign keys.
        let res = sqlx::query("delete from boards where id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }

        let orphans = sqlx::query_as::<_, ImageRow>(
            "delete from images i
            where i.sha1 = any($1)
                and not exists (select 1 from posts p where p.sha1 = i.sha1)
            returning i.sha1, i.file_type, i.thumb_type",
        )
        .bind(&candidates)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;
        orphans.into_iter().map(ImageRef::try_from).collect::<DomainResult<_>>().map(Some)
    }

    async fn get_staff(&mut self, board: &str) -> DomainResult<Staff> {
        let rows: Vec<(String, i16)> = sqlx::query_as(
            "select account, position from staff where board = $1 order by account",
        )
        .bind(board)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?;

        let mut staff: Staff = BTreeMap::new();
        for (account, position) in rows {
            let level = ModerationLevel::from_i16(position)
                .ok_or_else(|| DomainError::store(format!("invalid staff position {position}")))?;
            staff.entry(level).or_default().push(account);
        }
        Ok(staff)
    }

    async fn find_position(&mut self, board: &str, account: &str) -> DomainResult<Option<ModerationLevel>> {
        let position: Option<i16> = sqlx::query_scalar(
            "select max(position) from staff where board = $1 and account = $2",
        )
        .bind(board)
        .bind(account)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(position.and_then(ModerationLevel::from_i16))
    }

    async fn replace_staff(&mut self, board: &str, staff: &Staff) -> DomainResult<()> {
        sqlx::query("delete from staff where board = $1")
            .bind(board)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        for (level, accounts) in staff {
            for account in accounts {
                sqlx::query("insert into staff (board, account, position) values ($1, $2, $3)")
                    .bind(board)
                    .bind(account)
                    .bind(level.as_i16())
                    .execute(&mut *self.tx)
                    .await
                    .map_err(map_err)?;
            }
        }
        Ok(())
    }

    async fn unreferenced_images(&mut self) -> DomainResult<Vec<ImageRef>> {
        sqlx::query_as::<_, ImageRow>(
            "select i.sha1, i.file_type, i.thumb_type
            from images i
            where not exists (select 1 from posts p where p.sha1 = i.sha1)",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(ImageRef::try_from)
        .collect()
    }

    async fn delete_image(&mut self, sha1: &str) -> DomainResult<()> {
        sqlx::query("delete from images where sha1 = $1")
            .bind(sha1)
            .execute(&mut *self.tx)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn add_spam_scores(&mut self, scores: &[(String, i64)], expires: DateTime<Utc>) -> DomainResult<()> {
        let ips: Vec<&str> = scores.iter().map(|(ip, _)| ip.as_str()).collect();
        let values: Vec<i64> = scores.iter().map(|(_, score)| *score).collect();
        sqlx::query(
            "insert into spam_scores (ip, score, expires)
            select ip, score, $3 from unnest($1::text[], $2::bigint[]) as v(ip, score)
            on conflict (ip) do update
            set score = spam_scores.score + excluded.score, expires = excluded.expires",
        )
        .bind(&ips)
        .bind(&values)
        .bind(expires)
        .execute(&mut *self.tx)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn clean_up_expiries(&mut self, now: DateTime<Utc>) -> DomainResult<ExpiredRows> {
        let mut expired = ExpiredRows::default();
        for (table, count) in [
            ("bans", &mut expired.bans),
            ("spam_scores", &mut expired.spam_scores),
            ("ip_deletions", &mut expired.ip_deletions),
        ] {
            let res = sqlx::query(&format!("delete from {table} where expires < $1"))
                .bind(now)
                .execute(&mut *self.tx)
                .await
                .map_err(map_err)?;
            *count = res.rows_affected();
        }
        Ok(expired)
    }
}
