//! Shared work-queue SQL over one table descriptor.
//!
//! All four queue tables (outbox, inbox, timers, job runs) carry the same
//! claim/lease columns; this module holds the one implementation of the
//! claim/ack/abandon/fail/reap/revive protocol, parameterized by table name,
//! status vocabulary, and row decoder.
//!
//! Claim atomicity comes from a `FOR UPDATE SKIP LOCKED` CTE feeding the
//! `UPDATE ... RETURNING`: concurrent claimers select disjoint id sets without
//! blocking each other, and the select and mark happen in one statement.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor::{AbandonRequest, FailRequest, OwnerToken, StoreError};
use sqlx::postgres::PgRow;
use sqlx::PgPool;
use uuid::Uuid;

/// Status strings for one table. The inbox names its states differently.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StatusVocab {
    pub ready: &'static str,
    pub in_progress: &'static str,
    pub done: &'static str,
    pub failed: &'static str,
}

pub(crate) const WORK_VOCAB: StatusVocab = StatusVocab {
    ready: "ready",
    in_progress: "in_progress",
    done: "done",
    failed: "failed",
};

pub(crate) const INBOX_VOCAB: StatusVocab = StatusVocab {
    ready: "seen",
    in_progress: "processing",
    done: "done",
    failed: "dead",
};

/// One queue table's shape.
pub(crate) struct QueueTable {
    /// Schema-qualified, quoted table name.
    pub table: String,
    pub vocab: StatusVocab,
    /// Column that breaks ordering ties after `next_attempt_at`.
    pub created_col: &'static str,
    /// `retry_count` for work rows, `attempt` for the inbox.
    pub retry_col: &'static str,
    /// Full projection, in decoder order.
    pub columns: &'static [&'static str],
    /// Extra predicate ANDed into claim eligibility (e.g. the inbox's
    /// `queued` flag). Empty for most tables.
    pub ready_filter: &'static str,
}

impl QueueTable {
    fn projection(&self, prefix: &str) -> String {
        self.columns
            .iter()
            .map(|c| format!("{prefix}{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub(crate) type DecodeFn<R> = fn(&PgRow) -> anyhow::Result<R>;

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.into())
}

fn decode_all<R>(rows: Vec<PgRow>, decode: DecodeFn<R>) -> Result<Vec<R>, StoreError> {
    rows.iter()
        .map(|row| decode(row).map_err(StoreError::Backend))
        .collect()
}

pub(crate) async fn claim<R>(
    pool: &PgPool,
    t: &QueueTable,
    decode: DecodeFn<R>,
    owner: &OwnerToken,
    lease: Duration,
    batch_size: usize,
) -> Result<Vec<R>, StoreError> {
    if batch_size == 0 {
        return Ok(Vec::new());
    }
    let sql = format!(
        r#"
        WITH due AS (
            SELECT id FROM {table}
            WHERE status = '{ready}'{ready_filter}
              AND next_attempt_at <= NOW()
              AND (due_at IS NULL OR due_at <= NOW())
            ORDER BY next_attempt_at ASC, {created} ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE {table} AS t
        SET status = '{in_progress}',
            owner_token = $2,
            locked_until = NOW() + make_interval(secs => $3)
        FROM due
        WHERE t.id = due.id
        RETURNING {projection}
        "#,
        table = t.table,
        ready = t.vocab.ready,
        ready_filter = t.ready_filter,
        created = t.created_col,
        in_progress = t.vocab.in_progress,
        projection = t.projection("t."),
    );

    let rows = sqlx::query(&sql)
        .bind(batch_size as i64)
        .bind(owner.as_str())
        .bind(lease.as_secs_f64())
        .fetch_all(pool)
        .await
        .map_err(backend)?;
    decode_all(rows, decode)
}

pub(crate) async fn ack(
    pool: &PgPool,
    t: &QueueTable,
    owner: &OwnerToken,
    ids: &[Uuid],
) -> Result<u64, StoreError> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        r#"
        UPDATE {table}
        SET status = '{done}',
            processed_at = NOW(),
            processed_by = $1,
            owner_token = NULL,
            locked_until = NULL
        WHERE id = ANY($2) AND owner_token = $1 AND status = '{in_progress}'
        "#,
        table = t.table,
        done = t.vocab.done,
        in_progress = t.vocab.in_progress,
    );
    let result = sqlx::query(&sql)
        .bind(owner.as_str())
        .bind(ids)
        .execute(pool)
        .await
        .map_err(backend)?;
    Ok(result.rows_affected())
}

pub(crate) async fn abandon(
    pool: &PgPool,
    t: &QueueTable,
    owner: &OwnerToken,
    items: &[AbandonRequest],
) -> Result<u64, StoreError> {
    if items.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        r#"
        UPDATE {table}
        SET status = '{ready}',
            owner_token = NULL,
            locked_until = NULL,
            {retry} = {retry} + 1,
            next_attempt_at = NOW() + make_interval(secs => $1),
            last_error = COALESCE($2, last_error)
        WHERE id = $3 AND owner_token = $4 AND status = '{in_progress}'
        "#,
        table = t.table,
        ready = t.vocab.ready,
        retry = t.retry_col,
        in_progress = t.vocab.in_progress,
    );

    let mut tx = pool.begin().await.map_err(backend)?;
    let mut released = 0;
    for item in items {
        released += sqlx::query(&sql)
            .bind(item.delay.as_secs_f64())
            .bind(item.error.as_deref())
            .bind(item.id)
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();
    }
    tx.commit().await.map_err(backend)?;
    Ok(released)
}

pub(crate) async fn fail(
    pool: &PgPool,
    t: &QueueTable,
    owner: &OwnerToken,
    items: &[FailRequest],
) -> Result<u64, StoreError> {
    if items.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        r#"
        UPDATE {table}
        SET status = '{failed}',
            owner_token = NULL,
            locked_until = NULL,
            last_error = $1
        WHERE id = $2 AND owner_token = $3 AND status = '{in_progress}'
        "#,
        table = t.table,
        failed = t.vocab.failed,
        in_progress = t.vocab.in_progress,
    );

    let mut tx = pool.begin().await.map_err(backend)?;
    let mut failed = 0;
    for item in items {
        failed += sqlx::query(&sql)
            .bind(&item.error)
            .bind(item.id)
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();
    }
    tx.commit().await.map_err(backend)?;
    Ok(failed)
}

pub(crate) async fn reap(pool: &PgPool, t: &QueueTable) -> Result<u64, StoreError> {
    let sql = format!(
        r#"
        UPDATE {table}
        SET status = '{ready}',
            owner_token = NULL,
            locked_until = NULL,
            {retry} = {retry} + 1
        WHERE status = '{in_progress}' AND locked_until < NOW()
        "#,
        table = t.table,
        ready = t.vocab.ready,
        retry = t.retry_col,
        in_progress = t.vocab.in_progress,
    );
    let result = sqlx::query(&sql).execute(pool).await.map_err(backend)?;
    Ok(result.rows_affected())
}

pub(crate) async fn revive(
    pool: &PgPool,
    t: &QueueTable,
    ids: &[Uuid],
    delay: Option<Duration>,
) -> Result<u64, StoreError> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        r#"
        UPDATE {table}
        SET status = '{ready}',
            owner_token = NULL,
            locked_until = NULL,
            next_attempt_at = NOW() + make_interval(secs => $1)
        WHERE id = ANY($2) AND status = '{failed}'
        "#,
        table = t.table,
        ready = t.vocab.ready,
        failed = t.vocab.failed,
    );
    let result = sqlx::query(&sql)
        .bind(delay.unwrap_or(Duration::ZERO).as_secs_f64())
        .bind(ids)
        .execute(pool)
        .await
        .map_err(backend)?;
    Ok(result.rows_affected())
}

pub(crate) async fn get<R>(
    pool: &PgPool,
    t: &QueueTable,
    decode: DecodeFn<R>,
    id: Uuid,
) -> Result<Option<R>, StoreError> {
    let sql = format!(
        "SELECT {projection} FROM {table} WHERE id = $1",
        projection = t.projection(""),
        table = t.table,
    );
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(backend)?;
    row.map(|r| decode(&r).map_err(StoreError::Backend)).transpose()
}

pub(crate) async fn purge_done(
    pool: &PgPool,
    t: &QueueTable,
    older_than: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let sql = format!(
        "DELETE FROM {table} WHERE status = '{done}' AND processed_at < $1",
        table = t.table,
        done = t.vocab.done,
    );
    let result = sqlx::query(&sql)
        .bind(older_than)
        .execute(pool)
        .await
        .map_err(backend)?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> QueueTable {
        QueueTable {
            table: "\"infra\".\"outbox\"".to_string(),
            vocab: WORK_VOCAB,
            created_col: "created_at",
            retry_col: "retry_count",
            columns: &["id", "topic", "status"],
            ready_filter: "",
        }
    }

    #[test]
    fn test_projection_prefixes() {
        let t = table();
        assert_eq!(t.projection(""), "id, topic, status");
        assert_eq!(t.projection("t."), "t.id, t.topic, t.status");
    }

    #[test]
    fn test_vocabularies() {
        assert_eq!(WORK_VOCAB.ready, "ready");
        assert_eq!(WORK_VOCAB.failed, "failed");
        assert_eq!(INBOX_VOCAB.ready, "seen");
        assert_eq!(INBOX_VOCAB.failed, "dead");
    }
}
