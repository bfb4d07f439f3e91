//! `PgStore`: every store trait of the substrate against one PostgreSQL
//! database.
//!
//! One `PgStore` is one tenant store. Multi-tenant fleets construct one per
//! database (usually via `DynamicStoreProvider` with a discovery source) and
//! hand them to the pollers.
//!
//! All timestamps that matter for correctness (`created_at`, `locked_until`,
//! `lease_until`, `processed_at`) come from the database server's clock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor::{
    AbandonRequest, AcquireReply, ConveyorError, FailRequest, InboxKey, InboxRow, InboxStatus,
    InboxStore, JobDefinition, JobRow, JobRunRow, JoinOutcome, JoinProgress, JoinStore,
    LeaseGrant, LeaseStore, NewInboxMessage, NewOutboxMessage, NewTimer, Observation, OutboxRow,
    OutboxStore, OwnerToken, RenewReply, StoreError, TimerRow, TimerStore, WorkQueue,
};
use conveyor::JobStore;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::config::PgStoreConfig;
use crate::queue::{self, QueueTable, INBOX_VOCAB, WORK_VOCAB};
use crate::rows;
use crate::schema;

const OUTBOX_COLUMNS: &[&str] = &[
    "id",
    "topic",
    "payload",
    "message_id",
    "correlation_id",
    "created_at",
    "due_at",
    "status",
    "owner_token",
    "locked_until",
    "retry_count",
    "next_attempt_at",
    "last_error",
    "processed_at",
    "processed_by",
];

const INBOX_COLUMNS: &[&str] = &[
    "id",
    "source",
    "message_id",
    "hash",
    "topic",
    "payload",
    "first_seen_at",
    "last_seen_at",
    "due_at",
    "attempt",
    "status",
    "queued",
    "owner_token",
    "locked_until",
    "next_attempt_at",
    "last_error",
    "processed_at",
];

const TIMER_COLUMNS: &[&str] = &[
    "id",
    "topic",
    "payload",
    "correlation_id",
    "due_at",
    "created_at",
    "status",
    "owner_token",
    "locked_until",
    "retry_count",
    "next_attempt_at",
    "last_error",
    "processed_at",
    "processed_by",
];

const JOB_RUN_COLUMNS: &[&str] = &[
    "id",
    "job_name",
    "topic",
    "payload",
    "scheduled_for",
    "created_at",
    "status",
    "owner_token",
    "locked_until",
    "retry_count",
    "next_attempt_at",
    "last_error",
    "processed_at",
    "processed_by",
];

struct Tables {
    outbox: QueueTable,
    inbox: QueueTable,
    timers: QueueTable,
    job_runs: QueueTable,
    jobs: String,
    joins: String,
    join_members: String,
    leases: String,
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.into())
}

/// PostgreSQL-backed implementation of every conveyor store trait.
pub struct PgStore {
    pool: PgPool,
    tables: Tables,
}

impl PgStore {
    /// Wrap an existing pool. Validates identifiers; deploys the schema when
    /// the config asks for it.
    pub async fn new(pool: PgPool, config: PgStoreConfig) -> Result<Self, ConveyorError> {
        config.validate()?;
        if config.enable_schema_deployment {
            schema::deploy(&pool, &config).await?;
        }

        let tables = Tables {
            outbox: QueueTable {
                table: config.qualified(&config.outbox_table),
                vocab: WORK_VOCAB,
                created_col: "created_at",
                retry_col: "retry_count",
                columns: OUTBOX_COLUMNS,
                ready_filter: "",
            },
            inbox: QueueTable {
                table: config.qualified(&config.inbox_table),
                vocab: INBOX_VOCAB,
                created_col: "first_seen_at",
                retry_col: "attempt",
                columns: INBOX_COLUMNS,
                ready_filter: " AND queued",
            },
            timers: QueueTable {
                table: config.qualified(&config.timers_table),
                vocab: WORK_VOCAB,
                created_col: "created_at",
                retry_col: "retry_count",
                columns: TIMER_COLUMNS,
                ready_filter: "",
            },
            job_runs: QueueTable {
                table: config.qualified(&config.job_runs_table),
                vocab: WORK_VOCAB,
                created_col: "created_at",
                retry_col: "retry_count",
                columns: JOB_RUN_COLUMNS,
                ready_filter: "",
            },
            jobs: config.qualified(&config.jobs_table),
            joins: config.qualified(&config.joins_table),
            join_members: config.qualified(&config.join_members_table),
            leases: config.qualified(&config.leases_table),
        };

        Ok(Self { pool, tables })
    }

    /// Connect to `url` and construct the store.
    pub async fn connect(url: &str, config: PgStoreConfig) -> Result<Self, ConveyorError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| ConveyorError::Store(backend(e)))?;
        Self::new(pool, config).await
    }

    /// The underlying pool, for application transactions that enlist the
    /// outbox.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue an outbox message inside the caller's transaction, so the
    /// message commits (or rolls back) atomically with business data.
    pub async fn enqueue_outbox_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: NewOutboxMessage,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(&self.insert_outbox_sql())
            .bind(id)
            .bind(&message.topic)
            .bind(&message.payload)
            .bind(message.message_id.as_deref())
            .bind(message.correlation_id)
            .bind(message.due_at)
            .execute(&mut **tx)
            .await
            .map_err(backend)?;
        Ok(id)
    }

    fn insert_outbox_sql(&self) -> String {
        format!(
            r#"
            INSERT INTO {outbox}
                (id, topic, payload, message_id, correlation_id, created_at, due_at,
                 status, retry_count, next_attempt_at)
            VALUES ($1, $2, $3, COALESCE($4, $1::text), $5, NOW(), $6, 'ready', 0, NOW())
            "#,
            outbox = self.tables.outbox.table,
        )
    }
}

// =============================================================================
// Work queues
// =============================================================================

macro_rules! pg_work_queue {
    ($row:ty, $table:ident, $decode:path) => {
        #[async_trait]
        impl WorkQueue<$row> for PgStore {
            async fn claim(
                &self,
                owner: &OwnerToken,
                lease: Duration,
                batch_size: usize,
            ) -> Result<Vec<$row>, StoreError> {
                queue::claim(&self.pool, &self.tables.$table, $decode, owner, lease, batch_size)
                    .await
            }

            async fn ack(&self, owner: &OwnerToken, ids: &[Uuid]) -> Result<u64, StoreError> {
                queue::ack(&self.pool, &self.tables.$table, owner, ids).await
            }

            async fn abandon(
                &self,
                owner: &OwnerToken,
                items: &[AbandonRequest],
            ) -> Result<u64, StoreError> {
                queue::abandon(&self.pool, &self.tables.$table, owner, items).await
            }

            async fn fail(
                &self,
                owner: &OwnerToken,
                items: &[FailRequest],
            ) -> Result<u64, StoreError> {
                queue::fail(&self.pool, &self.tables.$table, owner, items).await
            }

            async fn reap(&self) -> Result<u64, StoreError> {
                queue::reap(&self.pool, &self.tables.$table).await
            }

            async fn revive(
                &self,
                ids: &[Uuid],
                delay: Option<Duration>,
            ) -> Result<u64, StoreError> {
                queue::revive(&self.pool, &self.tables.$table, ids, delay).await
            }

            async fn get(&self, id: Uuid) -> Result<Option<$row>, StoreError> {
                queue::get(&self.pool, &self.tables.$table, $decode, id).await
            }

            async fn purge_done(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
                queue::purge_done(&self.pool, &self.tables.$table, older_than).await
            }
        }
    };
}

pg_work_queue!(OutboxRow, outbox, rows::decode_outbox);
pg_work_queue!(InboxRow, inbox, rows::decode_inbox);
pg_work_queue!(TimerRow, timers, rows::decode_timer);
pg_work_queue!(JobRunRow, job_runs, rows::decode_job_run);

// =============================================================================
// OutboxStore
// =============================================================================

#[async_trait]
impl OutboxStore for PgStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(&self.insert_outbox_sql())
            .bind(id)
            .bind(&message.topic)
            .bind(&message.payload)
            .bind(message.message_id.as_deref())
            .bind(message.correlation_id)
            .bind(message.due_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(id)
    }
}

// =============================================================================
// InboxStore
// =============================================================================

fn observation(row: &sqlx::postgres::PgRow) -> Result<Observation, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(Observation {
        id: row.try_get("id").map_err(backend)?,
        first_seen: row.try_get("first_seen").map_err(backend)?,
        status: InboxStatus::parse(&status).ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!("unrecognized inbox status {status:?}"))
        })?,
        attempt: row.try_get("attempt").map_err(backend)?,
    })
}

#[async_trait]
impl InboxStore for PgStore {
    async fn observe(&self, key: &InboxKey) -> Result<Observation, StoreError> {
        // `xmax = 0` distinguishes the winning insert from conflict updates.
        let sql = format!(
            r#"
            INSERT INTO {inbox} AS i
                (id, source, message_id, hash, first_seen_at, last_seen_at,
                 attempt, status, queued, next_attempt_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW(), 1, 'seen', FALSE, NOW())
            ON CONFLICT (source, message_id, hash)
            DO UPDATE SET last_seen_at = NOW(), attempt = i.attempt + 1
            RETURNING id, status, attempt, (xmax = 0) AS first_seen
            "#,
            inbox = self.tables.inbox.table,
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&key.source)
            .bind(&key.message_id)
            .bind(&key.hash)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        observation(&row)
    }

    async fn enqueue(&self, message: NewInboxMessage) -> Result<Observation, StoreError> {
        // An edge-observed row upgrades to queued; an already-queued row
        // keeps its payload and only bumps observation counters.
        let sql = format!(
            r#"
            INSERT INTO {inbox} AS i
                (id, source, message_id, hash, topic, payload, due_at,
                 first_seen_at, last_seen_at, attempt, status, queued, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW(), 1, 'seen', TRUE, NOW())
            ON CONFLICT (source, message_id, hash)
            DO UPDATE SET
                last_seen_at = NOW(),
                attempt = i.attempt + 1,
                topic = CASE WHEN i.queued THEN i.topic ELSE EXCLUDED.topic END,
                payload = CASE WHEN i.queued THEN i.payload ELSE EXCLUDED.payload END,
                due_at = CASE WHEN i.queued THEN i.due_at ELSE EXCLUDED.due_at END,
                queued = TRUE
            RETURNING id, status, attempt, (xmax = 0) AS first_seen
            "#,
            inbox = self.tables.inbox.table,
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&message.key.source)
            .bind(&message.key.message_id)
            .bind(&message.key.hash)
            .bind(&message.topic)
            .bind(&message.payload)
            .bind(message.due_at)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        observation(&row)
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {inbox} SET status = 'processing', attempt = attempt + 1 \
             WHERE id = $1 AND status = 'seen'",
            inbox = self.tables.inbox.table,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {inbox} SET status = 'done', processed_at = NOW(), \
             owner_token = NULL, locked_until = NULL \
             WHERE id = $1 AND status IN ('seen', 'processing')",
            inbox = self.tables.inbox.table,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_dead(&self, id: Uuid) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {inbox} SET status = 'dead', owner_token = NULL, locked_until = NULL \
             WHERE id = $1 AND status IN ('seen', 'processing')",
            inbox = self.tables.inbox.table,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// TimerStore
// =============================================================================

#[async_trait]
impl TimerStore for PgStore {
    async fn schedule(&self, timer: NewTimer) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        // next_attempt_at mirrors the due time so claim order follows it.
        let sql = format!(
            r#"
            INSERT INTO {timers}
                (id, topic, payload, correlation_id, due_at, created_at,
                 status, retry_count, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), 'ready', 0, $5)
            "#,
            timers = self.tables.timers.table,
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(&timer.topic)
            .bind(&timer.payload)
            .bind(timer.correlation_id)
            .bind(timer.due_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(id)
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let sql = format!(
            "DELETE FROM {timers} WHERE id = $1 AND status = 'ready'",
            timers = self.tables.timers.table,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_fire(
        &self,
        owner: &OwnerToken,
        id: Uuid,
        message: NewOutboxMessage,
    ) -> Result<bool, StoreError> {
        let ack_sql = format!(
            r#"
            UPDATE {timers}
            SET status = 'done', processed_at = NOW(), processed_by = $2,
                owner_token = NULL, locked_until = NULL
            WHERE id = $1 AND owner_token = $2 AND status = 'in_progress'
            "#,
            timers = self.tables.timers.table,
        );

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let acked = sqlx::query(&ack_sql)
            .bind(id)
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();
        if acked == 0 {
            tx.rollback().await.map_err(backend)?;
            return Ok(false);
        }
        self.enqueue_outbox_in(&mut tx, message).await?;
        tx.commit().await.map_err(backend)?;
        Ok(true)
    }
}

// =============================================================================
// JobStore
// =============================================================================

#[async_trait]
impl JobStore for PgStore {
    async fn upsert_job(&self, job: JobDefinition) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {jobs}
                (name, topic, cron, payload, enabled, coalesce_runs,
                 last_scheduled_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, $5, NULL, NOW(), NOW())
            ON CONFLICT (name) DO UPDATE SET
                topic = EXCLUDED.topic,
                cron = EXCLUDED.cron,
                payload = EXCLUDED.payload,
                coalesce_runs = EXCLUDED.coalesce_runs,
                updated_at = NOW()
            "#,
            jobs = self.tables.jobs,
        );
        sqlx::query(&sql)
            .bind(&job.name)
            .bind(&job.topic)
            .bind(&job.cron)
            .bind(&job.payload)
            .bind(job.coalesce)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {jobs} WHERE name = $1", jobs = self.tables.jobs);
        let result = sqlx::query(&sql)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {jobs} SET enabled = $2, updated_at = NOW() WHERE name = $1",
            jobs = self.tables.jobs,
        );
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn jobs(&self) -> Result<Vec<JobRow>, StoreError> {
        let sql = format!(
            "SELECT name, topic, cron, payload, enabled, coalesce_runs, \
             last_scheduled_at, created_at, updated_at FROM {jobs} ORDER BY name",
            jobs = self.tables.jobs,
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| rows::decode_job(row).map_err(StoreError::Backend))
            .collect()
    }

    async fn record_runs(
        &self,
        name: &str,
        observed_last: Option<DateTime<Utc>>,
        fires: &[DateTime<Utc>],
    ) -> Result<u64, StoreError> {
        let Some(newest) = fires.last().copied() else {
            return Ok(0);
        };

        let mut tx = self.pool.begin().await.map_err(backend)?;

        // Serialize tickers per job and re-check the schedule cursor.
        let lock_sql = format!(
            "SELECT topic, payload, last_scheduled_at FROM {jobs} WHERE name = $1 FOR UPDATE",
            jobs = self.tables.jobs,
        );
        let Some(job) = sqlx::query(&lock_sql)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?
        else {
            tx.rollback().await.map_err(backend)?;
            return Ok(0);
        };
        let current_last: Option<DateTime<Utc>> =
            job.try_get("last_scheduled_at").map_err(backend)?;
        if current_last != observed_last {
            // Another ticker advanced this job first.
            tx.rollback().await.map_err(backend)?;
            return Ok(0);
        }
        let topic: String = job.try_get("topic").map_err(backend)?;
        let payload: Option<serde_json::Value> = job.try_get("payload").map_err(backend)?;
        let payload = payload.unwrap_or(serde_json::Value::Null);

        let insert_sql = format!(
            r#"
            INSERT INTO {job_runs}
                (id, job_name, topic, payload, scheduled_for, created_at,
                 status, retry_count, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), 'ready', 0, NOW())
            ON CONFLICT (job_name, scheduled_for) DO NOTHING
            "#,
            job_runs = self.tables.job_runs.table,
        );
        let mut recorded = 0;
        for fire in fires {
            recorded += sqlx::query(&insert_sql)
                .bind(Uuid::new_v4())
                .bind(name)
                .bind(&topic)
                .bind(&payload)
                .bind(fire)
                .execute(&mut *tx)
                .await
                .map_err(backend)?
                .rows_affected();
        }

        let advance_sql = format!(
            "UPDATE {jobs} SET last_scheduled_at = $2, updated_at = NOW() WHERE name = $1",
            jobs = self.tables.jobs,
        );
        sqlx::query(&advance_sql)
            .bind(name)
            .bind(newest)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(recorded)
    }

    async fn trigger(&self, name: &str, scheduled_for: DateTime<Utc>) -> Result<Uuid, StoreError> {
        let job_sql = format!(
            "SELECT topic, payload FROM {jobs} WHERE name = $1",
            jobs = self.tables.jobs,
        );
        let Some(job) = sqlx::query(&job_sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
        else {
            return Err(StoreError::Backend(anyhow::anyhow!("unknown job: {name}")));
        };
        let topic: String = job.try_get("topic").map_err(backend)?;
        let payload: Option<serde_json::Value> = job.try_get("payload").map_err(backend)?;

        // The no-op update makes the conflict path still RETURN the
        // existing run's id.
        let sql = format!(
            r#"
            INSERT INTO {job_runs}
                (id, job_name, topic, payload, scheduled_for, created_at,
                 status, retry_count, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, NOW(), 'ready', 0, NOW())
            ON CONFLICT (job_name, scheduled_for) DO UPDATE SET job_name = EXCLUDED.job_name
            RETURNING id
            "#,
            job_runs = self.tables.job_runs.table,
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(&topic)
            .bind(payload.unwrap_or(serde_json::Value::Null))
            .bind(scheduled_for)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        row.try_get("id").map_err(backend)
    }

    async fn complete_run(
        &self,
        owner: &OwnerToken,
        id: Uuid,
        message: NewOutboxMessage,
    ) -> Result<bool, StoreError> {
        let ack_sql = format!(
            r#"
            UPDATE {job_runs}
            SET status = 'done', processed_at = NOW(), processed_by = $2,
                owner_token = NULL, locked_until = NULL
            WHERE id = $1 AND owner_token = $2 AND status = 'in_progress'
            "#,
            job_runs = self.tables.job_runs.table,
        );

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let acked = sqlx::query(&ack_sql)
            .bind(id)
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();
        if acked == 0 {
            tx.rollback().await.map_err(backend)?;
            return Ok(false);
        }
        self.enqueue_outbox_in(&mut tx, message).await?;
        tx.commit().await.map_err(backend)?;
        Ok(true)
    }
}

// =============================================================================
// LeaseStore
// =============================================================================

#[async_trait]
impl LeaseStore for PgStore {
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<AcquireReply, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {leases} AS l (name, owner, acquired_at, lease_until, fencing_token)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3), 1)
            ON CONFLICT (name) DO UPDATE SET
                owner = EXCLUDED.owner,
                acquired_at = NOW(),
                lease_until = NOW() + make_interval(secs => $3),
                fencing_token = l.fencing_token + 1
            WHERE l.lease_until < NOW()
            RETURNING lease_until, fencing_token, NOW() AS server_now
            "#,
            leases = self.tables.leases,
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .bind(owner)
            .bind(ttl.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => Ok(AcquireReply::Acquired(LeaseGrant {
                lease_until: row.try_get("lease_until").map_err(backend)?,
                fencing_token: row.try_get("fencing_token").map_err(backend)?,
                server_now: row.try_get("server_now").map_err(backend)?,
            })),
            None => Ok(AcquireReply::Held {
                server_now: self.server_now().await?,
            }),
        }
    }

    async fn renew(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<RenewReply, StoreError> {
        let sql = format!(
            r#"
            UPDATE {leases}
            SET lease_until = NOW() + make_interval(secs => $3)
            WHERE name = $1 AND owner = $2 AND lease_until >= NOW()
            RETURNING lease_until, NOW() AS server_now
            "#,
            leases = self.tables.leases,
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .bind(owner)
            .bind(ttl.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => Ok(RenewReply::Renewed {
                lease_until: row.try_get("lease_until").map_err(backend)?,
                server_now: row.try_get("server_now").map_err(backend)?,
            }),
            None => Ok(RenewReply::Lost {
                server_now: self.server_now().await?,
            }),
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<bool, StoreError> {
        // Expire rather than delete so fencing tokens stay monotonic across
        // release/re-acquire.
        let sql = format!(
            r#"
            UPDATE {leases}
            SET lease_until = NOW() - INTERVAL '1 millisecond'
            WHERE name = $1 AND owner = $2 AND lease_until >= NOW()
            "#,
            leases = self.tables.leases,
        );
        let result = sqlx::query(&sql)
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}

impl PgStore {
    async fn server_now(&self) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query("SELECT NOW() AS server_now")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        row.try_get("server_now").map_err(backend)
    }
}

// =============================================================================
// JoinStore
// =============================================================================

#[async_trait]
impl JoinStore for PgStore {
    async fn create_join(&self, join_id: Uuid) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {joins} (join_id, created_at) VALUES ($1, NOW()) \
             ON CONFLICT (join_id) DO NOTHING",
            joins = self.tables.joins,
        );
        sqlx::query(&sql)
            .bind(join_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn enqueue_member(
        &self,
        join_id: Uuid,
        message: NewOutboxMessage,
    ) -> Result<Uuid, StoreError> {
        let join_sql = format!(
            "INSERT INTO {joins} (join_id, created_at) VALUES ($1, NOW()) \
             ON CONFLICT (join_id) DO NOTHING",
            joins = self.tables.joins,
        );
        let member_sql = format!(
            "INSERT INTO {members} (join_id, message_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
            members = self.tables.join_members,
        );

        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query(&join_sql)
            .bind(join_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        let message_id = self.enqueue_outbox_in(&mut tx, message).await?;
        sqlx::query(&member_sql)
            .bind(join_id)
            .bind(message_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(message_id)
    }

    async fn progress(&self, join_id: Uuid) -> Result<Option<JoinProgress>, StoreError> {
        let exists_sql = format!(
            "SELECT 1 FROM {joins} WHERE join_id = $1",
            joins = self.tables.joins,
        );
        if sqlx::query(&exists_sql)
            .bind(join_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .is_none()
        {
            return Ok(None);
        }

        // A purged member row was Done when retention removed it.
        let sql = format!(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE o.status = 'done' OR o.id IS NULL) AS done,
                COUNT(*) FILTER (WHERE o.status = 'failed') AS failed
            FROM {members} m
            LEFT JOIN {outbox} o ON o.id = m.message_id
            WHERE m.join_id = $1
            "#,
            members = self.tables.join_members,
            outbox = self.tables.outbox.table,
        );
        let row = sqlx::query(&sql)
            .bind(join_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let total: i64 = row.try_get("total").map_err(backend)?;
        let done: i64 = row.try_get("done").map_err(backend)?;
        let failed: i64 = row.try_get("failed").map_err(backend)?;
        Ok(Some(JoinProgress {
            total: total as u64,
            done: done as u64,
            failed: failed as u64,
        }))
    }

    async fn settle(
        &self,
        join_id: Uuid,
        outcome: JoinOutcome,
        owner: &OwnerToken,
        wait_row: Uuid,
        message: Option<NewOutboxMessage>,
    ) -> Result<bool, StoreError> {
        let settle_sql = format!(
            r#"
            UPDATE {joins}
            SET completed_at = CASE WHEN $2 THEN NOW() ELSE completed_at END,
                failed_at    = CASE WHEN $2 THEN failed_at ELSE NOW() END
            WHERE join_id = $1 AND completed_at IS NULL AND failed_at IS NULL
            "#,
            joins = self.tables.joins,
        );
        let ack_sql = format!(
            r#"
            UPDATE {outbox}
            SET status = 'done', processed_at = NOW(), processed_by = $2,
                owner_token = NULL, locked_until = NULL
            WHERE id = $1 AND owner_token = $2 AND status = 'in_progress'
            "#,
            outbox = self.tables.outbox.table,
        );

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let settled = sqlx::query(&settle_sql)
            .bind(join_id)
            .bind(outcome == JoinOutcome::Completed)
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected()
            > 0;
        if settled {
            if let Some(message) = message {
                self.enqueue_outbox_in(&mut tx, message).await?;
            }
        }
        sqlx::query(&ack_sql)
            .bind(wait_row)
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(settled)
    }
}
