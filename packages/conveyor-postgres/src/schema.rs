//! Idempotent schema deployment.
//!
//! Everything is `IF NOT EXISTS`, so deployment can run on every startup
//! from every worker. Indexes cover the claim scan
//! (`status, next_attempt_at`), the inbox dedupe key, and the job-run
//! dedupe key.

use conveyor::StoreError;
use sqlx::PgPool;
use tracing::info;

use crate::config::PgStoreConfig;

pub(crate) async fn deploy(pool: &PgPool, config: &PgStoreConfig) -> Result<(), StoreError> {
    let statements = statements(config);
    for sql in &statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Backend(anyhow::Error::new(e).context(sql.clone())))?;
    }
    info!(schema = %config.schema, "schema deployment complete");
    Ok(())
}

fn statements(config: &PgStoreConfig) -> Vec<String> {
    let outbox = config.qualified(&config.outbox_table);
    let inbox = config.qualified(&config.inbox_table);
    let timers = config.qualified(&config.timers_table);
    let jobs = config.qualified(&config.jobs_table);
    let job_runs = config.qualified(&config.job_runs_table);
    let joins = config.qualified(&config.joins_table);
    let join_members = config.qualified(&config.join_members_table);
    let leases = config.qualified(&config.leases_table);

    vec![
        format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", config.schema),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {outbox} (
                id              UUID PRIMARY KEY,
                topic           TEXT NOT NULL,
                payload         JSONB NOT NULL DEFAULT 'null'::jsonb,
                message_id      TEXT,
                correlation_id  UUID,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                due_at          TIMESTAMPTZ,
                status          TEXT NOT NULL DEFAULT 'ready',
                owner_token     TEXT,
                locked_until    TIMESTAMPTZ,
                retry_count     INT NOT NULL DEFAULT 0,
                next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_error      TEXT,
                processed_at    TIMESTAMPTZ,
                processed_by    TEXT
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {t}_claim_idx ON {outbox} (status, next_attempt_at)",
            t = config.outbox_table
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {inbox} (
                id              UUID PRIMARY KEY,
                source          TEXT NOT NULL,
                message_id      TEXT NOT NULL,
                hash            TEXT NOT NULL DEFAULT '',
                topic           TEXT NOT NULL DEFAULT '',
                payload         JSONB NOT NULL DEFAULT 'null'::jsonb,
                first_seen_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_seen_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                due_at          TIMESTAMPTZ,
                attempt         INT NOT NULL DEFAULT 1,
                status          TEXT NOT NULL DEFAULT 'seen',
                queued          BOOLEAN NOT NULL DEFAULT FALSE,
                owner_token     TEXT,
                locked_until    TIMESTAMPTZ,
                next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_error      TEXT,
                processed_at    TIMESTAMPTZ,
                processed_by    TEXT
            )
            "#
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {t}_dedupe_idx ON {inbox} (source, message_id, hash)",
            t = config.inbox_table
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {t}_claim_idx ON {inbox} (status, next_attempt_at)",
            t = config.inbox_table
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {timers} (
                id              UUID PRIMARY KEY,
                topic           TEXT NOT NULL,
                payload         JSONB NOT NULL DEFAULT 'null'::jsonb,
                correlation_id  UUID,
                due_at          TIMESTAMPTZ NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                status          TEXT NOT NULL DEFAULT 'ready',
                owner_token     TEXT,
                locked_until    TIMESTAMPTZ,
                retry_count     INT NOT NULL DEFAULT 0,
                next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_error      TEXT,
                processed_at    TIMESTAMPTZ,
                processed_by    TEXT
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {t}_claim_idx ON {timers} (status, next_attempt_at)",
            t = config.timers_table
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {jobs} (
                name              TEXT PRIMARY KEY,
                topic             TEXT NOT NULL,
                cron              TEXT NOT NULL,
                payload           JSONB,
                enabled           BOOLEAN NOT NULL DEFAULT TRUE,
                coalesce_runs     BOOLEAN NOT NULL DEFAULT FALSE,
                last_scheduled_at TIMESTAMPTZ,
                created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {job_runs} (
                id              UUID PRIMARY KEY,
                job_name        TEXT NOT NULL,
                topic           TEXT NOT NULL,
                payload         JSONB NOT NULL DEFAULT 'null'::jsonb,
                scheduled_for   TIMESTAMPTZ NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                due_at          TIMESTAMPTZ,
                status          TEXT NOT NULL DEFAULT 'ready',
                owner_token     TEXT,
                locked_until    TIMESTAMPTZ,
                retry_count     INT NOT NULL DEFAULT 0,
                next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_error      TEXT,
                processed_at    TIMESTAMPTZ,
                processed_by    TEXT
            )
            "#
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {t}_fire_idx ON {job_runs} (job_name, scheduled_for)",
            t = config.job_runs_table
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {t}_claim_idx ON {job_runs} (status, next_attempt_at)",
            t = config.job_runs_table
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {joins} (
                join_id      UUID PRIMARY KEY,
                created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ,
                failed_at    TIMESTAMPTZ
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {join_members} (
                join_id    UUID NOT NULL,
                message_id UUID NOT NULL,
                PRIMARY KEY (join_id, message_id)
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {leases} (
                name          TEXT PRIMARY KEY,
                owner         TEXT NOT NULL,
                acquired_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                lease_until   TIMESTAMPTZ NOT NULL,
                fencing_token BIGINT NOT NULL
            )
            "#
        ),
    ]
}
