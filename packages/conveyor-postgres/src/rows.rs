//! Row decoders from `PgRow` into the core models.
//!
//! Queries are built at runtime (table names are configuration), so decoding
//! is by column name rather than compile-checked macros.

use anyhow::anyhow;
use conveyor::{InboxRow, InboxStatus, JobRow, JobRunRow, OutboxRow, TimerRow, WorkStatus};
use sqlx::postgres::PgRow;
use sqlx::Row;

fn work_status(row: &PgRow) -> anyhow::Result<WorkStatus> {
    let status: String = row.try_get("status")?;
    WorkStatus::parse(&status).ok_or_else(|| anyhow!("unrecognized work status {status:?}"))
}

fn inbox_status(row: &PgRow) -> anyhow::Result<InboxStatus> {
    let status: String = row.try_get("status")?;
    InboxStatus::parse(&status).ok_or_else(|| anyhow!("unrecognized inbox status {status:?}"))
}

pub(crate) fn decode_outbox(row: &PgRow) -> anyhow::Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        message_id: row.try_get("message_id")?,
        correlation_id: row.try_get("correlation_id")?,
        created_at: row.try_get("created_at")?,
        due_at: row.try_get("due_at")?,
        status: work_status(row)?,
        owner_token: row.try_get("owner_token")?,
        locked_until: row.try_get("locked_until")?,
        retry_count: row.try_get("retry_count")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        processed_at: row.try_get("processed_at")?,
        processed_by: row.try_get("processed_by")?,
    })
}

pub(crate) fn decode_inbox(row: &PgRow) -> anyhow::Result<InboxRow> {
    Ok(InboxRow {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        message_id: row.try_get("message_id")?,
        hash: row.try_get("hash")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        due_at: row.try_get("due_at")?,
        attempt: row.try_get("attempt")?,
        status: inbox_status(row)?,
        queued: row.try_get("queued")?,
        owner_token: row.try_get("owner_token")?,
        locked_until: row.try_get("locked_until")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        processed_at: row.try_get("processed_at")?,
    })
}

pub(crate) fn decode_timer(row: &PgRow) -> anyhow::Result<TimerRow> {
    Ok(TimerRow {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        correlation_id: row.try_get("correlation_id")?,
        due_at: row.try_get("due_at")?,
        created_at: row.try_get("created_at")?,
        status: work_status(row)?,
        owner_token: row.try_get("owner_token")?,
        locked_until: row.try_get("locked_until")?,
        retry_count: row.try_get("retry_count")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        processed_at: row.try_get("processed_at")?,
        processed_by: row.try_get("processed_by")?,
    })
}

pub(crate) fn decode_job_run(row: &PgRow) -> anyhow::Result<JobRunRow> {
    Ok(JobRunRow {
        id: row.try_get("id")?,
        job_name: row.try_get("job_name")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        scheduled_for: row.try_get("scheduled_for")?,
        created_at: row.try_get("created_at")?,
        status: work_status(row)?,
        owner_token: row.try_get("owner_token")?,
        locked_until: row.try_get("locked_until")?,
        retry_count: row.try_get("retry_count")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
        processed_at: row.try_get("processed_at")?,
        processed_by: row.try_get("processed_by")?,
    })
}

pub(crate) fn decode_job(row: &PgRow) -> anyhow::Result<JobRow> {
    Ok(JobRow {
        name: row.try_get("name")?,
        topic: row.try_get("topic")?,
        cron: row.try_get("cron")?,
        payload: row.try_get("payload")?,
        enabled: row.try_get("enabled")?,
        coalesce: row.try_get("coalesce_runs")?,
        last_scheduled_at: row.try_get("last_scheduled_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
