//! PostgreSQL store configuration.
//!
//! Table and schema names are interpolated into SQL (sqlx cannot bind
//! identifiers), so they are validated against a strict identifier grammar
//! before any query is built.

use conveyor::ConveyorError;

/// Configuration for [`crate::PgStore`].
#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    /// Schema all tables live in.
    pub schema: String,
    pub outbox_table: String,
    pub inbox_table: String,
    pub timers_table: String,
    pub jobs_table: String,
    pub job_runs_table: String,
    pub joins_table: String,
    pub join_members_table: String,
    pub leases_table: String,
    /// Create schema, tables, and indexes on connect. Idempotent.
    pub enable_schema_deployment: bool,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            schema: "infra".to_string(),
            outbox_table: "outbox".to_string(),
            inbox_table: "inbox".to_string(),
            timers_table: "timers".to_string(),
            jobs_table: "jobs".to_string(),
            job_runs_table: "job_runs".to_string(),
            joins_table: "joins".to_string(),
            join_members_table: "join_members".to_string(),
            leases_table: "leases".to_string(),
            enable_schema_deployment: true,
        }
    }
}

impl PgStoreConfig {
    /// Reject any identifier that could not be safely interpolated.
    pub fn validate(&self) -> Result<(), ConveyorError> {
        for (what, name) in [
            ("schema", &self.schema),
            ("outbox_table", &self.outbox_table),
            ("inbox_table", &self.inbox_table),
            ("timers_table", &self.timers_table),
            ("jobs_table", &self.jobs_table),
            ("job_runs_table", &self.job_runs_table),
            ("joins_table", &self.joins_table),
            ("join_members_table", &self.join_members_table),
            ("leases_table", &self.leases_table),
        ] {
            if !is_identifier(name) {
                return Err(ConveyorError::Validation(format!(
                    "{what} {name:?} is not a valid identifier"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn qualified(&self, table: &str) -> String {
        format!("\"{}\".\"{}\"", self.schema, table)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
