//! Database migration helpers.
//!
//! Applies the ledger schema one statement at a time and records each
//! applied statement in `_migrations`, so re-running is a no-op. Every step
//! runs in its own transaction under a Postgres advisory lock.

use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::info;

use super::schema;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Key of the advisory lock held while a migration step runs, so several
/// processes running `migrate` at once apply each step exactly once.
const MIGRATION_LOCK_KEY: i64 = 0x726f_7766_6f72_6765;

const CREATE_MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    id SERIAL PRIMARY KEY,
    name VARCHAR(255) NOT NULL UNIQUE,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Applies the ledger schema.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations. Returns how many were applied.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        let mut tx = self.locked().await?;
        sqlx::query(CREATE_MIGRATIONS_TABLE).execute(&mut *tx).await?;
        tx.commit().await?;

        let mut applied = 0;
        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            if self.apply_if_pending(&migration_name(idx), statement).await? {
                applied += 1;
            }
        }

        Ok(applied)
    }

    /// Opens a transaction holding the migration lock until it ends.
    async fn locked(&self) -> Result<Transaction<'static, Postgres>, MigrationError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Applies one statement and records it, unless another run already did.
    async fn apply_if_pending(&self, name: &str, sql: &str) -> Result<bool, MigrationError> {
        let mut tx = self.locked().await?;

        let recorded: Option<(i32,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        if recorded.is_some() {
            return Ok(false);
        }

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(migration = name, "Applied migration");
        Ok(true)
    }
}

fn migration_name(idx: usize) -> String {
    format!("ledger_v1_part_{}", idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed("ledger_v1_part_1: syntax".to_string());
        assert!(err.to_string().contains("ledger_v1_part_1"));
    }

    #[test]
    fn test_migration_names_are_stable() {
        assert_eq!(migration_name(0), "ledger_v1_part_0");
        assert_eq!(migration_name(4), "ledger_v1_part_4");
    }
}
