//! Database schema constants.
//!
//! This module contains the SQL schema definitions for the job ledger and
//! script catalog.

/// SQL schema for creating the scripts table.
pub const CREATE_SCRIPTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scripts (
    id BIGSERIAL PRIMARY KEY,
    owner_id BIGINT NOT NULL,
    name VARCHAR(255) NOT NULL,
    language VARCHAR(32) NOT NULL,
    file_path VARCHAR(1024) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the jobs table.
///
/// The check constraint keeps `success_count + failed_count = processed_rows`
/// true after every single-statement increment.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID PRIMARY KEY,
    owner_id BIGINT NOT NULL,
    script_id BIGINT NOT NULL REFERENCES scripts(id),
    script_path VARCHAR(1024) NOT NULL,
    input_path VARCHAR(1024),
    status VARCHAR(16) NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'completed', 'failed', 'aborted')),
    total_items BIGINT NOT NULL DEFAULT 0,
    processed_rows BIGINT NOT NULL DEFAULT 0,
    success_count BIGINT NOT NULL DEFAULT 0,
    failed_count BIGINT NOT NULL DEFAULT 0,
    result_path VARCHAR(1024),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    CHECK (success_count + failed_count = processed_rows)
)
"#;

/// Index on job owner.
pub const CREATE_JOBS_OWNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_owner_id ON jobs(owner_id)";

/// Index on job status.
pub const CREATE_JOBS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)";

/// Index on script owner.
pub const CREATE_SCRIPTS_OWNER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_scripts_owner_id ON scripts(owner_id)";

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_SCRIPTS_TABLE,
        CREATE_JOBS_TABLE,
        CREATE_JOBS_OWNER_INDEX,
        CREATE_JOBS_STATUS_INDEX,
        CREATE_SCRIPTS_OWNER_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const SCRIPTS: &str = "scripts";
    pub const JOBS: &str = "jobs";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 5);
        // jobs references scripts
        assert!(statements[0].contains(tables::SCRIPTS));
        assert!(statements[1].contains("CREATE TABLE IF NOT EXISTS jobs"));
        assert!(statements[2..]
            .iter()
            .all(|s| s.starts_with("CREATE INDEX")));
    }

    #[test]
    fn test_jobs_table_enforces_counter_sum() {
        assert!(CREATE_JOBS_TABLE.contains("success_count + failed_count = processed_rows"));
    }
}
