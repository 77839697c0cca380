//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables, fields, and indexes. Safe to run on
/// every start.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema.
///
/// Timestamps are stored as microseconds since the Unix epoch so ordering
/// and the retry/liveness comparisons are plain integer comparisons.
const JOB_SCHEMA: &str = r#"
-- Upload jobs, retained after they finish for auditing
DEFINE TABLE IF NOT EXISTS job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON job TYPE string;
DEFINE FIELD IF NOT EXISTS file_path ON job TYPE string;
DEFINE FIELD IF NOT EXISTS title ON job TYPE string;
DEFINE FIELD IF NOT EXISTS status ON job TYPE string
    ASSERT $value IN ["pending", "processing", "succeeded", "failed", "cancelled"];
DEFINE FIELD IF NOT EXISTS attempts ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS max_attempts ON job TYPE int;
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS updated_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS available_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS claimed_at ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS last_error ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS external_reference ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS cancel_requested ON job TYPE bool DEFAULT false;

-- Indexes for claim polling and listing
DEFINE INDEX IF NOT EXISTS job_id_unique ON job FIELDS job_id UNIQUE;
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_created ON job FIELDS created_at;
DEFINE INDEX IF NOT EXISTS job_status_available ON job FIELDS status, available_at;
"#;
