//! Version-tracked database migrations.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "engine_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS emails (
            message_id TEXT PRIMARY KEY,
            thread_id TEXT,
            subject TEXT NOT NULL DEFAULT '',
            sender_email TEXT NOT NULL,
            sender_name TEXT,
            recipients TEXT NOT NULL DEFAULT '[]',
            date_sent TEXT,
            snippet TEXT NOT NULL DEFAULT '',
            labels TEXT NOT NULL DEFAULT '[]',
            has_attachments INTEGER NOT NULL DEFAULT 0,
            attachment_count INTEGER NOT NULL DEFAULT 0,
            size_bytes INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_emails_sender ON emails(sender_email);
        CREATE INDEX IF NOT EXISTS idx_emails_date_sent ON emails(date_sent);

        CREATE TABLE IF NOT EXISTS email_analysis (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email_id TEXT NOT NULL REFERENCES emails(message_id),
            analysis_version TEXT NOT NULL,
            model TEXT NOT NULL,
            category TEXT NOT NULL,
            action TEXT NOT NULL,
            confidence REAL NOT NULL,
            fraud_score INTEGER CHECK (fraud_score >= 0 AND fraud_score <= 100),
            reasoning TEXT,
            tier INTEGER NOT NULL,
            suggestions TEXT NOT NULL DEFAULT '[]',
            decided_at TEXT NOT NULL,
            UNIQUE (email_id, analysis_version, model)
        );
        CREATE INDEX IF NOT EXISTS idx_analysis_email ON email_analysis(email_id);
        CREATE INDEX IF NOT EXISTS idx_analysis_action ON email_analysis(action);

        CREATE TABLE IF NOT EXISTS tier0_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_type TEXT NOT NULL,
            pattern TEXT NOT NULL,
            action TEXT NOT NULL,
            category TEXT,
            confidence REAL NOT NULL,
            times_matched INTEGER NOT NULL DEFAULT 0,
            times_correct INTEGER NOT NULL DEFAULT 0,
            times_checked INTEGER NOT NULL DEFAULT 0,
            learned_from INTEGER NOT NULL DEFAULT 1,
            created_by_tier INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            last_used TEXT,
            UNIQUE (rule_type, pattern)
        );
        CREATE INDEX IF NOT EXISTS idx_rules_active ON tier0_rules(is_active);

        CREATE TABLE IF NOT EXISTS training_examples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email_id TEXT NOT NULL,
            text TEXT NOT NULL,
            category TEXT NOT NULL,
            action TEXT NOT NULL,
            provenance TEXT NOT NULL,
            example_type TEXT NOT NULL DEFAULT 'positive',
            effectiveness_score REAL NOT NULL DEFAULT 0.5,
            used INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_examples_used ON training_examples(used);
        CREATE INDEX IF NOT EXISTS idx_examples_category ON training_examples(category);

        CREATE TABLE IF NOT EXISTS training_sessions (
            id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            example_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'running',
            model_version TEXT
        );

        CREATE TABLE IF NOT EXISTS model_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            model_type TEXT NOT NULL,
            parent_id INTEGER REFERENCES model_versions(id),
            example_count INTEGER NOT NULL DEFAULT 0,
            validation_accuracy REAL NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_models_active ON model_versions(model_type, is_active);

        CREATE TABLE IF NOT EXISTS human_review_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email_id TEXT NOT NULL,
            suggestions TEXT NOT NULL DEFAULT '[]',
            provenance TEXT NOT NULL DEFAULT 'low_confidence',
            priority INTEGER NOT NULL CHECK (priority >= 1 AND priority <= 10),
            status TEXT NOT NULL DEFAULT 'pending',
            added_at TEXT NOT NULL,
            resolved_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_review_status ON human_review_queue(status);
        CREATE INDEX IF NOT EXISTS idx_review_priority ON human_review_queue(priority, added_at);

        CREATE TABLE IF NOT EXISTS cleanup_operations (
            id TEXT PRIMARY KEY,
            dry_run INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'in_progress',
            emails_affected INTEGER NOT NULL DEFAULT 0,
            emails_deleted INTEGER NOT NULL DEFAULT 0,
            emails_failed INTEGER NOT NULL DEFAULT 0,
            reversal_deadline TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS deleted_emails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id TEXT NOT NULL REFERENCES cleanup_operations(id),
            email_id TEXT NOT NULL,
            deleted_at TEXT NOT NULL,
            restoration_deadline TEXT NOT NULL,
            restored INTEGER NOT NULL DEFAULT 0,
            restored_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_deleted_email ON deleted_emails(email_id);

        CREATE TABLE IF NOT EXISTS system_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        INSERT OR IGNORE INTO system_settings (key, value) VALUES ('system_phase', 'training');
    "#,
}];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            conn.execute(
                "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
                libsql::params![migration.version, migration.name],
            )
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "Failed to record migration V{}: {e}",
                    migration.version
                ))
            })?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row
            .get(0)
            .map_err(|e| DatabaseError::Migration(format!("Failed to parse version: {e}"))),
        None => Ok(0),
    }
}
