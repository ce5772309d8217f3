//! Table creation for the bulk store.
//!
//! All CREATE TABLE statements live here. Arguments, permissions and targets
//! reference `bulk_request.seq_no` and go away with their request.

use crate::error::Result;
use crate::BulkDb;
use tracing::info;

impl BulkDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await?;

        self.create_request_tables().await?;
        self.create_target_table().await?;
        self.create_archive_table().await?;

        info!("Bulk schema verified");
        Ok(())
    }

    async fn create_request_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS bulk_request (
                seq_no INTEGER PRIMARY KEY AUTOINCREMENT,
                uid TEXT NOT NULL UNIQUE,
                owner TEXT NOT NULL,
                activity TEXT NOT NULL,
                expand_directories TEXT NOT NULL DEFAULT 'NONE',
                url_prefix TEXT NOT NULL DEFAULT '',
                target_prefix TEXT,
                clear_on_success INTEGER NOT NULL DEFAULT 0,
                clear_on_failure INTEGER NOT NULL DEFAULT 0,
                cancel_on_failure INTEGER NOT NULL DEFAULT 0,
                prestore INTEGER NOT NULL DEFAULT 0,
                delay_clear INTEGER NOT NULL DEFAULT 0,
                arrived_at INTEGER NOT NULL,
                started_at INTEGER,
                last_modified INTEGER NOT NULL,
                completed_at INTEGER,
                status TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // Free-form activity arguments, JSON object
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS request_arguments (
                rid INTEGER PRIMARY KEY REFERENCES bulk_request(seq_no) ON DELETE CASCADE,
                arguments TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        // Subject and restriction as JSON
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS request_permissions (
                rid INTEGER PRIMARY KEY REFERENCES bulk_request(seq_no) ON DELETE CASCADE,
                subject TEXT NOT NULL,
                restriction TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bulk_request_status ON bulk_request(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_bulk_request_owner ON bulk_request(owner)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_bulk_request_modified ON bulk_request(last_modified)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_target_table(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS request_target (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rid INTEGER NOT NULL REFERENCES bulk_request(seq_no) ON DELETE CASCADE,
                pid INTEGER NOT NULL,
                path TEXT NOT NULL,
                pnfs_id TEXT,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                last_updated INTEGER NOT NULL,
                error_type TEXT,
                error_message TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_request_target_rid_state ON request_target(rid, state)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_target_path ON request_target(path)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_archive_table(&self) -> Result<()> {
        // Write-once: a second insert for the same uid fails
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS request_archive (
                uid TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                last_modified INTEGER NOT NULL,
                activity TEXT NOT NULL,
                status TEXT NOT NULL,
                info TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_request_archive_owner ON request_archive(owner)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
