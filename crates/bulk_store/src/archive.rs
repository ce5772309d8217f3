//! Write-once archive of terminal requests (`request_archive`).

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::criterion::{bind_values, Criterion, ARCHIVE_TABLE};
use crate::error::{BulkError, Result};
use crate::types::{
    ArchivedRequestInfo, ArchivedSummaryFilter, ArchivedSummaryInfo, BulkRequestStatus,
};

#[derive(Clone)]
pub struct ArchiveStore {
    pool: SqlitePool,
}

impl ArchiveStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Serialize and insert `info`. Fails if the UID is already archived.
    pub async fn insert(&self, info: &ArchivedRequestInfo) -> Result<()> {
        let json = serde_json::to_string(info)?;
        sqlx::query(
            r#"
            INSERT INTO request_archive (uid, owner, last_modified, activity, status, info)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&info.uid)
        .bind(&info.owner)
        .bind(info.last_modified)
        .bind(&info.activity)
        .bind(info.status.as_str())
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Full archived snapshots, most recently modified first.
    pub async fn get(
        &self,
        criterion: &Criterion,
        limit: Option<i64>,
    ) -> Result<Vec<ArchivedRequestInfo>> {
        let sql = format!(
            "SELECT info FROM {} {} ORDER BY last_modified DESC LIMIT ?",
            ARCHIVE_TABLE,
            criterion.where_clause()
        );
        let rows = bind_values(sqlx::query(&sql), criterion.params())
            .bind(limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ArchivedRequestInfo> {
                let json: String = row.try_get("info")?;
                Ok(serde_json::from_str(&json)?)
            })
            .collect()
    }

    /// Summary rows, most recently modified first.
    pub async fn list(
        &self,
        criterion: &Criterion,
        limit: Option<i64>,
    ) -> Result<Vec<ArchivedSummaryInfo>> {
        let sql = format!(
            "SELECT uid, owner, last_modified, activity, status FROM {} {} \
             ORDER BY last_modified DESC LIMIT ?",
            ARCHIVE_TABLE,
            criterion.where_clause()
        );
        let rows = bind_values(sqlx::query(&sql), criterion.params())
            .bind(limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_summary).collect()
    }

    pub async fn delete(&self, criterion: &Criterion) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} {}",
            ARCHIVE_TABLE,
            criterion.mutation_where_clause()?
        );
        let result = bind_values(sqlx::query(&sql), criterion.params())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Archive criterion for a listing filter.
pub(crate) fn summary_criterion(filter: &ArchivedSummaryFilter) -> Criterion {
    Criterion::archive()
        .owners(&filter.owners)
        .activities(&filter.activities)
        .statuses(filter.statuses.iter().copied())
        .modified_after(filter.modified_after)
        .modified_before(filter.modified_before)
}

fn row_to_summary(row: &SqliteRow) -> Result<ArchivedSummaryInfo> {
    let status: String = row.try_get("status")?;
    let status = BulkRequestStatus::parse(&status)
        .ok_or_else(|| BulkError::storage(format!("unknown archived status '{}'", status)))?;
    Ok(ArchivedSummaryInfo {
        uid: row.try_get("uid")?,
        owner: row.try_get("owner")?,
        last_modified: row.try_get("last_modified")?,
        activity: row.try_get("activity")?,
        status,
    })
}
