//! Per-target processing state (`request_target`).

use std::collections::BTreeMap;

use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::criterion::{bind_values, Criterion, TARGET_TABLE};
use crate::error::{BulkError, Result};
use crate::now_millis;
use crate::types::{BulkRequestTarget, TargetPid, TargetState};

const TARGET_COLUMNS: &str = "request_target.id, request_target.rid, request_target.pid, \
     request_target.path, request_target.pnfs_id, request_target.state, \
     request_target.created_at, request_target.started_at, request_target.last_updated, \
     request_target.error_type, request_target.error_message";

/// A target row to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTarget {
    pub rid: i64,
    pub pid: TargetPid,
    pub path: String,
    pub pnfs_id: Option<String>,
    pub state: TargetState,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl NewTarget {
    /// Path found while expanding a directory.
    pub fn discovered(rid: i64, path: impl Into<String>) -> Self {
        Self {
            rid,
            pid: TargetPid::Discovered,
            path: path.into(),
            pnfs_id: None,
            state: TargetState::Created,
            error_type: None,
            error_message: None,
        }
    }

    /// Placeholder carrying the error that aborted the whole request.
    pub fn root_failure(
        rid: i64,
        path: impl Into<String>,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            rid,
            pid: TargetPid::Root,
            path: path.into(),
            pnfs_id: None,
            state: TargetState::Failed,
            error_type: Some(error_type.into()),
            error_message: Some(error_message.into()),
        }
    }
}

#[derive(Clone)]
pub struct TargetStore {
    pool: SqlitePool,
}

impl TargetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert the submitted paths as CREATED initial targets.
    pub async fn insert_initial_targets(
        conn: &mut SqliteConnection,
        rid: i64,
        paths: &[String],
        now: i64,
    ) -> Result<()> {
        for path in paths {
            sqlx::query(
                r#"
                INSERT INTO request_target (rid, pid, path, state, created_at, last_updated)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(rid)
            .bind(TargetPid::Initial.ordinal())
            .bind(path)
            .bind(TargetState::Created.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    pub async fn insert(&self, target: &NewTarget) -> Result<i64> {
        let now = now_millis();
        let started_at = (target.state != TargetState::Created).then_some(now);
        let result = sqlx::query(
            r#"
            INSERT INTO request_target (
                rid, pid, path, pnfs_id, state, created_at, started_at, last_updated,
                error_type, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(target.rid)
        .bind(target.pid.ordinal())
        .bind(&target.path)
        .bind(&target.pnfs_id)
        .bind(target.state.as_str())
        .bind(now)
        .bind(started_at)
        .bind(now)
        .bind(&target.error_type)
        .bind(&target.error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Record a failed target for a request that could not be processed.
    pub async fn abort(&self, target: &NewTarget) -> Result<i64> {
        let id = self.insert(target).await?;
        debug!(rid = target.rid, id, error = ?target.error_message, "Target aborted");
        Ok(id)
    }

    pub async fn get(
        &self,
        criterion: &Criterion,
        limit: Option<i64>,
    ) -> Result<Vec<BulkRequestTarget>> {
        let sql = format!(
            "SELECT {} FROM {} {} {} LIMIT ?",
            TARGET_COLUMNS,
            TARGET_TABLE,
            criterion.where_clause(),
            criterion.order_clause(),
        );
        let rows = bind_values(sqlx::query(&sql), criterion.params())
            .bind(limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_target).collect()
    }

    /// Non-root targets of `rid` with `id >= offset`, ordered by id.
    pub async fn page(&self, rid: i64, offset: i64, limit: i64) -> Result<Vec<BulkRequestTarget>> {
        let criterion = Criterion::targets()
            .rid(rid)
            .not_root_request()
            .offset(offset)
            .ordered_by_id();
        self.get(&criterion, Some(limit)).await
    }

    /// The submitted (INITIAL) targets of `rid`.
    pub async fn initial_targets(&self, rid: i64) -> Result<Vec<BulkRequestTarget>> {
        let criterion = Criterion::targets()
            .rid(rid)
            .pids(&[TargetPid::Initial])
            .ordered_by_id();
        self.get(&criterion, None).await
    }

    pub async fn count(&self, criterion: &Criterion) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} {}",
            TARGET_TABLE,
            criterion.where_clause()
        );
        let count: i64 = bind_values(sqlx::query(&sql), criterion.params())
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(count.max(0) as u64)
    }

    /// Targets of `rid` not yet in a terminal state.
    pub async fn count_unprocessed(&self, rid: i64) -> Result<u64> {
        self.count(
            &Criterion::targets()
                .rid(rid)
                .states(&TargetState::NON_TERMINAL),
        )
        .await
    }

    pub async fn count_failed(&self, rid: i64) -> Result<u64> {
        self.count(&Criterion::targets().rid(rid).states(&[TargetState::Failed]))
            .await
    }

    /// Target counts over all requests, keyed by state.
    pub async fn counts_by_state(&self) -> Result<BTreeMap<TargetState, u64>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM request_target GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let state: String = row.try_get("state")?;
            let state = TargetState::parse(&state)
                .ok_or_else(|| BulkError::storage(format!("unknown target state '{}'", state)))?;
            let n: i64 = row.try_get("n")?;
            counts.insert(state, n.max(0) as u64);
        }
        Ok(counts)
    }

    /// `seq_no`s of requests with a target at `path`.
    pub async fn rids_of(&self, path: &str) -> Result<Vec<i64>> {
        let rows =
            sqlx::query("SELECT DISTINCT rid FROM request_target WHERE path = ? ORDER BY rid")
                .bind(path)
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("rid").map_err(BulkError::from))
            .collect()
    }

    /// Move one target to `state`; `error` is `(type, message)`.
    ///
    /// Returns false if no such target exists.
    pub async fn update_state(
        &self,
        id: i64,
        state: TargetState,
        error: Option<(&str, &str)>,
    ) -> Result<bool> {
        let now = now_millis();
        let (error_type, error_message) = error.unzip();
        let result = sqlx::query(
            r#"
            UPDATE request_target SET
                state = ?,
                last_updated = ?,
                started_at = CASE
                    WHEN ? = 'RUNNING' AND started_at IS NULL THEN ? ELSE started_at
                END,
                error_type = ?,
                error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(now)
        .bind(state.as_str())
        .bind(now)
        .bind(error_type)
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Return targets matching `criterion` to CREATED with no error.
    async fn reset_to_created(&self, criterion: &Criterion) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET state = ?, started_at = NULL, last_updated = ?, \
             error_type = NULL, error_message = NULL {}",
            TARGET_TABLE,
            criterion.mutation_where_clause()?
        );
        let result = bind_values(
            sqlx::query(&sql)
                .bind(TargetState::Created.as_str())
                .bind(now_millis()),
            criterion.params(),
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_where(&self, criterion: &Criterion) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} {}",
            TARGET_TABLE,
            criterion.mutation_where_clause()?
        );
        let result = bind_values(sqlx::query(&sql), criterion.params())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete every target of `rid`.
    pub async fn delete(&self, rid: i64) -> Result<u64> {
        self.delete_where(&Criterion::targets().rid(rid)).await
    }

    /// Drop expansion results and the root placeholder of `rid`, and return
    /// its initial targets to CREATED.
    pub async fn reset(&self, rid: i64) -> Result<()> {
        let removed = self
            .delete_where(
                &Criterion::targets()
                    .rid(rid)
                    .pids(&[TargetPid::Root, TargetPid::Discovered]),
            )
            .await?;
        let reset = self
            .reset_to_created(&Criterion::targets().rid(rid).pids(&[TargetPid::Initial]))
            .await?;
        debug!(rid, removed, reset, "Targets reset");
        Ok(())
    }

    /// Restart recovery: unfinished work is redone from the initial targets.
    pub async fn recover(&self) -> Result<()> {
        let roots = self
            .delete_where(&Criterion::targets().pids(&[TargetPid::Root]))
            .await?;
        let discovered = self
            .delete_where(
                &Criterion::targets()
                    .pids(&[TargetPid::Discovered])
                    .states(&TargetState::NON_TERMINAL),
            )
            .await?;
        let reset = self
            .reset_to_created(
                &Criterion::targets()
                    .pids(&[TargetPid::Initial])
                    .states(&TargetState::NON_TERMINAL),
            )
            .await?;
        info!(roots, discovered, reset, "Target recovery finished");
        Ok(())
    }
}

fn row_to_target(row: &SqliteRow) -> Result<BulkRequestTarget> {
    let pid: i64 = row.try_get("pid")?;
    let pid = TargetPid::from_ordinal(pid)
        .ok_or_else(|| BulkError::storage(format!("unknown target pid {}", pid)))?;
    let state: String = row.try_get("state")?;
    let state = TargetState::parse(&state)
        .ok_or_else(|| BulkError::storage(format!("unknown target state '{}'", state)))?;

    Ok(BulkRequestTarget {
        id: row.try_get("id")?,
        rid: row.try_get("rid")?,
        pid,
        path: row.try_get("path")?,
        pnfs_id: row.try_get("pnfs_id")?,
        state,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        last_updated: row.try_get("last_updated")?,
        error_type: row.try_get("error_type")?,
        error_message: row.try_get("error_message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BulkDb;

    async fn setup() -> (BulkDb, TargetStore, i64) {
        let db = BulkDb::open_in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO bulk_request (uid, owner, activity, arrived_at, last_modified, status)
             VALUES ('4b1f7a0e-0000-4000-8000-000000000001', '1:1', 'PIN', 0, 0, 'QUEUED')",
        )
        .execute(db.pool())
        .await
        .unwrap();
        let rid = result.last_insert_rowid();

        let paths: Vec<String> = ["/a", "/b", "/c"].iter().map(|p| p.to_string()).collect();
        let mut conn = db.pool().acquire().await.unwrap();
        TargetStore::insert_initial_targets(&mut conn, rid, &paths, 1)
            .await
            .unwrap();
        drop(conn);

        let store = TargetStore::new(db.pool().clone());
        (db, store, rid)
    }

    #[tokio::test]
    async fn test_counts() {
        let (_db, store, rid) = setup().await;
        assert_eq!(store.count_unprocessed(rid).await.unwrap(), 3);

        let targets = store.initial_targets(rid).await.unwrap();
        store
            .update_state(targets[0].id, TargetState::Failed, Some(("IOError", "disk")))
            .await
            .unwrap();
        store
            .update_state(targets[1].id, TargetState::Completed, None)
            .await
            .unwrap();

        assert_eq!(store.count_unprocessed(rid).await.unwrap(), 1);
        assert_eq!(store.count_failed(rid).await.unwrap(), 1);

        let by_state = store.counts_by_state().await.unwrap();
        assert_eq!(by_state.get(&TargetState::Created), Some(&1));
        assert_eq!(by_state.get(&TargetState::Completed), Some(&1));
        assert_eq!(by_state.get(&TargetState::Failed), Some(&1));
    }

    #[tokio::test]
    async fn test_update_state_records_start_and_error() {
        let (_db, store, rid) = setup().await;
        let id = store.initial_targets(rid).await.unwrap()[0].id;

        assert!(store.update_state(id, TargetState::Running, None).await.unwrap());
        store
            .update_state(id, TargetState::Failed, Some(("CacheException", "no pool")))
            .await
            .unwrap();

        let target = store.page(rid, 0, 1).await.unwrap().remove(0);
        assert!(target.started_at.is_some());
        assert!(target.is_terminated());
        assert_eq!(target.error_type.as_deref(), Some("CacheException"));
        assert_eq!(target.error_message.as_deref(), Some("no pool"));

        assert!(!store.update_state(9_999, TargetState::Running, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_page_skips_root_and_honours_offset() {
        let (_db, store, rid) = setup().await;
        store
            .abort(&NewTarget::root_failure(rid, "/", "Abort", "boom"))
            .await
            .unwrap();

        let all = store.page(rid, 0, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|t| t.pid == TargetPid::Initial));

        let rest = store.page(rid, all[1].id, 10).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].id, all[1].id);
    }

    #[tokio::test]
    async fn test_rids_of_path() {
        let (_db, store, rid) = setup().await;
        assert_eq!(store.rids_of("/b").await.unwrap(), vec![rid]);
        assert!(store.rids_of("/nowhere").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_and_recover() {
        let (_db, store, rid) = setup().await;
        let initial = store.initial_targets(rid).await.unwrap();
        store
            .update_state(initial[0].id, TargetState::Completed, None)
            .await
            .unwrap();
        store
            .update_state(initial[1].id, TargetState::Running, None)
            .await
            .unwrap();
        store.insert(&NewTarget::discovered(rid, "/c/x")).await.unwrap();
        let done = store.insert(&NewTarget::discovered(rid, "/c/y")).await.unwrap();
        store
            .update_state(done, TargetState::Completed, None)
            .await
            .unwrap();
        store
            .abort(&NewTarget::root_failure(rid, "/", "Abort", "boom"))
            .await
            .unwrap();

        store.recover().await.unwrap();
        let left = store.get(&Criterion::targets().rid(rid), None).await.unwrap();
        // Root and unfinished discovered rows are gone, finished work is kept
        assert_eq!(left.len(), 4);
        assert!(left.iter().all(|t| t.pid != TargetPid::Root));
        assert_eq!(store.count_unprocessed(rid).await.unwrap(), 2);

        store.reset(rid).await.unwrap();
        let left = store.get(&Criterion::targets().rid(rid), None).await.unwrap();
        assert_eq!(left.len(), 3);
        assert!(left.iter().all(|t| t.state == TargetState::Created));
    }

    #[tokio::test]
    async fn test_delete() {
        let (_db, store, rid) = setup().await;
        assert_eq!(store.delete(rid).await.unwrap(), 3);
        assert_eq!(store.count_unprocessed(rid).await.unwrap(), 0);
    }
}
