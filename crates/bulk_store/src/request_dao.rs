//! Repository for `bulk_request` rows and their optional arguments.
//!
//! Every status write goes through [`status_assignments`], which keeps
//! `last_modified`, `started_at` and `completed_at` consistent with the new
//! status.

use std::collections::HashMap;

use bulk_ids::RequestUid;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::criterion::{
    bind_values, placeholders, Criterion, DbValue, ARGUMENTS_TABLE, REQUEST_TABLE, TARGET_TABLE,
};
use crate::error::{BulkError, Result};
use crate::types::{BulkRequest, BulkRequestStatus, BulkRequestStatusInfo, Depth, TargetState};

const REQUEST_COLUMNS: &str = "bulk_request.seq_no, bulk_request.uid, bulk_request.owner, \
     bulk_request.activity, bulk_request.expand_directories, bulk_request.url_prefix, \
     bulk_request.target_prefix, bulk_request.clear_on_success, bulk_request.clear_on_failure, \
     bulk_request.cancel_on_failure, bulk_request.prestore, bulk_request.delay_clear, \
     bulk_request.arrived_at, bulk_request.started_at, bulk_request.last_modified, \
     bulk_request.completed_at, bulk_request.status";

/// Column assignments for a status change made at `now`.
fn status_assignments(status: BulkRequestStatus, now: i64) -> (Vec<&'static str>, Vec<DbValue>) {
    let mut sets = vec!["status = ?", "last_modified = ?"];
    let mut params = vec![DbValue::from(status.as_str()), DbValue::from(now)];

    match status {
        BulkRequestStatus::Queued => {
            sets.push("started_at = NULL");
            sets.push("completed_at = NULL");
        }
        BulkRequestStatus::Started => {
            sets.push("started_at = ?");
            params.push(DbValue::from(now));
            sets.push("completed_at = NULL");
        }
        BulkRequestStatus::Cancelling => {
            sets.push("completed_at = NULL");
        }
        BulkRequestStatus::Completed | BulkRequestStatus::Cancelled => {
            sets.push("completed_at = ?");
            params.push(DbValue::from(now));
        }
    }

    (sets, params)
}

/// SET clause for an unconditional request update.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct RequestUpdate {
    status: Option<BulkRequestStatus>,
    clear_on_success: Option<bool>,
    clear_on_failure: Option<bool>,
    delay_clear: Option<i64>,
}

impl RequestUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: BulkRequestStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn clear_on_success(mut self, flag: bool) -> Self {
        self.clear_on_success = Some(flag);
        self
    }

    pub fn clear_on_failure(mut self, flag: bool) -> Self {
        self.clear_on_failure = Some(flag);
        self
    }

    pub fn delay_clear(mut self, secs: i64) -> Self {
        self.delay_clear = Some(secs);
        self
    }

    fn compile(&self, now: i64) -> (String, Vec<DbValue>) {
        let (mut sets, mut params) = match self.status {
            Some(status) => status_assignments(status, now),
            None => (vec!["last_modified = ?"], vec![DbValue::from(now)]),
        };
        if let Some(flag) = self.clear_on_success {
            sets.push("clear_on_success = ?");
            params.push(flag.into());
        }
        if let Some(flag) = self.clear_on_failure {
            sets.push("clear_on_failure = ?");
            params.push(flag.into());
        }
        if let Some(secs) = self.delay_clear {
            sets.push("delay_clear = ?");
            params.push(secs.into());
        }
        (sets.join(", "), params)
    }
}

#[derive(Clone)]
pub struct RequestDao {
    pool: SqlitePool,
}

impl RequestDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert the request row; returns the assigned `seq_no`.
    pub async fn insert(conn: &mut SqliteConnection, request: &BulkRequest) -> Result<i64> {
        let status = &request.status_info;
        let result = sqlx::query(
            r#"
            INSERT INTO bulk_request (
                uid, owner, activity, expand_directories, url_prefix, target_prefix,
                clear_on_success, clear_on_failure, cancel_on_failure, prestore, delay_clear,
                arrived_at, started_at, last_modified, completed_at, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.uid.as_str())
        .bind(&status.owner)
        .bind(&request.activity)
        .bind(request.expand_directories.as_str())
        .bind(&request.url_prefix)
        .bind(&request.target_prefix)
        .bind(request.clear_on_success)
        .bind(request.clear_on_failure)
        .bind(request.cancel_on_failure)
        .bind(request.prestore)
        .bind(request.delay_clear)
        .bind(status.created_at)
        .bind(status.started_at)
        .bind(status.last_modified)
        .bind(status.completed_at)
        .bind(status.status.as_str())
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn insert_arguments(
        conn: &mut SqliteConnection,
        rid: i64,
        arguments: &HashMap<String, String>,
    ) -> Result<()> {
        let json = serde_json::to_string(arguments)?;
        sqlx::query("INSERT INTO request_arguments (rid, arguments) VALUES (?, ?)")
            .bind(rid)
            .bind(json)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Requests matching `criterion`, at most `limit` of them.
    pub async fn get(
        &self,
        criterion: &Criterion,
        limit: Option<i64>,
        include_args: bool,
    ) -> Result<Vec<BulkRequest>> {
        let (args_column, args_join) = if include_args {
            (
                format!(", {}.arguments", ARGUMENTS_TABLE),
                format!(
                    "LEFT JOIN {a} ON {a}.rid = {r}.seq_no",
                    a = ARGUMENTS_TABLE,
                    r = REQUEST_TABLE
                ),
            )
        } else {
            (String::new(), String::new())
        };

        let sql = format!(
            "SELECT DISTINCT {}{} FROM {} {} {} {} {} LIMIT ?",
            REQUEST_COLUMNS,
            args_column,
            REQUEST_TABLE,
            args_join,
            criterion.join_clause(),
            criterion.where_clause(),
            criterion.order_clause(),
        );
        debug!(sql = %sql, "Request query");

        let rows = bind_values(sqlx::query(&sql), criterion.params())
            .bind(limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row_to_request(row, include_args))
            .collect()
    }

    /// The request with this UID, arguments included.
    pub async fn get_by_uid(&self, uid: &str) -> Result<Option<BulkRequest>> {
        let mut found = self.get(&Criterion::requests().uids([uid]), Some(1), true).await?;
        Ok(found.pop())
    }

    pub async fn count(&self, criterion: &Criterion) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(DISTINCT {r}.seq_no) FROM {r} {} {}",
            criterion.join_clause(),
            criterion.where_clause(),
            r = REQUEST_TABLE,
        );
        let count: i64 = bind_values(sqlx::query(&sql), criterion.params())
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;
        Ok(count.max(0) as u64)
    }

    pub async fn uids(&self, criterion: &Criterion, limit: Option<i64>) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT {r}.uid FROM {r} {} {} {} LIMIT ?",
            criterion.join_clause(),
            criterion.where_clause(),
            criterion.order_clause(),
            r = REQUEST_TABLE,
        );
        let rows = bind_values(sqlx::query(&sql), criterion.params())
            .bind(limit.unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("uid").map_err(BulkError::from))
            .collect()
    }

    /// Unconditional update of every request matching `criterion`.
    pub async fn update(
        &self,
        criterion: &Criterion,
        set: &RequestUpdate,
        now: i64,
    ) -> Result<u64> {
        let (sets, mut params) = set.compile(now);
        let sql = format!(
            "UPDATE {} SET {} {}",
            REQUEST_TABLE,
            sets,
            criterion.mutation_where_clause()?
        );
        params.extend_from_slice(criterion.params());

        let result = bind_values(sqlx::query(&sql), &params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Move the request to `status` only if none of its targets is still
    /// CREATED, READY or RUNNING and the row is not already terminal. With
    /// `expected`, the stored status must also equal it.
    ///
    /// Returns the number of rows changed (0 or 1).
    pub async fn update_to(
        &self,
        uid: &str,
        status: BulkRequestStatus,
        expected: Option<BulkRequestStatus>,
        now: i64,
    ) -> Result<u64> {
        let (sets, mut params) = status_assignments(status, now);

        let mut clauses = vec![
            "uid = ?".to_string(),
            format!("status NOT IN ({})", placeholders(2)),
        ];
        params.push(DbValue::from(uid));
        params.extend(
            BulkRequestStatus::TERMINAL
                .iter()
                .map(|s| DbValue::from(s.as_str())),
        );

        if let Some(expected) = expected {
            clauses.push("status = ?".to_string());
            params.push(DbValue::from(expected.as_str()));
        }

        clauses.push(format!(
            "NOT EXISTS (SELECT 1 FROM {t} WHERE {t}.rid = {r}.seq_no AND {t}.state IN ({}))",
            placeholders(TargetState::NON_TERMINAL.len()),
            t = TARGET_TABLE,
            r = REQUEST_TABLE,
        ));
        params.extend(
            TargetState::NON_TERMINAL
                .iter()
                .map(|s| DbValue::from(s.as_str())),
        );

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            REQUEST_TABLE,
            sets.join(", "),
            clauses.join(" AND ")
        );

        let result = bind_values(sqlx::query(&sql), &params)
            .execute(&self.pool)
            .await?;
        debug!(uid, %status, rows = result.rows_affected(), "Conditional status update");
        Ok(result.rows_affected())
    }

    /// Delete matching requests; arguments, permissions and targets cascade.
    pub async fn delete(&self, criterion: &Criterion) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} {}",
            REQUEST_TABLE,
            criterion.mutation_where_clause()?
        );
        let result = bind_values(sqlx::query(&sql), criterion.params())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_request(row: &SqliteRow, include_args: bool) -> Result<BulkRequest> {
    let uid: String = row.try_get("uid")?;
    let uid = RequestUid::parse(&uid)
        .map_err(|e| BulkError::storage(format!("stored request has bad uid: {}", e)))?;

    let status: String = row.try_get("status")?;
    let status = BulkRequestStatus::parse(&status)
        .ok_or_else(|| BulkError::storage(format!("unknown request status '{}'", status)))?;

    let depth: String = row.try_get("expand_directories")?;
    let expand_directories = Depth::parse(&depth)
        .ok_or_else(|| BulkError::storage(format!("unknown expansion depth '{}'", depth)))?;

    let arguments = if include_args {
        match row.try_get::<Option<String>, _>("arguments")? {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        }
    } else {
        None
    };

    Ok(BulkRequest {
        seq_no: row.try_get("seq_no")?,
        uid,
        activity: row.try_get("activity")?,
        expand_directories,
        url_prefix: row.try_get("url_prefix")?,
        target_prefix: row.try_get("target_prefix")?,
        clear_on_success: row.try_get("clear_on_success")?,
        clear_on_failure: row.try_get("clear_on_failure")?,
        cancel_on_failure: row.try_get("cancel_on_failure")?,
        prestore: row.try_get("prestore")?,
        delay_clear: row.try_get("delay_clear")?,
        arguments,
        status_info: BulkRequestStatusInfo {
            owner: row.try_get("owner")?,
            status,
            created_at: row.try_get("arrived_at")?,
            started_at: row.try_get("started_at")?,
            last_modified: row.try_get("last_modified")?,
            completed_at: row.try_get("completed_at")?,
        },
    })
}
