//! Subject and restriction of each request (`request_permissions`).

use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;

use crate::criterion::{bind_values, Criterion, PERMISSIONS_TABLE, REQUEST_TABLE};
use crate::error::{BulkError, Result};
use crate::subject::{Restriction, Subject};

/// Permissions row joined with the identity of its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPermissions {
    pub seq_no: i64,
    pub uid: String,
    pub subject: Subject,
    pub restriction: Restriction,
}

#[derive(Clone)]
pub struct PermissionsStore {
    pool: SqlitePool,
}

impl PermissionsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        conn: &mut SqliteConnection,
        rid: i64,
        subject: &Subject,
        restriction: &Restriction,
    ) -> Result<()> {
        let subject = serde_json::to_string(subject)?;
        let restriction = serde_json::to_string(restriction)?;
        sqlx::query("INSERT INTO request_permissions (rid, subject, restriction) VALUES (?, ?, ?)")
            .bind(rid)
            .bind(subject)
            .bind(restriction)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// The single permissions row of the request selected by `criterion`.
    ///
    /// A criterion that matches more than one request is a consistency
    /// violation and fails with [`BulkError::Storage`].
    pub async fn get(&self, criterion: &Criterion) -> Result<Option<RequestPermissions>> {
        let sql = format!(
            "SELECT DISTINCT {r}.seq_no, {r}.uid, {p}.subject, {p}.restriction \
             FROM {p} JOIN {r} ON {r}.seq_no = {p}.rid {} {} LIMIT 2",
            criterion.join_clause(),
            criterion.where_clause(),
            p = PERMISSIONS_TABLE,
            r = REQUEST_TABLE,
        );
        let mut rows = bind_values(sqlx::query(&sql), criterion.params())
            .fetch_all(&self.pool)
            .await?;

        if rows.len() > 1 {
            return Err(BulkError::storage(
                "permissions lookup matched more than one request",
            ));
        }
        let Some(row) = rows.pop() else {
            return Ok(None);
        };

        let subject: String = row.try_get("subject")?;
        let restriction: String = row.try_get("restriction")?;
        Ok(Some(RequestPermissions {
            seq_no: row.try_get("seq_no")?,
            uid: row.try_get("uid")?,
            subject: serde_json::from_str(&subject)?,
            restriction: serde_json::from_str(&restriction)?,
        }))
    }

    pub async fn get_for(&self, uid: &str) -> Result<Option<RequestPermissions>> {
        self.get(&Criterion::requests().uids([uid])).await
    }

    /// Fails with `PermissionDenied` unless `subject` may act on the request.
    ///
    /// Returns the uid/gid key of the caller.
    pub async fn check_request_permissions(&self, subject: &Subject, uid: &str) -> Result<String> {
        let key = subject.uid_gid_key();
        let Some(permissions) = self.get_for(uid).await? else {
            return Err(BulkError::permission_denied(format!(
                "{}: no permissions recorded",
                uid
            )));
        };

        if !subject.may_access(&permissions.subject.uid_gid_key()) {
            return Err(BulkError::permission_denied(format!(
                "{}: {} is not the request subject",
                uid, key
            )));
        }

        Ok(key)
    }
}
