//! Parameterized WHERE-clause builder shared by the request, target and
//! archive queries.
//!
//! A [`Criterion`] is a value: every method consumes it and returns the
//! extended criterion. Clauses are joined with `AND`; set-valued filters
//! expand to `IN (?, ...)`, so a field matches any of its members. Values
//! are only ever bound as parameters.

use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};

use crate::error::{BulkError, Result};
use crate::types::{BulkRequestFilter, BulkRequestStatus, Depth, TargetPid, TargetState};

pub const REQUEST_TABLE: &str = "bulk_request";
pub const ARGUMENTS_TABLE: &str = "request_arguments";
pub const PERMISSIONS_TABLE: &str = "request_permissions";
pub const TARGET_TABLE: &str = "request_target";
pub const ARCHIVE_TABLE: &str = "request_archive";

/// Value type for query parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Text(String),
    Boolean(bool),
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Integer(v as i64)
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Boolean(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DbValue::Null,
        }
    }
}

/// Bind `values` to the `?` placeholders of `query`, in order.
pub(crate) fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    values: &[DbValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            DbValue::Null => query.bind(Option::<i64>::None),
            DbValue::Integer(v) => query.bind(*v),
            DbValue::Text(v) => query.bind(v.clone()),
            DbValue::Boolean(v) => query.bind(*v),
        };
    }
    query
}

/// Comma separated `?` list for `n` values.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Columns a request listing may be ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    SeqNo,
    ArrivedAt,
    StartedAt,
    LastModified,
    Status,
    Activity,
    Owner,
}

impl SortColumn {
    pub fn column(&self) -> &'static str {
        match self {
            Self::SeqNo => "seq_no",
            Self::ArrivedAt => "arrived_at",
            Self::StartedAt => "started_at",
            Self::LastModified => "last_modified",
            Self::Status => "status",
            Self::Activity => "activity",
            Self::Owner => "owner",
        }
    }

    /// Accepts column names with or without the `bulk_request.` qualifier.
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw.trim();
        let name = name
            .strip_prefix("bulk_request.")
            .unwrap_or(name)
            .to_ascii_lowercase();
        match name.as_str() {
            "seq_no" | "id" => Ok(Self::SeqNo),
            "arrived_at" => Ok(Self::ArrivedAt),
            "started_at" => Ok(Self::StartedAt),
            "last_modified" => Ok(Self::LastModified),
            "status" => Ok(Self::Status),
            "activity" => Ok(Self::Activity),
            "owner" => Ok(Self::Owner),
            _ => Err(BulkError::invalid_query(format!(
                "cannot sort requests by '{}'",
                raw
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Join {
    /// `bulk_request` joined with its targets
    Targets,
}

/// Accumulated WHERE clauses and their parameters, rooted at one table.
#[derive(Debug, Clone)]
#[must_use]
pub struct Criterion {
    table: &'static str,
    clauses: Vec<String>,
    params: Vec<DbValue>,
    joins: Vec<Join>,
    order_by: Option<&'static str>,
    reverse: bool,
}

impl Criterion {
    pub fn on(table: &'static str) -> Self {
        Self {
            table,
            clauses: Vec::new(),
            params: Vec::new(),
            joins: Vec::new(),
            order_by: None,
            reverse: false,
        }
    }

    pub fn requests() -> Self {
        Self::on(REQUEST_TABLE)
    }

    pub fn targets() -> Self {
        Self::on(TARGET_TABLE)
    }

    pub fn archive() -> Self {
        Self::on(ARCHIVE_TABLE)
    }

    fn qualified(&self, column: &str) -> String {
        format!("{}.{}", self.table, column)
    }

    fn push(mut self, clause: String, params: Vec<DbValue>) -> Self {
        self.clauses.push(clause);
        self.params.extend(params);
        self
    }

    fn compare(self, column: &str, op: &str, value: Option<impl Into<DbValue>>) -> Self {
        match value {
            Some(value) => {
                let clause = format!("{} {} ?", self.qualified(column), op);
                self.push(clause, vec![value.into()])
            }
            None => self,
        }
    }

    fn any_of<I, V>(self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DbValue>,
    {
        let params: Vec<DbValue> = values.into_iter().map(Into::into).collect();
        if params.is_empty() {
            return self;
        }
        let clause = format!("{} IN ({})", self.qualified(column), placeholders(params.len()));
        self.push(clause, params)
    }

    // ------------------------------------------------------------------
    // Columns shared by bulk_request and request_archive
    // ------------------------------------------------------------------

    pub fn uids<I, S>(self, uids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.any_of("uid", uids.into_iter().map(|s| s.as_ref().to_string()))
    }

    pub fn owners<I, S>(self, owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.any_of("owner", owners.into_iter().map(|s| s.as_ref().to_string()))
    }

    pub fn activities<I, S>(self, activities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.any_of(
            "activity",
            activities.into_iter().map(|s| s.as_ref().to_string()),
        )
    }

    pub fn statuses<I>(self, statuses: I) -> Self
    where
        I: IntoIterator<Item = BulkRequestStatus>,
    {
        self.any_of("status", statuses.into_iter().map(|s| s.as_str()))
    }

    pub fn modified_after(self, millis: Option<i64>) -> Self {
        self.compare("last_modified", ">=", millis)
    }

    pub fn modified_before(self, millis: Option<i64>) -> Self {
        self.compare("last_modified", "<", millis)
    }

    // ------------------------------------------------------------------
    // bulk_request
    // ------------------------------------------------------------------

    /// Requests with `seq_no >= floor`.
    pub fn seq_floor(self, floor: Option<i64>) -> Self {
        self.compare("seq_no", ">=", floor)
    }

    pub fn arrived_after(self, millis: Option<i64>) -> Self {
        self.compare("arrived_at", ">=", millis)
    }

    pub fn arrived_before(self, millis: Option<i64>) -> Self {
        self.compare("arrived_at", "<", millis)
    }

    pub fn started_after(self, millis: Option<i64>) -> Self {
        self.compare("started_at", ">=", millis)
    }

    pub fn started_before(self, millis: Option<i64>) -> Self {
        self.compare("started_at", "<", millis)
    }

    pub fn clear_on_success(self, flag: Option<bool>) -> Self {
        self.compare("clear_on_success", "=", flag)
    }

    pub fn clear_on_failure(self, flag: Option<bool>) -> Self {
        self.compare("clear_on_failure", "=", flag)
    }

    pub fn cancel_on_failure(self, flag: Option<bool>) -> Self {
        self.compare("cancel_on_failure", "=", flag)
    }

    pub fn prestore(self, flag: Option<bool>) -> Self {
        self.compare("prestore", "=", flag)
    }

    pub fn expand_directories(self, depth: Option<Depth>) -> Self {
        self.compare("expand_directories", "=", depth.map(|d| d.as_str()))
    }

    /// Requests with at least one target at `path`.
    pub fn target_path(mut self, path: Option<&str>) -> Self {
        let Some(path) = path else {
            return self;
        };
        if !self.joins.contains(&Join::Targets) {
            self.joins.push(Join::Targets);
        }
        let clause = format!("{}.path = ?", TARGET_TABLE);
        self.push(clause, vec![DbValue::from(path)])
    }

    /// Apply every field set in `filter`.
    pub fn filter(self, filter: &BulkRequestFilter) -> Self {
        self.seq_floor(filter.seq_floor)
            .uids(&filter.uids)
            .owners(&filter.owners)
            .activities(&filter.activities)
            .statuses(filter.statuses.iter().copied())
            .arrived_after(filter.arrived_after)
            .arrived_before(filter.arrived_before)
            .started_after(filter.started_after)
            .started_before(filter.started_before)
            .modified_after(filter.modified_after)
            .modified_before(filter.modified_before)
            .clear_on_success(filter.clear_on_success)
            .clear_on_failure(filter.clear_on_failure)
            .cancel_on_failure(filter.cancel_on_failure)
            .prestore(filter.prestore)
            .expand_directories(filter.expand_directories)
            .target_path(filter.target_path.as_deref())
    }

    pub fn sorted_by(mut self, column: SortColumn) -> Self {
        self.order_by = Some(column.column());
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    // ------------------------------------------------------------------
    // request_target
    // ------------------------------------------------------------------

    pub fn rid(self, rid: i64) -> Self {
        self.compare("rid", "=", Some(rid))
    }

    pub fn pids(self, pids: &[TargetPid]) -> Self {
        self.any_of("pid", pids.iter().map(|p| p.ordinal()))
    }

    pub fn not_root_request(self) -> Self {
        self.compare("pid", "<>", Some(TargetPid::Root.ordinal()))
    }

    pub fn states(self, states: &[TargetState]) -> Self {
        self.any_of("state", states.iter().map(|s| s.as_str()))
    }

    pub fn path(self, path: &str) -> Self {
        self.compare("path", "=", Some(path))
    }

    /// Targets with `id >= offset`.
    pub fn offset(self, offset: i64) -> Self {
        self.compare("id", ">=", Some(offset))
    }

    /// Targets of the request with this UID.
    pub fn request_uid(self, uid: &str) -> Self {
        let clause = format!(
            "{} IN (SELECT seq_no FROM {} WHERE uid = ?)",
            self.qualified("rid"),
            REQUEST_TABLE
        );
        self.push(clause, vec![DbValue::from(uid)])
    }

    pub fn ordered_by_id(mut self) -> Self {
        self.order_by = Some("id");
        self
    }

    // ------------------------------------------------------------------
    // Compilation
    // ------------------------------------------------------------------

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn has_joins(&self) -> bool {
        !self.joins.is_empty()
    }

    /// `WHERE ...`, or an empty string when unrestricted.
    pub fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn join_clause(&self) -> String {
        self.joins
            .iter()
            .map(|join| match join {
                Join::Targets => format!(
                    "JOIN {t} ON {t}.rid = {r}.seq_no",
                    t = TARGET_TABLE,
                    r = REQUEST_TABLE
                ),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `ORDER BY ...`, or an empty string when no sorter was chosen.
    pub fn order_clause(&self) -> String {
        match self.order_by {
            Some(column) => format!(
                "ORDER BY {} {}",
                self.qualified(column),
                if self.reverse { "DESC" } else { "ASC" }
            ),
            None => String::new(),
        }
    }

    pub fn params(&self) -> &[DbValue] {
        &self.params
    }

    /// WHERE clause for UPDATE/DELETE statements, which cannot join.
    pub(crate) fn mutation_where_clause(&self) -> Result<String> {
        if self.has_joins() {
            return Err(BulkError::invalid_query(
                "joined criteria cannot drive an update or delete",
            ));
        }
        Ok(self.where_clause())
    }
}
