//! Bulk request, target and archive types.
//!
//! Timestamps are Unix milliseconds, as stored in the tables.

use std::collections::HashMap;

use bulk_ids::RequestUid;
use serde::{Deserialize, Serialize};

/// Continuation value returned when a target page is the last one.
pub const NO_FURTHER_ENTRIES: i64 = -1;

// ============================================================================
// Request Types
// ============================================================================

/// Lifecycle status of a bulk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkRequestStatus {
    Queued,
    Started,
    Cancelling,
    Cancelled,
    Completed,
}

impl BulkRequestStatus {
    pub const TERMINAL: [BulkRequestStatus; 2] = [Self::Completed, Self::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Started => "STARTED",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Some(Self::Queued),
            "STARTED" => Some(Self::Started),
            "CANCELLING" => Some(Self::Cancelling),
            "CANCELLED" => Some(Self::Cancelled),
            "COMPLETED" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for BulkRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How far directory targets are expanded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Depth {
    #[default]
    None,
    One,
    All,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::One => "ONE",
            Self::All => "ALL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NONE" => Some(Self::None),
            "ONE" => Some(Self::One),
            "ALL" => Some(Self::All),
            _ => None,
        }
    }
}

/// Status block of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequestStatusInfo {
    /// uid/gid key of the submitting subject
    pub owner: String,
    pub status: BulkRequestStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub last_modified: i64,
    /// Set iff the status is terminal
    pub completed_at: Option<i64>,
}

impl BulkRequestStatusInfo {
    /// Mirror a persisted status change made at `now`.
    pub(crate) fn apply(&mut self, status: BulkRequestStatus, now: i64) {
        self.status = status;
        self.last_modified = now;
        match status {
            BulkRequestStatus::Queued => {
                self.started_at = None;
                self.completed_at = None;
            }
            BulkRequestStatus::Started => {
                self.started_at = Some(now);
                self.completed_at = None;
            }
            BulkRequestStatus::Cancelling => {
                self.completed_at = None;
            }
            BulkRequestStatus::Completed | BulkRequestStatus::Cancelled => {
                self.completed_at = Some(now);
            }
        }
    }
}

/// A user-submitted batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    /// Insertion sequence (0 until stored)
    pub seq_no: i64,
    pub uid: RequestUid,
    /// Operation kind, e.g. PIN, STAGE, DELETE
    pub activity: String,
    pub expand_directories: Depth,
    pub url_prefix: String,
    pub target_prefix: Option<String>,
    pub clear_on_success: bool,
    pub clear_on_failure: bool,
    pub cancel_on_failure: bool,
    pub prestore: bool,
    /// Seconds to wait before clearing once terminal
    pub delay_clear: i64,
    pub arguments: Option<HashMap<String, String>>,
    pub status_info: BulkRequestStatusInfo,
}

impl BulkRequest {
    /// A new, unsaved request with default policy.
    pub fn new(activity: &str) -> Self {
        Self {
            seq_no: 0,
            uid: RequestUid::new(),
            activity: activity.to_string(),
            expand_directories: Depth::None,
            url_prefix: String::new(),
            target_prefix: None,
            clear_on_success: false,
            clear_on_failure: false,
            cancel_on_failure: false,
            prestore: false,
            delay_clear: 0,
            arguments: None,
            status_info: BulkRequestStatusInfo {
                owner: String::new(),
                status: BulkRequestStatus::Queued,
                created_at: 0,
                started_at: None,
                last_modified: 0,
                completed_at: None,
            },
        }
    }

    pub fn status(&self) -> BulkRequestStatus {
        self.status_info.status
    }

    pub fn owner(&self) -> &str {
        &self.status_info.owner
    }
}

/// Summary line for request listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequestSummary {
    pub seq_no: i64,
    /// `url_prefix/uid`
    pub url: String,
    pub activity: String,
    pub status_info: BulkRequestStatusInfo,
    /// Targets not yet in a terminal state
    pub unprocessed: u64,
}

/// Filter for request queries; unset fields do not restrict.
///
/// Set-valued fields match any of their members.
#[derive(Debug, Clone, Default)]
pub struct BulkRequestFilter {
    pub seq_floor: Option<i64>,
    pub uids: Vec<String>,
    pub owners: Vec<String>,
    pub activities: Vec<String>,
    pub statuses: Vec<BulkRequestStatus>,
    pub arrived_after: Option<i64>,
    pub arrived_before: Option<i64>,
    pub started_after: Option<i64>,
    pub started_before: Option<i64>,
    pub modified_after: Option<i64>,
    pub modified_before: Option<i64>,
    pub clear_on_success: Option<bool>,
    pub clear_on_failure: Option<bool>,
    pub cancel_on_failure: Option<bool>,
    pub prestore: Option<bool>,
    pub expand_directories: Option<Depth>,
    /// Only requests having a target with this path
    pub target_path: Option<String>,
}

// ============================================================================
// Target Types
// ============================================================================

/// Processing state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetState {
    Created,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl TargetState {
    pub const NON_TERMINAL: [TargetState; 3] = [Self::Created, Self::Ready, Self::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "CREATED" => Some(Self::Created),
            "READY" => Some(Self::Ready),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !Self::NON_TERMINAL.contains(self)
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Origin of a target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetPid {
    /// Placeholder for the request itself, carries abort errors
    Root,
    /// Path submitted with the request
    Initial,
    /// Path found by directory expansion
    Discovered,
}

impl TargetPid {
    pub fn ordinal(&self) -> i64 {
        match self {
            Self::Root => 0,
            Self::Initial => 1,
            Self::Discovered => 2,
        }
    }

    pub fn from_ordinal(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Root),
            1 => Some(Self::Initial),
            2 => Some(Self::Discovered),
            _ => None,
        }
    }
}

/// One path or file unit of work of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequestTarget {
    pub id: i64,
    /// `seq_no` of the owning request
    pub rid: i64,
    pub pid: TargetPid,
    pub path: String,
    pub pnfs_id: Option<String>,
    pub state: TargetState,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub last_updated: i64,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl BulkRequestTarget {
    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Target as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequestTargetInfo {
    pub id: i64,
    pub target: String,
    pub initial: bool,
    pub state: TargetState,
    pub submitted_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

/// Paged view of a request and its targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequestInfo {
    pub uid: String,
    pub status: BulkRequestStatus,
    pub arrived_at: i64,
    pub started_at: Option<i64>,
    pub last_modified: i64,
    pub target_prefix: Option<String>,
    pub targets: Vec<BulkRequestTargetInfo>,
    /// Offset of the next page, or [`NO_FURTHER_ENTRIES`]
    pub next_seq_no: i64,
}

// ============================================================================
// Archive Types
// ============================================================================

/// Snapshot of a terminal request, stored write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedRequestInfo {
    pub uid: String,
    pub owner: String,
    pub activity: String,
    pub status: BulkRequestStatus,
    pub arrived_at: i64,
    pub started_at: Option<i64>,
    pub last_modified: i64,
    pub completed_at: Option<i64>,
    pub url_prefix: String,
    pub target_prefix: Option<String>,
    pub arguments: Option<HashMap<String, String>>,
    pub targets: Vec<BulkRequestTargetInfo>,
}

impl ArchivedRequestInfo {
    pub fn from_request(request: &BulkRequest) -> Self {
        let status = &request.status_info;
        Self {
            uid: request.uid.to_string(),
            owner: status.owner.clone(),
            activity: request.activity.clone(),
            status: status.status,
            arrived_at: status.created_at,
            started_at: status.started_at,
            last_modified: status.last_modified,
            completed_at: status.completed_at,
            url_prefix: request.url_prefix.clone(),
            target_prefix: request.target_prefix.clone(),
            arguments: request.arguments.clone(),
            targets: Vec::new(),
        }
    }
}

/// Archive listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedSummaryInfo {
    pub uid: String,
    pub owner: String,
    pub last_modified: i64,
    pub activity: String,
    pub status: BulkRequestStatus,
}

/// Filter for archive listings.
#[derive(Debug, Clone, Default)]
pub struct ArchivedSummaryFilter {
    pub owners: Vec<String>,
    pub activities: Vec<String>,
    pub statuses: Vec<BulkRequestStatus>,
    pub modified_after: Option<i64>,
    pub modified_before: Option<i64>,
    pub limit: Option<i64>,
}
