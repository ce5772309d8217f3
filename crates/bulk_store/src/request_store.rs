//! Bulk request lifecycle.
//!
//! Status transitions are decided against the cached request, but the write
//! itself is a predicate-guarded UPDATE so concurrent workers finishing the
//! last targets of a request cannot complete it twice or regress it. The
//! cache is only mirrored after the database accepted the change.
//!
//! # Transitions
//!
//! | stored     | requested              | write                         |
//! |------------|------------------------|-------------------------------|
//! | QUEUED     | COMPLETED, CANCELLED   | conditional                   |
//! | QUEUED     | STARTED, CANCELLING    | unconditional                 |
//! | STARTED    | COMPLETED, CANCELLED   | conditional                   |
//! | STARTED    | CANCELLING             | unconditional                 |
//! | CANCELLING | CANCELLED              | conditional, still CANCELLING |
//! | terminal   | anything               | none                          |
//!
//! Conditional writes only succeed while no target of the request is
//! CREATED, READY or RUNNING.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::archive::{summary_criterion, ArchiveStore};
use crate::cache::LoadingCache;
use crate::config::StoreConfig;
use crate::criterion::{Criterion, SortColumn};
use crate::error::{BulkError, Result};
use crate::permissions::PermissionsStore;
use crate::request_dao::{RequestDao, RequestUpdate};
use crate::scheduler::TaskScheduler;
use crate::subject::{Restriction, Subject};
use crate::target_store::{NewTarget, TargetStore};
use crate::types::*;
use crate::{now_millis, BulkDb};

/// Largest number of UIDs bound into one statement.
const UID_CHUNK: usize = 500;

/// Requests currently STARTED, as observed by this process.
#[derive(Debug, Default)]
struct ActiveRequests {
    by_user: HashMap<String, Vec<String>>,
    user_of: HashMap<String, String>,
}

impl ActiveRequests {
    fn add(&mut self, user: &str, uid: &str) {
        if let Some(previous) = self.user_of.insert(uid.to_string(), user.to_string()) {
            self.detach(&previous, uid);
        }
        self.by_user
            .entry(user.to_string())
            .or_default()
            .push(uid.to_string());
    }

    fn remove(&mut self, uid: &str) {
        if let Some(user) = self.user_of.remove(uid) {
            self.detach(&user, uid);
        }
    }

    fn detach(&mut self, user: &str, uid: &str) {
        if let Some(uids) = self.by_user.get_mut(user) {
            uids.retain(|u| u != uid);
            if uids.is_empty() {
                self.by_user.remove(user);
            }
        }
    }

    fn clear(&mut self) {
        self.by_user.clear();
        self.user_of.clear();
    }
}

#[derive(Clone)]
pub struct RequestStore {
    requests: RequestDao,
    targets: TargetStore,
    permissions: PermissionsStore,
    archive: ArchiveStore,
    cache: Arc<LoadingCache<BulkRequest>>,
    active: Arc<Mutex<ActiveRequests>>,
    scheduler: TaskScheduler,
    page_size: i64,
}

impl RequestStore {
    /// Must be called from within a tokio runtime; delayed clears are
    /// scheduled on it.
    pub fn new(db: &BulkDb, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let pool = db.pool().clone();
        Ok(Self {
            requests: RequestDao::new(pool.clone()),
            targets: TargetStore::new(pool.clone()),
            permissions: PermissionsStore::new(pool.clone()),
            archive: ArchiveStore::new(pool),
            cache: Arc::new(LoadingCache::new(
                config.cache_capacity,
                config.cache_expiry(),
            )),
            active: Arc::new(Mutex::new(ActiveRequests::default())),
            scheduler: TaskScheduler::current()?,
            page_size: config.page_size,
        })
    }

    pub fn targets(&self) -> &TargetStore {
        &self.targets
    }

    pub fn permissions(&self) -> &PermissionsStore {
        &self.permissions
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    fn active(&self) -> MutexGuard<'_, ActiveRequests> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Persist a new request with its permissions, arguments and initial
    /// targets in one transaction. The request is QUEUED and owned by
    /// `subject`.
    pub async fn store(
        &self,
        subject: &Subject,
        restriction: &Restriction,
        mut request: BulkRequest,
        targets: &[String],
    ) -> Result<BulkRequest> {
        let uid = request.uid.to_string();
        let owner = subject.uid_gid_key();
        trace!(uid = %uid, owner = %owner, "store");

        let now = now_millis();
        request.status_info = BulkRequestStatusInfo {
            owner,
            status: BulkRequestStatus::Queued,
            created_at: now,
            started_at: None,
            last_modified: now,
            completed_at: None,
        };

        let failed = |e: BulkError| BulkError::storage(format!("could not store {}: {}", uid, e));

        let mut tx = self.requests.pool().begin().await?;
        let rid = RequestDao::insert(&mut *tx, &request)
            .await
            .map_err(failed)?;
        PermissionsStore::insert(&mut *tx, rid, subject, restriction)
            .await
            .map_err(failed)?;
        if let Some(arguments) = &request.arguments {
            RequestDao::insert_arguments(&mut *tx, rid, arguments)
                .await
                .map_err(failed)?;
        }
        TargetStore::insert_initial_targets(&mut *tx, rid, targets, now)
            .await
            .map_err(failed)?;
        tx.commit().await?;

        request.seq_no = rid;
        self.cache.invalidate(&uid);
        info!(uid = %uid, seq_no = rid, targets = targets.len(), "Request stored");
        Ok(request)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    async fn load_cached(&self, uid: &str) -> Result<Option<BulkRequest>> {
        let requests = self.requests.clone();
        self.cache
            .get_or_load(uid, move |uid| async move { requests.get_by_uid(&uid).await })
            .await
    }

    /// Cached lookup. Load failures are logged and reported as absent.
    async fn cached(&self, uid: &str) -> Option<BulkRequest> {
        match self.load_cached(uid).await {
            Ok(found) => found,
            Err(e) => {
                error!(uid, error = %e, "Failed to load request");
                None
            }
        }
    }

    /// Existing request; load failures are returned as is.
    async fn valid(&self, uid: &str) -> Result<BulkRequest> {
        self.load_cached(uid)
            .await?
            .ok_or_else(|| BulkError::not_found(format!("request {} not found", uid)))
    }

    pub async fn get_request(&self, uid: &str) -> Result<Option<BulkRequest>> {
        trace!(uid, "get_request");
        Ok(self.cached(uid).await)
    }

    pub async fn get_request_status(&self, uid: &str) -> Result<Option<BulkRequestStatus>> {
        trace!(uid, "get_request_status");
        Ok(self.cached(uid).await.map(|r| r.status()))
    }

    /// `seq_no` of an existing request.
    pub async fn get_key(&self, uid: &str) -> Result<i64> {
        Ok(self.valid(uid).await?.seq_no)
    }

    /// Requests matching `filter` in submission order.
    pub async fn find(
        &self,
        filter: Option<&BulkRequestFilter>,
        limit: Option<i64>,
    ) -> Result<Vec<BulkRequest>> {
        trace!(?filter, ?limit, "find");
        let mut criterion = Criterion::requests().sorted_by(SortColumn::SeqNo);
        if let Some(filter) = filter {
            criterion = criterion.filter(filter);
        }
        self.requests.get(&criterion, limit, false).await
    }

    pub async fn count(&self, filter: Option<&BulkRequestFilter>) -> Result<u64> {
        let criterion = match filter {
            Some(filter) => Criterion::requests().filter(filter),
            None => Criterion::requests(),
        };
        self.requests.count(&criterion).await
    }

    /// Number of STARTED requests.
    pub async fn count_active(&self) -> Result<u64> {
        self.requests
            .count(&Criterion::requests().statuses([BulkRequestStatus::Started]))
            .await
    }

    /// Number of QUEUED or STARTED requests of `owner`.
    pub async fn count_non_terminated(&self, owner: &str) -> Result<u64> {
        self.requests
            .count(
                &Criterion::requests()
                    .owners([owner])
                    .statuses([BulkRequestStatus::Queued, BulkRequestStatus::Started]),
            )
            .await
    }

    /// Up to `limit` QUEUED requests with their arguments, ordered by
    /// `sorted_by` (default `arrived_at`).
    pub async fn next(
        &self,
        sorted_by: Option<&str>,
        reverse: Option<bool>,
        limit: i64,
    ) -> Result<Vec<BulkRequest>> {
        trace!(?sorted_by, ?reverse, limit, "next");
        let column = match sorted_by {
            Some(name) => SortColumn::parse(name)?,
            None => SortColumn::ArrivedAt,
        };
        let criterion = Criterion::requests()
            .statuses([BulkRequestStatus::Queued])
            .sorted_by(column)
            .reverse(reverse.unwrap_or(false));
        self.requests.get(&criterion, Some(limit), true).await
    }

    /// Listing of at most one page of requests with their unprocessed target
    /// counts. Requests whose count cannot be read are left out.
    pub async fn get_request_summaries(
        &self,
        statuses: &[BulkRequestStatus],
        owners: &[String],
        path: Option<&str>,
        seq_floor: Option<i64>,
    ) -> Result<Vec<BulkRequestSummary>> {
        trace!(?statuses, ?owners, ?path, "get_request_summaries");
        let criterion = Criterion::requests()
            .sorted_by(SortColumn::SeqNo)
            .seq_floor(seq_floor)
            .target_path(path)
            .statuses(statuses.iter().copied())
            .owners(owners);
        let requests = self
            .requests
            .get(&criterion, Some(self.page_size), false)
            .await?;

        let mut summaries = Vec::with_capacity(requests.len());
        for request in requests {
            match self.targets.count_unprocessed(request.seq_no).await {
                Ok(unprocessed) => summaries.push(BulkRequestSummary {
                    seq_no: request.seq_no,
                    url: format!("{}/{}", request.url_prefix, request.uid),
                    activity: request.activity,
                    status_info: request.status_info,
                    unprocessed,
                }),
                Err(e) => {
                    error!(uid = %request.uid, error = %e, "Unable to count unprocessed targets");
                }
            }
        }
        Ok(summaries)
    }

    /// One page of the targets of a request the caller may see.
    pub async fn get_request_info(
        &self,
        subject: &Subject,
        uid: &str,
        offset: i64,
    ) -> Result<BulkRequestInfo> {
        trace!(caller = %subject.uid_gid_key(), uid, offset, "get_request_info");
        let stored = self.valid(uid).await?;

        if !self.is_request_subject(subject, uid).await? {
            return Err(BulkError::permission_denied(uid));
        }

        let (targets, next_seq_no) = self.process_targets(&stored, offset).await?;
        let status = &stored.status_info;
        Ok(BulkRequestInfo {
            uid: stored.uid.to_string(),
            status: status.status,
            arrived_at: status.created_at,
            started_at: status.started_at,
            last_modified: status.last_modified,
            target_prefix: stored.target_prefix.clone(),
            targets,
            next_seq_no,
        })
    }

    /// Page of non-root targets starting at `offset`, and the offset of the
    /// next page or [`NO_FURTHER_ENTRIES`].
    async fn process_targets(
        &self,
        request: &BulkRequest,
        offset: i64,
    ) -> Result<(Vec<BulkRequestTargetInfo>, i64)> {
        let page = self
            .targets
            .page(request.seq_no, offset, self.page_size)
            .await?;

        let next = match page.last() {
            Some(last) if page.len() as i64 >= self.page_size => last.id + 1,
            _ => NO_FURTHER_ENTRIES,
        };

        let strip = self.discovered_prefix_to_strip(request).await?;
        let infos = page
            .iter()
            .map(|target| target_info(target, strip))
            .collect();
        Ok((infos, next))
    }

    /// Discovered paths are stored absolute. When the request was submitted
    /// with paths relative to its target prefix, show them relative too.
    async fn discovered_prefix_to_strip<'a>(
        &self,
        request: &'a BulkRequest,
    ) -> Result<Option<&'a str>> {
        let Some(prefix) = request
            .target_prefix
            .as_deref()
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| !p.is_empty())
        else {
            return Ok(None);
        };

        let initial = self.targets.initial_targets(request.seq_no).await?;
        match initial.first() {
            Some(first) if strip_path_prefix(&first.path, prefix).is_none() => Ok(Some(prefix)),
            _ => Ok(None),
        }
    }

    /// Snapshot of `owner key -> STARTED request UIDs`.
    pub fn get_active_requests_by_user(&self) -> HashMap<String, Vec<String>> {
        self.active().by_user.clone()
    }

    pub async fn get_subject(&self, uid: &str) -> Result<Option<Subject>> {
        Ok(self.permissions.get_for(uid).await?.map(|p| p.subject))
    }

    pub async fn get_restriction(&self, uid: &str) -> Result<Option<Restriction>> {
        Ok(self.permissions.get_for(uid).await?.map(|p| p.restriction))
    }

    /// Root, admins and the submitting uid/gid pair are request subjects.
    pub async fn is_request_subject(&self, subject: &Subject, uid: &str) -> Result<bool> {
        if subject.is_privileged() {
            return Ok(true);
        }
        Ok(self
            .permissions
            .get_for(uid)
            .await?
            .is_some_and(|p| subject.may_access(&p.subject.uid_gid_key())))
    }

    pub async fn get_archived_info(
        &self,
        subject: &Subject,
        uid: &str,
    ) -> Result<Option<ArchivedRequestInfo>> {
        trace!(caller = %subject.uid_gid_key(), uid, "get_archived_info");
        let mut found = self
            .archive
            .get(&Criterion::archive().uids([uid]), Some(1))
            .await?;
        let Some(info) = found.pop() else {
            return Ok(None);
        };

        if !subject.may_access(&info.owner) {
            return Err(BulkError::permission_denied(format!(
                "{} may not read archived request {}",
                subject.uid_gid_key(),
                uid
            )));
        }
        Ok(Some(info))
    }

    pub async fn get_archived_summaries(
        &self,
        filter: &ArchivedSummaryFilter,
    ) -> Result<Vec<ArchivedSummaryInfo>> {
        self.archive
            .list(&summary_criterion(filter), filter.limit)
            .await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Move a request to `status`.
    ///
    /// Returns false when the transition is not allowed from the stored
    /// status, or when a conditional write lost (targets still running, or
    /// another process got there first). Callers retry later in that case.
    pub async fn update(&self, uid: &str, status: BulkRequestStatus) -> Result<bool> {
        use BulkRequestStatus::*;

        trace!(uid, %status, "update");
        let stored = self.valid(uid).await?;
        let stored_status = stored.status();

        if stored_status == status {
            return Ok(false);
        }

        let now = now_millis();
        let by_uid = || Criterion::requests().uids([uid]);
        let set = RequestUpdate::new().status(status);

        let updated = match (stored_status, status) {
            (Completed | Cancelled, _) => false,
            (Cancelling, Cancelled) => {
                self.requests
                    .update_to(uid, status, Some(Cancelling), now)
                    .await?
                    == 1
            }
            (Cancelling, _) => false,
            (Queued | Started, Completed | Cancelled) => {
                self.requests.update_to(uid, status, None, now).await? == 1
            }
            (Started, Cancelling) => self.requests.update(&by_uid(), &set, now).await? == 1,
            (Started, _) => false,
            (Queued, _) => self.requests.update(&by_uid(), &set, now).await? == 1,
        };

        if !updated {
            debug!(uid, from = %stored_status, to = %status, "Status not updated");
            return Ok(false);
        }

        self.cache
            .modify(uid, |cached| cached.status_info.apply(status, now));

        match status {
            Completed | Cancelled => {
                self.active().remove(uid);
                self.conditionally_clear_terminal_request(&stored).await;
            }
            Started => {
                self.active().add(stored.owner(), uid);
            }
            Queued | Cancelling => {}
        }

        Ok(true)
    }

    /// Clear a request that just became terminal if its policy asks for it:
    /// `clear_on_failure` when any target failed, `clear_on_success`
    /// otherwise.
    async fn conditionally_clear_terminal_request(&self, stored: &BulkRequest) {
        let uid = stored.uid.to_string();
        let failed = match self.targets.count_failed(stored.seq_no).await {
            Ok(failed) => failed,
            Err(e) => {
                error!(uid = %uid, error = %e, "Could not count failed targets");
                return;
            }
        };

        let clear = if failed > 0 {
            stored.clear_on_failure
        } else {
            stored.clear_on_success
        };
        if !clear {
            return;
        }

        if stored.delay_clear <= 0 {
            if let Err(e) = self.clear_unchecked(&uid).await {
                error!(uid = %uid, error = %e, "Clear of terminal request failed");
            }
            return;
        }

        let delay = Duration::from_secs(stored.delay_clear as u64);
        debug!(uid = %uid, ?delay, "Scheduling clear of terminal request");
        let store = self.clone();
        self.scheduler.schedule(delay, async move {
            if let Err(e) = store.clear_unchecked(&uid).await {
                error!(uid = %uid, error = %e, "Delayed clear failed");
            }
        });
    }

    /// Archive and delete a request the caller may act on.
    pub async fn clear(&self, subject: &Subject, uid: &str) -> Result<()> {
        trace!(caller = %subject.uid_gid_key(), uid, "clear");
        self.permissions
            .check_request_permissions(subject, uid)
            .await?;
        let request = self.valid(uid).await?;
        self.clear_request(&request).await
    }

    /// Archive and delete without a permission check. A request that is
    /// already gone is not an error.
    pub async fn clear_unchecked(&self, uid: &str) -> Result<()> {
        match self.cached(uid).await {
            Some(request) => self.clear_request(&request).await,
            None => {
                debug!(uid, "Request already cleared");
                Ok(())
            }
        }
    }

    /// The request is only deleted once its archive row is written.
    async fn clear_request(&self, request: &BulkRequest) -> Result<()> {
        let uid = request.uid.as_str();
        if let Err(e) = self.archive_request(request).await {
            warn!(uid, error = %e, "Could not archive request, keeping it");
            return Err(e);
        }

        self.requests
            .delete(&Criterion::requests().uids([uid]))
            .await?;
        self.cache.invalidate(uid);
        self.active().remove(uid);
        info!(uid, "Request cleared");
        Ok(())
    }

    /// Have the request cleared as soon as it is terminal, without delay.
    /// A request that already is terminal is cleared now.
    pub async fn clear_when_terminated(&self, subject: &Subject, uid: &str) -> Result<()> {
        trace!(caller = %subject.uid_gid_key(), uid, "clear_when_terminated");
        self.permissions
            .check_request_permissions(subject, uid)
            .await?;
        let request = self.valid(uid).await?;

        let set = RequestUpdate::new()
            .clear_on_success(true)
            .clear_on_failure(true)
            .delay_clear(0);
        self.requests
            .update(&Criterion::requests().uids([uid]), &set, now_millis())
            .await?;
        self.cache.invalidate(uid);

        if request.status().is_terminal() {
            self.clear_unchecked(uid).await?;
        }
        Ok(())
    }

    /// Fail a request that could not be processed at all: record the root
    /// cause of `error` on a ROOT target and complete the request.
    pub async fn abort(
        &self,
        request: &BulkRequest,
        error_type: &str,
        error: &(dyn StdError + 'static),
    ) -> Result<()> {
        let uid = request.uid.as_str();
        let cause = root_cause(error).to_string();
        warn!(uid, error_type, cause = %cause, "Aborting request");

        let path = request.target_prefix.as_deref().unwrap_or("/");
        self.targets
            .abort(&NewTarget::root_failure(request.seq_no, path, error_type, cause))
            .await?;

        let set = RequestUpdate::new().status(BulkRequestStatus::Completed);
        self.requests
            .update(&Criterion::requests().uids([uid]), &set, now_millis())
            .await?;
        self.cache.invalidate(uid);
        self.active().remove(uid);

        self.conditionally_clear_terminal_request(request).await;
        Ok(())
    }

    /// Return a request to QUEUED with only its initial targets, all
    /// CREATED.
    pub async fn reset(&self, uid: &str) -> Result<()> {
        trace!(uid, "reset");
        let request = self.valid(uid).await?;

        self.targets.reset(request.seq_no).await?;
        let set = RequestUpdate::new().status(BulkRequestStatus::Queued);
        self.requests
            .update(&Criterion::requests().uids([uid]), &set, now_millis())
            .await?;

        self.cache.invalidate(uid);
        self.active().remove(uid);
        Ok(())
    }

    /// Restart recovery: interrupted requests go back to QUEUED and their
    /// unfinished targets to CREATED.
    pub async fn load(&self) -> Result<()> {
        self.targets.recover().await?;

        let set = RequestUpdate::new().status(BulkRequestStatus::Queued);
        let requeued = self
            .requests
            .update(
                &Criterion::requests()
                    .statuses([BulkRequestStatus::Started, BulkRequestStatus::Cancelling]),
                &set,
                now_millis(),
            )
            .await?;

        self.cache.invalidate_all();
        self.active().clear();
        info!(requeued, "Request store loaded");
        Ok(())
    }

    // ========================================================================
    // Archiving
    // ========================================================================

    /// Write the request and all its non-root targets to the archive.
    pub(crate) async fn archive_request(&self, request: &BulkRequest) -> Result<()> {
        let mut info = ArchivedRequestInfo::from_request(request);
        let mut offset = 0;
        loop {
            let (targets, next) = self.process_targets(request, offset).await?;
            info.targets.extend(targets);
            if next == NO_FURTHER_ENTRIES {
                break;
            }
            offset = next;
        }
        self.archive.insert(&info).await
    }

    /// Uncached read, for the archiver.
    pub(crate) async fn fetch(&self, uid: &str) -> Result<Option<BulkRequest>> {
        self.requests.get_by_uid(uid).await
    }

    /// Terminal requests last modified before `threshold`.
    pub(crate) async fn archivable_uids(&self, threshold: i64) -> Result<Vec<String>> {
        let criterion = Criterion::requests()
            .statuses(BulkRequestStatus::TERMINAL)
            .modified_before(Some(threshold))
            .sorted_by(SortColumn::SeqNo);
        self.requests.uids(&criterion, None).await
    }

    /// Delete the given archived requests, if still terminal and older than
    /// `threshold`.
    pub(crate) async fn delete_archived(&self, uids: &[String], threshold: i64) -> Result<u64> {
        let mut deleted = 0;
        for chunk in uids.chunks(UID_CHUNK) {
            let criterion = Criterion::requests()
                .uids(chunk)
                .statuses(BulkRequestStatus::TERMINAL)
                .modified_before(Some(threshold));
            deleted += self.requests.delete(&criterion).await?;
            for uid in chunk {
                self.cache.invalidate(uid);
            }
        }
        Ok(deleted)
    }
}

fn root_cause<'a>(error: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    let mut cause = error;
    while let Some(source) = cause.source() {
        cause = source;
    }
    cause
}

/// `path` relative to `prefix`, if it lies under it.
fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    match path.strip_prefix(prefix) {
        Some("") => Some("/"),
        Some(rest) if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

fn target_info(target: &BulkRequestTarget, strip: Option<&str>) -> BulkRequestTargetInfo {
    let initial = target.pid == TargetPid::Initial;
    let path = match strip {
        Some(prefix) if !initial => strip_path_prefix(&target.path, prefix).unwrap_or(&target.path),
        _ => &target.path,
    };
    BulkRequestTargetInfo {
        id: target.id,
        target: path.to_string(),
        initial,
        state: target.state,
        submitted_at: target.created_at,
        started_at: target.started_at,
        finished_at: target.is_terminated().then_some(target.last_updated),
        error_type: target.error_type.clone(),
        error_message: target.error_message.clone(),
    }
}
