//! Execution records and their store.
//!
//! Records move through a fixed lifecycle:
//!
//! ```text
//! queued --begin--> running --succeed--> completed
//!                   running --fail-----> failed
//! {queued, running} --cancel--> cancelled
//! ```
//!
//! Once terminal, a record only accepts cosmetic changes (`workflowName`,
//! `files`). The whole collection is written to the backend under
//! [`STORAGE_KEY`] after every mutation, and re-read before every operation,
//! so several processes sharing one backend see each other's changes.

use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::storage::backend::{KeyValueBackend, MemoryBackend};

/// Backend key holding the JSON array of every record.
pub const STORAGE_KEY: &str = "executions_v1";

const ID_PREFIX: &str = "exec_";

// ─────────────────────────────────────────────────────────────────────────────
// ExecutionStatus
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 5] = [
        ExecutionStatus::Queued,
        ExecutionStatus::Running,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true if the record cannot transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether `self -> to` is an edge of the lifecycle. Staying in the same
    /// non-terminal status is always allowed.
    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, to) {
            (from, to) if *from == to => !from.is_terminal(),
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutionStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown status: {}", s)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// A downloadable artifact produced by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// One tracked backend invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    /// Canonical payload sent to the backend.
    pub input_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<ExecutionFile>>,
    #[serde(default)]
    pub cost_credits: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Seconds spent on the network round trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_time: Option<f64>,
    #[serde(default)]
    pub test_mode: bool,
}

impl ExecutionRecord {
    /// Seconds from creation to completion, preferring the measured round trip.
    pub fn duration_secs(&self) -> Option<f64> {
        self.actual_time.or_else(|| {
            self.completed_at
                .map(|done| (done - self.created_at).num_milliseconds() as f64 / 1000.0)
        })
    }
}

/// Fields supplied when a run is submitted.
#[derive(Debug, Clone, Default)]
pub struct NewExecution {
    pub workflow_id: String,
    pub workflow_name: String,
    pub input_data: Value,
    pub user_id: Option<String>,
    pub test_mode: bool,
}

/// A shallow patch: every `Some` field replaces the stored value.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub progress: Option<u8>,
    pub results: Option<Value>,
    pub files: Option<Vec<ExecutionFile>>,
    pub cost_credits: Option<f64>,
    pub error_message: Option<String>,
    pub actual_time: Option<f64>,
    pub workflow_name: Option<String>,
}

impl ExecutionUpdate {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// True when only display metadata is touched.
    pub fn is_cosmetic(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.results.is_none()
            && self.cost_credits.is_none()
            && self.error_message.is_none()
            && self.actual_time.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
    pub user_id: Option<String>,
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn matches(&self, record: &ExecutionRecord) -> bool {
        self.user_id
            .as_ref()
            .map_or(true, |u| record.user_id.as_ref() == Some(u))
            && self
                .workflow_id
                .as_ref()
                .map_or(true, |w| &record.workflow_id == w)
            && self.status.map_or(true, |s| record.status == s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_cost: f64,
    /// Mean seconds over completed runs, 0 when there are none.
    pub avg_duration: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// ExecutionStore
// ─────────────────────────────────────────────────────────────────────────────

struct StoreInner {
    records: Vec<ExecutionRecord>,
    next_id: u64,
}

/// Owns every execution record of the process.
pub struct ExecutionStore {
    backend: Arc<dyn KeyValueBackend>,
    inner: Mutex<StoreInner>,
}

impl ExecutionStore {
    /// Loads persisted records. Missing or unreadable data yields an empty store.
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        let records = match read_records(backend.as_ref()) {
            Ok(records) => records,
            Err(e) => {
                warn!("[STORE] Failed to load executions, starting empty: {}", e);
                Vec::new()
            }
        };
        let next_id = reseed_id(&records);

        info!(
            "[STORE] Loaded {} execution(s), next id {}",
            records.len(),
            format_id(next_id)
        );

        Self {
            backend,
            inner: Mutex::new(StoreInner { records, next_id }),
        }
    }

    /// An ephemeral store backed by memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>, AppError> {
        self.inner
            .lock()
            .map_err(|_| AppError::Storage("Execution store lock poisoned".into()))
    }

    /// Locks the store and re-reads the backend, so records written by
    /// another process (a `cancel` from a second shell) are seen before any
    /// read or lifecycle check.
    fn synced(&self) -> Result<MutexGuard<'_, StoreInner>, AppError> {
        let mut inner = self.lock()?;
        let records = read_records(self.backend.as_ref())?;
        inner.next_id = inner.next_id.max(reseed_id(&records));
        inner.records = records;
        Ok(inner)
    }

    fn persist(&self, records: &[ExecutionRecord]) -> Result<(), AppError> {
        let json = serde_json::to_string(records)
            .map_err(|e| AppError::Storage(format!("Failed to serialize executions: {e}")))?;
        self.backend.save(STORAGE_KEY, &json)
    }

    pub fn create(&self, new: NewExecution) -> Result<ExecutionRecord, AppError> {
        let mut inner = self.synced()?;

        let record = ExecutionRecord {
            id: format_id(inner.next_id),
            workflow_id: new.workflow_id,
            workflow_name: new.workflow_name,
            status: ExecutionStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            progress: 0,
            input_data: new.input_data,
            results: None,
            files: None,
            cost_credits: 0.0,
            error_message: None,
            user_id: new.user_id,
            actual_time: None,
            test_mode: new.test_mode,
        };

        let mut next = inner.records.clone();
        next.push(record.clone());
        self.persist(&next)?;
        inner.records = next;
        inner.next_id += 1;

        info!(
            "[STORE] Created {} for workflow {}",
            record.id, record.workflow_id
        );
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<Option<ExecutionRecord>, AppError> {
        let inner = self.synced()?;
        Ok(inner.records.iter().find(|r| r.id == id).cloned())
    }

    /// Merges `update` into the record. Returns `None` for an unknown id.
    ///
    /// # Errors
    ///
    /// - `RecordFinalized` when a terminal record would change beyond cosmetic fields.
    /// - `InvalidTransition` when the status change is not a lifecycle edge.
    pub fn update(
        &self,
        id: &str,
        update: ExecutionUpdate,
    ) -> Result<Option<ExecutionRecord>, AppError> {
        let mut inner = self.synced()?;

        let Some(index) = inner.records.iter().position(|r| r.id == id) else {
            return Ok(None);
        };

        let updated = apply_update(&inner.records[index], update, Utc::now())?;

        let mut next = inner.records.clone();
        next[index] = updated.clone();
        self.persist(&next)?;
        inner.records = next;

        Ok(Some(updated))
    }

    /// Newest first; ties on `createdAt` fall back to the id, descending.
    pub fn list(&self, filter: &ExecutionFilter) -> Result<Vec<ExecutionRecord>, AppError> {
        let inner = self.synced()?;
        let mut records: Vec<ExecutionRecord> = inner
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| compare_ids(&b.id, &a.id))
        });
        Ok(records)
    }

    pub fn remove(&self, id: &str) -> Result<bool, AppError> {
        let mut inner = self.synced()?;
        let Some(index) = inner.records.iter().position(|r| r.id == id) else {
            return Ok(false);
        };

        let mut next = inner.records.clone();
        next.remove(index);
        self.persist(&next)?;
        inner.records = next;

        info!("[STORE] Removed {}", id);
        Ok(true)
    }

    pub fn stats(&self, filter: &ExecutionFilter) -> Result<ExecutionStats, AppError> {
        let inner = self.synced()?;
        let mut stats = ExecutionStats::default();
        let mut durations = Vec::new();

        for record in inner.records.iter().filter(|r| filter.matches(r)) {
            stats.total += 1;
            stats.total_cost += record.cost_credits;
            match record.status {
                ExecutionStatus::Queued => stats.queued += 1,
                ExecutionStatus::Running => stats.running += 1,
                ExecutionStatus::Completed => {
                    stats.completed += 1;
                    if let Some(secs) = record.duration_secs() {
                        durations.push(secs);
                    }
                }
                ExecutionStatus::Failed => stats.failed += 1,
                ExecutionStatus::Cancelled => stats.cancelled += 1,
            }
        }

        if !durations.is_empty() {
            stats.avg_duration = durations.iter().sum::<f64>() / durations.len() as f64;
        }
        Ok(stats)
    }

    /// Creates a fresh queued record from a previous run's inputs.
    pub fn retry(&self, id: &str) -> Result<ExecutionRecord, AppError> {
        let source = self
            .get(id)?
            .ok_or_else(|| AppError::NotFound(format!("Execution {}", id)))?;

        let record = self.create(NewExecution {
            workflow_id: source.workflow_id,
            workflow_name: source.workflow_name,
            input_data: source.input_data,
            user_id: source.user_id,
            test_mode: source.test_mode,
        })?;
        info!("[STORE] Retry of {} created as {}", id, record.id);
        Ok(record)
    }

    // ── Lifecycle helpers ────────────────────────────────────────────────────

    pub fn begin(&self, id: &str) -> Result<ExecutionRecord, AppError> {
        self.update_existing(id, ExecutionUpdate::status(ExecutionStatus::Running))
    }

    pub fn succeed(
        &self,
        id: &str,
        results: Value,
        cost_credits: f64,
        actual_time: f64,
    ) -> Result<ExecutionRecord, AppError> {
        self.update_existing(
            id,
            ExecutionUpdate {
                status: Some(ExecutionStatus::Completed),
                results: Some(results),
                cost_credits: Some(cost_credits),
                actual_time: Some(actual_time),
                ..Default::default()
            },
        )
    }

    pub fn fail(
        &self,
        id: &str,
        message: impl Into<String>,
        actual_time: Option<f64>,
    ) -> Result<ExecutionRecord, AppError> {
        self.update_existing(
            id,
            ExecutionUpdate {
                status: Some(ExecutionStatus::Failed),
                error_message: Some(message.into()),
                actual_time,
                ..Default::default()
            },
        )
    }

    pub fn cancel(&self, id: &str) -> Result<ExecutionRecord, AppError> {
        self.update_existing(id, ExecutionUpdate::status(ExecutionStatus::Cancelled))
    }

    fn update_existing(
        &self,
        id: &str,
        update: ExecutionUpdate,
    ) -> Result<ExecutionRecord, AppError> {
        self.update(id, update)?
            .ok_or_else(|| AppError::NotFound(format!("Execution {}", id)))
    }
}

/// Applies a patch to a copy of `record`, enforcing the lifecycle.
fn apply_update(
    record: &ExecutionRecord,
    update: ExecutionUpdate,
    now: DateTime<Utc>,
) -> Result<ExecutionRecord, AppError> {
    let from = record.status;

    if from.is_terminal() && !update.is_cosmetic() {
        return Err(AppError::RecordFinalized {
            id: record.id.clone(),
        });
    }

    let to = update.status.unwrap_or(from);
    if !from.is_terminal() && !from.can_transition_to(to) {
        return Err(AppError::InvalidTransition {
            id: record.id.clone(),
            from,
            to,
        });
    }

    let mut next = record.clone();
    next.status = to;

    if let Some(progress) = update.progress {
        let progress = progress.min(100);
        if to == ExecutionStatus::Running && progress < record.progress {
            debug!(
                "[STORE] Ignoring progress {} < {} for {}",
                progress, record.progress, record.id
            );
        } else {
            next.progress = progress;
        }
    }
    if let Some(results) = update.results {
        next.results = Some(results);
    }
    if let Some(files) = update.files {
        next.files = Some(files);
    }
    if let Some(cost) = update.cost_credits {
        next.cost_credits = cost.max(0.0);
    }
    if let Some(message) = update.error_message {
        next.error_message = Some(message);
    }
    if let Some(secs) = update.actual_time {
        next.actual_time = Some(secs);
    }
    if let Some(name) = update.workflow_name {
        next.workflow_name = name;
    }

    if to.is_terminal() && !from.is_terminal() {
        next.completed_at = Some(now);
        if to == ExecutionStatus::Completed {
            next.progress = 100;
        }
        info!("[STORE] {} {} -> {}", record.id, from, to);
    } else if to != from {
        info!("[STORE] {} {} -> {}", record.id, from, to);
    }

    Ok(next)
}

/// Reads the persisted collection. Backend failures are errors; missing or
/// malformed data is an empty collection.
fn read_records(backend: &dyn KeyValueBackend) -> Result<Vec<ExecutionRecord>, AppError> {
    let Some(raw) = backend.load(STORAGE_KEY)? else {
        return Ok(Vec::new());
    };

    match serde_json::from_str(&raw) {
        Ok(records) => Ok(records),
        Err(e) => {
            warn!("[STORE] Stored executions are malformed, treating as empty: {}", e);
            Ok(Vec::new())
        }
    }
}

fn reseed_id(records: &[ExecutionRecord]) -> u64 {
    records
        .iter()
        .filter_map(|r| id_number(&r.id))
        .max()
        .map_or(1, |max| max + 1)
}

fn format_id(n: u64) -> String {
    format!("{}{:06}", ID_PREFIX, n)
}

fn id_number(id: &str) -> Option<u64> {
    id.strip_prefix(ID_PREFIX)?.parse().ok()
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (id_number(a), id_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
