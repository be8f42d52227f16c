//! Submitting, running, cancelling and retrying executions.
//!
//! A run is: validate inputs and build the payload, check credits, create a
//! `queued` record, then race the POST against cancellation and a timeout.
//! Every state change goes through the store, so a response that arrives
//! after the user cancelled is rejected there even if the token check missed it.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::error::AppError;
use crate::payload::{BuildOptions, LoopMode, RawInputs};
use crate::state::AppState;
use crate::storage::{ExecutionFile, ExecutionRecord, ExecutionUpdate, NewExecution};
use crate::tabular::export::{self, CSV_MIME, JSON_MIME};
use crate::tabular::{normalize, ParsedTable, TableView};

// ─────────────────────────────────────────────────────────────────────────────
// Cancellation Token Storage
// ─────────────────────────────────────────────────────────────────────────────

/// Cancellation tokens of in-flight runs, keyed by execution id.
pub struct CancellationTokens {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancellationTokens {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, execution_id: String, token: CancellationToken) {
        let mut guard = self.tokens.lock().await;
        guard.insert(execution_id, token);
    }

    pub async fn get(&self, execution_id: &str) -> Option<CancellationToken> {
        let guard = self.tokens.lock().await;
        guard.get(execution_id).cloned()
    }

    pub async fn remove(&self, execution_id: &str) {
        let mut guard = self.tokens.lock().await;
        guard.remove(execution_id);
    }

    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }
}

impl Default for CancellationTokens {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// A user's submission of one workflow run.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub workflow_id: String,
    /// Loop mode for loop-over-rows workflows. Falls back to the workflow default.
    pub mode: Option<LoopMode>,
    pub inputs: RawInputs,
    pub test_mode: bool,
    pub enable_google_search: bool,
    pub selected_columns: Vec<String>,
    pub parsed_table: Option<ParsedTable>,
}

/// Handle of a run spawned in the background.
pub struct RunHandle {
    /// Snapshot of the freshly created `queued` record.
    pub record: ExecutionRecord,
    pub task: JoinHandle<Result<ExecutionRecord, AppError>>,
}

impl RunHandle {
    /// Waits for the run to finish.
    pub async fn join(self) -> Result<ExecutionRecord, AppError> {
        self.task
            .await
            .map_err(|e| AppError::Internal(format!("Execution task failed: {e}")))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Validates, records and starts a run. Returns once the record exists.
///
/// # Errors
///
/// Input errors (`MissingField`, `UnknownWorkflow`, ...) and
/// `InsufficientCredits` are raised before any record is created.
pub async fn start_execution(
    state: Arc<AppState>,
    request: SubmitRequest,
) -> Result<RunHandle, AppError> {
    let workflow = state.config.workflow(&request.workflow_id)?.clone();
    let endpoint = workflow.endpoint_url()?;
    let builder = workflow.request(request.mode)?;

    let options = BuildOptions {
        test_mode: request.test_mode,
        enable_google_search: request.enable_google_search,
        webhook_url: state.config.webhook_url.clone(),
        batch_size: state.config.batch_size,
        selected_columns: request.selected_columns,
        max_preview_rows: state.config.preview_rows,
        parsed_table: request.parsed_table,
    };
    let payload = builder.build(&request.inputs, &options)?;

    let user_id = state.session.current_user_id();
    ensure_credits(&state, user_id.as_deref(), &payload).await?;

    let record = state.store.create(NewExecution {
        workflow_id: request.workflow_id,
        workflow_name: workflow.name,
        input_data: payload,
        user_id,
        test_mode: request.test_mode,
    })?;

    Ok(launch(state, record, endpoint).await)
}

/// Submits a run and waits for its outcome.
pub async fn submit_execution(
    state: Arc<AppState>,
    request: SubmitRequest,
) -> Result<ExecutionRecord, AppError> {
    start_execution(state, request).await?.join().await
}

/// Starts a new run from a previous run's stored payload.
pub async fn retry_execution(state: Arc<AppState>, id: &str) -> Result<RunHandle, AppError> {
    let source = state
        .store
        .get(id)?
        .ok_or_else(|| AppError::NotFound(format!("Execution {}", id)))?;
    let endpoint = state.config.workflow(&source.workflow_id)?.endpoint_url()?;

    ensure_credits(&state, source.user_id.as_deref(), &source.input_data).await?;

    let record = state.store.retry(id)?;
    Ok(launch(state, record, endpoint).await)
}

/// Stops a run and marks its queued or running record cancelled.
///
/// The token is cancelled before the record, so a run that has not reached
/// `begin` yet sees the token and ends with `Cancelled`.
pub async fn cancel_execution(state: &AppState, id: &str) -> Result<ExecutionRecord, AppError> {
    if let Some(token) = state.cancel_tokens.get(id).await {
        token.cancel();
    }
    info!("[EXEC] Cancellation requested for {}", id);

    state.store.cancel(id)
}

/// Waits for a run, cancelling it if `interrupt` resolves first (Ctrl-C in
/// the CLI). Returns the record as it stands once the run has ended.
pub async fn join_or_cancel<F>(
    state: &AppState,
    handle: RunHandle,
    interrupt: F,
) -> Result<ExecutionRecord, AppError>
where
    F: Future<Output = ()>,
{
    let id = handle.record.id.clone();
    let run = handle.join();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = interrupt => {
            warn!("[EXEC] Interrupted, cancelling {}", id);
            match cancel_execution(state, &id).await {
                Ok(record) => {
                    // The run ends with `Cancelled`; the record is the outcome.
                    let _ = run.await;
                    Ok(record)
                }
                // Finished in the meantime.
                Err(AppError::RecordFinalized { .. }) => run.await,
                Err(e) => Err(e),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

async fn launch(state: Arc<AppState>, record: ExecutionRecord, endpoint: Url) -> RunHandle {
    let token = CancellationToken::new();
    state
        .cancel_tokens
        .insert(record.id.clone(), token.clone())
        .await;

    let id = record.id.clone();
    let task = tokio::spawn(async move {
        let result = run_execution(&state, &id, &endpoint, token).await;
        state.cancel_tokens.remove(&id).await;
        result
    });

    RunHandle { record, task }
}

enum Outcome {
    Cancelled,
    TimedOut,
    Response(Result<Value, AppError>),
}

/// Drives one queued record to a terminal status.
pub async fn run_execution(
    state: &AppState,
    id: &str,
    endpoint: &Url,
    cancel: CancellationToken,
) -> Result<ExecutionRecord, AppError> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }

    let record = match state.store.begin(id) {
        Ok(record) => record,
        Err(_) if cancel.is_cancelled() => return Err(AppError::Cancelled),
        Err(e) => return Err(e),
    };
    info!("[EXEC] {} running ({})", id, record.workflow_id);

    let timeout = state.config.request_timeout();
    let start = Instant::now();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Outcome::Cancelled,
        result = tokio::time::timeout(timeout, state.client.post_json(endpoint, &record.input_data)) => {
            match result {
                Ok(response) => Outcome::Response(response),
                Err(_) => Outcome::TimedOut,
            }
        }
    };
    let elapsed = start.elapsed().as_secs_f64();

    match outcome {
        Outcome::Cancelled => {
            info!("[EXEC] {} cancelled after {:.1}s", id, elapsed);
            Err(AppError::Cancelled)
        }
        Outcome::TimedOut => {
            let err = AppError::Timeout {
                secs: timeout.as_secs(),
            };
            record_failure(state, id, &err, elapsed, &cancel)?;
            Err(err)
        }
        Outcome::Response(Err(err)) => {
            record_failure(state, id, &err, elapsed, &cancel)?;
            Err(err)
        }
        Outcome::Response(Ok(response)) => {
            if cancel.is_cancelled() {
                info!("[EXEC] Discarding late response for cancelled {}", id);
                return Err(AppError::Cancelled);
            }
            complete(state, &record, response, elapsed).await
        }
    }
}

fn record_failure(
    state: &AppState,
    id: &str,
    err: &AppError,
    elapsed: f64,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    warn!("[EXEC] {} failed after {:.1}s: {}", id, elapsed, err);
    match state.store.fail(id, err.to_string(), Some(elapsed)) {
        Ok(_) => Ok(()),
        Err(AppError::RecordFinalized { .. }) => Err(AppError::Cancelled),
        Err(e) => Err(e),
    }
}

async fn complete(
    state: &AppState,
    record: &ExecutionRecord,
    response: Value,
    elapsed: f64,
) -> Result<ExecutionRecord, AppError> {
    let table = normalize(&response);
    let cost = state.config.credits_per_row * table.rows.len() as f64;

    let completed = match state.store.succeed(&record.id, response.clone(), cost, elapsed) {
        Ok(completed) => completed,
        Err(AppError::RecordFinalized { .. }) => {
            info!("[EXEC] Discarding late response for finalized {}", record.id);
            return Err(AppError::Cancelled);
        }
        Err(e) => return Err(e),
    };
    info!(
        "[EXEC] {} completed in {:.1}s with {} row(s)",
        record.id,
        elapsed,
        table.rows.len()
    );

    let dir = state.config.artifacts_dir().join(&record.id);
    let files = match write_artifacts(&dir, record, TableView::new(table), &response) {
        Ok(files) => files,
        Err(e) => {
            warn!("[EXEC] Failed to write artifacts for {}: {}", record.id, e);
            Vec::new()
        }
    };

    if let Some(user_id) = record.user_id.as_deref() {
        match state.ledger.deduct(user_id, cost).await {
            Ok(true) => info!("[EXEC] Deducted {:.2} credits from {}", cost, user_id),
            Ok(false) => warn!("[EXEC] Could not deduct {:.2} credits from {}", cost, user_id),
            Err(e) => error!("[EXEC] Credit deduction failed for {}: {}", user_id, e),
        }
    }

    if files.is_empty() {
        return Ok(completed);
    }
    let with_files = state.store.update(
        &record.id,
        ExecutionUpdate {
            files: Some(files),
            ..Default::default()
        },
    )?;
    Ok(with_files.unwrap_or(completed))
}

/// Writes the normalized CSV (when there are rows) and the raw JSON response.
fn write_artifacts(
    dir: &Path,
    record: &ExecutionRecord,
    view: TableView,
    response: &Value,
) -> Result<Vec<ExecutionFile>, AppError> {
    let mut files = Vec::new();
    let csv_name = export::file_name_for_execution(&record.workflow_id, &record.id);

    if !view.table().is_empty() {
        let csv = export::to_csv(&view)?;
        files.push(export::write_artifact(dir, &csv_name, CSV_MIME, csv.as_bytes())?);
    }

    let json_name = Path::new(&csv_name).with_extension("json");
    let json = serde_json::to_string_pretty(response)
        .map_err(|e| AppError::Export(format!("Failed to serialize response: {e}")))?;
    files.push(export::write_artifact(
        dir,
        &json_name.to_string_lossy(),
        JSON_MIME,
        json.as_bytes(),
    )?);

    Ok(files)
}

/// Rough number of units a payload asks the backend to process.
fn payload_units(payload: &Value) -> usize {
    if let Some(rows) = payload.get("data").and_then(Value::as_object) {
        return rows.len();
    }
    ["keywords", "websites", "companies", "urls", "locations"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_array))
        .map_or(1, Vec::len)
}

async fn ensure_credits(
    state: &AppState,
    user_id: Option<&str>,
    payload: &Value,
) -> Result<(), AppError> {
    let Some(user_id) = user_id else {
        return Ok(());
    };

    let required = state.config.credits_per_row * payload_units(payload) as f64;
    let available = state.ledger.balance(user_id).await?;
    if available < required {
        return Err(AppError::InsufficientCredits {
            required,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::WorkflowClient;
    use crate::collaborators::{CreditLedger, InMemoryCreditLedger, StaticSession, UnmeteredLedger};
    use crate::config::AppConfig;
    use crate::storage::{ExecutionStatus, ExecutionStore};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer, dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::from_toml_str(&format!(
            r#"
            [workflows.loop-over-rows]
            name = "Loop Over Rows"
            endpoint = "{}/loop"
            kind = "loop_over_rows"
            "#,
            server.uri()
        ))
        .expect("config");
        config.data_dir = dir.path().to_path_buf();
        config
    }

    fn test_state(config: AppConfig) -> AppState {
        AppState::new(
            config,
            Arc::new(ExecutionStore::in_memory()),
            WorkflowClient::new(None).expect("client"),
            Arc::new(StaticSession::anonymous()),
            Arc::new(UnmeteredLedger),
        )
    }

    fn csv_request() -> SubmitRequest {
        let inputs = json!({
            "csv_data": "name,city\nAcme,Berlin\nGlobex,Paris",
            "prompt": "Describe"
        });
        SubmitRequest {
            workflow_id: "loop-over-rows".into(),
            mode: Some(LoopMode::Freestyle),
            inputs: inputs.as_object().cloned().expect("object"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn submit_completes_with_results_and_artifacts() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        Mock::given(method("POST"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"row_key": "row_1", "output": "{\"summary\": \"big\"}"},
                    {"row_key": "row_2", "output": "{\"summary\": \"small\"}"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let state = Arc::new(test_state(test_config(&server, &dir)));
        let record = submit_execution(state.clone(), csv_request())
            .await
            .expect("run succeeds");

        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.progress, 100);
        assert!(record.completed_at.is_some());
        assert!(record.actual_time.is_some());
        assert!((record.cost_credits - 0.02).abs() < 1e-9);
        assert_eq!(record.workflow_name, "Loop Over Rows");
        assert_eq!(record.input_data["data"]["row_2"], json!(["Globex", "Paris"]));

        let files = record.files.expect("artifacts recorded");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, format!("loop-over-rows_{}.csv", record.id));
        let csv = std::fs::read_to_string(&files[0].path).expect("csv written");
        assert_eq!(csv, "row_key,summary\nrow_1,big\nrow_2,small\n");
        assert_eq!(files[1].mime_type, JSON_MIME);

        assert_eq!(state.cancel_tokens.len().await, 0);
    }

    #[tokio::test]
    async fn invalid_input_creates_no_record() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        let state = Arc::new(test_state(test_config(&server, &dir)));

        let mut request = csv_request();
        request.inputs.remove("csv_data");
        let err = submit_execution(state.clone(), request)
            .await
            .expect_err("missing table");

        assert!(matches!(err, AppError::MissingField { ref field } if field == "csv_data"));
        assert!(state.store.list(&Default::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        let state = Arc::new(test_state(test_config(&server, &dir)));

        let mut request = csv_request();
        request.workflow_id = "nope".into();
        let err = submit_execution(state, request).await.expect_err("unknown");
        assert!(matches!(err, AppError::UnknownWorkflow(_)));
    }

    #[tokio::test]
    async fn backend_error_marks_record_failed() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model overloaded"))
            .mount(&server)
            .await;

        let state = Arc::new(test_state(test_config(&server, &dir)));
        let handle = start_execution(state.clone(), csv_request()).await.expect("start");
        let id = handle.record.id.clone();
        let err = handle.join().await.expect_err("backend error");
        assert!(matches!(err, AppError::BackendStatus { status: 500, .. }));

        let record = state.store.get(&id).unwrap().expect("exists");
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(
            record.error_message.as_deref(),
            Some("HTTP error! status: 500 - model overloaded")
        );
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn timeout_marks_record_failed() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([]))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let mut config = test_config(&server, &dir);
        config.request_timeout_secs = 1;
        let state = Arc::new(test_state(config));

        let handle = start_execution(state.clone(), csv_request()).await.expect("start");
        let id = handle.record.id.clone();
        let err = handle.join().await.expect_err("timeout");
        assert!(matches!(err, AppError::Timeout { secs: 1 }));

        let record = state.store.get(&id).unwrap().expect("exists");
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(
            record.error_message.as_deref(),
            Some("Request timed out after 1 seconds")
        );
    }

    #[tokio::test]
    async fn cancelled_run_discards_late_response() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"a": 1}]))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let state = Arc::new(test_state(test_config(&server, &dir)));
        let handle = start_execution(state.clone(), csv_request()).await.expect("start");
        let id = handle.record.id.clone();

        // Let the request go out before cancelling.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let cancelled = cancel_execution(&state, &id).await.expect("cancel");
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

        let err = handle.join().await.expect_err("cancelled");
        assert!(matches!(err, AppError::Cancelled));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let record = state.store.get(&id).unwrap().expect("exists");
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.results.is_none());
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn interrupt_cancels_a_waiting_run() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"a": 1}]))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let state = Arc::new(test_state(test_config(&server, &dir)));
        let handle = start_execution(state.clone(), csv_request()).await.expect("start");
        let id = handle.record.id.clone();

        let interrupt = tokio::time::sleep(Duration::from_millis(100));
        let record = join_or_cancel(&state, handle, interrupt).await.expect("cancelled");

        assert_eq!(record.id, id);
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.completed_at.is_some());
        assert_eq!(state.cancel_tokens.len().await, 0);
    }

    #[tokio::test]
    async fn join_without_interrupt_returns_outcome() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"a": 1}])))
            .mount(&server)
            .await;

        let state = Arc::new(test_state(test_config(&server, &dir)));
        let handle = start_execution(state.clone(), csv_request()).await.expect("start");
        let record = join_or_cancel(&state, handle, std::future::pending())
            .await
            .expect("completed");
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_before_begin_ends_run_as_cancelled() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        let state = test_state(test_config(&server, &dir));
        let record = state
            .store
            .create(NewExecution {
                workflow_id: "loop-over-rows".into(),
                input_data: json!({}),
                ..Default::default()
            })
            .expect("create");
        let token = CancellationToken::new();
        state.cancel_tokens.insert(record.id.clone(), token.clone()).await;

        let cancelled = cancel_execution(&state, &record.id).await.expect("cancel");
        assert!(token.is_cancelled());
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

        let endpoint = Url::parse(&format!("{}/loop", server.uri())).expect("url");
        let err = run_execution(&state, &record.id, &endpoint, token)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, AppError::Cancelled));
    }

    #[tokio::test]
    async fn cancelling_a_finished_run_is_rejected() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let state = Arc::new(test_state(test_config(&server, &dir)));
        let record = submit_execution(state.clone(), csv_request()).await.expect("run");
        assert!(record.files.as_ref().map_or(false, |f| f.len() == 1));

        let err = cancel_execution(&state, &record.id).await.expect_err("finalized");
        assert!(matches!(err, AppError::RecordFinalized { .. }));
    }

    #[tokio::test]
    async fn retry_resubmits_stored_payload() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"ok": true}])))
            .mount(&server)
            .await;

        let state = Arc::new(test_state(test_config(&server, &dir)));
        let first = start_execution(state.clone(), csv_request()).await.expect("start");
        let first_id = first.record.id.clone();
        first.join().await.expect_err("first attempt fails");

        let retried = retry_execution(state.clone(), &first_id)
            .await
            .expect("retry")
            .join()
            .await
            .expect("second attempt succeeds");

        assert_ne!(retried.id, first_id);
        assert_eq!(retried.status, ExecutionStatus::Completed);
        let original = state.store.get(&first_id).unwrap().expect("exists");
        assert_eq!(original.status, ExecutionStatus::Failed);
        assert_eq!(retried.input_data, original.input_data);
    }

    #[tokio::test]
    async fn insufficient_credits_block_submission() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        let ledger = Arc::new(InMemoryCreditLedger::new());
        ledger.set_balance("u1", 0.01).await;

        let state = test_state(test_config(&server, &dir))
            .with_session(Arc::new(StaticSession::new(Some("u1".into()))))
            .with_ledger(ledger);
        let state = Arc::new(state);

        let err = submit_execution(state.clone(), csv_request())
            .await
            .expect_err("two rows need 0.02");
        assert!(matches!(err, AppError::InsufficientCredits { .. }));
        assert!(state.store.list(&Default::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn credits_are_deducted_after_success() {
        let server = MockServer::start().await;
        let dir = TempDir::new().expect("temp dir");
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"a": 1}])))
            .mount(&server)
            .await;

        let ledger = Arc::new(InMemoryCreditLedger::new());
        ledger.set_balance("u1", 1.0).await;
        let state = test_state(test_config(&server, &dir))
            .with_session(Arc::new(StaticSession::new(Some("u1".into()))))
            .with_ledger(ledger.clone());
        let state = Arc::new(state);

        let record = submit_execution(state, csv_request()).await.expect("run");
        assert_eq!(record.user_id.as_deref(), Some("u1"));
        assert!((record.cost_credits - 0.01).abs() < 1e-9);

        assert!((ledger.balance("u1").await.unwrap() - 0.99).abs() < 1e-9);
    }

    #[test]
    fn payload_units_counts_rows_and_lists() {
        assert_eq!(payload_units(&json!({"data": {"row_1": [], "row_2": []}})), 2);
        assert_eq!(payload_units(&json!({"keywords": ["a", "b", "c"]})), 3);
        assert_eq!(payload_units(&json!({"topic": "x"})), 1);
    }
}
