//! Application configuration.
//!
//! Read from TOML. Lookup order: an explicit path (`--config`), then
//! `$ROWLOOP_CONFIG`, then `<data_dir>/config.toml` when it exists, else the
//! built-in defaults. Every field has a default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::AppError;
use crate::payload::{CrawlTask, LoopMode, WorkflowRequest};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ROWLOOP_CONFIG";

const CONFIG_FILE_NAME: &str = "config.toml";
const DB_FILE_NAME: &str = "rowloop.db";
const ARTIFACTS_DIR_NAME: &str = "artifacts";

/// Where execution records are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Sqlite,
    File,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    LoopOverRows,
    Crawl,
    Passthrough,
}

/// One `[workflows.<id>]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkflowDefinition {
    /// Display name stored on execution records.
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_kind")]
    pub kind: WorkflowKind,
    /// Mode used when a loop-over-rows submission names none.
    #[serde(default)]
    pub default_mode: Option<LoopMode>,
    /// Required for crawl workflows.
    #[serde(default)]
    pub task: Option<CrawlTask>,
}

impl WorkflowDefinition {
    pub fn endpoint_url(&self) -> Result<Url, AppError> {
        Url::parse(&self.endpoint)
            .map_err(|e| AppError::Config(format!("Invalid endpoint for {}: {e}", self.name)))
    }

    /// Resolves the payload builder for a submission.
    pub fn request(&self, mode: Option<LoopMode>) -> Result<WorkflowRequest, AppError> {
        match self.kind {
            WorkflowKind::LoopOverRows => Ok(WorkflowRequest::LoopOverRows {
                mode: mode.or(self.default_mode).unwrap_or(LoopMode::Freestyle),
            }),
            WorkflowKind::Crawl => self
                .task
                .map(|task| WorkflowRequest::Crawl { task })
                .ok_or_else(|| {
                    AppError::Config(format!("Crawl workflow {} has no task", self.name))
                }),
            WorkflowKind::Passthrough => Ok(WorkflowRequest::Passthrough),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Upper bound on a single backend round trip.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Rows sent by a test-mode run of a table-oriented workflow.
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_credits_per_row")]
    pub credits_per_row: f64,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Bearer token for workflow backends.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Callback URL embedded in every payload.
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default)]
    pub storage: StorageKind,

    /// Log endpoint query parameters (sensitive values redacted) instead of
    /// the path alone.
    #[serde(default)]
    pub log_query_params: bool,

    #[serde(default = "default_workflows")]
    pub workflows: BTreeMap<String, WorkflowDefinition>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            request_timeout_secs: default_request_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            preview_rows: default_preview_rows(),
            batch_size: default_batch_size(),
            credits_per_row: default_credits_per_row(),
            page_size: default_page_size(),
            api_key: None,
            webhook_url: None,
            storage: StorageKind::default(),
            log_query_params: false,
            workflows: default_workflows(),
        }
    }
}

impl AppConfig {
    /// Loads configuration following the lookup order.
    ///
    /// An explicitly named file (flag or environment) must exist; the default
    /// location is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, AppError> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);

        if let Some(path) = explicit.map(Path::to_path_buf).or(env_path) {
            return Self::from_file(&path);
        }

        let default_path = default_data_dir().join(CONFIG_FILE_NAME);
        if default_path.is_file() {
            return Self::from_file(&default_path);
        }

        debug!("No config file found, using defaults");
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        debug!("Loaded config from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// Parses TOML. Workflow tables are merged over the built-in ones.
    pub fn from_toml_str(text: &str) -> Result<Self, AppError> {
        let mut config: AppConfig =
            toml::from_str(text).map_err(|e| AppError::Config(format!("Invalid TOML: {e}")))?;

        let mut workflows = default_workflows();
        workflows.extend(std::mem::take(&mut config.workflows));
        config.workflows = workflows;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.request_timeout_secs == 0 {
            return Err(AppError::Config("request_timeout_secs must be > 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(AppError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.batch_size == 0 || self.page_size == 0 {
            return Err(AppError::Config(
                "batch_size and page_size must be > 0".into(),
            ));
        }
        if !self.credits_per_row.is_finite() || self.credits_per_row < 0.0 {
            return Err(AppError::Config("credits_per_row must be >= 0".into()));
        }
        if let Some(hook) = self.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Url::parse(hook.trim())
                .map_err(|e| AppError::Config(format!("Invalid webhook_url: {e}")))?;
        }
        for (id, workflow) in &self.workflows {
            workflow.endpoint_url()?;
            if workflow.kind == WorkflowKind::Crawl && workflow.task.is_none() {
                return Err(AppError::Config(format!(
                    "Workflow {} is a crawl workflow without a task",
                    id
                )));
            }
        }
        Ok(())
    }

    pub fn workflow(&self, id: &str) -> Result<&WorkflowDefinition, AppError> {
        self.workflows
            .get(id)
            .ok_or_else(|| AppError::UnknownWorkflow(id.to_string()))
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join(ARTIFACTS_DIR_NAME)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rowloop")
}

fn default_request_timeout_secs() -> u64 {
    // 22 hours: batch runs over large tables are slow.
    22 * 60 * 60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_preview_rows() -> usize {
    crate::payload::DEFAULT_PREVIEW_ROWS
}

fn default_batch_size() -> usize {
    crate::payload::DEFAULT_BATCH_SIZE
}

fn default_credits_per_row() -> f64 {
    0.01
}

fn default_page_size() -> usize {
    crate::tabular::view::DEFAULT_PAGE_SIZE
}

fn default_kind() -> WorkflowKind {
    WorkflowKind::Passthrough
}

fn default_workflows() -> BTreeMap<String, WorkflowDefinition> {
    let crawl = |name: &str, id: &str, task: CrawlTask| {
        (
            id.to_string(),
            WorkflowDefinition {
                name: name.to_string(),
                endpoint: format!("http://localhost:8000/{id}/process"),
                kind: WorkflowKind::Crawl,
                default_mode: None,
                task: Some(task),
            },
        )
    };

    BTreeMap::from([
        (
            "loop-over-rows".to_string(),
            WorkflowDefinition {
                name: "Loop Over Rows".to_string(),
                endpoint: "http://localhost:8000/loop-over-rows/process".to_string(),
                kind: WorkflowKind::LoopOverRows,
                default_mode: Some(LoopMode::Freestyle),
                task: None,
            },
        ),
        crawl("Crawl4Imprint", "crawl4imprint", CrawlTask::Imprint),
        crawl("Crawl4Contacts", "crawl4contacts", CrawlTask::Contacts),
        crawl("Crawl4Logo", "crawl4logo", CrawlTask::Logo),
        crawl("Crawl4Gmaps", "crawl4gmaps", CrawlTask::Gmaps),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_complete() {
        let config = AppConfig::default();
        assert_eq!(config.request_timeout_secs, 79_200);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.preview_rows, 2);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.page_size, 10);
        assert_eq!(config.storage, StorageKind::Sqlite);
        assert!(config.data_dir.ends_with("rowloop"));
        assert_eq!(config.workflows.len(), 5);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn toml_overrides_and_merges_workflows() {
        let config = AppConfig::from_toml_str(
            r#"
            data_dir = "/tmp/rowloop-test"
            request_timeout_secs = 60
            storage = "file"
            credits_per_row = 0.5
            log_query_params = true

            [workflows.loop-over-rows]
            name = "Loop Over Rows"
            endpoint = "https://loop.example.com/process"
            kind = "loop_over_rows"

            [workflows.summarizer]
            name = "Summarizer"
            endpoint = "https://sum.example.com/run"
            "#,
        )
        .expect("parse");

        assert_eq!(config.data_dir, PathBuf::from("/tmp/rowloop-test"));
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.storage, StorageKind::File);
        assert!(config.log_query_params);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/rowloop-test/rowloop.db"));
        assert_eq!(config.workflows.len(), 6);

        let loop_wf = config.workflow("loop-over-rows").unwrap();
        assert_eq!(loop_wf.endpoint, "https://loop.example.com/process");
        assert_eq!(
            loop_wf.request(Some(LoopMode::KeywordKombat)).unwrap(),
            WorkflowRequest::LoopOverRows {
                mode: LoopMode::KeywordKombat
            }
        );

        let custom = config.workflow("summarizer").unwrap();
        assert_eq!(custom.kind, WorkflowKind::Passthrough);
        assert_eq!(custom.request(None).unwrap(), WorkflowRequest::Passthrough);
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let err = AppConfig::from_toml_str(
            r#"
            [workflows.broken]
            name = "Broken"
            endpoint = "not a url"
            "#,
        )
        .expect_err("should fail");
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn crawl_without_task_is_rejected() {
        let err = AppConfig::from_toml_str(
            r#"
            [workflows.crawler]
            name = "Crawler"
            endpoint = "https://crawl.example.com"
            kind = "crawl"
            "#,
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("without a task"));
    }

    #[test]
    fn unknown_workflow_lookup() {
        let config = AppConfig::default();
        assert!(matches!(
            config.workflow("nope"),
            Err(AppError::UnknownWorkflow(_))
        ));
    }

    #[test]
    fn explicit_path_is_loaded() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "page_size = 25\n").expect("write");

        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.page_size, 25);
    }

    #[test]
    fn missing_explicit_path_fails() {
        let dir = TempDir::new().expect("temp dir");
        let err = AppConfig::load(Some(&dir.path().join("absent.toml"))).expect_err("missing");
        assert!(matches!(err, AppError::Config(_)));
    }
}
