//! Application state shared by every command.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::info;

use crate::backend::{LoggingMode, WorkflowClient};
use crate::collaborators::{CreditLedger, SessionProvider, StaticSession, UnmeteredLedger};
use crate::commands::executions::CancellationTokens;
use crate::config::{AppConfig, StorageKind};
use crate::error::AppError;
use crate::storage::{ExecutionStore, FileBackend, KeyValueBackend, MemoryBackend, SqliteBackend};

// ─────────────────────────────────────────────────────────────────────────────
// Application State
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a command needs, built once per process and shared as
/// `Arc<AppState>`.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<ExecutionStore>,
    pub client: WorkflowClient,
    /// Tokens of runs currently in flight, keyed by execution id.
    pub cancel_tokens: CancellationTokens,
    pub session: Arc<dyn SessionProvider>,
    pub ledger: Arc<dyn CreditLedger>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<ExecutionStore>,
        client: WorkflowClient,
        session: Arc<dyn SessionProvider>,
        ledger: Arc<dyn CreditLedger>,
    ) -> Self {
        Self {
            config,
            store,
            client,
            cancel_tokens: CancellationTokens::new(),
            session,
            ledger,
        }
    }

    /// Opens the configured storage backend and builds the HTTP client.
    /// The session is anonymous and credits are unmetered.
    pub async fn from_config(config: AppConfig) -> Result<Self, AppError> {
        let backend: Arc<dyn KeyValueBackend> = match config.storage {
            StorageKind::Sqlite => {
                let db = SqliteBackend::init(config.db_path()).await?;
                db.health_check().await?;
                Arc::new(db)
            }
            StorageKind::File => Arc::new(FileBackend::new(config.data_dir.clone())?),
            StorageKind::Memory => Arc::new(MemoryBackend::new()),
        };
        info!(
            "[STORE] Using {:?} storage under {}",
            config.storage,
            config.data_dir.display()
        );

        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from);
        let logging_mode = if config.log_query_params {
            LoggingMode::PathAndQueryRedacted
        } else {
            LoggingMode::PathOnly
        };
        let client = WorkflowClient::new(api_key)?.with_logging_mode(logging_mode);

        Ok(Self::new(
            config,
            Arc::new(ExecutionStore::new(backend)),
            client,
            Arc::new(StaticSession::anonymous()),
            Arc::new(UnmeteredLedger),
        ))
    }

    pub fn with_session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = session;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn CreditLedger>) -> Self {
        self.ledger = ledger;
        self
    }
}
