//! Command handlers invoked by the CLI host.
//!
//! Each command takes the shared [`AppState`](crate::state::AppState) and
//! returns `Result<_, AppError>`; the host decides how to render it.

pub mod dashboard;
pub mod executions;
pub mod results;

pub use dashboard::{watch_execution, DashboardSnapshot, DashboardSubscription, Subscription};
pub use executions::{
    cancel_execution, join_or_cancel, retry_execution, run_execution, start_execution,
    submit_execution, CancellationTokens, RunHandle, SubmitRequest,
};
pub use results::{execution_view, export_execution, preview_input, ExportFormat};
