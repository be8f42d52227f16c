//! Outbound calls to workflow backends.

pub mod client;

pub use client::{sanitize_url_for_logs, LoggingMode, WorkflowClient};
