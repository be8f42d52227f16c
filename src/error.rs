use serde::Serialize;
use thiserror::Error;

use crate::storage::ExecutionStatus;

/// Patterns (lowercase) that indicate sensitive data not safe for UI display.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "api_key",
    "access_token",
    "client_secret",
    "authorization:",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for UI display.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// User-friendly error presentation for the front end.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPresentation {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Input ─────────────────────────────────────────────────────────────────
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    // ── Transport ─────────────────────────────────────────────────────────────
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out after {secs} seconds")]
    Timeout { secs: u64 },

    #[error("HTTP error! status: {status} - {body}")]
    BackendStatus { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    // ── Executions ────────────────────────────────────────────────────────────
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Execution {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Execution {id} is finalized")]
    RecordFinalized { id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Insufficient credits: need {required:.2}, have {available:.2}")]
    InsufficientCredits { required: f64, available: f64 },

    // ── Storage / Config ──────────────────────────────────────────────────────
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Creates a `MissingField` error for the named input.
    pub fn missing(field: impl Into<String>) -> Self {
        AppError::MissingField {
            field: field.into(),
        }
    }

    /// Converts the error into a user-friendly presentation suitable for display.
    /// Never leaks secrets, tokens, or API keys.
    pub fn to_presentation(&self) -> ErrorPresentation {
        match self {
            // ── Input ─────────────────────────────────────────────────────────
            AppError::MissingField { field } => ErrorPresentation {
                title: "Missing Input".into(),
                message: format!("The field '{}' is required and cannot be empty.", field),
                action: Some("Fill in the field and submit again".into()),
            },

            AppError::InvalidInput(msg) => ErrorPresentation {
                title: "Invalid Input".into(),
                message: sanitize_message(msg, "One of the inputs is invalid."),
                action: Some("Check your inputs and try again".into()),
            },

            AppError::UnknownWorkflow(id) => ErrorPresentation {
                title: "Unknown Workflow".into(),
                message: format!("No workflow named '{}' is configured.", id),
                action: Some("Check the workflow id in your configuration".into()),
            },

            // ── Transport ─────────────────────────────────────────────────────
            AppError::ConnectionFailed(_) => ErrorPresentation {
                title: "Connection Failed".into(),
                message: "Could not reach the processing backend. Please check your connection."
                    .into(),
                action: Some("Check network and retry".into()),
            },

            AppError::Timeout { secs } => ErrorPresentation {
                title: "Request Timed Out".into(),
                message: format!("The backend did not answer within {} seconds.", secs),
                action: Some("Retry the execution".into()),
            },

            AppError::BackendStatus { status, body } => ErrorPresentation {
                title: "Backend Error".into(),
                message: sanitize_message(
                    &format!("The backend answered with status {}: {}", status, body),
                    "The backend rejected the request.",
                ),
                action: Some("Review the error and retry".into()),
            },

            AppError::InvalidResponse(_) => ErrorPresentation {
                title: "Unreadable Response".into(),
                message: "The backend response could not be read as JSON.".into(),
                action: Some("Retry the execution".into()),
            },

            // ── Executions ────────────────────────────────────────────────────
            AppError::NotFound(msg) => ErrorPresentation {
                title: "Not Found".into(),
                message: sanitize_message(msg, "The requested item does not exist."),
                action: None,
            },

            AppError::InvalidTransition { from, to, .. } => ErrorPresentation {
                title: "Invalid Status Change".into(),
                message: format!("An execution cannot move from {} to {}.", from, to),
                action: None,
            },

            AppError::RecordFinalized { .. } => ErrorPresentation {
                title: "Execution Finished".into(),
                message: "This execution has already finished and can no longer change.".into(),
                action: Some("Retry to start a new execution".into()),
            },

            AppError::Cancelled => ErrorPresentation {
                title: "Cancelled".into(),
                message: "The operation was cancelled.".into(),
                action: None,
            },

            AppError::InsufficientCredits { required, available } => ErrorPresentation {
                title: "Not Enough Credits".into(),
                message: format!(
                    "This run needs {:.2} credits but only {:.2} are available.",
                    required, available
                ),
                action: Some("Top up credits or enable preview mode".into()),
            },

            // ── Storage / Config ──────────────────────────────────────────────
            AppError::Storage(_) => ErrorPresentation {
                title: "Storage Error".into(),
                message: "Execution history could not be read or written.".into(),
                action: Some("Check the data directory permissions".into()),
            },

            AppError::Export(msg) => ErrorPresentation {
                title: "Export Failed".into(),
                message: sanitize_message(msg, "The export could not be written."),
                action: Some("Check the output directory and try again".into()),
            },

            AppError::Config(msg) => ErrorPresentation {
                title: "Configuration Error".into(),
                message: sanitize_message(msg, "The configuration file is invalid."),
                action: Some("Fix the configuration file".into()),
            },

            // ── Generic ───────────────────────────────────────────────────────
            AppError::Internal(_) => ErrorPresentation {
                title: "Unexpected Error".into(),
                message: "Something went wrong. Please try again.".into(),
                action: Some("Try again".into()),
            },
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_presentation().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns all AppError variants for exhaustive testing.
    fn all_variants() -> Vec<AppError> {
        vec![
            // Input
            AppError::missing("csv_data"),
            AppError::InvalidInput("bad column".into()),
            AppError::UnknownWorkflow("nope".into()),
            // Transport
            AppError::ConnectionFailed("refused".into()),
            AppError::Timeout { secs: 30 },
            AppError::BackendStatus {
                status: 500,
                body: "boom".into(),
            },
            AppError::InvalidResponse("expected value".into()),
            // Executions
            AppError::NotFound("exec_000001".into()),
            AppError::InvalidTransition {
                id: "exec_000001".into(),
                from: ExecutionStatus::Completed,
                to: ExecutionStatus::Running,
            },
            AppError::RecordFinalized {
                id: "exec_000001".into(),
            },
            AppError::Cancelled,
            AppError::InsufficientCredits {
                required: 2.0,
                available: 1.0,
            },
            // Storage / Config
            AppError::Storage("disk full".into()),
            AppError::Export("no dir".into()),
            AppError::Config("bad toml".into()),
            // Generic
            AppError::Internal("something broke".into()),
        ]
    }

    #[test]
    fn all_variants_have_nonempty_title_and_message() {
        for variant in all_variants() {
            let presentation = variant.to_presentation();
            assert!(
                !presentation.title.trim().is_empty(),
                "Empty title for {:?}",
                variant
            );
            assert!(
                !presentation.message.trim().is_empty(),
                "Empty message for {:?}",
                variant
            );
        }
    }

    #[test]
    fn missing_field_names_the_field() {
        let err = AppError::missing("keywords");
        assert_eq!(err.to_string(), "Missing required field: keywords");
        assert!(err.to_presentation().message.contains("keywords"));
    }

    #[test]
    fn backend_status_display_preserves_body() {
        let err = AppError::BackendStatus {
            status: 502,
            body: "upstream exploded".into(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP error! status: 502 - upstream exploded"
        );
    }

    #[test]
    fn serialization_produces_valid_json_with_required_fields() {
        for variant in all_variants() {
            let json = serde_json::to_string(&variant)
                .unwrap_or_else(|_| panic!("Failed to serialize {:?}", variant));

            let parsed: serde_json::Value = serde_json::from_str(&json)
                .unwrap_or_else(|_| panic!("Failed to parse JSON for {:?}", variant));

            assert!(parsed.get("title").is_some(), "{:?} missing 'title'", variant);
            assert!(parsed.get("message").is_some(), "{:?} missing 'message'", variant);
            assert!(parsed.get("action").is_some(), "{:?} missing 'action'", variant);
        }
    }

    #[test]
    fn no_secret_leakage_in_presentation() {
        let test_cases: Vec<(&str, AppError)> = vec![
            (
                "BackendStatus",
                AppError::BackendStatus {
                    status: 401,
                    body: "Authorization: Bearer abc123".into(),
                },
            ),
            ("InvalidInput", AppError::InvalidInput("api_key=xyz".into())),
            ("Config", AppError::Config("access_token missing".into())),
            ("Internal", AppError::Internal("client_secret leaked".into())),
        ];

        for (label, variant) in test_cases {
            let presentation = variant.to_presentation();
            let output_lower = format!(
                "{} {} {}",
                presentation.title,
                presentation.message,
                presentation.action.as_deref().unwrap_or("")
            )
            .to_ascii_lowercase();

            for pattern in SENSITIVE_PATTERNS {
                assert!(
                    !output_lower.contains(pattern),
                    "{} presentation contains sensitive pattern",
                    label
                );
            }
        }
    }
}
