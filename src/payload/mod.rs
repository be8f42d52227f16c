//! Canonical request payloads for the processing backend.
//!
//! Every builder is pure and deterministic: the same inputs and options always
//! produce the same JSON. Required structured inputs are validated here, before
//! any execution record exists or any request is sent.

pub mod crawl;
pub mod modes;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::AppError;
use crate::tabular::csv_parser::{split_lines, ParsedTable};
use crate::tabular::view::display_string;

pub use crawl::{build_crawl_payload, CrawlTask};
pub use modes::{build_payload, LoopMode};

/// Free-form form values keyed by field name, as entered by the user.
pub type RawInputs = Map<String, Value>;

/// Default number of rows sent when previewing a table-oriented run.
pub const DEFAULT_PREVIEW_ROWS: usize = 2;

/// Default backend batch size for table-oriented runs.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Processing options shared by every builder.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    /// Preview run: only the first few rows/entries are sent.
    pub test_mode: bool,
    pub enable_google_search: bool,
    /// Callback URL, embedded under `config.webhook_url` only when non-blank.
    pub webhook_url: Option<String>,
    pub batch_size: usize,
    /// Column subset for table-oriented modes. Empty means all headers.
    pub selected_columns: Vec<String>,
    pub max_preview_rows: usize,
    /// Pre-parsed table. When absent, the `csv_data` input is parsed instead.
    pub parsed_table: Option<ParsedTable>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            test_mode: false,
            enable_google_search: false,
            webhook_url: None,
            batch_size: DEFAULT_BATCH_SIZE,
            selected_columns: Vec::new(),
            max_preview_rows: DEFAULT_PREVIEW_ROWS,
            parsed_table: None,
        }
    }
}

/// How a configured workflow turns inputs into a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowRequest {
    /// Row-by-row processing of a table or list, in one of the loop modes.
    LoopOverRows { mode: LoopMode },
    /// One of the crawl tasks.
    Crawl { task: CrawlTask },
    /// Inputs are forwarded as-is with the processing flags added.
    Passthrough,
}

impl WorkflowRequest {
    /// Builds the canonical payload for this workflow.
    pub fn build(&self, inputs: &RawInputs, options: &BuildOptions) -> Result<Value, AppError> {
        match self {
            WorkflowRequest::LoopOverRows { mode } => build_payload(*mode, inputs, options),
            WorkflowRequest::Crawl { task } => build_crawl_payload(*task, inputs, options),
            WorkflowRequest::Passthrough => Ok(build_passthrough_payload(inputs, options)),
        }
    }
}

/// Copies the raw inputs and adds the processing flags.
pub fn build_passthrough_payload(inputs: &RawInputs, options: &BuildOptions) -> Value {
    let mut payload = inputs.clone();
    payload.insert("test_mode".into(), json!(options.test_mode));
    payload.insert(
        "enable_google_search".into(),
        json!(options.enable_google_search),
    );
    Value::Object(payload)
}

/// Adds `config.webhook_url` when a non-blank callback URL is configured.
/// The key is omitted entirely otherwise.
pub(crate) fn attach_webhook(payload: &mut Map<String, Value>, options: &BuildOptions) {
    if let Some(url) = options.webhook_url.as_deref().map(str::trim) {
        if !url.is_empty() {
            payload.insert("config".into(), json!({ "webhook_url": url }));
        }
    }
}

/// Reads a list-like input: newline-delimited text or a JSON array.
/// Entries are trimmed, blanks dropped, order preserved.
pub(crate) fn list_input(inputs: &RawInputs, field: &str) -> Vec<String> {
    match inputs.get(field) {
        Some(Value::String(text)) => split_lines(text),
        Some(Value::Array(items)) => items
            .iter()
            .flat_map(|item| split_lines(&display_string(item)))
            .collect(),
        _ => Vec::new(),
    }
}

/// Reads a scalar input as trimmed text. Absent or null yields `None`.
pub(crate) fn text_input(inputs: &RawInputs, field: &str) -> Option<String> {
    match inputs.get(field) {
        None | Some(Value::Null) => None,
        Some(value) => Some(display_string(value).trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(value: Value) -> RawInputs {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn passthrough_adds_flags() {
        let options = BuildOptions {
            test_mode: true,
            ..Default::default()
        };
        let payload = build_passthrough_payload(&inputs(json!({"topic": "rust"})), &options);
        assert_eq!(
            payload,
            json!({"topic": "rust", "test_mode": true, "enable_google_search": false})
        );
    }

    #[test]
    fn webhook_is_omitted_when_blank() {
        let mut payload = Map::new();
        let options = BuildOptions {
            webhook_url: Some("   ".into()),
            ..Default::default()
        };
        attach_webhook(&mut payload, &options);
        assert!(!payload.contains_key("config"));
    }

    #[test]
    fn list_input_accepts_text_and_arrays() {
        let raw = inputs(json!({"a": " x \n\n y ", "b": ["p", " q ", ""], "c": 5}));
        assert_eq!(list_input(&raw, "a"), vec!["x", "y"]);
        assert_eq!(list_input(&raw, "b"), vec!["p", "q"]);
        assert!(list_input(&raw, "c").is_empty());
        assert!(list_input(&raw, "missing").is_empty());
    }

    #[test]
    fn workflow_request_deserializes_from_tagged_form() {
        let loop_req: WorkflowRequest =
            serde_json::from_value(json!({"kind": "loop_over_rows", "mode": "vc-analyst"}))
                .expect("loop");
        assert_eq!(
            loop_req,
            WorkflowRequest::LoopOverRows {
                mode: LoopMode::VcAnalyst
            }
        );

        let crawl_req: WorkflowRequest =
            serde_json::from_value(json!({"kind": "crawl", "task": "gmaps"})).expect("crawl");
        assert_eq!(
            crawl_req,
            WorkflowRequest::Crawl {
                task: CrawlTask::Gmaps
            }
        );
    }
}
