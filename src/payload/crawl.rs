//! Crawl workflow payloads: imprint, contacts, logo and Google Maps lookups.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{attach_webhook, list_input, BuildOptions, RawInputs};
use crate::error::AppError;

/// Entries kept per list in test mode.
const PREVIEW_ENTRIES: usize = 3;
const GMAPS_PREVIEW_ENTRIES: usize = 2;

const DEFAULT_LOGO_FORMAT: &str = "png";
const DEFAULT_LOGO_SIZE: &str = "original";
const DEFAULT_MAX_RESULTS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlTask {
    Imprint,
    Contacts,
    Logo,
    Gmaps,
}

impl CrawlTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlTask::Imprint => "imprint",
            CrawlTask::Contacts => "contacts",
            CrawlTask::Logo => "logo",
            CrawlTask::Gmaps => "gmaps",
        }
    }
}

impl fmt::Display for CrawlTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlTask {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "imprint" => Ok(CrawlTask::Imprint),
            "contacts" => Ok(CrawlTask::Contacts),
            "logo" => Ok(CrawlTask::Logo),
            "gmaps" => Ok(CrawlTask::Gmaps),
            other => Err(AppError::InvalidInput(format!(
                "Unsupported crawl task: {}",
                other
            ))),
        }
    }
}

/// Builds the payload for a crawl task.
///
/// The backends take no task discriminator; each task is routed to its own
/// endpoint, so only the task-specific fields differ.
pub fn build_crawl_payload(
    task: CrawlTask,
    inputs: &RawInputs,
    options: &BuildOptions,
) -> Result<Value, AppError> {
    let mut payload = Map::new();
    payload.insert("test_mode".into(), json!(options.test_mode));
    payload.insert(
        "enable_google_search".into(),
        json!(options.enable_google_search),
    );
    attach_webhook(&mut payload, options);

    match task {
        CrawlTask::Imprint => {
            let websites = required_list(inputs, "websites", options, PREVIEW_ENTRIES)?;
            payload.insert("websites".into(), json!(websites));
        }
        CrawlTask::Contacts => {
            let companies = required_list(inputs, "companies", options, PREVIEW_ENTRIES)?;
            let contact_types = match inputs.get("contact_types") {
                Some(Value::Array(types)) if !types.is_empty() => types.clone(),
                _ => return Err(AppError::missing("contact_types")),
            };
            payload.insert("companies".into(), json!(companies));
            payload.insert("contact_types".into(), Value::Array(contact_types));
        }
        CrawlTask::Logo => {
            let urls = required_list(inputs, "urls", options, PREVIEW_ENTRIES)?;
            payload.insert("urls".into(), json!(urls));
            payload.insert(
                "format".into(),
                truthy(inputs, "format").unwrap_or_else(|| json!(DEFAULT_LOGO_FORMAT)),
            );
            payload.insert(
                "size".into(),
                truthy(inputs, "size").unwrap_or_else(|| json!(DEFAULT_LOGO_SIZE)),
            );
        }
        CrawlTask::Gmaps => {
            let locations = required_list(inputs, "locations", options, GMAPS_PREVIEW_ENTRIES)?;
            let terms = required_list(inputs, "search_terms", options, GMAPS_PREVIEW_ENTRIES)?;
            payload.insert("locations".into(), json!(locations));
            payload.insert("search_terms".into(), json!(terms));
            payload.insert(
                "max_results".into(),
                truthy(inputs, "max_results").unwrap_or_else(|| json!(DEFAULT_MAX_RESULTS)),
            );
        }
    }

    Ok(Value::Object(payload))
}

fn required_list(
    inputs: &RawInputs,
    field: &str,
    options: &BuildOptions,
    preview: usize,
) -> Result<Vec<String>, AppError> {
    let mut entries = list_input(inputs, field);
    if entries.is_empty() {
        return Err(AppError::missing(field));
    }
    if options.test_mode {
        entries.truncate(preview);
    }
    Ok(entries)
}

/// Returns the input unless it is absent, null, false, zero or blank.
fn truthy(inputs: &RawInputs, field: &str) -> Option<Value> {
    let value = inputs.get(field)?;
    let empty = match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    };
    (!empty).then(|| value.clone())
}
