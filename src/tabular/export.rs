//! CSV and JSON exports of the current view, plus artifact files on disk.
//!
//! Exports always read the filtered and sorted rows of a [`TableView`],
//! never the raw table, so what the user downloads matches what they see.

use std::io::Write;
use std::path::Path;

use chrono::Utc;
use csv::{QuoteStyle, Terminator, WriterBuilder};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::normalizer::ResultCounts;
use super::view::{display_string, TableView};
use crate::error::AppError;
use crate::storage::{AtomicFileWriter, ExecutionFile};

pub const CSV_MIME: &str = "text/csv";
pub const JSON_MIME: &str = "application/json";

/// Metadata envelope written ahead of the rows in a JSON export.
#[derive(Debug, Clone, Serialize)]
pub struct ExportMetadata {
    pub total_rows: usize,
    pub filtered_rows: usize,
    pub columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_counts: Option<ResultCounts>,
}

#[derive(Debug, Serialize)]
struct JsonExport<'a> {
    title: &'a str,
    metadata: ExportMetadata,
    results: Vec<&'a Map<String, Value>>,
}

/// Serializes the view as CSV: a header row, then one line per visible row.
///
/// A cell is quoted (with inner quotes doubled) only when it contains a
/// comma, a quote, or a line break. The one exception is a row made of a
/// single empty cell, written as `""` so it is not an empty line; the parser
/// reads it back as an empty cell.
pub fn to_csv(view: &TableView) -> Result<String, AppError> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .terminator(Terminator::Any(b'\n'))
        .flexible(true)
        .from_writer(Vec::new());

    writer
        .write_record(view.columns())
        .map_err(|e| AppError::Export(format!("Failed to write CSV header: {e}")))?;

    for row in view.processed_rows() {
        let cells: Vec<String> = view
            .columns()
            .iter()
            .map(|column| row.get(column).map(display_string).unwrap_or_default())
            .collect();
        writer
            .write_record(&cells)
            .map_err(|e| AppError::Export(format!("Failed to write CSV row: {e}")))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::Export(format!("Failed to flush CSV writer: {}", e.error())))?;

    String::from_utf8(bytes).map_err(|e| AppError::Export(format!("CSV is not UTF-8: {e}")))
}

/// Serializes the view as pretty JSON with a title and metadata envelope.
pub fn to_json(
    view: &TableView,
    title: &str,
    backend_counts: Option<ResultCounts>,
) -> Result<String, AppError> {
    let results = view.processed_rows();
    let export = JsonExport {
        title,
        metadata: ExportMetadata {
            total_rows: view.table().rows.len(),
            filtered_rows: results.len(),
            columns: view.columns().to_vec(),
            backend_counts,
        },
        results,
    };

    serde_json::to_string_pretty(&export)
        .map_err(|e| AppError::Export(format!("Failed to serialize JSON export: {e}")))
}

/// `<title>_results.<ext>` with the title lowercased and whitespace runs
/// collapsed to `_`.
pub fn file_name_for_title(title: &str, ext: &str) -> String {
    let slug = title
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    format!("{}_results.{}", slug, ext)
}

/// `<workflow>_<executionId>.csv` for per-execution exports.
pub fn file_name_for_execution(workflow_id: &str, execution_id: &str) -> String {
    format!("{}_{}.csv", workflow_id, execution_id)
}

/// Writes an artifact atomically into `dir` and describes it.
pub fn write_artifact(
    dir: &Path,
    name: &str,
    mime_type: &str,
    contents: &[u8],
) -> Result<ExecutionFile, AppError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| AppError::Export(format!("Failed to create artifact directory: {e}")))?;

    let final_path = dir.join(name);
    let mut writer = AtomicFileWriter::new(&final_path)?;
    writer
        .write_all(contents)
        .map_err(|e| AppError::Export(format!("Failed to write {}: {e}", name)))?;
    let path = writer.finish()?;

    Ok(ExecutionFile {
        id: format!("file_{}", Uuid::new_v4().simple()),
        name: name.to_string(),
        mime_type: mime_type.to_string(),
        size: contents.len() as u64,
        path,
        created_at: Utc::now(),
    })
}
