//! Viewing and exporting the results of a finished execution.

use std::path::Path;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::error::AppError;
use crate::state::AppState;
use crate::storage::{ExecutionFile, ExecutionRecord};
use crate::tabular::export::{self, CSV_MIME, JSON_MIME};
use crate::tabular::{
    csv_parser, normalize, NormalizedTable, ParsedTable, ResultCounts, TableView, ViewState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(AppError::InvalidInput(format!(
                "Unknown export format: {}",
                other
            ))),
        }
    }
}

fn record_with_results(state: &AppState, id: &str) -> Result<ExecutionRecord, AppError> {
    let record = state
        .store
        .get(id)?
        .ok_or_else(|| AppError::NotFound(format!("Execution {}", id)))?;
    if record.results.is_none() {
        return Err(AppError::NotFound(format!("Results for execution {}", id)));
    }
    Ok(record)
}

/// Builds a view over an execution's normalized results.
///
/// `state` carries search/sort/page; a zero page size falls back to the
/// configured one.
pub fn execution_view(
    state: &AppState,
    id: &str,
    mut view_state: ViewState,
) -> Result<TableView, AppError> {
    let record = record_with_results(state, id)?;
    if view_state.page_size == 0 {
        view_state.page_size = state.config.page_size;
    }
    let table = record.results.as_ref().map(normalize).unwrap_or_default();
    Ok(TableView::with_state(table, view_state))
}

/// Exports the filtered and sorted results of an execution into `dest_dir`.
///
/// CSV files are named `<workflow>_<id>.csv`; JSON files are named after the
/// workflow's display name.
pub fn export_execution(
    state: &AppState,
    id: &str,
    format: ExportFormat,
    view_state: ViewState,
    dest_dir: &Path,
) -> Result<ExecutionFile, AppError> {
    let record = record_with_results(state, id)?;
    let view = execution_view(state, id, view_state)?;

    match format {
        ExportFormat::Csv => {
            let csv = export::to_csv(&view)?;
            let name = export::file_name_for_execution(&record.workflow_id, &record.id);
            export::write_artifact(dest_dir, &name, CSV_MIME, csv.as_bytes())
        }
        ExportFormat::Json => {
            let title = if record.workflow_name.is_empty() {
                record.workflow_id.as_str()
            } else {
                record.workflow_name.as_str()
            };
            let counts = record.results.as_ref().and_then(ResultCounts::extract);
            let json = export::to_json(&view, title, counts)?;
            let name = export::file_name_for_title(title, "json");
            export::write_artifact(dest_dir, &name, JSON_MIME, json.as_bytes())
        }
    }
}

/// Parses input text the way a submission would and shows it as a table.
///
/// With `single_header`, a bare list (no commas, first line not the header)
/// becomes one column under that name; keyword files are checked this way.
pub fn preview_input(
    text: &str,
    single_header: Option<&str>,
    view_state: ViewState,
) -> Result<TableView, AppError> {
    let parsed = match single_header {
        Some(header) => csv_parser::parse_with_single_header(text, header),
        None => csv_parser::parse(text),
    }
    .ok_or_else(|| {
        AppError::InvalidInput("Input needs a header line and at least one row".into())
    })?;

    Ok(TableView::with_state(table_from_parsed(&parsed), view_state))
}

fn table_from_parsed(parsed: &ParsedTable) -> NormalizedTable {
    let mut columns: Vec<String> = Vec::new();
    for header in &parsed.headers {
        if !columns.contains(header) {
            columns.push(header.clone());
        }
    }

    let rows = parsed
        .rows
        .iter()
        .map(|row| {
            parsed
                .headers
                .iter()
                .zip(row)
                .map(|(header, cell)| (header.clone(), Value::String(cell.clone())))
                .collect::<Map<String, Value>>()
        })
        .collect();

    NormalizedTable { columns, rows }
}
