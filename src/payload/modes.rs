//! Loop-over-rows payloads.
//!
//! Table-oriented modes (`freestyle`, `vc-analyst`) send selected columns of a
//! parsed table keyed by `row_<n>`. The list-oriented mode (`keyword-kombat`)
//! sends a plain list of keywords plus a few scalar fields.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{attach_webhook, list_input, text_input, BuildOptions, RawInputs};
use crate::error::AppError;
use crate::tabular::csv_parser::{self, ParsedTable};

/// Input field carrying the raw CSV text for table-oriented modes.
pub const CSV_FIELD: &str = "csv_data";

/// Input field carrying the newline-delimited keyword list.
pub const KEYWORDS_FIELD: &str = "keywords";

/// Default name of the keyword placeholder in the backend prompt.
const DEFAULT_KEYWORD_VARIABLE: &str = "keyword";

/// Variant of the loop-over-rows workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopMode {
    Freestyle,
    VcAnalyst,
    KeywordKombat,
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopMode::Freestyle => "freestyle",
            LoopMode::VcAnalyst => "vc-analyst",
            LoopMode::KeywordKombat => "keyword-kombat",
        }
    }

    /// True for modes that take a table plus an instruction.
    pub fn is_table_oriented(&self) -> bool {
        !matches!(self, LoopMode::KeywordKombat)
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoopMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "freestyle" => Ok(LoopMode::Freestyle),
            "vc-analyst" => Ok(LoopMode::VcAnalyst),
            "keyword-kombat" => Ok(LoopMode::KeywordKombat),
            other => Err(AppError::InvalidInput(format!("Unknown mode: {}", other))),
        }
    }
}

/// Builds the canonical loop-over-rows payload for `mode`.
///
/// # Errors
///
/// Returns `AppError::MissingField` when the table (`csv_data`) or the keyword
/// list (`keywords`) is absent or empty after parsing.
pub fn build_payload(
    mode: LoopMode,
    inputs: &RawInputs,
    options: &BuildOptions,
) -> Result<Value, AppError> {
    if mode.is_table_oriented() {
        build_table_payload(mode, inputs, options)
    } else {
        build_keyword_payload(inputs, options)
    }
}

fn build_keyword_payload(inputs: &RawInputs, options: &BuildOptions) -> Result<Value, AppError> {
    let keywords = list_input(inputs, KEYWORDS_FIELD);
    if keywords.is_empty() {
        return Err(AppError::missing(KEYWORDS_FIELD));
    }

    let keyword_variable = text_input(inputs, "keyword_variable")
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_KEYWORD_VARIABLE.to_string());

    let mut payload = Map::new();
    payload.insert("mode".into(), json!(LoopMode::KeywordKombat.as_str()));
    payload.insert("keywords".into(), json!(keywords));
    if let Some(url) = inputs.get("company_url") {
        payload.insert("company_url".into(), url.clone());
    }
    payload.insert("keyword_variable".into(), json!(keyword_variable));
    payload.insert("test_mode".into(), json!(options.test_mode));
    payload.insert(
        "enable_google_search".into(),
        json!(options.enable_google_search),
    );
    attach_webhook(&mut payload, options);

    Ok(Value::Object(payload))
}

fn build_table_payload(
    mode: LoopMode,
    inputs: &RawInputs,
    options: &BuildOptions,
) -> Result<Value, AppError> {
    let parsed;
    let table: &ParsedTable = match &options.parsed_table {
        Some(table) => table,
        None => {
            let text = inputs
                .get(CSV_FIELD)
                .and_then(Value::as_str)
                .unwrap_or_default();
            parsed = csv_parser::parse(text).ok_or_else(|| AppError::missing(CSV_FIELD))?;
            &parsed
        }
    };

    if table.headers.is_empty() || table.rows.is_empty() {
        return Err(AppError::missing(CSV_FIELD));
    }

    let active_headers: Vec<String> = if options.selected_columns.is_empty() {
        table.headers.clone()
    } else {
        options.selected_columns.clone()
    };
    let indices: Vec<usize> = active_headers
        .iter()
        .filter_map(|h| table.column_index(h))
        .collect();

    // Truncate before keying so preview keys stay row_1..row_N.
    let row_limit = if options.test_mode {
        options.max_preview_rows
    } else {
        table.rows.len()
    };

    let mut data = Map::new();
    for (index, row) in table.rows.iter().take(row_limit).enumerate() {
        let values: Vec<Value> = indices
            .iter()
            .map(|&i| row.get(i).map_or(Value::Null, |cell| json!(cell)))
            .collect();
        data.insert(format!("row_{}", index + 1), Value::Array(values));
    }

    let mut payload = Map::new();
    payload.insert("data".into(), Value::Object(data));
    payload.insert("headers".into(), json!(active_headers));
    payload.insert(
        "prompt".into(),
        json!(text_input(inputs, "prompt").unwrap_or_default()),
    );
    if let Some(schema) = inputs.get("output_schema").filter(|v| !v.is_null()) {
        payload.insert("output_schema".into(), schema.clone());
    }
    payload.insert("batch_size".into(), json!(options.batch_size));
    payload.insert(
        "enable_google_search".into(),
        json!(options.enable_google_search),
    );
    payload.insert("test_mode".into(), json!(options.test_mode));
    payload.insert("mode".into(), json!(mode.as_str()));
    attach_webhook(&mut payload, options);

    Ok(Value::Object(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(value: Value) -> RawInputs {
        value.as_object().cloned().expect("object")
    }

    fn five_rows() -> RawInputs {
        inputs(json!({
            "csv_data": "name,stage,city\nA,Seed,Berlin\nB,Series A,Paris\nC,Seed,Rome\nD,Pre-seed,Oslo\nE,Seed,Lima",
            "prompt": "  Classify each startup  "
        }))
    }

    #[test]
    fn preview_keeps_first_two_rows_with_contiguous_keys() {
        let options = BuildOptions {
            test_mode: true,
            ..Default::default()
        };
        let payload = build_payload(LoopMode::Freestyle, &five_rows(), &options).expect("build");

        let data = payload["data"].as_object().expect("data map");
        let keys: Vec<&String> = data.keys().collect();
        assert_eq!(keys, vec!["row_1", "row_2"]);
        assert_eq!(data["row_1"], json!(["A", "Seed", "Berlin"]));
        assert_eq!(payload["test_mode"], json!(true));
    }

    #[test]
    fn full_run_keys_every_row() {
        let payload =
            build_payload(LoopMode::VcAnalyst, &five_rows(), &BuildOptions::default()).expect("build");

        assert_eq!(payload["data"].as_object().map(Map::len), Some(5));
        assert_eq!(payload["data"]["row_5"], json!(["E", "Seed", "Lima"]));
        assert_eq!(payload["headers"], json!(["name", "stage", "city"]));
        assert_eq!(payload["prompt"], json!("Classify each startup"));
        assert_eq!(payload["mode"], json!("vc-analyst"));
        assert_eq!(payload["batch_size"], json!(10));
        assert!(payload.get("output_schema").is_none());
    }

    #[test]
    fn selected_columns_filter_values_in_selection_order() {
        let options = BuildOptions {
            selected_columns: vec!["city".into(), "name".into(), "ghost".into()],
            ..Default::default()
        };
        let payload = build_payload(LoopMode::Freestyle, &five_rows(), &options).expect("build");

        assert_eq!(payload["data"]["row_2"], json!(["Paris", "B"]));
        assert_eq!(payload["headers"], json!(["city", "name", "ghost"]));
    }

    #[test]
    fn short_rows_yield_null_cells() {
        let raw = inputs(json!({"csv_data": "a,b\n1\n2,3"}));
        let payload = build_payload(LoopMode::Freestyle, &raw, &BuildOptions::default()).expect("build");
        assert_eq!(payload["data"]["row_1"], json!(["1", null]));
        assert_eq!(payload["data"]["row_2"], json!(["2", "3"]));
    }

    #[test]
    fn pre_parsed_table_takes_precedence() {
        let options = BuildOptions {
            parsed_table: Some(ParsedTable {
                headers: vec!["x".into()],
                rows: vec![vec!["1".into()]],
            }),
            ..Default::default()
        };
        let payload = build_payload(LoopMode::Freestyle, &five_rows(), &options).expect("build");
        assert_eq!(payload["headers"], json!(["x"]));
        assert_eq!(payload["data"], json!({"row_1": ["1"]}));
    }

    #[test]
    fn missing_or_empty_table_is_rejected() {
        for raw in [json!({}), json!({"csv_data": ""}), json!({"csv_data": "only_header"})] {
            let err = build_payload(LoopMode::Freestyle, &inputs(raw), &BuildOptions::default())
                .expect_err("should fail");
            assert!(matches!(err, AppError::MissingField { ref field } if field == "csv_data"));
        }
    }

    #[test]
    fn webhook_and_schema_are_embedded_when_provided() {
        let mut raw = five_rows();
        raw.insert("output_schema".into(), json!("{\"score\": \"number\"}"));
        let options = BuildOptions {
            webhook_url: Some("https://hooks.example.com/x".into()),
            enable_google_search: true,
            ..Default::default()
        };
        let payload = build_payload(LoopMode::Freestyle, &raw, &options).expect("build");

        assert_eq!(
            payload["config"],
            json!({"webhook_url": "https://hooks.example.com/x"})
        );
        assert_eq!(payload["output_schema"], json!("{\"score\": \"number\"}"));
        assert_eq!(payload["enable_google_search"], json!(true));
    }

    #[test]
    fn config_key_is_absent_without_webhook() {
        let payload =
            build_payload(LoopMode::Freestyle, &five_rows(), &BuildOptions::default()).expect("build");
        assert!(payload.get("config").is_none());
    }

    #[test]
    fn keyword_mode_splits_list_and_keeps_scalars() {
        let raw = inputs(json!({
            "keywords": "music\n\n  streaming \nsubscription\n",
            "company_url": "https://www.spotify.com/"
        }));
        let payload =
            build_payload(LoopMode::KeywordKombat, &raw, &BuildOptions::default()).expect("build");

        assert_eq!(
            payload,
            json!({
                "mode": "keyword-kombat",
                "keywords": ["music", "streaming", "subscription"],
                "company_url": "https://www.spotify.com/",
                "keyword_variable": "keyword",
                "test_mode": false,
                "enable_google_search": false
            })
        );
    }

    #[test]
    fn keyword_mode_requires_keywords() {
        let raw = inputs(json!({"keywords": "  \n \n", "company_url": "https://x.io"}));
        let err = build_payload(LoopMode::KeywordKombat, &raw, &BuildOptions::default())
            .expect_err("should fail");
        assert_eq!(err.to_string(), "Missing required field: keywords");
    }

    #[test]
    fn build_is_deterministic() {
        let options = BuildOptions {
            test_mode: true,
            ..Default::default()
        };
        let a = build_payload(LoopMode::Freestyle, &five_rows(), &options).unwrap();
        let b = build_payload(LoopMode::Freestyle, &five_rows(), &options).unwrap();
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("VC-Analyst".parse::<LoopMode>().unwrap(), LoopMode::VcAnalyst);
        assert!("nope".parse::<LoopMode>().is_err());
        assert_eq!(LoopMode::KeywordKombat.to_string(), "keyword-kombat");
    }
}
