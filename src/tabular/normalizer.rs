//! Normalization of backend results into a uniform table.
//!
//! Backend responses are produced by an upstream AI process and are not
//! shape-consistent: a cell may hold a plain object, a JSON-encoded string,
//! or a single-element array wrapping an object. All three are flattened the
//! same way so the view layer never special-cases backend quirks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key that identifies the originating input row. Never flattened, always
/// the first column when present.
pub const ROW_KEY: &str = "row_key";

/// Uniform column/row representation used for display and export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTable {
    /// Ordered, unique column names.
    pub columns: Vec<String>,
    /// One map per result row. Keys are a subset of `columns`.
    pub rows: Vec<Map<String, Value>>,
}

impl NormalizedTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Boundary decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Accepted top-level shapes of a backend response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResultShape<'a> {
    /// A bare JSON array of row objects.
    BareList(&'a [Value]),
    /// An object carrying a `results` array.
    Wrapped { results: &'a [Value] },
    /// Anything else. Normalizes to an empty table.
    Unrecognized,
}

impl<'a> ResultShape<'a> {
    /// Classifies a raw response. A `results` array wins over other keys.
    pub fn decode(raw: &'a Value) -> Self {
        match raw {
            Value::Array(items) => ResultShape::BareList(items),
            Value::Object(obj) => match obj.get("results") {
                Some(Value::Array(items)) => ResultShape::Wrapped { results: items },
                _ => ResultShape::Unrecognized,
            },
            _ => ResultShape::Unrecognized,
        }
    }

    /// The row entries carried by this shape.
    pub fn rows(&self) -> &'a [Value] {
        match self {
            ResultShape::BareList(items) => items,
            ResultShape::Wrapped { results } => results,
            ResultShape::Unrecognized => &[],
        }
    }
}

/// Batch counts reported by the backend alongside its results.
///
/// Passed through verbatim; never recomputed from the rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultCounts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_rows: Option<u64>,
}

impl ResultCounts {
    /// Reads the counts from a wrapped response. Returns `None` if none are present.
    pub fn extract(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let counts = ResultCounts {
            total_rows: obj.get("total_rows").and_then(Value::as_u64),
            successful_rows: obj.get("successful_rows").and_then(Value::as_u64),
            failed_rows: obj.get("failed_rows").and_then(Value::as_u64),
        };

        if counts == ResultCounts::default() {
            None
        } else {
            Some(counts)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Normalization
// ─────────────────────────────────────────────────────────────────────────────

/// Normalizes a raw backend response into columns and flattened rows.
pub fn normalize(raw: &Value) -> NormalizedTable {
    let rows: Vec<Map<String, Value>> = ResultShape::decode(raw)
        .rows()
        .iter()
        .map(normalize_row)
        .collect();

    let columns = collect_columns(&rows);

    NormalizedTable { columns, rows }
}

/// Flattens one result entry. Non-object entries become empty rows.
fn normalize_row(entry: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    let Some(fields) = entry.as_object() else {
        return out;
    };

    for (key, value) in fields {
        if key == ROW_KEY {
            out.insert(key.clone(), value.clone());
            continue;
        }

        match flatten_value(value) {
            Value::Object(inner) => {
                for (inner_key, inner_value) in inner {
                    out.insert(inner_key, inner_value);
                }
            }
            other => {
                out.insert(key.clone(), other);
            }
        }
    }

    out
}

/// Parses JSON-looking strings and unwraps singleton arrays of objects.
pub fn flatten_value(value: &Value) -> Value {
    match try_parse_json(value) {
        Value::Array(mut items) if items.len() == 1 && items[0].is_object() => items.remove(0),
        other => other,
    }
}

/// Parses a string that starts with `{` or `[`. Anything else, including
/// unparseable strings, is returned unchanged.
fn try_parse_json(value: &Value) -> Value {
    let Value::String(text) = value else {
        return value.clone();
    };

    let trimmed = text.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return value.clone();
    }

    serde_json::from_str(trimmed).unwrap_or_else(|_| value.clone())
}

/// Union of row keys: `row_key` first, the rest in first-seen order.
fn collect_columns(rows: &[Map<String, Value>]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !seen.iter().any(|c| c == key) {
                seen.push(key.clone());
            }
        }
    }

    let mut columns = Vec::with_capacity(seen.len());
    if seen.iter().any(|c| c == ROW_KEY) {
        columns.push(ROW_KEY.to_string());
    }
    columns.extend(seen.into_iter().filter(|c| c != ROW_KEY));
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_list_and_wrapped_are_equivalent() {
        let rows = json!([
            {"row_key": "row_1", "name": "Ann", "data": "{\"score\": 7}"},
            {"row_key": "row_2", "name": "Bo", "extra": [1, 2]}
        ]);
        let wrapped = json!({ "results": rows.clone(), "total_rows": 2 });

        assert_eq!(normalize(&rows), normalize(&wrapped));
    }

    #[test]
    fn json_string_with_singleton_array_is_spliced() {
        let raw = json!([{ "K": "[{\"a\":1}]" }]);
        let table = normalize(&raw);

        assert_eq!(table.rows[0].get("a"), Some(&json!(1)));
        assert!(table.rows[0].get("K").is_none());
        assert_eq!(table.columns, vec!["a"]);
    }

    #[test]
    fn plain_object_cells_are_spliced_in_place() {
        let raw = json!([{ "name": "Ann", "analysis": {"stage": "Seed", "score": 8}, "tail": true }]);
        let table = normalize(&raw);

        let keys: Vec<&String> = table.rows[0].keys().collect();
        assert_eq!(keys, vec!["name", "stage", "score", "tail"]);
    }

    #[test]
    fn non_object_arrays_are_kept_under_original_key() {
        let raw = json!([{ "tags": "[\"a\", \"b\"]", "pair": [{"x": 1}, {"x": 2}] }]);
        let table = normalize(&raw);

        assert_eq!(table.rows[0].get("tags"), Some(&json!(["a", "b"])));
        assert_eq!(table.rows[0].get("pair"), Some(&json!([{"x": 1}, {"x": 2}])));
    }

    #[test]
    fn invalid_json_strings_stay_strings() {
        let raw = json!([{ "note": "{not json" , "plain": "hello" }]);
        let table = normalize(&raw);

        assert_eq!(table.rows[0].get("note"), Some(&json!("{not json")));
        assert_eq!(table.rows[0].get("plain"), Some(&json!("hello")));
    }

    #[test]
    fn row_key_is_never_flattened_and_pinned_first() {
        let raw = json!([
            {"name": "Ann", "row_key": "row_1"},
            {"row_key": "{\"a\": 1}", "city": "Berlin"}
        ]);
        let table = normalize(&raw);

        assert_eq!(table.columns, vec!["row_key", "name", "city"]);
        assert_eq!(table.rows[1].get("row_key"), Some(&json!("{\"a\": 1}")));
    }

    #[test]
    fn columns_follow_first_seen_order_across_rows() {
        let raw = json!([{"b": 1, "a": 2}, {"c": 3, "a": 4}]);
        let table = normalize(&raw);
        assert_eq!(table.columns, vec!["b", "a", "c"]);
    }

    #[test]
    fn unrecognized_shapes_yield_empty_table() {
        for raw in [json!({"data": []}), json!("text"), json!(42), json!(null), json!({"results": "nope"})] {
            let table = normalize(&raw);
            assert!(table.is_empty(), "expected empty table for {raw}");
            assert!(table.columns.is_empty());
        }
    }

    #[test]
    fn non_object_entries_become_empty_rows() {
        let table = normalize(&json!([1, {"a": 1}]));
        assert_eq!(table.rows.len(), 2);
        assert!(table.rows[0].is_empty());
        assert_eq!(table.columns, vec!["a"]);
    }

    #[test]
    fn decode_prefers_results_array() {
        let raw = json!({"results": [{"a": 1}], "data": [{"b": 2}]});
        match ResultShape::decode(&raw) {
            ResultShape::Wrapped { results } => assert_eq!(results.len(), 1),
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn counts_are_passed_through() {
        let raw = json!({"results": [], "total_rows": 6, "successful_rows": 5, "failed_rows": 1});
        let counts = ResultCounts::extract(&raw).expect("counts present");
        assert_eq!(counts.total_rows, Some(6));
        assert_eq!(counts.successful_rows, Some(5));
        assert_eq!(counts.failed_rows, Some(1));

        assert!(ResultCounts::extract(&json!([{"a": 1}])).is_none());
        assert!(ResultCounts::extract(&json!({"results": []})).is_none());
    }
}
