//! Lenient parsing of pasted or uploaded delimited text.
//!
//! The parser is record-oriented and never fails: short, long, or otherwise
//! malformed rows are passed through as-is. A record is one line, or several
//! physical lines when a quoted field spans a line break. Consumers must index rows
//! defensively (`row.get(i)`).
//!
//! Quoting follows the same rules the exporter writes: a field may be wrapped
//! in double quotes, commas inside quotes are literal, and a doubled quote
//! (`""`) inside a quoted field is read back as a single `"`.

use serde::{Deserialize, Serialize};

/// Result of parsing delimited text: ordered headers plus ordered rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTable {
    /// Fields of the first non-empty line. Uniqueness is not enforced.
    pub headers: Vec<String>,
    /// Fields of every following non-empty line. Arity is not validated.
    pub rows: Vec<Vec<String>>,
}

impl ParsedTable {
    /// Returns the index of the first header equal to `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Number of data rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Parses delimited text into headers and rows.
///
/// Returns `None` if fewer than two non-empty lines remain after discarding
/// blank lines.
pub fn parse(text: &str) -> Option<ParsedTable> {
    let lines = non_empty_lines(text);
    if lines.len() < 2 {
        return None;
    }

    let headers = parse_line(&lines[0]);
    let rows = lines[1..].iter().map(|line| parse_line(line)).collect();

    Some(ParsedTable { headers, rows })
}

/// Parses text, switching to single-column mode when the input is a bare list.
///
/// Single-column mode is chosen when no non-empty line contains a comma and
/// the first line is not already the header itself (compared trimmed and
/// case-insensitively). Each trimmed line then becomes a one-element row under
/// `header`. Otherwise this behaves exactly like [`parse`].
pub fn parse_with_single_header(text: &str, header: &str) -> Option<ParsedTable> {
    let lines = non_empty_lines(text);
    let first = lines.first()?;

    let first_is_header = first.trim().to_lowercase() == header.trim().to_lowercase();
    let no_commas = lines.iter().all(|line| !line.contains(','));

    if no_commas && !first_is_header {
        return Some(ParsedTable {
            headers: vec![header.to_string()],
            rows: lines.iter().map(|line| vec![line.trim().to_string()]).collect(),
        });
    }

    parse(text)
}

/// Splits newline-delimited text into trimmed, non-empty entries, in order.
pub fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Returns the non-blank records of `text`. Physical lines are joined with
/// `\n` while a quoted field is still open; blank lines only count as
/// separators outside quotes.
fn non_empty_lines(text: &str) -> Vec<String> {
    let mut records = Vec::new();
    let mut pending: Option<String> = None;

    for line in text.split('\n') {
        let record = match pending.take() {
            Some(mut open) => {
                open.push('\n');
                open.push_str(line);
                open
            }
            None if line.trim().is_empty() => continue,
            None => line.to_string(),
        };

        if has_open_quote(&record) {
            pending = Some(record);
        } else {
            records.push(record);
        }
    }
    // An unterminated quote runs to the end of the input.
    records.extend(pending);

    records
}

fn has_open_quote(record: &str) -> bool {
    record.matches('"').count() % 2 == 1
}

/// Splits one line into fields with a single left-to-right scan.
fn parse_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                // Escaped quote inside a quoted field.
                current.push('"');
                current.push('"');
                chars.next();
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                fields.push(finish_field(&current));
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    fields.push(finish_field(&current));

    fields
}

/// Trims a raw field, strips one pair of wrapping quotes, and unescapes `""`.
fn finish_field(raw: &str) -> String {
    let trimmed = raw.trim();
    let quoted = trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"');

    if quoted {
        trimmed[1..trimmed.len() - 1].replace("\"\"", "\"")
    } else {
        trimmed.to_string()
    }
}
