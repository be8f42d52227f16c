//! Interactive view over a normalized table: search, sort, and pagination.
//!
//! The view never mutates the underlying table. Every change to the view
//! state recomputes the ordered list of visible row indices; page windows and
//! exports are read from that list.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::normalizer::NormalizedTable;

/// Default number of rows per page.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Sort direction for the active column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn toggled(self) -> Self {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }
}

/// User-controlled view parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewState {
    pub search_term: String,
    pub sort_column: Option<String>,
    pub sort_direction: SortDirection,
    pub page_index: usize,
    pub page_size: usize,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            search_term: String::new(),
            sort_column: None,
            sort_direction: SortDirection::Desc,
            page_index: 0,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Renders a cell the way it is displayed, searched, and exported.
///
/// Strings are used raw, `null` is empty, everything else is compact JSON.
pub fn display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compares two cells. Numbers sort before every other value and compare
/// numerically; the rest compare by case-insensitive display string.
pub fn compare_cells(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => {
            let a_str = a.map(display_string).unwrap_or_default();
            let b_str = b.map(display_string).unwrap_or_default();
            a_str
                .to_lowercase()
                .cmp(&b_str.to_lowercase())
                .then_with(|| a_str.cmp(&b_str))
        }
    }
}

fn numeric(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64)
}

/// A searchable, sortable, paginated window over a [`NormalizedTable`].
#[derive(Debug, Clone)]
pub struct TableView {
    table: NormalizedTable,
    state: ViewState,
    /// Indices into `table.rows`, filtered and sorted.
    visible: Vec<usize>,
}

impl TableView {
    pub fn new(table: NormalizedTable) -> Self {
        Self::with_state(table, ViewState::default())
    }

    pub fn with_state(table: NormalizedTable, mut state: ViewState) -> Self {
        state.page_size = state.page_size.max(1);
        let mut view = Self {
            table,
            state,
            visible: Vec::new(),
        };
        view.recompute();
        view.clamp_page();
        view
    }

    pub fn table(&self) -> &NormalizedTable {
        &self.table
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn columns(&self) -> &[String] {
        &self.table.columns
    }

    // ── Search ────────────────────────────────────────────────────────────────

    /// Sets the search term and returns to the first page.
    pub fn set_search(&mut self, term: impl Into<String>) {
        self.state.search_term = term.into();
        self.state.page_index = 0;
        self.recompute();
    }

    // ── Sort ──────────────────────────────────────────────────────────────────

    /// Sorts by `column` in an explicit direction.
    pub fn sort_by(&mut self, column: impl Into<String>, direction: SortDirection) {
        self.state.sort_column = Some(column.into());
        self.state.sort_direction = direction;
        self.state.page_index = 0;
        self.recompute();
    }

    /// Header-click behavior: the same column flips direction, a new column
    /// starts descending.
    pub fn toggle_sort(&mut self, column: &str) {
        let direction = match &self.state.sort_column {
            Some(current) if current == column => self.state.sort_direction.toggled(),
            _ => SortDirection::Desc,
        };
        self.sort_by(column, direction);
    }

    /// Removes sorting, restoring table order.
    pub fn clear_sort(&mut self) {
        self.state.sort_column = None;
        self.state.page_index = 0;
        self.recompute();
    }

    // ── Pagination ────────────────────────────────────────────────────────────

    /// Number of rows that pass the search filter.
    pub fn filtered_count(&self) -> usize {
        self.visible.len()
    }

    /// `ceil(filtered / page_size)`; zero when nothing matches.
    pub fn page_count(&self) -> usize {
        self.visible.len().div_ceil(self.state.page_size)
    }

    pub fn page_index(&self) -> usize {
        self.state.page_index
    }

    /// Moves to `page`, clamped to `[0, page_count - 1]`.
    pub fn go_to_page(&mut self, page: usize) {
        self.state.page_index = page;
        self.clamp_page();
    }

    pub fn next_page(&mut self) {
        self.go_to_page(self.state.page_index.saturating_add(1));
    }

    pub fn prev_page(&mut self) {
        self.go_to_page(self.state.page_index.saturating_sub(1));
    }

    pub fn set_page_size(&mut self, page_size: usize) {
        self.state.page_size = page_size.max(1);
        self.clamp_page();
    }

    /// Rows on the current page, in view order.
    pub fn visible_rows(&self) -> Vec<&Map<String, Value>> {
        let start = self.state.page_index * self.state.page_size;
        self.visible
            .iter()
            .skip(start)
            .take(self.state.page_size)
            .map(|&i| &self.table.rows[i])
            .collect()
    }

    /// All filtered rows in view order, ignoring pagination. Exports read this.
    pub fn processed_rows(&self) -> Vec<&Map<String, Value>> {
        self.visible.iter().map(|&i| &self.table.rows[i]).collect()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn clamp_page(&mut self) {
        let last = self.page_count().saturating_sub(1);
        self.state.page_index = self.state.page_index.min(last);
    }

    fn recompute(&mut self) {
        let term = self.state.search_term.to_lowercase();
        let mut visible: Vec<usize> = self
            .table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| term.is_empty() || row_matches(row, &term))
            .map(|(i, _)| i)
            .collect();

        if let Some(column) = &self.state.sort_column {
            let rows = &self.table.rows;
            visible.sort_by(|&a, &b| compare_cells(rows[a].get(column), rows[b].get(column)));
            if self.state.sort_direction == SortDirection::Desc {
                visible.reverse();
            }
        }

        self.visible = visible;
    }
}

fn row_matches(row: &Map<String, Value>, lowered_term: &str) -> bool {
    row.values()
        .any(|value| display_string(value).to_lowercase().contains(lowered_term))
}
