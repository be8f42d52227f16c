//! Tabular data handling: parsing user input, normalizing backend results,
//! and the search/sort/paginate/export view over them.

pub mod csv_parser;
pub mod export;
pub mod normalizer;
pub mod view;

pub use csv_parser::{parse, parse_with_single_header, split_lines, ParsedTable};
pub use normalizer::{normalize, NormalizedTable, ResultCounts, ResultShape, ROW_KEY};
pub use view::{SortDirection, TableView, ViewState};
