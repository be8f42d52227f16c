//! Submit tabular data to batch-processing workflows, track each run as an
//! execution record, and view or export the normalized results.

pub mod backend;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod payload;
pub mod state;
pub mod storage;
pub mod tabular;

pub use error::AppError;
pub use state::AppState;
