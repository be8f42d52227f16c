//! rowloop command-line host.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use rowloop::collaborators::StaticSession;
use rowloop::commands::{
    cancel_execution, execution_view, export_execution, join_or_cancel, preview_input,
    retry_execution, start_execution, watch_execution, DashboardSubscription, ExportFormat,
    SubmitRequest,
};
use rowloop::config::AppConfig;
use rowloop::logging::init_logging;
use rowloop::payload::{LoopMode, RawInputs};
use rowloop::state::AppState;
use rowloop::storage::{ExecutionFilter, ExecutionRecord, ExecutionStats, ExecutionStatus};
use rowloop::tabular::view::display_string;
use rowloop::tabular::{SortDirection, TableView, ViewState};

#[derive(Parser, Debug)]
#[command(
    name = "rowloop",
    version,
    about = "Run tabular data through batch-processing workflows"
)]
struct Cli {
    /// Enable debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Path to a TOML config file
    #[arg(long, global = true, env = "ROWLOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Act as this user (ownership and credits)
    #[arg(long, global = true, env = "ROWLOOP_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a run and wait for it to finish
    Submit {
        /// Workflow id from the config (e.g. loop-over-rows)
        workflow: String,

        /// Loop mode: freestyle, vc-analyst or keyword-kombat
        #[arg(short, long)]
        mode: Option<LoopMode>,

        /// CSV file used as the table input
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Newline-delimited keyword file
        #[arg(long)]
        keywords: Option<PathBuf>,

        /// Extra input as key=value (value parsed as JSON when possible)
        #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Extra input read from a file, as key=path
        #[arg(long = "set-file", value_name = "KEY=PATH")]
        set_file: Vec<String>,

        /// Only send these columns (comma-separated)
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,

        /// Preview run on the first few rows
        #[arg(long)]
        test: bool,

        /// Let the backend use web search
        #[arg(long)]
        google: bool,
    },

    /// Show how an input file will be parsed, without submitting it
    Preview {
        file: PathBuf,

        /// Treat a bare list as one column with this header (e.g. keyword)
        #[arg(long)]
        header: Option<String>,

        /// Rows to show
        #[arg(long, default_value_t = 10)]
        rows: usize,
    },

    /// List executions, newest first
    List {
        #[command(flatten)]
        filter: FilterArgs,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one execution
    Show { id: String },

    /// Aggregate counts, cost and duration
    Stats {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Cancel a queued or running execution
    Cancel { id: String },

    /// Run an execution again with the same inputs
    Retry { id: String },

    /// Delete an execution record
    Remove { id: String },

    /// Print one page of an execution's results
    View {
        id: String,
        #[command(flatten)]
        view: ViewArgs,

        /// Zero-based page index
        #[arg(long, default_value_t = 0)]
        page: usize,

        /// Rows per page (defaults to the configured page size)
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Export an execution's results
    Export {
        id: String,

        /// csv or json
        #[arg(short, long, default_value = "csv")]
        format: ExportFormat,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        #[command(flatten)]
        view: ViewArgs,
    },

    /// Poll the dashboard, or a single execution until it finishes
    Watch {
        id: Option<String>,

        #[command(flatten)]
        filter: FilterArgs,

        /// Stop after this many dashboard refreshes
        #[arg(long)]
        ticks: Option<usize>,
    },
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    #[arg(long)]
    workflow: Option<String>,

    #[arg(long)]
    status: Option<ExecutionStatus>,

    /// Only records owned by this user
    #[arg(long)]
    owner: Option<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> ExecutionFilter {
        ExecutionFilter {
            user_id: self.owner.clone(),
            workflow_id: self.workflow.clone(),
            status: self.status,
        }
    }
}

#[derive(Args, Debug, Default)]
struct ViewArgs {
    /// Case-insensitive search over every cell
    #[arg(long, default_value = "")]
    search: String,

    /// Column to sort by
    #[arg(long)]
    sort: Option<String>,

    /// Sort ascending instead of descending
    #[arg(long)]
    asc: bool,
}

impl ViewArgs {
    fn to_state(&self, page_index: usize, page_size: usize) -> ViewState {
        ViewState {
            search_term: self.search.clone(),
            sort_column: self.sort.clone(),
            sort_direction: if self.asc {
                SortDirection::Asc
            } else {
                SortDirection::Desc
            },
            page_index,
            page_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let state = AppState::from_config(config)
        .await
        .context("Failed to initialize application state")?
        .with_session(Arc::new(StaticSession::new(cli.user.clone())));
    let state = Arc::new(state);

    match cli.command {
        Commands::Submit {
            workflow,
            mode,
            csv,
            keywords,
            set,
            set_file,
            columns,
            test,
            google,
        } => {
            let mut inputs = RawInputs::new();
            if let Some(path) = csv {
                inputs.insert("csv_data".into(), Value::String(read_file(&path)?));
            }
            if let Some(path) = keywords {
                inputs.insert("keywords".into(), Value::String(read_file(&path)?));
            }
            for pair in &set {
                let (key, value) = split_pair(pair)?;
                let value = serde_json::from_str(value)
                    .unwrap_or_else(|_| Value::String(value.to_string()));
                inputs.insert(key.to_string(), value);
            }
            for pair in &set_file {
                let (key, path) = split_pair(pair)?;
                inputs.insert(key.to_string(), Value::String(read_file(&PathBuf::from(path))?));
            }

            let request = SubmitRequest {
                workflow_id: workflow,
                mode,
                inputs,
                test_mode: test,
                enable_google_search: google,
                selected_columns: columns,
                parsed_table: None,
            };
            let handle = start_execution(state.clone(), request).await?;
            let record = join_or_cancel(&state, handle, ctrl_c()).await?;
            print_record(&record);
        }

        Commands::Preview { file, header, rows } => {
            let view_state = ViewState {
                page_size: rows,
                ..Default::default()
            };
            let view = preview_input(&read_file(&file)?, header.as_deref(), view_state)?;
            print!("{}", render_page(&view));
        }

        Commands::List { filter, json } => {
            let records = state.store.list(&filter.to_filter())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_record_table(&records);
            }
        }

        Commands::Show { id } => {
            let record = state
                .store
                .get(&id)?
                .with_context(|| format!("Execution {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Commands::Stats { filter } => {
            let stats = state.store.stats(&filter.to_filter())?;
            print_stats(&stats);
        }

        Commands::Cancel { id } => {
            let record = cancel_execution(&state, &id).await?;
            print_record(&record);
        }

        Commands::Retry { id } => {
            let handle = retry_execution(state.clone(), &id).await?;
            let record = join_or_cancel(&state, handle, ctrl_c()).await?;
            print_record(&record);
        }

        Commands::Remove { id } => {
            if !state.store.remove(&id)? {
                bail!("Execution {} not found", id);
            }
            println!("Removed {}", id);
        }

        Commands::View {
            id,
            view,
            page,
            page_size,
        } => {
            let page_size = page_size.unwrap_or(state.config.page_size);
            let table_view = execution_view(&state, &id, view.to_state(page, page_size))?;
            print!("{}", render_page(&table_view));
        }

        Commands::Export {
            id,
            format,
            out,
            view,
        } => {
            let file = export_execution(
                &state,
                &id,
                format,
                view.to_state(0, state.config.page_size),
                &out,
            )?;
            println!("Wrote {} ({} bytes)", file.path.display(), file.size);
        }

        Commands::Watch { id, filter, ticks } => {
            let period = state.config.poll_interval();
            match id {
                Some(id) => {
                    let mut watch = watch_execution(state.store.clone(), id, period);
                    while let Some(record) = watch.recv().await {
                        println!(
                            "{} {} {}%",
                            record.id, record.status, record.progress
                        );
                    }
                }
                None => {
                    let mut dashboard =
                        DashboardSubscription::spawn(state.store.clone(), filter.to_filter(), period);
                    let mut seen = 0;
                    while let Some(snapshot) = dashboard.recv().await {
                        print_stats(&snapshot.stats);
                        print_record_table(&snapshot.executions);
                        seen += 1;
                        if ticks.is_some_and(|limit| seen >= limit) {
                            break;
                        }
                    }
                    dashboard.stop().await;
                }
            }
        }
    }

    Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves.
async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn read_file(path: &PathBuf) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
        _ => bail!("Expected KEY=VALUE, got {:?}", pair),
    }
}

fn print_record(record: &ExecutionRecord) {
    println!("{}  {}  {}", record.id, record.workflow_name, record.status);
    if let Some(message) = &record.error_message {
        println!("  error: {}", message);
    }
    if let Some(secs) = record.actual_time {
        println!("  took {:.1}s, cost {:.2} credits", secs, record.cost_credits);
    }
    for file in record.files.iter().flatten() {
        println!("  file: {}", file.path.display());
    }
}

fn print_record_table(records: &[ExecutionRecord]) {
    println!(
        "{:<13} {:<18} {:<10} {:>4}  {}",
        "ID", "WORKFLOW", "STATUS", "%", "CREATED"
    );
    for record in records {
        println!(
            "{:<13} {:<18} {:<10} {:>4}  {}",
            record.id,
            record.workflow_id,
            record.status,
            record.progress,
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_stats(stats: &ExecutionStats) {
    println!(
        "total {} | queued {} | running {} | completed {} | failed {} | cancelled {} | cost {:.2} | avg {:.1}s",
        stats.total,
        stats.queued,
        stats.running,
        stats.completed,
        stats.failed,
        stats.cancelled,
        stats.total_cost,
        stats.avg_duration
    );
}

/// Renders the current page as an aligned text table with a footer.
fn render_page(view: &TableView) -> String {
    let columns = view.columns();
    let rows: Vec<Vec<String>> = view
        .visible_rows()
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| row.get(c).map(display_string).unwrap_or_default())
                .collect()
        })
        .collect();

    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            rows.iter()
                .map(|r| r[i].chars().count())
                .chain(std::iter::once(c.chars().count()))
                .max()
                .unwrap_or(0)
                .min(40)
        })
        .collect();

    let fmt_line = |cells: Vec<&str>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| {
                let clipped: String = cell.chars().take(*width).collect();
                format!("{:<width$}", clipped, width = *width)
            })
            .collect::<Vec<_>>()
            .join("  ")
    };

    let mut out = String::new();
    out.push_str(&fmt_line(columns.iter().map(String::as_str).collect()));
    out.push('\n');
    for row in &rows {
        out.push_str(&fmt_line(row.iter().map(String::as_str).collect()));
        out.push('\n');
    }
    out.push_str(&format!(
        "page {}/{} ({} of {} rows)\n",
        if view.page_count() == 0 { 0 } else { view.page_index() + 1 },
        view.page_count(),
        view.filtered_count(),
        view.table().rows.len()
    ));
    out
}
