//! Binary entry point for the Strata breakdown explorer.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use strata::endpoint::{Dataset, MemoryEndpoint, MetaData};
use strata::types::{DateRange, Filter, Order};
use strata::{BreakdownId, BreakdownPath, DataSource, FetchOutcome, Node, NodeRef};
use time::macros::format_description;
use time::Date;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod ui;

use config::CliConfig;
use ui::{Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Explore hierarchical breakdowns of CSV fact tables",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "STRATA_CONFIG",
        value_name = "FILE",
        help = "Path to the CLI config file"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, help = "Output format (default: text)")]
    format: Option<OutputFormat>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = ThemeArg::Auto,
        help = "Color theme for text output"
    )]
    theme: ThemeArg,

    #[arg(
        short,
        long,
        global = true,
        action = ArgAction::Count,
        help = "Log more (repeat for debug/trace); RUST_LOG overrides"
    )]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct DatasetArgs {
    #[arg(value_name = "CSV")]
    csv: PathBuf,

    #[arg(
        long,
        value_name = "col1,col2",
        value_delimiter = ',',
        required = true,
        help = "Numeric columns to aggregate"
    )]
    metrics: Vec<String>,

    #[arg(long, value_name = "COLUMN", help = "Column holding YYYY-MM-DD dates")]
    date_column: Option<String>,

    #[arg(
        long,
        value_name = "col1,col2",
        value_delimiter = ',',
        help = "Metric columns that accept edits"
    )]
    editable: Vec<String>,

    #[arg(long, help = "Serve pages without row counts")]
    unknown_counts: bool,
}

#[derive(Args, Debug)]
struct ExploreCmd {
    #[command(flatten)]
    dataset: DatasetArgs,

    #[arg(long, value_name = "dim1,dim2", help = "Breakdown path, one dimension per level")]
    path: BreakdownPath,

    #[arg(
        long,
        value_name = "[-]FIELD",
        allow_hyphen_values = true,
        help = "Sort order; prefix with '-' for descending"
    )]
    order: Option<Order>,

    #[arg(long, value_name = "ROWS", help = "Rows per page")]
    page_size: Option<usize>,

    #[arg(long, value_name = "DATE", value_parser = parse_date, requires = "to", requires = "date_column")]
    from: Option<Date>,

    #[arg(long, value_name = "DATE", value_parser = parse_date, requires = "from")]
    to: Option<Date>,

    #[arg(
        long = "filter",
        value_name = "DIM=V1,V2",
        action = ArgAction::Append,
        help = "Keep facts whose dimension matches one of the values (repeatable)"
    )]
    filters: Vec<Filter>,

    #[arg(
        long = "more",
        value_name = "ID",
        action = ArgAction::Append,
        help = "Load the next page under a row; '.' is the root (repeatable)"
    )]
    more: Vec<String>,

    #[arg(
        long = "edit",
        value_name = "ID:FIELD=VALUE",
        value_parser = parse_edit,
        action = ArgAction::Append,
        help = "Edit one cell (repeatable)"
    )]
    edits: Vec<EditArg>,

    #[arg(long, value_name = "dim1,dim2", help = "Switch to this path after loading")]
    reconfigure: Option<BreakdownPath>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Build a breakdown tree and print it")]
    Explore(ExploreCmd),

    #[command(about = "List the columns and breakdown groups of a dataset")]
    Columns(DatasetArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ThemeArg {
    Auto,
    Light,
    Dark,
    Plain,
}

impl From<ThemeArg> for Theme {
    fn from(theme: ThemeArg) -> Self {
        match theme {
            ThemeArg::Auto => Theme::Auto,
            ThemeArg::Light => Theme::Light,
            ThemeArg::Dark => Theme::Dark,
            ThemeArg::Plain => Theme::Plain,
        }
    }
}

#[derive(Clone, Debug)]
struct EditArg {
    id: BreakdownId,
    field: String,
    value: serde_json::Value,
}

#[derive(Serialize)]
struct ExploreReport<'a> {
    path: &'a BreakdownPath,
    epoch: u64,
    requests: usize,
    tree: &'a Node,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = CliConfig::load(cli.config.clone())?;
    if let Some(path) = config.path() {
        info!(path = %path.display(), "using CLI config");
    }
    let format = cli
        .format
        .or_else(|| config.default_format())
        .unwrap_or(OutputFormat::Text);
    let ui = Ui::new(cli.theme.into());

    match cli.command {
        Command::Explore(cmd) => explore(cmd, &config, format, &ui).await?,
        Command::Columns(args) => {
            let endpoint = open_endpoint(&args)?;
            let source = DataSource::new(endpoint, config.data_source_options());
            let meta = source.metadata().await?;
            emit(format, meta.as_ref(), || print_columns(&ui, &meta))?;
        }
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_endpoint(args: &DatasetArgs) -> Result<Arc<MemoryEndpoint>, Box<dyn Error>> {
    let dataset = Dataset::from_csv_path(&args.csv, &args.metrics)?;
    info!(facts = dataset.len(), path = %args.csv.display(), "loaded dataset");
    let mut endpoint = MemoryEndpoint::new(dataset).unknown_counts(args.unknown_counts);
    if let Some(column) = args.date_column.as_deref() {
        endpoint = endpoint.date_dimension(column);
    }
    for metric in &args.editable {
        endpoint = endpoint.editable(metric.as_str());
    }
    Ok(Arc::new(endpoint))
}

async fn explore(
    cmd: ExploreCmd,
    config: &CliConfig,
    format: OutputFormat,
    ui: &Ui,
) -> Result<(), Box<dyn Error>> {
    let endpoint = open_endpoint(&cmd.dataset)?;
    let mut options = config.data_source_options();
    if let Some(rows) = cmd.page_size {
        options = options.page_size(rows);
    }
    let page_size = options.page_size;
    let source = DataSource::new(endpoint.clone(), options);

    let meta = source.metadata().await?;
    check_path(&meta, &cmd.path)?;
    if let Some(path) = cmd.reconfigure.as_ref() {
        check_path(&meta, path)?;
    }

    if let Some(order) = cmd.order.clone().or(config.default_order()?) {
        source.set_order(order, false).await?;
    }
    if let (Some(from), Some(to)) = (cmd.from, cmd.to) {
        source.set_date_range(DateRange::new(from, to)?, false).await?;
    }
    if !cmd.filters.is_empty() {
        source.set_filters(cmd.filters.clone(), false).await?;
    }
    report(ui, "load", source.set_breakdown_path(cmd.path.clone(), true).await?);

    for id in &cmd.more {
        let node = if id == "." {
            NodeRef::Root
        } else {
            NodeRef::from(id.as_str())
        };
        report(ui, &format!("more {node}"), source.load_more(&node, page_size).await?);
    }
    for edit in &cmd.edits {
        report(
            ui,
            &format!("edit '{}'", edit.id),
            source.save(&edit.id, &edit.field, edit.value.clone()).await?,
        );
    }
    if let Some(path) = cmd.reconfigure {
        report(ui, "reconfigure", source.set_breakdown_path(path, true).await?);
    }

    let tree = source.tree();
    let path = source.tree_path();
    let summary = ExploreReport {
        path: &path,
        epoch: source.epoch().0,
        requests: endpoint.request_count(),
        tree: &tree,
    };
    emit(format, &summary, || {
        ui.tree(&format!("Breakdown {path}"), &tree, &cmd.dataset.metrics);
        ui.section(
            "Requests",
            [
                ("fetch calls", endpoint.request_count().to_string()),
                ("rows", tree.subtree_len().saturating_sub(1).to_string()),
                ("epoch", source.epoch().to_string()),
            ],
        );
    })
}

fn check_path(meta: &MetaData, path: &BreakdownPath) -> Result<(), Box<dyn Error>> {
    if meta.supports(path) {
        return Ok(());
    }
    let missing: Vec<String> = path
        .iter()
        .filter(|dim| !meta.breakdown_groups.contains(dim))
        .map(|dim| dim.to_string())
        .collect();
    Err(format!("dataset has no column(s) {}", missing.join(", ")).into())
}

fn report(ui: &Ui, step: &str, outcome: FetchOutcome) {
    match outcome {
        FetchOutcome::Applied(summary) => info!(
            step,
            requests = summary.requests,
            levels = summary.levels,
            rows = summary.rows,
            "applied"
        ),
        FetchOutcome::Skipped => info!(step, "nothing to fetch"),
        FetchOutcome::Stale => ui.warn(&format!("{step}: response superseded by a newer configuration")),
    }
}

fn print_columns(ui: &Ui, meta: &MetaData) {
    ui.section(
        "Breakdown groups",
        meta.breakdown_groups
            .iter()
            .map(|dim| (dim.as_str(), "dimension")),
    );
    ui.section(
        "Columns",
        meta.columns.iter().map(|column| {
            let kind = if column.editable { "editable" } else { "read-only" };
            (column.key.as_str(), kind)
        }),
    );
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize + ?Sized,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn parse_date(raw: &str) -> Result<Date, String> {
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .map_err(|err| format!("expected YYYY-MM-DD: {err}"))
}

fn parse_edit(raw: &str) -> Result<EditArg, String> {
    let (target, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("edit '{raw}' must look like ID:FIELD=VALUE"))?;
    let (id, field) = target
        .rsplit_once(':')
        .filter(|(id, field)| !id.is_empty() && !field.is_empty())
        .ok_or_else(|| format!("edit '{raw}' must look like ID:FIELD=VALUE"))?;
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| serde_json::Value::String(value.trim().to_string()));
    Ok(EditArg {
        id: BreakdownId::from(id),
        field: field.to_string(),
        value,
    })
}
