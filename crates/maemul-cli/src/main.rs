//! Maemul CLI - operator entry point for the listing migration pipeline.
//!
//! Logs go to stderr; reports and mapped records go to stdout (or a file) so
//! they can be piped into other tools.

mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use maemul_core::ResolutionMode;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "maemul")]
#[command(about = "Migrate legacy listing spreadsheets into the record store")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Map an export offline and print normalized records as JSON lines
    Map {
        /// Export file (.csv, .tsv or .json)
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Run the full migration against the store
    Migrate(MigrateArgs),

    /// Remove synthetic listings and their dependent rows
    Sweep(SweepArgs),
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Store base URL
    #[arg(long, env = "MAEMUL_STORE_URL")]
    store_url: String,

    /// Store API key
    #[arg(long, env = "MAEMUL_STORE_KEY", hide_env_values = true)]
    store_key: String,

    /// Client-side request rate limit
    #[arg(long, default_value_t = maemul_core::config::StoreConfig::REQUESTS_PER_SECOND)]
    requests_per_second: u32,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = maemul_core::config::StoreConfig::REQUEST_TIMEOUT.as_secs())]
    timeout_secs: u64,
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// Export file (.csv, .tsv or .json)
    #[arg(short, long)]
    input: PathBuf,

    #[command(flatten)]
    store: StoreArgs,

    /// How to treat labels missing from reference tables
    #[arg(long, value_enum, default_value_t = Mode::Lenient)]
    mode: Mode,

    /// Rows per insert request
    #[arg(long, default_value_t = maemul_core::config::LoaderDefaults::BATCH_SIZE)]
    batch_size: usize,

    /// Batches in flight (1-4)
    #[arg(long, default_value_t = maemul_core::config::LoaderDefaults::CONCURRENCY)]
    concurrency: usize,

    /// Map and resolve without writing
    #[arg(long)]
    dry_run: bool,

    /// Skip rows whose source hash is already in the store
    #[arg(long)]
    skip_loaded: bool,

    /// Write the report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SweepArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// List candidates without deleting
    #[arg(long)]
    dry_run: bool,

    /// Name marker (repeatable); replaces the default markers
    #[arg(long = "marker")]
    markers: Vec<String>,

    /// Reserved manager id whose listings are synthetic (repeatable)
    #[arg(long = "sentinel-manager")]
    sentinel_managers: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Strict,
    Lenient,
    AutoCreate,
}

impl From<Mode> for ResolutionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Strict => ResolutionMode::Strict,
            Mode::Lenient => ResolutionMode::Lenient,
            Mode::AutoCreate => ResolutionMode::AutoCreate,
        }
    }
}

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);

    match cli.command {
        Command::Map { input } => commands::map(&input),
        Command::Migrate(args) => commands::migrate(args).await,
        Command::Sweep(args) => commands::sweep(args).await,
    }
}
