use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use rebatch::config::ExecConfig;
use rebatch::exec::{Dispatch, ExecutionEngine, Tally};
use rebatch::loader;
use rebatch::render;
use rebatch::shutdown;
use rebatch::store::{FilterSpec, JobStore};

#[derive(Parser, Debug)]
#[command(name = "rebatch")]
#[command(version)]
#[command(about = "A persistent, retryable batch-command runner")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Load CSV records into the state database
    Load(LoadArgs),

    /// Execute a command template against pending rows
    Exec(ExecArgs),

    /// Reset execution state for every row
    Reset {
        /// Path to the state database
        db: PathBuf,
    },
}

// =============================================================================
// Load Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct LoadArgs {
    /// Path to the state database
    db: PathBuf,

    /// Input file with data (defaults to stdin)
    #[arg(long, short = 'i')]
    input: Option<PathBuf>,

    /// CSV separator (single character, or \t)
    #[arg(long, short = 's', default_value = ",")]
    separator: String,

    /// Input has no header row; columns are named arg0..argN
    #[arg(long)]
    no_header: bool,
}

// =============================================================================
// Exec Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ExecArgs {
    /// Path to the state database
    db: PathBuf,

    /// Command template; {name} substitutes the row field "name"
    command: String,

    /// Maximum execution parallelism
    #[arg(long, short = 'p', default_value = "1")]
    parallelism: usize,

    /// Execute only the first N pending rows; 0 removes the limit
    #[arg(long, short = 't', default_value = "0")]
    take: i64,

    /// Arbitrary SQL predicate over row fields
    #[arg(long, default_value = "")]
    filter: String,

    /// Arbitrary SQL ordering expression
    #[arg(long, default_value = "")]
    order: String,

    /// Shell for commands execution
    #[arg(long, default_value = "sh")]
    shell: String,

    /// Milliseconds between interrupt and forced kill on cancellation
    #[arg(long, default_value = "0")]
    grace_ms: u64,

    /// Show rendered commands but do not execute them
    #[arg(long)]
    show: bool,

    /// Output format for the final tally
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Command Handlers
// =============================================================================

fn handle_load(args: LoadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = JobStore::open(&args.db)?;
    let separator = loader::parse_separator(&args.separator)?;
    let input = loader::open_input(args.input.as_deref())?;
    loader::load(&store, input, separator, args.no_header)?;
    Ok(())
}

async fn handle_exec(args: ExecArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(JobStore::open(&args.db)?);
    let spec = FilterSpec {
        filter: args.filter,
        order: args.order,
        take: args.take,
    };
    let (rows, keys) = store.filter(&spec)?;
    let commands = render::render_all(&args.command, &rows)?;

    if args.show {
        for command in &commands {
            println!("{command}");
        }
        return Ok(());
    }

    let config = ExecConfig {
        shell: args.shell,
        parallelism: args.parallelism,
        grace: Duration::from_millis(args.grace_ms),
    };
    let cancel = shutdown::install_shutdown_handler();
    let engine = ExecutionEngine::new(store, &config);
    let batch: Vec<Dispatch> = keys
        .into_iter()
        .zip(commands)
        .map(|(rowid, command)| Dispatch { rowid, command })
        .collect();

    let tally = engine.execute(batch, cancel).await;
    print_tally(&tally, &args.output)?;
    Ok(())
}

fn handle_reset(db: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let store = JobStore::open(&db)?;
    store.reset()?;
    tracing::info!("Execution state reset");
    Ok(())
}

fn print_tally(tally: &Tally, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(tally)?);
        }
        OutputFormat::Table => {
            println!("Succeeded: {}", tally.succeeded);
            println!("Failed:    {}", tally.failed);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so --show and tally output stay clean on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Load(load_args) => handle_load(load_args),
        Commands::Exec(exec_args) => handle_exec(exec_args).await,
        Commands::Reset { db } => handle_reset(db),
    }
}
