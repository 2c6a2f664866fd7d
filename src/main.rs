use anyhow::Result;
use clap::{Parser, Subcommand};

use recall::cli::{self, FilterArgs};
use recall::config::Config;
use recall::identity;
use recall::store::Store;

#[derive(Parser)]
#[command(name = "recall")]
#[command(about = "Local memory layer for AI coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "recall.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one ingestion pass over all sources
    Ingest,

    /// Watch sources continuously and ingest on change
    Watch,

    /// Show device, source and watcher status
    Status,

    /// Full-text search over captured events
    Search {
        /// Query string; `|` means OR, quoted phrases are preserved
        query: String,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Chronological event listing
    Timeline {
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Edit-tool calls, optionally filtered to one file
    Edits {
        /// Substring match on the edited file path
        #[arg(long)]
        file: Option<String>,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Files touched by tool calls
    Files {
        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Rebuild a file's contents at a point in time
    Reconstruct {
        /// File path as recorded on events
        file_path: String,

        /// Cutoff time (defaults to now)
        #[arg(long)]
        at: Option<String>,

        /// Restrict the edit stream to one session
        #[arg(long)]
        session: Option<String>,
    },

    /// Source management
    Sources {
        #[command(subcommand)]
        command: SourceCommands,
    },

    /// Token usage and cost rollups
    Stats {
        #[command(flatten)]
        filters: FilterArgs,

        /// Rollup grouping: day, session or model
        #[arg(long, default_value = "model")]
        by: String,
    },
}

#[derive(Subcommand)]
enum SourceCommands {
    /// List registered sources
    List,
    /// Register a path by hand
    Add {
        /// Transcript file or repository root
        path: String,
        /// Source kind: jsonl_transcript, split_transcript, plain_transcript, git
        #[arg(long)]
        kind: Option<String>,
    },
    /// Remove a source
    Rm {
        source_id: String,
        /// Also delete the source's events
        #[arg(long)]
        purge: bool,
    },
    /// Pause ingestion for a source
    Pause { source_id: String },
    /// Resume a paused source
    Resume { source_id: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("recall=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).unwrap_or_default();

    let store = Store::open(&config.database_path())?;
    let device = identity::get_or_create_device(&identity::default_device_path())?;

    match cli.command {
        Commands::Ingest => cli::ingest::run(store, &config, device)?,
        Commands::Watch => cli::watch::run(store, &config, device)?,
        Commands::Status => cli::status::run(&store, &config, &device)?,
        Commands::Search { query, filters } => cli::search::run(&store, &query, &filters)?,
        Commands::Timeline { filters } => cli::timeline::run(&store, &filters)?,
        Commands::Edits { file, filters } => cli::edits::run(&store, file, &filters)?,
        Commands::Files { filters } => cli::files::run(&store, &filters)?,
        Commands::Reconstruct {
            file_path,
            at,
            session,
        } => cli::reconstruct::run(&store, &file_path, at.as_deref(), session.as_deref())?,
        Commands::Sources { command } => match command {
            SourceCommands::List => cli::sources::list(&store)?,
            SourceCommands::Add { path, kind } => {
                cli::sources::add(&store, &device, &config, &path, kind.as_deref())?
            }
            SourceCommands::Rm { source_id, purge } => {
                let mut store = store;
                cli::sources::remove(&mut store, &source_id, purge)?
            }
            SourceCommands::Pause { source_id } => cli::sources::pause(&store, &source_id)?,
            SourceCommands::Resume { source_id } => cli::sources::resume(&store, &source_id)?,
        },
        Commands::Stats { filters, by } => cli::stats::run(&store, &config, &filters, &by)?,
    }

    Ok(())
}
