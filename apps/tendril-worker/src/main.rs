use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tendril_core::config::{self, Config, DispatcherSettings};
use tendril_core::{Dispatcher, PageNexus, Registry};
use tendril_events::Bus;
use tendril_kernel::Kernel;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tendril-worker", version, about = "Durable strand worker")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone, Default)]
struct GlobalArgs {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the strand database (overrides config)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the dispatcher until ctrl-c (default)
    Run(RunArgs),
    /// Print the configuration JSON schema and exit
    PrintSchema,
    /// List recent strands (JSON)
    Strands {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// List pages (JSON)
    Pages {
        /// Include resolved pages
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Set a semaphore on a strand and wake it
    Signal { strand: String, name: String },
    /// Resolve the open page with the given tag
    Resolve { tag: String },
}

#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Override the dispatcher pool size
    #[arg(long)]
    pool_size: Option<usize>,
    /// Start one cohort of due strands, wait for it, then exit
    #[arg(long)]
    once: bool,
}

fn load(global: &GlobalArgs) -> Result<Config> {
    match &global.config {
        Some(path) => config::load_config(&path.to_string_lossy())
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn open_kernel(global: &GlobalArgs, cfg: &Config) -> Result<Kernel> {
    let dir = global
        .state_dir
        .clone()
        .unwrap_or_else(|| config::resolve_state_dir(cfg));
    Kernel::open(&dir).with_context(|| format!("opening strand store in {}", dir.display()))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(global: &GlobalArgs, args: RunArgs) -> Result<()> {
    let cfg = load(global)?;
    let kernel = open_kernel(global, &cfg)?;
    let counts = kernel.strand_counts()?;
    info!(
        db = %kernel.db_path().display(),
        active = counts.active,
        finished = counts.finished,
        leased = counts.leased,
        "strand store opened"
    );

    let mut settings = DispatcherSettings::from_config(&cfg);
    if let Some(n) = args.pool_size {
        settings.pool_size = n.max(1);
    }
    let registry = Arc::new(Registry::with_builtins());
    info!(progs = ?registry.names(), "registered progs");
    let dispatcher = Dispatcher::new(kernel, registry, Bus::default(), settings);

    if args.once {
        let started = dispatcher.start_cohort().await?;
        dispatcher.drain().await;
        info!(started, "cohort finished");
        return Ok(());
    }
    dispatcher
        .run(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "ctrl-c handler failed; stopping");
            }
        })
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    tendril_otel::init();
    let cli = Cli::parse();
    let global = cli.global;
    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(&global, args).await,
        Commands::PrintSchema => print_json(&config::config_schema_json()),
        Commands::Strands { limit } => {
            let kernel = open_kernel(&global, &load(&global)?)?;
            let rows = kernel.list_strands(limit)?;
            print_json(&json!({
                "counts": kernel.strand_counts()?,
                "strands": rows,
            }))
        }
        Commands::Pages { all, limit } => {
            let kernel = open_kernel(&global, &load(&global)?)?;
            print_json(&serde_json::to_value(kernel.list_pages(!all, limit)?)?)
        }
        Commands::Signal { strand, name } => {
            let kernel = open_kernel(&global, &load(&global)?)?;
            let registry = Registry::with_builtins();
            tendril_core::signal(&kernel, &registry, &Bus::default(), &strand, &name).await?;
            println!("{strand}: {name} set");
            Ok(())
        }
        Commands::Resolve { tag } => {
            let kernel = open_kernel(&global, &load(&global)?)?;
            if PageNexus::resolve(&kernel, &tag).await? {
                println!("{tag}: resolve requested");
            } else {
                println!("{tag}: no open page");
            }
            Ok(())
        }
    }
}
