//! slabkv command-line interface
//!
//! Operates on a store directory holding `pool.bin` and `pool.journal`.
//!
//! # Examples
//!
//! ```bash
//! # Create an empty store
//! slabkv data/kv create
//!
//! # Insert and read back a value (JSON, or a plain string)
//! slabkv data/kv put 5 '{"answer": 42}'
//! slabkv data/kv get 5
//!
//! # Visit every pair with 4 workers
//! slabkv data/kv scan --concurrency 4
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde_json::Value;
use slabkv::{HybridStore, StoreConfig};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Store = HybridStore<u64, Value>;

/// Crash-consistent slab key-value store
#[derive(Parser, Debug)]
#[command(name = "slabkv")]
#[command(version = slabkv::VERSION)]
#[command(about = "Crash-consistent slab allocator with a hybrid key-value store", long_about = None)]
struct Cli {
    /// Store directory
    path: PathBuf,

    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true, env = "SLABKV_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Also write logs to daily rotated files in this directory
    #[arg(long, global = true, env = "SLABKV_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty store
    Create,

    /// Print the value stored under a key
    Get { key: u64 },

    /// Insert a new key
    Put {
        key: u64,
        /// JSON value; anything that is not valid JSON is stored as a string
        value: String,
    },

    /// Replace the value of an existing key
    Update { key: u64, value: String },

    /// Remove a key
    Remove { key: u64 },

    /// Print every stored pair
    Scan {
        /// Worker threads (defaults to the configured scan concurrency)
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Show storage statistics
    Stats,

    /// Check the free list, the occupied slots and the index
    Verify,

    /// Run the slot reuse walkthrough on a fresh store
    Demo,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config = StoreConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let path = cli.path.as_path();

    match cli.command {
        Commands::Create => {
            Store::create(path, &config)?.close()?;
            println!("created store at {}", path.display());
            Ok(())
        }
        Commands::Get { key } => {
            let store = Store::open(path, &config)?;
            println!("{}", store.get(&key)?);
            Ok(store.close()?)
        }
        Commands::Put { key, value } => {
            let store = Store::open_or_create(path, &config)?;
            let idx = store.insert(key, parse_value(&value))?;
            println!("{}", idx);
            Ok(store.close()?)
        }
        Commands::Update { key, value } => {
            let store = Store::open(path, &config)?;
            store.update(&key, parse_value(&value))?;
            Ok(store.close()?)
        }
        Commands::Remove { key } => {
            let store = Store::open(path, &config)?;
            store.remove(&key)?;
            Ok(store.close()?)
        }
        Commands::Scan { concurrency } => {
            scan_command(path, &config, concurrency.unwrap_or(config.scan_concurrency))
        }
        Commands::Stats => {
            let store = Store::open(path, &config)?;
            println!("{}", serde_json::to_string_pretty(&store.stats()?)?);
            Ok(store.close()?)
        }
        Commands::Verify => {
            let store = Store::open(path, &config)?;
            let report = store.verify()?;
            println!(
                "ok: {} slots, {} occupied, {} free",
                report.len, report.occupied, report.free
            );
            Ok(store.close()?)
        }
        Commands::Demo => demo_command(path, &config),
    }
}

/// Setup logging to stderr and, optionally, rolling files
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::WARN);

    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "slabkv.log");
            Some(fmt::layer().with_writer(file_appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn scan_command(path: &Path, config: &StoreConfig, concurrency: usize) -> anyhow::Result<()> {
    let store = Store::open(path, config)?;

    let pairs = Mutex::new(Vec::new());
    store.scan(concurrency, |idx, key, value| {
        pairs.lock().push((idx, *key, value.clone()));
        Ok(())
    })?;

    let mut pairs = pairs.into_inner();
    pairs.sort_by_key(|(idx, _, _)| *idx);
    for (idx, key, value) in &pairs {
        println!("{}\t{}\t{}", idx, key, value);
    }

    Ok(store.close()?)
}

/// Two keys, both freed, then reinserted: freed slots come back LIFO
fn demo_command(path: &Path, config: &StoreConfig) -> anyhow::Result<()> {
    if slabkv::Pool::exists(path) {
        bail!("{} already holds a store; demo needs a fresh path", path.display());
    }

    let store = Store::create(path, config)?;
    let first = store.insert(5, Value::from(10))?;
    let second = store.insert(15, Value::from(20))?;
    println!("insert 5 -> {}, insert 15 -> {}", first, second);
    store.close()?;

    let store = Store::open(path, config)?;
    println!(
        "after reopen: 5 = {}, 15 = {}",
        store.get(&5)?,
        store.get(&15)?
    );

    store.remove(&5)?;
    store.remove(&15)?;
    println!("removed 5 and 15");

    let first = store.insert(5, Value::from(10))?;
    let second = store.insert(15, Value::from(20))?;
    let third = store.insert(20, Value::from(25))?;
    println!(
        "insert 5 -> {}, insert 15 -> {}, insert 20 -> {}",
        first, second, third
    );

    let report = store.verify()?;
    info!(?report, "Demo finished");
    println!(
        "verify: {} slots, {} occupied, {} free",
        report.len, report.occupied, report.free
    );

    Ok(store.close()?)
}
