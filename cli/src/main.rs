//! chainreplay CLI — validate indexer configs and inspect defaults.
//!
//! Usage:
//! ```bash
//! chainreplay check indexer.json
//! chainreplay check indexer.json --json
//! chainreplay info
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::env;
use std::fs;
use std::process;

use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainreplay_core::config::{IndexerConfig, SyncTuning};

fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "check" => cmd_check(&args[2..]),
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainreplay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "Command failed");
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_usage() {
    println!("chainreplay {}", env!("CARGO_PKG_VERSION"));
    println!("Multi-chain event log indexing core\n");
    println!("USAGE:");
    println!("    chainreplay <COMMAND>\n");
    println!("COMMANDS:");
    println!("    check <config.json> [--json]  Validate a config and print the per-network plan");
    println!("    info                          Show default sync tuning");
    println!("    version                       Print version");
    println!("    help                          Print this help");
}

fn cmd_check(args: &[String]) -> anyhow::Result<()> {
    let path = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .context("missing <config.json>")?;
    let as_json = args.iter().any(|a| a == "--json");

    let raw = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let config = IndexerConfig::from_json(&raw)?;
    tracing::debug!(path = %path, networks = config.networks.len(), "Config loaded");

    if as_json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("Config OK: {path}");
    for network in &config.networks {
        println!(
            "\n{} (chain {}): poll every {} ms, finality {} blocks",
            network.name, network.chain_id, network.polling_interval_ms, network.finality_block_count
        );
        let filters: Vec<_> = config
            .log_filters
            .iter()
            .filter(|f| f.chain_id == network.chain_id)
            .collect();
        if filters.is_empty() {
            println!("  (no log filters)");
        }
        for filter in filters {
            let end = filter
                .end_block
                .map_or_else(|| "finalized".to_string(), |b| b.to_string());
            let events: Vec<&str> = filter.events.values().map(|e| e.safe_name.as_str()).collect();
            println!(
                "  {:<20} blocks {}..={}  key {}  events [{}]",
                filter.name,
                filter.start_block,
                end,
                filter.filter_key(),
                events.join(", ")
            );
        }
    }
    for contract in &config.contracts {
        println!("\ncontract {} on {} at {}", contract.name, contract.network, contract.address);
    }
    Ok(())
}

fn cmd_info() {
    let tuning = SyncTuning::default();
    println!("ChainReplay v{}", env!("CARGO_PKG_VERSION"));
    println!("  Initial log window: {} blocks (min {})", tuning.max_block_range, tuning.min_block_range);
    println!("  Historical workers per network: {}", tuning.historical_concurrency);
    println!("  Max reorg depth: {} blocks", tuning.max_reorg_depth);
    println!("  Event page size: {}", tuning.event_page_size);
    println!(
        "  Provider retries: {} (backoff {}..{} ms, x{})",
        tuning.retry.max_retries, tuning.retry.initial_backoff_ms, tuning.retry.max_backoff_ms, tuning.retry.multiplier
    );
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}
