//! engine-pool - Demo Driver
//!
//! Starts a pool of headless engines and pushes it through a burst of
//! concurrent acquires from blocking threads and an async task, then
//! releases everything and prints what the pool did.
//!
//! `main` stays synchronous: the pool's blocking calls must not run on an
//! async worker, so a runtime is built only to drive the async acquire.

use anyhow::{Context, Result};
use engine_pool::{
    init_logging, CallerContext, EnginePool, HeadlessFactory, Lease, PoolConfig, RenderEngine,
};
use std::path::PathBuf;
use std::thread;
use tracing::info;

const CONCURRENT_ACQUIRES: usize = 6;

fn print_help() {
    println!("engine-pool - Thread-confined rendering engine pool v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  engine-pool [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config <FILE>  Load pool configuration from a JSON file");
    println!("  -h, --help           Print this help message");
    println!("  -v, --version        Print version information");
    println!();
    println!("DESCRIPTION:");
    println!("  Warms a pool of headless engines, acquires {} of them concurrently", CONCURRENT_ACQUIRES);
    println!("  from blocking threads plus one from an async task, releases them all");
    println!("  and prints the resulting pool statistics and metrics.");
    println!();
    println!("  Log verbosity follows RUST_LOG (default: info).");
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<PathBuf> = None;

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("engine-pool {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "-c" | "--config" => match iter.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => {
                    eprintln!("error: '{}' requires a file argument", arg);
                    std::process::exit(1);
                }
            },
            _ => {
                eprintln!("error: unrecognized argument '{}'", arg);
                eprintln!("Run 'engine-pool --help' for usage information.");
                std::process::exit(1);
            }
        }
    }

    init_logging();

    let config = match &config_path {
        Some(path) => PoolConfig::from_json_file(path)?,
        None => PoolConfig::default(),
    };
    info!(?config, "Configuration loaded");

    let context = CallerContext::new("demo");
    let pool = EnginePool::new(HeadlessFactory::new(), config, context.clone())
        .context("Failed to start engine pool")?;
    info!(stats = ?pool.stats()?, "Pool warmed");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let mut leases = Vec::with_capacity(CONCURRENT_ACQUIRES + 1);
    thread::scope(|scope| -> Result<()> {
        let workers: Vec<_> = (0..CONCURRENT_ACQUIRES)
            .map(|_| scope.spawn(|| pool.acquire(&context)))
            .collect();
        for worker in workers {
            let lease = worker
                .join()
                .map_err(|_| anyhow::anyhow!("Acquire worker panicked"))??;
            leases.push(lease);
        }
        Ok(())
    })?;
    leases.push(runtime.block_on(pool.acquire_async(&context))?);

    for lease in &leases {
        if let Lease::Pooled(handle) = lease {
            let url = format!("https://example.com/{}", handle.id());
            pool.with_engine(*handle, move |engine| engine.load_url(&url))??;
        }
    }
    info!(stats = ?pool.stats()?, leased = leases.len(), "Engines leased");

    for lease in leases {
        pool.release_lease(lease);
    }

    let stats = pool.stats()?;
    println!();
    println!("Pool: {} available / {} in use (max {})", stats.available, stats.in_use, stats.max_available);
    pool.metrics().print_report();

    pool.shutdown();
    Ok(())
}
