mod cache;
mod config;
mod local;
mod proto;
mod resolver;
mod server;
mod stats;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{load_config, Config};
use crate::server::DnsServer;
use crate::stats::render_report;

#[derive(Parser, Debug)]
#[command(author, version, about = "Caching hybrid DNS responder for A queries over UDP", long_about = None)]
struct Args {
    /// UDP port to listen on (overrides the config file)
    port: Option<u16>,
    /// Path to the JSON config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Listener workers (default: hardware parallelism, at least 4)
    #[arg(long = "workers", default_value_t = 0)]
    workers: usize,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    let port = args.port.unwrap_or(cfg.port);
    let workers = if args.workers > 0 { args.workers } else { cfg.workers };

    let mut server = DnsServer::bind(port, workers, Duration::from_millis(cfg.upstream_timeout_ms))
        .context("start dns server")?;
    for upstream in &cfg.upstreams {
        let addr = upstream
            .parse()
            .with_context(|| format!("invalid upstream address {upstream}"))?;
        server.add_upstream_resolver(addr);
    }
    for (domain, ip) in &cfg.local_domains {
        server.add_local_domain(domain, *ip);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))
            .context("register signal handler")?;
    }

    server.start()?;
    info!(addr = %server.local_addr()?, upstreams = cfg.upstreams.len(), "serving dns queries");

    let cache = server.cache();
    let stats = server.stats();
    let interval = Duration::from_secs(cfg.stats_interval_secs.max(1));
    let tick = Duration::from_millis(200);
    let mut since_report = Duration::ZERO;
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(tick);
        since_report += tick;
        if since_report >= interval {
            since_report = Duration::ZERO;
            cache.sweep();
            println!("{}", render_report(&stats.percentile_stats(), &cache.stats()));
        }
    }

    info!("shutdown signal received");
    server.stop();
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false);

    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
