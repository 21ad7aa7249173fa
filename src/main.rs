use clap::Parser;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use shiftdns::{Proxy, ProxyConfig, normalize_upstream};

#[derive(Parser)]
#[command(name = "shiftdns")]
#[command(about = "Caching DNS forwarder that races upstream resolvers", long_about = None)]
struct Args {
    /// Address to listen on (IP literal)
    #[arg(short, long, default_value = "127.0.0.1")]
    listen: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 53, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Upstream DNS server, port 53 if omitted (repeatable)
    #[arg(short, long = "upstream", default_values_t = vec!["8.8.8.8:53".to_string(), "1.1.1.1:53".to_string()])]
    upstreams: Vec<String>,

    /// Lifetime of cached responses, in seconds
    #[arg(long, default_value_t = 600)]
    cache_ttl: u64,

    /// Maximum number of cached responses (0 = unbounded)
    #[arg(long, default_value_t = 10_000)]
    max_cache_entries: usize,

    /// Enable debug logging (per-query events)
    #[arg(long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> shiftdns::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let upstreams: Vec<String> = args.upstreams.iter().map(|u| normalize_upstream(u)).collect();
    let config = ProxyConfig {
        cache_ttl: Duration::from_secs(args.cache_ttl),
        max_cache_entries: args.max_cache_entries,
        ..ProxyConfig::default()
    };

    let proxy = Proxy::with_config(args.listen, args.port, upstreams, config);
    if proxy.listen_port() < 1024 {
        info!(port = proxy.listen_port(), "binding a privileged port may require elevated privileges");
    }
    proxy.start()?;

    // Print stats every minute
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.tick().await; // Skip first immediate tick
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for ctrl-c");
                }
                break;
            }
            _ = interval.tick() => {
                let stats = proxy.stats_snapshot_and_reset();
                info!(
                    uptime_secs = stats.uptime_secs,
                    cache = proxy.cache_size(),
                    requests = stats.requests,
                    forwarded = stats.forwarded,
                    cached = stats.cached,
                    dropped = stats.dropped,
                    avg_response_ms = %format!("{:.2}", stats.avg_response_ms),
                    "stats"
                );
            }
        }
    }

    proxy.stop().await
}
