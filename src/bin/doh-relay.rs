use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread::Builder;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use doh_relay::config::Config;
use doh_relay::dns::rate_limit::RateLimiter;
use doh_relay::dns::relay::Relay;
use doh_relay::dns::shutdown::{ShutdownCoordinator, Signals};
use doh_relay::dns::upstream::build_upstreams;
use doh_relay::web::router::{Router, RouterOptions};
use doh_relay::web::server::DohServer;
use doh_relay::web::Result;

#[derive(Parser)]
#[command(name = "doh-relay")]
#[command(version, about = "DNS-over-HTTPS relay", long_about = None)]
struct Cli {
    /// YAML configuration file, defaults apply when omitted
    #[arg(short, long, env = "DOH_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "DOH_RELAY_JSON_LOGS")]
    json_logs: bool,
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let init_result = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if let Err(e) = init_result {
        eprintln!("failed to initialize logging: {}", e);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_ref())?;

    // reqwest's blocking clients live inside the upstreams and must be
    // created and dropped outside of the signal runtime
    let upstreams = build_upstreams(&config.upstream.custom_upstream)?;
    tracing::info!(
        upstreams = upstreams.len(),
        rate_limit = config.ip_rate_limit.enabled,
        http_caching = config.caching.enable_http_caching,
        ttl_override_max = config.caching.ttl_override_max,
        "relay configured"
    );

    let relay = Arc::new(Relay::new(upstreams, config.caching.ttl_override_max));
    let limiter = Arc::new(RateLimiter::from_config(&config.ip_rate_limit));
    let router = Arc::new(Router::new(
        relay,
        limiter,
        RouterOptions::from_config(&config),
    ));

    let coordinator = Arc::new(ShutdownCoordinator::new(
        config.server.timeout_millis.shutdown(),
    ));
    let server = Arc::new(DohServer::bind(
        &config.server,
        router,
        coordinator.clone(),
    )?);
    let handle = server.handle();

    let listener = {
        let server = server.clone();
        Builder::new()
            .name("doh-listener".to_string())
            .spawn(move || server.run())?
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let drained = runtime.block_on(async {
        let mut signals = Signals::install()?;

        let name = signals.recv().await;
        log::info!("received {}, shutting down", name);
        coordinator.begin_shutdown()?;
        handle.unblock();

        tokio::select! {
            res = coordinator.wait_for_drain() => res,
            name = signals.recv() => {
                log::warn!("received {} during shutdown, exiting immediately", name);
                process::exit(1)
            }
        }
    });

    if listener.join().is_err() {
        log::error!("listener thread panicked");
    }

    drained?;
    log::info!("shutdown complete");

    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    if let Err(e) = run(cli) {
        log::error!("{}", e);
        process::exit(1);
    }
}
