use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bulwark::clock::{Clock, ManualClock};
use bulwark::config::BulwarkConfig;
use bulwark::ratelimit::{CallerTier, LimitSelector, LimiterKind, RateLimitGuard, RateLimitRequest};
use bulwark::store::{CounterStore, MemoryStore, RetryingStore};

#[derive(Parser)]
#[command(name = "bulwark", version, about = "Rate limiting and circuit breaking toolkit")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective ceiling of every limiter for a tier
    Limits {
        #[arg(long, default_value = "free")]
        tier: CallerTier,

        /// System load in [0, 1]
        #[arg(long)]
        load: Option<f64>,
    },

    /// Drive requests through the limiter chain against an in-memory store
    Simulate {
        #[arg(long, default_value = "demo-user")]
        identifier: String,

        #[arg(long, default_value = "api")]
        endpoint: LimiterKind,

        #[arg(long, default_value = "free")]
        tier: CallerTier,

        #[arg(long, default_value_t = 15)]
        requests: u32,

        /// Simulated time between requests
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        #[arg(long)]
        user_agent: Option<String>,

        #[arg(long)]
        load: Option<f64>,

        /// Configuration file (YAML)
        #[arg(long)]
        config: Option<String>,
    },

    /// Load and validate a configuration file, then print it
    CheckConfig { path: String },
}

#[derive(Serialize)]
struct LimitRow {
    limiter: LimiterKind,
    base: u64,
    effective: u64,
    window_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Limits { tier, load } => print_limits(tier, load),
        Command::Simulate {
            identifier,
            endpoint,
            tier,
            requests,
            interval_ms,
            user_agent,
            load,
            config,
        } => {
            let config = BulwarkConfig::load(config.as_deref()).context("loading configuration")?;

            let mut request = RateLimitRequest::new(identifier, endpoint).with_tier(tier);
            if let Some(agent) = user_agent {
                request = request.with_user_agent(agent);
            }
            if let Some(load) = load {
                request = request.with_system_load(load);
            }

            simulate(&config, &request, requests, Duration::from_millis(interval_ms)).await
        }
        Command::CheckConfig { path } => {
            let config = BulwarkConfig::load(Some(path.as_str()))
                .with_context(|| format!("invalid configuration in {}", path))?;
            info!(path = %path, "Configuration is valid");
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_limits(tier: CallerTier, load: Option<f64>) -> anyhow::Result<()> {
    let mut selector = LimitSelector::new(tier);
    if let Some(load) = load {
        selector = selector.with_load(load);
    }

    for kind in LimiterKind::ALL {
        let row = LimitRow {
            limiter: kind,
            base: kind.ceiling(),
            effective: selector.ceiling(kind),
            window_secs: kind.window().as_secs(),
        };
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}

/// Run `requests` checks on a simulated clock and print one JSON line per
/// outcome.
async fn simulate(
    config: &BulwarkConfig,
    request: &RateLimitRequest,
    requests: u32,
    interval: Duration,
) -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let memory: Arc<dyn CounterStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
    let store = Arc::new(RetryingStore::new(memory, config.retry.policy()));
    let guard = RateLimitGuard::from_config(store, clock.clone(), &config.rate_limiting);

    info!(
        identifier = %request.identifier,
        endpoint = %request.endpoint,
        tier = %request.tier,
        requests,
        "Starting simulation"
    );

    let mut allowed = 0u32;
    for n in 1..=requests {
        let outcome = guard.check(request).await;
        if outcome.is_allowed() {
            allowed += 1;
        }

        let headers: BTreeMap<&str, String> = outcome.headers().into_iter().collect();
        let line = serde_json::json!({
            "request": n,
            "at": clock.now().to_rfc3339(),
            "result": outcome,
            "headers": headers,
        });
        println!("{}", serde_json::to_string(&line)?);

        clock.advance(interval);
    }

    info!(allowed, rejected = requests - allowed, "Simulation finished");
    Ok(())
}
