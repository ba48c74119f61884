use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use futures::future::join_all;
use shellbeat_core::ShellbeatConfig;
use shellbeat_monitor::{CheckEvent, ShellJob};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the monitors config file
    #[arg(short, long, env = "SHELLBEAT_CONFIG", default_value = "shellbeat.toml")]
    config: String,

    /// Run every check once and exit; status 1 if any check is down
    #[arg(long)]
    once: bool,

    /// Log output format (logs go to stderr)
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn load_config(path: &str) -> Result<ShellbeatConfig> {
    if Path::new(path).exists() {
        ShellbeatConfig::load(path)
    } else {
        warn!("Config file {} not found", path);
        Ok(ShellbeatConfig::load_or_default(path))
    }
}

/// One job per (monitor, host). Docker monitors without hosts use the local daemon.
fn build_jobs(config: &ShellbeatConfig) -> Result<Vec<Arc<ShellJob>>> {
    let mut jobs = Vec::new();
    for monitor in &config.monitors {
        let hosts = if monitor.docker && monitor.hosts.is_empty() {
            vec![String::new()]
        } else {
            monitor.hosts.clone()
        };
        for host in hosts {
            let job = ShellJob::from_config(monitor, &host)
                .with_context(|| format!("Failed to create job {} for '{}'", monitor.name, host))?
                .with_retry_delay(config.retry_delay());
            jobs.push(Arc::new(job));
        }
    }
    Ok(jobs)
}

/// Run one invocation and print its event line. Returns whether the check was up.
async fn check(job: &ShellJob) -> bool {
    let outcome = job.run_once().await;
    let event = CheckEvent::new(job.monitor(), job.host(), &outcome);
    match event.to_json() {
        Ok(line) => println!("{}", line),
        Err(e) => error!("Failed to serialize event for {}: {}", job.monitor().name, e),
    }
    outcome.is_up()
}

async fn close_all(jobs: &[Arc<ShellJob>]) {
    join_all(jobs.iter().map(|job| job.close())).await;
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Loading config from {}...", args.config);
    let config = load_config(&args.config)?;
    let jobs = build_jobs(&config)?;
    info!("Starting {} job(s)", jobs.len());

    if args.once {
        let results = join_all(jobs.iter().map(|job| check(job))).await;
        close_all(&jobs).await;
        let down = results.iter().filter(|up| !**up).count();
        if down > 0 {
            warn!("{} check(s) down", down);
            return Ok(ExitCode::from(1));
        }
        return Ok(ExitCode::SUCCESS);
    }

    let mut handles = Vec::new();
    for job in &jobs {
        let job = job.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(job.monitor().schedule());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                check(&job).await;
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");
    for handle in &handles {
        handle.abort();
    }
    close_all(&jobs).await;
    Ok(ExitCode::SUCCESS)
}
