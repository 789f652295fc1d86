use clap::Parser;
use ingest::config::{Config, StatsdConfig};
use ingest::errors::IngestError;
use ingest::lifecycle::{retry, SETUP_RETRY_ATTEMPTS, SETUP_RETRY_DELAY};
use metrics_exporter_statsd::StatsdBuilder;
use std::process;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "pops", about = "Metrics and events ingress proxy")]
enum CliCommand {
    /// Run the proxy, configured from the environment
    Serve,
    /// Show all metrics definitions as markdown table
    ShowMetrics,
}

fn main() {
    match CliCommand::parse() {
        CliCommand::Serve => {
            if let Err(e) = serve() {
                eprintln!("pops: {e}");
                process::exit(1);
            }
        }
        CliCommand::ShowMetrics => {
            println!(
                "{}",
                shared::metrics_defs::markdown_table(ingest::metrics_defs::ALL_METRICS)
            );
        }
    }
}

fn serve() -> Result<(), IngestError> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = rt.block_on(async {
        let config = retry(
            "load configuration",
            SETUP_RETRY_ATTEMPTS,
            SETUP_RETRY_DELAY,
            || async { Config::from_env() },
        )
        .await?;

        init_tracing(&config);

        let statsd = config.statsd.clone();
        let source_name = config.source_name.clone();
        retry(
            "initialize self reporting",
            SETUP_RETRY_ATTEMPTS,
            SETUP_RETRY_DELAY,
            || {
                let statsd = statsd.clone();
                let source_name = source_name.clone();
                async move { init_statsd_recorder(statsd, source_name) }
            },
        )
        .await?;

        tracing::info!(port = config.ingest_port, "starting pops server");
        ingest::run(config, shutdown_signal()).await
    });

    if let Err(e) = &result {
        tracing::error!(error = %e, "server exited with error");
    }
    result
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        match sigterm {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, initiating graceful shutdown");
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_tracing(config: &Config) {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    );

    match log_file(config) {
        Some(file) => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(file))
            .init(),
        None => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// `LOG_DIR` selects a JSON log file; anything going wrong opening it
/// falls back to stderr so the process still comes up.
fn log_file(config: &Config) -> Option<std::fs::File> {
    let dir = config.log_dir.as_ref()?;
    let path = dir.join("pops.log.json");
    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("pops: cannot open {}: {e}; logging to stderr", path.display());
            None
        }
    }
}

fn init_statsd_recorder(
    statsd: Option<StatsdConfig>,
    source_name: String,
) -> Result<(), IngestError> {
    let Some(StatsdConfig { host, port }) = statsd else {
        tracing::info!("statsd not configured; self metrics stay local");
        return Ok(());
    };

    let mut builder = StatsdBuilder::from(host, port);
    if !source_name.is_empty() {
        builder = builder.with_default_tag("sf_source", source_name);
    }
    let recorder = builder
        .build(Some("pops"))
        .map_err(|e| IngestError::SelfReporting(e.to_string()))?;

    metrics::set_global_recorder(recorder)
        .map_err(|e| IngestError::SelfReporting(e.to_string()))?;
    Ok(())
}
