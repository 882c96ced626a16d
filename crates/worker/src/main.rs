use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use siwatt_common::config::WorkerConfig;
use siwatt_worker::buffer::FileBuffer;
use siwatt_worker::store::StoreClient;
use siwatt_worker::worker::IngestWorker;

#[derive(Parser, Debug)]
#[command(
    name = "siwatt-worker",
    version,
    about = "Telemetry ingestion worker for siwatt energy meters"
)]
struct Args {
    /// Mark stale devices offline once and exit, instead of running the
    /// ingest loop. Intended to be invoked from cron.
    #[arg(long)]
    sweep_offline: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let args = Args::parse();
    let config = WorkerConfig::from_env();

    tracing::info!("siwatt worker starting");

    let store = match StoreClient::connect(&config.database.url(), 5).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to MySQL");
            std::process::exit(1);
        }
    };

    if let Err(e) = store.migrate().await {
        tracing::error!(error = %e, "Failed to run MySQL migrations");
        std::process::exit(1);
    }

    let store = Arc::new(store);

    if args.sweep_offline {
        match store.sweep_offline().await {
            Ok(swept) => tracing::info!(swept, "offline sweep complete"),
            Err(e) => {
                tracing::error!(error = %e, "offline sweep failed");
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
    {
        tracing::error!(error = %e, "Failed to install Prometheus metrics exporter");
        std::process::exit(1);
    }

    let buffer = match FileBuffer::new(&config.buffer_dir) {
        Ok(buffer) => buffer,
        Err(e) => {
            tracing::error!(error = %e, buffer_dir = %config.buffer_dir.display(), "Failed to open buffer directory");
            std::process::exit(1);
        }
    };

    let mut worker = IngestWorker::new(config, store, buffer);
    if let Err(e) = worker.run().await {
        tracing::error!(error = %e, "worker terminated");
        std::process::exit(1);
    }
}
