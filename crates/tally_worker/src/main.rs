mod config;

use common::nats::NatsClient;
use common::postgres::{PostgresClient, PostgresCountingResultRepository};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryProviders};
use config::ServiceConfig;
use goose::MigrationRunner;
use result_worker::result_worker::{ResultWorker, ResultWorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tally_runner::Runner;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&config.telemetry()) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        queue = %config.nats_queue_name,
        otel_enabled = config.otel_enabled,
        "Starting tally-worker service"
    );
    debug!("Configuration: {:?}", config);

    let (postgres_client, nats_client) = match initialize_dependencies(&config).await {
        Ok(deps) => deps,
        Err(e) => {
            error!("Failed to initialize dependencies: {:#}", e);
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let repository = Arc::new(PostgresCountingResultRepository::new(postgres_client));

    let worker = ResultWorker::new(
        repository,
        nats_client.create_queue_consumer(),
        ResultWorkerConfig {
            queue_name: config.nats_queue_name.clone(),
            queue_group: config.queue_group(),
            max_in_flight: config.max_in_flight,
            drain_timeout: config.drain_timeout(),
        },
    );

    Runner::new()
        .with_named_process("result_worker", worker.into_runner_process())
        .with_closer({
            let nats_client = Arc::clone(&nats_client);
            move || async move {
                info!("Running cleanup tasks...");
                nats_client.close().await;
                shutdown_telemetry(telemetry_providers);
                info!("Cleanup complete");
                Ok(())
            }
        })
        .with_closer_timeout(Duration::from_secs(10))
        .run()
        .await;
}

async fn initialize_dependencies(
    config: &ServiceConfig,
) -> anyhow::Result<(PostgresClient, Arc<NatsClient>)> {
    info!("Initializing PostgreSQL...");
    run_postgres_migrations(config).await?;

    let postgres_client = PostgresClient::new(&config.postgres())?;
    tokio::time::timeout(config.startup_timeout(), postgres_client.ping())
        .await
        .map_err(|_| anyhow::anyhow!("PostgreSQL did not answer within startup timeout"))??;

    info!("Initializing NATS...");
    let nats_client = Arc::new(NatsClient::connect(&config.nats_url, config.startup_timeout()).await?);

    Ok((postgres_client, nats_client))
}

async fn run_postgres_migrations(config: &ServiceConfig) -> anyhow::Result<()> {
    MigrationRunner::new(
        config.postgres_goose_binary_path.clone(),
        config.postgres_migrations_dir.clone(),
        "postgres",
        config.postgres().dsn(),
    )
    .run_migrations()
    .await
}
