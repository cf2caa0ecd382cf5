use anyhow::bail;
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tally_server::server::{
    config::{Cli, Command, CounterBackend, ServerConfig},
    reconciler::Reconciler,
    search::{MemoryIndex, ReindexSweep, SearchIndex, SqliteIndex},
    service::{gaps::gap_report, handler::PipelineService},
    store::{SqlCounterStore, SqliteStore},
    telemetry::init_telemetry,
};
use tally_server::tally::{CounterStore, MemoryCounterStore, NumberAllocator};
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli.args)?;

    let providers = init_telemetry()?;
    let command = cli.command.unwrap_or(Command::Serve);
    log_startup_info(&command, &config);

    let store = SqliteStore::connect(&config.database_url, config.database_max_connections).await?;
    store.health_check().await?;

    let result = run(command, &config, &store).await;

    store.close().await;
    providers.shutdown();
    result
}

/// Only `serve` and `dead-letters --requeue` run the pipeline; the other
/// commands touch the store, counters or index directly.
async fn run(command: Command, config: &ServerConfig, store: &SqliteStore) -> anyhow::Result<()> {
    match command {
        Command::Serve => {
            if config.counter_backend == CounterBackend::Memory {
                tracing::warn!(
                    "COUNTER_BACKEND is memory: counters live in this process only, \
                     run a single instance"
                );
            }
            let service = start_pipeline(config, store).await?;
            shutdown_signal().await;
            service.shutdown().await?;
            Ok(())
        }
        Command::Reconcile => {
            let reconciler = Reconciler::new(store.clone(), config.pipeline.reconcile_interval);
            print_json(&reconciler.sweep().await?)
        }
        Command::Reindex { full, after } => {
            let sweep = ReindexSweep::new(
                store.clone(),
                build_index(config).await?,
                config.pipeline.reindex_batch_size,
            );
            let report = if full {
                sweep.rebuild().await?
            } else {
                sweep.resume_after(after).await?
            };
            print_json(&report)
        }
        Command::Gaps { max_missing } => {
            let counters = build_counters(config).await?;
            // In-process counters start empty.
            NumberAllocator::new(Arc::clone(&counters))
                .recover(store.max_numbers().await?)
                .await?;
            print_json(&gap_report(store, counters.as_ref(), max_missing).await?)
        }
        Command::RebuildCounters => {
            let counters = build_counters(config).await?;
            let raised = NumberAllocator::new(counters)
                .recover(store.max_numbers().await?)
                .await?;
            print_json(&serde_json::json!({ "raised": raised }))
        }
        Command::DeadLetters {
            requeue: Some(id), ..
        } => {
            let service = start_pipeline(config, store).await?;
            let requeued = service.requeue_dead_letter(id).await;
            service.drain(config.pipeline.shutdown_timeout).await;
            service.shutdown().await?;
            print_json(&serde_json::json!({ "requeued": id, "task_id": requeued? }))
        }
        Command::DeadLetters {
            release: Some(id), ..
        } => {
            if !store.release_dead_letter(id).await? {
                bail!("dead letter {id} is not requeued");
            }
            print_json(&serde_json::json!({ "released": id }))
        }
        Command::DeadLetters { limit, .. } => {
            let total = store.dead_letter_count().await?;
            let letters = store.dead_letters(limit).await?;
            print_json(&serde_json::json!({ "total": total, "dead_letters": letters }))
        }
    }
}

async fn start_pipeline(
    config: &ServerConfig,
    store: &SqliteStore,
) -> anyhow::Result<PipelineService> {
    let counters = build_counters(config).await?;
    let index = build_index(config).await?;
    Ok(PipelineService::start(config.pipeline.clone(), store.clone(), counters, index).await?)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn build_counters(config: &ServerConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    let counters: Arc<dyn CounterStore> = match config.counter_backend {
        CounterBackend::Memory => Arc::new(MemoryCounterStore::new()),
        CounterBackend::Sql => Arc::new(SqlCounterStore::connect(&config.database_url).await?),
        #[cfg(feature = "redis")]
        CounterBackend::Redis => {
            let url = config
                .counter_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("COUNTER_URL is required for redis"))?;
            Arc::new(tally_server::server::store::RedisCounterStore::connect(url).await?)
        }
        #[cfg(not(feature = "redis"))]
        CounterBackend::Redis => {
            bail!("COUNTER_BACKEND redis requires building with the `redis` feature")
        }
    };
    Ok(counters)
}

async fn build_index(config: &ServerConfig) -> anyhow::Result<Arc<dyn SearchIndex>> {
    if config.search_index_url == "memory" {
        return Ok(Arc::new(MemoryIndex::new()));
    }
    Ok(Arc::new(SqliteIndex::connect(&config.search_index_url).await?))
}

fn log_startup_info(command: &Command, config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Running {command:?} with full config: {config:#?}");
    } else {
        tracing::info!(
            "Running {:?} with {} workers, {:?} counters, backlog limit {}",
            command,
            config.pipeline.num_workers,
            config.counter_backend,
            config.pipeline.max_backlog
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
}
