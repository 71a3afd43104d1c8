use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use node::chains::chain_data::ChainDataService;
use node::chains::indexer::{indexer_chains, IndexerReader};
use node::chains::SignatureVerifier;
use node::config::NodeConfig;
use node::gc::GarbageCollector;
use node::handlers::ContentHandlers;
use node::mq::MqTopology;
use node::pipeline::fetcher::PendingMessageFetcher;
use node::pipeline::message_handler::MessageHandler;
use node::pipeline::tx_processor::PendingTxProcessor;
use node::pipeline::worker::MessageWorker;
use node::storage::engine::FileSystemStorageEngine;
use node::storage::ipfs::IpfsClient;
use node::storage::StorageService;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Parser)]
#[command(name = "ccn-node", about = "Core channel node daemon")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "CCN_CONFIG")]
    config: Option<PathBuf>,

    /// Postgres URL, overriding the configuration file.
    #[arg(long, env = "CCN_DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    let database_url = args
        .database_url
        .unwrap_or_else(|| config.postgres.url.clone());
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.pool_size)
        .connect(&database_url)
        .await
        .context("connecting to postgres")?;
    MIGRATOR.run(&pool).await.context("running migrations")?;

    let ipfs = config
        .ipfs
        .enabled
        .then(|| IpfsClient::new(&config.ipfs.api_url));
    let storage = Arc::new(StorageService::new(
        Arc::new(FileSystemStorageEngine::new(&config.storage.folder)),
        ipfs,
        config.p2p.api_servers.clone(),
    ));

    let mq = MqTopology::new();
    let verifier = Arc::new(SignatureVerifier::new());
    let handlers = ContentHandlers::new(storage.clone(), &config);
    let message_handler = Arc::new(MessageHandler::new(
        verifier,
        storage.clone(),
        handlers,
        config.aleph.jobs.pending_messages.max_retries,
    ));
    let chain_data = Arc::new(ChainDataService::new(storage.clone()));

    let fetcher = Arc::new(PendingMessageFetcher::new(
        pool.clone(),
        message_handler.clone(),
        mq.message_processing.clone(),
        config.aleph.jobs.pending_messages.max_concurrency,
    ));
    let worker = Arc::new(MessageWorker::new(
        pool.clone(),
        message_handler.clone(),
        mq.message_processing.clone(),
        mq.message_result.clone(),
        format!("worker-{}", std::process::id()),
    ));
    let tx_processor = Arc::new(PendingTxProcessor::new(
        pool.clone(),
        chain_data,
        message_handler,
        mq.pending_tx.clone(),
        mq.message_processing.clone(),
        config.aleph.jobs.pending_txs.max_concurrency,
    ));
    let garbage_collector = Arc::new(GarbageCollector::new(
        pool.clone(),
        storage,
        Duration::from_secs(config.storage.garbage_collector_period),
    ));

    let mut tasks = vec![
        tokio::spawn(fetcher.run()),
        tokio::spawn(worker.run()),
        tokio::spawn(tx_processor.run()),
        tokio::spawn(garbage_collector.run()),
    ];

    for (chain, event_type) in indexer_chains() {
        let Some(chain_config) = config.chains.get(&chain) else {
            continue;
        };
        if !chain_config.enabled {
            continue;
        }
        let (Some(indexer_url), Some(sync_contract)) = (
            chain_config.indexer_url.clone(),
            chain_config.sync_contract.clone(),
        ) else {
            tracing::warn!(%chain, "chain enabled without indexer_url/sync_contract");
            continue;
        };
        let reader = Arc::new(IndexerReader::new(chain, event_type, pool.clone()));
        tasks.push(tokio::spawn(async move {
            reader.run(indexer_url, sync_contract).await;
        }));
    }

    tracing::info!("node started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}
