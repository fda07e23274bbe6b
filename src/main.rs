// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Indexing worker: consumes `news_indexing` and keeps the `news` search index
//! in sync until SIGINT or SIGTERM.

use news_indexer::{
    channel::ConnectionManager,
    config::Settings,
    dispatcher::{IndexingWorker, WorkerExit},
    errors::WorkerError,
    indexer::SearchIndex,
    lapin_broker::LapinBroker,
    logging,
    opensearch::OpenSearchIndex,
};
use std::{process::ExitCode, sync::Arc};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let settings = match Settings::load().map_err(WorkerError::from) {
        Ok(settings) => settings,
        Err(err) => {
            logging::init("info");
            error!(error = err.to_string(), "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log_level);

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<(), WorkerError> {
    info!(app = %settings.app_name, "starting indexing worker");

    let index = OpenSearchIndex::new(
        &settings.elasticsearch_url,
        &settings.index_name,
        Some(settings.elasticsearch_username.as_str()),
        settings.elasticsearch_password(),
    )?;

    if index.check_connectivity().await {
        if let Err(err) = index.ensure_index_exists().await {
            warn!(error = err.to_string(), "could not create search index");
        }
    } else {
        warn!("search engine not available, indexing will fail until it is back");
    }

    let broker = LapinBroker::new(&settings.rabbitmq_url, &settings.app_name);
    let manager = ConnectionManager::new(
        Arc::new(broker),
        settings.queue(),
        settings.reconnect_delay(),
    );

    // Failures here are retried in the background.
    if let Err(err) = manager.connect().await {
        warn!(error = err.to_string(), "broker not reachable at startup");
    }

    let worker = IndexingWorker::new(
        manager,
        Arc::new(index),
        settings.retry_policy(),
        settings.prefetch,
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutting down worker...");
        let _ = shutdown_tx.send(true);
    });

    if worker.run(shutdown_rx.clone()).await == WorkerExit::ConsumerCancelled {
        warn!("no longer consuming, waiting for shutdown");
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    }

    worker.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = err.to_string(), "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = err.to_string(), "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
