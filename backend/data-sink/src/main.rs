//! Data Sink - Main entry point
//!
//! Consumes `KAFKA_TOPIC` in consumer group `KAFKA_GROUP_ID` and upserts every
//! record into MongoDB. Runs `FORWARDER_INSTANCES` loops sharing one MongoDB
//! client; exits non-zero if any loop halts on a fatal error.

use anyhow::{anyhow, Context, Result};
use data_sink::consumer::kafka::{create_consumer, KafkaConsumerConfig};
use data_sink::sink::mongo;
use data_sink::{
    DeadLetterSink, DocumentSink, Forwarder, ForwarderConfig, KafkaDeadLetterConfig,
    KafkaDeadLetterSink, KafkaOffsetStore, KafkaRecordSource, LogOnlyDeadLetterSink, MemorySink,
    MongoSink, SinkError, Settings,
};
use futures::stream::{FuturesUnordered, StreamExt};
use resilience::{presets, with_retry_if};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,data_sink=debug,rdkafka=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let settings = Settings::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        anyhow!("Configuration error: {}", e)
    })?;

    info!(
        brokers = %settings.kafka_broker_url,
        group_id = %settings.kafka_group_id,
        topic = %settings.kafka_topic,
        instances = settings.forwarder.instances,
        dry_run = settings.sink_dry_run,
        "Starting data sink"
    );

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = signal_tx.send(true);
    });

    let sink = build_sink(&settings).await?;
    let dead_letters = build_dead_letters(&settings)?;
    let config = ForwarderConfig::from_settings(&settings);

    let mut forwarders = FuturesUnordered::new();
    for instance in 0..settings.forwarder.instances {
        let consumer = create_consumer(&KafkaConsumerConfig {
            brokers: settings.kafka_broker_url.clone(),
            group_id: settings.kafka_group_id.clone(),
            topic: settings.kafka_topic.clone(),
            client_id: format!("data-sink-{}", instance),
        })
        .with_context(|| format!("Failed to start Kafka consumer {}", instance))?;

        let mut forwarder = Forwarder::new(
            format!("forwarder-{}", instance),
            KafkaRecordSource::new(consumer.clone()),
            KafkaOffsetStore::new(consumer, settings.kafka_topic.clone()),
            sink.clone(),
            dead_letters.clone(),
            config.clone(),
            shutdown_rx.clone(),
        );

        forwarders.push(tokio::spawn(
            async move { forwarder.run().await }.instrument(info_span!("forwarder", instance)),
        ));
    }

    info!(count = forwarders.len(), "Forwarders running");

    let mut failure = None;
    while let Some(joined) = forwarders.next().await {
        match joined {
            Ok(Ok(stats)) => info!(?stats, "Forwarder finished"),
            Ok(Err(e)) => {
                error!(error = %e, "Forwarder halted, stopping the others");
                let _ = shutdown_tx.send(true);
                failure.get_or_insert_with(|| anyhow!(e));
            }
            Err(e) => {
                error!(error = %e, "Forwarder task panicked, stopping the others");
                let _ = shutdown_tx.send(true);
                failure.get_or_insert_with(|| anyhow!("forwarder task failed: {}", e));
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => {
            info!("Data sink shut down cleanly");
            Ok(())
        }
    }
}

async fn build_sink(settings: &Settings) -> Result<Arc<dyn DocumentSink>> {
    if settings.sink_dry_run {
        warn!("SINK_DRY_RUN enabled, documents are kept in memory only");
        return Ok(Arc::new(MemorySink::new()));
    }

    let (client, url_database) = mongo::connect(&settings.mongodb_url).await?;
    let database = settings.database_name(url_database.as_deref());

    with_retry_if(
        &presets::document_store_connect(),
        |e: &SinkError| e.is_transient(),
        || mongo::ping(&client, &database),
    )
    .await
    .map_err(|e| e.into_inner())
    .context("MongoDB is not reachable")?;

    info!(database = %database, "Connected to MongoDB");

    Ok(Arc::new(MongoSink::new(
        &client,
        &database,
        settings.collection_name(),
        settings.forwarder.write_concurrency,
    )))
}

fn build_dead_letters(settings: &Settings) -> Result<Arc<dyn DeadLetterSink>> {
    match &settings.dead_letter_topic {
        Some(topic) => {
            info!(topic = %topic, "Dead letters will be published to Kafka");
            let sink = KafkaDeadLetterSink::new(KafkaDeadLetterConfig::new(
                settings.kafka_broker_url.clone(),
                topic.clone(),
            ))?;
            Ok(Arc::new(sink))
        }
        None => {
            warn!("DEAD_LETTER_TOPIC not set, dead letters are only logged");
            Ok(Arc::new(LogOnlyDeadLetterSink))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
