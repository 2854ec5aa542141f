//! Metrics processor service binary
//!
//! Startup order matters: configuration, telemetry, restore from the newest
//! valid checkpoint, then wire the Kafka boundaries and admit input. Ctrl-C
//! stops the source, drains buffered input, takes a final checkpoint and
//! commits consumer offsets.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use metrics_processor::config::ProcessorConfig;
use metrics_processor::kafka::{KafkaRecordSink, KafkaSinkConfig, KafkaSourceConfig, MetricSource};
use metrics_processor::pipeline::{Pipeline, PipelineSinks};
use metrics_processor::state::{CheckpointCoordinator, CheckpointStore, KeyedStateStore};
use metrics_processor::storage::{NullMetricStore, StoreWriter};
use metrics_processor::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let config = ProcessorConfig::from_env().context("loading configuration")?;
    info!(
        brokers = %config.kafka.bootstrap_servers,
        source_topic = %config.kafka.source_topic,
        window_ms = config.window.length_ms,
        lateness_ms = config.window.allowed_lateness_ms,
        "metrics processor starting"
    );

    let store = Arc::new(KeyedStateStore::new());
    // metric persistence is an external collaborator; until a store client
    // is wired in, writes are acknowledged and dropped
    let writer = StoreWriter::new(Arc::new(NullMetricStore::new()));

    let sinks = PipelineSinks {
        events: Arc::new(
            KafkaRecordSink::new(KafkaSinkConfig::for_topic(
                &config.kafka.bootstrap_servers,
                &config.kafka.sink_topic,
            ))
            .context("creating events sink")?,
        ),
        alerts: Arc::new(
            KafkaRecordSink::new(KafkaSinkConfig::for_topic(
                &config.kafka.bootstrap_servers,
                &config.kafka.alerts_topic,
            ))
            .context("creating alerts sink")?,
        ),
        aggregates: Arc::new(
            KafkaRecordSink::new(KafkaSinkConfig::for_topic(
                &config.kafka.bootstrap_servers,
                &config.kafka.aggregates_topic,
            ))
            .context("creating aggregates sink")?,
        ),
    };

    let mut pipeline = Pipeline::new(&config, Arc::clone(&store), sinks, writer)
        .context("building pipeline")?;

    // restore before any input is admitted
    let checkpoint_store = Arc::new(CheckpointStore::new(
        &config.checkpoint.dir,
        config.checkpoint.retention,
    ));
    let restored = checkpoint_store
        .restore_latest()
        .await
        .context("restoring checkpoint")?;

    let (first_checkpoint_id, positions) = match &restored {
        Some(checkpoint) => {
            pipeline.restore(checkpoint).await?;
            (checkpoint.checkpoint_id + 1, checkpoint.positions.clone())
        }
        None => {
            info!(dir = %config.checkpoint.dir.display(), "no checkpoint found, starting fresh");
            (1, Vec::new())
        }
    };

    let coordinator = Arc::new(CheckpointCoordinator::new(
        pipeline.checkpoint_source(),
        Arc::clone(&checkpoint_store),
        config.checkpoint.interval(),
        first_checkpoint_id,
    ));
    coordinator.start().await.context("starting checkpointing")?;

    let source = Arc::new(
        MetricSource::new(KafkaSourceConfig::from(&config.kafka))
            .context("creating Kafka source")?,
    );
    source
        .start_from(&positions)
        .context("starting consumption")?;

    let (input_tx, input_rx) = mpsc::channel(config.buffer_size);
    let (source_shutdown_tx, source_shutdown_rx) = oneshot::channel();
    let (pipeline_shutdown_tx, pipeline_shutdown_rx) = oneshot::channel();

    let source_task = {
        let source = Arc::clone(&source);
        tokio::spawn(async move { source.run(input_tx, source_shutdown_rx).await })
    };
    let pipeline_task =
        tokio::spawn(async move { pipeline.run(input_rx, pipeline_shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    // stop admitting input, drain, final checkpoint, then acknowledge
    let _ = source_shutdown_tx.send(());
    if let Err(e) = source_task.await.context("joining source task")? {
        error!(error = %e, "source stopped with error");
    }
    let _ = pipeline_shutdown_tx.send(());
    if let Err(e) = pipeline_task.await.context("joining pipeline task")? {
        error!(error = %e, "pipeline stopped with error");
    }

    coordinator
        .shutdown()
        .await
        .context("final checkpoint on shutdown")?;
    if let Err(e) = source.commit() {
        error!(error = %e, "offset commit on shutdown failed");
    }

    info!("metrics processor stopped");
    Ok(())
}
