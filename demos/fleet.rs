//! Two dispatchers sharing one store.
//!
//! This example runs a small fleet in one process: a producer appends events
//! to an in-memory partitioned log, a first dispatcher claims every
//! partition, and a second one joins a few seconds later and takes over its
//! fair share. Halfway through, the first dispatcher shuts down and the
//! second picks up the rest from the committed checkpoints.
//!
//! ## Running
//!
//! ```bash
//! cargo run --example fleet
//! ```
//!
//! With JSON logging:
//! ```bash
//! LOG_FORMAT=json RUST_LOG=info,leasehold=debug cargo run --example fleet
//! ```
//!
//! Prometheus metrics for the whole run are printed on exit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use leasehold::consumer::metrics::{encode_metrics, init_metrics};
use leasehold::consumer::{
    CheckpointStore, ConsumerConfig, ConsumerProfile, ObjectCheckpointStore, ObjectLeaseStore,
    SharedClock, StoreLayout, SystemClock, TelemetrySink, create_object_store, spawn_log_drain,
};
use leasehold::prelude::*;
use leasehold::telemetry::{LogFormat, init_logging};
use tracing::info;

const PARTITIONS: usize = 6;

/// Handler that just counts and logs every tenth event.
struct Tally {
    name: &'static str,
}

#[async_trait]
impl EventHandler for Tally {
    async fn on_partition_start(&self, ctx: &PartitionContext) -> Result<(), HandlerError> {
        info!(node = self.name, partition = %ctx.partition_id, token = %ctx.fencing_token, "Partition started");
        Ok(())
    }

    async fn process(&self, ctx: &PartitionContext, event: &Event) -> Result<(), HandlerError> {
        if event.position.value() % 10 == 0 {
            info!(
                node = self.name,
                partition = %ctx.partition_id,
                position = %event.position,
                "Processed"
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(())
    }

    async fn on_partition_stop(&self, ctx: &PartitionContext, reason: StopReason) {
        info!(node = self.name, partition = %ctx.partition_id, reason = %reason, "Partition stopped");
    }
}

fn node_config(owner: &str) -> ConsumerConfig {
    ConsumerConfig {
        owner_id: OwnerId::new(owner),
        lease_duration: Duration::from_secs(4),
        renew_interval: Duration::from_secs(1),
        balance_interval: Duration::from_millis(500),
        receive_timeout: Duration::from_millis(200),
        checkpoint_safety_margin: Duration::from_millis(500),
        max_batch_size: 20,
        ..ConsumerConfig::from_profile(ConsumerProfile::Development)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| e as Box<dyn std::error::Error>)?;
    init_metrics();

    let config_a = node_config("node-a");
    let clock: SharedClock = Arc::new(SystemClock);
    let store = create_object_store(&config_a.store)?;
    let layout = StoreLayout::new(&config_a.store_prefix, &config_a.consumer_group);
    let leases = Arc::new(ObjectLeaseStore::new(store.clone(), layout.clone()));
    let checkpoints = Arc::new(ObjectCheckpointStore::new(store, layout, clock));
    let source = Arc::new(MemoryEventSource::new(PARTITIONS));

    let (telemetry, rx) = TelemetrySink::channel(1024);
    let drain = spawn_log_drain(rx);

    let producer_stop = CancellationToken::new();
    let producer = tokio::spawn({
        let source = source.clone();
        let stop = producer_stop.clone();
        async move {
            let mut n: u64 = 0;
            while !stop.is_cancelled() {
                let partition = PartitionId::new((n % PARTITIONS as u64).to_string());
                source.publish(&partition, format!("payload-{}", n)).await;
                n += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            n
        }
    });

    let start = |name: &'static str, config: ConsumerConfig| {
        let dispatcher = PartitionDispatcher::new(
            config,
            leases.clone(),
            checkpoints.clone(),
            source.clone(),
            Arc::new(Tally { name }),
        )
        .with_telemetry(telemetry.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { dispatcher.run(shutdown).await }
        });
        (shutdown, task)
    };

    let (stop_a, task_a) = start("a", config_a);
    tokio::time::sleep(Duration::from_secs(3)).await;

    info!("Second node joining");
    let (stop_b, task_b) = start("b", node_config("node-b"));
    tokio::time::sleep(Duration::from_secs(12)).await;

    info!("First node leaving");
    stop_a.cancel();
    task_a.await??;
    tokio::time::sleep(Duration::from_secs(6)).await;

    producer_stop.cancel();
    let published = producer.await?;
    tokio::time::sleep(Duration::from_secs(2)).await;
    stop_b.cancel();
    task_b.await??;

    for i in 0..PARTITIONS {
        let partition = PartitionId::new(i.to_string());
        let len = source.len(&partition).await;
        match checkpoints.get_checkpoint(&partition).await? {
            Some(cp) => info!(
                partition = %partition,
                published = len,
                checkpoint = %cp.position,
                token = %cp.fencing_token,
                "Final checkpoint"
            ),
            None => info!(partition = %partition, published = len, "No checkpoint"),
        }
    }
    info!(published, "Fleet demo finished");

    drop(telemetry);
    drain.await?;
    println!("{}", encode_metrics()?);
    Ok(())
}
