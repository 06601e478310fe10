//! In-process partitioned event log.
//!
//! Backs tests and the `fleet` demo. Behaves like an exclusive-reader
//! transport: opening a partition bumps its reader epoch, and any older
//! receiver on that partition gets `SourceError::OwnershipLost` on its next
//! call. Faults can be queued per partition to exercise transient failures.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;

use crate::types::{Event, PartitionId, Position, ResumeFrom, StartPosition};

use super::event_source::{EventSource, PartitionReceiver, SourceError};

#[derive(Debug)]
struct PartitionLog {
    events: RwLock<Vec<Event>>,
    /// Number of events published; receivers wait on changes.
    published: watch::Sender<usize>,
    reader_epoch: AtomicU64,
    faults: Mutex<VecDeque<SourceError>>,
}

impl PartitionLog {
    fn new() -> Self {
        let (published, _) = watch::channel(0);
        Self {
            events: RwLock::new(Vec::new()),
            published,
            reader_epoch: AtomicU64::new(0),
            faults: Mutex::new(VecDeque::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryEventSource {
    order: Arc<Vec<PartitionId>>,
    logs: Arc<DashMap<PartitionId, Arc<PartitionLog>>>,
}

impl MemoryEventSource {
    /// A source with partitions named `"0"` through `"{count - 1}"`.
    pub fn new(count: usize) -> Self {
        Self::with_partitions((0..count).map(|i| PartitionId::new(i.to_string())))
    }

    pub fn with_partitions(partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        let order: Vec<PartitionId> = partitions.into_iter().collect();
        let logs = DashMap::new();
        for partition in &order {
            logs.insert(partition.clone(), Arc::new(PartitionLog::new()));
        }
        Self {
            order: Arc::new(order),
            logs: Arc::new(logs),
        }
    }

    fn log(&self, partition: &PartitionId) -> Option<Arc<PartitionLog>> {
        self.logs.get(partition).map(|entry| entry.value().clone())
    }

    /// Append an event; returns its position.
    pub async fn publish(
        &self,
        partition: &PartitionId,
        body: impl Into<Bytes>,
    ) -> Option<Position> {
        let log = self.log(partition)?;
        let mut events = log.events.write().await;
        let position = Position(events.len() as i64);
        events.push(Event {
            body: body.into(),
            position,
            partition_key: None,
            enqueued_at: Utc::now(),
        });
        log.published.send_replace(events.len());
        Some(position)
    }

    /// Append `count` events with generated bodies; returns the last position.
    pub async fn publish_many(&self, partition: &PartitionId, count: usize) -> Option<Position> {
        let mut last = None;
        for i in 0..count {
            last = self
                .publish(partition, Bytes::from(format!("event-{}", i)))
                .await;
        }
        last
    }

    /// Number of events published to a partition.
    pub async fn len(&self, partition: &PartitionId) -> usize {
        match self.log(partition) {
            Some(log) => log.events.read().await.len(),
            None => 0,
        }
    }

    /// Queue a fault returned by the next receive call on `partition`.
    pub async fn inject_fault(&self, partition: &PartitionId, fault: SourceError) {
        if let Some(log) = self.log(partition) {
            log.faults.lock().await.push_back(fault);
        }
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn partition_ids(&self) -> Result<Vec<PartitionId>, SourceError> {
        Ok(self.order.as_ref().clone())
    }

    async fn open(
        &self,
        partition: &PartitionId,
        from: ResumeFrom,
    ) -> Result<Box<dyn PartitionReceiver>, SourceError> {
        let log = self
            .log(partition)
            .ok_or_else(|| SourceError::Transport(format!("unknown partition {}", partition)))?;

        let next_index = match from {
            ResumeFrom::After(position) => (position.value() + 1).max(0) as usize,
            ResumeFrom::Start(StartPosition::Earliest) => 0,
            ResumeFrom::Start(StartPosition::Latest) => log.events.read().await.len(),
        };
        let epoch = log.reader_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let published = log.published.subscribe();

        Ok(Box::new(MemoryReceiver {
            log,
            epoch,
            next_index,
            published,
            closed: false,
        }))
    }
}

struct MemoryReceiver {
    log: Arc<PartitionLog>,
    epoch: u64,
    next_index: usize,
    published: watch::Receiver<usize>,
    closed: bool,
}

impl MemoryReceiver {
    fn check_epoch(&self) -> Result<(), SourceError> {
        if self.log.reader_epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(SourceError::OwnershipLost);
        }
        Ok(())
    }
}

#[async_trait]
impl PartitionReceiver for MemoryReceiver {
    async fn receive_batch(
        &mut self,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<Event>, SourceError> {
        if self.closed {
            return Err(SourceError::Transport("receiver closed".to_string()));
        }
        if let Some(fault) = self.log.faults.lock().await.pop_front() {
            return Err(fault);
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.check_epoch()?;
            self.published.borrow_and_update();

            {
                let events = self.log.events.read().await;
                if self.next_index < events.len() {
                    let end = events.len().min(self.next_index + max.max(1));
                    let batch = events[self.next_index..end].to_vec();
                    self.next_index = end;
                    return Ok(batch);
                }
            }

            match tokio::time::timeout_at(deadline, self.published.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(SourceError::Transport("source dropped".to_string())),
                Err(_) => return Err(SourceError::Timeout),
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p0() -> PartitionId {
        PartitionId::new("0")
    }

    #[tokio::test]
    async fn test_partition_ids_in_order() {
        let source = MemoryEventSource::new(3);
        let ids = source.partition_ids().await.unwrap();
        assert_eq!(
            ids,
            vec![PartitionId::new("0"), PartitionId::new("1"), PartitionId::new("2")]
        );
    }

    #[tokio::test]
    async fn test_receive_respects_max_and_order() {
        let source = MemoryEventSource::new(1);
        source.publish_many(&p0(), 5).await;
        let mut rx = source
            .open(&p0(), ResumeFrom::Start(StartPosition::Earliest))
            .await
            .unwrap();

        let first = rx.receive_batch(3, Duration::from_millis(10)).await.unwrap();
        let second = rx.receive_batch(3, Duration::from_millis(10)).await.unwrap();
        let positions: Vec<i64> = first
            .iter()
            .chain(second.iter())
            .map(|e| e.position.value())
            .collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
        assert_eq!(first.len(), 3);
    }

    #[tokio::test]
    async fn test_resume_after_position() {
        let source = MemoryEventSource::new(1);
        source.publish_many(&p0(), 15).await;
        let mut rx = source
            .open(&p0(), ResumeFrom::After(Position(12)))
            .await
            .unwrap();
        let batch = rx.receive_batch(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.first().map(|e| e.position), Some(Position(13)));
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_latest_skips_existing_events() {
        let source = MemoryEventSource::new(1);
        source.publish_many(&p0(), 4).await;
        let mut rx = source
            .open(&p0(), ResumeFrom::Start(StartPosition::Latest))
            .await
            .unwrap();
        assert_eq!(
            rx.receive_batch(10, Duration::from_millis(10)).await,
            Err(SourceError::Timeout)
        );
        source.publish(&p0(), "new").await;
        let batch = rx.receive_batch(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch[0].position, Position(4));
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let source = MemoryEventSource::new(1);
        let mut rx = source
            .open(&p0(), ResumeFrom::Start(StartPosition::Earliest))
            .await
            .unwrap();
        let publisher = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(&p0(), "late").await;
        });
        let batch = rx.receive_batch(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_newer_reader_steals_partition() {
        let source = MemoryEventSource::new(1);
        source.publish_many(&p0(), 2).await;
        let mut old = source
            .open(&p0(), ResumeFrom::Start(StartPosition::Earliest))
            .await
            .unwrap();
        let _new = source
            .open(&p0(), ResumeFrom::Start(StartPosition::Earliest))
            .await
            .unwrap();
        assert_eq!(
            old.receive_batch(10, Duration::from_millis(10)).await,
            Err(SourceError::OwnershipLost)
        );
    }

    #[tokio::test]
    async fn test_injected_fault_is_returned_once() {
        let source = MemoryEventSource::new(1);
        source.publish_many(&p0(), 1).await;
        source
            .inject_fault(&p0(), SourceError::Transport("blip".into()))
            .await;
        let mut rx = source
            .open(&p0(), ResumeFrom::Start(StartPosition::Earliest))
            .await
            .unwrap();
        assert!(matches!(
            rx.receive_batch(10, Duration::from_millis(10)).await,
            Err(SourceError::Transport(_))
        ));
        assert_eq!(
            rx.receive_batch(10, Duration::from_millis(10))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
