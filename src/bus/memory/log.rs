use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use crate::bus::kafka::{
    ConsumerRecord, DeliveryReport, LogConsumer, LogProducer, ProducerRecord,
};
use crate::bus::{Headers, MessagingError, Result};

/// Partition count of topics created by [`MemoryLog::default`].
pub const DEFAULT_PARTITIONS: i32 = 3;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    payload: Vec<u8>,
    headers: Headers,
}

struct LogState {
    partitions: i32,
    topics: RwLock<HashMap<String, Vec<Vec<StoredRecord>>>>,
    /// Next offset to read, keyed by (group, topic, partition).
    /// A std mutex because `LogConsumer::commit` is synchronous.
    committed: Mutex<HashMap<(String, String, i32), i64>>,
    appended: Notify,
    failed_sends: AtomicUsize,
    failed_receives: AtomicUsize,
}

/// Hash-partitioned, append-only topics shared by producers and consumer groups.
#[derive(Clone)]
pub struct MemoryLog {
    state: Arc<LogState>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryLog {
    pub fn new(partitions: i32) -> Self {
        Self {
            state: Arc::new(LogState {
                partitions: partitions.max(1),
                topics: RwLock::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                appended: Notify::new(),
                failed_sends: AtomicUsize::new(0),
                failed_receives: AtomicUsize::new(0),
            }),
        }
    }

    pub fn partitions(&self) -> i32 {
        self.state.partitions
    }

    /// Partition a record with `key` lands on.
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.state.partitions as u64) as i32
    }

    pub fn producer(&self) -> MemoryLogProducer {
        MemoryLogProducer { log: self.clone() }
    }

    /// A consumer-group member. One member per group: it is assigned every partition.
    pub fn consumer(&self, group_id: impl Into<String>) -> MemoryLogConsumer {
        MemoryLogConsumer {
            log: self.clone(),
            group_id: group_id.into(),
            positions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Every record of `topic`, by partition then offset.
    pub async fn records(&self, topic: &str) -> Vec<ConsumerRecord> {
        let topics = self.state.topics.read().await;
        let Some(partitions) = topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records
                    .iter()
                    .enumerate()
                    .map(move |(offset, record)| to_consumer_record(topic, partition as i32, offset as i64, record))
            })
            .collect()
    }

    /// Next offset `group_id` will read on `topic`/`partition`, if it ever committed.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.committed()
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Make the next `count` sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.failed_sends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` receives fail with a transient error.
    pub fn fail_next_receives(&self, count: usize) {
        self.state.failed_receives.store(count, Ordering::SeqCst);
    }

    fn committed(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String, i32), i64>> {
        self.state
            .committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn append(&self, record: ProducerRecord) -> DeliveryReport {
        let partition = self.partition_for(&record.key);
        let offset = {
            let mut topics = self.state.topics.write().await;
            let partitions = topics
                .entry(record.topic.clone())
                .or_insert_with(|| vec![Vec::new(); self.state.partitions as usize]);
            let log = &mut partitions[partition as usize];
            log.push(StoredRecord {
                key: record.key,
                payload: record.payload,
                headers: record.headers,
            });
            (log.len() - 1) as i64
        };
        self.state.appended.notify_waiters();

        debug!(topic = %record.topic, partition, offset, "Appended record");
        DeliveryReport { partition, offset }
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn to_consumer_record(topic: &str, partition: i32, offset: i64, record: &StoredRecord) -> ConsumerRecord {
    ConsumerRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: Some(record.key.clone()),
        payload: record.payload.clone(),
        headers: record.headers.clone(),
    }
}

pub struct MemoryLogProducer {
    log: MemoryLog,
}

#[async_trait]
impl LogProducer for MemoryLogProducer {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReport> {
        if take_failure(&self.log.state.failed_sends) {
            return Err(MessagingError::Publish(format!(
                "failed to publish event to topic {}: broker unavailable",
                record.topic
            )));
        }
        Ok(self.log.append(record).await)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryLogConsumer {
    log: MemoryLog,
    group_id: String,
    /// Next offset to hand out per assigned (topic, partition).
    positions: tokio::sync::Mutex<HashMap<(String, i32), i64>>,
}

impl MemoryLogConsumer {
    async fn poll_once(&self) -> Option<ConsumerRecord> {
        let mut positions = self.positions.lock().await;
        let topics = self.log.state.topics.read().await;

        let mut assigned: Vec<(String, i32)> = positions.keys().cloned().collect();
        assigned.sort();

        for (topic, partition) in assigned {
            let Some(records) = topics.get(&topic).map(|p| &p[partition as usize]) else {
                continue;
            };
            let Some(position) = positions.get_mut(&(topic.clone(), partition)) else {
                continue;
            };
            if let Some(record) = records.get(*position as usize) {
                let record = to_consumer_record(&topic, partition, *position, record);
                *position += 1;
                return Some(record);
            }
        }
        None
    }
}

#[async_trait]
impl LogConsumer for MemoryLogConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let mut positions = self.positions.lock().await;
        let committed = self.log.committed();
        for topic in topics {
            for partition in 0..self.log.state.partitions {
                let start = committed
                    .get(&(self.group_id.clone(), topic.clone(), partition))
                    .copied()
                    .unwrap_or(0);
                positions.insert((topic.clone(), partition), start);
            }
        }
        debug!(group_id = %self.group_id, topics = ?topics, "Joined in-memory consumer group");
        Ok(())
    }

    async fn recv(&self) -> Result<ConsumerRecord> {
        loop {
            if take_failure(&self.log.state.failed_receives) {
                return Err(MessagingError::Receive("broker unavailable".to_string()));
            }

            let notified = self.log.state.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.poll_once().await {
                return Ok(record);
            }
            notified.await;
        }
    }

    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut committed = self.log.committed();
        let next = committed
            .entry((self.group_id.clone(), topic.to_string(), partition))
            .or_insert(0);
        *next = (*next).max(offset + 1);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.positions.lock().await.clear();
        Ok(())
    }
}
