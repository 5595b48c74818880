//! Shared fixtures for the integration suite: a scripted in-memory broker
//! and helpers for seeding and inspecting the coordination tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use zk_consumer_group::{
    BrokerConnector, BrokerConsumer, BrokerError, GroupConfig, GroupMessage, InMemorySession,
    PartitionStream, StartOffset,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Group configuration tuned for fast tests.
pub fn fast_config() -> GroupConfig {
    let mut config = GroupConfig::default();
    config.channel_buffer_size = 64;
    config.coordination.addrs = vec!["memory:0".to_string()];
    config.offsets.commit_interval = Duration::from_millis(50);
    config.offsets.processing_timeout = Duration::from_secs(2);
    config
}

/// Register one broker and the partition metadata of `topic` in the
/// coordination tree, the way a running cluster would have.
pub async fn seed_topic(session: &InMemorySession, topic: &str, partitions: i32) {
    use zk_consumer_group::CoordinationClient;

    session
        .set_data("brokers/ids/0", br#"{"host":"localhost","port":9092}"#)
        .await
        .unwrap();
    for partition in 0..partitions {
        session
            .set_data(
                &format!("brokers/topics/{topic}/partitions/{partition}/state"),
                br#"{"leader":0}"#,
            )
            .await
            .unwrap();
    }
}

/// Current owner of a partition, straight from the coordination tree.
pub async fn owner(
    session: &InMemorySession,
    group: &str,
    topic: &str,
    partition: i32,
) -> Option<String> {
    use zk_consumer_group::CoordinationClient;

    session
        .get_data(&format!("consumers/{group}/owners/{topic}/{partition}"))
        .await
        .unwrap()
        .map(|bytes| String::from_utf8(bytes).unwrap())
}

/// Persisted next offset of a partition, straight from the coordination
/// tree.
pub async fn stored_offset(
    session: &InMemorySession,
    group: &str,
    topic: &str,
    partition: i32,
) -> Option<i64> {
    use zk_consumer_group::CoordinationClient;

    session
        .get_data(&format!("consumers/{group}/offsets/{topic}/{partition}"))
        .await
        .unwrap()
        .map(|bytes| String::from_utf8(bytes).unwrap().parse().unwrap())
}

struct PartitionLog {
    base_offset: i64,
    messages: Vec<Vec<u8>>,
    len_tx: watch::Sender<usize>,
}

struct BrokerInner {
    partitions: Mutex<HashMap<(String, i32), PartitionLog>>,
    closed: AtomicBool,
}

/// In-memory broker with scripted partition logs. Streams deliver the
/// retained messages in order and then follow live appends.
#[derive(Clone)]
pub struct ScriptedBroker {
    inner: Arc<BrokerInner>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                partitions: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create an empty partition log whose first retained offset is
    /// `base_offset`.
    pub fn add_partition(&self, topic: &str, partition: i32, base_offset: i64) {
        let (len_tx, _) = watch::channel(0usize);
        self.inner.partitions.lock().insert(
            (topic.to_string(), partition),
            PartitionLog {
                base_offset,
                messages: Vec::new(),
                len_tx,
            },
        );
    }

    /// Append a message, returning its offset.
    pub fn append(&self, topic: &str, partition: i32, value: &[u8]) -> i64 {
        let mut partitions = self.inner.partitions.lock();
        let log = partitions
            .get_mut(&(topic.to_string(), partition))
            .expect("append to unknown partition");
        let offset = log.base_offset + log.messages.len() as i64;
        log.messages.push(value.to_vec());
        log.len_tx.send_replace(log.messages.len());
        offset
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConsumer for ScriptedBroker {
    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: StartOffset,
    ) -> Result<PartitionStream, BrokerError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Client("broker client closed".to_string()));
        }

        let (start, mut len_rx) = {
            let partitions = self.inner.partitions.lock();
            let log = partitions
                .get(&(topic.to_string(), partition))
                .ok_or_else(|| {
                    BrokerError::Client(format!("unknown partition {topic}/{partition}"))
                })?;
            let end = log.base_offset + log.messages.len() as i64;
            let start = match offset {
                StartOffset::Oldest => log.base_offset,
                StartOffset::Newest => end,
                StartOffset::At(at) if at >= log.base_offset && at <= end => at,
                StartOffset::At(at) => {
                    return Err(BrokerError::OffsetOutOfRange {
                        topic: topic.to_string(),
                        partition,
                        offset: at,
                    })
                }
            };
            (start, log.len_tx.subscribe())
        };

        let (messages_tx, messages_rx) = mpsc::channel(32);
        let (errors_tx, errors_rx) = mpsc::channel(8);

        let inner = Arc::clone(&self.inner);
        let key = (topic.to_string(), partition);
        tokio::spawn(async move {
            // Keep the error sender alive for the stream's lifetime; the
            // consumer treats a closed error channel as end of stream.
            let _errors_tx = errors_tx;
            let (topic, partition) = (key.0.clone(), key.1);
            let mut next = start;
            loop {
                let value = {
                    let partitions = inner.partitions.lock();
                    let Some(log) = partitions.get(&key) else { break };
                    let index = next - log.base_offset;
                    if index < 0 {
                        break;
                    }
                    log.messages.get(index as usize).cloned()
                };
                match value {
                    Some(value) => {
                        let message = GroupMessage {
                            topic: topic.clone(),
                            partition,
                            offset: next,
                            key: None,
                            value,
                            timestamp: Some(Utc::now()),
                        };
                        if messages_tx.send(message).await.is_err() {
                            break;
                        }
                        next += 1;
                    }
                    None => {
                        if len_rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(PartitionStream {
            messages: messages_rx,
            errors: errors_rx,
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out the scripted broker and recording the broker list
/// it was seeded with.
pub struct ScriptedConnector {
    broker: ScriptedBroker,
    seen_brokers: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    pub fn new(broker: ScriptedBroker) -> Self {
        Self {
            broker,
            seen_brokers: Mutex::new(Vec::new()),
        }
    }

    pub fn seen_brokers(&self) -> Vec<String> {
        self.seen_brokers.lock().clone()
    }
}

#[async_trait]
impl BrokerConnector for ScriptedConnector {
    async fn connect(&self, brokers: &[String]) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
        *self.seen_brokers.lock() = brokers.to_vec();
        Ok(Arc::new(self.broker.clone()))
    }
}
