//! Group state layout in the coordination service.
//!
//! [`GroupRegistry`] owns the path scheme and payload formats under which a
//! consumer group lives, and exposes the exact operations the coordination
//! engine performs against them:
//!
//! ```text
//! {chroot}/brokers/ids/{brokerId}                       JSON {"host","port"}
//! {chroot}/brokers/topics/{topic}/partitions/{p}/state  JSON {"leader"}
//! {chroot}/consumers/{group}/ids/{instanceId}           ephemeral, subscription JSON
//! {chroot}/consumers/{group}/owners/{topic}/{p}         ephemeral, owner instance id
//! {chroot}/consumers/{group}/offsets/{topic}/{p}        persistent, ASCII next offset
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::assignment::PartitionInfo;
use crate::coordination::{ChangeWatch, CoordinationClient, CoordinationError};

/// Membership payload stored in the instance's ephemeral node. The shape
/// follows the convention established by the classic ZooKeeper-based
/// consumers, so mixed-language groups can read each other's entries.
#[derive(Debug, Serialize, Deserialize)]
struct InstanceRegistration {
    pattern: String,
    subscription: BTreeMap<String, i32>,
    timestamp: i64,
    version: i32,
}

/// Broker endpoint payload under `brokers/ids/{id}`.
#[derive(Debug, Deserialize)]
struct BrokerRecord {
    host: String,
    port: u16,
}

/// Partition leadership payload under `.../partitions/{p}/state`.
#[derive(Debug, Deserialize)]
struct PartitionState {
    leader: i32,
}

/// Typed access to one consumer group's coordination state.
pub struct GroupRegistry {
    client: Arc<dyn CoordinationClient>,
    chroot: String,
    group: String,
}

impl GroupRegistry {
    pub fn new(client: Arc<dyn CoordinationClient>, chroot: &str, group: &str) -> Self {
        Self {
            client,
            chroot: chroot.trim_matches('/').to_string(),
            group: group.to_string(),
        }
    }

    pub fn group_name(&self) -> &str {
        &self.group
    }

    fn prefixed(&self, path: &str) -> String {
        if self.chroot.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.chroot, path)
        }
    }

    fn group_root(&self) -> String {
        self.prefixed(&format!("consumers/{}", self.group))
    }

    fn ids_path(&self) -> String {
        format!("{}/ids", self.group_root())
    }

    fn instance_path(&self, instance_id: &str) -> String {
        format!("{}/{}", self.ids_path(), instance_id)
    }

    fn owner_path(&self, topic: &str, partition: i32) -> String {
        format!("{}/owners/{}/{}", self.group_root(), topic, partition)
    }

    fn offset_path(&self, topic: &str, partition: i32) -> String {
        format!("{}/offsets/{}/{}", self.group_root(), topic, partition)
    }

    fn topic_partitions_path(&self, topic: &str) -> String {
        self.prefixed(&format!("brokers/topics/{topic}/partitions"))
    }

    /// Create the persistent skeleton of the group if it does not exist.
    pub async fn ensure_group(&self) -> Result<(), CoordinationError> {
        self.client.ensure_path(&self.ids_path()).await?;
        self.client
            .ensure_path(&format!("{}/owners", self.group_root()))
            .await?;
        self.client
            .ensure_path(&format!("{}/offsets", self.group_root()))
            .await
    }

    /// Register the instance as a live group member. The ephemeral node
    /// content advertises the topic subscription.
    pub async fn register_instance(
        &self,
        instance_id: &str,
        topics: &[String],
    ) -> Result<(), CoordinationError> {
        let registration = InstanceRegistration {
            pattern: "static".to_string(),
            subscription: topics.iter().map(|t| (t.clone(), 1)).collect(),
            timestamp: Utc::now().timestamp_millis(),
            version: 1,
        };
        let payload = serde_json::to_vec(&registration)
            .map_err(|err| CoordinationError::Other(format!("encode registration: {err}")))?;
        self.client
            .create_ephemeral(&self.instance_path(instance_id), &payload)
            .await
    }

    pub async fn instance_registered(&self, instance_id: &str) -> Result<bool, CoordinationError> {
        self.client.exists(&self.instance_path(instance_id)).await
    }

    pub async fn deregister_instance(&self, instance_id: &str) -> Result<(), CoordinationError> {
        self.client.delete(&self.instance_path(instance_id)).await
    }

    /// Current member ids, sorted, plus a one-shot membership watch.
    pub async fn watch_instances(
        &self,
    ) -> Result<(Vec<String>, ChangeWatch), CoordinationError> {
        let (mut instances, watch) = self.client.watch_children(&self.ids_path()).await?;
        instances.sort();
        Ok((instances, watch))
    }

    /// Claim exclusive ownership of a partition. Fails with
    /// [`CoordinationError::NodeExists`] while another live instance holds
    /// the claim.
    pub async fn claim_partition(
        &self,
        instance_id: &str,
        topic: &str,
        partition: i32,
    ) -> Result<(), CoordinationError> {
        self.client
            .create_ephemeral(&self.owner_path(topic, partition), instance_id.as_bytes())
            .await
    }

    pub async fn release_partition(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<(), CoordinationError> {
        self.client.delete(&self.owner_path(topic, partition)).await
    }

    /// Instance id currently holding the partition, if any.
    pub async fn partition_owner(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Option<String>, CoordinationError> {
        let data = self
            .client
            .get_data(&self.owner_path(topic, partition))
            .await?;
        Ok(data.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Persisted next offset to read for the partition, `-1` if none.
    pub async fn fetch_offset(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<i64, CoordinationError> {
        let path = self.offset_path(topic, partition);
        match self.client.get_data(&path).await? {
            None => Ok(-1),
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                text.trim().parse::<i64>().map_err(|_| {
                    CoordinationError::Other(format!("invalid offset payload at {path}: {text:?}"))
                })
            }
        }
    }

    /// Persist the next offset to read for the partition, as ASCII decimal.
    pub async fn commit_offset(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), CoordinationError> {
        debug!(
            group = %self.group,
            topic,
            partition,
            next_offset,
            "committing offset"
        );
        self.client
            .set_data(
                &self.offset_path(topic, partition),
                next_offset.to_string().as_bytes(),
            )
            .await
    }

    /// Delete every persisted offset of the group.
    pub async fn reset_offsets(&self) -> Result<(), CoordinationError> {
        let offsets_root = format!("{}/offsets", self.group_root());
        let topics = match self.client.children(&offsets_root).await {
            Ok(topics) => topics,
            Err(CoordinationError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err),
        };
        for topic in topics {
            let topic_path = format!("{offsets_root}/{topic}");
            for partition in self.client.children(&topic_path).await? {
                self.client
                    .delete(&format!("{topic_path}/{partition}"))
                    .await?;
            }
        }
        Ok(())
    }

    /// Broker endpoints registered in the coordination service, as
    /// `host:port` strings, sorted by broker id.
    pub async fn broker_list(&self) -> Result<Vec<String>, CoordinationError> {
        let ids_path = self.prefixed("brokers/ids");
        let mut ids = match self.client.children(&ids_path).await {
            Ok(ids) => ids,
            Err(CoordinationError::NotFound { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        ids.sort();

        let mut brokers = Vec::with_capacity(ids.len());
        for id in ids {
            let path = format!("{ids_path}/{id}");
            let Some(bytes) = self.client.get_data(&path).await? else {
                continue;
            };
            let record: BrokerRecord = serde_json::from_slice(&bytes)
                .map_err(|err| CoordinationError::Other(format!("broker record {path}: {err}")))?;
            brokers.push(format!("{}:{}", record.host, record.port));
        }
        Ok(brokers)
    }

    /// Partitions of a topic with their leader broker ids, sorted by
    /// partition id.
    pub async fn topic_partitions(
        &self,
        topic: &str,
    ) -> Result<Vec<PartitionInfo>, CoordinationError> {
        let partitions_path = self.topic_partitions_path(topic);
        let names = self.client.children(&partitions_path).await?;

        let mut partitions = Vec::with_capacity(names.len());
        for name in names {
            let Ok(id) = name.parse::<i32>() else {
                continue;
            };
            let state_path = format!("{partitions_path}/{name}/state");
            let leader = match self.client.get_data(&state_path).await? {
                Some(bytes) => {
                    let state: PartitionState = serde_json::from_slice(&bytes).map_err(|err| {
                        CoordinationError::Other(format!("partition state {state_path}: {err}"))
                    })?;
                    state.leader
                }
                None => -1,
            };
            partitions.push(PartitionInfo { id, leader });
        }
        partitions.sort_by_key(|p| p.id);
        Ok(partitions)
    }

    /// One-shot watch on the partition set of a topic.
    pub async fn watch_topic_partitions(
        &self,
        topic: &str,
    ) -> Result<(Vec<String>, ChangeWatch), CoordinationError> {
        self.client
            .watch_children(&self.topic_partitions_path(topic))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordination;

    fn registry(store: &InMemoryCoordination, chroot: &str) -> GroupRegistry {
        GroupRegistry::new(Arc::new(store.session()), chroot, "test-group")
    }

    #[tokio::test]
    async fn registration_round_trip() {
        let store = InMemoryCoordination::new();
        let registry = registry(&store, "");
        registry.ensure_group().await.unwrap();

        registry
            .register_instance("inst-1", &["events".to_string()])
            .await
            .unwrap();
        assert!(registry.instance_registered("inst-1").await.unwrap());

        let session = store.session();
        let payload = session
            .get_data("consumers/test-group/ids/inst-1")
            .await
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["pattern"], "static");
        assert_eq!(parsed["subscription"]["events"], 1);
        assert_eq!(parsed["version"], 1);

        registry.deregister_instance("inst-1").await.unwrap();
        assert!(!registry.instance_registered("inst-1").await.unwrap());
    }

    #[tokio::test]
    async fn chroot_prefixes_all_paths() {
        let store = InMemoryCoordination::new();
        let registry = registry(&store, "/kafka/");
        registry.ensure_group().await.unwrap();

        let session = store.session();
        assert!(session.exists("kafka/consumers/test-group/ids").await.unwrap());
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let store = InMemoryCoordination::new();
        let registry_a = registry(&store, "");
        let registry_b = registry(&store, "");
        registry_a.ensure_group().await.unwrap();

        registry_a.claim_partition("a", "events", 0).await.unwrap();
        assert!(matches!(
            registry_b.claim_partition("b", "events", 0).await,
            Err(CoordinationError::NodeExists { .. })
        ));
        assert_eq!(
            registry_a.partition_owner("events", 0).await.unwrap(),
            Some("a".to_string())
        );

        registry_a.release_partition("events", 0).await.unwrap();
        registry_b.claim_partition("b", "events", 0).await.unwrap();
        assert_eq!(
            registry_b.partition_owner("events", 0).await.unwrap(),
            Some("b".to_string())
        );
    }

    #[tokio::test]
    async fn offsets_are_ascii_decimal() {
        let store = InMemoryCoordination::new();
        let registry = registry(&store, "");
        registry.ensure_group().await.unwrap();

        assert_eq!(registry.fetch_offset("events", 0).await.unwrap(), -1);

        registry.commit_offset("events", 0, 42).await.unwrap();
        assert_eq!(registry.fetch_offset("events", 0).await.unwrap(), 42);

        let session = store.session();
        let raw = session
            .get_data("consumers/test-group/offsets/events/0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, b"42");
    }

    #[tokio::test]
    async fn reset_offsets_wipes_every_partition() {
        let store = InMemoryCoordination::new();
        let registry = registry(&store, "");
        registry.ensure_group().await.unwrap();
        registry.commit_offset("events", 0, 10).await.unwrap();
        registry.commit_offset("events", 1, 20).await.unwrap();
        registry.commit_offset("logs", 0, 5).await.unwrap();

        registry.reset_offsets().await.unwrap();

        assert_eq!(registry.fetch_offset("events", 0).await.unwrap(), -1);
        assert_eq!(registry.fetch_offset("events", 1).await.unwrap(), -1);
        assert_eq!(registry.fetch_offset("logs", 0).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn broker_list_and_topic_partitions() {
        let store = InMemoryCoordination::new();
        let session = store.session();
        session
            .set_data("brokers/ids/1", br#"{"host":"broker-b","port":9093}"#)
            .await
            .unwrap();
        session
            .set_data("brokers/ids/0", br#"{"host":"broker-a","port":9092}"#)
            .await
            .unwrap();
        for partition in 0..3 {
            session
                .set_data(
                    &format!("brokers/topics/events/partitions/{partition}/state"),
                    br#"{"leader":0}"#,
                )
                .await
                .unwrap();
        }

        let registry = registry(&store, "");
        assert_eq!(
            registry.broker_list().await.unwrap(),
            vec!["broker-a:9092".to_string(), "broker-b:9093".to_string()]
        );

        let partitions = registry.topic_partitions("events").await.unwrap();
        assert_eq!(partitions.len(), 3);
        assert_eq!(partitions[0], PartitionInfo { id: 0, leader: 0 });
        assert_eq!(partitions[2].id, 2);
    }

    #[tokio::test]
    async fn membership_watch_fires_on_join() {
        let store = InMemoryCoordination::new();
        let registry = registry(&store, "");
        registry.ensure_group().await.unwrap();
        registry
            .register_instance("b-instance", &["events".to_string()])
            .await
            .unwrap();

        let (instances, watch) = registry.watch_instances().await.unwrap();
        assert_eq!(instances, vec!["b-instance".to_string()]);

        registry
            .register_instance("a-instance", &["events".to_string()])
            .await
            .unwrap();
        watch.await.unwrap();

        let (instances, _) = registry.watch_instances().await.unwrap();
        assert_eq!(
            instances,
            vec!["a-instance".to_string(), "b-instance".to_string()]
        );
    }
}
