//! The consumer group coordinator.
//!
//! [`ConsumerGroup::join`] registers this process as a live instance of a
//! named group and starts the rebalance loop. Each loop iteration is one
//! *generation*: a fresh membership snapshot, fresh watches, and a fresh
//! set of topic and partition consumers bound to one cancellation signal.
//! Any membership or partition change tears the generation down and starts
//! the next one; `close` tears everything down for good.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerConnector, BrokerConsumer};
use crate::config::GroupConfig;
use crate::consumer::{ConsumerContext, TopicConsumer};
use crate::coordination::CoordinationClient;
use crate::error::{GroupError, Result};
use crate::message::{GroupMessage, PartitionError};
use crate::offsets::OffsetManager;
use crate::registry::GroupRegistry;
use crate::stats::{GroupStats, GroupStatsSnapshot};

/// The instance id tail used in log lines, long enough to tell instances
/// apart without drowning the output.
pub(crate) fn short_id(instance_id: &str) -> &str {
    let len = instance_id.len();
    if len <= 12 {
        instance_id
    } else {
        &instance_id[len - 12..]
    }
}

/// The two output streams of a consumer group. Both end after `close`
/// completes, or if the rebalance loop dies on a fatal coordination error.
#[derive(Debug)]
pub struct GroupStreams {
    /// Messages from every owned partition, multiplexed. Per-partition
    /// order is broker order; no order is guaranteed across partitions.
    pub messages: mpsc::Receiver<GroupMessage>,
    /// Broker and coordination errors, tagged with their origin.
    pub errors: mpsc::Receiver<PartitionError>,
}

/// A consumer instance participating in a named group.
///
/// Instances sharing a group name divide the partitions of the subscribed
/// topics among themselves so that every partition has exactly one live
/// owner, and committed offsets survive crashes and rebalances.
pub struct ConsumerGroup {
    config: Arc<GroupConfig>,
    instance_id: Arc<String>,
    registry: Arc<GroupRegistry>,
    offsets: Arc<OffsetManager>,
    broker: Arc<dyn BrokerConsumer>,
    stats: Arc<GroupStats>,
    shutdown: watch::Sender<bool>,
    rebalance: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl ConsumerGroup {
    /// Join `group`, subscribing to `topics`.
    ///
    /// Reads the broker list from the coordination service and hands it to
    /// `connector`, creates the group skeleton on first use, registers
    /// this instance as an ephemeral member, and starts the rebalance
    /// loop. Returns the coordinator handle together with its output
    /// streams.
    pub async fn join(
        group: &str,
        topics: Vec<String>,
        config: GroupConfig,
        coordination: Arc<dyn CoordinationClient>,
        connector: &dyn BrokerConnector,
    ) -> Result<(Self, GroupStreams)> {
        if group.is_empty() {
            return Err(GroupError::EmptyGroupName);
        }
        if topics.is_empty() {
            return Err(GroupError::NoTopics);
        }
        if config.coordination.addrs.is_empty() {
            return Err(GroupError::EmptyCoordinatorAddrs);
        }
        config.validate()?;

        let instance_id = Arc::new(Uuid::new_v4().simple().to_string());
        let registry = Arc::new(GroupRegistry::new(
            coordination,
            &config.coordination.chroot,
            group,
        ));

        let brokers = registry.broker_list().await?;
        let broker = connector.connect(&brokers).await?;

        registry.ensure_group().await?;
        if config.offsets.reset_offsets {
            info!(group, "wiping persisted group offsets before joining");
            registry.reset_offsets().await?;
        }
        registry.register_instance(&instance_id, &topics).await?;
        info!(
            group,
            instance = %short_id(&instance_id),
            ?topics,
            "registered consumer instance"
        );

        let stats = Arc::new(GroupStats::default());
        let offsets = Arc::new(OffsetManager::new(
            Arc::clone(&registry),
            config.offsets.commit_interval,
            Arc::clone(&stats),
        ));

        let (messages_tx, messages_rx) = mpsc::channel(config.channel_buffer_size);
        let (errors_tx, errors_rx) = mpsc::channel(config.channel_buffer_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let config = Arc::new(config);
        let ctx = Arc::new(ConsumerContext {
            config: Arc::clone(&config),
            instance_id: Arc::clone(&instance_id),
            registry: Arc::clone(&registry),
            offsets: Arc::clone(&offsets),
            broker: Arc::clone(&broker),
            stats: Arc::clone(&stats),
            messages: messages_tx,
            errors: errors_tx,
        });
        // The context, and with it the output senders, is owned by the
        // rebalance loop. When the loop exits and its tasks are joined,
        // both streams close.
        let rebalance = tokio::spawn(rebalance_loop(ctx, Arc::new(topics), shutdown_rx));

        Ok((
            Self {
                config,
                instance_id,
                registry,
                offsets,
                broker,
                stats,
                shutdown: shutdown_tx,
                rebalance: Mutex::new(Some(rebalance)),
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            },
            GroupStreams {
                messages: messages_rx,
                errors: errors_rx,
            },
        ))
    }

    /// Acknowledge that the application has fully processed `message`.
    ///
    /// Acknowledgements must be monotone per partition; the periodic
    /// committer persists the highest acknowledged offset.
    pub async fn commit_upto(&self, message: &GroupMessage) -> Result<()> {
        self.offsets
            .mark_as_processed(&message.topic, message.partition, message.offset)
            .await
    }

    /// Shut the group down: stop all generations, drain and commit
    /// offsets, deregister the instance, and close the broker client.
    ///
    /// Idempotent; a second invocation returns
    /// [`GroupError::AlreadyClosing`].
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Err(GroupError::AlreadyClosing);
        }
        info!(
            group = %self.registry.group_name(),
            instance = %short_id(&self.instance_id),
            "closing consumer group"
        );

        let _ = self.shutdown.send(true);
        let rebalance = self.rebalance.lock().take();
        if let Some(rebalance) = rebalance {
            let _ = rebalance.await;
        }

        let mut first_error: Option<GroupError> = None;

        if let Err(err) = self.offsets.close().await {
            warn!(
                group = %self.registry.group_name(),
                error = %err,
                "offset manager closed uncleanly"
            );
            first_error.get_or_insert(err);
        }

        match self.registry.deregister_instance(&self.instance_id).await {
            Ok(()) => info!(
                group = %self.registry.group_name(),
                instance = %short_id(&self.instance_id),
                "deregistered consumer instance"
            ),
            Err(err) => {
                warn!(
                    group = %self.registry.group_name(),
                    error = %err,
                    "failed to deregister consumer instance"
                );
                first_error.get_or_insert(err.into());
            }
        }

        if let Err(err) = self.broker.close().await {
            warn!(
                group = %self.registry.group_name(),
                error = %err,
                "failed to close broker client"
            );
            first_error.get_or_insert(err.into());
        }

        self.closed.store(true, Ordering::SeqCst);
        info!(group = %self.registry.group_name(), "consumer group closed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether shutdown has completed.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// This instance's unique id within the group.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The group name.
    pub fn group(&self) -> &str {
        self.registry.group_name()
    }

    /// Consumption counters.
    pub fn stats(&self) -> GroupStatsSnapshot {
        self.stats.snapshot()
    }

    /// The configuration the group was joined with.
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }
}

enum GenerationEnd {
    Shutdown,
    Membership,
    TopicChange(String),
}

async fn rebalance_loop(
    ctx: Arc<ConsumerContext>,
    topics: Arc<Vec<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let (members, mut membership_watch) = match ctx.registry.watch_instances().await {
            Ok(result) => result,
            Err(err) => {
                error!(
                    group = %ctx.registry.group_name(),
                    error = %err,
                    "failed to install membership watch, giving up"
                );
                let item = PartitionError {
                    topic: String::new(),
                    partition: -1,
                    error: err.into(),
                };
                tokio::select! {
                    _ = shutdown.changed() => {}
                    sent = ctx.errors.send(item) => {
                        if sent.is_ok() {
                            ctx.stats.record_error();
                        }
                    }
                }
                return;
            }
        };
        ctx.stats.record_rebalance();
        let members = Arc::new(members);
        debug!(
            group = %ctx.registry.group_name(),
            instance = %short_id(&ctx.instance_id),
            members = ?members,
            "starting consumption generation"
        );

        // Fresh cancellation signal for this generation only.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (topic_change_tx, mut topic_change_rx) =
            mpsc::channel::<String>(topics.len().max(1));

        let mut tasks = Vec::with_capacity(topics.len() * 2);
        for topic in topics.iter() {
            tasks.push(tokio::spawn(watch_topic_partitions_task(
                Arc::clone(&ctx),
                topic.clone(),
                cancel_rx.clone(),
                topic_change_tx.clone(),
            )));
            let consumer = TopicConsumer::new(
                Arc::clone(&ctx),
                topic.clone(),
                Arc::clone(&members),
                cancel_rx.clone(),
            );
            tasks.push(tokio::spawn(consumer.run()));
        }
        drop(topic_change_tx);
        drop(cancel_rx);

        let mut watchers_alive = true;
        let end = loop {
            tokio::select! {
                _ = shutdown.changed() => break GenerationEnd::Shutdown,
                _ = &mut membership_watch => break GenerationEnd::Membership,
                change = topic_change_rx.recv(), if watchers_alive => {
                    match change {
                        Some(topic) => break GenerationEnd::TopicChange(topic),
                        // All watch tasks are gone; only membership and
                        // shutdown can end this generation now.
                        None => watchers_alive = false,
                    }
                }
            }
        };

        match &end {
            GenerationEnd::Shutdown => {
                info!(group = %ctx.registry.group_name(), "stopping consumption for shutdown");
            }
            GenerationEnd::Membership => {
                // A session expiry silently drops our membership node, and
                // the resulting child change lands here. Re-register before
                // computing the next generation's assignment.
                match ctx.registry.instance_registered(&ctx.instance_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        match ctx.registry.register_instance(&ctx.instance_id, &topics).await {
                            Ok(()) => info!(
                                group = %ctx.registry.group_name(),
                                instance = %short_id(&ctx.instance_id),
                                "re-registered instance after losing membership node"
                            ),
                            Err(err) => warn!(
                                group = %ctx.registry.group_name(),
                                error = %err,
                                "failed to re-register instance"
                            ),
                        }
                    }
                    Err(err) => warn!(
                        group = %ctx.registry.group_name(),
                        error = %err,
                        "failed to verify instance registration"
                    ),
                }
                info!(
                    group = %ctx.registry.group_name(),
                    instance = %short_id(&ctx.instance_id),
                    "rebalancing after membership change"
                );
            }
            GenerationEnd::TopicChange(topic) => {
                info!(
                    group = %ctx.registry.group_name(),
                    topic = %topic,
                    "rebalancing after topic partition change"
                );
            }
        }

        let _ = cancel_tx.send(true);
        for task in tasks {
            let _ = task.await;
        }

        if matches!(end, GenerationEnd::Shutdown) {
            return;
        }
    }
}

/// Fires the generation's topic-change signal when the partition set of
/// `topic` changes.
async fn watch_topic_partitions_task(
    ctx: Arc<ConsumerContext>,
    topic: String,
    mut cancel: watch::Receiver<bool>,
    changes: mpsc::Sender<String>,
) {
    let watch = match ctx.registry.watch_topic_partitions(&topic).await {
        Ok((_, watch)) => watch,
        Err(err) => {
            warn!(
                group = %ctx.registry.group_name(),
                topic = %topic,
                error = %err,
                "failed to install topic partition watch"
            );
            // Park until the generation ends instead of spinning the
            // rebalance loop on a topic that cannot be watched.
            if !*cancel.borrow() {
                let _ = cancel.changed().await;
            }
            return;
        }
    };
    tokio::select! {
        _ = cancel.changed() => {}
        _ = watch => {
            let _ = changes.try_send(topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, PartitionStream, StartOffset};
    use crate::coordination::InMemoryCoordination;
    use async_trait::async_trait;

    struct NullBroker;

    #[async_trait]
    impl BrokerConsumer for NullBroker {
        async fn consume_partition(
            &self,
            topic: &str,
            partition: i32,
            _offset: StartOffset,
        ) -> std::result::Result<PartitionStream, BrokerError> {
            Err(BrokerError::Client(format!(
                "null broker cannot consume {topic}/{partition}"
            )))
        }

        async fn close(&self) -> std::result::Result<(), BrokerError> {
            Ok(())
        }
    }

    struct NullConnector;

    #[async_trait]
    impl BrokerConnector for NullConnector {
        async fn connect(
            &self,
            _brokers: &[String],
        ) -> std::result::Result<Arc<dyn BrokerConsumer>, BrokerError> {
            Ok(Arc::new(NullBroker))
        }
    }

    fn test_config() -> GroupConfig {
        let mut config = GroupConfig::default();
        config.coordination.addrs = vec!["memory:0".to_string()];
        config
    }

    #[tokio::test]
    async fn join_rejects_empty_group_name() {
        let store = InMemoryCoordination::new();
        let err = ConsumerGroup::join(
            "",
            vec!["events".to_string()],
            test_config(),
            Arc::new(store.session()),
            &NullConnector,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GroupError::EmptyGroupName));
    }

    #[tokio::test]
    async fn join_rejects_empty_topics() {
        let store = InMemoryCoordination::new();
        let err = ConsumerGroup::join(
            "g",
            Vec::new(),
            test_config(),
            Arc::new(store.session()),
            &NullConnector,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GroupError::NoTopics));
    }

    #[tokio::test]
    async fn join_rejects_missing_coordinator_addrs() {
        let store = InMemoryCoordination::new();
        let err = ConsumerGroup::join(
            "g",
            vec!["events".to_string()],
            GroupConfig::default(),
            Arc::new(store.session()),
            &NullConnector,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GroupError::EmptyCoordinatorAddrs));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let store = InMemoryCoordination::new();
        let (group, _streams) = ConsumerGroup::join(
            "g",
            vec!["events".to_string()],
            test_config(),
            Arc::new(store.session()),
            &NullConnector,
        )
        .await
        .unwrap();

        assert!(!group.closed());
        group.close().await.unwrap();
        assert!(group.closed());

        let err = group.close().await.unwrap_err();
        assert!(matches!(err, GroupError::AlreadyClosing));
    }

    #[tokio::test]
    async fn clean_close_removes_membership_node() {
        let store = InMemoryCoordination::new();
        let (group, _streams) = ConsumerGroup::join(
            "g",
            vec!["events".to_string()],
            test_config(),
            Arc::new(store.session()),
            &NullConnector,
        )
        .await
        .unwrap();

        let observer = store.session();
        let node = format!("consumers/g/ids/{}", group.instance_id());
        assert!(observer.exists(&node).await.unwrap());

        group.close().await.unwrap();
        assert!(!observer.exists(&node).await.unwrap());
    }

    #[test]
    fn short_id_keeps_the_tail() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789abcdef"), "456789abcdef");
    }
}
