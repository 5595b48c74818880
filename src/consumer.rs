//! Per-generation consumption tasks.
//!
//! A [`TopicConsumer`] runs once per topic per rebalance generation: it
//! fetches the topic's partitions, computes the deterministic assignment
//! against the generation's membership snapshot, and spawns one
//! [`PartitionConsumer`] per owned partition. A partition consumer claims
//! the ownership node, resolves its start offset, pumps the broker stream
//! into the shared output channel, and finalizes plus releases on the way
//! out. Every blocking await in here races the generation cancellation
//! signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::assignment::assign_partitions;
use crate::broker::{BrokerConsumer, PartitionStream, StartOffset};
use crate::config::{GroupConfig, InitialOffset};
use crate::coordination::CoordinationError;
use crate::error::GroupError;
use crate::group::short_id;
use crate::message::{GroupMessage, PartitionError};
use crate::offsets::OffsetManager;
use crate::registry::GroupRegistry;
use crate::stats::GroupStats;

const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Everything a consumption task needs, shared across one group instance.
pub(crate) struct ConsumerContext {
    pub(crate) config: Arc<GroupConfig>,
    pub(crate) instance_id: Arc<String>,
    pub(crate) registry: Arc<GroupRegistry>,
    pub(crate) offsets: Arc<OffsetManager>,
    pub(crate) broker: Arc<dyn BrokerConsumer>,
    pub(crate) stats: Arc<GroupStats>,
    pub(crate) messages: mpsc::Sender<GroupMessage>,
    pub(crate) errors: mpsc::Sender<PartitionError>,
}

pub(crate) struct TopicConsumer {
    ctx: Arc<ConsumerContext>,
    topic: String,
    members: Arc<Vec<String>>,
    cancel: watch::Receiver<bool>,
}

impl TopicConsumer {
    pub(crate) fn new(
        ctx: Arc<ConsumerContext>,
        topic: String,
        members: Arc<Vec<String>>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            topic,
            members,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        if *self.cancel.borrow() {
            return;
        }
        debug!(
            group = %self.ctx.registry.group_name(),
            instance = %short_id(&self.ctx.instance_id),
            topic = %self.topic,
            "consuming topic"
        );

        let partitions = match self.ctx.registry.topic_partitions(&self.topic).await {
            Ok(partitions) => partitions,
            Err(err) => {
                warn!(
                    group = %self.ctx.registry.group_name(),
                    topic = %self.topic,
                    error = %err,
                    "failed to fetch topic partitions"
                );
                self.report(err.into()).await;
                return;
            }
        };

        let assignment = assign_partitions(&self.members, &partitions);
        let mine = assignment
            .get(self.ctx.instance_id.as_str())
            .cloned()
            .unwrap_or_default();
        info!(
            group = %self.ctx.registry.group_name(),
            instance = %short_id(&self.ctx.instance_id),
            topic = %self.topic,
            claiming = mine.len(),
            total = partitions.len(),
            "computed partition assignment"
        );

        if mine.is_empty() {
            let partition_ids: Vec<i32> = partitions.iter().map(|p| p.id).collect();
            info!(
                group = %self.ctx.registry.group_name(),
                instance = %short_id(&self.ctx.instance_id),
                topic = %self.topic,
                members = ?self.members,
                partitions = ?partition_ids,
                "standing by without assigned partitions"
            );
            if !*self.cancel.borrow() {
                let _ = self.cancel.changed().await;
            }
            return;
        }

        let mut workers = Vec::with_capacity(mine.len());
        for partition in mine {
            let consumer = PartitionConsumer::new(
                Arc::clone(&self.ctx),
                self.topic.clone(),
                partition.id,
                self.cancel.clone(),
            );
            workers.push(tokio::spawn(consumer.run()));
        }
        for worker in workers {
            let _ = worker.await;
        }
        debug!(
            group = %self.ctx.registry.group_name(),
            topic = %self.topic,
            "stopped consuming topic"
        );
    }

    async fn report(&mut self, error: GroupError) {
        let item = PartitionError {
            topic: self.topic.clone(),
            partition: -1,
            error,
        };
        tokio::select! {
            _ = self.cancel.changed() => {}
            sent = self.ctx.errors.send(item) => {
                if sent.is_ok() {
                    self.ctx.stats.record_error();
                }
            }
        }
    }
}

pub(crate) struct PartitionConsumer {
    ctx: Arc<ConsumerContext>,
    topic: String,
    partition: i32,
    cancel: watch::Receiver<bool>,
}

impl PartitionConsumer {
    pub(crate) fn new(
        ctx: Arc<ConsumerContext>,
        topic: String,
        partition: i32,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            topic,
            partition,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        if *self.cancel.borrow() {
            return;
        }
        if !self.claim().await {
            return;
        }

        self.consume_claimed().await;

        debug!(
            group = %self.ctx.registry.group_name(),
            instance = %short_id(&self.ctx.instance_id),
            topic = %self.topic,
            partition = self.partition,
            "releasing partition ownership"
        );
        if let Err(err) = self
            .ctx
            .registry
            .release_partition(&self.topic, self.partition)
            .await
        {
            warn!(
                group = %self.ctx.registry.group_name(),
                topic = %self.topic,
                partition = self.partition,
                error = %err,
                "failed to release partition ownership"
            );
        }
    }

    /// Try to create the ephemeral ownership node, retrying contention
    /// once per second. The retry budget is derived from the processing
    /// timeout so a previous owner gets its full drain window to let go.
    async fn claim(&mut self) -> bool {
        let budget = self.ctx.config.offsets.processing_timeout.as_secs() + 3;
        for attempt in 1..=budget {
            match self
                .ctx
                .registry
                .claim_partition(&self.ctx.instance_id, &self.topic, self.partition)
                .await
            {
                Ok(()) => {
                    debug!(
                        group = %self.ctx.registry.group_name(),
                        instance = %short_id(&self.ctx.instance_id),
                        topic = %self.topic,
                        partition = self.partition,
                        "claimed partition ownership"
                    );
                    return true;
                }
                Err(CoordinationError::NodeExists { .. }) if attempt < budget => {
                    tokio::select! {
                        _ = tokio::time::sleep(CLAIM_RETRY_DELAY) => {}
                        _ = self.cancel.changed() => return false,
                    }
                }
                Err(CoordinationError::NodeExists { .. }) => {
                    warn!(
                        group = %self.ctx.registry.group_name(),
                        topic = %self.topic,
                        partition = self.partition,
                        attempts = budget,
                        "gave up claiming contended partition"
                    );
                    return false;
                }
                Err(err) => {
                    warn!(
                        group = %self.ctx.registry.group_name(),
                        topic = %self.topic,
                        partition = self.partition,
                        error = %err,
                        "failed to claim partition ownership"
                    );
                    return false;
                }
            }
        }
        false
    }

    async fn consume_claimed(&mut self) {
        let next_offset = match self
            .ctx
            .offsets
            .initialize_partition(&self.topic, self.partition)
            .await
        {
            Ok(next_offset) => next_offset,
            Err(err) => {
                warn!(
                    group = %self.ctx.registry.group_name(),
                    topic = %self.topic,
                    partition = self.partition,
                    error = %err,
                    "could not determine initial offset"
                );
                return;
            }
        };

        let start = if next_offset >= 0 {
            info!(
                group = %self.ctx.registry.group_name(),
                topic = %self.topic,
                partition = self.partition,
                start_offset = next_offset,
                "resuming partition from committed offset"
            );
            StartOffset::At(next_offset)
        } else {
            let policy = self.ctx.config.offsets.initial;
            info!(
                group = %self.ctx.registry.group_name(),
                topic = %self.topic,
                partition = self.partition,
                policy = ?policy,
                "no committed offset, starting at initial policy"
            );
            StartOffset::from(policy)
        };

        let last_delivered = match self.open_stream(start).await {
            Some(stream) => self.pump(stream).await,
            None => -1,
        };

        info!(
            group = %self.ctx.registry.group_name(),
            topic = %self.topic,
            partition = self.partition,
            last_delivered,
            "partition consumer stopping"
        );
        let timeout = self.ctx.config.offsets.processing_timeout;
        if let Err(err) = self
            .ctx
            .offsets
            .finalize_partition(&self.topic, self.partition, last_delivered, timeout)
            .await
        {
            warn!(
                group = %self.ctx.registry.group_name(),
                topic = %self.topic,
                partition = self.partition,
                error = %err,
                "failed to finalize partition offsets"
            );
        }
    }

    /// Open the broker stream, retrying exactly once at the configured
    /// initial policy if the requested offset is out of range.
    async fn open_stream(&mut self, start: StartOffset) -> Option<PartitionStream> {
        match self
            .ctx
            .broker
            .consume_partition(&self.topic, self.partition, start)
            .await
        {
            Ok(stream) => Some(stream),
            Err(err) if err.is_offset_out_of_range() => {
                let fallback = match self.ctx.config.offsets.initial {
                    InitialOffset::Oldest => StartOffset::Oldest,
                    _ => StartOffset::Newest,
                };
                warn!(
                    group = %self.ctx.registry.group_name(),
                    topic = %self.topic,
                    partition = self.partition,
                    error = %err,
                    fallback = ?fallback,
                    "stored offset out of range, reopening at policy"
                );
                match self
                    .ctx
                    .broker
                    .consume_partition(&self.topic, self.partition, fallback)
                    .await
                {
                    Ok(stream) => Some(stream),
                    Err(err) => {
                        self.report(err.into()).await;
                        None
                    }
                }
            }
            Err(err) => {
                self.report(err.into()).await;
                None
            }
        }
    }

    /// Deliver messages and broker errors until cancellation or a stream
    /// end. Returns the offset of the last message actually handed to the
    /// application, `-1` if none was.
    async fn pump(&mut self, mut stream: PartitionStream) -> i64 {
        let mut last_delivered = -1;
        loop {
            tokio::select! {
                _ = self.cancel.changed() => break,
                error = stream.errors.recv() => {
                    let Some(error) = error else { break };
                    let item = PartitionError {
                        topic: self.topic.clone(),
                        partition: self.partition,
                        error: error.into(),
                    };
                    tokio::select! {
                        _ = self.cancel.changed() => break,
                        sent = self.ctx.errors.send(item) => {
                            if sent.is_err() {
                                break;
                            }
                            self.ctx.stats.record_error();
                        }
                    }
                }
                message = stream.messages.recv() => {
                    let Some(message) = message else { break };
                    let offset = message.offset;
                    tokio::select! {
                        _ = self.cancel.changed() => break,
                        sent = self.ctx.messages.send(message) => {
                            if sent.is_err() {
                                break;
                            }
                            last_delivered = offset;
                            self.ctx.stats.record_message();
                            if let Err(err) = self
                                .ctx
                                .offsets
                                .mark_as_consumed(&self.topic, self.partition, offset)
                                .await
                            {
                                warn!(
                                    topic = %self.topic,
                                    partition = self.partition,
                                    error = %err,
                                    "failed to record consumed offset"
                                );
                            }
                        }
                    }
                }
            }
        }
        last_delivered
    }

    async fn report(&mut self, error: GroupError) {
        let item = PartitionError {
            topic: self.topic.clone(),
            partition: self.partition,
            error,
        };
        tokio::select! {
            _ = self.cancel.changed() => {}
            sent = self.ctx.errors.send(item) => {
                if sent.is_ok() {
                    self.ctx.stats.record_error();
                }
            }
        }
    }
}
