//! Offset tracking and durable commits.
//!
//! Three offsets exist per owned partition and they are deliberately kept
//! apart: `last_consumed` (delivered downstream), `highest_processed`
//! (acknowledged by the application), and `last_committed` (durably
//! stored). Splitting them lets commits run on a timer independent of
//! delivery while keeping at-least-once semantics, and gives shutdown a
//! precise drain target.
//!
//! [`PartitionOffsetTracker`] owns the per-partition state machine and its
//! invariant `last_committed <= highest_processed <= last_consumed`.
//! [`OffsetManager`] owns the tracker map, runs the periodic committer
//! task, and drives the init/finalize lifecycle as partitions are claimed
//! and released.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{GroupError, Result};
use crate::registry::GroupRegistry;
use crate::stats::GroupStats;

type TopicTrackers = HashMap<i32, Arc<PartitionOffsetTracker>>;
type OffsetMap = HashMap<String, TopicTrackers>;

/// Point-in-time view of a tracker's offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub last_consumed: i64,
    pub highest_processed: i64,
    pub last_committed: i64,
}

struct Drain {
    target: i64,
    done: oneshot::Sender<()>,
}

struct TrackerState {
    last_consumed: i64,
    highest_processed: i64,
    last_committed: i64,
    drain: Option<Drain>,
}

/// Per-partition offset state machine.
///
/// All operations are thread safe behind a single mutex that is never held
/// across an await point; the commit write itself happens outside the lock.
pub struct PartitionOffsetTracker {
    state: Mutex<TrackerState>,
}

impl PartitionOffsetTracker {
    /// Build a tracker for a partition whose persisted next offset is
    /// `next_offset` (`-1` when nothing was ever committed). All three
    /// offsets start one below it so the first real acknowledgement at
    /// `next_offset` is accepted.
    pub(crate) fn new(next_offset: i64) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                last_consumed: next_offset - 1,
                highest_processed: next_offset - 1,
                last_committed: next_offset - 1,
                drain: None,
            }),
        }
    }

    /// Record that `offset` was delivered downstream.
    pub fn mark_consumed(&self, offset: i64) {
        self.state.lock().last_consumed = offset;
    }

    /// Record that the application finished processing `offset`.
    pub fn mark_processed(&self, offset: i64) -> Result<()> {
        let mut state = self.state.lock();
        if offset > state.last_consumed + 1 {
            return Err(GroupError::OffsetTooLarge {
                offset,
                last_consumed: state.last_consumed,
            });
        }
        if offset <= state.highest_processed {
            return Err(GroupError::OffsetBackwards {
                offset,
                highest_processed: state.highest_processed,
            });
        }

        state.highest_processed = offset;
        let reached = state
            .drain
            .as_ref()
            .is_some_and(|drain| state.highest_processed >= drain.target);
        if reached {
            if let Some(drain) = state.drain.take() {
                let _ = drain.done.send(());
            }
        }
        Ok(())
    }

    /// Invoke `committer` with the highest processed offset if it is ahead
    /// of the last committed one, and advance `last_committed` on success.
    ///
    /// The committer persists `offset + 1`, the next offset to read, so a
    /// replacement consumer resumes at the first unprocessed message.
    pub async fn commit<F, Fut>(&self, committer: F) -> Result<()>
    where
        F: FnOnce(i64) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let target = {
            let state = self.state.lock();
            if state.highest_processed <= state.last_committed {
                return Err(GroupError::NoOffsetToCommit);
            }
            state.highest_processed
        };

        committer(target).await?;

        let mut state = self.state.lock();
        if target > state.last_committed {
            state.last_committed = target;
        }
        Ok(())
    }

    /// Wait until the application has acknowledged `offset`, or until
    /// `timeout` elapses. Returns whether the offset was reached.
    pub async fn wait_for_offset(&self, offset: i64, timeout: Duration) -> bool {
        let receiver = {
            let mut state = self.state.lock();
            if state.highest_processed >= offset {
                return true;
            }
            let (done, receiver) = oneshot::channel();
            state.drain = Some(Drain {
                target: offset,
                done,
            });
            receiver
        };

        tokio::time::timeout(timeout, receiver)
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.state.lock();
        TrackerSnapshot {
            last_consumed: state.last_consumed,
            highest_processed: state.highest_processed,
            last_committed: state.last_committed,
        }
    }
}

/// Offset trackers for every partition this instance currently owns, plus
/// the periodic committer.
///
/// Lock discipline: the committer round holds the map's read lock for the
/// whole round, finalize takes the write lock for its final commit and
/// removal. Acknowledgements only ever take the read lock, so a shutdown
/// drain never starves the application's `mark_as_processed` calls.
pub struct OffsetManager {
    registry: Arc<GroupRegistry>,
    stats: Arc<GroupStats>,
    offsets: Arc<RwLock<OffsetMap>>,
    closing: watch::Sender<bool>,
    committer: Mutex<Option<JoinHandle<()>>>,
}

impl OffsetManager {
    /// Build the manager and start its committer task, waking every
    /// `commit_interval`.
    pub fn new(
        registry: Arc<GroupRegistry>,
        commit_interval: Duration,
        stats: Arc<GroupStats>,
    ) -> Self {
        let offsets: Arc<RwLock<OffsetMap>> = Arc::new(RwLock::new(HashMap::new()));
        let (closing, closing_rx) = watch::channel(false);

        let committer = tokio::spawn(committer_loop(
            Arc::clone(&offsets),
            Arc::clone(&registry),
            Arc::clone(&stats),
            commit_interval,
            closing_rx,
        ));

        Self {
            registry,
            stats,
            offsets,
            closing,
            committer: Mutex::new(Some(committer)),
        }
    }

    /// Start tracking a freshly claimed partition. Returns the persisted
    /// next offset to read, `-1` if the group never committed one.
    pub async fn initialize_partition(&self, topic: &str, partition: i32) -> Result<i64> {
        let next_offset = self.registry.fetch_offset(topic, partition).await?;
        let tracker = Arc::new(PartitionOffsetTracker::new(next_offset));

        let mut offsets = self.offsets.write().await;
        offsets
            .entry(topic.to_string())
            .or_default()
            .insert(partition, tracker);
        debug!(
            group = %self.registry.group_name(),
            topic,
            partition,
            next_offset,
            "initialized partition tracker"
        );
        Ok(next_offset)
    }

    /// Stop tracking a partition that is being released.
    ///
    /// If `last_delivered` is non-negative, waits up to `timeout` for the
    /// application to acknowledge it (a timeout is logged and tolerated),
    /// then commits once more and removes the tracker.
    pub async fn finalize_partition(
        &self,
        topic: &str,
        partition: i32,
        last_delivered: i64,
        timeout: Duration,
    ) -> Result<()> {
        let tracker = {
            let offsets = self.offsets.read().await;
            offsets
                .get(topic)
                .and_then(|partitions| partitions.get(&partition))
                .cloned()
        }
        .ok_or_else(|| GroupError::TopicPartitionNotFound {
            topic: topic.to_string(),
            partition,
        })?;

        if last_delivered >= 0 && !tracker.wait_for_offset(last_delivered, timeout).await {
            let snapshot = tracker.snapshot();
            warn!(
                group = %self.registry.group_name(),
                topic,
                partition,
                last_delivered,
                last_committed = snapshot.last_committed,
                timeout_ms = timeout.as_millis() as u64,
                "timed out draining partition before release"
            );
        }

        let mut offsets = self.offsets.write().await;
        if last_delivered >= 0 {
            match commit_tracker(&self.registry, &self.stats, topic, partition, &tracker).await {
                Ok(()) | Err(GroupError::NoOffsetToCommit) => {}
                Err(err) => return Err(err),
            }
        }
        if let Some(partitions) = offsets.get_mut(topic) {
            partitions.remove(&partition);
            if partitions.is_empty() {
                offsets.remove(topic);
            }
        }
        Ok(())
    }

    /// Acknowledge that the application processed `offset`.
    pub async fn mark_as_processed(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let offsets = self.offsets.read().await;
        let tracker = offsets
            .get(topic)
            .and_then(|partitions| partitions.get(&partition))
            .ok_or_else(|| GroupError::TopicPartitionNotFound {
                topic: topic.to_string(),
                partition,
            })?;
        tracker.mark_processed(offset)
    }

    /// Record that `offset` was delivered downstream.
    pub async fn mark_as_consumed(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let offsets = self.offsets.read().await;
        let tracker = offsets
            .get(topic)
            .and_then(|partitions| partitions.get(&partition))
            .ok_or_else(|| GroupError::TopicPartitionNotFound {
                topic: topic.to_string(),
                partition,
            })?;
        tracker.mark_consumed(offset);
        Ok(())
    }

    /// Stop the committer and verify every partition was finalized.
    pub async fn close(&self) -> Result<()> {
        let _ = self.closing.send(true);
        let committer = self.committer.lock().take();
        if let Some(committer) = committer {
            let _ = committer.await;
        }

        let offsets = self.offsets.read().await;
        let leftover: usize = offsets.values().map(HashMap::len).sum();
        if leftover > 0 {
            warn!(
                group = %self.registry.group_name(),
                leftover,
                "offset manager closed with partitions still tracked"
            );
            return Err(GroupError::UncleanClose);
        }
        Ok(())
    }
}

async fn committer_loop(
    offsets: Arc<RwLock<OffsetMap>>,
    registry: Arc<GroupRegistry>,
    stats: Arc<GroupStats>,
    commit_interval: Duration,
    mut closing: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(commit_interval);
    loop {
        tokio::select! {
            _ = closing.changed() => break,
            _ = ticker.tick() => commit_round(&offsets, &registry, &stats).await,
        }
    }
    debug!(group = %registry.group_name(), "offset committer stopped");
}

/// Commit every tracker once. Holds the map's read lock for the round so
/// finalize (a writer) cannot race a commit on the same tracker.
async fn commit_round(
    offsets: &RwLock<OffsetMap>,
    registry: &GroupRegistry,
    stats: &GroupStats,
) {
    let offsets = offsets.read().await;
    for (topic, partitions) in offsets.iter() {
        for (&partition, tracker) in partitions {
            match commit_tracker(registry, stats, topic, partition, tracker).await {
                Ok(()) | Err(GroupError::NoOffsetToCommit) => {}
                Err(err) => {
                    debug!(
                        group = %registry.group_name(),
                        topic,
                        partition,
                        error = %err,
                        "offset commit failed"
                    );
                }
            }
        }
    }
}

async fn commit_tracker(
    registry: &GroupRegistry,
    stats: &GroupStats,
    topic: &str,
    partition: i32,
    tracker: &PartitionOffsetTracker,
) -> Result<()> {
    tracker
        .commit(|offset| async move {
            if offset < 0 {
                // Nothing real was ever processed; there is no next offset
                // worth persisting.
                return Ok(());
            }
            registry.commit_offset(topic, partition, offset + 1).await?;
            stats.record_offset_commit();
            Ok(())
        })
        .await
}
