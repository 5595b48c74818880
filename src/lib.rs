//! ZooKeeper-coordinated Kafka consumer groups.
//!
//! This crate implements the coordination side of a consumer group for a
//! partitioned, log-structured pub/sub cluster: processes that share a
//! group name divide the partitions of their subscribed topics among
//! themselves so that every partition has exactly one live owner, and
//! consumption offsets survive crashes and rebalances.
//!
//! # What it does
//!
//! - **Membership and rebalancing.** Each instance registers an ephemeral
//!   node in the coordination service and watches the member list. Any
//!   join, leave, or crash starts a new *generation*: the current
//!   consumers are torn down and a fresh assignment is computed.
//! - **Deterministic assignment.** Partitions are split into contiguous
//!   ranges over the sorted member ids, so every instance computes the
//!   same assignment independently; no central coordinator is needed.
//! - **Exclusive ownership.** A partition is consumed only while holding
//!   its ephemeral ownership node, created with an atomic
//!   create-if-absent and retried while the previous owner lets go.
//! - **Offset management.** Delivered, acknowledged, and committed offsets
//!   are tracked separately per partition. A background task commits
//!   acknowledged offsets on an interval, and shutdown drains in-flight
//!   acknowledgements before the final commit.
//!
//! The broker protocol client and the coordination service client stay
//! outside this crate, behind the [`BrokerConsumer`]/[`BrokerConnector`]
//! and [`CoordinationClient`] traits. [`InMemoryCoordination`] is a
//! complete in-process coordination store for tests and development.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zk_consumer_group::{ConsumerGroup, GroupConfig, InMemoryCoordination};
//! # use async_trait::async_trait;
//! # use zk_consumer_group::{BrokerConnector, BrokerConsumer, BrokerError};
//! # struct MyConnector;
//! # #[async_trait]
//! # impl BrokerConnector for MyConnector {
//! #     async fn connect(
//! #         &self,
//! #         _brokers: &[String],
//! #     ) -> Result<Arc<dyn BrokerConsumer>, BrokerError> {
//! #         unimplemented!("wrap your broker client here")
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = GroupConfig::default();
//!     config.coordination.addrs = vec!["zk-1:2181".to_string()];
//!
//!     let store = InMemoryCoordination::new();
//!     let (group, mut streams) = ConsumerGroup::join(
//!         "analytics",
//!         vec!["events".to_string()],
//!         config,
//!         Arc::new(store.session()),
//!         &MyConnector,
//!     )
//!     .await?;
//!
//!     while let Some(message) = streams.messages.recv().await {
//!         // process, then acknowledge
//!         group.commit_upto(&message).await?;
//!     }
//!
//!     group.close().await?;
//!     Ok(())
//! }
//! ```

pub mod assignment;
pub mod broker;
pub mod config;
mod consumer;
pub mod coordination;
pub mod error;
pub mod group;
pub mod message;
pub mod offsets;
pub mod registry;
pub mod stats;

pub use assignment::{assign_partitions, PartitionInfo};
pub use broker::{BrokerConnector, BrokerConsumer, BrokerError, PartitionStream, StartOffset};
pub use config::{CoordinationConfig, GroupConfig, InitialOffset, OffsetConfig};
pub use coordination::{
    ChangeWatch, CoordinationClient, CoordinationError, InMemoryCoordination, InMemorySession,
};
pub use error::{GroupError, Result};
pub use group::{ConsumerGroup, GroupStreams};
pub use message::{GroupMessage, PartitionError};
pub use offsets::{OffsetManager, PartitionOffsetTracker, TrackerSnapshot};
pub use registry::GroupRegistry;
pub use stats::{GroupStats, GroupStatsSnapshot};
