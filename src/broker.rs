//! Broker client seam.
//!
//! The engine never speaks the broker protocol itself. It requires a
//! [`BrokerConsumer`] that can open a per-partition stream at a given
//! offset, and a [`BrokerConnector`] that builds one from the broker list
//! read out of the coordination service at join time.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::InitialOffset;
use crate::message::GroupMessage;

/// Where to start a partition stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// The oldest offset the broker still retains.
    Oldest,
    /// The next offset the broker will produce.
    Newest,
    /// A specific offset.
    At(i64),
}

impl From<InitialOffset> for StartOffset {
    fn from(policy: InitialOffset) -> Self {
        match policy {
            InitialOffset::Oldest => StartOffset::Oldest,
            InitialOffset::Newest => StartOffset::Newest,
        }
    }
}

/// Errors reported by the broker client.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The requested offset is outside the broker's retained range. The
    /// partition consumer recovers from this with one policy-driven retry.
    #[error("offset {offset} out of range for {topic}/{partition}")]
    OffsetOutOfRange {
        topic: String,
        partition: i32,
        offset: i64,
    },

    /// Any other broker-side failure.
    #[error("broker client error: {0}")]
    Client(String),
}

impl BrokerError {
    pub fn is_offset_out_of_range(&self) -> bool {
        matches!(self, BrokerError::OffsetOutOfRange { .. })
    }
}

/// An open stream over one partition.
///
/// Messages arrive in broker order. Dropping the stream closes it and
/// releases any broker-side resources.
pub struct PartitionStream {
    pub messages: mpsc::Receiver<GroupMessage>,
    pub errors: mpsc::Receiver<BrokerError>,
}

/// Client able to consume individual partitions.
#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// Open a message stream over `topic`/`partition` starting at `offset`.
    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: StartOffset,
    ) -> Result<PartitionStream, BrokerError>;

    /// Release all client resources. Called once at group shutdown.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Factory turning the broker list from the coordination service into a
/// connected [`BrokerConsumer`].
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        brokers: &[String],
    ) -> Result<std::sync::Arc<dyn BrokerConsumer>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_offset_maps_to_start_offset() {
        assert_eq!(StartOffset::from(InitialOffset::Oldest), StartOffset::Oldest);
        assert_eq!(StartOffset::from(InitialOffset::Newest), StartOffset::Newest);
    }

    #[test]
    fn out_of_range_is_distinguishable() {
        let err = BrokerError::OffsetOutOfRange {
            topic: "events".into(),
            partition: 1,
            offset: 1000,
        };
        assert!(err.is_offset_out_of_range());
        assert!(!BrokerError::Client("boom".into()).is_offset_out_of_range());
    }
}
