//! Message and error envelopes delivered on the output streams.

use chrono::{DateTime, Utc};

use crate::error::GroupError;

/// A single message delivered to the application.
///
/// Within a partition, messages arrive on the output stream in broker
/// order. Pass the message back to
/// [`ConsumerGroup::commit_upto`](crate::ConsumerGroup::commit_upto) once
/// the application has finished processing it.
#[derive(Debug, Clone)]
pub struct GroupMessage {
    /// Topic the message was read from.
    pub topic: String,
    /// Partition the message was read from.
    pub partition: i32,
    /// Offset of the message within its partition.
    pub offset: i64,
    /// Message key, if present.
    pub key: Option<Vec<u8>>,
    /// Message payload.
    pub value: Vec<u8>,
    /// Broker timestamp, if available.
    pub timestamp: Option<DateTime<Utc>>,
}

/// An error surfaced on the error stream, tagged with its origin.
///
/// `partition` is `-1` for errors that concern a whole topic rather than a
/// single partition; `topic` is empty for group-level errors such as a
/// fatal coordination service failure.
#[derive(Debug)]
pub struct PartitionError {
    pub topic: String,
    pub partition: i32,
    pub error: GroupError,
}

impl std::fmt::Display for PartitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.topic.is_empty() {
            write!(f, "group: {}", self.error)
        } else if self.partition < 0 {
            write!(f, "{}: {}", self.topic, self.error)
        } else {
            write!(f, "{}/{}: {}", self.topic, self.partition, self.error)
        }
    }
}
