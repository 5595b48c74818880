//! Error types for consumer group coordination.
//!
//! Errors are layered the way the collaborators are: [`CoordinationError`]
//! for the coordination service, [`BrokerError`] for the broker client, and
//! [`GroupError`] as the crate-level type that composes both and adds the
//! configuration, offset-discipline, and shutdown conditions.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::coordination::CoordinationError;

/// Result type alias for consumer group operations.
pub type Result<T> = std::result::Result<T, GroupError>;

/// Crate-level error type for consumer group operations.
#[derive(Error, Debug)]
pub enum GroupError {
    /// The consumer group name was empty at join.
    #[error("consumer group name must not be empty")]
    EmptyGroupName,

    /// No topics were provided at join.
    #[error("at least one topic must be subscribed")]
    NoTopics,

    /// No coordination service addresses were configured.
    #[error("no coordination service addresses configured")]
    EmptyCoordinatorAddrs,

    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// `close` was invoked while a previous `close` was already running
    /// or had completed.
    #[error("consumer group is already closing")]
    AlreadyClosing,

    /// The offset manager was closed while partitions were still tracked,
    /// meaning some partition was never finalized.
    #[error("offset manager closed while partitions were still tracked")]
    UncleanClose,

    /// An offset was acknowledged beyond what has been delivered. The
    /// application is ahead of the group, which is almost certainly a bug
    /// on the caller's side.
    #[error("offset {offset} is past the last delivered offset {last_consumed}")]
    OffsetTooLarge { offset: i64, last_consumed: i64 },

    /// An offset acknowledgement did not advance the highest processed
    /// offset. Acknowledgements must be monotone per partition.
    #[error("offset {offset} does not advance the highest processed offset {highest_processed}")]
    OffsetBackwards { offset: i64, highest_processed: i64 },

    /// A commit was requested but nothing new has been processed since the
    /// last commit.
    #[error("no offset to commit")]
    NoOffsetToCommit,

    /// The addressed partition has no tracker, either because it was never
    /// initialized or because it was finalized concurrently.
    #[error("no tracked partition {topic}/{partition}")]
    TopicPartitionNotFound { topic: String, partition: i32 },

    /// An error reported by the coordination service.
    #[error("coordination service error: {0}")]
    Coordination(#[from] CoordinationError),

    /// An error reported by the broker client.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl GroupError {
    /// Whether this error belongs to the offset discipline family, which is
    /// always returned to the caller and never terminates a task.
    pub fn is_offset_discipline(&self) -> bool {
        matches!(
            self,
            GroupError::OffsetTooLarge { .. }
                | GroupError::OffsetBackwards { .. }
                | GroupError::NoOffsetToCommit
                | GroupError::TopicPartitionNotFound { .. }
        )
    }

    /// Whether the error is fatal for the whole group rather than a
    /// condition the coordination engine retries or reports per partition.
    pub fn is_fatal(&self) -> bool {
        match self {
            GroupError::EmptyGroupName
            | GroupError::NoTopics
            | GroupError::EmptyCoordinatorAddrs
            | GroupError::InvalidConfiguration(_) => true,
            GroupError::Coordination(err) => !err.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_discipline_classification() {
        assert!(GroupError::NoOffsetToCommit.is_offset_discipline());
        assert!(GroupError::OffsetBackwards {
            offset: 3,
            highest_processed: 5
        }
        .is_offset_discipline());
        assert!(!GroupError::EmptyGroupName.is_offset_discipline());
    }

    #[test]
    fn configuration_errors_are_fatal() {
        assert!(GroupError::EmptyGroupName.is_fatal());
        assert!(GroupError::InvalidConfiguration("x".into()).is_fatal());
        assert!(!GroupError::NoOffsetToCommit.is_fatal());
    }

    #[test]
    fn transient_coordination_errors_are_not_fatal() {
        assert!(!GroupError::Coordination(CoordinationError::SessionExpired).is_fatal());
        assert!(GroupError::Coordination(CoordinationError::Other("denied".into())).is_fatal());
    }
}
