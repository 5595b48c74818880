//! Consumer group configuration.
//!
//! [`GroupConfig`] carries everything a joining instance needs: output
//! channel sizing, offset handling (`initial` policy, commit cadence,
//! processing timeout), and the coordination service connection parameters.
//! All structures are serde-friendly so configuration can be loaded from
//! files, and `validate()` rejects values the engine cannot run with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GroupError, Result};

const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 256;
const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum accepted commit interval. Committing more often than this
/// hammers the coordination service for no delivery-semantics gain.
const MIN_COMMIT_INTERVAL: Duration = Duration::from_millis(10);

/// Top-level configuration for a consumer group instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Capacity of the message and error output channels.
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,

    /// Offset tracking and commit behavior.
    #[serde(default)]
    pub offsets: OffsetConfig,

    /// Coordination service connection parameters.
    #[serde(default)]
    pub coordination: CoordinationConfig,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            offsets: OffsetConfig::default(),
            coordination: CoordinationConfig::default(),
        }
    }
}

impl GroupConfig {
    /// Validate the configuration.
    ///
    /// Address presence is checked separately at join time so that the
    /// dedicated `EmptyCoordinatorAddrs` error can be reported.
    pub fn validate(&self) -> Result<()> {
        if self.channel_buffer_size == 0 {
            return Err(GroupError::InvalidConfiguration(
                "channel_buffer_size must be greater than 0".into(),
            ));
        }
        if self.offsets.commit_interval < MIN_COMMIT_INTERVAL {
            return Err(GroupError::InvalidConfiguration(format!(
                "commit_interval must be at least {}ms",
                MIN_COMMIT_INTERVAL.as_millis()
            )));
        }
        if self.offsets.processing_timeout.is_zero() {
            return Err(GroupError::InvalidConfiguration(
                "processing_timeout must be greater than 0".into(),
            ));
        }
        if self.coordination.session_timeout.is_zero() {
            return Err(GroupError::InvalidConfiguration(
                "coordination.session_timeout must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Offset handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetConfig {
    /// Where to start consuming a partition that has no persisted offset,
    /// and the fallback when the broker rejects a stored offset as out of
    /// range.
    #[serde(default)]
    pub initial: InitialOffset,

    /// Wipe all persisted offsets of the group before registering. Use with
    /// care; every instance of the group will re-consume per `initial`.
    #[serde(default)]
    pub reset_offsets: bool,

    /// Cadence of the periodic durable offset commit.
    #[serde(default = "default_commit_interval", with = "duration_millis")]
    pub commit_interval: Duration,

    /// How long a partition drain may take at finalize time. Also seeds the
    /// ownership claim retry budget.
    #[serde(default = "default_processing_timeout", with = "duration_millis")]
    pub processing_timeout: Duration,
}

impl Default for OffsetConfig {
    fn default() -> Self {
        Self {
            initial: InitialOffset::default(),
            reset_offsets: false,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
        }
    }
}

/// Initial offset policy for partitions without a persisted offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialOffset {
    /// Start from the oldest offset the broker still retains.
    #[default]
    Oldest,
    /// Start from the next offset the broker will produce.
    Newest,
}

/// Coordination service connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Coordination service endpoints (host:port).
    #[serde(default)]
    pub addrs: Vec<String>,

    /// Path prefix under which all group state lives.
    #[serde(default)]
    pub chroot: String,

    /// Session timeout requested from the coordination service. Ephemeral
    /// nodes of a dead instance disappear after this long.
    #[serde(default = "default_session_timeout", with = "duration_millis")]
    pub session_timeout: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            addrs: Vec::new(),
            chroot: String::new(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

fn default_channel_buffer_size() -> usize {
    DEFAULT_CHANNEL_BUFFER_SIZE
}

fn default_commit_interval() -> Duration {
    DEFAULT_COMMIT_INTERVAL
}

fn default_processing_timeout() -> Duration {
    DEFAULT_PROCESSING_TIMEOUT
}

fn default_session_timeout() -> Duration {
    DEFAULT_SESSION_TIMEOUT
}

/// Serialize durations as integer milliseconds.
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
