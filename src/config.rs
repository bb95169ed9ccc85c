//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one gossip engine. All durations are serialized as
/// integral milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Period of the sender loop.
    #[serde(with = "duration_ms")]
    pub gossip_interval: Duration,
    /// How long the local node stays Suspect-Not-In-Quorum before
    /// degrading to Not-In-Quorum.
    #[serde(with = "duration_ms")]
    pub quorum_timeout: Duration,
    /// How long a peer stays Suspect-Down before being declared Down.
    #[serde(with = "duration_ms")]
    pub suspect_down_timeout: Duration,
    /// Deadline armed on every socket read and write.
    #[serde(with = "duration_ms")]
    pub io_deadline: Duration,
    /// Deadline for establishing an outbound connection.
    #[serde(with = "duration_ms")]
    pub dial_deadline: Duration,
    /// When non-zero, a sweeper declares Down any peer whose record has
    /// not been refreshed within this interval.
    #[serde(with = "duration_ms")]
    pub node_death_interval: Duration,
    /// Upper bound on a single framed message.
    pub max_frame_bytes: usize,
    /// Concurrent inbound session cap; excess connections are dropped.
    pub max_inbound_sessions: usize,
    /// Depth of the state-machine event queue.
    pub event_queue_depth: usize,
    /// How long an event submission may block before being dropped.
    #[serde(with = "duration_ms")]
    pub event_submit_timeout: Duration,
    /// Re-stamp the local entry on every sender tick.
    pub self_correct: bool,
    /// Ring-buffer capacity of the session history.
    pub history_capacity: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(2),
            quorum_timeout: Duration::from_secs(30),
            suspect_down_timeout: Duration::from_secs(10),
            io_deadline: Duration::from_secs(20),
            dial_deadline: Duration::from_secs(5),
            node_death_interval: Duration::ZERO,
            max_frame_bytes: 4 * 1024 * 1024,
            max_inbound_sessions: 32,
            event_queue_depth: 128,
            event_submit_timeout: Duration::from_secs(2),
            self_correct: true,
            history_capacity: 32,
        }
    }
}

impl GossipConfig {
    pub fn death_sweeper_enabled(&self) -> bool {
        !self.node_death_interval.is_zero()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GossipConfig::default();
        assert_eq!(config.gossip_interval, Duration::from_secs(2));
        assert!(config.quorum_timeout > config.gossip_interval);
        assert!(!config.death_sweeper_enabled());
    }

    #[test]
    fn durations_roundtrip_as_milliseconds() {
        let mut config = GossipConfig::default();
        config.gossip_interval = Duration::from_millis(250);
        config.node_death_interval = Duration::from_secs(90);

        let encoded = serde_json::to_value(&config).unwrap();
        assert_eq!(encoded["gossip_interval"], 250);
        assert_eq!(encoded["node_death_interval"], 90_000);

        let decoded: GossipConfig = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.gossip_interval, Duration::from_millis(250));
        assert!(decoded.death_sweeper_enabled());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let decoded: GossipConfig = serde_json::from_str(r#"{"gossip_interval": 100}"#).unwrap();
        assert_eq!(decoded.gossip_interval, Duration::from_millis(100));
        assert_eq!(decoded.max_inbound_sessions, 32);
        assert!(decoded.self_correct);
    }
}
