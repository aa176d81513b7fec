//! Topic identities, their upstream queries and timing knobs.

use std::time::Duration;

use serde_json::{json, Value};

/// One downstream broadcast unit: all consumers interested in one derived
/// view share a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicKey {
    /// Live game list (plus per-game odds) for one sport.
    SportLive { sport_id: i64 },
    /// Full market tree for one game.
    GameMarkets { game_id: i64 },
    /// Sport/competition live-game counts for a named group.
    Counts { group: String },
}

impl TopicKey {
    pub fn label(&self) -> String {
        match self {
            TopicKey::SportLive { sport_id } => format!("sport_live:{sport_id}"),
            TopicKey::GameMarkets { game_id } => format!("game_markets:{game_id}"),
            TopicKey::Counts { group } => format!("counts:{group}"),
        }
    }

    /// Canonical upstream query for this view. Prematch visibility is
    /// filtered upstream (`visible_in_prematch`); we deliberately do not
    /// re-filter client-side.
    pub fn query(&self) -> Value {
        match self {
            TopicKey::SportLive { sport_id } => json!({
                "source": "betting",
                "what": {
                    "game": ["id", "team1_name", "team2_name", "text_info", "order", "start_ts"],
                    "market": ["id", "name", "type", "order", "base"],
                    "event": ["id", "name", "price", "order", "type_1"]
                },
                "where": {
                    "sport": { "id": sport_id },
                    "game":  { "is_live": 1 }
                }
            }),
            TopicKey::GameMarkets { game_id } => json!({
                "source": "betting",
                "what": {
                    "game": ["id", "team1_name", "team2_name", "text_info", "is_blocked"],
                    "market": ["id", "name", "type", "order", "base"],
                    "event": ["id", "name", "price", "order", "type_1"]
                },
                "where": {
                    "game": { "id": game_id }
                }
            }),
            TopicKey::Counts { group } => json!({
                "source": "betting",
                "what": {
                    "sport": ["id", "name", "order"],
                    "game": "@count"
                },
                "where": {
                    "game": if group == "prematch" {
                        json!({ "visible_in_prematch": 1 })
                    } else {
                        json!({ "is_live": 1 })
                    }
                }
            }),
        }
    }

    /// Poll cadence when the topic runs without a push subscription.
    pub fn poll_interval(&self) -> Duration {
        match self {
            TopicKey::SportLive { .. } => Duration::from_secs(3),
            TopicKey::GameMarkets { .. } => Duration::from_secs(2),
            TopicKey::Counts { .. } => Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicConfig {
    /// Burst coalescing window for push updates.
    pub debounce: Duration,
    /// How long an empty topic lingers before teardown.
    pub grace: Duration,
    /// Per-consumer idle-ping threshold.
    pub heartbeat: Duration,
    /// In poll mode, retry a push acquire every N cycles.
    pub poll_upgrade_every: u32,
    /// Push subscription with no update for this long is considered stale
    /// and re-acquired.
    pub push_stale_after: Duration,
    /// Test override for the per-kind poll cadence.
    pub poll_interval_override: Option<Duration>,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            grace: Duration::from_secs(45),
            heartbeat: Duration::from_secs(15),
            poll_upgrade_every: 6,
            push_stale_after: Duration::from_secs(90),
            poll_interval_override: None,
        }
    }
}

impl TopicConfig {
    pub fn poll_interval(&self, key: &TopicKey) -> Duration {
        self.poll_interval_override
            .unwrap_or_else(|| key.poll_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_mux::canonical_key;

    #[test]
    fn labels_are_stable() {
        assert_eq!(TopicKey::SportLive { sport_id: 1 }.label(), "sport_live:1");
        assert_eq!(TopicKey::GameMarkets { game_id: 7 }.label(), "game_markets:7");
        assert_eq!(
            TopicKey::Counts { group: "live".to_string() }.label(),
            "counts:live"
        );
    }

    #[test]
    fn same_topic_maps_to_same_upstream_subscription() {
        let a = TopicKey::SportLive { sport_id: 1 }.query();
        let b = TopicKey::SportLive { sport_id: 1 }.query();
        let c = TopicKey::SportLive { sport_id: 2 }.query();
        assert_eq!(canonical_key(&a), canonical_key(&b));
        assert_ne!(canonical_key(&a), canonical_key(&c));
    }
}
