use serde::{Deserialize, Serialize};

use crate::common::{Error, NodeId, Result, UserId};

/// Top-level engine configuration: one pool, many nodes.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub nodes: Vec<NodeSettings>,
}

/// Pool-wide tunables shared by every node connection.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PoolSettings {
    /// The user id the pool acts as, sent in the `User-Id` handshake header.
    pub user_id: UserId,
    /// Deadline for correlated request/response calls, in milliseconds.
    pub request_timeout_ms: u64,
    pub backoff: BackoffSettings,
    pub health: HealthSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            user_id: UserId(0),
            request_timeout_ms: 10_000,
            backoff: BackoffSettings::default(),
            health: HealthSettings::default(),
        }
    }
}

/// One configured backend node.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeSettings {
    /// Unique label for this node within the pool.
    pub label: NodeId,
    pub host: String,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub secure: bool,
    /// Optional region label matched against selection criteria.
    #[serde(default)]
    pub region: Option<String>,
    /// If set, the node only serves sessions whose shard is listed.
    #[serde(default)]
    pub shards: Option<Vec<u64>>,
}

impl NodeSettings {
    pub fn rest_uri(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn ws_uri(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Reconnect backoff curve. The exact curve is a tunable, not a contract:
/// exponential doubling from `base_ms` capped at `ceiling_ms`, plus up to
/// `jitter_ms` of random spread, giving up after `max_attempts`
/// consecutive failures.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BackoffSettings {
    pub base_ms: u64,
    pub ceiling_ms: u64,
    pub jitter_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            ceiling_ms: 60_000,
            jitter_ms: 250,
            max_attempts: 5,
        }
    }
}

/// Weights for the node penalty score. Defaults follow the curve Lavalink
/// clients have always used; tests must only rely on relative ordering.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct HealthSettings {
    pub player_weight: f64,
    pub cpu_weight: f64,
    pub frame_weight: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            player_weight: 1.0,
            cpu_weight: 1.0,
            frame_weight: 1.0,
        }
    }
}

impl Config {
    /// Parses a TOML configuration string.
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads configuration from a TOML file on disk.
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path, e)))?;
        Self::from_toml(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg = Config::from_toml(
            r#"
            [pool]
            user_id = 1234

            [[nodes]]
            label = "eu-1"
            host = "lava.example.com"
            port = 2333
            password = "youshallnotpass"
            secure = true
            region = "rotterdam"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.pool.user_id, UserId(1234));
        assert_eq!(cfg.nodes.len(), 1);
        let node = &cfg.nodes[0];
        assert_eq!(node.label.0, "eu-1");
        assert_eq!(node.rest_uri(), "https://lava.example.com:2333");
        assert_eq!(node.ws_uri(), "wss://lava.example.com:2333");
        assert_eq!(node.region.as_deref(), Some("rotterdam"));
    }

    #[test]
    fn defaults_apply_when_sections_missing() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.pool.backoff.base_ms, 1_000);
        assert_eq!(cfg.pool.backoff.ceiling_ms, 60_000);
        assert_eq!(cfg.pool.backoff.max_attempts, 5);
        assert!(cfg.nodes.is_empty());
    }

    #[test]
    fn insecure_uris_use_plain_schemes() {
        let node = NodeSettings {
            label: NodeId::from("local"),
            host: "127.0.0.1".into(),
            port: 2333,
            password: "pw".into(),
            secure: false,
            region: None,
            shards: None,
        };
        assert_eq!(node.rest_uri(), "http://127.0.0.1:2333");
        assert_eq!(node.ws_uri(), "ws://127.0.0.1:2333");
    }
}
