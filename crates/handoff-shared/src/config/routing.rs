//! # Routing Config (C4)
//!
//! Parses the declarative routing file and exposes queue aliases, lane
//! aliases, per-type policies and ordered route rules as an immutable
//! in-memory snapshot. Uses strict YAML config loading: unknown fields are
//! rejected, and the file is parsed once at startup, with the in-memory
//! snapshot serving as the single source of truth thereafter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::RoutingConfigError;

/// Env var naming the routing config file path.
pub const ROUTING_CONFIG_PATH_ENV: &str = "HANDOFF_ROUTING_CONFIG_PATH";

/// Base queue aliases always available regardless of config content.
pub const BASE_QUEUE_ALIASES: &[(&str, &str)] = &[
    ("handoff", "handoff"),
    ("default", "handoff"),
    ("realtime", "handoff:realtime"),
    ("batch", "handoff:batch"),
    ("integration", "handoff:integration"),
];

/// Static lane alias map.
pub const BASE_LANE_ALIASES: &[(&str, &str)] = &[
    ("main", "main"),
    ("subagent", "subagent"),
    ("cron", "cron"),
    ("nested", "nested"),
    ("high", "main"),
    ("normal", "main"),
    ("low", "cron"),
];

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct QueueDef {
    pub bull_queue_name: String,
    #[serde(default)]
    pub max_in_flight: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LanePolicyDef {
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub max_queued: Option<u32>,
    #[serde(default)]
    pub map_to_lane: Option<String>,
}

/// `retry` fields on a type policy. By design,
/// only `max_attempts` is consumed by the queue processor; the rest are
/// parsed-and-ignored without error so config files stay forward compatible.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicyDef {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<String>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Option<bool>,
    #[serde(default)]
    pub retry_on: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TypePolicyDef {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub lane: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicyDef>,
    #[serde(default)]
    pub idempotency: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RouteMatchDef {
    #[serde(default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub type_prefix: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl RouteMatchDef {
    fn is_empty(&self) -> bool {
        self.r#type.is_none()
            && self.type_prefix.is_none()
            && self.tenant_id.is_none()
            && self.organization_id.is_none()
            && self.source.is_none()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RouteTargetDef {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub lane: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RouteDef {
    #[serde(rename = "match")]
    pub match_: RouteMatchDef,
    pub target: RouteTargetDef,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfigFile {
    pub version: u32,
    pub default_queue: String,
    pub default_lane: String,
    #[serde(default)]
    pub queues: HashMap<String, QueueDef>,
    #[serde(default)]
    pub lane_policy: HashMap<String, LanePolicyDef>,
    #[serde(default)]
    pub type_policies: HashMap<String, TypePolicyDef>,
    #[serde(default)]
    pub routes: Vec<RouteDef>,
}

/// The validated, immutable in-memory snapshot consulted by the route
/// resolver on every dispatch.
#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    pub version: u32,
    pub default_queue: String,
    pub default_lane: String,
    pub queues: HashMap<String, QueueDef>,
    pub lane_policy: HashMap<String, LanePolicyDef>,
    pub type_policies: HashMap<String, TypePolicyDef>,
    pub routes: Vec<RouteDef>,
    queue_aliases: HashMap<String, String>,
    lane_aliases: HashMap<String, String>,
}

impl RoutingConfig {
    /// An empty snapshot used when the config path env var is unset.
    /// Policy: warn-and-empty, never a
    /// hardcoded fallback file.
    pub fn empty() -> Self {
        Self {
            version: 0,
            default_queue: "handoff".to_string(),
            default_lane: "main".to_string(),
            queue_aliases: BASE_QUEUE_ALIASES
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            lane_aliases: BASE_LANE_ALIASES
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn validate(file: &RoutingConfigFile) -> Result<(), RoutingConfigError> {
        for (index, route) in file.routes.iter().enumerate() {
            if route.match_.is_empty() {
                return Err(RoutingConfigError::EmptyMatch { index });
            }
        }
        Ok(())
    }

    fn from_file(file: RoutingConfigFile) -> Result<Self, RoutingConfigError> {
        Self::validate(&file)?;

        let mut queue_aliases: HashMap<String, String> = BASE_QUEUE_ALIASES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (alias, def) in &file.queues {
            queue_aliases.insert(alias.clone(), def.bull_queue_name.clone());
        }

        let lane_aliases: HashMap<String, String> = BASE_LANE_ALIASES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Ok(Self {
            version: file.version,
            default_queue: file.default_queue,
            default_lane: file.default_lane,
            queues: file.queues,
            lane_policy: file.lane_policy,
            type_policies: file.type_policies,
            routes: file.routes,
            queue_aliases,
            lane_aliases,
        })
    }

    /// Parse a routing config document from its textual YAML form.
    pub fn parse(yaml: &str) -> Result<Self, RoutingConfigError> {
        let file: RoutingConfigFile = serde_yaml::from_str(yaml)?;
        Self::from_file(file)
    }

    fn load_from_path(path: &Path) -> Result<Self, RoutingConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| RoutingConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Load from `HANDOFF_ROUTING_CONFIG_PATH`, resolving relative paths
    /// against `server_root`. Logs a summary on success; on an unset env
    /// var or a load/parse failure, logs a warning and falls back to an
    /// empty snapshot rather than failing startup.
    pub fn load_from_env(server_root: &Path) -> Self {
        match std::env::var(ROUTING_CONFIG_PATH_ENV) {
            Ok(raw_path) => {
                let path = PathBuf::from(&raw_path);
                let resolved = if path.is_absolute() {
                    path
                } else {
                    server_root.join(path)
                };
                match Self::load_from_path(&resolved) {
                    Ok(config) => {
                        tracing::info!(
                            version = config_version(&config),
                            route_count = config.routes.len(),
                            path = %resolved.display(),
                            "loaded routing config"
                        );
                        config
                    }
                    Err(err) => {
                        tracing::error!(error = %err, path = %resolved.display(), "failed to load routing config, starting with empty snapshot");
                        Self::empty()
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    env_var = ROUTING_CONFIG_PATH_ENV,
                    "routing config path unset, starting with empty snapshot"
                );
                Self::empty()
            }
        }
    }

    /// Resolve a queue alias to its backend queue name; unknown aliases pass
    /// through unchanged (callers decide whether that's a valid backend name).
    pub fn resolve_queue_alias(&self, alias: &str) -> String {
        self.queue_aliases
            .get(alias)
            .cloned()
            .unwrap_or_else(|| alias.to_string())
    }

    /// Resolve a lane alias, consulting `lane_policy[...].map_to_lane` before
    /// the static base map.
    pub fn resolve_lane_alias(&self, alias: &str) -> String {
        if let Some(policy) = self.lane_policy.get(alias) {
            if let Some(mapped) = &policy.map_to_lane {
                return mapped.clone();
            }
        }
        self.lane_aliases
            .get(alias)
            .cloned()
            .unwrap_or_else(|| alias.to_string())
    }
}

fn config_version(config: &RoutingConfig) -> u32 {
    config.version
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 1
default_queue: handoff
default_lane: main
queues:
  realtime:
    bull_queue_name: "handoff:realtime"
type_policies:
  agent.chat.v1:
    queue: realtime
    lane: main
    timeout_ms: 5000
routes:
  - match:
      type: agent.chat.v1
    target:
      queue: integration
"#;

    #[test]
    fn parses_sample_config() {
        let config = RoutingConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.default_queue, "handoff");
        assert_eq!(config.routes.len(), 1);
        assert_eq!(
            config.type_policies.get("agent.chat.v1").unwrap().lane,
            Some("main".to_string())
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let bad = "version: 1\ndefault_queue: handoff\ndefault_lane: main\nbogus_field: true\n";
        assert!(RoutingConfig::parse(bad).is_err());
    }

    #[test]
    fn rejects_empty_route_match() {
        let bad = r#"
version: 1
default_queue: handoff
default_lane: main
routes:
  - match: {}
    target:
      queue: handoff
"#;
        let err = RoutingConfig::parse(bad).unwrap_err();
        assert!(matches!(err, RoutingConfigError::EmptyMatch { index: 0 }));
    }

    #[test]
    fn resolves_queue_alias_from_config_then_base() {
        let config = RoutingConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.resolve_queue_alias("realtime"), "handoff:realtime");
        assert_eq!(config.resolve_queue_alias("batch"), "handoff:batch");
        assert_eq!(config.resolve_queue_alias("unknown"), "unknown");
    }

    #[test]
    fn resolves_lane_alias_static_map() {
        let config = RoutingConfig::empty();
        assert_eq!(config.resolve_lane_alias("high"), "main");
        assert_eq!(config.resolve_lane_alias("low"), "cron");
        assert_eq!(config.resolve_lane_alias("subagent"), "subagent");
    }

    #[test]
    fn lane_policy_map_to_lane_overrides_base_alias() {
        let yaml = r#"
version: 1
default_queue: handoff
default_lane: main
lane_policy:
  custom:
    map_to_lane: nested
"#;
        let config = RoutingConfig::parse(yaml).unwrap();
        assert_eq!(config.resolve_lane_alias("custom"), "nested");
    }

    #[test]
    fn empty_snapshot_has_base_aliases_only() {
        let config = RoutingConfig::empty();
        assert_eq!(config.resolve_queue_alias("realtime"), "handoff:realtime");
        assert!(config.routes.is_empty());
        assert!(config.type_policies.is_empty());
    }
}
