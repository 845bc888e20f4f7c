//! Route Resolver (C5): deterministically picks queue, lane, timeout and
//! type policy for one message given the routing config snapshot.

use handoff_shared::config::routing::{RouteDef, TypePolicyDef};
use handoff_shared::{HandoffMessage, RoutingConfig, HEADER_HANDOFF_QUEUE, HEADER_POLICY_TIMEOUT_MS, HEADER_REQUESTED_LANE};

/// Output of route resolution for one message.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub queue: String,
    pub lane: String,
    pub timeout_ms: Option<u64>,
    pub type_policy: Option<TypePolicyDef>,
}

#[derive(Debug, Default)]
pub struct RouteResolver;

impl RouteResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `{queue, lane, timeout, typePolicy}` for `message` against
    /// `config`. Deterministic: same snapshot and envelope always produce
    /// the same result.
    pub fn resolve(&self, config: &RoutingConfig, message: &HandoffMessage) -> ResolvedRoute {
        let type_policy = config.type_policies.get(&message.message_type).cloned();
        let matched_route = Self::first_matching_route(config, message);

        let queue = message
            .header(HEADER_HANDOFF_QUEUE)
            .map(|alias| config.resolve_queue_alias(alias))
            .or_else(|| type_policy.as_ref().and_then(|p| p.queue.clone()))
            .or_else(|| {
                matched_route
                    .and_then(|route| route.target.queue.clone())
                    .map(|alias| config.resolve_queue_alias(&alias))
            })
            .unwrap_or_else(|| config.default_queue.clone());

        let lane = message
            .header(HEADER_REQUESTED_LANE)
            .map(|alias| config.resolve_lane_alias(alias))
            .or_else(|| type_policy.as_ref().and_then(|p| p.lane.clone()))
            .or_else(|| matched_route.and_then(|route| route.target.lane.clone()))
            .unwrap_or_else(|| config.default_lane.clone());

        let timeout_ms = message
            .header(HEADER_POLICY_TIMEOUT_MS)
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .or_else(|| type_policy.as_ref().and_then(|p| p.timeout_ms))
            .or_else(|| matched_route.and_then(|route| route.target.timeout_ms));

        ResolvedRoute {
            queue,
            lane,
            timeout_ms,
            type_policy,
        }
    }

    /// First route (in config order) whose match conditions are all
    /// satisfied by `message`.
    fn first_matching_route<'a>(
        config: &'a RoutingConfig,
        message: &HandoffMessage,
    ) -> Option<&'a RouteDef> {
        config.routes.iter().find(|route| {
            let m = &route.match_;
            let type_ok = m
                .r#type
                .as_deref()
                .map(|expected| expected == message.message_type)
                .unwrap_or(true);
            let prefix_ok = m
                .type_prefix
                .as_deref()
                .map(|prefix| message.message_type.starts_with(prefix))
                .unwrap_or(true);
            let tenant_ok = m
                .tenant_id
                .as_deref()
                .map(|expected| expected == message.tenant_id)
                .unwrap_or(true);
            let org_ok = m
                .organization_id
                .as_deref()
                .map(|expected| Some(expected) == message.organization_id())
                .unwrap_or(true);
            let source_ok = m
                .source
                .as_deref()
                .map(|expected| Some(expected) == message.header(handoff_shared::HEADER_SOURCE))
                .unwrap_or(true);
            type_ok && prefix_ok && tenant_ok && org_ok && source_ok
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn message(headers: HashMap<String, String>) -> HandoffMessage {
        HandoffMessage {
            id: "m1".into(),
            message_type: "agent.chat.v1".into(),
            version: 1,
            tenant_id: "t".into(),
            session_key: "s".into(),
            business_key: "b".into(),
            attempt: 1,
            max_attempts: 3,
            enqueued_at: 0,
            trace_id: "tr".into(),
            parent_message_id: None,
            payload: HashMap::new(),
            headers,
        }
    }

    fn config_with_precedence_fixture() -> RoutingConfig {
        let yaml = r#"
version: 1
default_queue: handoff
default_lane: main
queues:
  realtime:
    bull_queue_name: "handoff:realtime"
  batch:
    bull_queue_name: "handoff:batch"
  integration:
    bull_queue_name: "handoff:integration"
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
        RoutingConfig::parse(yaml).unwrap()
    }

    #[test]
    fn header_queue_and_timeout_win_over_type_policy_and_route() {
        let config = config_with_precedence_fixture();
        let mut headers = HashMap::new();
        headers.insert("handoffQueue".to_string(), "batch".to_string());
        headers.insert("policyTimeoutMs".to_string(), "12000".to_string());
        let msg = message(headers);

        let resolved = RouteResolver::new().resolve(&config, &msg);
        assert_eq!(resolved.queue, "handoff:batch");
        assert_eq!(resolved.lane, "main");
        assert_eq!(resolved.timeout_ms, Some(12000));
    }

    #[test]
    fn falls_back_through_type_policy_then_route_then_default() {
        let config = config_with_precedence_fixture();
        let msg = message(HashMap::new());
        let resolved = RouteResolver::new().resolve(&config, &msg);
        assert_eq!(resolved.queue, "handoff:realtime");
        assert_eq!(resolved.lane, "main");
        assert_eq!(resolved.timeout_ms, Some(5000));
    }

    #[test]
    fn route_target_used_when_no_type_policy() {
        let yaml = r#"
version: 1
default_queue: handoff
default_lane: main
queues:
  integration:
    bull_queue_name: "handoff:integration"
routes:
  - match:
      type: system.sweep.v1
    target:
      queue: integration
      lane: cron
"#;
        let config = RoutingConfig::parse(yaml).unwrap();
        let mut msg = message(HashMap::new());
        msg.message_type = "system.sweep.v1".into();
        let resolved = RouteResolver::new().resolve(&config, &msg);
        assert_eq!(resolved.queue, "handoff:integration");
        assert_eq!(resolved.lane, "cron");
    }

    #[test]
    fn unmatched_message_uses_defaults() {
        let config = RoutingConfig::empty();
        let msg = message(HashMap::new());
        let resolved = RouteResolver::new().resolve(&config, &msg);
        assert_eq!(resolved.queue, "handoff");
        assert_eq!(resolved.lane, "main");
        assert_eq!(resolved.timeout_ms, None);
    }

    #[test]
    fn non_positive_header_timeout_is_ignored() {
        let config = config_with_precedence_fixture();
        let mut headers = HashMap::new();
        headers.insert("policyTimeoutMs".to_string(), "0".to_string());
        let msg = message(headers);
        let resolved = RouteResolver::new().resolve(&config, &msg);
        assert_eq!(resolved.timeout_ms, Some(5000));
    }

    #[test]
    fn resolve_is_deterministic() {
        let config = config_with_precedence_fixture();
        let msg = message(HashMap::new());
        let a = RouteResolver::new().resolve(&config, &msg);
        let b = RouteResolver::new().resolve(&config, &msg);
        assert_eq!(a.queue, b.queue);
        assert_eq!(a.lane, b.lane);
        assert_eq!(a.timeout_ms, b.timeout_ms);
    }
}
