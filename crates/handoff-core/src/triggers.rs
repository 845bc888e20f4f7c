//! Trigger Publisher / Bootstrap Recovery (C14): diff-based publish of
//! declarative triggers against a provider, plus a bootstrap loop that
//! replays them after a restart under a per-target distributed lock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use handoff_shared::{HandoffMessage, NewMessage};

use crate::lock::DistributedLock;
use crate::service::{CallerContext, QueueService};

const BOOTSTRAP_LOCK_TTL: Duration = Duration::from_secs(10);
const BOOTSTRAP_PAGE_SIZE: usize = 50;
const TRIGGER_CALLER: &str = "trigger-publisher";

/// One declarative trigger attached to a graph node. `from == "chat"` marks
/// a trigger sourced from the chat surface, which publish ignores entirely.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub from: String,
    pub provider: String,
    pub config: serde_json::Value,
}

/// One publish/bootstrap target — a graph identified by `xpert_id` plus the
/// triggers declared on it.
#[derive(Debug, Clone)]
pub struct Graph {
    pub xpert_id: String,
    pub triggers: Vec<Trigger>,
}

/// Recursively sort object keys so two deep-equal values serialize
/// identically regardless of field insertion order.
pub fn stable_serialize(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut sorted_map = serde_json::Map::new();
                for (k, v) in entries {
                    sorted_map.insert(k.clone(), sorted(v));
                }
                serde_json::Value::Object(sorted_map)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// Equal iff the two values are deep-equal after key-sorting.
pub fn config_hash(value: &serde_json::Value) -> String {
    stable_serialize(value)
}

fn snapshot(graph: &Graph, provider_filter: Option<&[String]>) -> HashMap<String, (String, Trigger)> {
    let mut map = HashMap::new();
    for trigger in &graph.triggers {
        if trigger.from == "chat" {
            continue;
        }
        if let Some(filter) = provider_filter {
            if !filter.contains(&trigger.provider) {
                continue;
            }
        }
        map.insert(
            trigger.provider.clone(),
            (config_hash(&trigger.config), trigger.clone()),
        );
    }
    map
}

struct Delta {
    added: Vec<String>,
    removed: Vec<String>,
    changed: Vec<String>,
}

fn diff(
    previous: &HashMap<String, (String, Trigger)>,
    current: &HashMap<String, (String, Trigger)>,
) -> Delta {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut changed = Vec::new();
    for provider in current.keys() {
        if !previous.contains_key(provider) {
            added.push(provider.clone());
        } else if previous[provider].0 != current[provider].0 {
            changed.push(provider.clone());
        }
    }
    for provider in previous.keys() {
        if !current.contains_key(provider) {
            removed.push(provider.clone());
        }
    }
    Delta {
        added,
        removed,
        changed,
    }
}

/// A payload a provider hands back through its publish callback.
pub enum TriggerCallbackPayload {
    /// A fully-built envelope, enqueued as-is.
    Message(HandoffMessage),
    /// A re-dispatch of external state, routed through a synthesized
    /// `system.trigger.v1` envelope.
    Redispatch {
        state: serde_json::Value,
        from: String,
        execution_id: Option<String>,
    },
}

pub type TriggerCallback =
    Arc<dyn Fn(TriggerCallbackPayload) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Builds the callback handed to providers: forwards every payload into the
/// bus through the queue service façade under a trusted caller context,
/// since there is no external plugin on this path.
pub fn make_trigger_callback(queue_service: Arc<QueueService>) -> TriggerCallback {
    Arc::new(move |payload| {
        let queue_service = queue_service.clone();
        Box::pin(async move {
            let caller = CallerContext::trusted(TRIGGER_CALLER);
            let new_message = match payload {
                TriggerCallbackPayload::Message(message) => NewMessage {
                    id: Some(message.id),
                    message_type: message.message_type,
                    tenant_id: message.tenant_id,
                    session_key: message.session_key,
                    business_key: message.business_key,
                    trace_id: message.trace_id,
                    parent_message_id: message.parent_message_id,
                    max_attempts: Some(message.max_attempts),
                    payload: message.payload,
                    headers: message.headers,
                },
                TriggerCallbackPayload::Redispatch {
                    state,
                    from,
                    execution_id,
                } => build_redispatch_message(state, from, execution_id),
            };
            if let Err(error) = queue_service.enqueue(&caller, new_message, None).await {
                tracing::warn!(%error, "trigger callback failed to enqueue");
            }
        })
    })
}

fn build_redispatch_message(
    state: serde_json::Value,
    from: String,
    execution_id: Option<String>,
) -> NewMessage {
    let mut payload = HashMap::new();
    payload.insert("state".to_string(), state);
    payload.insert("from".to_string(), serde_json::json!(from));
    if let Some(execution_id) = &execution_id {
        payload.insert(
            handoff_shared::PAYLOAD_EXECUTION_ID.to_string(),
            serde_json::json!(execution_id),
        );
    }
    NewMessage {
        id: None,
        message_type: "system.trigger.v1".to_string(),
        tenant_id: "system".to_string(),
        session_key: from,
        business_key: execution_id.unwrap_or_else(|| "trigger".to_string()),
        trace_id: uuid::Uuid::now_v7().to_string(),
        parent_message_id: None,
        max_attempts: None,
        payload,
        headers: HashMap::new(),
    }
}

/// A trigger source a graph may reference. Implementations are domain
/// collaborators (webhooks, channel listeners, schedules); only the publish
/// contract is specified here.
#[async_trait]
pub trait TriggerProvider: Send + Sync + fmt::Debug {
    async fn stop(&self, config: &serde_json::Value);
    async fn publish(
        &self,
        config: &serde_json::Value,
        callback: TriggerCallback,
    ) -> Result<(), TriggerError>;

    /// Bootstrap replay directive for this provider. Defaults to
    /// `replay_publish`, non-critical.
    fn bootstrap(&self) -> BootstrapDirective {
        BootstrapDirective::default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("trigger provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    ReplayPublish,
    Skip,
}

#[derive(Debug, Clone, Copy)]
pub struct BootstrapDirective {
    pub mode: BootstrapMode,
    pub critical: bool,
}

impl Default for BootstrapDirective {
    fn default() -> Self {
        Self {
            mode: BootstrapMode::ReplayPublish,
            critical: false,
        }
    }
}

/// Lookup table of known providers by name, populated at startup.
#[derive(Debug, Default)]
pub struct TriggerProviderRegistry {
    providers: DashMap<String, Arc<dyn TriggerProvider>>,
}

impl TriggerProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn TriggerProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TriggerProvider>> {
        self.providers.get(name).map(|entry| entry.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    pub provider: String,
    pub ok: bool,
    pub rolled_back: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PublishSummary {
    pub outcomes: Vec<ProviderOutcome>,
}

impl PublishSummary {
    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|outcome| !outcome.ok)
    }
}

/// Diffs `current` against `previous` for one target and drives provider
/// `stop`/`publish` calls, forwarding callback payloads into the bus.
#[derive(Debug)]
pub struct PublishCommand {
    providers: Arc<TriggerProviderRegistry>,
    queue_service: Arc<QueueService>,
}

impl PublishCommand {
    pub fn new(providers: Arc<TriggerProviderRegistry>, queue_service: Arc<QueueService>) -> Self {
        Self {
            providers,
            queue_service,
        }
    }

    pub async fn publish(
        &self,
        previous: Option<&Graph>,
        current: &Graph,
        provider_filter: Option<&[String]>,
        strict: bool,
    ) -> Result<PublishSummary, TriggerError> {
        let empty = Graph {
            xpert_id: current.xpert_id.clone(),
            triggers: vec![],
        };
        let previous_snapshot = snapshot(previous.unwrap_or(&empty), provider_filter);
        let current_snapshot = snapshot(current, provider_filter);
        let delta = diff(&previous_snapshot, &current_snapshot);

        let callback = make_trigger_callback(self.queue_service.clone());
        let mut outcomes = Vec::new();

        for name in delta.removed.iter().chain(delta.changed.iter()) {
            let (_, trigger) = &previous_snapshot[name];
            match self.providers.get(name) {
                Some(provider) => provider.stop(&trigger.config).await,
                None => self.handle_missing_provider(name, strict)?,
            }
        }

        for name in &delta.changed {
            let (_, current_trigger) = &current_snapshot[name];
            let provider = match self.providers.get(name) {
                Some(provider) => provider,
                None => {
                    self.handle_missing_provider(name, strict)?;
                    continue;
                }
            };
            match provider.publish(&current_trigger.config, callback.clone()).await {
                Ok(()) => outcomes.push(ProviderOutcome {
                    provider: name.clone(),
                    ok: true,
                    rolled_back: false,
                }),
                Err(error) => {
                    tracing::warn!(provider = %name, %error, "trigger publish failed, attempting rollback");
                    let (_, previous_trigger) = &previous_snapshot[name];
                    let rolled_back = provider
                        .publish(&previous_trigger.config, callback.clone())
                        .await
                        .is_ok();
                    outcomes.push(ProviderOutcome {
                        provider: name.clone(),
                        ok: false,
                        rolled_back,
                    });
                }
            }
        }

        for name in &delta.added {
            let (_, trigger) = &current_snapshot[name];
            let provider = match self.providers.get(name) {
                Some(provider) => provider,
                None => {
                    self.handle_missing_provider(name, strict)?;
                    continue;
                }
            };
            let ok = provider.publish(&trigger.config, callback.clone()).await.is_ok();
            outcomes.push(ProviderOutcome {
                provider: name.clone(),
                ok,
                rolled_back: false,
            });
        }

        Ok(PublishSummary { outcomes })
    }

    fn handle_missing_provider(&self, name: &str, strict: bool) -> Result<(), TriggerError> {
        if strict {
            Err(TriggerError::Provider(format!("unknown trigger provider: {name}")))
        } else {
            tracing::warn!(provider = %name, "unknown trigger provider, skipping");
            Ok(())
        }
    }
}

/// Paginated source of "published" targets scanned by bootstrap recovery.
#[async_trait]
pub trait PublishedTargetSource: Send + Sync + fmt::Debug {
    /// Returns up to `limit` targets starting at `offset`; an empty result
    /// signals the last page.
    async fn list_page(&self, offset: usize, limit: usize) -> Vec<Graph>;
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapSummary {
    pub scanned: usize,
    pub replayed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Replays trigger publishes after a restart so external sources (webhooks,
/// channel listeners) get re-subscribed, one target at a time under a
/// short-TTL lock so two instances never replay the same target at once.
#[derive(Debug)]
pub struct BootstrapRecovery {
    source: Arc<dyn PublishedTargetSource>,
    providers: Arc<TriggerProviderRegistry>,
    publish_command: Arc<PublishCommand>,
    lock: Arc<dyn DistributedLock>,
}

impl BootstrapRecovery {
    pub fn new(
        source: Arc<dyn PublishedTargetSource>,
        providers: Arc<TriggerProviderRegistry>,
        publish_command: Arc<PublishCommand>,
        lock: Arc<dyn DistributedLock>,
    ) -> Self {
        Self {
            source,
            providers,
            publish_command,
            lock,
        }
    }

    pub async fn run(&self) -> BootstrapSummary {
        let mut summary = BootstrapSummary::default();
        let mut offset = 0;
        loop {
            let page = self.source.list_page(offset, BOOTSTRAP_PAGE_SIZE).await;
            if page.is_empty() {
                break;
            }
            let advanced = page.len();
            for graph in &page {
                self.replay_target(graph, &mut summary).await;
            }
            offset += advanced;
        }
        tracing::info!(
            scanned = summary.scanned,
            replayed = summary.replayed,
            skipped = summary.skipped,
            failed = summary.failed,
            "bootstrap recovery complete"
        );
        summary
    }

    async fn replay_target(&self, graph: &Graph, summary: &mut BootstrapSummary) {
        summary.scanned += 1;

        let mut provider_names: Vec<String> = graph
            .triggers
            .iter()
            .filter(|trigger| trigger.from != "chat")
            .map(|trigger| trigger.provider.clone())
            .collect();
        provider_names.sort();
        provider_names.dedup();

        let mut replay_providers = Vec::new();
        for name in &provider_names {
            match self.providers.get(name) {
                None => {
                    tracing::error!(xpert_id = %graph.xpert_id, provider = %name, "missing trigger provider during bootstrap");
                    summary.failed += 1;
                }
                Some(provider) => match provider.bootstrap().mode {
                    BootstrapMode::Skip => summary.skipped += 1,
                    BootstrapMode::ReplayPublish => replay_providers.push(name.clone()),
                },
            }
        }

        if replay_providers.is_empty() {
            return;
        }

        let lock_key = format!("job:trigger:{}", graph.xpert_id);
        let Some(handle) = self.lock.acquire(&lock_key, BOOTSTRAP_LOCK_TTL).await else {
            tracing::info!(xpert_id = %graph.xpert_id, "trigger bootstrap lock busy, skipped");
            summary.skipped += 1;
            return;
        };

        let result = self
            .publish_command
            .publish(None, graph, Some(&replay_providers), false)
            .await;

        self.lock.release(&lock_key, &handle).await;

        match result {
            Ok(publish_summary) if !publish_summary.has_failures() => summary.replayed += 1,
            Ok(_) => summary.failed += 1,
            Err(error) => {
                tracing::error!(xpert_id = %graph.xpert_id, %error, "trigger bootstrap replay failed");
                summary.failed += 1;
            }
        }
    }
}
