use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::actor::{ActorState, ShardRouter, ShardedStore};
use crate::app::error::OAuthError;

use super::compiler::{compile, CompiledPlan};
use super::condition::FlowRuntimeContext;
use super::graph::{GraphDefinition, NodeIntent, NodeKind};

const MAX_STEPS_PER_SUBMIT: usize = 100;
const REQUEST_SNAPSHOT_CAP: usize = 100;

/// Terminal shape of every flow interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResponse {
    /// Suspended at an interactive node (UI contract emission) or finished
    /// (`completed: true` at an `end` node).
    Continue {
        node_id: String,
        capabilities: Vec<String>,
        #[serde(default)]
        completed: bool,
        #[serde(default)]
        prompt: Value,
    },
    Redirect {
        target: String,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Bounded request-id to response snapshots; the idempotency window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestSnapshots {
    order: VecDeque<String>,
    results: HashMap<String, FlowResponse>,
}

impl RequestSnapshots {
    pub fn get(&self, request_id: &str) -> Option<&FlowResponse> {
        self.results.get(request_id)
    }

    pub fn insert(&mut self, request_id: String, response: FlowResponse) {
        if self.results.contains_key(&request_id) {
            return;
        }
        if self.order.len() >= REQUEST_SNAPSHOT_CAP {
            if let Some(evicted) = self.order.pop_front() {
                self.results.remove(&evicted);
            }
        }
        self.order.push_back(request_id.clone());
        self.results.insert(request_id, response);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Durable per-session execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub session_id: String,
    pub flow_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub current_node_id: String,
    pub visited_node_ids: Vec<String>,
    pub collected_data: Value,
    pub completed_capabilities: Vec<String>,
    pub user_id: Option<String>,
    pub claims: Value,
    pub oauth_params: Value,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub processed_request_ids: RequestSnapshots,
}

struct FlowEntry {
    state: RuntimeState,
    plan: Arc<CompiledPlan>,
}

#[derive(Default)]
pub struct FlowSessionState {
    entries: HashMap<String, FlowEntry>,
}

#[derive(Clone)]
pub enum FlowOp {
    Start {
        session_id: String,
        plan: Arc<CompiledPlan>,
        tenant_id: String,
        client_id: String,
        oauth_params: Value,
        claims: Value,
        ttl_seconds: i64,
    },
    Submit {
        session_id: String,
        request_id: String,
        capability_id: String,
        response: Value,
    },
    Get {
        session_id: String,
    },
}

pub enum FlowReply {
    Response {
        response: FlowResponse,
        effects: Vec<Value>,
    },
    State(Box<RuntimeState>),
    NotFound,
    Expired,
}

impl ActorState for FlowSessionState {
    type Op = FlowOp;
    type Reply = FlowReply;

    fn apply(&mut self, op: FlowOp, now: DateTime<Utc>) -> FlowReply {
        match op {
            FlowOp::Start {
                session_id,
                plan,
                tenant_id,
                client_id,
                oauth_params,
                claims,
                ttl_seconds,
            } => {
                let mut state = RuntimeState {
                    session_id: session_id.clone(),
                    flow_id: plan.flow_id.clone(),
                    tenant_id,
                    client_id,
                    current_node_id: plan.start_node.clone(),
                    visited_node_ids: Vec::new(),
                    collected_data: json!({}),
                    completed_capabilities: Vec::new(),
                    user_id: None,
                    claims,
                    oauth_params,
                    started_at: now,
                    expires_at: now + Duration::seconds(ttl_seconds),
                    last_activity_at: now,
                    processed_request_ids: RequestSnapshots::default(),
                };
                let (response, effects) = advance_inner(&mut state, None, &plan);
                state.last_activity_at = now;
                self.entries.insert(session_id, FlowEntry { state, plan });
                FlowReply::Response { response, effects }
            }
            FlowOp::Submit {
                session_id,
                request_id,
                capability_id,
                response,
            } => {
                let entry = match self.entries.get_mut(&session_id) {
                    Some(entry) => entry,
                    None => return FlowReply::NotFound,
                };
                if now >= entry.state.expires_at {
                    return FlowReply::Expired;
                }

                // Idempotent replay: a known request id returns its snapshot
                // without re-executing anything.
                if let Some(snapshot) = entry.state.processed_request_ids.get(&request_id) {
                    return FlowReply::Response {
                        response: snapshot.clone(),
                        effects: Vec::new(),
                    };
                }

                let (outcome, effects) =
                    advance_inner(&mut entry.state, Some((capability_id, response)), &entry.plan);
                entry.state.last_activity_at = now;
                entry
                    .state
                    .processed_request_ids
                    .insert(request_id, outcome.clone());
                FlowReply::Response {
                    response: outcome,
                    effects,
                }
            }
            FlowOp::Get { session_id } => match self.entries.get(&session_id) {
                Some(entry) if now < entry.state.expires_at => {
                    FlowReply::State(Box::new(entry.state.clone()))
                }
                _ => FlowReply::NotFound,
            },
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.state.expires_at);
        before - self.entries.len()
    }
}

fn advance_inner(
    state: &mut RuntimeState,
    mut input: Option<(String, Value)>,
    plan: &CompiledPlan,
) -> (FlowResponse, Vec<Value>) {
    let mut effects = Vec::new();

    for _ in 0..MAX_STEPS_PER_SUBMIT {
        let node = match plan.nodes.get(&state.current_node_id) {
            Some(node) => node,
            None => {
                return (
                    FlowResponse::Error {
                        code: "invalid_node".to_string(),
                        message: format!("node {} not in plan", state.current_node_id),
                    },
                    effects,
                )
            }
        };

        match node.intent {
            NodeIntent::Interactive => match input.take() {
                Some((capability_id, response)) => {
                    if !node.capabilities.contains(&capability_id) {
                        // Wrong capability: stay put, re-submittable.
                        return (
                            FlowResponse::Error {
                                code: "invalid_capability".to_string(),
                                message: format!(
                                    "capability {} not offered by node {}",
                                    capability_id, node.id
                                ),
                            },
                            effects,
                        );
                    }

                    if response.get("error").is_some() {
                        match &node.next_on_error {
                            Some(next) => {
                                let next = next.clone();
                                state.visited_node_ids.push(state.current_node_id.clone());
                                state.current_node_id = next;
                                continue;
                            }
                            None => {
                                return (
                                    FlowResponse::Error {
                                        code: "step_failed".to_string(),
                                        message: format!("node {} reported an error", node.id),
                                    },
                                    effects,
                                )
                            }
                        }
                    }

                    if let Value::Object(fields) = &response {
                        if let Value::Object(collected) = &mut state.collected_data {
                            for (key, value) in fields {
                                collected.insert(key.clone(), value.clone());
                            }
                        }
                    }
                    if let Some(user_id) = response.get("user_id").and_then(|v| v.as_str()) {
                        state.user_id = Some(user_id.to_string());
                    }
                    state.completed_capabilities.push(capability_id);
                }
                None => {
                    // Suspension point: hand the UI contract back.
                    return (
                        FlowResponse::Continue {
                            node_id: node.id.clone(),
                            capabilities: node.capabilities.clone(),
                            completed: false,
                            prompt: node.config.get("prompt").cloned().unwrap_or(Value::Null),
                        },
                        effects,
                    );
                }
            },
            NodeIntent::Terminal => {
                return (
                    match node.kind {
                        NodeKind::End => FlowResponse::Continue {
                            node_id: node.id.clone(),
                            capabilities: Vec::new(),
                            completed: true,
                            prompt: Value::Null,
                        },
                        NodeKind::Redirect => FlowResponse::Redirect {
                            target: node
                                .config
                                .get("target")
                                .and_then(|v| v.as_str())
                                .unwrap_or("/")
                                .to_string(),
                        },
                        _ => FlowResponse::Error {
                            code: node
                                .config
                                .get("code")
                                .and_then(|v| v.as_str())
                                .unwrap_or("flow_error")
                                .to_string(),
                            message: node
                                .config
                                .get("message")
                                .and_then(|v| v.as_str())
                                .unwrap_or("flow ended in error")
                                .to_string(),
                        },
                    },
                    effects,
                );
            }
            NodeIntent::Action => {
                state.completed_capabilities.push(format!("{:?}", node.kind).to_lowercase());
            }
            NodeIntent::SideEffect => {
                if node.kind == NodeKind::Log {
                    tracing::info!(
                        flow_id = %state.flow_id,
                        session_id = %state.session_id,
                        node = %node.id,
                        "flow log node"
                    );
                } else {
                    effects.push(json!({
                        "kind": node.kind,
                        "node_id": node.id,
                        "config": node.config,
                    }));
                }
            }
            NodeIntent::Control | NodeIntent::Check | NodeIntent::Decision => {}
        }

        // Transition selection over the runtime context.
        let flow_view = json!({
            "currentNode": state.current_node_id,
            "visitedCount": state.visited_node_ids.len(),
            "userId": state.user_id,
        });
        let context = FlowRuntimeContext {
            collected: &state.collected_data,
            claims: &state.claims,
            oauth: &state.oauth_params,
            flow: &flow_view,
        };

        let next = match node.kind {
            NodeKind::Goto => node
                .config
                .get("target")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            _ => plan.next_from(&node.id, &context).map(|s| s.to_string()),
        };

        match next {
            Some(next) => {
                state.visited_node_ids.push(state.current_node_id.clone());
                state.current_node_id = next;
            }
            None => {
                return (
                    FlowResponse::Error {
                        code: "dead_end".to_string(),
                        message: format!("no transition out of node {}", node.id),
                    },
                    effects,
                )
            }
        }
    }

    (
        FlowResponse::Error {
            code: "step_limit".to_string(),
            message: "flow exceeded the per-submission step budget".to_string(),
        },
        effects,
    )
}

/// The flow engine: compiled plans plus durable per-session state in sharded
/// actors, with idempotent step submission.
#[derive(Clone)]
pub struct FlowEngine {
    plans: Arc<RwLock<HashMap<String, Arc<CompiledPlan>>>>,
    sessions: ShardedStore<FlowSessionState>,
    http: reqwest::Client,
    tenant: String,
    session_ttl: i64,
}

impl FlowEngine {
    pub fn new(router: ShardRouter, tenant: &str, session_ttl: i64) -> Self {
        Self {
            plans: Arc::new(RwLock::new(HashMap::new())),
            sessions: ShardedStore::spawn_with(router, std::time::Duration::from_secs(60), |_| {
                FlowSessionState::default()
            }),
            http: reqwest::Client::new(),
            tenant: tenant.to_string(),
            session_ttl,
        }
    }

    pub async fn register(&self, definition: GraphDefinition) -> Result<(), OAuthError> {
        let plan = compile(&definition)
            .map_err(|e| OAuthError::InvalidRequest(format!("flow graph rejected: {}", e)))?;
        let mut plans = self.plans.write().await;
        tracing::info!(flow_id = %definition.id, version = definition.version, "flow registered");
        plans.insert(definition.id.clone(), Arc::new(plan));
        Ok(())
    }

    pub async fn register_raw(&self, raw: Value) -> Result<(), OAuthError> {
        let definition = GraphDefinition::from_value(raw)
            .map_err(|e| OAuthError::InvalidRequest(format!("flow graph rejected: {}", e)))?;
        self.register(definition).await
    }

    pub async fn start(
        &self,
        flow_id: &str,
        session_id: &str,
        client_id: &str,
        oauth_params: Value,
        claims: Value,
    ) -> Result<FlowResponse, OAuthError> {
        let plan = {
            let plans = self.plans.read().await;
            plans
                .get(flow_id)
                .cloned()
                .ok_or_else(|| OAuthError::InvalidRequest(format!("unknown flow {}", flow_id)))?
        };

        let reply = self
            .sessions
            .handle_for(&self.tenant, session_id)
            .call(FlowOp::Start {
                session_id: session_id.to_string(),
                plan,
                tenant_id: self.tenant.clone(),
                client_id: client_id.to_string(),
                oauth_params,
                claims,
                ttl_seconds: self.session_ttl,
            })
            .await?;
        self.unwrap_response(reply)
    }

    /// Idempotent step submission: a repeated `(session_id, request_id)`
    /// returns the snapshot of the first execution.
    pub async fn submit(
        &self,
        session_id: &str,
        request_id: &str,
        capability_id: &str,
        response: Value,
    ) -> Result<FlowResponse, OAuthError> {
        let reply = self
            .sessions
            .handle_for(&self.tenant, session_id)
            .call(FlowOp::Submit {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
                capability_id: capability_id.to_string(),
                response,
            })
            .await?;
        self.unwrap_response(reply)
    }

    pub async fn state_of(&self, session_id: &str) -> Result<Option<RuntimeState>, OAuthError> {
        let reply = self
            .sessions
            .handle_for(&self.tenant, session_id)
            .call(FlowOp::Get {
                session_id: session_id.to_string(),
            })
            .await?;
        match reply {
            FlowReply::State(state) => Ok(Some(*state)),
            _ => Ok(None),
        }
    }

    fn unwrap_response(&self, reply: FlowReply) -> Result<FlowResponse, OAuthError> {
        match reply {
            FlowReply::Response { response, effects } => {
                self.dispatch_effects(effects);
                Ok(response)
            }
            FlowReply::NotFound => Err(OAuthError::InvalidRequest(
                "unknown flow session".to_string(),
            )),
            FlowReply::Expired => Err(OAuthError::InvalidRequest(
                "flow session expired".to_string(),
            )),
            FlowReply::State(_) => Err(OAuthError::ServerError(anyhow::anyhow!(
                "unexpected flow reply"
            ))),
        }
    }

    /// Side-effect nodes collected during the walk run after the state is
    /// persisted; delivery is best-effort.
    fn dispatch_effects(&self, effects: Vec<Value>) {
        for effect in effects {
            let kind = effect["kind"].as_str().unwrap_or_default().to_string();
            match kind.as_str() {
                "webhook" => {
                    if let Some(url) = effect["config"]["url"].as_str() {
                        let http = self.http.clone();
                        let url = url.to_string();
                        let body = effect["config"]["body"].clone();
                        tokio::spawn(async move {
                            let result = http
                                .post(&url)
                                .json(&body)
                                .timeout(std::time::Duration::from_secs(5))
                                .send()
                                .await;
                            if let Err(err) = result {
                                tracing::warn!(url = %url, error = %err, "flow webhook delivery failed");
                            }
                        });
                    }
                }
                _ => {
                    tracing::debug!(kind = %kind, "flow side effect emitted");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_graph() -> Value {
        json!({
            "id": "login",
            "version": 2,
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "check", "type": "check_session"},
                {"id": "login", "type": "login"},
                {"id": "mfa_gate", "type": "decision"},
                {"id": "mfa", "type": "mfa"},
                {"id": "issue", "type": "issue_tokens"},
                {"id": "done", "type": "end"},
                {"id": "fail", "type": "error", "config": {"code": "login_failed"}},
            ],
            "edges": [
                {"from": "start", "to": "check", "type": "success"},
                {"from": "check", "to": "login", "type": "success"},
                {"from": "login", "to": "mfa_gate", "type": "success"},
                {"from": "login", "to": "fail", "type": "error"},
                {"from": "mfa_gate", "to": "mfa", "type": "conditional",
                 "condition": {"key": "collected.requires_mfa", "op": "isTrue"}},
                {"from": "mfa_gate", "to": "issue", "type": "success"},
                {"from": "mfa", "to": "issue", "type": "success"},
                {"from": "issue", "to": "done", "type": "success"},
            ],
        })
    }

    async fn engine_with_login() -> FlowEngine {
        let engine = FlowEngine::new(ShardRouter::new(1, "auto", 2), "default", 600);
        engine.register_raw(login_graph()).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn walks_to_first_suspension_on_start() {
        let engine = engine_with_login().await;
        let response = engine
            .start("login", "sess-1", "c1", json!({}), json!({}))
            .await
            .unwrap();
        match response {
            FlowResponse::Continue {
                node_id,
                capabilities,
                completed,
                ..
            } => {
                assert_eq!(node_id, "login");
                assert_eq!(capabilities, vec!["password".to_string()]);
                assert!(!completed);
            }
            other => panic!("expected suspension, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn conditional_branch_routes_through_mfa() {
        let engine = engine_with_login().await;
        engine
            .start("login", "sess-1", "c1", json!({}), json!({}))
            .await
            .unwrap();

        let response = engine
            .submit(
                "sess-1",
                "req-1",
                "password",
                json!({"user_id": "u1", "requires_mfa": true}),
            )
            .await
            .unwrap();
        match response {
            FlowResponse::Continue { node_id, .. } => assert_eq!(node_id, "mfa"),
            other => panic!("expected mfa suspension, got {:?}", other),
        }

        let response = engine
            .submit("sess-1", "req-2", "totp", json!({"otp_verified": true}))
            .await
            .unwrap();
        match response {
            FlowResponse::Continue { completed, node_id, .. } => {
                assert!(completed);
                assert_eq!(node_id, "done");
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn skips_mfa_when_condition_is_false() {
        let engine = engine_with_login().await;
        engine
            .start("login", "sess-1", "c1", json!({}), json!({}))
            .await
            .unwrap();

        let response = engine
            .submit(
                "sess-1",
                "req-1",
                "password",
                json!({"user_id": "u1", "requires_mfa": false}),
            )
            .await
            .unwrap();
        match response {
            FlowResponse::Continue { completed, .. } => assert!(completed),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn submit_is_idempotent_per_request_id() {
        let engine = engine_with_login().await;
        engine
            .start("login", "sess-1", "c1", json!({}), json!({}))
            .await
            .unwrap();

        let first = engine
            .submit(
                "sess-1",
                "req-1",
                "password",
                json!({"user_id": "u1", "requires_mfa": true}),
            )
            .await
            .unwrap();
        let replay = engine
            .submit(
                "sess-1",
                "req-1",
                "password",
                json!({"user_id": "u1", "requires_mfa": true}),
            )
            .await
            .unwrap();
        assert_eq!(first, replay);

        // The state advanced exactly once: the replay did not double-record
        // the capability.
        let state = engine.state_of("sess-1").await.unwrap().unwrap();
        let password_completions = state
            .completed_capabilities
            .iter()
            .filter(|c| c.as_str() == "password")
            .count();
        assert_eq!(password_completions, 1);
        assert_eq!(state.current_node_id, "mfa");
    }

    #[tokio::test]
    async fn error_input_follows_error_edge() {
        let engine = engine_with_login().await;
        engine
            .start("login", "sess-1", "c1", json!({}), json!({}))
            .await
            .unwrap();

        let response = engine
            .submit("sess-1", "req-1", "password", json!({"error": "bad_password"}))
            .await
            .unwrap();
        match response {
            FlowResponse::Error { code, .. } => assert_eq!(code, "login_failed"),
            other => panic!("expected error terminal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_capability_leaves_state_resubmittable() {
        let engine = engine_with_login().await;
        engine
            .start("login", "sess-1", "c1", json!({}), json!({}))
            .await
            .unwrap();

        let response = engine
            .submit("sess-1", "req-1", "totp", json!({"otp": "123456"}))
            .await
            .unwrap();
        assert!(matches!(
            response,
            FlowResponse::Error { ref code, .. } if code == "invalid_capability"
        ));

        // A fresh request with the right capability still succeeds.
        let response = engine
            .submit(
                "sess-1",
                "req-2",
                "password",
                json!({"user_id": "u1", "requires_mfa": false}),
            )
            .await
            .unwrap();
        assert!(matches!(response, FlowResponse::Continue { completed: true, .. }));
    }

    #[tokio::test]
    async fn snapshot_window_is_bounded() {
        let mut snapshots = RequestSnapshots::default();
        for i in 0..150 {
            snapshots.insert(
                format!("req-{i}"),
                FlowResponse::Error {
                    code: "x".to_string(),
                    message: String::new(),
                },
            );
        }
        assert_eq!(snapshots.len(), REQUEST_SNAPSHOT_CAP);
        assert!(snapshots.get("req-0").is_none());
        assert!(snapshots.get("req-149").is_some());
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let engine = engine_with_login().await;
        let err = engine
            .submit("ghost", "req-1", "password", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }
}
