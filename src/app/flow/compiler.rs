use serde_json::Value;
use std::collections::HashMap;

use super::condition::{CompiledCondition, ConditionCompileError};
use super::graph::{EdgeKind, GraphDefinition, NodeIntent, NodeKind};

/// Graph resolved for execution: key-indexed nodes with pre-resolved
/// capabilities and per-source transition lists with compiled conditions.
#[derive(Debug)]
pub struct CompiledPlan {
    pub flow_id: String,
    pub version: u32,
    pub start_node: String,
    pub nodes: HashMap<String, CompiledNode>,
    pub transitions: HashMap<String, Vec<CompiledTransition>>,
}

#[derive(Debug)]
pub struct CompiledNode {
    pub id: String,
    pub kind: NodeKind,
    pub intent: NodeIntent,
    pub capabilities: Vec<String>,
    pub next_on_success: Option<String>,
    pub next_on_error: Option<String>,
    pub config: Value,
}

#[derive(Debug)]
pub struct CompiledTransition {
    pub to: String,
    pub kind: EdgeKind,
    pub condition: Option<CompiledCondition>,
}

#[derive(Debug, thiserror::Error)]
pub enum FlowCompileError {
    #[error("graph has no start node")]
    MissingStart,
    #[error("graph has {0} start nodes, expected exactly one")]
    MultipleStarts(usize),
    #[error("duplicate node id {0}")]
    DuplicateNode(String),
    #[error("edge references unknown node {0}")]
    UnknownNode(String),
    #[error("conditional edge {from} -> {to} has no condition")]
    MissingCondition { from: String, to: String },
    #[error(transparent)]
    Condition(#[from] ConditionCompileError),
}

pub fn compile(definition: &GraphDefinition) -> Result<CompiledPlan, FlowCompileError> {
    let starts: Vec<&str> = definition
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::Start)
        .map(|n| n.id.as_str())
        .collect();
    let start_node = match starts.as_slice() {
        [] => return Err(FlowCompileError::MissingStart),
        [only] => only.to_string(),
        many => return Err(FlowCompileError::MultipleStarts(many.len())),
    };

    let mut nodes = HashMap::new();
    for node in &definition.nodes {
        let capabilities = node
            .config
            .get("capabilities")
            .and_then(|v| v.as_array())
            .map(|caps| {
                caps.iter()
                    .filter_map(|c| c.as_str().map(|s| s.to_string()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| node.kind.default_capabilities());

        let previous = nodes.insert(
            node.id.clone(),
            CompiledNode {
                id: node.id.clone(),
                kind: node.kind,
                intent: node.kind.intent(),
                capabilities,
                next_on_success: None,
                next_on_error: None,
                config: node.config.clone(),
            },
        );
        if previous.is_some() {
            return Err(FlowCompileError::DuplicateNode(node.id.clone()));
        }
    }

    let mut transitions: HashMap<String, Vec<CompiledTransition>> = HashMap::new();
    for edge in &definition.edges {
        if !nodes.contains_key(&edge.from) {
            return Err(FlowCompileError::UnknownNode(edge.from.clone()));
        }
        if !nodes.contains_key(&edge.to) {
            return Err(FlowCompileError::UnknownNode(edge.to.clone()));
        }

        let condition = match edge.kind {
            EdgeKind::Conditional => {
                let condition = edge.condition.as_ref().ok_or_else(|| {
                    FlowCompileError::MissingCondition {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                    }
                })?;
                Some(condition.compile()?)
            }
            _ => None,
        };

        // Pre-resolve the unconditional successors on the node itself.
        let node = nodes.get_mut(&edge.from).expect("checked above");
        match edge.kind {
            EdgeKind::Success if node.next_on_success.is_none() => {
                node.next_on_success = Some(edge.to.clone());
            }
            EdgeKind::Error if node.next_on_error.is_none() => {
                node.next_on_error = Some(edge.to.clone());
            }
            _ => {}
        }

        transitions.entry(edge.from.clone()).or_default().push(CompiledTransition {
            to: edge.to.clone(),
            kind: edge.kind,
            condition,
        });
    }

    Ok(CompiledPlan {
        flow_id: definition.id.clone(),
        version: definition.version,
        start_node,
        nodes,
        transitions,
    })
}

impl CompiledPlan {
    /// First matching transition out of `from`: conditional edges in author
    /// order, then the success edge.
    pub fn next_from(
        &self,
        from: &str,
        context: &super::condition::FlowRuntimeContext<'_>,
    ) -> Option<&str> {
        let transitions = self.transitions.get(from)?;
        for transition in transitions {
            match transition.kind {
                EdgeKind::Conditional => {
                    if transition
                        .condition
                        .as_ref()
                        .map(|c| c.evaluate(context))
                        .unwrap_or(false)
                    {
                        return Some(&transition.to);
                    }
                }
                _ => continue,
            }
        }
        transitions
            .iter()
            .find(|t| t.kind == EdgeKind::Success)
            .map(|t| t.to.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(raw: Value) -> GraphDefinition {
        GraphDefinition::from_value(raw).unwrap()
    }

    #[test]
    fn compiles_nodes_transitions_and_capabilities() {
        let def = definition(json!({
            "id": "login",
            "version": 2,
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "login", "type": "login", "config": {"capabilities": ["password", "webauthn"]}},
                {"id": "mfa", "type": "mfa"},
                {"id": "end", "type": "end"},
            ],
            "edges": [
                {"from": "start", "to": "login", "type": "success"},
                {"from": "login", "to": "mfa", "type": "success"},
                {"from": "mfa", "to": "end", "type": "success"},
            ],
        }));

        let plan = compile(&def).unwrap();
        assert_eq!(plan.start_node, "start");
        assert_eq!(
            plan.nodes["login"].capabilities,
            vec!["password".to_string(), "webauthn".to_string()]
        );
        assert_eq!(plan.nodes["mfa"].capabilities, vec!["totp".to_string()]);
        assert_eq!(plan.nodes["login"].next_on_success.as_deref(), Some("mfa"));
    }

    #[test]
    fn conditional_edges_win_over_success() {
        let def = definition(json!({
            "id": "branch",
            "version": 2,
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "decide", "type": "decision"},
                {"id": "high", "type": "end"},
                {"id": "low", "type": "end"},
            ],
            "edges": [
                {"from": "start", "to": "decide", "type": "success"},
                {"from": "decide", "to": "high", "type": "conditional",
                 "condition": {"key": "collected.score", "op": "gt", "value": 50}},
                {"from": "decide", "to": "low", "type": "success"},
            ],
        }));
        let plan = compile(&def).unwrap();

        let collected = json!({"score": 80});
        let context = super::super::condition::FlowRuntimeContext {
            collected: &collected,
            claims: &Value::Null,
            oauth: &Value::Null,
            flow: &Value::Null,
        };
        assert_eq!(plan.next_from("decide", &context), Some("high"));

        let collected = json!({"score": 10});
        let context = super::super::condition::FlowRuntimeContext {
            collected: &collected,
            claims: &Value::Null,
            oauth: &Value::Null,
            flow: &Value::Null,
        };
        assert_eq!(plan.next_from("decide", &context), Some("low"));
    }

    #[test]
    fn rejects_malformed_graphs() {
        let no_start = definition(json!({
            "id": "bad", "version": 2,
            "nodes": [{"id": "end", "type": "end"}],
            "edges": [],
        }));
        assert!(matches!(compile(&no_start), Err(FlowCompileError::MissingStart)));

        let dangling = definition(json!({
            "id": "bad", "version": 2,
            "nodes": [{"id": "start", "type": "start"}],
            "edges": [{"from": "start", "to": "ghost", "type": "success"}],
        }));
        assert!(matches!(compile(&dangling), Err(FlowCompileError::UnknownNode(_))));

        let bare_conditional = definition(json!({
            "id": "bad", "version": 2,
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "end", "type": "end"},
            ],
            "edges": [{"from": "start", "to": "end", "type": "conditional"}],
        }));
        assert!(matches!(
            compile(&bare_conditional),
            Err(FlowCompileError::MissingCondition { .. })
        ));
    }
}
