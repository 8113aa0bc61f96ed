use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::condition::Condition;

pub const LATEST_GRAPH_VERSION: u32 = 2;

/// Authored flow graph, as produced by the flow editor. This is the input
/// form; execution always goes through the compiled plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<NodeDefinition>,
    pub edges: Vec<EdgeDefinition>,
}

fn default_version() -> u32 {
    LATEST_GRAPH_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    // Control
    Start,
    End,
    Goto,
    // Checks
    CheckSession,
    CheckAuthLevel,
    CheckRisk,
    // Selection (interactive)
    AuthMethodSelect,
    Identifier,
    CustomForm,
    // Actions
    Login,
    Mfa,
    Register,
    Consent,
    IssueTokens,
    RefreshSession,
    RevokeSession,
    BindDevice,
    LinkAccount,
    // Side effects
    Redirect,
    Webhook,
    EventEmit,
    EmailSend,
    SmsSend,
    PushNotify,
    // Decisions
    Decision,
    Switch,
    PolicyCheck,
    // Diagnostics
    Error,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeIntent {
    Control,
    Check,
    Interactive,
    Action,
    SideEffect,
    Decision,
    Terminal,
}

impl NodeKind {
    pub fn intent(&self) -> NodeIntent {
        use NodeKind::*;
        match self {
            Start | Goto => NodeIntent::Control,
            End | Redirect | Error => NodeIntent::Terminal,
            CheckSession | CheckAuthLevel | CheckRisk => NodeIntent::Check,
            AuthMethodSelect | Identifier | CustomForm | Login | Mfa | Register | Consent => {
                NodeIntent::Interactive
            }
            IssueTokens | RefreshSession | RevokeSession | BindDevice | LinkAccount => {
                NodeIntent::Action
            }
            Webhook | EventEmit | EmailSend | SmsSend | PushNotify | Log => NodeIntent::SideEffect,
            Decision | Switch | PolicyCheck => NodeIntent::Decision,
        }
    }

    /// Interactive nodes suspend execution and emit a UI contract.
    pub fn is_interactive(&self) -> bool {
        self.intent() == NodeIntent::Interactive
    }

    pub fn is_terminal(&self) -> bool {
        self.intent() == NodeIntent::Terminal
    }

    /// Capabilities offered when the node's config does not override them.
    pub fn default_capabilities(&self) -> Vec<String> {
        use NodeKind::*;
        match self {
            AuthMethodSelect => vec!["auth_method_select".to_string()],
            Identifier => vec!["identifier".to_string()],
            CustomForm => vec!["custom_form".to_string()],
            Login => vec!["password".to_string()],
            Mfa => vec!["totp".to_string()],
            Register => vec!["register".to_string()],
            Consent => vec!["consent".to_string()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Success,
    Error,
    Conditional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl GraphDefinition {
    /// Parse a raw editor document, applying version migrations before the
    /// typed parse so retired node types never reach the enum.
    pub fn from_value(mut raw: Value) -> anyhow::Result<Self> {
        let version = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
        if version < LATEST_GRAPH_VERSION {
            migrate_raw(&mut raw, version);
        }
        let definition: GraphDefinition = serde_json::from_value(raw)?;
        Ok(definition)
    }
}

/// Ordered migrations `fromVersion` to `toVersion`. Version 1 graphs carried the
/// retired `auth_method` and `user_input` node types; version 2 replaces them
/// with `auth_method_select` and `custom_form`.
fn migrate_raw(raw: &mut Value, from_version: u32) {
    let mut version = from_version;
    while version < LATEST_GRAPH_VERSION {
        match version {
            1 => {
                if let Some(nodes) = raw.get_mut("nodes").and_then(|n| n.as_array_mut()) {
                    for node in nodes {
                        let kind = node.get("type").and_then(|t| t.as_str()).map(|s| s.to_string());
                        match kind.as_deref() {
                            Some("auth_method") => {
                                node["type"] = Value::String("auth_method_select".to_string());
                            }
                            Some("user_input") => {
                                node["type"] = Value::String("custom_form".to_string());
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => break,
        }
        version += 1;
    }
    raw["version"] = Value::from(LATEST_GRAPH_VERSION);
}
