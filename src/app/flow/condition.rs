use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Edge condition as authored: a path expression over the runtime context
/// with the documented operator set, grouped by and/or/not. No dynamic
/// evaluation of untrusted expressions, ever; this is the whole language.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    And { and: Vec<Condition> },
    Or { or: Vec<Condition> },
    Not { not: Box<Condition> },
    Compare {
        key: String,
        op: Operator,
        #[serde(default)]
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Co,
    Sw,
    Ew,
    Gt,
    Lt,
    Ge,
    Le,
    In,
    NotIn,
    Exists,
    Matches,
    IsTrue,
    IsFalse,
}

/// Compiled evaluator: the same tree with `matches` patterns pre-compiled, so
/// evaluation is allocation-free and cannot fail.
#[derive(Debug, Clone)]
pub enum CompiledCondition {
    And(Vec<CompiledCondition>),
    Or(Vec<CompiledCondition>),
    Not(Box<CompiledCondition>),
    Compare {
        key: String,
        op: Operator,
        value: Value,
        pattern: Option<Regex>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConditionCompileError {
    #[error("invalid regex in matches condition on {key}: {source}")]
    BadPattern {
        key: String,
        #[source]
        source: regex::Error,
    },
}

impl Condition {
    pub fn compile(&self) -> Result<CompiledCondition, ConditionCompileError> {
        match self {
            Condition::And { and } => Ok(CompiledCondition::And(
                and.iter().map(|c| c.compile()).collect::<Result<_, _>>()?,
            )),
            Condition::Or { or } => Ok(CompiledCondition::Or(
                or.iter().map(|c| c.compile()).collect::<Result<_, _>>()?,
            )),
            Condition::Not { not } => Ok(CompiledCondition::Not(Box::new(not.compile()?))),
            Condition::Compare { key, op, value } => {
                let pattern = if *op == Operator::Matches {
                    let raw = value.as_str().unwrap_or_default();
                    Some(Regex::new(raw).map_err(|source| ConditionCompileError::BadPattern {
                        key: key.clone(),
                        source,
                    })?)
                } else {
                    None
                };
                Ok(CompiledCondition::Compare {
                    key: key.clone(),
                    op: *op,
                    value: value.clone(),
                    pattern,
                })
            }
        }
    }
}

/// Read-only view the evaluator resolves key paths against. Unknown prefixes
/// and missing members resolve to absent, which fails `exists` and every
/// comparison.
pub struct FlowRuntimeContext<'a> {
    pub collected: &'a Value,
    pub claims: &'a Value,
    pub oauth: &'a Value,
    pub flow: &'a Value,
}

impl<'a> FlowRuntimeContext<'a> {
    pub fn resolve(&self, key: &str) -> Option<&'a Value> {
        let (root, path) = key.split_once('.')?;
        let base = match root {
            "collected" => self.collected,
            "claims" => self.claims,
            "oauth" => self.oauth,
            "flow" => self.flow,
            _ => return None,
        };
        path.split('.').try_fold(base, |value, segment| value.get(segment))
    }
}

impl CompiledCondition {
    pub fn evaluate(&self, context: &FlowRuntimeContext<'_>) -> bool {
        match self {
            CompiledCondition::And(all) => all.iter().all(|c| c.evaluate(context)),
            CompiledCondition::Or(any) => any.iter().any(|c| c.evaluate(context)),
            CompiledCondition::Not(inner) => !inner.evaluate(context),
            CompiledCondition::Compare {
                key,
                op,
                value,
                pattern,
            } => {
                let resolved = context.resolve(key);
                match op {
                    Operator::Exists => resolved.is_some(),
                    Operator::IsTrue => resolved.and_then(|v| v.as_bool()) == Some(true),
                    Operator::IsFalse => resolved.and_then(|v| v.as_bool()) == Some(false),
                    _ => match resolved {
                        Some(actual) => compare(*op, actual, value, pattern.as_ref()),
                        None => false,
                    },
                }
            }
        }
    }
}

fn compare(op: Operator, actual: &Value, expected: &Value, pattern: Option<&Regex>) -> bool {
    match op {
        Operator::Eq => values_equal(actual, expected),
        Operator::Ne => !values_equal(actual, expected),
        Operator::Co => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
            _ => false,
        },
        Operator::Sw => match (actual.as_str(), expected.as_str()) {
            (Some(s), Some(prefix)) => s.starts_with(prefix),
            _ => false,
        },
        Operator::Ew => match (actual.as_str(), expected.as_str()) {
            (Some(s), Some(suffix)) => s.ends_with(suffix),
            _ => false,
        },
        Operator::Gt | Operator::Lt | Operator::Ge | Operator::Le => {
            match (as_number(actual), as_number(expected)) {
                (Some(a), Some(b)) => match op {
                    Operator::Gt => a > b,
                    Operator::Lt => a < b,
                    Operator::Ge => a >= b,
                    Operator::Le => a <= b,
                    _ => unreachable!(),
                },
                _ => match (actual.as_str(), expected.as_str()) {
                    (Some(a), Some(b)) => match op {
                        Operator::Gt => a > b,
                        Operator::Lt => a < b,
                        Operator::Ge => a >= b,
                        Operator::Le => a <= b,
                        _ => unreachable!(),
                    },
                    _ => false,
                },
            }
        }
        Operator::In => expected
            .as_array()
            .map(|set| set.iter().any(|member| values_equal(actual, member)))
            .unwrap_or(false),
        Operator::NotIn => expected
            .as_array()
            .map(|set| !set.iter().any(|member| values_equal(actual, member)))
            .unwrap_or(false),
        Operator::Matches => match (actual.as_str(), pattern) {
            (Some(s), Some(regex)) => regex.is_match(s),
            _ => false,
        },
        Operator::Exists | Operator::IsTrue | Operator::IsFalse => unreachable!("handled above"),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}
