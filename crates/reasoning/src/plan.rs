//! Plan and step model, plus recipe → plan conversion.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use sentra_memory::{Recipe, Value};

use crate::strategy::StrategyKind;
use crate::{ReasonError, ReasonResult};

/// Requested execution mode of a tool step.  The permission gate may still
/// force simulation regardless of what the plan asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    Real,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyOnFail {
    Abort,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Step {
    Reason {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy_hint: Option<String>,
    },
    Tool {
        tool_name: String,
        #[serde(default)]
        args: HashMap<String, String>,
        mode: StepMode,
    },
    Retrieve {
        query: String,
        k: usize,
    },
    Verify {
        predicate: String,
        on_fail: VerifyOnFail,
    },
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Reason { .. } => "reason",
            Step::Tool { .. } => "tool",
            Step::Retrieve { .. } => "retrieve",
            Step::Verify { .. } => "verify",
        }
    }

    /// Compact rendering used for fitness scoring and logs.
    pub fn render(&self) -> String {
        match self {
            Step::Reason { prompt, .. } => format!("reason: {prompt}"),
            Step::Tool { tool_name, .. } => format!("tool: {tool_name}"),
            Step::Retrieve { query, k } => format!("retrieve[{k}]: {query}"),
            Step::Verify { predicate, .. } => format!("verify: {predicate}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub strategy: StrategyKind,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn render(&self) -> String {
        self.steps
            .iter()
            .map(Step::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Result of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    pub kind: String,
    pub output: String,
    pub success: bool,
    pub simulated: bool,
}

/// Result of a full plan run.  `truncated` marks a step-cap or deadline
/// cutoff; an unguarded tool/verify failure surfaces as an error instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResult {
    pub outcomes: Vec<StepOutcome>,
    pub truncated: bool,
}

impl PlanResult {
    /// Output of the last successful step — the plan's answer text.
    pub fn final_output(&self) -> Option<&str> {
        self.outcomes
            .iter()
            .rev()
            .find(|o| o.success)
            .map(|o| o.output.as_str())
    }
}

/// Convert a stored procedural recipe into an executable plan.
///
/// Recipes are data; this is the only interpretation point, and tool ops
/// still face the permission gate at execution time.  `{{param}}`
/// placeholders in string arguments are substituted from `args`.
pub fn plan_from_recipe(recipe: &Recipe, args: &HashMap<String, String>) -> ReasonResult<Plan> {
    recipe
        .validate()
        .map_err(|e| ReasonError::InvalidPlan(e.to_string()))?;

    for param in &recipe.params {
        if !args.contains_key(param) {
            return Err(ReasonError::InvalidPlan(format!("missing recipe param '{param}'")));
        }
    }

    let substitute = |text: &str| -> String {
        let mut out = text.to_string();
        for (key, value) in args {
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        out
    };
    let str_arg = |op_args: &std::collections::BTreeMap<String, Value>, key: &str| {
        op_args.get(key).and_then(Value::as_str).map(substitute)
    };

    let mut steps = Vec::with_capacity(recipe.body.len());
    for op in &recipe.body {
        let step = match op.op.as_str() {
            "reason" => Step::Reason {
                prompt: str_arg(&op.args, "prompt")
                    .ok_or_else(|| ReasonError::InvalidPlan("reason op needs 'prompt'".into()))?,
                strategy_hint: str_arg(&op.args, "hint"),
            },
            "tool" => {
                let tool_name = str_arg(&op.args, "name")
                    .ok_or_else(|| ReasonError::InvalidPlan("tool op needs 'name'".into()))?;
                let mode = match str_arg(&op.args, "mode").as_deref() {
                    Some("real") => StepMode::Real,
                    _ => StepMode::Simulated,
                };
                let mut tool_args = HashMap::new();
                for (key, value) in &op.args {
                    if key == "name" || key == "mode" {
                        continue;
                    }
                    if let Some(text) = value.as_str() {
                        tool_args.insert(key.clone(), substitute(text));
                    }
                }
                Step::Tool {
                    tool_name,
                    args: tool_args,
                    mode,
                }
            }
            "retrieve" => Step::Retrieve {
                query: str_arg(&op.args, "query")
                    .ok_or_else(|| ReasonError::InvalidPlan("retrieve op needs 'query'".into()))?,
                k: op
                    .args
                    .get("k")
                    .and_then(Value::as_num)
                    .map(|n| n as usize)
                    .unwrap_or(4),
            },
            "verify" => Step::Verify {
                predicate: str_arg(&op.args, "predicate").unwrap_or_else(|| "nonempty".to_string()),
                on_fail: match str_arg(&op.args, "on_fail").as_deref() {
                    Some("continue") => VerifyOnFail::Continue,
                    _ => VerifyOnFail::Abort,
                },
            },
            other => return Err(ReasonError::InvalidPlan(format!("unknown op '{other}'"))),
        };
        steps.push(step);
    }

    Ok(Plan {
        strategy: StrategyKind::ZeroShot,
        steps,
    })
}
