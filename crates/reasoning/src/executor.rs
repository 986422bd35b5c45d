//! Ordered step execution with a scoped environment, permission gating,
//! a hard step cap, and an end-to-end deadline.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sentra_bus::{EventBus, Topic};
use sentra_tools::{ExecutionMode, RuntimeConfig, ToolError, ToolRegistry, authorize, resolve, simulated_output};

use crate::plan::{Plan, PlanResult, Step, StepOutcome, VerifyOnFail};
use crate::{ReasonError, ReasonResult};

/// Services a plan needs from the surrounding runtime: generation for
/// Reason steps, retrieval for Retrieve steps.
#[async_trait]
pub trait StepHost: Send + Sync {
    async fn reason(&self, prompt: &str, strategy_hint: Option<&str>) -> ReasonResult<String>;

    async fn retrieve(&self, query: &str, k: usize) -> ReasonResult<Vec<String>>;
}

pub struct Executor<'a> {
    registry: &'a ToolRegistry,
    runtime_config: &'a RuntimeConfig,
    host: &'a dyn StepHost,
    bus: Option<&'a EventBus>,
    max_steps: usize,
    timeout: Duration,
    approval_token: Option<String>,
}

impl<'a> Executor<'a> {
    pub fn new(
        registry: &'a ToolRegistry,
        runtime_config: &'a RuntimeConfig,
        host: &'a dyn StepHost,
        max_steps: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            runtime_config,
            host,
            bus: None,
            max_steps,
            timeout,
            approval_token: None,
        }
    }

    pub fn with_bus(mut self, bus: &'a EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_approval_token(mut self, token: Option<String>) -> Self {
        self.approval_token = token;
        self
    }

    /// Run `plan` serially.  Steps past `max_steps` or the deadline are cut
    /// off and the partial result is returned with `truncated: true`.
    ///
    /// A failing tool or verify step aborts the plan unless the immediately
    /// following step is `Verify { on_fail: Continue }`, which absorbs the
    /// failure and lets execution proceed.
    pub async fn execute(&self, plan: &Plan) -> ReasonResult<PlanResult> {
        let deadline = Instant::now() + self.timeout;
        let mut env: HashMap<String, String> = HashMap::new();
        let mut outcomes: Vec<StepOutcome> = Vec::new();
        let mut truncated = plan.steps.len() > self.max_steps;
        let mut index = 0usize;

        while index < plan.steps.len().min(self.max_steps) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(step = index, "plan deadline reached; returning partial result");
                truncated = true;
                break;
            }

            let step = &plan.steps[index];
            debug!(step = index, kind = step.kind(), "executing step");

            let attempt = tokio::time::timeout(remaining, self.run_step(step, &env)).await;
            let step_result = match attempt {
                Ok(result) => result,
                Err(_) => {
                    warn!(step = index, "step hit the plan deadline; returning partial result");
                    truncated = true;
                    break;
                }
            };

            match step_result {
                Ok((output, simulated)) => {
                    env.insert(format!("step{index}"), output.clone());
                    env.insert("last".to_string(), output.clone());
                    outcomes.push(StepOutcome {
                        index,
                        kind: step.kind().to_string(),
                        output,
                        success: true,
                        simulated,
                    });
                    index += 1;
                }
                Err(err) => {
                    outcomes.push(StepOutcome {
                        index,
                        kind: step.kind().to_string(),
                        output: err.to_string(),
                        success: false,
                        simulated: false,
                    });

                    // A following Verify{Continue} absorbs the failure.
                    let absorbed = matches!(
                        plan.steps.get(index + 1),
                        Some(Step::Verify { on_fail: VerifyOnFail::Continue, .. })
                    );
                    if absorbed {
                        info!(step = index, %err, "step failure absorbed by verify guard");
                        env.insert("last".to_string(), String::new());
                        index += 2;
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Ok(PlanResult { outcomes, truncated })
    }

    async fn run_step(
        &self,
        step: &Step,
        env: &HashMap<String, String>,
    ) -> ReasonResult<(String, bool)> {
        match step {
            Step::Reason { prompt, strategy_hint } => {
                let prompt = substitute(prompt, env);
                let output = self.host.reason(&prompt, strategy_hint.as_deref()).await?;
                Ok((output, false))
            }
            Step::Retrieve { query, k } => {
                let query = substitute(query, env);
                let snippets = self.host.retrieve(&query, *k).await?;
                Ok((snippets.join("\n"), false))
            }
            Step::Tool { tool_name, args, mode } => self.run_tool(tool_name, args, *mode, env).await,
            Step::Verify { predicate, on_fail } => {
                let last = env.get("last").map(String::as_str).unwrap_or("");
                if verify(predicate, last) {
                    Ok((format!("verified: {predicate}"), false))
                } else {
                    match on_fail {
                        VerifyOnFail::Continue => Ok((format!("verify failed (continuing): {predicate}"), false)),
                        VerifyOnFail::Abort => Err(ReasonError::VerifyFailed(predicate.clone())),
                    }
                }
            }
        }
    }

    async fn run_tool(
        &self,
        tool_name: &str,
        args: &HashMap<String, String>,
        requested_mode: crate::plan::StepMode,
        env: &HashMap<String, String>,
    ) -> ReasonResult<(String, bool)> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| ToolError::UnknownTool(tool_name.to_string()))?;
        let descriptor = tool.descriptor();

        let decision = resolve(&descriptor, self.runtime_config);
        let gate_mode = authorize(&descriptor, decision, self.approval_token.as_deref())?;

        // The gate's word is final; the plan can only make it stricter.
        let simulated = matches!(gate_mode, ExecutionMode::Simulated)
            || matches!(requested_mode, crate::plan::StepMode::Simulated);

        let (success, output) = if simulated {
            (true, simulated_output(tool_name))
        } else {
            let resolved_args: HashMap<String, String> = args
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, env)))
                .collect();
            let result = tool.run(&resolved_args).await?;
            (result.success, result.output)
        };

        if let Some(bus) = self.bus {
            bus.publish(
                Topic::ToolExecution,
                serde_json::json!({
                    "tool": tool_name,
                    "simulated": simulated,
                    "success": success,
                }),
            );
        }

        if !success {
            return Err(ReasonError::Tool(ToolError::Failed(output)));
        }
        Ok((output, simulated))
    }
}

/// Replace `{{stepN}}` / `{{last}}` placeholders with prior step outputs.
fn substitute(text: &str, env: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (key, value) in env {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Predicate forms: `nonempty`, `contains:<needle>`, `equals:<text>`.
fn verify(predicate: &str, last_output: &str) -> bool {
    if predicate == "nonempty" {
        return !last_output.trim().is_empty();
    }
    if let Some(needle) = predicate.strip_prefix("contains:") {
        return last_output.to_lowercase().contains(&needle.to_lowercase());
    }
    if let Some(expected) = predicate.strip_prefix("equals:") {
        return last_output == expected;
    }
    // Unknown predicate forms fail closed.
    false
}
