//! Strategy selection and the two deterministic plan builders.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::evolve::{EvolutionParams, evolutionary_plan};
use crate::plan::{Plan, Step, VerifyOnFail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Auto,
    ZeroShot,
    Evolutionary,
    FirstPrinciples,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(StrategyKind::Auto),
            "zero-shot" | "zeroshot" => Ok(StrategyKind::ZeroShot),
            "evolutionary" => Ok(StrategyKind::Evolutionary),
            "first-principles" => Ok(StrategyKind::FirstPrinciples),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

/// Verbs that suggest the query wants tools run, not prose.
const TOOL_VERBS: &[&str] = &[
    "scan", "probe", "enumerate", "fingerprint", "capture", "sniff", "crack",
    "exploit", "fuzz", "brute", "intercept",
];

/// Plan builder facade: resolves `auto`, dispatches to a strategy.
#[derive(Debug, Clone)]
pub struct Planner {
    pub strategy: StrategyKind,
    /// Depth budget — the `max_steps` cap strategies must plan within.
    pub max_steps: usize,
}

impl Planner {
    pub fn new(strategy: StrategyKind, max_steps: usize) -> Self {
        Self { strategy, max_steps }
    }

    pub fn plan(&self, query: &str) -> Plan {
        let resolved = match self.strategy {
            StrategyKind::Auto => auto_select(query, self.max_steps),
            fixed => fixed,
        };
        debug!(?resolved, query_len = query.len(), "strategy selected");

        let mut plan = match resolved {
            StrategyKind::Evolutionary => {
                evolutionary_plan(query, &EvolutionParams::default())
            }
            StrategyKind::FirstPrinciples => first_principles_plan(query),
            _ => zero_shot_plan(query),
        };
        plan.steps.truncate(self.max_steps);
        plan
    }
}

/// Heuristic over query length, tool-like verbs, and the depth budget.
/// Falls back to zero-shot when in doubt.
fn auto_select(query: &str, max_steps: usize) -> StrategyKind {
    let lower = query.to_lowercase();
    let has_tool_verb = TOOL_VERBS.iter().any(|v| lower.contains(v));

    if has_tool_verb && max_steps >= 3 {
        return StrategyKind::Evolutionary;
    }
    if query.len() > 120 && max_steps >= 4 {
        return StrategyKind::FirstPrinciples;
    }
    StrategyKind::ZeroShot
}

/// Single prompt, no sub-steps.
pub fn zero_shot_plan(query: &str) -> Plan {
    Plan {
        strategy: StrategyKind::ZeroShot,
        steps: vec![Step::Reason {
            prompt: query.to_string(),
            strategy_hint: None,
        }],
    }
}

/// Decompose the query into axioms and derivations: one Reason+Verify pair
/// per clause, then a synthesizing Reason over the chain.
pub fn first_principles_plan(query: &str) -> Plan {
    let clauses: Vec<&str> = query
        .split(['.', ';', '?'])
        .map(str::trim)
        .filter(|c| c.len() > 12)
        .collect();

    let mut steps = Vec::new();
    for (i, clause) in clauses.iter().enumerate() {
        steps.push(Step::Reason {
            prompt: format!("From first principles, establish: {clause}"),
            strategy_hint: Some("axiom".to_string()),
        });
        steps.push(Step::Verify {
            predicate: "nonempty".to_string(),
            on_fail: if i == 0 { VerifyOnFail::Abort } else { VerifyOnFail::Continue },
        });
    }
    steps.push(Step::Reason {
        prompt: format!("Synthesize the derivations above into an answer to: {query}"),
        strategy_hint: Some("synthesis".to_string()),
    });

    Plan {
        strategy: StrategyKind::FirstPrinciples,
        steps,
    }
}
