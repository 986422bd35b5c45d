//! Evolutionary plan search.
//!
//! Generates a population of candidate partial plans, scores each with a
//! cheap vector-similarity fitness (cosine between the rendered plan and
//! the query, over deterministic token-hash embeddings), mutates the
//! survivors, and iterates until the generation budget runs out or fitness
//! plateaus.  Everything is deterministic: mutation choices derive from
//! generation and slot indices, and ties are broken by insertion order via
//! a stable sort.

use sentra_memory::{HashEmbedder, extract_concepts};
use tracing::debug;

use crate::plan::{Plan, Step, VerifyOnFail};
use crate::strategy::StrategyKind;

#[derive(Debug, Clone)]
pub struct EvolutionParams {
    /// Population size N.
    pub population: usize,
    /// Survivors K carried into the next generation.
    pub survivors: usize,
    /// Generation budget G.
    pub max_generations: usize,
    /// Plateau floor: stop after two consecutive rounds improving less
    /// than this.
    pub epsilon: f32,
}

impl Default for EvolutionParams {
    fn default() -> Self {
        Self {
            population: 6,
            survivors: 2,
            max_generations: 4,
            epsilon: 1e-3,
        }
    }
}

/// Baseline inner product.
pub fn dot_baseline(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Loop-unrolled inner product.  Must stay numerically equivalent to
/// [`dot_baseline`]; four independent accumulators summed in a fixed order
/// keep the floating-point association deterministic.
pub fn dot_fused(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let chunks = len / 4;
    let (mut s0, mut s1, mut s2, mut s3) = (0f32, 0f32, 0f32, 0f32);

    for i in 0..chunks {
        let base = i * 4;
        s0 += a[base] * b[base];
        s1 += a[base + 1] * b[base + 1];
        s2 += a[base + 2] * b[base + 2];
        s3 += a[base + 3] * b[base + 3];
    }
    let mut tail = 0f32;
    for i in (chunks * 4)..len {
        tail += a[i] * b[i];
    }
    ((s0 + s1) + (s2 + s3)) + tail
}

fn fitness(embedder: &HashEmbedder, query_vec: &[f32], plan: &Plan) -> f32 {
    let plan_vec = embedder.embed_sync(&plan.render());
    let dot = dot_fused(query_vec, &plan_vec);
    let mag_a = dot_fused(query_vec, query_vec).sqrt();
    let mag_b = dot_fused(&plan_vec, &plan_vec).sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

/// Seed population: template variations over the query and its concepts.
fn seed_population(query: &str, concepts: &[String], n: usize) -> Vec<Plan> {
    let concept = |i: usize| -> String {
        concepts
            .get(i % concepts.len().max(1))
            .cloned()
            .unwrap_or_else(|| query.to_string())
    };

    let templates: Vec<Vec<Step>> = vec![
        vec![
            Step::Retrieve { query: query.to_string(), k: 4 },
            Step::Reason {
                prompt: format!("Answer using the retrieved context: {query}"),
                strategy_hint: None,
            },
        ],
        vec![Step::Reason {
            prompt: query.to_string(),
            strategy_hint: None,
        }],
        vec![
            Step::Retrieve { query: concept(0), k: 3 },
            Step::Retrieve { query: concept(1), k: 3 },
            Step::Reason {
                prompt: format!("Combine both retrievals to answer: {query}"),
                strategy_hint: None,
            },
        ],
        vec![
            Step::Reason {
                prompt: format!("Break down the request: {query}"),
                strategy_hint: Some("decompose".to_string()),
            },
            Step::Retrieve { query: query.to_string(), k: 2 },
            Step::Reason {
                prompt: format!("Answer with the breakdown and context: {query}"),
                strategy_hint: None,
            },
            Step::Verify {
                predicate: "nonempty".to_string(),
                on_fail: VerifyOnFail::Continue,
            },
        ],
    ];

    (0..n)
        .map(|i| {
            let mut steps = templates[i % templates.len()].clone();
            // Later seeds probe wider retrieval.
            if i >= templates.len() {
                for step in &mut steps {
                    if let Step::Retrieve { k, .. } = step {
                        *k += i / templates.len();
                    }
                }
            }
            Plan {
                strategy: StrategyKind::Evolutionary,
                steps,
            }
        })
        .collect()
}

/// Deterministic mutation: the child index picks the operator.
fn mutate(parent: &Plan, query: &str, concepts: &[String], generation: usize, child: usize) -> Plan {
    let mut steps = parent.steps.clone();
    match (generation + child) % 4 {
        // Append a retrieval over the next concept.
        0 => {
            let concept = concepts
                .get((generation + child) % concepts.len().max(1))
                .cloned()
                .unwrap_or_else(|| query.to_string());
            steps.push(Step::Retrieve { query: concept, k: 3 });
        }
        // Widen every retrieval.
        1 => {
            for step in &mut steps {
                if let Step::Retrieve { k, .. } = step {
                    *k += 1;
                }
            }
        }
        // Guard the tail with a verify.
        2 => {
            if !matches!(steps.last(), Some(Step::Verify { .. })) {
                steps.push(Step::Verify {
                    predicate: "nonempty".to_string(),
                    on_fail: VerifyOnFail::Continue,
                });
            }
        }
        // Drop the first non-reason step to shorten the plan.
        _ => {
            if steps.len() > 1 {
                if let Some(pos) = steps.iter().position(|s| !matches!(s, Step::Reason { .. })) {
                    steps.remove(pos);
                }
            }
        }
    }

    Plan {
        strategy: StrategyKind::Evolutionary,
        steps,
    }
}

/// Run the search and return the fittest plan.
pub fn evolutionary_plan(query: &str, params: &EvolutionParams) -> Plan {
    let embedder = HashEmbedder::default();
    let query_vec = embedder.embed_sync(query);
    let concepts = extract_concepts(query, 5);

    let mut population = seed_population(query, &concepts, params.population.max(2));
    let mut best_fitness = f32::NEG_INFINITY;
    let mut flat_rounds = 0usize;

    for generation in 0..params.max_generations {
        // Stable sort: equal fitness keeps insertion order.
        let mut scored: Vec<(f32, Plan)> = population
            .iter()
            .map(|plan| (fitness(&embedder, &query_vec, plan), plan.clone()))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let generation_best = scored.first().map(|(f, _)| *f).unwrap_or(0.0);
        debug!(generation, generation_best, "evolutionary generation scored");

        if generation_best - best_fitness < params.epsilon {
            flat_rounds += 1;
            if flat_rounds >= 2 {
                debug!(generation, "fitness plateau; stopping early");
                return scored.swap_remove(0).1;
            }
        } else {
            flat_rounds = 0;
        }
        best_fitness = best_fitness.max(generation_best);

        let survivors: Vec<Plan> = scored
            .iter()
            .take(params.survivors.max(1))
            .map(|(_, plan)| plan.clone())
            .collect();

        let mut next = survivors.clone();
        let mut child = 0usize;
        while next.len() < params.population.max(2) {
            let parent = &survivors[child % survivors.len()];
            next.push(mutate(parent, query, &concepts, generation, child));
            child += 1;
        }
        population = next;
    }

    // Final selection over the last generation.
    let mut scored: Vec<(f32, Plan)> = population
        .into_iter()
        .map(|plan| (fitness(&embedder, &query_vec, &plan), plan))
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.swap_remove(0).1
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fused and baseline kernels agree within 1e-9 across shapes,
    /// including lengths that exercise the unroll tail.
    #[test]
    fn fused_kernel_matches_baseline() {
        for len in [0usize, 1, 3, 4, 5, 7, 8, 15, 16, 64, 127] {
            let a: Vec<f32> = (0..len).map(|i| (i as f32).sin() * 0.5).collect();
            let b: Vec<f32> = (0..len).map(|i| (i as f32).cos() * 1.5).collect();
            let baseline = dot_baseline(&a, &b);
            let fused = dot_fused(&a, &b);
            assert!(
                (f64::from(baseline) - f64::from(fused)).abs() < 1e-9,
                "len {len}: baseline {baseline} vs fused {fused}"
            );
        }
    }

    #[test]
    fn search_is_deterministic() {
        let query = "enumerate open services on the target network and summarize exposure";
        let a = evolutionary_plan(query, &EvolutionParams::default());
        let b = evolutionary_plan(query, &EvolutionParams::default());
        assert_eq!(a, b, "same query must evolve the same plan");
    }

    #[test]
    fn winning_plan_is_nonempty_and_bounded() {
        let params = EvolutionParams::default();
        let plan = evolutionary_plan("scan the dmz for exposed databases", &params);
        assert!(!plan.steps.is_empty());
        assert_eq!(plan.strategy, StrategyKind::Evolutionary);
    }

    #[test]
    fn plateau_cuts_the_search_short() {
        // One-word query: every candidate scores identically, so the search
        // must exit on the plateau path without exhausting generations.
        let params = EvolutionParams {
            max_generations: 64,
            ..EvolutionParams::default()
        };
        let plan = evolutionary_plan("nmap", &params);
        assert!(!plan.steps.is_empty());
    }

    #[test]
    fn mutation_is_deterministic_per_slot() {
        let parent = Plan {
            strategy: StrategyKind::Evolutionary,
            steps: vec![Step::Retrieve { query: "x".to_string(), k: 2 }],
        };
        let concepts = vec!["alpha".to_string(), "bravo".to_string()];
        let a = mutate(&parent, "q", &concepts, 1, 2);
        let b = mutate(&parent, "q", &concepts, 1, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn seeds_vary_across_population() {
        let seeds = seed_population("query text here", &["concept".to_string()], 6);
        assert_eq!(seeds.len(), 6);
        assert_ne!(seeds[0], seeds[1]);
    }
}
