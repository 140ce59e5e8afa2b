use mcoda_core::{Agent, McodaError, RouterRng};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DEFAULT_EPSILON: f64 = 0.1;
const STRETCH_PROBABILITY: f64 = 0.5;

/// `RouterRng` backed by `rand`'s `StdRng`, the production source used
/// outside tests; seed it from entropy via `StdRng::from_entropy`.
pub struct StdRngSource(StdRng);

impl StdRngSource {
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    pub fn from_seed(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl RouterRng for StdRngSource {
    fn next_f64(&mut self) -> f64 {
        self.0.gen_range(0.0..1.0)
    }
}

/// Result of one routing decision, per spec.md §4.5 step 5.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub agent: Agent,
    pub reason: String,
    pub missing_required: Vec<String>,
    pub missing_preferred: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingRequest<'a> {
    pub complexity: i32,
    pub required_capabilities: &'a [String],
    pub preferred_capabilities: &'a [String],
    pub avoid_agents: &'a [String],
}

/// Selects a concrete execution agent from the global registry given a
/// gateway analysis, honoring reachability, capability gating, the
/// complexity cap, and ε-greedy exploration. Deterministic modulo the
/// supplied `RouterRng`.
pub struct AgentRouter {
    epsilon: f64,
}

impl Default for AgentRouter {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
        }
    }
}

impl AgentRouter {
    pub fn new(epsilon: f64) -> Self {
        Self { epsilon }
    }

    pub fn select(
        &self,
        agents: &[Agent],
        request: &RoutingRequest<'_>,
        rng: &mut dyn RouterRng,
    ) -> Result<RoutingDecision, McodaError> {
        let candidates: Vec<&Agent> = agents
            .iter()
            .filter(|a| a.reachable)
            .filter(|a| !request.avoid_agents.iter().any(|s| s == &a.slug))
            .collect();

        let eligible: Vec<&Agent> = candidates
            .iter()
            .copied()
            .filter(|a| a.max_complexity >= request.complexity)
            .collect();

        if candidates.is_empty() {
            return Err(McodaError::AgentUnreachable {
                agent: "*".into(),
                reason: "no reachable agent available".into(),
            });
        }

        let explore = rng.next_f64() < self.epsilon;

        let chosen = if explore {
            let stretch = rng.next_f64() < STRETCH_PROBABILITY;
            let mut pool: Vec<&Agent> = eligible.clone();
            if stretch {
                pool.extend(
                    candidates
                        .iter()
                        .copied()
                        .filter(|a| a.max_complexity == request.complexity - 1),
                );
            }
            if pool.is_empty() {
                return Err(McodaError::AgentUnreachable {
                    agent: "*".into(),
                    reason: "exploration pool empty".into(),
                });
            }
            pool.sort_by(|a, b| a.max_complexity.cmp(&b.max_complexity).then_with(|| a.slug.cmp(&b.slug)));
            let idx = ((rng.next_f64() * pool.len() as f64).floor() as usize).min(pool.len() - 1);
            (pool[idx], "exploration".to_string())
        } else {
            let mut ranked = eligible.clone();
            ranked.sort_by(|a, b| rank(a, request).cmp(&rank(b, request)).then_with(|| a.slug.cmp(&b.slug)));
            let head = *ranked
                .first()
                .ok_or_else(|| McodaError::AgentUnreachable {
                    agent: "*".into(),
                    reason: "no eligible agent".into(),
                })?;
            (head, format!("complexity gate satisfied at maxComplexity={}", head.max_complexity))
        };

        let (agent, reason) = chosen;
        let missing_required: Vec<String> = request
            .required_capabilities
            .iter()
            .filter(|c| !agent.capabilities.contains(c))
            .cloned()
            .collect();
        let missing_preferred: Vec<String> = request
            .preferred_capabilities
            .iter()
            .filter(|c| !agent.capabilities.contains(c))
            .cloned()
            .collect();

        Ok(RoutingDecision {
            agent: agent.clone(),
            reason,
            missing_required,
            missing_preferred,
        })
    }
}

/// Sort key implementing spec.md §4.5 step 4's ranking tuple. Booleans are
/// inverted (`!x`) so ascending sort yields "desc" ordering for each field;
/// floats are ordered via `OrderedF64` wrapping since `f64` has no `Ord`.
fn rank(agent: &Agent, request: &RoutingRequest<'_>) -> (bool, std::cmp::Reverse<usize>, std::cmp::Reverse<usize>, OrderedF64, OrderedF64, OrderedF64) {
    let meets_required = !request
        .required_capabilities
        .iter()
        .all(|c| agent.capabilities.contains(c));
    let required_matches = request
        .required_capabilities
        .iter()
        .filter(|c| agent.capabilities.contains(c))
        .count();
    let preferred_matches = request
        .preferred_capabilities
        .iter()
        .filter(|c| agent.capabilities.contains(c))
        .count();
    (
        meets_required,
        std::cmp::Reverse(required_matches),
        std::cmp::Reverse(preferred_matches),
        OrderedF64(-agent.rating),
        OrderedF64(-agent.reasoning_rating),
        OrderedF64(agent.cost_per_million),
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedF64(f64);

impl Eq for OrderedF64 {}
impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(slug: &str, rating: f64, max_complexity: i32) -> Agent {
        Agent {
            id: 1,
            slug: slug.into(),
            adapter: "stub".into(),
            default_model: "m".into(),
            capabilities: vec![],
            rating,
            reasoning_rating: rating,
            rating_samples: 0,
            max_complexity,
            complexity_updated_at: None,
            cost_per_million: 1.0,
            reachable: true,
        }
    }

    struct Scripted(std::collections::VecDeque<f64>);
    impl RouterRng for Scripted {
        fn next_f64(&mut self) -> f64 {
            self.0.pop_front().unwrap_or(1.0)
        }
    }

    #[test]
    fn complexity_gate_excludes_underpowered_agent() {
        let agents = vec![agent("low", 9.0, 4), agent("high", 5.0, 8)];
        let router = AgentRouter::default();
        let request = RoutingRequest {
            complexity: 7,
            ..Default::default()
        };
        let mut rng = Scripted([0.9].into());
        let decision = router.select(&agents, &request, &mut rng).unwrap();
        assert_eq!(decision.agent.slug, "high");
    }

    #[test]
    fn exploration_can_pick_stretch_agent() {
        let agents = vec![agent("eligible", 8.0, 6), agent("stretch", 4.0, 5)];
        let router = AgentRouter::default();
        let request = RoutingRequest {
            complexity: 6,
            ..Default::default()
        };
        let mut rng = Scripted([0.05, 0.2, 0.1].into());
        let decision = router.select(&agents, &request, &mut rng).unwrap();
        assert_eq!(decision.agent.slug, "stretch");
    }

    #[test]
    fn exploitation_ranks_by_rating_then_cost_then_slug() {
        let mut a = agent("alpha", 8.0, 6);
        a.cost_per_million = 10.0;
        let mut b = agent("beta", 8.0, 6);
        b.cost_per_million = 5.0;
        let router = AgentRouter::default();
        let request = RoutingRequest {
            complexity: 5,
            ..Default::default()
        };
        let mut rng = Scripted([0.9].into());
        let decision = router.select(&[a, b], &request, &mut rng).unwrap();
        assert_eq!(decision.agent.slug, "beta");
    }
}
