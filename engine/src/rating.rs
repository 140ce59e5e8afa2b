use chrono::{DateTime, Duration, Utc};
use mcoda_core::{Agent, NewAgentRunRating, WorkspaceStore};

const DEFAULT_RATING_WINDOW: usize = 50;
const COOLDOWN_HOURS: i64 = 24;

const WEIGHT_COST: f64 = 1.0;
const WEIGHT_TIME: f64 = 0.5;
const WEIGHT_ITER: f64 = 0.5;

const PROMOTE_RUN_SCORE: f64 = 7.5;
const PROMOTE_QUALITY: f64 = 7.0;
const DEMOTE_RUN_SCORE: f64 = 4.0;

/// Budget an agent is expected to stay within for a task of a given
/// complexity, per spec.md §4.6.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub cost_usd: f64,
    pub duration_seconds: f64,
    pub iterations: f64,
}

impl Budget {
    pub fn from_complexity(complexity: i32, base_cost: f64, base_duration: f64, base_iterations: f64) -> Self {
        let factor = (complexity as f64 / 5.0).clamp(0.5, 2.0);
        Self {
            cost_usd: base_cost * factor,
            duration_seconds: base_duration * factor,
            iterations: base_iterations + (complexity as f64 / 3.0).round(),
        }
    }
}

/// One completed run's raw measurements, the input to `score_run`.
#[derive(Debug, Clone, Copy)]
pub struct RunMeasurement {
    pub quality_score: f64,
    pub total_cost: f64,
    pub duration_seconds: f64,
    pub iterations: i32,
}

/// `AgentRatingService`: scores a finished run against its complexity budget,
/// folds the score into the agent's EMA ratings, and promotes/demotes the
/// agent's complexity cap under a 24h cooldown.
pub struct AgentRatingService<'a> {
    store: &'a dyn WorkspaceStore,
    rating_window: usize,
}

impl<'a> AgentRatingService<'a> {
    pub fn new(store: &'a dyn WorkspaceStore) -> Self {
        Self {
            store,
            rating_window: DEFAULT_RATING_WINDOW,
        }
    }

    pub fn with_rating_window(store: &'a dyn WorkspaceStore, rating_window: usize) -> Self {
        Self { store, rating_window }
    }

    /// `runScore = clamp(quality - w_cost*costPenalty - w_time*timePenalty - w_iter*iterPenalty, 0, 10)`.
    pub fn score_run(measurement: &RunMeasurement, budget: &Budget) -> f64 {
        let cost_penalty = (penalty_ratio(measurement.total_cost, budget.cost_usd)).max(0.0);
        let time_penalty = (penalty_ratio(measurement.duration_seconds, budget.duration_seconds)).max(0.0);
        let iter_penalty = (penalty_ratio(measurement.iterations as f64, budget.iterations)).max(0.0);

        (measurement.quality_score
            - WEIGHT_COST * cost_penalty
            - WEIGHT_TIME * time_penalty
            - WEIGHT_ITER * iter_penalty)
            .clamp(0.0, 10.0)
    }

    /// EMA update: `r' = r + alpha * (s - r)`, `alpha = 2 / (window + 1)`.
    pub fn ema_update(&self, previous: f64, sample: f64) -> f64 {
        let alpha = 2.0 / (self.rating_window as f64 + 1.0);
        previous + alpha * (sample - previous)
    }

    /// Finalizes a run: persists an `AgentRunRating`, updates `rating` and
    /// `reasoningRating` via EMA, and applies the cooldown-gated complexity
    /// cap adjustment. Returns the updated agent.
    pub async fn finalize_run(
        &self,
        agent: &Agent,
        measurement: &RunMeasurement,
        reasoning_sample: f64,
        requested_complexity: i32,
        job_id: Option<String>,
        task_id: Option<i64>,
        budget: &Budget,
        now: DateTime<Utc>,
    ) -> Result<Agent, mcoda_core::McodaError> {
        let run_score = Self::score_run(measurement, budget);

        self.store
            .record_agent_run_rating(NewAgentRunRating {
                agent_id: agent.id,
                job_id,
                task_id,
                quality_score: measurement.quality_score,
                total_cost: measurement.total_cost,
                duration_seconds: measurement.duration_seconds,
                iterations: measurement.iterations,
                run_score,
            })
            .await?;

        let new_rating = self.ema_update(agent.rating, run_score);
        let new_reasoning = self.ema_update(agent.reasoning_rating, reasoning_sample);
        let updated = self
            .store
            .update_agent_rating(agent.id, new_rating, new_reasoning)
            .await?;

        let new_complexity = adjust_complexity(
            updated.max_complexity,
            run_score,
            measurement.quality_score,
            requested_complexity,
        );

        let cooldown_elapsed = agent
            .complexity_updated_at
            .map(|last| now - last >= Duration::hours(COOLDOWN_HOURS))
            .unwrap_or(true);

        if new_complexity != updated.max_complexity && cooldown_elapsed {
            return self
                .store
                .update_agent_complexity(agent.id, new_complexity, now)
                .await;
        }

        Ok(updated)
    }
}

fn penalty_ratio(actual: f64, budget: f64) -> f64 {
    if budget <= 0.0 {
        0.0
    } else {
        (actual - budget) / budget
    }
}

fn adjust_complexity(current: i32, run_score: f64, quality_score: f64, requested_complexity: i32) -> i32 {
    if run_score >= PROMOTE_RUN_SCORE && quality_score >= PROMOTE_QUALITY && requested_complexity >= current {
        return (current + 1).min(10);
    }
    if run_score <= DEMOTE_RUN_SCORE && requested_complexity <= current {
        return (current - 1).max(1);
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcoda_core::NewAgent;
    use mcoda_mocks::MockWorkspaceStore;

    #[test]
    fn run_score_penalizes_overbudget_cost() {
        let budget = Budget {
            cost_usd: 1.0,
            duration_seconds: 60.0,
            iterations: 2.0,
        };
        let measurement = RunMeasurement {
            quality_score: 10.0,
            total_cost: 2.0,
            duration_seconds: 60.0,
            iterations: 2,
        };
        let score = AgentRatingService::score_run(&measurement, &budget);
        assert!((score - 9.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn repeated_run_score_converges_to_sample_within_400_updates() {
        let store = MockWorkspaceStore::new();
        let agent = store
            .create_agent(NewAgent {
                slug: "agent-a".into(),
                adapter: "stub".into(),
                default_model: "m".into(),
                capabilities: vec![],
                cost_per_million: 1.0,
                max_complexity: 5,
            })
            .await
            .unwrap();
        let service = AgentRatingService::new(&store);

        let mut rating = agent.rating;
        for _ in 0..400 {
            rating = service.ema_update(rating, 9.0);
        }
        assert!((rating - 9.0).abs() < 1e-9);
    }

    #[test]
    fn complexity_promotes_when_run_score_and_quality_clear_threshold() {
        assert_eq!(adjust_complexity(5, 8.0, 8.0, 5), 6);
        assert_eq!(adjust_complexity(5, 8.0, 6.0, 5), 5);
        assert_eq!(adjust_complexity(5, 3.0, 9.0, 5), 4);
        assert_eq!(adjust_complexity(10, 9.0, 9.0, 10), 10);
    }
}
