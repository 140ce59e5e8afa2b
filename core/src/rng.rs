/// Injectable randomness source for `AgentRouter`'s ε-greedy exploration, per
/// spec.md §4.5 ("RNG source must be injectable to make selection testable").
/// Each call must return a value in `[0, 1)`.
pub trait RouterRng: Send {
    fn next_f64(&mut self) -> f64;
}
