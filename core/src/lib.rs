//! Domain types, error taxonomy, and storage/adapter seams for mcoda's
//! Gateway-Trio execution engine. This crate has no I/O of its own; it is
//! implemented by `mcoda-store` (SQLite) and `mcoda-mocks` (in-memory/test).
//! `tokio-util`'s `CancellationToken` is re-exported as the one exception: a
//! pure synchronization primitive, not I/O, used to propagate cancellation
//! from the CLI into `mcoda-engine`.

pub mod adapter;
pub mod error;
pub mod models;
pub mod repository;
pub mod rng;
pub mod time_window;
pub mod validation;

pub use adapter::{AgentAdapter, AuthRequirement, HealthState, HealthStatus, InvokeInput, InvokeOutput};
pub use error::McodaError;
pub use models::*;
pub use repository::{TokenUsagePage, UsageFilter, UsageSummaryRow, WorkspaceStore};
pub use rng::RouterRng;
pub use tokio_util::sync::CancellationToken;
pub use validation::Validator;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_are_reachable() {
        let _ = TaskStatus::NotStarted;
        let _ = McodaError::not_found("x");
        assert!(!VERSION.is_empty());
        assert_eq!(CRATE_NAME, "mcoda-core");
    }
}
