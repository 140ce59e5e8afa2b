//! The Gateway-Trio execution engine: task selection, gateway analysis,
//! agent routing/rating, telemetry, job lifecycle, and the trio loop that
//! drives tasks through Work -> Review -> QA.

pub mod gateway;
pub mod job_runtime;
pub mod rating;
pub mod router;
pub mod selector;
pub mod telemetry;
pub mod trio;

pub use gateway::{Discipline, GatewayAgent, GatewayAnalysis, GatewayPromptContext};
pub use job_runtime::{JobArtifacts, JobManifest, JobRuntime};
pub use rating::{AgentRatingService, Budget, RunMeasurement};
pub use router::{AgentRouter, RoutingDecision, RoutingRequest, StdRngSource};
pub use selector::{SelectionResult, TaskSelector};
pub use telemetry::{TelemetryLedger, TimeWindow};
pub use trio::{AdapterRegistry, HashMapAdapterRegistry, TrioEngine, TrioEngineConfig, TrioRunResult};
