pub mod admin;
pub mod agent;
pub mod api;
pub mod config;
pub mod control;
pub mod error;
pub mod membership;
pub mod observability;
pub mod probe;
pub mod shutdown;

pub use admin::{AdminError, AdminExecutor, SimulatedAdmin};
pub use agent::Agent;
pub use config::{AgentConfig, RunMode};
pub use control::{ControlPlane, Execution, ShutdownPhase};
pub use error::AgentError;
pub use membership::{FeedEvent, Member, MemberPhase, MemberRole, MemberSource, Reconciler};
pub use probe::{HealthProbes, ProbeResult, ProbeStatus};
pub use shutdown::{ShutdownError, ShutdownOrchestrator, TransportHandle};
