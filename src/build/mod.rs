//! Build planning and execution.

pub mod cache;
pub mod exec;
pub mod fingerprint;
pub mod plan;

pub use cache::CompileCache;
pub use exec::{execute, BuildOutcome, ExecError, ExecOptions, NodeResult, NodeStatus};
pub use fingerprint::Fingerprint;
pub use plan::{BuildNode, BuildPlan, NodeKind, PlanError, PlanParams};
