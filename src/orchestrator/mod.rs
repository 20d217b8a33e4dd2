pub mod alert;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod state_table;

pub use alert::{Alert, AlertReason, AlertSink, LogAlertSink};
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{Orchestrator, OrchestratorConfig, PurgeSummary, RunOutcome};
pub use scheduler::{Scheduler, TickReport};
pub use state_table::StateTable;
