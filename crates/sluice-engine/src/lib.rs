pub mod cron;
pub mod engine;
pub mod executor;
pub mod gate;
pub mod hooks;
pub mod notify;
pub mod scheduler;
pub mod script;
pub mod sweep;

pub use cron::PipelineScheduler;
pub use engine::{ApprovalOutcome, CancelOutcome, Engine, EngineBuilder};
pub use executor::{StepExecutor, StepOutcome};
pub use hooks::{HookContext, HookRunner, InterceptorRegistry, PipelineLauncher, RecordInterceptor};
pub use notify::{GateNotifier, GatePausedNotice, LogMailer};
pub use scheduler::{DagScheduler, RunSettings};
pub use script::Script;
pub use sweep::GateTimeoutSweeper;
