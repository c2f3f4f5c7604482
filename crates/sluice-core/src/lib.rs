pub mod checkpoint;
pub mod circuit;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod expr;
pub mod hooks;
pub mod pipeline;
pub mod projection;
pub mod retry;
pub mod traits;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointMap, EngineState};
pub use circuit::{CircuitBreakers, CircuitConfig, CircuitKey, CircuitState};
pub use config::AppConfig;
pub use context::AdapterContext;
pub use error::{Result, SluiceError};
pub use event::{EngineEvent, EventBus};
pub use hooks::{HookAction, HookStage, PipelineHooks};
pub use pipeline::{ApprovalType, EdgeDefinition, GateConfig, PipelineDefinition, StepDefinition};
pub use retry::RetryPolicy;
pub use types::*;
