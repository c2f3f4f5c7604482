pub mod batch;
pub mod builtin;
pub mod noop;
pub mod registry;

pub use builtin::memory::MemoryTables;
pub use noop::NoopAdapter;
pub use registry::{AdapterRegistry, HandlerOutcome};
