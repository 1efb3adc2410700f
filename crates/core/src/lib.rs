// jobforge - In-process concurrent jobs engine
//
// Typed job requests flow through per-group priority queues onto a
// budgeted pool of worker tasks, with delayed starts, per-type timeouts,
// parent/child aggregation and a drain-ordered shutdown protocol.

pub mod application;
pub mod domain;
pub mod error;
pub mod sync;

pub use application::{
    EngineConfig, GroupConfig, JobHandle, JobsConfig, JobsEngine, JobsQueue, JobsState,
    ProcessingConfig, Settings, TimerId, Timers, TypeConfig,
};
pub use domain::{JobGroup, JobId, JobItem, JobState, JobType, Priority};
pub use error::{EngineError, Result};
pub use sync::{PopResult, PrioConfig};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
