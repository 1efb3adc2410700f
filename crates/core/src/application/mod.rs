// Application Layer - the engine facades over the sync primitives

pub mod config;
pub mod constants;
pub mod engine;
mod pool;
pub mod queue;
pub mod settings;
pub mod state;
pub mod timers;

// Re-exports
pub use config::{
    ChildrenFinishedFn, EngineConfig, FinishedFn, GroupConfig, JobHandle, JobsConfig,
    ProcessingConfig, ProcessingFn, TypeConfig,
};
pub use engine::JobsEngine;
pub use queue::JobsQueue;
pub use settings::{EngineSettings, GroupSettings, PrioritySetting, Settings, TypeSettings};
pub use state::JobsState;
pub use timers::{TimerFn, TimerId, Timers};
