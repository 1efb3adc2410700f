// Concurrency primitives the engine is built on.
//
// Every blocking operation in the engine goes through one of these queues,
// and every queue interprets the same two sticky cancellation flags.

pub mod lock_queue;
pub mod prio_queue;
pub mod time_queue;
pub mod timer_task;
pub mod wait;
pub mod worker_pool;

// Re-exports
pub use lock_queue::LockQueue;
pub use prio_queue::{PrioConfig, PrioQueue};
pub use time_queue::TimeQueue;
pub use timer_task::TimerTask;
pub use wait::{ExitFlags, PopResult};
pub use worker_pool::WorkerPool;
