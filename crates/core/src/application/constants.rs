// Engine constants

/// Worker tasks when the engine config does not say otherwise.
pub const DEFAULT_ENGINE_THREADS: usize = 8;

/// Worker budget of a group when unspecified.
pub const DEFAULT_GROUP_THREADS: usize = 1;

/// Jobs a worker dequeues per pass when unspecified.
pub const DEFAULT_BULK_COUNT: usize = 1;

/// Worker tasks backing the timers facade.
pub const TIMER_THREADS: usize = 4;
