//! Triage, queueing, dispatch and failure isolation

pub mod circuit_breaker;
pub mod dead_letter;
pub mod dispatcher;
pub mod dual_path;
pub mod job_queue;
pub mod job_table;
pub mod retry;
pub mod scoring;

pub use circuit_breaker::{BreakerPermit, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore};
pub use dispatcher::{Dispatcher, WorkerStats};
pub use dual_path::{DualPathCoordinator, PathOutcome};
pub use job_queue::{JobQueue, Lane, Lease, QueueDepth, QueueEntry};
pub use job_table::{JobTable, TrackedJob};
pub use retry::{classify_message, ErrorClass, RetryPolicy, RetryRecord};
pub use scoring::{PriorityScorer, ScoreInput};
