pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use queue::{BoundedQueue, ChannelJobQueue, Job, JobError, JobQueue, PushOutcome};
pub use retry::{retry_transient, RetryError, RetryPolicy};
pub use worker::{partition_of, Handler, JobHandler, PartitionedPool, Worker};
