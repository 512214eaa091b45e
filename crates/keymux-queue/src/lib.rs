//! Request queueing for keymux: the family-partitioned scheduler, wait-time
//! estimation, and heartbeat sizing for connections parked in the queue.

pub mod estimator;
pub mod heartbeat;
pub mod queue;

pub use estimator::{WaitEstimator, WaitSample};
pub use heartbeat::{
    FlushMonitor, HEARTBEAT_INTERVAL, JOIN_TIMEOUT, MAX_MONITOR_STRIKES, payload, payload_size,
};
pub use queue::{
    Dequeue, EnqueueError, MAX_QUEUE_AGE, QueueConfig, QueuedHandle, RequestQueue, SCHEDULER_TICK,
    TOKENS_PUNISHMENT_FACTOR, Ticket, WAIT_TIME_INTERVAL,
};
