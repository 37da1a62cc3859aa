//! State tracking for the synchronization primitives that order queue work.
//!
//! Semaphores order work between queues on the device; fences signal
//! completion back to the host. Both carry just enough durable state for
//! the submission validator to prove or disprove forward progress before a
//! batch executes.

pub use self::{fence::FenceRecord, semaphore::SemaphoreRecord};

pub mod fence;
pub mod semaphore;
