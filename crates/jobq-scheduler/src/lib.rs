//! Job queue engine for jobq.
//!
//! Owns the claiming protocol and dispatches claimed jobs to handlers.
//! Claims are conditional updates against the shared store, so any number
//! of workers, in one process or many, can poll the same queue.

pub mod error;
pub mod queue;
pub mod worker;

pub use error::{QueueError, QueueResult};
pub use queue::JobQueue;
pub use worker::{JobHandler, Worker};
