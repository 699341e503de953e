//! Core domain types and traits for the jobq job queue.
//!
//! This crate contains:
//! - Job identifiers and the job record
//! - The claim ordering policy
//! - Worker pinning policy
//! - The record store contract (filters, patches, write ops)

pub mod affinity;
pub mod error;
pub mod id;
pub mod job;
pub mod ordering;
pub mod pattern;
pub mod store;

pub use affinity::PinPolicy;
pub use error::{StoreError, StoreResult};
pub use id::JobId;
pub use job::{Job, JobBuilder, JobMeta, JobStatus};
pub use store::{JobFilter, JobOrder, JobPatch, JobQuery, JobStore, WriteOp, WriteOutcome};
