//! Claim ordering: priority descending, then creation time ascending.
//!
//! Every ordered read and every claim goes through [`claim_order`]. Ties on
//! `(priority, created)` fall back to the id so that all stores agree on a
//! single total order.

use std::cmp::Ordering;

use crate::Job;

/// Compare two jobs in claim order. `Ordering::Less` means `a` is claimed first.
pub fn claim_order(a: &Job, b: &Job) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created.cmp(&b.created))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort jobs in place so the next job to claim comes first.
pub fn sort_for_claim(jobs: &mut [Job]) {
    jobs.sort_by(claim_order);
}

/// Oldest first, ignoring priority.
pub fn created_order(a: &Job, b: &Job) -> Ordering {
    a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id))
}
