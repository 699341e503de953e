//! Worker pinning policy.

use serde::{Deserialize, Serialize};

use crate::JobFilter;

/// Decides whether pinned jobs belong to the unscoped claim pool.
///
/// Worker-scoped reads always filter on the exact worker name. The policy
/// only changes what an unscoped `claim_next` may pick up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinPolicy {
    /// Pinned jobs are also claimable from the unscoped pool. Pinning is a
    /// preference, not a guarantee.
    #[default]
    Shared,
    /// The unscoped pool only holds unpinned jobs.
    Strict,
}

impl PinPolicy {
    /// Eligibility filter for an unscoped claim.
    pub fn unscoped_pool(&self) -> JobFilter {
        match self {
            PinPolicy::Shared => JobFilter::eligible(),
            PinPolicy::Strict => JobFilter::eligible().with_worker(""),
        }
    }
}

impl std::str::FromStr for PinPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "shared" => Ok(PinPolicy::Shared),
            "strict" => Ok(PinPolicy::Strict),
            other => Err(format!("unknown pin policy: {}", other)),
        }
    }
}
