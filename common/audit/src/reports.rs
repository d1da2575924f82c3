use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const REPORTS_REJECTED_TOTAL: &str = "audit_reports_rejected_total";

/// A violation or anomaly report submitted by the protected workload
/// (for example its own policy-violation detector). Parsed only after the
/// submission has passed the [`ReportGate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationReport {
    pub category: String,
    pub detail: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReportRejected {
    #[error("report exceeds the {limit} byte submission limit")]
    TooLarge { limit: usize },
    #[error("reporting rate exceeded for this source")]
    RateLimited,
}

/// Admission control for externally submitted reports: a per-source size
/// cap and a rolling per-source rate cap, both checked before the body is
/// parsed or logged.
pub struct ReportGate {
    max_bytes: usize,
    limiter: RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>,
}

impl ReportGate {
    pub fn new(max_bytes: usize, reports_per_minute: NonZeroU32) -> Self {
        Self {
            max_bytes,
            limiter: RateLimiter::keyed(Quota::per_minute(reports_per_minute)),
        }
    }

    /// Admit or reject a submission of `len` bytes from `source`. The size
    /// check runs first so oversized bodies never consume rate budget.
    pub fn admit(&self, source: &str, len: usize) -> Result<(), ReportRejected> {
        if len > self.max_bytes {
            counter!(REPORTS_REJECTED_TOTAL, "cause" => "too_large").increment(1);
            return Err(ReportRejected::TooLarge {
                limit: self.max_bytes,
            });
        }
        if self.limiter.check_key(&source.to_string()).is_err() {
            counter!(REPORTS_REJECTED_TOTAL, "cause" => "rate_limited").increment(1);
            return Err(ReportRejected::RateLimited);
        }
        Ok(())
    }

    /// Drops idle per-source limiter state so the keyed store stays bounded.
    pub fn clean(&self) {
        self.limiter.retain_recent();
    }
}
