//! Request budget for the venue gateway.
//!
//! The venue enforces strict per-key request quotas; the client waits its
//! turn locally instead of eating rejections.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

pub type RequestLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

#[derive(Debug, Clone)]
pub struct RequestBudget {
    pub requests_per_second: u32,
}

impl Default for RequestBudget {
    fn default() -> Self {
        // Well under the venue's per-key ceiling.
        RequestBudget { requests_per_second: 8 }
    }
}

pub fn create_limiter(budget: RequestBudget) -> RequestLimiter {
    let per_second = NonZeroU32::new(budget.requests_per_second.max(1))
        .unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(per_second)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_allows_within_budget() {
        let limiter = create_limiter(RequestBudget { requests_per_second: 100 });
        assert!(limiter.check().is_ok());
    }

    #[test]
    fn test_limiter_throttles_past_budget() {
        let limiter = create_limiter(RequestBudget { requests_per_second: 1 });
        assert!(limiter.check().is_ok());
        // Burst of one: the immediate second request must be rejected.
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_zero_budget_clamped_to_one() {
        let limiter = create_limiter(RequestBudget { requests_per_second: 0 });
        assert!(limiter.check().is_ok());
    }
}
