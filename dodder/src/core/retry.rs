//! Bounded retry counters kept outside the conversation.

/// Counts consecutive failures against a fixed limit of retries.
///
/// `limit` is the number of retries allowed after the first failure, so
/// `limit + 1` consecutive failures exhaust the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    limit: u32,
    failures: u32,
}

impl RetryBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, failures: 0 }
    }

    /// Record one failure. Returns `true` when another retry is still allowed.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.failures <= self.limit
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
