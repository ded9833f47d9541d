//! Runtime bookkeeping shared by the agent and the gateway.

pub mod traits;
pub mod usage;

pub use traits::{UsageBreakdown, UsageEvent, UsagePeriod, UsageSummary, UsageTracker};
pub use usage::InMemoryUsageTracker;

use std::sync::Arc;

pub fn create_usage_tracker() -> Arc<dyn UsageTracker> {
    Arc::new(InMemoryUsageTracker::new())
}
