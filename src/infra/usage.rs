use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

use super::traits::{UsageBreakdown, UsageEvent, UsagePeriod, UsageSummary, UsageTracker};

/// Individual events are kept for the longest windowed period (`month`).
const RETENTION_DAYS: i64 = 30;

/// Upper bound on individually retained events.
pub const DEFAULT_MAX_EVENTS: usize = 100_000;

/// Running totals for one provider/model pair.
#[derive(Debug, Clone, Copy, Default)]
struct Totals {
    requests: u64,
    failed: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

impl Totals {
    fn add_event(&mut self, e: &UsageEvent) {
        self.requests += 1;
        self.failed += u64::from(e.failed);
        self.prompt_tokens += e.prompt_tokens;
        self.completion_tokens += e.completion_tokens;
        self.total_tokens += e.total_tokens;
    }

    fn merge(&mut self, other: &Totals) {
        self.requests += other.requests;
        self.failed += other.failed;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

type TotalsByModel = BTreeMap<(String, String), Totals>;

#[derive(Default)]
struct Ledger {
    /// Recent events, oldest first.
    events: VecDeque<UsageEvent>,
    /// Events that aged out, folded per provider/model. Only `All` reads these.
    archived: TotalsByModel,
}

/// In-memory usage tracker.
///
/// Memory stays bounded: events older than the month window, or beyond
/// `max_events`, are folded into per-model totals that still count toward `all`.
pub struct InMemoryUsageTracker {
    ledger: Mutex<Ledger>,
    max_events: usize,
}

impl InMemoryUsageTracker {
    pub fn new() -> Self {
        Self::with_max_events(DEFAULT_MAX_EVENTS)
    }

    pub fn with_max_events(max_events: usize) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            max_events: max_events.max(1),
        }
    }

    /// Return the cutoff timestamp for the given period, or `None` for `All`.
    fn cutoff(period: UsagePeriod) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        match period {
            UsagePeriod::Hour => Some(now - chrono::Duration::hours(1)),
            UsagePeriod::Day => Some(now - chrono::Duration::days(1)),
            UsagePeriod::Week => Some(now - chrono::Duration::weeks(1)),
            UsagePeriod::Month => Some(now - chrono::Duration::days(RETENTION_DAYS)),
            UsagePeriod::All => None,
        }
    }

    fn in_period(event: &UsageEvent, cutoff: Option<DateTime<Utc>>) -> bool {
        cutoff.map_or(true, |c| event.timestamp >= c)
    }

    /// Totals per provider/model for `period`, archived totals included for `All`.
    fn totals(&self, period: UsagePeriod) -> TotalsByModel {
        let cutoff = Self::cutoff(period);
        let ledger = self.ledger.lock();
        let mut map = if cutoff.is_none() {
            ledger.archived.clone()
        } else {
            TotalsByModel::new()
        };
        for e in ledger.events.iter().filter(|e| Self::in_period(e, cutoff)) {
            map.entry((e.provider.clone(), e.model.clone()))
                .or_default()
                .add_event(e);
        }
        map
    }
}

impl Default for InMemoryUsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsageTracker for InMemoryUsageTracker {
    async fn record(&self, event: UsageEvent) -> anyhow::Result<()> {
        tracing::debug!(
            provider = %event.provider,
            model = %event.model,
            total_tokens = event.total_tokens,
            failed = event.failed,
            "Recording usage"
        );
        let retain_from = Utc::now() - chrono::Duration::days(RETENTION_DAYS);
        let mut ledger = self.ledger.lock();
        let Ledger { events, archived } = &mut *ledger;
        events.push_back(event);
        while events.len() > self.max_events
            || events.front().is_some_and(|e| e.timestamp < retain_from)
        {
            let Some(old) = events.pop_front() else {
                break;
            };
            archived
                .entry((old.provider.clone(), old.model.clone()))
                .or_default()
                .add_event(&old);
        }
        Ok(())
    }

    async fn summary(&self, period: UsagePeriod) -> anyhow::Result<UsageSummary> {
        let mut all = Totals::default();
        for totals in self.totals(period).values() {
            all.merge(totals);
        }
        Ok(UsageSummary {
            total_requests: all.requests,
            failed_requests: all.failed,
            total_prompt_tokens: all.prompt_tokens,
            total_completion_tokens: all.completion_tokens,
            total_tokens: all.total_tokens,
            period,
        })
    }

    async fn breakdown(&self, period: UsagePeriod) -> anyhow::Result<Vec<UsageBreakdown>> {
        // BTreeMap keeps the output ordered by provider, then model.
        Ok(self
            .totals(period)
            .into_iter()
            .map(|((provider, model), t)| UsageBreakdown {
                provider,
                model,
                requests: t.requests,
                prompt_tokens: t.prompt_tokens,
                completion_tokens: t.completion_tokens,
                total_tokens: t.total_tokens,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}
