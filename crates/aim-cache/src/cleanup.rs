//! Cache cleanup policy
//!
//! Cleanup runs when enabled and due. It evicts in two passes:
//! 1. by age: entries not accessed within their retention window
//! 2. by free space: while available space is below `minFreeSpace`, evict
//!    candidates in strategy order
//!
//! Entries currently in use are never evicted. Low priority entries go first
//! and high priority entries last.

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use aim_common::crd::{
    CacheModelSpec, CacheUsage, CachedModelState, CachedModelStatus, CleanupSpec, DEFAULT_MAX_AGE,
};
use aim_common::quantity::{parse_duration, parse_quantity_bytes};
use aim_common::Error;

use crate::inventory::{entry_size_bytes, used_bytes};

/// Order in which free-space eviction picks candidates
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Least recently accessed first
    #[default]
    Lru,
    /// Earliest cached first
    Oldest,
    /// Largest on-disk size first
    Largest,
}

impl FromStr for EvictionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "oldest" => Ok(Self::Oldest),
            "largest" => Ok(Self::Largest),
            _ => Err(Error::validation(format!(
                "invalid cleanup strategy: {s} (expected lru, oldest or largest)"
            ))),
        }
    }
}

/// Eviction priority of a declared model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvictionPriority {
    /// Evicted first
    Low,
    /// Default
    #[default]
    Normal,
    /// Evicted last
    High,
}

impl EvictionPriority {
    fn of(model: Option<&CacheModelSpec>) -> Self {
        match model.and_then(|m| m.priority.as_deref()) {
            Some(p) if p.eq_ignore_ascii_case("low") => Self::Low,
            Some(p) if p.eq_ignore_ascii_case("high") => Self::High,
            _ => Self::Normal,
        }
    }
}

/// When the next cleanup run is due after `now`.
///
/// Accepts cron expressions (five fields, or six with leading seconds),
/// the `@hourly`/`@daily`/`@midnight`/`@weekly`/`@monthly` shorthands, or a
/// fixed interval such as "12h". Unset means daily at midnight UTC.
pub fn next_run(schedule: Option<&str>, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
    let expr = match schedule.map(str::trim) {
        None | Some("") | Some("@daily") | Some("@midnight") => "0 0 0 * * *",
        Some("@hourly") => "0 0 * * * *",
        Some("@weekly") => "0 0 0 * * Sun",
        Some("@monthly") => "0 0 0 1 * *",
        Some(other) if other.contains(char::is_whitespace) => other,
        Some(other) => {
            let interval = parse_duration(other)?;
            if interval <= Duration::zero() {
                return Err(Error::validation(format!(
                    "cleanup schedule must be positive: {other}"
                )));
            }
            return now.checked_add_signed(interval).ok_or_else(|| {
                Error::validation(format!("cleanup schedule is out of range: {other}"))
            });
        }
    };
    next_cron_occurrence(expr, now)
}

fn next_cron_occurrence(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
    // classic crontab has no seconds field
    let expr = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    let schedule = cron::Schedule::from_str(&expr)
        .map_err(|e| Error::validation(format!("invalid cleanup schedule '{expr}': {e}")))?;
    schedule
        .after(&now)
        .next()
        .ok_or_else(|| Error::validation(format!("cleanup schedule '{expr}' never fires again")))
}

/// Whether cleanup should run now: never run yet, or the scheduled time passed
pub fn is_due(usage: Option<&CacheUsage>, now: DateTime<Utc>) -> bool {
    usage
        .and_then(|u| u.next_cleanup)
        .map_or(true, |next| next <= now)
}

/// Result of one cleanup run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CleanupOutcome {
    /// Models evicted because they outlived their retention
    pub evicted_by_age: Vec<String>,
    /// Models evicted to restore free space
    pub evicted_for_space: Vec<String>,
    /// When the next run is due
    pub next_cleanup: DateTime<Utc>,
}

impl CleanupOutcome {
    /// Total number of evicted entries
    pub fn evicted(&self) -> usize {
        self.evicted_by_age.len() + self.evicted_for_space.len()
    }
}

/// Run the cleanup policy over the inventory in place.
///
/// `capacity` is the claim's requested size in bytes. The policy is parsed
/// up front, so an invalid policy evicts nothing.
pub fn run_cleanup(
    policy: &CleanupSpec,
    models: &[CacheModelSpec],
    entries: &mut [CachedModelStatus],
    capacity: u64,
    now: DateTime<Utc>,
) -> Result<CleanupOutcome, Error> {
    let next_cleanup = next_run(policy.schedule.as_deref(), now)?;
    let max_age = parse_duration(policy.max_age.as_deref().unwrap_or(DEFAULT_MAX_AGE))?;
    let strategy = policy
        .strategy
        .as_deref()
        .map(EvictionStrategy::from_str)
        .transpose()?
        .unwrap_or_default();
    let min_free = policy
        .min_free_space
        .as_deref()
        .map(parse_quantity_bytes)
        .transpose()?;
    let retentions = models
        .iter()
        .filter_map(|m| m.retention.as_deref().map(|r| (m.id.as_str(), r)))
        .map(|(id, r)| parse_duration(r).map(|d| (id, d)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut outcome = CleanupOutcome {
        next_cleanup,
        ..Default::default()
    };

    for entry in entries.iter_mut().filter(|e| is_evictable(e)) {
        let retention = retentions
            .iter()
            .find(|(id, _)| *id == entry.id)
            .map(|(_, d)| *d)
            .unwrap_or(max_age);
        let Some(last_use) = entry.last_accessed.or(entry.cached_at) else {
            continue;
        };
        if now - last_use > retention {
            debug!(model = %entry.id, "Evicting model past retention");
            evict(entry);
            outcome.evicted_by_age.push(entry.id.clone());
        }
    }

    if let Some(min_free) = min_free {
        let mut used = used_bytes(entries);
        while capacity.saturating_sub(used) < min_free {
            let Some(idx) = next_space_victim(entries, models, strategy) else {
                warn!(
                    min_free,
                    available = capacity.saturating_sub(used),
                    "Cannot reach minimum free space without evicting models in use"
                );
                break;
            };
            let entry = &mut entries[idx];
            used = used.saturating_sub(entry_size_bytes(entry));
            debug!(model = %entry.id, ?strategy, "Evicting model to free space");
            evict(entry);
            outcome.evicted_for_space.push(entry.id.clone());
        }
    }

    if outcome.evicted() > 0 {
        info!(
            by_age = outcome.evicted_by_age.len(),
            for_space = outcome.evicted_for_space.len(),
            "Cache cleanup evicted models"
        );
    }
    Ok(outcome)
}

fn is_evictable(entry: &CachedModelStatus) -> bool {
    entry.status == CachedModelState::Cached && entry.access_count == 0
}

fn evict(entry: &mut CachedModelStatus) {
    entry.status = CachedModelState::Evicted;
    entry.access_count = 0;
}

/// Pick the next free-space eviction candidate: lowest priority first, then
/// strategy order, then id for determinism
fn next_space_victim(
    entries: &[CachedModelStatus],
    models: &[CacheModelSpec],
    strategy: EvictionStrategy,
) -> Option<usize> {
    let priority =
        |e: &CachedModelStatus| EvictionPriority::of(models.iter().find(|m| m.id == e.id));

    entries
        .iter()
        .enumerate()
        .filter(|(_, e)| is_evictable(e))
        .min_by(|(_, a), (_, b)| {
            priority(a)
                .cmp(&priority(b))
                .then_with(|| strategy_order(strategy, a, b))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(i, _)| i)
}

fn strategy_order(
    strategy: EvictionStrategy,
    a: &CachedModelStatus,
    b: &CachedModelStatus,
) -> Ordering {
    match strategy {
        // None sorts before Some: never-accessed entries go first
        EvictionStrategy::Lru => a.last_accessed.cmp(&b.last_accessed),
        EvictionStrategy::Oldest => a.cached_at.cmp(&b.cached_at),
        EvictionStrategy::Largest => entry_size_bytes(b).cmp(&entry_size_bytes(a)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const GI: u64 = 1 << 30;

    fn cached(id: &str, size: &str, days_idle: i64, now: DateTime<Utc>) -> CachedModelStatus {
        CachedModelStatus {
            id: id.to_string(),
            size: Some(size.to_string()),
            cached_at: Some(now - Duration::days(days_idle + 1)),
            last_accessed: Some(now - Duration::days(days_idle)),
            access_count: 0,
            status: CachedModelState::Cached,
        }
    }

    fn model(id: &str, priority: Option<&str>, retention: Option<&str>) -> CacheModelSpec {
        CacheModelSpec {
            id: id.to_string(),
            priority: priority.map(str::to_string),
            retention: retention.map(str::to_string),
            ..Default::default()
        }
    }

    fn policy(
        max_age: Option<&str>,
        min_free: Option<&str>,
        strategy: Option<&str>,
    ) -> CleanupSpec {
        CleanupSpec {
            enabled: true,
            schedule: None,
            max_age: max_age.map(str::to_string),
            min_free_space: min_free.map(str::to_string),
            strategy: strategy.map(str::to_string),
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn shorthand_and_interval_schedules() {
        let now = at(2026, 3, 10, 14, 30);
        assert_eq!(next_run(None, now).unwrap(), at(2026, 3, 11, 0, 0));
        assert_eq!(next_run(Some("@hourly"), now).unwrap(), at(2026, 3, 10, 15, 0));
        // 2026-03-10 is a Tuesday
        assert_eq!(next_run(Some("@weekly"), now).unwrap(), at(2026, 3, 15, 0, 0));
        assert_eq!(next_run(Some("@monthly"), now).unwrap(), at(2026, 4, 1, 0, 0));
        assert_eq!(next_run(Some("6h"), now).unwrap(), now + Duration::hours(6));
        assert!(next_run(Some("0"), now).is_err());
    }

    #[test]
    fn cron_schedules() {
        let now = at(2026, 3, 10, 14, 30);
        assert_eq!(next_run(Some("0 2 * * *"), now).unwrap(), at(2026, 3, 11, 2, 0));
        assert_eq!(next_run(Some("*/15 * * * *"), now).unwrap(), at(2026, 3, 10, 14, 45));
        assert_eq!(
            next_run(Some("0 0 16 * * *"), now).unwrap(),
            at(2026, 3, 10, 16, 0)
        );
        assert!(next_run(Some("0 99 * * *"), now).is_err());
        assert!(next_run(Some("every night"), now).is_err());
    }

    #[test]
    fn oversized_schedules_are_rejected() {
        let now = at(2026, 3, 10, 14, 30);
        assert!(next_run(Some("9999999999999999d"), now).is_err());
        // representable as a duration, but not once added to now
        assert!(next_run(Some("100000000000d"), now).is_err());
    }

    #[test]
    fn oversized_retention_fails_without_evicting() {
        let now = Utc::now();
        let mut entries = vec![cached("stale", "10Gi", 90, now)];
        let result = run_cleanup(
            &policy(Some("9999999999999999d"), None, None),
            &[],
            &mut entries,
            100 * GI,
            now,
        );
        assert!(result.is_err());
        assert_eq!(entries[0].status, CachedModelState::Cached);
    }

    #[test]
    fn cron_schedule_evicts_and_sets_next_run() {
        let now = at(2026, 3, 10, 14, 30);
        let mut entries = vec![cached("stale", "10Gi", 45, now)];
        let mut cron_policy = policy(None, None, None);
        cron_policy.schedule = Some("0 2 * * *".to_string());

        let outcome = run_cleanup(&cron_policy, &[], &mut entries, 100 * GI, now).unwrap();
        assert_eq!(outcome.evicted_by_age, vec!["stale".to_string()]);
        assert_eq!(outcome.next_cleanup, at(2026, 3, 11, 2, 0));
    }

    #[test]
    fn due_when_never_run_or_past_schedule() {
        let now = Utc::now();
        assert!(is_due(None, now));
        let mut usage = CacheUsage::default();
        assert!(is_due(Some(&usage), now));
        usage.next_cleanup = Some(now + Duration::hours(1));
        assert!(!is_due(Some(&usage), now));
        usage.next_cleanup = Some(now - Duration::seconds(1));
        assert!(is_due(Some(&usage), now));
    }

    #[test]
    fn age_eviction_uses_max_age_default() {
        let now = Utc::now();
        let mut entries = vec![
            cached("fresh", "10Gi", 5, now),
            cached("stale", "10Gi", 31, now),
        ];
        let outcome =
            run_cleanup(&policy(None, None, None), &[], &mut entries, 100 * GI, now).unwrap();
        assert_eq!(outcome.evicted_by_age, vec!["stale".to_string()]);
        assert_eq!(entries[0].status, CachedModelState::Cached);
        assert_eq!(entries[1].status, CachedModelState::Evicted);
        assert!(outcome.next_cleanup > now);
        assert!(outcome.next_cleanup <= now + Duration::days(1));
    }

    #[test]
    fn per_model_retention_overrides_max_age() {
        let now = Utc::now();
        let models = vec![
            model("short", None, Some("2d")),
            model("long", None, Some("90d")),
        ];
        let mut entries = vec![cached("short", "1Gi", 3, now), cached("long", "1Gi", 60, now)];
        let outcome =
            run_cleanup(&policy(Some("30d"), None, None), &models, &mut entries, 100 * GI, now)
                .unwrap();
        assert_eq!(outcome.evicted_by_age, vec!["short".to_string()]);
    }

    #[test]
    fn models_in_use_are_never_evicted() {
        let now = Utc::now();
        let mut busy = cached("busy", "90Gi", 60, now);
        busy.access_count = 2;
        let mut entries = vec![busy];
        let outcome = run_cleanup(
            &policy(Some("1d"), Some("50Gi"), None),
            &[],
            &mut entries,
            100 * GI,
            now,
        )
        .unwrap();
        assert_eq!(outcome.evicted(), 0);
        assert_eq!(entries[0].status, CachedModelState::Cached);
    }

    #[test]
    fn free_space_eviction_stops_once_satisfied() {
        let now = Utc::now();
        let mut entries = vec![
            cached("a", "30Gi", 3, now),
            cached("b", "30Gi", 1, now),
            cached("c", "30Gi", 2, now),
        ];
        // 90Gi used of 100Gi; need 40Gi free: evicting one LRU entry is enough
        let outcome = run_cleanup(
            &policy(None, Some("40Gi"), None),
            &[],
            &mut entries,
            100 * GI,
            now,
        )
        .unwrap();
        assert_eq!(outcome.evicted_for_space, vec!["a".to_string()]);
        assert_eq!(used_bytes(&entries), 60 * GI);
    }

    #[test]
    fn largest_strategy_evicts_biggest_first() {
        let now = Utc::now();
        let mut entries = vec![cached("small", "10Gi", 9, now), cached("big", "60Gi", 1, now)];
        let outcome = run_cleanup(
            &policy(None, Some("50Gi"), Some("largest")),
            &[],
            &mut entries,
            100 * GI,
            now,
        )
        .unwrap();
        assert_eq!(outcome.evicted_for_space, vec!["big".to_string()]);
    }

    #[test]
    fn oldest_strategy_uses_cached_at() {
        let now = Utc::now();
        let mut first = cached("first", "40Gi", 0, now);
        first.cached_at = Some(now - Duration::days(20));
        let mut second = cached("second", "40Gi", 5, now);
        second.cached_at = Some(now - Duration::days(10));
        let mut entries = vec![second, first];
        let outcome = run_cleanup(
            &policy(None, Some("50Gi"), Some("oldest")),
            &[],
            &mut entries,
            100 * GI,
            now,
        )
        .unwrap();
        assert_eq!(outcome.evicted_for_space, vec!["first".to_string()]);
    }

    #[test]
    fn low_priority_goes_first_and_high_last() {
        let now = Utc::now();
        let models = vec![
            model("keep", Some("high"), None),
            model("drop", Some("low"), None),
        ];
        let mut entries = vec![
            cached("keep", "30Gi", 9, now),
            cached("normal", "30Gi", 8, now),
            cached("drop", "30Gi", 1, now),
        ];
        let outcome = run_cleanup(
            &policy(None, Some("70Gi"), None),
            &models,
            &mut entries,
            100 * GI,
            now,
        )
        .unwrap();
        assert_eq!(
            outcome.evicted_for_space,
            vec!["drop".to_string(), "normal".to_string()]
        );
        assert_eq!(entries[0].status, CachedModelState::Cached);
    }

    #[test]
    fn invalid_policy_evicts_nothing() {
        let now = Utc::now();
        let mut entries = vec![cached("stale", "10Gi", 90, now)];
        let result = run_cleanup(
            &policy(None, None, Some("random")),
            &[],
            &mut entries,
            100 * GI,
            now,
        );
        assert!(result.is_err());
        assert_eq!(entries[0].status, CachedModelState::Cached);
    }

    #[test]
    fn strategy_names_are_case_insensitive() {
        assert_eq!("LRU".parse::<EvictionStrategy>().unwrap(), EvictionStrategy::Lru);
        assert_eq!(
            "Largest".parse::<EvictionStrategy>().unwrap(),
            EvictionStrategy::Largest
        );
    }
}
