//! Circuit breaker in front of rule execution.
//!
//! The tracker re-emits an event for every write the engine makes, so the
//! same rule can be re-triggered on the same work item indefinitely. The
//! guard rejects executions that come too fast, too often in one hour, or
//! with the same relevant field values as the previous run.
//!
//! All bookkeeping lives in one [`GuardState`] behind one mutex: every
//! admission, record and sweep is a single critical section. Admission
//! reserves the slot it grants, so two concurrent events for the same rule
//! and work item cannot both pass the checks.

use crate::context::{keys, WorkItemContext};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// GuardConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: u32,
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_min_interval() -> u64 {
    5
}

fn default_max_per_hour() -> u32 {
    20
}

fn default_duplicate_window() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_retention() -> u64 {
    1800
}

fn default_max_entries() -> usize {
    500
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval(),
            max_per_hour: default_max_per_hour(),
            duplicate_window_secs: default_duplicate_window(),
            sweep_interval_secs: default_sweep_interval(),
            retention_secs: default_retention(),
            max_entries: default_max_entries(),
        }
    }
}

/// Longest duration any guard or throttle setting is honoured with. Larger
/// values are clamped; `Config::validate` reports them.
pub const MAX_DURATION_SECS: u64 = 366 * 24 * 3600;

fn secs(n: u64) -> TimeDelta {
    TimeDelta::try_seconds(n.min(MAX_DURATION_SECS) as i64).unwrap_or(TimeDelta::MAX)
}

fn hour_bucket(t: DateTime<Utc>) -> i64 {
    t.timestamp().div_euclid(3600)
}

// ---------------------------------------------------------------------------
// Fields hash
// ---------------------------------------------------------------------------

const RELEVANT_FIELDS: [&str; 4] = [
    keys::STATE,
    keys::ASSIGNED_TO,
    keys::AREA_PATH,
    keys::TITLE,
];

/// Digest of the fields whose change should allow a re-run. Key order is
/// fixed, so the hash does not depend on payload ordering.
pub fn fields_hash(ctx: &WorkItemContext) -> String {
    let joined = RELEVANT_FIELDS
        .iter()
        .map(|key| match ctx.get(key) {
            Some(v) if !v.is_null() => format!("{key}:{v}"),
            _ => format!("{key}:null"),
        })
        .collect::<Vec<_>>()
        .join("|");
    let digest = Sha256::digest(joined.as_bytes());
    let mut encoded = BASE64.encode(digest);
    encoded.truncate(16);
    encoded
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuleKey {
    rule: String,
    work_item: i64,
}

impl RuleKey {
    fn new(rule: &str, work_item: i64) -> Self {
        Self {
            rule: rule.to_string(),
            work_item,
        }
    }
}

#[derive(Debug, Clone)]
struct FieldsStamp {
    hash: String,
    at: DateTime<Utc>,
}

/// What an admission overwrote, restored if the execution is released.
#[derive(Debug, Clone)]
struct Reservation {
    last_run: Option<DateTime<Utc>>,
    hash: Option<FieldsStamp>,
    hour: i64,
}

#[derive(Debug)]
struct GuardState {
    last_run: HashMap<RuleKey, DateTime<Utc>>,
    hourly: HashMap<(RuleKey, i64), u32>,
    hashes: HashMap<RuleKey, FieldsStamp>,
    reserved: HashMap<RuleKey, Reservation>,
    last_sweep: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Interval,
    HourlyLimit,
    DuplicateFields,
}

impl BlockReason {
    pub fn describe(self) -> &'static str {
        match self {
            BlockReason::Interval => "minimum interval not elapsed",
            BlockReason::HourlyLimit => "hourly execution limit reached",
            BlockReason::DuplicateFields => "same field values as previous run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Blocked(BlockReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub timestamps: usize,
    pub hourly_counters: usize,
    pub field_hashes: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.timestamps + self.hourly_counters + self.field_hashes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardStats {
    pub timestamps: usize,
    pub hourly_counters: usize,
    pub field_hashes: usize,
    pub last_sweep: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ExecutionGuard
// ---------------------------------------------------------------------------

pub struct ExecutionGuard {
    config: GuardConfig,
    state: Mutex<GuardState>,
}

impl ExecutionGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self::starting_at(config, Utc::now())
    }

    /// Guard whose sweep clock starts at `now`; lets tests drive time.
    pub fn starting_at(config: GuardConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            state: Mutex::new(GuardState {
                last_run: HashMap::new(),
                hourly: HashMap::new(),
                hashes: HashMap::new(),
                reserved: HashMap::new(),
                last_sweep: now,
            }),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        // Every mutation leaves the maps consistent, so a poisoned lock is
        // still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read-only admission decision; nothing is reserved.
    pub fn check(&self, rule: &str, work_item: i64, hash: &str) -> Admission {
        self.check_at(rule, work_item, hash, Utc::now())
    }

    pub fn check_at(&self, rule: &str, work_item: i64, hash: &str, now: DateTime<Utc>) -> Admission {
        let mut state = self.lock();
        self.admission_locked(&mut state, rule, work_item, hash, now)
    }

    /// Check and reserve in one critical section.
    ///
    /// An allowed execution immediately stamps the run time, the field hash
    /// and the hourly counter. Finish it with [`ExecutionGuard::record`]
    /// when the rule passed, or give the slot back with
    /// [`ExecutionGuard::release`] when it did not.
    pub fn try_admit(&self, rule: &str, work_item: i64, hash: &str) -> Admission {
        self.try_admit_at(rule, work_item, hash, Utc::now())
    }

    pub fn try_admit_at(
        &self,
        rule: &str,
        work_item: i64,
        hash: &str,
        now: DateTime<Utc>,
    ) -> Admission {
        let mut state = self.lock();
        let admission = self.admission_locked(&mut state, rule, work_item, hash, now);
        if admission == Admission::Allowed {
            let key = RuleKey::new(rule, work_item);
            let hour = hour_bucket(now);
            let previous_run = state.last_run.insert(key.clone(), now);
            let previous_hash = state.hashes.insert(
                key.clone(),
                FieldsStamp {
                    hash: hash.to_string(),
                    at: now,
                },
            );
            *state.hourly.entry((key.clone(), hour)).or_insert(0) += 1;
            state.reserved.insert(
                key,
                Reservation {
                    last_run: previous_run,
                    hash: previous_hash,
                    hour,
                },
            );
            self.prune_if_over_cap(&mut state, now);
        }
        admission
    }

    /// Undo an admission whose execution did not pass. A no-op when nothing
    /// is reserved for the pair.
    pub fn release(&self, rule: &str, work_item: i64) {
        let mut state = self.lock();
        let key = RuleKey::new(rule, work_item);
        let Some(reservation) = state.reserved.remove(&key) else {
            return;
        };
        match reservation.last_run {
            Some(t) => state.last_run.insert(key.clone(), t),
            None => state.last_run.remove(&key),
        };
        match reservation.hash {
            Some(stamp) => state.hashes.insert(key.clone(), stamp),
            None => state.hashes.remove(&key),
        };
        let bucket = (key, reservation.hour);
        if let Some(count) = state.hourly.get_mut(&bucket) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.hourly.remove(&bucket);
            }
        }
        debug!(work_item, rule = %rule, "guard reservation released");
    }

    fn admission_locked(
        &self,
        state: &mut GuardState,
        rule: &str,
        work_item: i64,
        hash: &str,
        now: DateTime<Utc>,
    ) -> Admission {
        if now - state.last_sweep >= secs(self.config.sweep_interval_secs) {
            self.sweep_locked(state, now);
        }

        let key = RuleKey::new(rule, work_item);
        if let Some(last) = state.last_run.get(&key) {
            if now - *last < secs(self.config.min_interval_secs) {
                return self.blocked(rule, work_item, BlockReason::Interval);
            }
        }

        let count = state
            .hourly
            .get(&(key.clone(), hour_bucket(now)))
            .copied()
            .unwrap_or(0);
        if count >= self.config.max_per_hour {
            return self.blocked(rule, work_item, BlockReason::HourlyLimit);
        }

        if let Some(stamp) = state.hashes.get(&key) {
            if stamp.hash == hash && now - stamp.at < secs(self.config.duplicate_window_secs) {
                return self.blocked(rule, work_item, BlockReason::DuplicateFields);
            }
        }

        Admission::Allowed
    }

    fn blocked(&self, rule: &str, work_item: i64, reason: BlockReason) -> Admission {
        warn!(work_item, rule = %rule, "execution blocked: {}", reason.describe());
        Admission::Blocked(reason)
    }

    pub fn record(&self, rule: &str, work_item: i64, hash: &str) {
        self.record_at(rule, work_item, hash, Utc::now());
    }

    /// Stamp a passed execution. Completes the pair's reservation when
    /// there is one; otherwise counts a fresh run.
    pub fn record_at(&self, rule: &str, work_item: i64, hash: &str, now: DateTime<Utc>) {
        let mut state = self.lock();
        let key = RuleKey::new(rule, work_item);
        let reserved = state.reserved.remove(&key).is_some();
        state.last_run.insert(key.clone(), now);
        if !reserved {
            *state
                .hourly
                .entry((key.clone(), hour_bucket(now)))
                .or_insert(0) += 1;
        }
        state.hashes.insert(
            key,
            FieldsStamp {
                hash: hash.to_string(),
                at: now,
            },
        );
        self.prune_if_over_cap(&mut state, now);
    }

    fn prune_if_over_cap(&self, state: &mut GuardState, now: DateTime<Utc>) {
        let cap = self.config.max_entries;
        if state.last_run.len() > cap || state.hourly.len() > cap || state.hashes.len() > cap {
            let removed = self.prune_locked(state, now);
            info!(removed = removed.total(), "guard maps over capacity, pruned");
        }
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// Retention eviction followed by a capacity prune.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut state = self.lock();
        self.sweep_locked(&mut state, now)
    }

    fn sweep_locked(&self, state: &mut GuardState, now: DateTime<Utc>) -> SweepReport {
        let cutoff = now - secs(self.config.retention_secs);
        let current_hour = hour_bucket(now);
        let mut report = SweepReport::default();

        let before = state.last_run.len();
        state.last_run.retain(|_, t| *t >= cutoff);
        report.timestamps = before - state.last_run.len();

        let before = state.hourly.len();
        state.hourly.retain(|(_, hour), _| *hour >= current_hour - 1);
        report.hourly_counters = before - state.hourly.len();

        let before = state.hashes.len();
        let live = &state.last_run;
        state
            .hashes
            .retain(|key, stamp| stamp.at >= cutoff && live.contains_key(key));
        report.field_hashes = before - state.hashes.len();

        let pruned = self.prune_locked(state, now);
        report.timestamps += pruned.timestamps;
        report.hourly_counters += pruned.hourly_counters;
        report.field_hashes += pruned.field_hashes;
        state.last_sweep = now;

        if report.total() > 0 {
            info!(
                timestamps = report.timestamps,
                hourly_counters = report.hourly_counters,
                field_hashes = report.field_hashes,
                "guard sweep removed entries"
            );
        } else {
            debug!("guard sweep: nothing to remove");
        }
        report
    }

    /// Bring every map back under the cap: oldest half of the timestamps,
    /// counters outside the current and previous hour, and hashes limited
    /// to the most recently active half of the live keys.
    fn prune_locked(&self, state: &mut GuardState, now: DateTime<Utc>) -> SweepReport {
        let cap = self.config.max_entries;
        let half = cap / 2;
        let mut report = SweepReport::default();

        if state.last_run.len() > cap {
            let mut by_age: Vec<(RuleKey, DateTime<Utc>)> = state
                .last_run
                .iter()
                .map(|(k, t)| (k.clone(), *t))
                .collect();
            by_age.sort_by_key(|(_, t)| *t);
            let drop = by_age.len() / 2;
            for (key, _) in by_age.into_iter().take(drop) {
                state.last_run.remove(&key);
            }
            report.timestamps = drop;
        }

        if state.hourly.len() > cap {
            let before = state.hourly.len();
            let current_hour = hour_bucket(now);
            state.hourly.retain(|(_, hour), _| *hour >= current_hour - 1);
            if state.hourly.len() > cap {
                let mut entries: Vec<((RuleKey, i64), u32)> =
                    state.hourly.drain().collect();
                // Newest hour first, then busiest counters.
                entries.sort_by(|a, b| b.0 .1.cmp(&a.0 .1).then(b.1.cmp(&a.1)));
                entries.truncate(half);
                state.hourly.extend(entries);
            }
            report.hourly_counters = before - state.hourly.len();
        }

        if state.hashes.len() > cap {
            let before = state.hashes.len();
            let mut live: Vec<(&RuleKey, &DateTime<Utc>)> = state
                .last_run
                .iter()
                .filter(|(k, _)| state.hashes.contains_key(*k))
                .collect();
            live.sort_by(|a, b| b.1.cmp(a.1));
            let keep: HashSet<RuleKey> =
                live.into_iter().take(half).map(|(k, _)| k.clone()).collect();
            state.hashes.retain(|k, _| keep.contains(k));
            report.field_hashes = before - state.hashes.len();
        }

        let live = &state.last_run;
        state.reserved.retain(|key, _| live.contains_key(key));
        report
    }

    pub fn stats(&self) -> GuardStats {
        let state = self.lock();
        GuardStats {
            timestamps: state.last_run.len(),
            hourly_counters: state.hourly.len(),
            field_hashes: state.hashes.len(),
            last_sweep: state.last_sweep,
        }
    }
}

/// Run [`ExecutionGuard::sweep`] every `sweep_interval_secs` on the tokio
/// runtime until the handle is aborted.
pub fn spawn_sweeper(guard: Arc<ExecutionGuard>) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(
        guard
            .config()
            .sweep_interval_secs
            .clamp(1, MAX_DURATION_SECS),
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            guard.sweep();
        }
    })
}

// ---------------------------------------------------------------------------
// EventThrottle
// ---------------------------------------------------------------------------

/// Per-work-item rate limit applied to inbound events before any rule is
/// considered.
pub struct EventThrottle {
    min_interval: TimeDelta,
    max_entries: usize,
    last_seen: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl EventThrottle {
    pub fn new(min_interval_secs: u64, max_entries: usize) -> Self {
        Self {
            min_interval: secs(min_interval_secs),
            max_entries: max_entries.max(1),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, work_item: i64) -> bool {
        self.admit_at(work_item, Utc::now())
    }

    /// `false` when the previous admitted event for this work item is
    /// more recent than the minimum interval.
    pub fn admit_at(&self, work_item: i64, now: DateTime<Utc>) -> bool {
        let mut seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = seen.get(&work_item) {
            if now - *last < self.min_interval {
                warn!(work_item, "event rate limited");
                return false;
            }
        }
        seen.insert(work_item, now);

        if seen.len() > self.max_entries {
            let cutoff = now - self.min_interval;
            seen.retain(|_, t| *t >= cutoff);
            if seen.len() > self.max_entries {
                let mut by_age: Vec<(i64, DateTime<Utc>)> =
                    seen.iter().map(|(k, t)| (*k, *t)).collect();
                by_age.sort_by_key(|(_, t)| *t);
                for (id, _) in by_age.iter().take(by_age.len() / 2) {
                    seen.remove(id);
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.last_seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 15, 0).unwrap()
    }

    fn at(offset_secs: i64) -> DateTime<Utc> {
        t0() + TimeDelta::seconds(offset_secs)
    }

    fn guard() -> ExecutionGuard {
        ExecutionGuard::starting_at(GuardConfig::default(), t0())
    }

    #[test]
    fn interval_blocks_second_run() {
        let g = guard();
        assert_eq!(g.check_at("r", 1, "h", at(0)), Admission::Allowed);
        g.record_at("r", 1, "h", at(0));
        assert_eq!(
            g.check_at("r", 1, "h2", at(4)),
            Admission::Blocked(BlockReason::Interval)
        );
        assert_eq!(g.check_at("r", 1, "h2", at(5)), Admission::Allowed);
        // Other rules and work items are independent.
        assert_eq!(g.check_at("other", 1, "h", at(1)), Admission::Allowed);
        assert_eq!(g.check_at("r", 2, "h", at(1)), Admission::Allowed);
    }

    #[test]
    fn duplicate_fields_block_inside_window() {
        let g = guard();
        g.record_at("r", 1, "same", at(0));
        assert_eq!(
            g.check_at("r", 1, "same", at(7)),
            Admission::Blocked(BlockReason::DuplicateFields)
        );
        assert_eq!(g.check_at("r", 1, "changed", at(7)), Admission::Allowed);
        assert_eq!(g.check_at("r", 1, "same", at(10)), Admission::Allowed);
    }

    #[test]
    fn hourly_limit() {
        let config = GuardConfig {
            min_interval_secs: 0,
            duplicate_window_secs: 0,
            ..GuardConfig::default()
        };
        let g = ExecutionGuard::starting_at(config, t0());
        for i in 0..20 {
            assert_eq!(g.check_at("r", 1, "h", at(i)), Admission::Allowed);
            g.record_at("r", 1, "h", at(i));
        }
        assert_eq!(
            g.check_at("r", 1, "h", at(30)),
            Admission::Blocked(BlockReason::HourlyLimit)
        );
        // A new hour starts a fresh bucket.
        assert_eq!(g.check_at("r", 1, "h", at(3600)), Admission::Allowed);
    }

    #[test]
    fn sweep_under_cap_within_retention_removes_nothing() {
        let g = guard();
        for i in 0..10 {
            g.record_at("r", i, "h", at(i));
        }
        let report = g.sweep_at(at(60));
        assert_eq!(report, SweepReport::default());
        assert_eq!(g.stats().timestamps, 10);
    }

    #[test]
    fn sweep_evicts_past_retention() {
        let g = guard();
        g.record_at("old", 1, "h", at(0));
        g.record_at("new", 1, "h", at(1700));
        let report = g.sweep_at(at(1900));
        assert_eq!(report.timestamps, 1);
        assert_eq!(report.field_hashes, 1);
        let stats = g.stats();
        assert_eq!(stats.timestamps, 1);
        assert_eq!(stats.field_hashes, 1);
    }

    #[test]
    fn maps_stay_under_cap() {
        let config = GuardConfig {
            max_entries: 20,
            ..GuardConfig::default()
        };
        let g = ExecutionGuard::starting_at(config, t0());
        for i in 0..200 {
            g.record_at("r", i, "h", at(i));
            let stats = g.stats();
            assert!(stats.timestamps <= 20, "timestamps {}", stats.timestamps);
            assert!(stats.hourly_counters <= 20);
            assert!(stats.field_hashes <= 20);
        }
        g.sweep_at(at(240));
        let stats = g.stats();
        assert!(stats.timestamps <= 20);
        assert!(stats.field_hashes <= stats.timestamps);
    }

    #[test]
    fn opportunistic_sweep_runs_on_check() {
        let g = guard();
        g.record_at("r", 1, "h", at(0));
        g.check_at("x", 9, "h", at(4000));
        let stats = g.stats();
        assert_eq!(stats.timestamps, 0);
        assert_eq!(stats.last_sweep, at(4000));
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let config = GuardConfig {
            max_entries: 10_000,
            ..GuardConfig::default()
        };
        let g = ExecutionGuard::starting_at(config, t0());
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10 {
                        g.record_at("r", 1, "h", at(1));
                    }
                });
            }
        });
        let state = g.lock();
        let count = state.hourly[&(RuleKey::new("r", 1), hour_bucket(at(1)))];
        assert_eq!(count, 80);
    }

    #[test]
    fn admission_reserves_until_recorded() {
        let g = guard();
        assert_eq!(g.try_admit_at("r", 1, "h", at(0)), Admission::Allowed);
        assert_eq!(
            g.try_admit_at("r", 1, "h2", at(1)),
            Admission::Blocked(BlockReason::Interval)
        );
        g.record_at("r", 1, "h", at(2));
        let state = g.lock();
        assert!(state.reserved.is_empty());
        assert_eq!(state.hourly[&(RuleKey::new("r", 1), hour_bucket(at(0)))], 1);
        assert_eq!(state.last_run[&RuleKey::new("r", 1)], at(2));
    }

    #[test]
    fn release_restores_previous_state() {
        let g = guard();
        g.record_at("r", 1, "before", at(0));
        assert_eq!(g.try_admit_at("r", 1, "after", at(20)), Admission::Allowed);
        g.release("r", 1);

        let stats = g.stats();
        assert_eq!(stats.timestamps, 1);
        assert_eq!(stats.field_hashes, 1);
        {
            let state = g.lock();
            let key = RuleKey::new("r", 1);
            assert_eq!(state.last_run[&key], at(0));
            assert_eq!(state.hashes[&key].hash, "before");
            assert_eq!(state.hourly[&(key, hour_bucket(at(0)))], 1);
        }
        // A released slot is immediately available again.
        assert_eq!(g.try_admit_at("r", 1, "after", at(21)), Admission::Allowed);

        // Releasing a first-ever admission leaves nothing behind.
        assert_eq!(g.try_admit_at("fresh", 2, "h", at(21)), Admission::Allowed);
        g.release("fresh", 2);
        g.release("fresh", 2);
        let state = g.lock();
        assert!(!state.last_run.contains_key(&RuleKey::new("fresh", 2)));
        assert!(!state.hashes.contains_key(&RuleKey::new("fresh", 2)));
    }

    #[test]
    fn concurrent_admissions_allow_exactly_one() {
        let g = guard();
        let allowed = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    if g.try_admit_at("r", 42, "h", at(0)) == Admission::Allowed {
                        allowed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(allowed.into_inner(), 1);
    }

    #[test]
    fn huge_durations_are_clamped() {
        let config = GuardConfig {
            min_interval_secs: u64::MAX,
            duplicate_window_secs: u64::MAX,
            retention_secs: u64::MAX,
            sweep_interval_secs: u64::MAX,
            ..GuardConfig::default()
        };
        let g = ExecutionGuard::starting_at(config, t0());
        assert_eq!(g.try_admit_at("r", 1, "h", at(0)), Admission::Allowed);
        g.record_at("r", 1, "h", at(0));
        assert_eq!(
            g.check_at("r", 1, "h", at(86_400)),
            Admission::Blocked(BlockReason::Interval)
        );
        assert_eq!(g.sweep_at(at(60)).total(), 0);

        let th = EventThrottle::new(u64::MAX, 1);
        assert!(th.admit_at(1, at(0)));
        assert!(th.admit_at(2, at(1)));
        assert!(!th.admit_at(2, at(2)));
    }

    #[test]
    fn fields_hash_depends_only_on_relevant_fields() {
        let a = WorkItemContext::new(1)
            .with_field("System.State", "Active")
            .with_field("System.Title", "T")
            .with_field("Custom.Noise", "1");
        let b = WorkItemContext::new(2)
            .with_field("System.Title", "T")
            .with_field("System.State", "Active")
            .with_field("Custom.Noise", "2");
        let c = a.clone().with_field("System.State", "Closed");
        assert_eq!(fields_hash(&a), fields_hash(&b));
        assert_ne!(fields_hash(&a), fields_hash(&c));
        assert_eq!(fields_hash(&a).len(), 16);
    }

    #[test]
    fn throttle_limits_per_work_item() {
        let th = EventThrottle::new(5, 100);
        assert!(th.admit_at(1, at(0)));
        assert!(!th.admit_at(1, at(3)));
        assert!(th.admit_at(2, at(3)));
        assert!(th.admit_at(1, at(5)));
    }

    #[test]
    fn throttle_is_bounded() {
        let th = EventThrottle::new(5, 10);
        for i in 0..100 {
            th.admit_at(i, at(i * 10));
            assert!(th.len() <= 10);
        }
    }

    #[tokio::test]
    async fn sweeper_task_runs_periodically() {
        let config = GuardConfig {
            sweep_interval_secs: 1,
            retention_secs: 0,
            ..GuardConfig::default()
        };
        let g = Arc::new(ExecutionGuard::new(config));
        g.record("r", 1, "h");
        let handle = spawn_sweeper(g.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.abort();
        assert_eq!(g.stats().timestamps, 0);
    }
}
