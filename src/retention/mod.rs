//! Tiered retention over one backend's artifact set.
//!
//! Every tier with count `k` keeps the newest artifact of each of its `k` most
//! recent buckets. On top of that, tiers are walked from the finest
//! granularity to the coarsest and each one also selects the first `k` buckets
//! that no already-selected artifact falls into, keeping the newest artifact of
//! each. A backup kept by the daily tier thus stands in for its week, month and
//! year, and coarser tiers reach further back instead of only re-keeping the
//! same recent backups. The keep set is the union of both selections.
//!
//! A positive `max_backups` replaces the tiers entirely: the newest `max`
//! artifacts are kept. A policy with no tier counts and no maximum keeps
//! everything.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::storage::Artifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Tier {
    /// Evaluation order, finest first.
    pub const ALL: [Tier; 6] = [
        Tier::Minutely,
        Tier::Hourly,
        Tier::Daily,
        Tier::Weekly,
        Tier::Monthly,
        Tier::Yearly,
    ];

    /// Maps a timestamp to this tier's bucket, computed in `tz`.
    pub fn bucket(self, at: DateTime<Utc>, tz: &Tz) -> BucketKey {
        let local = at.with_timezone(tz);
        match self {
            Tier::Yearly => BucketKey(local.year(), 0, 0, 0, 0),
            Tier::Monthly => BucketKey(local.year(), local.month(), 0, 0, 0),
            Tier::Weekly => {
                let week = local.iso_week();
                BucketKey(week.year(), week.week(), 0, 0, 0)
            }
            Tier::Daily => BucketKey(local.year(), local.month(), local.day(), 0, 0),
            Tier::Hourly => BucketKey(local.year(), local.month(), local.day(), local.hour(), 0),
            Tier::Minutely => BucketKey(
                local.year(),
                local.month(),
                local.day(),
                local.hour(),
                local.minute(),
            ),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Minutely => "minutely",
            Tier::Hourly => "hourly",
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
            Tier::Yearly => "yearly",
        };
        f.write_str(name)
    }
}

/// Opaque per-tier grouping key. Only compared within one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey(i32, u32, u32, u32, u32);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionPolicy {
    pub yearly: u32,
    pub monthly: u32,
    pub weekly: u32,
    pub daily: u32,
    pub hourly: u32,
    pub minutely: u32,
    /// Keep only the newest N artifacts when set and positive.
    pub max_backups: Option<u32>,
}

impl RetentionPolicy {
    pub fn count(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Yearly => self.yearly,
            Tier::Monthly => self.monthly,
            Tier::Weekly => self.weekly,
            Tier::Daily => self.daily,
            Tier::Hourly => self.hourly,
            Tier::Minutely => self.minutely,
        }
    }

    pub fn max_override(&self) -> Option<usize> {
        self.max_backups.filter(|max| *max > 0).map(|max| max as usize)
    }

    /// True when nothing would ever be pruned.
    pub fn is_unrestricted(&self) -> bool {
        self.max_override().is_none() && Tier::ALL.iter().all(|tier| self.count(*tier) == 0)
    }
}

/// A partition of the input artifacts. Both sides are ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionDecision {
    pub keep: Vec<Artifact>,
    pub delete: Vec<Artifact>,
}

/// Removes duplicate names and orders newest first, breaking exact timestamp
/// ties by name so the outcome never depends on listing order.
fn normalize(artifacts: &[Artifact]) -> Vec<Artifact> {
    let mut seen = HashSet::new();
    let mut unique: Vec<Artifact> = artifacts
        .iter()
        .filter(|a| seen.insert((a.backend, a.name.clone())))
        .cloned()
        .collect();
    unique.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });
    unique
}

/// Decides which artifacts of a single backend survive `policy`.
pub fn evaluate(artifacts: &[Artifact], policy: &RetentionPolicy, tz: &Tz) -> RetentionDecision {
    let sorted = normalize(artifacts);
    if sorted.is_empty() || policy.is_unrestricted() {
        return RetentionDecision {
            keep: sorted,
            delete: Vec::new(),
        };
    }

    let mut kept = vec![false; sorted.len()];
    if let Some(max) = policy.max_override() {
        kept.iter_mut().take(max).for_each(|k| *k = true);
    } else {
        let tiers: Vec<(Tier, usize)> = Tier::ALL
            .into_iter()
            .map(|tier| (tier, policy.count(tier) as usize))
            .filter(|(_, count)| *count > 0)
            .collect();
        for &(tier, count) in &tiers {
            select_tier(&sorted, &mut kept, tier, count, tz);
        }
        for &(tier, count) in &tiers {
            keep_recent_buckets(&sorted, &mut kept, tier, count, tz);
        }
    }

    let mut decision = RetentionDecision::default();
    for (artifact, keep) in sorted.into_iter().zip(kept) {
        if keep {
            decision.keep.push(artifact);
        } else {
            decision.delete.push(artifact);
        }
    }
    decision
}

fn select_tier(sorted: &[Artifact], kept: &mut [bool], tier: Tier, count: usize, tz: &Tz) {
    let represented: HashSet<BucketKey> = sorted
        .iter()
        .zip(kept.iter())
        .filter(|(_, keep)| **keep)
        .map(|(artifact, _)| tier.bucket(artifact.created_at, tz))
        .collect();

    let mut selected = HashSet::new();
    for (index, artifact) in sorted.iter().enumerate() {
        if selected.len() == count {
            break;
        }
        let key = tier.bucket(artifact.created_at, tz);
        if represented.contains(&key) || selected.contains(&key) {
            continue;
        }
        // Input is newest first, so the first hit is the bucket's newest artifact.
        selected.insert(key);
        kept[index] = true;
    }
}

/// Marks the newest artifact of each of the `count` most recent buckets,
/// whether or not another tier already covers the bucket.
fn keep_recent_buckets(sorted: &[Artifact], kept: &mut [bool], tier: Tier, count: usize, tz: &Tz) {
    let mut seen = HashSet::new();
    for (index, artifact) in sorted.iter().enumerate() {
        if seen.insert(tier.bucket(artifact.created_at, tz)) {
            if seen.len() > count {
                break;
            }
            kept[index] = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackendKind, artifact_name};
    use chrono::{Duration, TimeZone};

    fn artifact_at(at: DateTime<Utc>) -> Artifact {
        Artifact::from_name(BackendKind::Local, "db", &artifact_name("db", at)).unwrap()
    }

    fn daily_series(newest: DateTime<Utc>, days: i64) -> Vec<Artifact> {
        (0..days).map(|d| artifact_at(newest - Duration::days(d))).collect()
    }

    fn names(artifacts: &[Artifact]) -> Vec<String> {
        artifacts.iter().map(|a| a.name.clone()).collect()
    }

    fn assert_partition(input: &[Artifact], decision: &RetentionDecision) {
        let mut all: Vec<String> = names(&decision.keep);
        all.extend(names(&decision.delete));
        all.sort();
        let mut expected = names(input);
        expected.sort();
        expected.dedup();
        assert_eq!(all, expected, "keep and delete must cover the input exactly once");
    }

    #[test]
    fn test_empty_input() {
        let policy = RetentionPolicy { daily: 3, ..Default::default() };
        let decision = evaluate(&[], &policy, &Tz::UTC);
        assert!(decision.keep.is_empty());
        assert!(decision.delete.is_empty());
    }

    #[test]
    fn test_daily_and_weekly_with_gap() {
        // Scenario: today, yesterday and eight days ago with daily=2, weekly=1.
        let today = Utc.with_ymd_and_hms(2025, 6, 11, 2, 0, 0).unwrap();
        let input = vec![
            artifact_at(today),
            artifact_at(today - Duration::days(1)),
            artifact_at(today - Duration::days(8)),
        ];
        let policy = RetentionPolicy { daily: 2, weekly: 1, ..Default::default() };

        let decision = evaluate(&input, &policy, &Tz::UTC);
        assert_eq!(decision.keep.len(), 3);
        assert!(decision.delete.is_empty());
    }

    #[test]
    fn test_daily_and_weekly_over_ten_days() {
        // Every weekday as "today" must yield the same shape of result.
        for offset in 0..7 {
            let today = Utc.with_ymd_and_hms(2025, 6, 9, 2, 0, 0).unwrap() + Duration::days(offset);
            let input = daily_series(today, 10);
            let policy = RetentionPolicy { daily: 2, weekly: 1, ..Default::default() };

            let decision = evaluate(&input, &policy, &Tz::UTC);
            assert_partition(&input, &decision);
            assert_eq!(decision.keep.len(), 3, "today = {}", today);
            assert_eq!(decision.delete.len(), 7);
            assert_eq!(decision.keep[0].created_at, today);
            assert_eq!(decision.keep[1].created_at, today - Duration::days(1));

            // The weekly pick is the newest backup of a week not already covered.
            let weekly_pick = &decision.keep[2];
            let covered: HashSet<_> = decision.keep[..2]
                .iter()
                .map(|a| Tier::Weekly.bucket(a.created_at, &Tz::UTC))
                .collect();
            assert!(!covered.contains(&Tier::Weekly.bucket(weekly_pick.created_at, &Tz::UTC)));
        }
    }

    #[test]
    fn test_max_override_keeps_newest() {
        let newest = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let input = daily_series(newest, 6);
        let policy = RetentionPolicy {
            yearly: 5,
            daily: 10,
            max_backups: Some(2),
            ..Default::default()
        };

        let decision = evaluate(&input, &policy, &Tz::UTC);
        assert_eq!(names(&decision.keep), names(&input[..2]));
        assert_eq!(decision.delete.len(), 4);
    }

    #[test]
    fn test_max_override_with_fewer_artifacts() {
        let newest = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let input = daily_series(newest, 3);
        let policy = RetentionPolicy { max_backups: Some(5), ..Default::default() };

        let decision = evaluate(&input, &policy, &Tz::UTC);
        assert_eq!(decision.keep.len(), 3);
        assert!(decision.delete.is_empty());
    }

    #[test]
    fn test_zero_max_falls_back_to_tiers() {
        let newest = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let input = daily_series(newest, 4);
        let policy = RetentionPolicy { daily: 1, max_backups: Some(0), ..Default::default() };

        let decision = evaluate(&input, &policy, &Tz::UTC);
        assert_eq!(decision.keep.len(), 1);
        assert_eq!(decision.delete.len(), 3);
    }

    #[test]
    fn test_unrestricted_policy_keeps_everything() {
        let newest = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let input = daily_series(newest, 4);
        let decision = evaluate(&input, &RetentionPolicy::default(), &Tz::UTC);
        assert_eq!(decision.keep.len(), 4);
        assert!(decision.delete.is_empty());
    }

    #[test]
    fn test_newest_in_bucket_wins() {
        let day = Utc.with_ymd_and_hms(2025, 5, 5, 0, 0, 0).unwrap();
        let input = vec![
            artifact_at(day + Duration::hours(1)),
            artifact_at(day + Duration::hours(9)),
            artifact_at(day + Duration::hours(4)),
        ];
        let policy = RetentionPolicy { daily: 1, ..Default::default() };

        let decision = evaluate(&input, &policy, &Tz::UTC);
        assert_eq!(decision.keep.len(), 1);
        assert_eq!(decision.keep[0].created_at, day + Duration::hours(9));
    }

    #[test]
    fn test_fewer_buckets_than_count() {
        let newest = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let input = daily_series(newest, 2);
        let policy = RetentionPolicy { daily: 7, monthly: 12, yearly: 3, ..Default::default() };

        let decision = evaluate(&input, &policy, &Tz::UTC);
        assert_eq!(decision.keep.len(), 2);
        assert!(decision.delete.is_empty());
    }

    #[test]
    fn test_duplicates_and_order_are_normalized() {
        let newest = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let mut input = daily_series(newest, 5);
        input.reverse();
        input.push(input[0].clone());
        let policy = RetentionPolicy { daily: 2, ..Default::default() };

        let decision = evaluate(&input, &policy, &Tz::UTC);
        assert_partition(&input, &decision);
        assert_eq!(decision.keep[0].created_at, newest);
        assert_eq!(decision.keep.len() + decision.delete.len(), 5);
    }

    #[test]
    fn test_identical_timestamps_break_ties_by_name() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let mut first = artifact_at(at);
        first.name = "db-a".to_string();
        let mut second = artifact_at(at);
        second.name = "db-b".to_string();
        let policy = RetentionPolicy { daily: 1, ..Default::default() };

        let forward = evaluate(&[first.clone(), second.clone()], &policy, &Tz::UTC);
        let backward = evaluate(&[second, first], &policy, &Tz::UTC);
        assert_eq!(forward, backward);
        assert_eq!(forward.keep[0].name, "db-b");
    }

    #[test]
    fn test_buckets_follow_configured_timezone() {
        // 23:30 UTC on Jan 1 is already Jan 2 in Tokyo.
        let late = Utc.with_ymd_and_hms(2025, 1, 1, 23, 30, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap();
        let input = vec![artifact_at(late), artifact_at(early)];
        let policy = RetentionPolicy { daily: 2, ..Default::default() };

        let utc = evaluate(&input, &policy, &Tz::UTC);
        assert_eq!(names(&utc.keep), vec![artifact_at(late).name]);
        let tokyo = evaluate(&input, &policy, &chrono_tz::Asia::Tokyo);
        assert_eq!(tokyo.keep.len(), 2);
        assert_eq!(
            Tier::Daily.bucket(late, &chrono_tz::Asia::Tokyo),
            Tier::Daily.bucket(late + Duration::hours(10), &chrono_tz::Asia::Tokyo)
        );
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let newest = Utc.with_ymd_and_hms(2025, 9, 17, 13, 45, 0).unwrap();
        // Hourly backups for ~100 days.
        let input: Vec<Artifact> = (0..2400)
            .map(|h| artifact_at(newest - Duration::hours(h)))
            .collect();
        let policy = RetentionPolicy {
            yearly: 2,
            monthly: 3,
            weekly: 4,
            daily: 5,
            hourly: 6,
            minutely: 2,
            max_backups: None,
        };

        let first = evaluate(&input, &policy, &chrono_tz::Europe::Berlin);
        assert_partition(&input, &first);
        // Each tier contributes its recent buckets plus at most as many older ones.
        let sum: u32 = Tier::ALL.iter().map(|t| policy.count(*t)).sum();
        assert!(first.keep.len() <= 2 * sum as usize);

        let second = evaluate(&first.keep, &policy, &chrono_tz::Europe::Berlin);
        assert_eq!(second.keep, first.keep);
        assert!(second.delete.is_empty());
    }

    #[test]
    fn test_newest_of_each_recent_bucket_survives_coverage_by_finer_tier() {
        // Sep 27 is kept by the weekly tier, which must not hide Sep 30 as the
        // newest September artifact from the monthly tier.
        let at = |m, d| artifact_at(Utc.with_ymd_and_hms(2025, m, d, 2, 0, 0).unwrap());
        let input = vec![at(10, 1), at(9, 30), at(9, 27), at(8, 15)];
        let policy = RetentionPolicy { daily: 1, weekly: 1, monthly: 2, ..Default::default() };

        let decision = evaluate(&input, &policy, &Tz::UTC);
        assert_partition(&input, &decision);
        assert!(decision.keep.contains(&at(9, 30)));
        assert!(decision.keep.contains(&at(9, 27)));
        assert!(decision.keep.contains(&at(10, 1)));

        for tier in Tier::ALL {
            let count = policy.count(tier) as usize;
            let mut buckets = Vec::new();
            for artifact in &input {
                let key = tier.bucket(artifact.created_at, &Tz::UTC);
                if buckets.len() < count && !buckets.contains(&key) {
                    buckets.push(key);
                    assert!(decision.keep.contains(artifact), "{} newest of bucket deleted", tier);
                }
            }
        }

        let again = evaluate(&decision.keep, &policy, &Tz::UTC);
        assert_eq!(again.keep, decision.keep);
    }

    #[test]
    fn test_max_override_dominance() {
        let newest = Utc.with_ymd_and_hms(2025, 9, 17, 0, 0, 0).unwrap();
        for size in 0..8 {
            let input = daily_series(newest, size);
            for max in 1..5u32 {
                let policy = RetentionPolicy {
                    weekly: 3,
                    max_backups: Some(max),
                    ..Default::default()
                };
                let decision = evaluate(&input, &policy, &Tz::UTC);
                assert_eq!(decision.keep.len(), (size as usize).min(max as usize));
            }
        }
    }
}
