use crate::realtime::types::{NotificationItem, StatsUpdate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartPoint {
    pub t: i64,
    pub v: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartSeries {
    pub label: String,
    pub points: Vec<ChartPoint>,
}

pub fn bucket_open_time(timestamp_ms: i64, bucket_ms: i64) -> i64 {
    if bucket_ms <= 0 {
        return timestamp_ms;
    }
    timestamp_ms - timestamp_ms.rem_euclid(bucket_ms)
}

/// Time-ordered series of one counter across a slice of stats updates;
/// updates without that counter are skipped.
pub fn counter_series(updates: &[StatsUpdate], counter: &str, label: &str) -> ChartSeries {
    let mut points: Vec<ChartPoint> = updates
        .iter()
        .filter_map(|update| {
            update.counters.get(counter).map(|value| ChartPoint {
                t: update.timestamp,
                v: *value,
            })
        })
        .collect();
    points.sort_unstable_by_key(|point| point.t);

    ChartSeries {
        label: label.to_string(),
        points,
    }
}

/// Event-volume histogram: one point per occupied bucket, aligned to the
/// bucket open time.
pub fn bucket_counts(timestamps: &[i64], bucket_ms: i64) -> Vec<ChartPoint> {
    let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
    for &timestamp in timestamps {
        *counts.entry(bucket_open_time(timestamp, bucket_ms)).or_default() += 1;
    }

    counts
        .into_iter()
        .map(|(t, count)| ChartPoint {
            t,
            v: count as f64,
        })
        .collect()
}

pub fn notification_volume_series(
    items: &[NotificationItem],
    bucket_ms: i64,
    label: &str,
) -> ChartSeries {
    let timestamps: Vec<i64> = items.iter().map(|item| item.timestamp).collect();
    ChartSeries {
        label: label.to_string(),
        points: bucket_counts(&timestamps, bucket_ms),
    }
}
