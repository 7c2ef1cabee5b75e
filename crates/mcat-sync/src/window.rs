use std::collections::BTreeMap;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use mcat_core::{RollingWindow, WindowPoint, DAILY_CAPACITY, HOURLY_CAPACITY};

pub fn day_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::days(1)).unwrap_or(ts)
}

fn newest(points: BTreeMap<DateTime<Utc>, WindowPoint>, capacity: usize) -> Vec<WindowPoint> {
    let skip = points.len().saturating_sub(capacity);
    points.into_values().skip(skip).collect()
}

/// Union by timestamp (incoming wins), ascending, keeping the newest 72.
pub fn fold_hourly(existing: &[WindowPoint], incoming: &[WindowPoint]) -> Vec<WindowPoint> {
    let mut points = BTreeMap::new();
    for point in existing.iter().chain(incoming) {
        points.insert(point.timestamp, point.clone());
    }
    newest(points, HOURLY_CAPACITY)
}

/// A sample qualifies when it carries every field in `required`. A covered
/// day with no qualifying sample is kept as a gap point.
pub fn fold_daily(
    existing: &[WindowPoint],
    hourly: &[WindowPoint],
    required: &[String],
) -> Vec<WindowPoint> {
    let mut buckets: BTreeMap<DateTime<Utc>, Vec<&WindowPoint>> = BTreeMap::new();
    for point in hourly {
        buckets.entry(day_start(point.timestamp)).or_default().push(point);
    }

    let mut days: BTreeMap<DateTime<Utc>, WindowPoint> = existing
        .iter()
        .map(|point| (point.timestamp, point.clone()))
        .collect();
    for (day, samples) in buckets {
        let qualifying = samples
            .into_iter()
            .filter(|p| required.iter().all(|field| p.values.contains_key(field)));
        days.insert(day, daily_mean(day, qualifying));
    }
    newest(days, DAILY_CAPACITY)
}

fn daily_mean<'a>(
    day: DateTime<Utc>,
    samples: impl Iterator<Item = &'a WindowPoint>,
) -> WindowPoint {
    let mut sums: BTreeMap<&str, (f64, u32)> = BTreeMap::new();
    for sample in samples {
        for (field, value) in &sample.values {
            let slot = sums.entry(field.as_str()).or_insert((0.0, 0));
            slot.0 += value;
            slot.1 += 1;
        }
    }
    sums.into_iter()
        .fold(WindowPoint::new(day), |point, (field, (sum, count))| {
            point.with_value(field, sum / f64::from(count))
        })
}

pub fn fold_window(
    window: &RollingWindow,
    incoming: &[WindowPoint],
    required: &[String],
) -> RollingWindow {
    let hourly = fold_hourly(&window.hourly, incoming);
    let daily = fold_daily(&window.daily, &hourly, required);
    RollingWindow { hourly, daily }
}
