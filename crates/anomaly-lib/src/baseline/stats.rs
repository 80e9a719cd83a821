//! Descriptive statistics used to build baseline snapshots

use chrono::{Datelike, Timelike};

use super::{Percentiles, SeasonalPattern, SeasonalPeriod, TrendData, TrendDirection};
use crate::models::TimeSeriesPoint;

/// Minimum seasonal strength for a pattern to be reported
const MIN_SEASONAL_STRENGTH: f64 = 0.1;

/// Slope magnitude below which a trend is reported as stable
const TREND_SLOPE_THRESHOLD: f64 = 0.01;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (Bessel's correction)
pub fn sample_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

fn population_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_sq / values.len() as f64).sqrt()
}

/// Percentile of an ascending-sorted slice, interpolating between order statistics
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

pub(crate) fn percentiles(sorted: &[f64]) -> Percentiles {
    Percentiles {
        p10: percentile(sorted, 10.0),
        p25: percentile(sorted, 25.0),
        p50: percentile(sorted, 50.0),
        p75: percentile(sorted, 75.0),
        p90: percentile(sorted, 90.0),
        p95: percentile(sorted, 95.0),
        p99: percentile(sorted, 99.0),
    }
}

/// Ordinary least squares over `(index, value)` pairs
pub fn linear_trend(values: &[f64]) -> TrendData {
    let n = values.len();
    if n < 2 {
        return TrendData {
            slope: 0.0,
            intercept: values.first().copied().unwrap_or(0.0),
            correlation: 0.0,
            direction: TrendDirection::Stable,
        };
    }

    let nf = n as f64;
    let sum_x: f64 = (0..n).map(|i| i as f64).sum();
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let sum_xx: f64 = (0..n).map(|i| (i as f64).powi(2)).sum();

    let denom = nf * sum_xx - sum_x * sum_x;
    let slope = if denom.abs() < f64::EPSILON {
        0.0
    } else {
        (nf * sum_xy - sum_x * sum_y) / denom
    };
    let intercept = (sum_y - slope * sum_x) / nf;

    let mean_y = sum_y / nf;
    let (ss_res, ss_tot) = values
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(res, tot), (i, y)| {
            let predicted = slope * i as f64 + intercept;
            (res + (y - predicted).powi(2), tot + (y - mean_y).powi(2))
        });
    let correlation = if ss_tot < f64::EPSILON {
        0.0
    } else {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    };

    let direction = if slope.abs() <= TREND_SLOPE_THRESHOLD {
        TrendDirection::Stable
    } else if slope > 0.0 {
        TrendDirection::Increasing
    } else {
        TrendDirection::Decreasing
    };

    TrendData {
        slope,
        intercept,
        correlation,
        direction,
    }
}

/// Extract every seasonal pattern the history supports
///
/// A period is considered only once the series holds its minimum number of
/// samples, and reported only when its strength exceeds 0.1.
pub fn seasonal_patterns(points: &[TimeSeriesPoint]) -> Vec<SeasonalPattern> {
    [
        SeasonalPeriod::Hourly,
        SeasonalPeriod::Daily,
        SeasonalPeriod::Weekly,
    ]
    .into_iter()
    .filter(|period| points.len() >= period.min_samples())
    .filter_map(|period| bucket_pattern(points, period))
    .filter(|pattern| pattern.strength > MIN_SEASONAL_STRENGTH)
    .collect()
}

fn bucket_index(point: &TimeSeriesPoint, period: SeasonalPeriod) -> usize {
    match period {
        SeasonalPeriod::Hourly => point.timestamp.hour() as usize,
        SeasonalPeriod::Daily => point.timestamp.weekday().num_days_from_monday() as usize,
        SeasonalPeriod::Weekly => point.timestamp.iso_week().week().saturating_sub(1) as usize,
    }
}

fn bucket_pattern(points: &[TimeSeriesPoint], period: SeasonalPeriod) -> Option<SeasonalPattern> {
    let buckets = period.buckets();
    let mut sums = vec![0.0; buckets];
    let mut counts = vec![0usize; buckets];

    for point in points {
        let idx = bucket_index(point, period).min(buckets - 1);
        sums[idx] += point.value;
        counts[idx] += 1;
    }

    let averages: Vec<Option<f64>> = sums
        .iter()
        .zip(&counts)
        .map(|(sum, &count)| (count > 0).then(|| sum / count as f64))
        .collect();
    let filled: Vec<f64> = averages.iter().flatten().copied().collect();

    // Variability needs at least two populated buckets
    if filled.len() < 2 {
        return None;
    }

    let avg_of_averages = mean(&filled);
    if avg_of_averages.abs() < f64::EPSILON {
        return None;
    }
    let strength =
        (population_std_dev(&filled, avg_of_averages) / avg_of_averages.abs()).clamp(0.0, 1.0);

    Some(SeasonalPattern {
        period,
        pattern: averages
            .into_iter()
            .map(|avg| avg.unwrap_or(avg_of_averages))
            .collect(),
        strength,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataType;
    use chrono::{Duration, TimeZone, Utc};

    fn hourly_points(count: usize, value: impl Fn(usize) -> f64) -> Vec<TimeSeriesPoint> {
        // 2024-01-01 is a Monday
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| TimeSeriesPoint {
                timestamp: start + Duration::hours(i as i64),
                value: value(i),
                source: "test".to_string(),
                data_type: DataType::Metric,
            })
            .collect()
    }

    #[test]
    fn test_percentile_interpolation() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 50.0), 3.0);
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 100.0), 5.0);
        // rank 0.25 * 4 = 1.0 -> exactly the second value
        assert_eq!(percentile(&sorted, 25.0), 2.0);
        // rank 0.9 * 4 = 3.6 -> 4 + 0.6
        assert!((percentile(&sorted, 90.0) - 4.6).abs() < 1e-9);
    }

    #[test]
    fn test_percentiles_monotonic_and_idempotent() {
        let mut values: Vec<f64> = (0..250).map(|i| ((i * 37) % 101) as f64 * 1.3).collect();
        values.sort_by(|a, b| a.total_cmp(b));

        let first = percentiles(&values);
        let second = percentiles(&values);
        assert_eq!(first, second);

        assert!(first.p10 <= first.p25);
        assert!(first.p25 <= first.p50);
        assert!(first.p50 <= first.p75);
        assert!(first.p75 <= first.p90);
        assert!(first.p90 <= first.p95);
        assert!(first.p95 <= first.p99);
    }

    #[test]
    fn test_empty_values() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(sample_std_dev(&[], 0.0), 0.0);
        assert_eq!(linear_trend(&[]).direction, TrendDirection::Stable);
    }

    #[test]
    fn test_linear_trend_perfect_fit() {
        let values: Vec<f64> = (0..50).map(|i| 3.0 + 2.0 * i as f64).collect();
        let trend = linear_trend(&values);
        assert!((trend.slope - 2.0).abs() < 1e-9);
        assert!((trend.intercept - 3.0).abs() < 1e-9);
        assert!((trend.correlation - 1.0).abs() < 1e-9);
        assert_eq!(trend.direction, TrendDirection::Increasing);
    }

    #[test]
    fn test_small_slope_is_stable() {
        let values: Vec<f64> = (0..100).map(|i| 10.0 - 0.001 * i as f64).collect();
        assert_eq!(linear_trend(&values).direction, TrendDirection::Stable);

        let falling: Vec<f64> = (0..100).map(|i| 10.0 - 0.5 * i as f64).collect();
        assert_eq!(linear_trend(&falling).direction, TrendDirection::Decreasing);
    }

    #[test]
    fn test_hourly_pattern_detected() {
        // Busy during working hours, quiet at night
        let points = hourly_points(168, |i| if (9..18).contains(&(i % 24)) { 200.0 } else { 50.0 });
        let patterns = seasonal_patterns(&points);

        let hourly = patterns
            .iter()
            .find(|p| p.period == SeasonalPeriod::Hourly)
            .expect("hourly pattern");
        assert_eq!(hourly.pattern.len(), 24);
        assert!(hourly.strength > 0.1);
        assert!((hourly.pattern[12] - 200.0).abs() < 1e-9);
        assert!((hourly.pattern[3] - 50.0).abs() < 1e-9);

        // Every weekday sees the same daily profile
        assert!(patterns.iter().all(|p| p.period != SeasonalPeriod::Daily));
    }

    #[test]
    fn test_seasonality_requires_minimum_samples() {
        let points = hourly_points(167, |i| if i % 24 < 12 { 200.0 } else { 50.0 });
        assert!(seasonal_patterns(&points).is_empty());
    }

    #[test]
    fn test_flat_series_has_no_pattern() {
        let points = hourly_points(700, |_| 100.0);
        assert!(seasonal_patterns(&points).is_empty());
    }

    #[test]
    fn test_weekly_pattern_needs_672_points() {
        // Alternate level every ISO week
        let points = hourly_points(700, |i| if (i / 168) % 2 == 0 { 100.0 } else { 300.0 });
        let patterns = seasonal_patterns(&points);
        assert!(patterns.iter().any(|p| p.period == SeasonalPeriod::Weekly));

        let short = hourly_points(671, |i| if (i / 168) % 2 == 0 { 100.0 } else { 300.0 });
        assert!(seasonal_patterns(&short)
            .iter()
            .all(|p| p.period != SeasonalPeriod::Weekly));
    }
}
