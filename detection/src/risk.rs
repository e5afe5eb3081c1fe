use chrono::{DateTime, Utc};
use sentinel_core::config::RiskConfig;
use sentinel_core::model::{MetricContribution, RiskAssessment, RiskLevel, RiskMetrics, Urgency};

const SECONDS_PER_HOUR: i64 = 3_600;

/// Everything the aggregate depends on. Same inputs, same assessment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RiskInputs {
    pub member_count: usize,
    /// Members whose author is currently labelled BOT.
    pub bot_member_count: usize,
    /// Members in the most recent rolling hour.
    pub velocity: f64,
    /// Hourly member counts preceding the current hour.
    pub baseline: Vec<f64>,
    /// Cohesion of the narrative's dominant community, `[0, 1]`.
    pub coordination: f64,
    pub suspicious_url_posts: usize,
}

impl RiskInputs {
    pub fn bot_ratio(&self) -> f64 {
        if self.member_count == 0 {
            0.0
        } else {
            self.bot_member_count as f64 / self.member_count as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeStats {
    pub baseline_mean: f64,
    pub z_score: f64,
    pub is_spike: bool,
}

/// Splits member timestamps into hour buckets counted back from `now`.
/// Bucket 0 is the current hour; the baseline runs from bucket 1 to the
/// oldest bucket holding a member, capped at `baseline_hours`.
pub fn hourly_profile(
    times: impl IntoIterator<Item = DateTime<Utc>>,
    now: DateTime<Utc>,
    baseline_hours: i64,
) -> (f64, Vec<f64>) {
    let cap = baseline_hours.max(0) as usize;
    let mut buckets = vec![0.0f64; cap + 1];
    let mut oldest = 0usize;

    for ts in times {
        let age = (now - ts).num_seconds();
        if age < 0 {
            buckets[0] += 1.0;
            continue;
        }
        let bucket = (age / SECONDS_PER_HOUR) as usize;
        if bucket > cap {
            oldest = cap;
            continue;
        }
        buckets[bucket] += 1.0;
        oldest = oldest.max(bucket);
    }

    let velocity = buckets[0];
    let baseline = buckets[1..=oldest].to_vec();
    (velocity, baseline)
}

pub fn spike_stats(velocity: f64, baseline: &[f64], config: &RiskConfig) -> SpikeStats {
    if baseline.is_empty() {
        return SpikeStats {
            baseline_mean: 0.0,
            z_score: 0.0,
            is_spike: false,
        };
    }

    let n = baseline.len() as f64;
    let mean = baseline.iter().sum::<f64>() / n;
    let variance = baseline.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt().max(mean.sqrt()).max(1.0);
    let z_score = (velocity - mean) / std;

    SpikeStats {
        baseline_mean: mean,
        z_score,
        is_spike: velocity >= config.spike_multiplier * mean && velocity >= config.min_spike_rate,
    }
}

pub fn level_for(score: f64) -> RiskLevel {
    if score < 0.3 {
        RiskLevel::Low
    } else if score < 0.6 {
        RiskLevel::Medium
    } else if score < 0.8 {
        RiskLevel::High
    } else {
        RiskLevel::Critical
    }
}

pub fn urgency_for(level: RiskLevel, is_spike: bool) -> Urgency {
    match level {
        RiskLevel::Critical if is_spike => Urgency::Immediate,
        RiskLevel::Critical | RiskLevel::High => Urgency::Urgent,
        _ => Urgency::Routine,
    }
}

pub fn interpret_bot_ratio(ratio: f64) -> &'static str {
    if ratio >= 0.7 {
        "SEVERE"
    } else if ratio >= 0.4 {
        "MODERATE"
    } else {
        "LOW"
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn metric(value: f64, normalized: f64, weight: f64) -> MetricContribution {
    let normalized = unit(normalized);
    MetricContribution {
        value,
        normalized,
        contribution: normalized * weight,
    }
}

fn saturate(value: f64, saturation: f64) -> f64 {
    if saturation <= 0.0 {
        return if value > 0.0 { 1.0 } else { 0.0 };
    }
    value / saturation
}

pub fn assess(inputs: &RiskInputs, config: &RiskConfig) -> RiskAssessment {
    let weights = &config.weights;
    let bot_ratio = inputs.bot_ratio();
    let spike = spike_stats(inputs.velocity, &inputs.baseline, config);

    let metrics = RiskMetrics {
        bot_ratio: metric(
            bot_ratio,
            saturate(bot_ratio, config.bot_ratio_saturation),
            weights.bot_ratio,
        ),
        spike_velocity: metric(
            inputs.velocity,
            saturate(spike.z_score.max(0.0), config.z_saturation),
            weights.spike_velocity,
        ),
        coordination: metric(inputs.coordination, inputs.coordination, weights.coordination),
        suspicious_urls: metric(
            inputs.suspicious_url_posts as f64,
            saturate(inputs.suspicious_url_posts as f64, config.url_saturation),
            weights.suspicious_urls,
        ),
    };

    let risk_score = unit(
        metrics.bot_ratio.contribution
            + metrics.spike_velocity.contribution
            + metrics.coordination.contribution
            + metrics.suspicious_urls.contribution,
    );
    let risk_level = level_for(risk_score);

    RiskAssessment {
        risk_score,
        risk_level,
        urgency: urgency_for(risk_level, spike.is_spike),
        is_spike: spike.is_spike,
        bot_ratio_interpretation: interpret_bot_ratio(bot_ratio).to_string(),
        metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn levels_and_urgency_boundaries() {
        assert_eq!(level_for(0.29), RiskLevel::Low);
        assert_eq!(level_for(0.3), RiskLevel::Medium);
        assert_eq!(level_for(0.6), RiskLevel::High);
        assert_eq!(level_for(0.8), RiskLevel::Critical);
        assert_eq!(urgency_for(RiskLevel::Critical, true), Urgency::Immediate);
        assert_eq!(urgency_for(RiskLevel::Critical, false), Urgency::Urgent);
        assert_eq!(urgency_for(RiskLevel::High, true), Urgency::Urgent);
        assert_eq!(urgency_for(RiskLevel::Medium, true), Urgency::Routine);
    }

    #[test]
    fn hourly_profile_separates_current_hour() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let times = vec![
            now - Duration::minutes(10),
            now - Duration::minutes(50),
            now - Duration::minutes(70),
            now - Duration::minutes(200),
        ];
        let (velocity, baseline) = hourly_profile(times, now, 23);
        assert_eq!(velocity, 2.0);
        assert_eq!(baseline, vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn no_history_means_no_spike() {
        let stats = spike_stats(500.0, &[], &RiskConfig::default());
        assert_eq!(stats.z_score, 0.0);
        assert!(!stats.is_spike);
    }

    #[test]
    fn burst_over_flat_baseline_is_a_spike() {
        let stats = spike_stats(60.0, &[10.0, 10.0, 10.0], &RiskConfig::default());
        assert!(stats.is_spike);
        assert!(stats.z_score > 3.0);
    }

    #[test]
    fn small_counts_never_spike() {
        let stats = spike_stats(4.0, &[1.0, 1.0], &RiskConfig::default());
        assert!(!stats.is_spike);
    }
}
