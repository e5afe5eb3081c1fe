use chrono::{DateTime, Utc};
use sentinel_core::config::BotConfig;
use sentinel_core::embedding::cosine_similarity;
use sentinel_core::model::{Account, BotLabel, BotScore, Post};
use std::collections::{BTreeMap, HashMap};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Linear ramp: 0 at or below `threshold`, 1 at or above `saturation`.
/// NaN maps to 0.
pub fn ramp(value: f64, threshold: f64, saturation: f64) -> f64 {
    if value.is_nan() || value <= threshold {
        return 0.0;
    }
    if value >= saturation || saturation <= threshold {
        return 1.0;
    }
    (value - threshold) / (saturation - threshold)
}

/// Shannon entropy of the handle's characters, in bits.
pub fn shannon_entropy(text: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in text.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }

    let total = total as f64;
    counts
        .values()
        .map(|count| {
            let p = *count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Factor {
    pub name: &'static str,
    /// Position on the factor's ramp, in `[0, 1]`.
    pub normalized: f64,
    pub weight: f64,
}

impl Factor {
    pub fn new(name: &'static str, normalized: f64, weight: f64) -> Self {
        Self {
            name,
            normalized,
            weight,
        }
    }

    /// Contribution capped to `[0, weight]`.
    pub fn contribution(&self) -> f64 {
        let normalized = if self.normalized.is_nan() {
            0.0
        } else {
            self.normalized.clamp(0.0, 1.0)
        };
        let weight = if self.weight.is_finite() {
            self.weight.max(0.0)
        } else {
            0.0
        };
        normalized * weight
    }
}

/// Sums capped contributions in ascending order so the result does not
/// depend on how the factors were listed.
pub fn combine(factors: &[Factor]) -> f64 {
    let mut contributions: Vec<f64> = factors.iter().map(Factor::contribution).collect();
    contributions.sort_by(|a, b| a.total_cmp(b));
    contributions.iter().sum::<f64>().clamp(0.0, 1.0)
}

/// Raw behavioural measurements for one account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountFeatures {
    pub posts_per_day: f64,
    pub account_age_days: Option<f64>,
    pub handle_entropy: f64,
    pub follow_ratio: f64,
    pub repeat_ratio: f64,
}

impl AccountFeatures {
    pub fn extract(
        account: &Account,
        recent_posts: &[Post],
        now: DateTime<Utc>,
        config: &BotConfig,
    ) -> Self {
        let account_age_days = account
            .created_at
            .map(|created| ((now - created).num_seconds() as f64 / SECONDS_PER_DAY).max(0.0));

        let posts_per_day = match account_age_days {
            Some(age) => account.post_count as f64 / age.max(1.0),
            None => {
                let span_days = match (recent_posts.first(), recent_posts.last()) {
                    (Some(first), Some(last)) => {
                        (last.created_at - first.created_at).num_seconds() as f64 / SECONDS_PER_DAY
                    }
                    _ => 0.0,
                };
                recent_posts.len() as f64 / span_days.max(1.0)
            }
        };

        Self {
            posts_per_day,
            account_age_days,
            handle_entropy: shannon_entropy(&account.handle),
            follow_ratio: account.following as f64 / account.followers.max(1) as f64,
            repeat_ratio: repeat_ratio(recent_posts, config),
        }
    }
}

/// Share of posts that have an exact or near duplicate among the others.
fn repeat_ratio(posts: &[Post], config: &BotConfig) -> f64 {
    if posts.len() < 2 {
        return 0.0;
    }

    let mut duplicated = vec![false; posts.len()];
    for i in 0..posts.len() {
        for j in (i + 1)..posts.len() {
            if duplicated[i] && duplicated[j] {
                continue;
            }
            if is_near_duplicate(&posts[i], &posts[j], config.near_duplicate_similarity) {
                duplicated[i] = true;
                duplicated[j] = true;
            }
        }
    }

    duplicated.iter().filter(|d| **d).count() as f64 / posts.len() as f64
}

fn is_near_duplicate(a: &Post, b: &Post, threshold: f32) -> bool {
    if a.text_hash == b.text_hash {
        return true;
    }
    match (&a.embedding, &b.embedding) {
        (Some(left), Some(right)) => {
            cosine_similarity(left, right).is_some_and(|similarity| similarity >= threshold)
        }
        _ => false,
    }
}

/// Stateless weighted-sum scorer. Identical inputs give identical scores.
#[derive(Debug, Clone)]
pub struct BotScorer {
    config: BotConfig,
}

impl BotScorer {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn factors(&self, features: &AccountFeatures) -> [Factor; 5] {
        let c = &self.config;
        let w = &c.weights;
        let age = match features.account_age_days {
            Some(days) => 1.0 - ramp(days, c.young_account_days, c.mature_account_days),
            None => 0.0,
        };

        [
            Factor::new(
                "posting_frequency",
                ramp(
                    features.posts_per_day,
                    c.posts_per_day_threshold,
                    c.posts_per_day_saturation,
                ),
                w.posting_frequency,
            ),
            Factor::new(
                "handle_entropy",
                ramp(features.handle_entropy, c.entropy_threshold, c.entropy_saturation),
                w.handle_entropy,
            ),
            Factor::new(
                "follow_ratio",
                ramp(
                    features.follow_ratio,
                    c.follow_ratio_threshold,
                    c.follow_ratio_saturation,
                ),
                w.follow_ratio,
            ),
            Factor::new(
                "text_repetition",
                ramp(features.repeat_ratio, 0.0, c.repetition_saturation),
                w.text_repetition,
            ),
            Factor::new("account_age", age, w.account_age),
        ]
    }

    pub fn label(&self, score: f64) -> BotLabel {
        if score >= self.config.bot_threshold {
            BotLabel::Bot
        } else if score >= self.config.suspicious_threshold {
            BotLabel::Suspicious
        } else {
            BotLabel::Organic
        }
    }

    pub fn score(&self, account_id: &str, features: &AccountFeatures) -> BotScore {
        let factors = self.factors(features);
        let score = combine(&factors);

        let mut map = BTreeMap::new();
        map.insert("posts_per_day".to_string(), features.posts_per_day);
        map.insert(
            "account_age_days".to_string(),
            features.account_age_days.unwrap_or(-1.0),
        );
        map.insert("handle_entropy".to_string(), features.handle_entropy);
        map.insert("follow_ratio".to_string(), features.follow_ratio);
        map.insert("repeat_ratio".to_string(), features.repeat_ratio);
        for factor in &factors {
            map.insert(format!("{}_factor", factor.name), factor.normalized);
        }

        BotScore {
            account_id: account_id.to_string(),
            score,
            label: self.label(score),
            features: map,
        }
    }

    /// `recent_posts` must be the account's own posts, oldest first.
    pub fn score_account(
        &self,
        account: &Account,
        recent_posts: &[Post],
        now: DateTime<Utc>,
    ) -> BotScore {
        let limit = self.config.recent_post_limit.max(1);
        let skip = recent_posts.len().saturating_sub(limit);
        let features = AccountFeatures::extract(account, &recent_posts[skip..], now, &self.config);
        self.score(&account.id, &features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_handles_extremes() {
        assert_eq!(ramp(f64::INFINITY, 1.0, 2.0), 1.0);
        assert_eq!(ramp(f64::NEG_INFINITY, 1.0, 2.0), 0.0);
        assert_eq!(ramp(f64::NAN, 1.0, 2.0), 0.0);
        assert_eq!(ramp(1.5, 1.0, 2.0), 0.5);
        assert_eq!(ramp(5.0, 2.0, 2.0), 1.0);
    }

    #[test]
    fn entropy_of_uniform_handle() {
        assert_eq!(shannon_entropy(""), 0.0);
        assert_eq!(shannon_entropy("aaaa"), 0.0);
        assert!((shannon_entropy("abcd") - 2.0).abs() < 1e-12);
    }

    #[test]
    fn contribution_is_capped_at_weight() {
        let factor = Factor::new("x", 7.5, 0.2);
        assert!((factor.contribution() - 0.2).abs() < 1e-12);
        assert_eq!(Factor::new("x", -3.0, 0.2).contribution(), 0.0);
        assert_eq!(Factor::new("x", 1.0, f64::NAN).contribution(), 0.0);
    }

    #[test]
    fn labels_follow_thresholds() {
        let scorer = BotScorer::new(&BotConfig::default());
        assert_eq!(scorer.label(0.7), BotLabel::Bot);
        assert_eq!(scorer.label(0.69), BotLabel::Suspicious);
        assert_eq!(scorer.label(0.4), BotLabel::Suspicious);
        assert_eq!(scorer.label(0.39), BotLabel::Organic);
    }
}
