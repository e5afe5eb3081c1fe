use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    Reject,
    DropOldest,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestionConfig {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub model_id: String,
    pub embedding_dims: usize,
    pub embedding_timeout_ms: u64,
    /// Posts dated further than this past the ingestion clock are malformed.
    pub max_future_skew_secs: i64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            overflow_policy: OverflowPolicy::Reject,
            model_id: "feature-hash-v1".to_string(),
            embedding_dims: crate::embedding::EMBEDDING_DIMS,
            embedding_timeout_ms: 2_000,
            max_future_skew_secs: 300,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClusteringConfig {
    pub window_hours: i64,
    /// Cosine to a narrative centroid needed for incremental assignment.
    pub assignment_threshold: f32,
    /// Cosine at which two posts are neighbours during a full recluster.
    pub density_similarity: f32,
    pub min_samples: usize,
    pub min_cluster_size: usize,
    pub archive_ttl_hours: i64,
    pub recluster_batch_size: usize,
    pub max_contention_retries: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            assignment_threshold: 0.55,
            density_similarity: 0.6,
            min_samples: 3,
            min_cluster_size: 5,
            archive_ttl_hours: 6,
            recluster_batch_size: 256,
            max_contention_retries: 8,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BotWeights {
    pub posting_frequency: f64,
    pub handle_entropy: f64,
    pub follow_ratio: f64,
    pub text_repetition: f64,
    pub account_age: f64,
}

impl Default for BotWeights {
    fn default() -> Self {
        Self {
            posting_frequency: 0.25,
            handle_entropy: 0.15,
            follow_ratio: 0.20,
            text_repetition: 0.25,
            account_age: 0.15,
        }
    }
}

impl BotWeights {
    pub fn sum(&self) -> f64 {
        self.posting_frequency
            + self.handle_entropy
            + self.follow_ratio
            + self.text_repetition
            + self.account_age
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BotConfig {
    pub weights: BotWeights,
    pub posts_per_day_threshold: f64,
    pub posts_per_day_saturation: f64,
    pub entropy_threshold: f64,
    pub entropy_saturation: f64,
    pub follow_ratio_threshold: f64,
    pub follow_ratio_saturation: f64,
    pub repetition_saturation: f64,
    pub near_duplicate_similarity: f32,
    pub young_account_days: f64,
    pub mature_account_days: f64,
    pub bot_threshold: f64,
    pub suspicious_threshold: f64,
    pub recent_post_limit: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            weights: BotWeights::default(),
            posts_per_day_threshold: 20.0,
            posts_per_day_saturation: 100.0,
            entropy_threshold: 3.3,
            entropy_saturation: 3.8,
            follow_ratio_threshold: 2.0,
            follow_ratio_saturation: 20.0,
            repetition_saturation: 0.5,
            near_duplicate_similarity: 0.9,
            young_account_days: 7.0,
            mature_account_days: 90.0,
            bot_threshold: 0.7,
            suspicious_threshold: 0.4,
            recent_post_limit: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    pub window_hours: i64,
    pub similar_text_threshold: f32,
    pub similar_text_window_secs: i64,
    pub bot_community_threshold: f64,
    pub organic_community_threshold: f64,
    pub burst_min_accounts: usize,
    /// Earlier posts each post is compared against in the similar-text sweep.
    pub similar_text_max_candidates: usize,
    pub max_levels: usize,
    pub max_passes: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            similar_text_threshold: 0.9,
            similar_text_window_secs: 600,
            bot_community_threshold: 0.6,
            organic_community_threshold: 0.3,
            burst_min_accounts: 3,
            similar_text_max_candidates: 256,
            max_levels: 8,
            max_passes: 20,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RiskWeights {
    pub bot_ratio: f64,
    pub spike_velocity: f64,
    pub coordination: f64,
    pub suspicious_urls: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            bot_ratio: 0.30,
            spike_velocity: 0.25,
            coordination: 0.25,
            suspicious_urls: 0.20,
        }
    }
}

impl RiskWeights {
    pub fn sum(&self) -> f64 {
        self.bot_ratio + self.spike_velocity + self.coordination + self.suspicious_urls
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    pub bot_ratio_saturation: f64,
    pub z_saturation: f64,
    pub url_saturation: f64,
    pub spike_multiplier: f64,
    pub min_spike_rate: f64,
    pub baseline_hours: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            bot_ratio_saturation: 0.4,
            z_saturation: 3.0,
            url_saturation: 5.0,
            spike_multiplier: 3.0,
            min_spike_rate: 5.0,
            baseline_hours: 23,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    pub bucket_minutes: i64,
    pub lookback_hours: i64,
    pub bot_score_floor: f64,
    pub origin_seed_minutes: i64,
    pub origin_bucket_minutes: i64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            bucket_minutes: 30,
            lookback_hours: 24,
            bot_score_floor: 0.5,
            origin_seed_minutes: 30,
            origin_bucket_minutes: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub workers: usize,
    pub worker_queue_capacity: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub analysis_interval_secs: u64,
    pub recluster_interval_secs: u64,
    pub checkpoint_dir: String,
    pub dead_letter_path: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            worker_queue_capacity: 1_024,
            retry_max_attempts: 5,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2_000,
            analysis_interval_secs: 60,
            recluster_interval_secs: 300,
            checkpoint_dir: "data/checkpoints".to_string(),
            dead_letter_path: "data/dead_letter.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ingestion: IngestionConfig,
    pub clustering: ClusteringConfig,
    pub bot: BotConfig,
    pub graph: GraphConfig,
    pub risk: RiskConfig,
    pub query: QueryConfig,
    pub jobs: JobsConfig,
}

impl AppConfig {
    /// `config/default`, then `config/{RUN_MODE}`, then `SENTINEL__*` env vars.
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("SENTINEL").separator("__"));

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate().map_err(ConfigError::Message)?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate().map_err(ConfigError::Message)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let bot_sum = self.bot.weights.sum();
        if (bot_sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(format!("bot weights must sum to 1.0, got {bot_sum}"));
        }
        let risk_sum = self.risk.weights.sum();
        if (risk_sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(format!("risk weights must sum to 1.0, got {risk_sum}"));
        }

        let unit = [
            ("clustering.assignment_threshold", self.clustering.assignment_threshold as f64),
            ("clustering.density_similarity", self.clustering.density_similarity as f64),
            ("graph.similar_text_threshold", self.graph.similar_text_threshold as f64),
            ("bot.bot_threshold", self.bot.bot_threshold),
            ("bot.suspicious_threshold", self.bot.suspicious_threshold),
            ("query.bot_score_floor", self.query.bot_score_floor),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if self.bot.suspicious_threshold > self.bot.bot_threshold {
            return Err("bot.suspicious_threshold must not exceed bot.bot_threshold".into());
        }

        let positive = [
            ("clustering.window_hours", self.clustering.window_hours),
            ("graph.window_hours", self.graph.window_hours),
            ("graph.similar_text_window_secs", self.graph.similar_text_window_secs),
            ("query.bucket_minutes", self.query.bucket_minutes),
            ("query.lookback_hours", self.query.lookback_hours),
            ("query.origin_seed_minutes", self.query.origin_seed_minutes),
            ("query.origin_bucket_minutes", self.query.origin_bucket_minutes),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(format!("{name} must be positive, got {value}"));
            }
        }
        if self.ingestion.queue_capacity == 0 {
            return Err("ingestion.queue_capacity must be positive".into());
        }
        if self.clustering.recluster_batch_size == 0 {
            return Err("clustering.recluster_batch_size must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ingestion.embedding_dims, 384);
        assert_eq!(config.query.bucket_minutes, 30);
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [server]
            port = 9090

            [ingestion]
            overflow_policy = "drop_oldest"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.ingestion.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.clustering.window_hours, 24);
    }

    #[test]
    fn shipped_default_file_matches_builtin_defaults() {
        let config = AppConfig::from_toml_str(include_str!("../../config/default.toml")).unwrap();
        let builtin = AppConfig::default();
        assert_eq!(config.clustering.min_cluster_size, builtin.clustering.min_cluster_size);
        assert_eq!(config.graph.similar_text_window_secs, 600);
        assert_eq!(config.jobs.worker_queue_capacity, builtin.jobs.worker_queue_capacity);
        assert!((config.risk.weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weights_not_summing_to_one_are_rejected() {
        let err = AppConfig::from_toml_str(
            r#"
            [risk.weights]
            bot_ratio = 0.5
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("risk weights"));
    }
}
