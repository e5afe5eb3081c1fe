use chrono::Duration;
use sentinel_core::config::QueryConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_LIMIT: usize = 1_000;
const MAX_LOOKBACK_HOURS: i64 = 24 * 30;
const MAX_BUCKETS: i64 = 2_000;

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct NarrativeParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub min_risk: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct BotParams {
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct GraphParams {
    #[serde(default)]
    pub narrative_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct StatsParams {
    #[serde(default)]
    pub bucket_minutes: Option<i64>,
    #[serde(default)]
    pub lookback_hours: Option<i64>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("limit must be between 1 and {0}")]
    InvalidLimit(usize),
    #[error("{0} must be within [0, 1]")]
    OutOfUnitRange(&'static str),
    #[error("bucket_minutes must be positive and no wider than the lookback")]
    InvalidBucket,
    #[error("lookback_hours must be between 1 and {0}")]
    InvalidLookback(i64),
    #[error("at most {0} buckets may be requested")]
    TooManyBuckets(i64),
    #[error("narrative_id must not be empty when provided")]
    EmptyNarrativeId,
}

fn check_limit(limit: Option<usize>) -> Result<(), ParamError> {
    match limit {
        Some(limit) if limit == 0 || limit > MAX_LIMIT => Err(ParamError::InvalidLimit(MAX_LIMIT)),
        _ => Ok(()),
    }
}

fn check_unit(name: &'static str, value: Option<f64>) -> Result<(), ParamError> {
    match value {
        Some(value) if !(0.0..=1.0).contains(&value) => Err(ParamError::OutOfUnitRange(name)),
        _ => Ok(()),
    }
}

impl NarrativeParams {
    pub fn validate(&self) -> Result<(), ParamError> {
        check_limit(self.limit)?;
        check_unit("min_risk", self.min_risk)
    }
}

impl BotParams {
    pub fn validate(&self) -> Result<(), ParamError> {
        check_limit(self.limit)?;
        check_unit("min_score", self.min_score)
    }

    pub fn floor(&self, config: &QueryConfig) -> f64 {
        self.min_score.unwrap_or(config.bot_score_floor)
    }
}

impl GraphParams {
    pub fn validate(&self) -> Result<(), ParamError> {
        match &self.narrative_id {
            Some(id) if id.trim().is_empty() => Err(ParamError::EmptyNarrativeId),
            _ => Ok(()),
        }
    }
}

impl StatsParams {
    /// Bucket width and lookback, falling back to the configured defaults.
    pub fn resolve(&self, config: &QueryConfig) -> Result<(Duration, Duration), ParamError> {
        let bucket_minutes = self.bucket_minutes.unwrap_or(config.bucket_minutes);
        let lookback_hours = self.lookback_hours.unwrap_or(config.lookback_hours);

        if lookback_hours <= 0 || lookback_hours > MAX_LOOKBACK_HOURS {
            return Err(ParamError::InvalidLookback(MAX_LOOKBACK_HOURS));
        }
        if bucket_minutes <= 0 || bucket_minutes > lookback_hours * 60 {
            return Err(ParamError::InvalidBucket);
        }
        if lookback_hours * 60 / bucket_minutes > MAX_BUCKETS {
            return Err(ParamError::TooManyBuckets(MAX_BUCKETS));
        }
        Ok((
            Duration::minutes(bucket_minutes),
            Duration::hours(lookback_hours),
        ))
    }
}
