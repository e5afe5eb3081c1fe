use chrono::{DateTime, Utc};
use detection::risk::interpret_bot_ratio;
use sentinel_core::model::{
    Account, AccountId, BotLabel, BotScore, Community, CommunityId, CoordinationBurst, EdgeType,
    Narrative, NarrativeId, PostId, RiskLevel, RiskMetrics, Urgency,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// A read-side value together with the moment it describes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projection<T> {
    pub as_of: DateTime<Utc>,
    pub data: T,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NarrativeView {
    pub id: NarrativeId,
    pub origin_post_id: PostId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub tweet_count: usize,
    pub velocity: f64,
    pub bot_ratio: f64,
    pub bot_ratio_interpretation: String,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub urgency: Urgency,
    pub is_spike: bool,
    pub dominant_community: Option<CommunityId>,
    pub metrics: RiskMetrics,
    pub archived: bool,
    pub version: u64,
}

impl From<&Narrative> for NarrativeView {
    fn from(narrative: &Narrative) -> Self {
        let (is_spike, interpretation, metrics) = match &narrative.risk {
            Some(risk) => (
                risk.is_spike,
                risk.bot_ratio_interpretation.clone(),
                risk.metrics.clone(),
            ),
            None => (
                false,
                interpret_bot_ratio(narrative.bot_ratio).to_string(),
                RiskMetrics::default(),
            ),
        };
        Self {
            id: narrative.id.clone(),
            origin_post_id: narrative.origin_post_id.clone(),
            first_seen: narrative.first_seen,
            last_seen: narrative.last_seen,
            tweet_count: narrative.tweet_count(),
            velocity: narrative.velocity,
            bot_ratio: narrative.bot_ratio,
            bot_ratio_interpretation: interpretation,
            risk_score: narrative.risk_score,
            risk_level: narrative.risk_level,
            urgency: narrative.urgency,
            is_spike,
            dominant_community: narrative.dominant_community.clone(),
            metrics,
            archived: narrative.archived,
            version: narrative.version,
        }
    }
}

/// Account joined with its latest bot score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BotView {
    pub account_id: AccountId,
    pub handle: String,
    pub created_at: Option<DateTime<Utc>>,
    pub followers: u64,
    pub following: u64,
    pub post_count: u64,
    pub score: f64,
    pub label: BotLabel,
    pub features: BTreeMap<String, f64>,
}

impl BotView {
    pub fn join(account: Account, score: BotScore) -> Self {
        Self {
            account_id: account.id,
            handle: account.handle,
            created_at: account.created_at,
            followers: account.followers,
            following: account.following,
            post_count: account.post_count,
            score: score.score,
            label: score.label,
            features: score.features,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: AccountId,
    pub handle: Option<String>,
    pub bot_score: Option<f64>,
    pub label: Option<BotLabel>,
    pub community: Option<CommunityId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphLink {
    pub source: AccountId,
    pub target: AccountId,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphView {
    pub version: u64,
    pub as_of: DateTime<Utc>,
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
    pub communities: Vec<Community>,
    pub modularity: f64,
    pub bursts: Vec<CoordinationBurst>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimelinePoint {
    pub time: DateTime<Utc>,
    pub volume: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Kpi {
    pub bots: usize,
    pub tweets: usize,
    pub users: usize,
    pub active_narratives: usize,
    pub critical_narratives: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsView {
    pub as_of: DateTime<Utc>,
    pub bucket_minutes: i64,
    pub timeline_data: Vec<TimelinePoint>,
    pub kpi: Kpi,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserView {
    pub account: Account,
    pub bot_score: Option<BotScore>,
    pub community: Option<CommunityId>,
    pub narratives: Vec<NarrativeId>,
}
