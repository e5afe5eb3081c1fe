use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

pub type PostId = String;
pub type AccountId = String;
pub type NarrativeId = String;
pub type CommunityId = String;

/// Canonical post. Immutable once ingested apart from the write-once embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub author_id: AccountId,
    pub text: String,
    pub text_hash: String,
    pub created_at: DateTime<Utc>,
    pub urls: BTreeSet<String>,
    pub hashtags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub reply_to: Option<PostId>,
    pub retweet_of: Option<PostId>,
    pub mentions: Vec<AccountId>,
}

impl Post {
    /// Returns `false` when an embedding was already attached.
    pub fn attach_embedding(&mut self, embedding: Vec<f32>) -> bool {
        if self.embedding.is_some() {
            return false;
        }
        self.embedding = Some(embedding);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub handle: String,
    pub created_at: Option<DateTime<Utc>>,
    pub followers: u64,
    pub following: u64,
    pub post_count: u64,
}

/// Author metadata carried by a raw event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub id: AccountId,
    pub handle: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub followers: Option<u64>,
    pub following: Option<u64>,
    pub reported_post_count: Option<u64>,
}

impl Account {
    pub fn from_update(update: &AccountUpdate) -> Self {
        let mut account = Self {
            id: update.id.clone(),
            handle: update.handle.clone().unwrap_or_else(|| update.id.clone()),
            created_at: update.created_at,
            followers: 0,
            following: 0,
            post_count: 0,
        };
        account.apply(update);
        account
    }

    /// Folds one more observed post (and whatever metadata came with it) into
    /// the account.
    pub fn apply(&mut self, update: &AccountUpdate) {
        if let Some(handle) = &update.handle {
            self.handle = handle.clone();
        }
        if self.created_at.is_none() {
            self.created_at = update.created_at;
        }
        if let Some(followers) = update.followers {
            self.followers = followers;
        }
        if let Some(following) = update.following {
            self.following = following;
        }
        self.post_count += 1;
        if let Some(reported) = update.reported_post_count {
            self.post_count = self.post_count.max(reported);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotLabel {
    Bot,
    Suspicious,
    Organic,
}

impl BotLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            BotLabel::Bot => "BOT",
            BotLabel::Suspicious => "SUSPICIOUS",
            BotLabel::Organic => "ORGANIC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotScore {
    pub account_id: AccountId,
    pub score: f64,
    pub label: BotLabel,
    pub features: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    Routine,
    Urgent,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricContribution {
    pub value: f64,
    pub normalized: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub bot_ratio: MetricContribution,
    pub spike_velocity: MetricContribution,
    pub coordination: MetricContribution,
    pub suspicious_urls: MetricContribution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub urgency: Urgency,
    pub is_spike: bool,
    pub bot_ratio_interpretation: String,
    pub metrics: RiskMetrics,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("post {0} is already a member")]
    AlreadyMember(PostId),
    #[error("embedding dimension {actual} does not match centroid dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// A tracked storyline. Created with its first member and updated in place
/// afterwards; never deleted, only archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Narrative {
    pub id: NarrativeId,
    pub members: BTreeMap<PostId, DateTime<Utc>>,
    pub origin_post_id: PostId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub velocity: f64,
    pub bot_ratio: f64,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub urgency: Urgency,
    pub risk: Option<RiskAssessment>,
    pub dominant_community: Option<CommunityId>,
    pub archived: bool,
    /// Running sum of member embeddings; cosine against it equals cosine
    /// against the mean.
    #[serde(skip)]
    pub centroid: Vec<f32>,
    pub version: u64,
}

impl Narrative {
    pub fn open(
        id: NarrativeId,
        post_id: PostId,
        created_at: DateTime<Utc>,
        embedding: &[f32],
    ) -> Self {
        let mut members = BTreeMap::new();
        members.insert(post_id.clone(), created_at);
        Self {
            id,
            members,
            origin_post_id: post_id,
            first_seen: created_at,
            last_seen: created_at,
            velocity: 0.0,
            bot_ratio: 0.0,
            risk_score: 0.0,
            risk_level: RiskLevel::Low,
            urgency: Urgency::Routine,
            risk: None,
            dominant_community: None,
            archived: false,
            centroid: embedding.to_vec(),
            version: 0,
        }
    }

    pub fn tweet_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, post_id: &str) -> bool {
        self.members.contains_key(post_id)
    }

    pub fn member_post_ids(&self) -> impl Iterator<Item = &PostId> {
        self.members.keys()
    }

    pub fn admit(
        &mut self,
        post_id: &str,
        created_at: DateTime<Utc>,
        embedding: &[f32],
    ) -> Result<(), MembershipError> {
        if self.members.contains_key(post_id) {
            return Err(MembershipError::AlreadyMember(post_id.to_string()));
        }
        if self.centroid.is_empty() {
            self.centroid = vec![0.0; embedding.len()];
        }
        if self.centroid.len() != embedding.len() {
            return Err(MembershipError::DimensionMismatch {
                expected: self.centroid.len(),
                actual: embedding.len(),
            });
        }

        for (acc, value) in self.centroid.iter_mut().zip(embedding) {
            *acc += *value;
        }
        self.members.insert(post_id.to_string(), created_at);
        if (created_at, post_id) < (self.first_seen, self.origin_post_id.as_str()) {
            self.first_seen = created_at;
            self.origin_post_id = post_id.to_string();
        }
        if created_at > self.last_seen {
            self.last_seen = created_at;
        }
        Ok(())
    }

    /// Removes a member. The origin is re-derived when the evicted post was
    /// patient zero.
    pub fn evict(&mut self, post_id: &str, embedding: Option<&[f32]>) -> bool {
        if self.members.remove(post_id).is_none() {
            return false;
        }
        if let Some(embedding) = embedding {
            if embedding.len() == self.centroid.len() {
                for (acc, value) in self.centroid.iter_mut().zip(embedding) {
                    *acc -= *value;
                }
            }
        }
        if self.origin_post_id == post_id {
            self.recompute_bounds();
        }
        true
    }

    fn recompute_bounds(&mut self) {
        if let Some((post_id, created_at)) = self
            .members
            .iter()
            .min_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)))
        {
            self.origin_post_id = post_id.clone();
            self.first_seen = *created_at;
        }
        if let Some(last) = self.members.values().max() {
            self.last_seen = *last;
        }
    }

    /// `true` when `origin_post_id` is the earliest member (ties by id).
    pub fn origin_is_consistent(&self) -> bool {
        match self
            .members
            .iter()
            .min_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)))
        {
            Some((post_id, created_at)) => {
                *post_id == self.origin_post_id && *created_at == self.first_seen
            }
            None => true,
        }
    }

    pub fn members_since(&self, since: DateTime<Utc>) -> usize {
        self.members.values().filter(|ts| **ts > since).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    Retweet,
    Reply,
    Mention,
    SimilarText,
}

impl EdgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeType::Retweet => "RETWEET",
            EdgeType::Reply => "REPLY",
            EdgeType::Mention => "MENTION",
            EdgeType::SimilarText => "SIMILAR_TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityEdge {
    pub source_account_id: AccountId,
    pub target_account_id: AccountId,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommunityClass {
    Organic,
    Bot,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: CommunityId,
    pub member_account_ids: BTreeSet<AccountId>,
    pub modularity: f64,
    pub classification: CommunityClass,
    pub mean_bot_score: f64,
    pub internal_weight: f64,
    pub external_weight: f64,
}

impl Community {
    /// Share of incident weight that stays inside the community.
    pub fn cohesion(&self) -> f64 {
        let total = self.internal_weight + self.external_weight;
        if total <= f64::EPSILON {
            0.0
        } else {
            self.internal_weight / total
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BurstKind {
    ExactMatch,
    SemanticSimilarity,
}

/// Three or more accounts posting the same (or nearly the same) text inside
/// one coordination window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationBurst {
    pub kind: BurstKind,
    pub account_ids: Vec<AccountId>,
    pub post_ids: Vec<PostId>,
    pub time_span_seconds: i64,
    pub avg_similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub version: u64,
    pub built_at: DateTime<Utc>,
    pub nodes: Vec<AccountId>,
    pub edges: Vec<CommunityEdge>,
    pub communities: Vec<Community>,
    pub membership: BTreeMap<AccountId, CommunityId>,
    pub modularity: f64,
    pub bursts: Vec<CoordinationBurst>,
}

impl GraphSnapshot {
    pub fn empty(built_at: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            built_at,
            nodes: Vec::new(),
            edges: Vec::new(),
            communities: Vec::new(),
            membership: BTreeMap::new(),
            modularity: 0.0,
            bursts: Vec::new(),
        }
    }

    pub fn community(&self, id: &str) -> Option<&Community> {
        self.communities.iter().find(|community| community.id == id)
    }

    pub fn community_of(&self, account_id: &str) -> Option<&Community> {
        self.membership
            .get(account_id)
            .and_then(|id| self.community(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn admit_moves_origin_to_earliest_member() {
        let mut narrative = Narrative::open("nar-1".into(), "p2".into(), ts(10), &[1.0, 0.0]);
        narrative.admit("p1", ts(5), &[1.0, 0.0]).unwrap();
        narrative.admit("p3", ts(20), &[0.0, 1.0]).unwrap();

        assert_eq!(narrative.origin_post_id, "p1");
        assert_eq!(narrative.first_seen, ts(5));
        assert_eq!(narrative.last_seen, ts(20));
        assert_eq!(narrative.tweet_count(), 3);
        assert!(narrative.origin_is_consistent());
    }

    #[test]
    fn origin_ties_break_on_lowest_post_id() {
        let mut narrative = Narrative::open("nar-1".into(), "p9".into(), ts(10), &[1.0]);
        narrative.admit("p3", ts(10), &[1.0]).unwrap();
        assert_eq!(narrative.origin_post_id, "p3");
    }

    #[test]
    fn admit_rejects_duplicate_member() {
        let mut narrative = Narrative::open("nar-1".into(), "p1".into(), ts(1), &[1.0]);
        let err = narrative.admit("p1", ts(0), &[1.0]).unwrap_err();
        assert_eq!(err, MembershipError::AlreadyMember("p1".into()));
        assert_eq!(narrative.first_seen, ts(1));
    }

    #[test]
    fn evicting_origin_rederives_it() {
        let mut narrative = Narrative::open("nar-1".into(), "p1".into(), ts(1), &[1.0]);
        narrative.admit("p2", ts(2), &[1.0]).unwrap();
        assert!(narrative.evict("p1", Some(&[1.0])));
        assert_eq!(narrative.origin_post_id, "p2");
        assert_eq!(narrative.centroid, vec![1.0]);
        assert!(narrative.origin_is_consistent());
    }

    #[test]
    fn account_apply_counts_posts_and_respects_reported_total() {
        let update = AccountUpdate {
            id: "u1".into(),
            handle: Some("alice".into()),
            reported_post_count: Some(40),
            ..Default::default()
        };
        let mut account = Account::from_update(&update);
        assert_eq!(account.post_count, 40);

        account.apply(&AccountUpdate {
            id: "u1".into(),
            ..Default::default()
        });
        assert_eq!(account.post_count, 41);
        assert_eq!(account.handle, "alice");
    }
}
