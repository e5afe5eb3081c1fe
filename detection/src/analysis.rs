use crate::risk::{assess, hourly_profile, RiskInputs};
use chrono::{DateTime, Utc};
use ingestion::urls::ThreatIntel;
use sentinel_core::config::RiskConfig;
use sentinel_core::model::{BotLabel, CommunityId, GraphSnapshot, Narrative, RiskAssessment};
use std::collections::BTreeMap;
use std::sync::Arc;
use storage::narratives::NarrativeStore;
use storage::repo::{Repository, StoreError};
use tracing::debug;

/// Derives the risk inputs of a narrative from current member, bot-score
/// and community state, then writes the assessment back.
pub struct NarrativeAnalyzer {
    config: RiskConfig,
    threat_intel: Arc<dyn ThreatIntel>,
    max_retries: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NarrativeSignals {
    pub inputs: RiskInputs,
    pub dominant_community: Option<CommunityId>,
}

impl NarrativeAnalyzer {
    pub fn new(config: &RiskConfig, threat_intel: Arc<dyn ThreatIntel>, max_retries: usize) -> Self {
        Self {
            config: config.clone(),
            threat_intel,
            max_retries,
        }
    }

    pub fn signals(
        &self,
        narrative: &Narrative,
        repo: &Repository,
        graph: &GraphSnapshot,
        now: DateTime<Utc>,
    ) -> NarrativeSignals {
        let (velocity, baseline) = hourly_profile(
            narrative.members.values().copied(),
            now,
            self.config.baseline_hours,
        );

        let mut bot_member_count = 0usize;
        let mut suspicious_url_posts = 0usize;
        let mut per_community: BTreeMap<&str, usize> = BTreeMap::new();

        for post_id in narrative.member_post_ids() {
            let Some(post) = repo.get_post(post_id) else {
                continue;
            };
            let is_bot = repo
                .bot_score(&post.author_id)
                .is_some_and(|score| score.label == BotLabel::Bot);
            if is_bot {
                bot_member_count += 1;
            }
            if post.urls.iter().any(|url| self.threat_intel.is_suspicious(url)) {
                suspicious_url_posts += 1;
            }
            if let Some(community) = graph.membership.get(&post.author_id) {
                *per_community.entry(community.as_str()).or_insert(0) += 1;
            }
        }

        // most member posts wins, ties to the lowest id
        let dominant = per_community
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
            .map(|(id, _)| id.to_string());
        let coordination = dominant
            .as_deref()
            .and_then(|id| graph.community(id))
            .map(|community| community.cohesion())
            .unwrap_or(0.0);

        NarrativeSignals {
            inputs: RiskInputs {
                member_count: narrative.tweet_count(),
                bot_member_count,
                velocity,
                baseline,
                coordination,
                suspicious_url_posts,
            },
            dominant_community: dominant,
        }
    }

    pub fn assess(&self, signals: &NarrativeSignals) -> RiskAssessment {
        assess(&signals.inputs, &self.config)
    }

    /// Reassesses every live narrative. Returns how many were updated.
    pub fn refresh(
        &self,
        store: &NarrativeStore,
        repo: &Repository,
        graph: &GraphSnapshot,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut updated = 0usize;
        for narrative in store.snapshot() {
            if narrative.archived {
                continue;
            }
            let signals = self.signals(&narrative, repo, graph, now);
            let assessment = self.assess(&signals);
            let bot_ratio = signals.inputs.bot_ratio();
            let velocity = signals.inputs.velocity;

            store.update_with_retry(&narrative.id, self.max_retries, |target| {
                target.velocity = velocity;
                target.bot_ratio = bot_ratio;
                target.risk_score = assessment.risk_score;
                target.risk_level = assessment.risk_level;
                target.urgency = assessment.urgency;
                target.dominant_community = signals.dominant_community.clone();
                target.risk = Some(assessment.clone());
                Ok(())
            })?;
            debug!(
                narrative_id = %narrative.id,
                risk_score = assessment.risk_score,
                "narrative reassessed"
            );
            updated += 1;
        }
        Ok(updated)
    }
}
