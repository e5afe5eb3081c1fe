use crate::error::QueryError;
use crate::params::{BotParams, GraphParams, NarrativeParams, StatsParams};
use crate::publisher::SnapshotPublisher;
use crate::views::{
    BotView, GraphLink, GraphNode, GraphView, Kpi, NarrativeView, Projection, StatsView,
    TimelinePoint, UserView,
};
use chrono::{DateTime, Utc};
use detection::origin::{trace_origin, OriginReport};
use sentinel_core::clock::Clock;
use sentinel_core::config::QueryConfig;
use sentinel_core::model::{AccountId, BotLabel, GraphSnapshot, RiskLevel};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use storage::narratives::NarrativeStore;
use storage::repo::Repository;
use tracing::debug;

/// Read-only projections over the stores and the published graph. Every
/// record is cloned under its own shard lock, so a response never mixes two
/// versions of one narrative or account.
pub struct QueryService {
    repo: Arc<Repository>,
    narratives: Arc<NarrativeStore>,
    graph: Arc<SnapshotPublisher>,
    clock: Arc<dyn Clock>,
    config: QueryConfig,
}

impl QueryService {
    pub fn new(
        repo: Arc<Repository>,
        narratives: Arc<NarrativeStore>,
        graph: Arc<SnapshotPublisher>,
        clock: Arc<dyn Clock>,
        config: &QueryConfig,
    ) -> Self {
        Self {
            repo,
            narratives,
            graph,
            clock,
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Active narratives, riskiest first; equal scores list the older one
    /// first.
    pub fn narratives(
        &self,
        params: &NarrativeParams,
    ) -> Result<Projection<Vec<NarrativeView>>, QueryError> {
        params.validate()?;
        let as_of = self.clock.now();
        let min_risk = params.min_risk.unwrap_or(0.0);

        let mut views: Vec<NarrativeView> = self
            .narratives
            .snapshot()
            .iter()
            .filter(|narrative| !narrative.archived && narrative.risk_score >= min_risk)
            .map(NarrativeView::from)
            .collect();
        views.sort_by(|a, b| {
            b.risk_score
                .total_cmp(&a.risk_score)
                .then(a.first_seen.cmp(&b.first_seen))
                .then(a.id.cmp(&b.id))
        });
        if let Some(limit) = params.limit {
            views.truncate(limit);
        }
        Ok(Projection { as_of, data: views })
    }

    pub fn narrative(&self, id: &str) -> Result<NarrativeView, QueryError> {
        self.narratives
            .get(id)
            .map(|narrative| NarrativeView::from(&narrative))
            .ok_or_else(|| QueryError::not_found("narrative", id))
    }

    pub fn origin(&self, id: &str) -> Result<OriginReport, QueryError> {
        let narrative = self
            .narratives
            .get(id)
            .ok_or_else(|| QueryError::not_found("narrative", id))?;
        Ok(trace_origin(&narrative, &self.repo, &self.config))
    }

    /// Scored accounts at or above the floor, highest score first.
    pub fn bots(&self, params: &BotParams) -> Result<Projection<Vec<BotView>>, QueryError> {
        params.validate()?;
        let as_of = self.clock.now();
        let floor = params.floor(&self.config);

        let mut scores = self.repo.bot_scores();
        scores.retain(|score| score.score >= floor);
        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.account_id.cmp(&b.account_id))
        });
        if let Some(limit) = params.limit {
            scores.truncate(limit);
        }

        let data = scores
            .into_iter()
            .filter_map(|score| {
                let account = self.repo.get_account(&score.account_id)?;
                Some(BotView::join(account, score))
            })
            .collect();
        Ok(Projection { as_of, data })
    }

    /// The last published graph, whole or restricted to the authors of one
    /// narrative.
    pub fn graph(&self, params: &GraphParams) -> Result<GraphView, QueryError> {
        params.validate()?;
        let snapshot = self.graph.load();

        let scope = match &params.narrative_id {
            Some(id) => {
                let narrative = self
                    .narratives
                    .get(id)
                    .ok_or_else(|| QueryError::not_found("narrative", id.as_str()))?;
                let authors: BTreeSet<AccountId> = narrative
                    .member_post_ids()
                    .filter_map(|post_id| self.repo.author_of(post_id))
                    .collect();
                Some(authors)
            }
            None => None,
        };

        Ok(self.render_graph(&snapshot, scope.as_ref()))
    }

    fn render_graph(&self, snapshot: &GraphSnapshot, scope: Option<&BTreeSet<AccountId>>) -> GraphView {
        let in_scope = |account: &str| scope.map_or(true, |set| set.contains(account));

        let nodes = snapshot
            .nodes
            .iter()
            .filter(|id| in_scope(id))
            .map(|id| {
                let score = self.repo.bot_score(id);
                GraphNode {
                    id: id.clone(),
                    handle: self.repo.get_account(id).map(|account| account.handle),
                    bot_score: score.as_ref().map(|s| s.score),
                    label: score.map(|s| s.label),
                    community: snapshot.membership.get(id).cloned(),
                }
            })
            .collect();

        let links = snapshot
            .edges
            .iter()
            .filter(|edge| in_scope(&edge.source_account_id) && in_scope(&edge.target_account_id))
            .map(|edge| GraphLink {
                source: edge.source_account_id.clone(),
                target: edge.target_account_id.clone(),
                edge_type: edge.edge_type,
                weight: edge.weight,
            })
            .collect();

        let communities = snapshot
            .communities
            .iter()
            .filter(|community| community.member_account_ids.iter().any(|id| in_scope(id)))
            .cloned()
            .collect();

        let bursts = snapshot
            .bursts
            .iter()
            .filter(|burst| burst.account_ids.iter().any(|id| in_scope(id)))
            .cloned()
            .collect();

        GraphView {
            version: snapshot.version,
            as_of: snapshot.built_at,
            nodes,
            links,
            communities,
            modularity: snapshot.modularity,
            bursts,
        }
    }

    /// Post volume per bucket over the lookback window plus headline counts.
    /// Buckets are aligned to multiples of the width since the Unix epoch.
    pub fn stats(&self, params: &StatsParams) -> Result<StatsView, QueryError> {
        let (bucket, lookback) = params.resolve(&self.config)?;
        let as_of = self.clock.now();
        let start = as_of - lookback;
        let width = bucket.num_seconds();

        let first = align(start, width);
        let last = align(as_of, width);
        let mut volumes = vec![0usize; ((last - first) / width + 1) as usize];
        for ts in self.repo.post_times() {
            if ts < start || ts > as_of {
                continue;
            }
            volumes[((align(ts, width) - first) / width) as usize] += 1;
        }

        let timeline_data = volumes
            .into_iter()
            .enumerate()
            .filter_map(|(i, volume)| {
                DateTime::from_timestamp(first + i as i64 * width, 0)
                    .map(|time| TimelinePoint { time, volume })
            })
            .collect();

        let narratives = self.narratives.snapshot();
        let active: Vec<_> = narratives.iter().filter(|n| !n.archived).collect();
        let kpi = Kpi {
            bots: self
                .repo
                .bot_scores()
                .iter()
                .filter(|score| score.label == BotLabel::Bot)
                .count(),
            tweets: self.repo.post_count(),
            users: self.repo.account_count(),
            active_narratives: active.len(),
            critical_narratives: active
                .iter()
                .filter(|n| n.risk_level == RiskLevel::Critical)
                .count(),
        };
        debug!(buckets = ((last - first) / width + 1), "stats computed");

        Ok(StatsView {
            as_of,
            bucket_minutes: bucket.num_minutes(),
            timeline_data,
            kpi,
        })
    }

    /// Account lookup by handle, with or without the leading `@`.
    pub fn user(&self, handle: &str) -> Result<UserView, QueryError> {
        let account = self
            .repo
            .account_by_handle(handle)
            .ok_or_else(|| QueryError::not_found("account", handle))?;

        let narratives: BTreeSet<String> = self
            .repo
            .recent_posts_by(&account.id, usize::MAX)
            .iter()
            .filter_map(|post| self.narratives.narrative_of(&post.id))
            .collect();

        Ok(UserView {
            bot_score: self.repo.bot_score(&account.id),
            community: self.graph.load().membership.get(&account.id).cloned(),
            narratives: narratives.into_iter().collect(),
            account,
        })
    }
}

fn align(ts: DateTime<Utc>, width_secs: i64) -> i64 {
    ts.timestamp().div_euclid(width_secs) * width_secs
}
