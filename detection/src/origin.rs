use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sentinel_core::config::QueryConfig;
use sentinel_core::model::{AccountId, Narrative, NarrativeId, PostId};
use storage::repo::Repository;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OriginSeed {
    pub post_id: PostId,
    pub account_id: AccountId,
    pub handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub minutes_after_origin: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpreadPoint {
    pub time: DateTime<Utc>,
    pub volume: usize,
    pub cumulative: usize,
}

/// Where a narrative started and how it spread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OriginReport {
    pub narrative_id: NarrativeId,
    pub origin_post_id: PostId,
    pub origin_account_id: Option<AccountId>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub seeds: Vec<OriginSeed>,
    pub timeline: Vec<SpreadPoint>,
    pub peak: Option<SpreadPoint>,
    pub duration_hours: f64,
    pub avg_velocity: f64,
}

/// Seeds are members posted within `origin_seed_minutes` of the first
/// post; the timeline buckets every member by `origin_bucket_minutes`.
pub fn trace_origin(narrative: &Narrative, repo: &Repository, config: &QueryConfig) -> OriginReport {
    let seed_cutoff = narrative.first_seen + Duration::minutes(config.origin_seed_minutes);
    let bucket_secs = config.origin_bucket_minutes.max(1) * 60;

    let mut members: Vec<(&DateTime<Utc>, &PostId)> =
        narrative.members.iter().map(|(id, ts)| (ts, id)).collect();
    members.sort();

    let seeds = members
        .iter()
        .filter(|(ts, _)| **ts <= seed_cutoff)
        .map(|(ts, post_id)| {
            let account_id = repo.author_of(post_id).unwrap_or_default();
            let handle = repo.get_account(&account_id).map(|a| a.handle);
            OriginSeed {
                post_id: (*post_id).clone(),
                account_id,
                handle,
                created_at: **ts,
                minutes_after_origin: (**ts - narrative.first_seen).num_seconds() as f64 / 60.0,
            }
        })
        .collect();

    let mut timeline: Vec<SpreadPoint> = Vec::new();
    let mut cumulative = 0usize;
    for (ts, _) in &members {
        let offset = (**ts - narrative.first_seen).num_seconds().max(0) / bucket_secs;
        let time = narrative.first_seen + Duration::seconds(offset * bucket_secs);
        cumulative += 1;
        match timeline.last_mut() {
            Some(point) if point.time == time => {
                point.volume += 1;
                point.cumulative = cumulative;
            }
            _ => timeline.push(SpreadPoint {
                time,
                volume: 1,
                cumulative,
            }),
        }
    }

    let peak = timeline
        .iter()
        .max_by(|a, b| a.volume.cmp(&b.volume).then(b.time.cmp(&a.time)))
        .cloned();
    let duration_hours = (narrative.last_seen - narrative.first_seen).num_seconds() as f64 / 3_600.0;

    OriginReport {
        narrative_id: narrative.id.clone(),
        origin_post_id: narrative.origin_post_id.clone(),
        origin_account_id: repo.author_of(&narrative.origin_post_id),
        first_seen: narrative.first_seen,
        last_seen: narrative.last_seen,
        seeds,
        timeline,
        peak,
        duration_hours,
        avg_velocity: narrative.tweet_count() as f64 / duration_hours.max(0.1),
    }
}
