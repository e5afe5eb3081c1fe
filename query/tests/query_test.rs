use chrono::{DateTime, Duration, TimeZone, Utc};
use query::{
    BotParams, GraphParams, NarrativeParams, QueryError, QueryService, SnapshotPublisher,
    StatsParams,
};
use sentinel_core::clock::ManualClock;
use sentinel_core::config::QueryConfig;
use sentinel_core::error::{ErrorKind, SentinelError};
use sentinel_core::model::{
    AccountUpdate, BotLabel, BotScore, Community, CommunityClass, CommunityEdge, EdgeType,
    GraphSnapshot, Post, RiskLevel,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use storage::narratives::NarrativeStore;
use storage::repo::Repository;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
}

struct Fixture {
    repo: Arc<Repository>,
    store: Arc<NarrativeStore>,
    graph: Arc<SnapshotPublisher>,
    service: QueryService,
}

fn fixture() -> Fixture {
    let repo = Arc::new(Repository::new());
    let store = Arc::new(NarrativeStore::new());
    let graph = Arc::new(SnapshotPublisher::empty(now()));
    let service = QueryService::new(
        repo.clone(),
        store.clone(),
        graph.clone(),
        Arc::new(ManualClock::new(now())),
        &QueryConfig::default(),
    );
    Fixture {
        repo,
        store,
        graph,
        service,
    }
}

fn add_post(repo: &Repository, id: &str, author: &str, at: DateTime<Utc>) -> Post {
    let post = Post {
        id: id.to_string(),
        author_id: author.to_string(),
        text: format!("text of {id}"),
        text_hash: id.to_string(),
        created_at: at,
        urls: BTreeSet::new(),
        hashtags: Vec::new(),
        embedding: Some(vec![1.0, 0.0]),
        reply_to: None,
        retweet_of: None,
        mentions: Vec::new(),
    };
    repo.insert_post(
        post.clone(),
        &AccountUpdate {
            id: author.to_string(),
            handle: Some(format!("{author}_h")),
            followers: Some(10),
            ..Default::default()
        },
    );
    post
}

fn narrative_with_risk(store: &NarrativeStore, post: &Post, risk: f64) -> String {
    let id = store.open(&post.id, post.created_at, &[1.0, 0.0]).unwrap();
    store
        .update_with_retry(&id, 3, |n| {
            n.risk_score = risk;
            n.risk_level = if risk >= 0.8 {
                RiskLevel::Critical
            } else {
                RiskLevel::Low
            };
            Ok(())
        })
        .unwrap();
    id
}

fn score(repo: &Repository, account: &str, value: f64, label: BotLabel) {
    repo.put_bot_score(BotScore {
        account_id: account.to_string(),
        score: value,
        label,
        features: BTreeMap::from([("repeat_ratio".to_string(), value)]),
    });
}

#[test]
fn test_narratives_sorted_by_risk_then_age() {
    let f = fixture();
    let p1 = add_post(&f.repo, "p1", "a", now() - Duration::hours(3));
    let p2 = add_post(&f.repo, "p2", "b", now() - Duration::hours(2));
    let p3 = add_post(&f.repo, "p3", "c", now() - Duration::hours(1));
    let p4 = add_post(&f.repo, "p4", "d", now() - Duration::hours(4));

    let older_tie = narrative_with_risk(&f.store, &p1, 0.5);
    let newer_tie = narrative_with_risk(&f.store, &p2, 0.5);
    let riskiest = narrative_with_risk(&f.store, &p3, 0.9);
    let archived = narrative_with_risk(&f.store, &p4, 0.99);
    f.store.archive(&archived, 3).unwrap();

    let listed = f.service.narratives(&NarrativeParams::default()).unwrap();
    assert_eq!(listed.as_of, now());
    let ids: Vec<&str> = listed.data.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec![riskiest.as_str(), older_tie.as_str(), newer_tie.as_str()]);
    assert_eq!(listed.data[0].tweet_count, 1);
    assert_eq!(listed.data[0].bot_ratio_interpretation, "LOW");

    let limited = f
        .service
        .narratives(&NarrativeParams {
            limit: Some(1),
            min_risk: None,
        })
        .unwrap();
    assert_eq!(limited.data.len(), 1);

    let filtered = f
        .service
        .narratives(&NarrativeParams {
            limit: None,
            min_risk: Some(0.6),
        })
        .unwrap();
    assert_eq!(filtered.data.len(), 1);

    // archived narratives are still addressable directly
    assert!(f.service.narrative(&archived).unwrap().archived);
}

#[test]
fn test_bots_above_floor_joined_with_accounts() {
    let f = fixture();
    for (account, value, label) in [
        ("a", 0.95, BotLabel::Bot),
        ("b", 0.55, BotLabel::Suspicious),
        ("c", 0.10, BotLabel::Organic),
        ("d", 0.95, BotLabel::Bot),
    ] {
        add_post(&f.repo, &format!("p-{account}"), account, now());
        score(&f.repo, account, value, label);
    }

    let bots = f.service.bots(&BotParams::default()).unwrap();
    let ids: Vec<&str> = bots.data.iter().map(|b| b.account_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "d", "b"]);
    assert_eq!(bots.data[0].handle, "a_h");
    assert_eq!(bots.data[0].followers, 10);
    assert_eq!(bots.data[0].features["repeat_ratio"], 0.95);

    let strict = f
        .service
        .bots(&BotParams {
            min_score: Some(0.9),
            limit: Some(1),
        })
        .unwrap();
    assert_eq!(strict.data.len(), 1);
    assert_eq!(strict.data[0].label, BotLabel::Bot);

    let err = f
        .service
        .bots(&BotParams {
            min_score: Some(2.0),
            limit: None,
        })
        .unwrap_err();
    assert_eq!(err.error_kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_stats_buckets_volume_over_lookback() {
    let f = fixture();
    let at = |h: u32, m: u32| Utc.with_ymd_and_hms(2026, 5, 1, h, m, 0).unwrap();
    add_post(&f.repo, "early", "a", at(9, 59));
    add_post(&f.repo, "b1", "a", at(10, 5));
    add_post(&f.repo, "b2", "b", at(10, 20));
    add_post(&f.repo, "b3", "b", at(11, 45));
    add_post(&f.repo, "b4", "c", at(12, 0));
    add_post(&f.repo, "future", "c", at(12, 10));
    score(&f.repo, "a", 0.9, BotLabel::Bot);
    score(&f.repo, "b", 0.2, BotLabel::Organic);

    let stats = f
        .service
        .stats(&StatsParams {
            bucket_minutes: None,
            lookback_hours: Some(2),
        })
        .unwrap();
    assert_eq!(stats.bucket_minutes, 30);
    let times: Vec<DateTime<Utc>> = stats.timeline_data.iter().map(|p| p.time).collect();
    assert_eq!(
        times,
        vec![at(10, 0), at(10, 30), at(11, 0), at(11, 30), at(12, 0)]
    );
    let volumes: Vec<usize> = stats.timeline_data.iter().map(|p| p.volume).collect();
    assert_eq!(volumes, vec![2, 0, 0, 1, 1]);

    assert_eq!(stats.kpi.tweets, 6);
    assert_eq!(stats.kpi.users, 3);
    assert_eq!(stats.kpi.bots, 1);
    assert_eq!(stats.kpi.active_narratives, 0);
}

#[test]
fn test_default_stats_cover_a_day() {
    let f = fixture();
    let stats = f.service.stats(&StatsParams::default()).unwrap();
    assert_eq!(stats.timeline_data.len(), 49);
    assert!(stats.timeline_data.iter().all(|p| p.volume == 0));
}

fn published_graph() -> GraphSnapshot {
    let mut snapshot = GraphSnapshot::empty(now());
    snapshot.nodes = vec!["a".into(), "b".into(), "c".into()];
    snapshot.edges = vec![
        CommunityEdge {
            source_account_id: "a".into(),
            target_account_id: "b".into(),
            edge_type: EdgeType::SimilarText,
            weight: 0.95,
        },
        CommunityEdge {
            source_account_id: "b".into(),
            target_account_id: "c".into(),
            edge_type: EdgeType::Mention,
            weight: 1.0,
        },
    ];
    snapshot.membership = BTreeMap::from([
        ("a".to_string(), "com-a".to_string()),
        ("b".to_string(), "com-a".to_string()),
        ("c".to_string(), "com-c".to_string()),
    ]);
    snapshot.communities = vec![
        Community {
            id: "com-a".into(),
            member_account_ids: BTreeSet::from(["a".to_string(), "b".to_string()]),
            modularity: 0.2,
            classification: CommunityClass::Bot,
            mean_bot_score: 0.9,
            internal_weight: 0.95,
            external_weight: 1.0,
        },
        Community {
            id: "com-c".into(),
            member_account_ids: BTreeSet::from(["c".to_string()]),
            modularity: 0.0,
            classification: CommunityClass::Organic,
            mean_bot_score: 0.1,
            internal_weight: 0.0,
            external_weight: 1.0,
        },
    ];
    snapshot
}

#[test]
fn test_graph_global_and_scoped_to_narrative() {
    let f = fixture();
    let pa = add_post(&f.repo, "pa", "a", now() - Duration::minutes(5));
    let pb = add_post(&f.repo, "pb", "b", now() - Duration::minutes(4));
    add_post(&f.repo, "pc", "c", now() - Duration::minutes(3));
    score(&f.repo, "a", 0.9, BotLabel::Bot);
    let narrative = f.store.open(&pa.id, pa.created_at, &[1.0, 0.0]).unwrap();
    f.store
        .join(&narrative, &pb.id, pb.created_at, &[1.0, 0.0], 3)
        .unwrap();

    assert_eq!(f.graph.publish(published_graph()), 1);

    let global = f.service.graph(&GraphParams::default()).unwrap();
    assert_eq!(global.version, 1);
    assert_eq!(global.nodes.len(), 3);
    assert_eq!(global.links.len(), 2);
    assert_eq!(global.communities.len(), 2);
    assert_eq!(global.nodes[0].handle.as_deref(), Some("a_h"));
    assert_eq!(global.nodes[0].label, Some(BotLabel::Bot));
    assert_eq!(global.nodes[0].community.as_deref(), Some("com-a"));

    let scoped = f
        .service
        .graph(&GraphParams {
            narrative_id: Some(narrative.clone()),
        })
        .unwrap();
    let nodes: Vec<&str> = scoped.nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(nodes, vec!["a", "b"]);
    assert_eq!(scoped.links.len(), 1);
    assert_eq!(scoped.links[0].edge_type, EdgeType::SimilarText);
    assert_eq!(scoped.communities.len(), 1);

    let missing = f
        .service
        .graph(&GraphParams {
            narrative_id: Some("nar-missing".into()),
        })
        .unwrap_err();
    assert_eq!(missing.error_kind(), ErrorKind::NotFound);
}

#[test]
fn test_user_lookup_by_handle() {
    let f = fixture();
    let p = add_post(&f.repo, "p1", "acct-7", now());
    score(&f.repo, "acct-7", 0.8, BotLabel::Bot);
    let narrative = f.store.open(&p.id, p.created_at, &[1.0, 0.0]).unwrap();

    let user = f.service.user("@ACCT-7_H").unwrap();
    assert_eq!(user.account.id, "acct-7");
    assert_eq!(user.bot_score.unwrap().label, BotLabel::Bot);
    assert_eq!(user.narratives, vec![narrative]);
    assert!(user.community.is_none());

    let err = f.service.user("nobody").unwrap_err();
    assert_eq!(
        err,
        QueryError::NotFound {
            entity: "account",
            id: "nobody".into()
        }
    );
}

#[test]
fn test_origin_of_unknown_narrative_is_not_found() {
    let f = fixture();
    let p = add_post(&f.repo, "p1", "a", now() - Duration::minutes(10));
    let id = f.store.open(&p.id, p.created_at, &[1.0, 0.0]).unwrap();

    let report = f.service.origin(&id).unwrap();
    assert_eq!(report.origin_post_id, "p1");
    assert_eq!(report.origin_account_id.as_deref(), Some("a"));
    assert!(matches!(
        f.service.origin("nar-404"),
        Err(QueryError::NotFound { .. })
    ));
}

#[test]
fn test_readers_never_see_torn_graph_snapshots() {
    let f = fixture();
    let f = &f;

    std::thread::scope(|scope| {
        scope.spawn(move || {
            for version in 1..=200u64 {
                let mut snapshot = GraphSnapshot::empty(now());
                snapshot.nodes = (0..version).map(|i| format!("n{i}")).collect();
                f.graph.publish(snapshot);
            }
        });
        for _ in 0..4 {
            scope.spawn(move || {
                let mut last = 0;
                for _ in 0..500 {
                    let view = f.service.graph(&GraphParams::default()).unwrap();
                    assert_eq!(view.nodes.len() as u64, view.version);
                    assert!(view.version >= last);
                    last = view.version;
                }
            });
        }
    });
    assert_eq!(f.graph.version(), 200);
}
