use chrono::{DateTime, Duration, TimeZone, Utc};
use detection::graph_builder::{GraphBuilder, GraphError};
use sentinel_core::config::GraphConfig;
use sentinel_core::embedding::deterministic_embedding;
use sentinel_core::model::{
    AccountUpdate, BotLabel, BotScore, BurstKind, CommunityClass, EdgeType, Post,
};
use std::collections::{BTreeMap, BTreeSet};
use storage::community::PartitionError;
use storage::repo::Repository;
use storage::snapshot::CheckpointStore;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const BOT_TEXT: &str = "Bank XYZ liquidity crisis, withdraw your savings now!";

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 3, 14, 0, 0).unwrap()
}

fn post(id: &str, author: &str, seconds: i64, text: &str) -> Post {
    Post {
        id: id.to_string(),
        author_id: author.to_string(),
        text: text.to_string(),
        text_hash: text.to_lowercase(),
        created_at: start() + Duration::seconds(seconds),
        urls: BTreeSet::new(),
        hashtags: Vec::new(),
        embedding: Some(deterministic_embedding(text, "feature-hash-v1", 384)),
        reply_to: None,
        retweet_of: None,
        mentions: Vec::new(),
    }
}

fn store(repo: &Repository, posts: &[Post]) {
    for p in posts {
        repo.insert_post(
            p.clone(),
            &AccountUpdate {
                id: p.author_id.clone(),
                handle: Some(p.author_id.clone()),
                ..Default::default()
            },
        );
    }
}

fn score(repo: &Repository, account: &str, value: f64) {
    repo.put_bot_score(BotScore {
        account_id: account.to_string(),
        score: value,
        label: if value >= 0.7 {
            BotLabel::Bot
        } else {
            BotLabel::Organic
        },
        features: BTreeMap::new(),
    });
}

#[test]
fn test_near_identical_posts_in_same_minute_link_accounts() {
    let repo = Repository::new();
    let posts = vec![
        post("p1", "alice", 5, "Bank XYZ liquidity crisis, withdraw your savings now!"),
        post("p2", "bob", 40, "Bank XYZ liquidity crisis - withdraw your savings now"),
    ];
    store(&repo, &posts);

    let builder = GraphBuilder::new(&GraphConfig::default());
    let build = builder.build(&posts, &repo);
    let weight = build
        .graph
        .edge_weight("alice", "bob", EdgeType::SimilarText)
        .expect("similar text edge");
    assert!(weight >= 0.9, "weight {weight}");
    assert!(weight <= 1.0);
}

#[test]
fn test_similar_posts_far_apart_or_same_author_are_not_linked() {
    let repo = Repository::new();
    let posts = vec![
        post("p1", "alice", 0, BOT_TEXT),
        post("p2", "alice", 30, BOT_TEXT),
        post("p3", "bob", 3_600, BOT_TEXT),
    ];
    store(&repo, &posts);

    let build = GraphBuilder::new(&GraphConfig::default()).build(&posts, &repo);
    assert_eq!(build.graph.edge_count(), 0);
    assert_eq!(build.graph.node_count(), 2);
}

#[test]
fn test_interaction_edges_are_normalized_per_type() {
    let repo = Repository::new();
    let original = post("p1", "alice", 0, "Original reporting on the council vote");
    let mut rt1 = post("p2", "bob", 60, "RT council vote");
    rt1.retweet_of = Some("p1".into());
    let mut rt2 = post("p3", "bob", 120, "RT council vote again");
    rt2.retweet_of = Some("p1".into());
    let mut rt3 = post("p4", "carol", 180, "RT the council vote");
    rt3.retweet_of = Some("p1".into());
    let mut reply = post("p5", "carol", 240, "Which way did it go?");
    reply.reply_to = Some("p1".into());
    reply.mentions = vec!["bob".into()];

    let posts = vec![original, rt1, rt2, rt3, reply];
    store(&repo, &posts);

    let build = GraphBuilder::new(&GraphConfig::default()).build(&posts, &repo);
    let g = &build.graph;
    assert_eq!(g.edge_weight("alice", "bob", EdgeType::Retweet), Some(1.0));
    assert_eq!(g.edge_weight("alice", "carol", EdgeType::Retweet), Some(0.5));
    assert_eq!(g.edge_weight("carol", "alice", EdgeType::Reply), Some(1.0));
    assert_eq!(g.edge_weight("bob", "carol", EdgeType::Mention), Some(1.0));
}

#[test]
fn test_exact_and_semantic_bursts_are_reported() {
    let repo = Repository::new();
    let mut posts = vec![
        post("e1", "a1", 0, "Vote early, polls close at noon"),
        post("e2", "a2", 60, "Vote early, polls close at noon"),
        post("e3", "a3", 120, "Vote early, polls close at noon"),
    ];
    for (i, account) in ["b1", "b2", "b3", "b4"].iter().enumerate() {
        posts.push(post(
            &format!("s{i}"),
            account,
            30 + i as i64 * 20,
            &format!("{BOT_TEXT} #{}", i + 1),
        ));
    }
    store(&repo, &posts);

    let build = GraphBuilder::new(&GraphConfig::default()).build(&posts, &repo);
    let exact: Vec<_> = build
        .bursts
        .iter()
        .filter(|b| b.kind == BurstKind::ExactMatch)
        .collect();
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0].account_ids, vec!["a1", "a2", "a3"]);
    assert_eq!(exact[0].time_span_seconds, 120);

    let semantic: Vec<_> = build
        .bursts
        .iter()
        .filter(|b| b.kind == BurstKind::SemanticSimilarity)
        .collect();
    assert_eq!(semantic.len(), 1);
    assert_eq!(semantic[0].account_ids.len(), 4);
    assert!(semantic[0].avg_similarity >= 0.9);
}

fn two_camps(repo: &Repository) -> Vec<Post> {
    let mut posts = Vec::new();
    for (i, bot) in ["bot-a", "bot-b", "bot-c", "bot-d"].iter().enumerate() {
        posts.push(post(&format!("b{i}"), bot, i as i64 * 30, BOT_TEXT));
        score(repo, bot, 0.9);
    }
    let organic = [
        ("org-1", "org-2", "Lovely weather for the cricket final this weekend"),
        ("org-2", "org-3", "New bakery opened on the high street, great croissants"),
        ("org-3", "org-1", "Traffic on the ring road is terrible this morning"),
    ];
    for (i, (author, mentioned, text)) in organic.iter().enumerate() {
        let mut p = post(&format!("o{i}"), author, 300 + i as i64 * 30, text);
        p.mentions = vec![mentioned.to_string()];
        posts.push(p);
        score(repo, author, 0.1);
    }
    store(repo, &posts);
    posts
}

#[test]
fn test_communities_are_classified_from_bot_scores() {
    let repo = Repository::new();
    let posts = two_camps(&repo);
    let builder = GraphBuilder::new(&GraphConfig::default());
    let build = builder.build(&posts, &repo);
    let partition = builder.partition(&build.graph);
    let snapshot = builder.snapshot(build, &partition, &repo, start());

    assert_eq!(snapshot.communities.len(), 2);
    let bots = snapshot.community_of("bot-a").unwrap();
    assert_eq!(bots.classification, CommunityClass::Bot);
    assert_eq!(bots.member_account_ids.len(), 4);
    assert!(bots.cohesion() > 0.99);
    let organic = snapshot.community_of("org-1").unwrap();
    assert_eq!(organic.classification, CommunityClass::Organic);
    assert_eq!(snapshot.nodes.len(), 7);
    assert!(snapshot.modularity > 0.3);
}

#[test]
fn test_partition_is_reproducible() {
    let repo = Repository::new();
    let posts = two_camps(&repo);
    let builder = GraphBuilder::new(&GraphConfig::default());

    let mut reversed = posts.clone();
    reversed.reverse();
    let a = builder.partition(&builder.build(&posts, &repo).graph);
    let b = builder.partition(&builder.build(&reversed, &repo).graph);
    let c = builder.partition(&builder.build(&posts, &repo).graph);
    assert_eq!(a, b);
    assert_eq!(a, c);
}

#[tokio::test]
async fn test_cancelled_partition_reports_failure_then_recovers() {
    let dir = tempdir().unwrap();
    let checkpoints = CheckpointStore::new(dir.path());
    let repo = Repository::new();
    let posts = two_camps(&repo);
    let builder = GraphBuilder::new(&GraphConfig::default());
    let graph = builder.build(&posts, &repo).graph;

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = builder
        .partition_resumable(&graph, Some(&checkpoints), &cancelled)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GraphError::Partition(PartitionError::Cancelled { level: 0 })
    ));

    let partition = builder
        .partition_resumable(&graph, Some(&checkpoints), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(partition, builder.partition(&graph));
}
