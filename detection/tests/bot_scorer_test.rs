use chrono::{Duration, TimeZone, Utc};
use detection::bot_scorer::{combine, AccountFeatures, BotScorer, Factor};
use sentinel_core::config::BotConfig;
use sentinel_core::embedding::deterministic_embedding;
use sentinel_core::model::{Account, BotLabel, Post};
use std::collections::BTreeSet;

fn scorer() -> BotScorer {
    BotScorer::new(&BotConfig::default())
}

fn features(ppd: f64, age: Option<f64>, entropy: f64, follow: f64, repeat: f64) -> AccountFeatures {
    AccountFeatures {
        posts_per_day: ppd,
        account_age_days: age,
        handle_entropy: entropy,
        follow_ratio: follow,
        repeat_ratio: repeat,
    }
}

fn post(id: &str, author: &str, text: &str, minutes: i64) -> Post {
    let start = Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap();
    Post {
        id: id.to_string(),
        author_id: author.to_string(),
        text: text.to_string(),
        text_hash: text.to_lowercase(),
        created_at: start + Duration::minutes(minutes),
        urls: BTreeSet::new(),
        hashtags: Vec::new(),
        embedding: Some(deterministic_embedding(text, "feature-hash-v1", 384)),
        reply_to: None,
        retweet_of: None,
        mentions: Vec::new(),
    }
}

#[test]
fn test_score_is_bounded_for_any_magnitude() {
    let scorer = scorer();
    let extremes = [
        features(f64::INFINITY, Some(0.0), f64::INFINITY, f64::INFINITY, f64::INFINITY),
        features(f64::NAN, None, f64::NAN, f64::NAN, f64::NAN),
        features(-1e300, Some(1e300), -5.0, -1.0, -3.0),
        features(1e300, Some(-10.0), 1e300, 1e300, 1e300),
    ];
    for f in &extremes {
        let score = scorer.score("acct", f).score;
        assert!((0.0..=1.0).contains(&score), "score {score} out of range for {f:?}");
    }
}

#[test]
fn test_combination_ignores_factor_order() {
    let scorer = scorer();
    let factors = scorer.factors(&features(45.0, Some(12.0), 3.5, 7.0, 0.3));
    let forward = combine(&factors);

    let mut reversed = factors;
    reversed.reverse();
    assert_eq!(combine(&reversed), forward);

    for shift in 1..factors.len() {
        let mut rotated = factors;
        rotated.rotate_left(shift);
        assert_eq!(combine(&rotated), forward);
    }
}

#[test]
fn test_score_is_monotonic_in_each_factor() {
    let scorer = scorer();
    let base = features(30.0, Some(40.0), 3.4, 4.0, 0.1);
    let base_score = scorer.score("a", &base).score;

    for step in 1..20 {
        let k = step as f64;
        let higher = [
            features(30.0 + k * 10.0, Some(40.0), 3.4, 4.0, 0.1),
            features(30.0, Some(40.0), 3.4 + k * 0.05, 4.0, 0.1),
            features(30.0, Some(40.0), 3.4, 4.0 + k, 0.1),
            features(30.0, Some(40.0), 3.4, 4.0, 0.1 + k * 0.04),
            features(30.0, Some(40.0 - k * 2.0), 3.4, 4.0, 0.1),
        ];
        for f in &higher {
            let score = scorer.score("a", f).score;
            assert!(score >= base_score, "{f:?} scored {score} < {base_score}");
        }
    }
}

#[test]
fn test_contributions_cap_at_their_weight() {
    let factors = [
        Factor::new("a", 10.0, 0.5),
        Factor::new("b", 10.0, 0.5),
        Factor::new("c", 10.0, 0.5),
    ];
    assert_eq!(combine(&factors), 1.0);
}

#[test]
fn test_repetitive_young_account_is_a_bot() {
    let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
    let account = Account {
        id: "b1".into(),
        handle: "q7xk2m9vz4wp8rjt".into(),
        created_at: Some(now - Duration::days(2)),
        followers: 12,
        following: 1_500,
        post_count: 400,
    };
    let posts: Vec<Post> = (0..10)
        .map(|i| {
            post(
                &format!("p{i}"),
                "b1",
                "Bank XYZ liquidity crisis, withdraw your savings now!",
                i,
            )
        })
        .collect();

    let score = scorer().score_account(&account, &posts, now);
    assert_eq!(score.label, BotLabel::Bot);
    assert!(score.score >= 0.9);
    assert_eq!(score.features["repeat_ratio"], 1.0);
    assert!(score.features.contains_key("posting_frequency_factor"));
}

#[test]
fn test_established_varied_account_is_organic() {
    let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
    let account = Account {
        id: "o1".into(),
        handle: "reader42".into(),
        created_at: Some(now - Duration::days(800)),
        followers: 300,
        following: 280,
        post_count: 1_200,
    };
    let posts = vec![
        post("p1", "o1", "Lovely weather for the cricket final this weekend", 0),
        post("p2", "o1", "New bakery opened on the high street, great croissants", 30),
        post("p3", "o1", "Traffic on the ring road is terrible this morning", 60),
    ];

    let score = scorer().score_account(&account, &posts, now);
    assert_eq!(score.label, BotLabel::Organic);
    assert_eq!(score.features["repeat_ratio"], 0.0);
    assert!((score.features["account_age_days"] - 800.0).abs() < 1e-9);
}

#[test]
fn test_rescoring_same_snapshot_is_idempotent() {
    let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
    let account = Account {
        id: "u".into(),
        handle: "someone".into(),
        created_at: None,
        followers: 5,
        following: 50,
        post_count: 3,
    };
    let posts = vec![
        post("p1", "u", "first thoughts on the match", 0),
        post("p2", "u", "second thoughts on the match", 5),
    ];
    let scorer = scorer();
    assert_eq!(
        scorer.score_account(&account, &posts, now),
        scorer.score_account(&account, &posts, now)
    );
}
