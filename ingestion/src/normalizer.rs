use crate::error::IngestionError;
use crate::urls::{extract_hashtags, extract_mention_handles, extract_urls};
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use sentinel_core::model::{AccountUpdate, Post};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// A scraped event as delivered by a platform adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default = "default_platform")]
    pub platform: String,
    pub payload: Value,
}

fn default_platform() -> String {
    "twitter".to_string()
}

impl RawEvent {
    pub fn new(platform: impl Into<String>, payload: Value) -> Self {
        Self {
            platform: platform.into(),
            payload,
        }
    }
}

/// Canonical post plus what the event said about its author. Mentioned
/// handles are resolved to account ids by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub post: Post,
    pub author: AccountUpdate,
    pub mention_handles: Vec<String>,
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Validates and canonicalizes one raw event. `now` bounds how far in the
/// future `created_at` may lie.
pub fn normalize(
    raw: &RawEvent,
    now: DateTime<Utc>,
    max_future_skew: Duration,
) -> Result<NormalizedEvent, IngestionError> {
    let payload = raw
        .payload
        .as_object()
        .ok_or_else(|| IngestionError::malformed("payload is not an object"))?;
    let author_obj = payload.get("author").and_then(Value::as_object);

    let id = string_field(payload, &["id", "tweet_id", "post_id"])
        .ok_or_else(|| IngestionError::malformed("missing id"))?;
    let author_id = string_field(payload, &["author_id", "user_id"])
        .or_else(|| author_obj.and_then(|a| string_field(a, &["id"])))
        .ok_or_else(|| IngestionError::malformed(format!("post {id}: missing author_id")))?;

    let raw_text = string_field(payload, &["text", "text_raw", "full_text"])
        .ok_or_else(|| IngestionError::malformed(format!("post {id}: missing text")))?;
    let text = collapse_whitespace(&raw_text);
    if text.is_empty() {
        return Err(IngestionError::malformed(format!("post {id}: empty text")));
    }

    let created_raw = payload
        .get("created_at")
        .or_else(|| payload.get("timestamp_absolute"))
        .or_else(|| payload.get("timestamp"))
        .ok_or_else(|| IngestionError::malformed(format!("post {id}: missing created_at")))?;
    let created_at = parse_timestamp(created_raw).ok_or_else(|| {
        IngestionError::malformed(format!("post {id}: unparseable created_at {created_raw}"))
    })?;
    if created_at > now + max_future_skew {
        return Err(IngestionError::malformed(format!(
            "post {id}: created_at {created_at} is in the future"
        )));
    }

    let handle = string_field(payload, &["handle", "username", "screen_name"])
        .or_else(|| author_obj.and_then(|a| string_field(a, &["handle", "username"])))
        .map(|h| h.trim_start_matches('@').to_string())
        .filter(|h| !h.is_empty());

    let author_field = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| payload.get(*key))
            .or_else(|| author_obj.and_then(|a| keys.iter().find_map(|key| a.get(*key))))
    };

    let author = AccountUpdate {
        id: author_id.clone(),
        handle,
        created_at: author_field(&["author_created_at", "account_created_at", "created_at_account"])
            .and_then(parse_timestamp),
        followers: author_field(&["followers", "followers_count"]).and_then(parse_count),
        following: author_field(&["following", "following_count", "friends_count"])
            .and_then(parse_count),
        reported_post_count: author_field(&["author_post_count", "statuses_count"])
            .and_then(parse_count),
    };

    let mut mentions: Vec<String> = Vec::new();
    if let Some(ids) = payload.get("mention_ids").and_then(Value::as_array) {
        for mention in ids.iter().filter_map(value_to_string) {
            if mention != author_id && !mentions.contains(&mention) {
                mentions.push(mention);
            }
        }
    }

    let post = Post {
        text_hash: text_hash(&text),
        urls: extract_urls(&text),
        hashtags: extract_hashtags(&text),
        id,
        author_id,
        created_at,
        embedding: None,
        reply_to: string_field(payload, &["reply_to", "in_reply_to_id", "in_reply_to_status_id"]),
        retweet_of: string_field(payload, &["retweet_of", "retweeted_id", "retweeted_status_id"]),
        mentions,
        text,
    };

    Ok(NormalizedEvent {
        mention_handles: extract_mention_handles(&post.text),
        post,
        author,
    })
}

/// Partition key for an unparsed event: the author id when one is present,
/// else the post id. Events of one author therefore stay in arrival order.
pub fn routing_key(raw: &RawEvent) -> Option<String> {
    let payload = raw.payload.as_object()?;
    string_field(payload, &["author_id", "user_id"])
        .or_else(|| {
            payload
                .get("author")
                .and_then(Value::as_object)
                .and_then(|author| string_field(author, &["id"]))
        })
        .or_else(|| string_field(payload, &["id", "tweet_id", "post_id"]))
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 over the lowercase alphanumeric projection of `text`, hex encoded.
/// Texts differing only in case, spacing or punctuation share a hash.
pub fn text_hash(text: &str) -> String {
    let projected: String = text
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    Sha256::digest(projected.as_bytes())
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(value_to_string))
}

fn parse_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

/// RFC 3339, naive ISO-like (read as UTC), or unix seconds / milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw.abs() >= 1_000_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            NAIVE_FORMATS
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        _ => None,
    }
}
