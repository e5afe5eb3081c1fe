use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use url::Url;

static RE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'\)\]]+"#).unwrap());
static RE_HASHTAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\w+)").unwrap());
static RE_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w@])@(\w{1,30})").unwrap());

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

/// URLs in `text`, with sentence punctuation stripped from the end.
pub fn extract_urls(text: &str) -> BTreeSet<String> {
    RE_URL
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(TRAILING_PUNCTUATION))
        .filter(|candidate| Url::parse(candidate).is_ok())
        .map(str::to_string)
        .collect()
}

/// Lowercased hashtags in first-seen order.
pub fn extract_hashtags(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    RE_HASHTAG
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

/// Mentioned handles (without `@`, lowercased) in first-seen order.
pub fn extract_mention_handles(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    RE_MENTION
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
        .filter(|handle| seen.insert(handle.clone()))
        .collect()
}

/// Threat-intelligence seam. A production resolver expands shorteners and
/// consults reputation feeds; the core only needs the verdict.
pub trait ThreatIntel: Send + Sync {
    fn is_suspicious(&self, url: &str) -> bool;
}

/// Flags link shorteners and free top-level domains by host name.
pub struct HeuristicThreatIntel {
    domains: BTreeSet<String>,
    suffixes: Vec<String>,
}

impl HeuristicThreatIntel {
    pub fn new(
        domains: impl IntoIterator<Item = impl Into<String>>,
        suffixes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            domains: domains.into_iter().map(|d| d.into().to_lowercase()).collect(),
            suffixes: suffixes.into_iter().map(|s| s.into().to_lowercase()).collect(),
        }
    }

    fn host(url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?.to_lowercase();
        Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
    }
}

impl Default for HeuristicThreatIntel {
    fn default() -> Self {
        Self::new(
            [
                "bit.ly",
                "tinyurl.com",
                "goo.gl",
                "ow.ly",
                "is.gd",
                "buff.ly",
                "cutt.ly",
                "rebrand.ly",
            ],
            [".tk", ".ml", ".ga", ".cf", ".gq"],
        )
    }
}

impl ThreatIntel for HeuristicThreatIntel {
    fn is_suspicious(&self, url: &str) -> bool {
        let Some(host) = Self::host(url) else {
            return false;
        };
        self.domains.contains(&host) || self.suffixes.iter().any(|suffix| host.ends_with(suffix))
    }
}
