use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use chrono::{DateTime, Utc};
use sentinel_core::error::{ErrorKind, SentinelError};
use sentinel_core::model::{
    Account, AccountId, AccountUpdate, BotScore, MembershipError, NarrativeId, Post, PostId,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("narrative {narrative_id} changed concurrently")]
    Contention { narrative_id: NarrativeId },
    #[error("post {post_id} already belongs to narrative {narrative_id}")]
    AlreadyAssigned {
        post_id: PostId,
        narrative_id: NarrativeId,
    },
    #[error("membership rejected: {0}")]
    Membership(#[from] MembershipError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl SentinelError for StoreError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Contention { .. } => ErrorKind::ClusterContention,
            StoreError::AlreadyAssigned { .. } | StoreError::Membership(_) => {
                ErrorKind::InvalidArgument
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// In-memory store of posts, accounts and bot scores. Every map is sharded,
/// so writers touching different keys never contend.
pub struct Repository {
    posts: DashMap<PostId, Post>,
    accounts: DashMap<AccountId, Account>,
    handles: DashMap<String, AccountId>,
    author_posts: DashMap<AccountId, Vec<(DateTime<Utc>, PostId)>>,
    bot_scores: DashMap<AccountId, BotScore>,
}

impl Repository {
    pub fn new() -> Self {
        Self {
            posts: DashMap::new(),
            accounts: DashMap::new(),
            handles: DashMap::new(),
            author_posts: DashMap::new(),
            bot_scores: DashMap::new(),
        }
    }

    /// Stores a post once per id and folds the author's profile into the
    /// account table. A repeated id changes nothing.
    pub fn insert_post(&self, post: Post, author: &AccountUpdate) -> InsertOutcome {
        let author_id = post.author_id.clone();
        let post_id = post.id.clone();
        let created_at = post.created_at;

        match self.posts.entry(post_id.clone()) {
            Entry::Occupied(_) => return InsertOutcome::Duplicate,
            Entry::Vacant(slot) => {
                slot.insert(post);
            }
        }

        self.upsert_account(author);

        let mut timeline = self.author_posts.entry(author_id).or_default();
        let position = timeline
            .binary_search(&(created_at, post_id.clone()))
            .unwrap_or_else(|insert_at| insert_at);
        timeline.insert(position, (created_at, post_id));

        InsertOutcome::Inserted
    }

    pub fn upsert_account(&self, update: &AccountUpdate) {
        match self.accounts.entry(update.id.clone()) {
            Entry::Occupied(mut existing) => {
                let previous_handle = existing.get().handle.clone();
                existing.get_mut().apply(update);
                let handle = existing.get().handle.clone();
                drop(existing);
                if handle != previous_handle {
                    self.handles.remove(&previous_handle.to_lowercase());
                }
                self.register_handle(&handle, &update.id);
            }
            Entry::Vacant(slot) => {
                let account = Account::from_update(update);
                let handle = account.handle.clone();
                slot.insert(account);
                self.register_handle(&handle, &update.id);
            }
        }
    }

    fn register_handle(&self, handle: &str, account_id: &str) {
        if !handle.is_empty() {
            self.handles
                .insert(handle.to_lowercase(), account_id.to_string());
        }
    }

    /// Write-once; returns `Ok(false)` when the post already had one.
    pub fn attach_embedding(&self, post_id: &str, embedding: Vec<f32>) -> Result<bool, StoreError> {
        let mut post = self
            .posts
            .get_mut(post_id)
            .ok_or_else(|| StoreError::not_found("post", post_id))?;
        Ok(post.attach_embedding(embedding))
    }

    pub fn get_post(&self, post_id: &str) -> Option<Post> {
        self.posts.get(post_id).map(|post| post.clone())
    }

    pub fn get_account(&self, account_id: &str) -> Option<Account> {
        self.accounts.get(account_id).map(|account| account.clone())
    }

    pub fn resolve_handle(&self, handle: &str) -> Option<AccountId> {
        let key = handle.trim_start_matches('@').to_lowercase();
        self.handles.get(&key).map(|id| id.clone())
    }

    pub fn account_by_handle(&self, handle: &str) -> Option<Account> {
        self.resolve_handle(handle)
            .and_then(|id| self.get_account(&id))
    }

    pub fn author_of(&self, post_id: &str) -> Option<AccountId> {
        self.posts.get(post_id).map(|post| post.author_id.clone())
    }

    /// Newest `limit` posts by the account, oldest first.
    pub fn recent_posts_by(&self, account_id: &str, limit: usize) -> Vec<Post> {
        let ids: Vec<PostId> = match self.author_posts.get(account_id) {
            Some(timeline) => {
                let skip = timeline.len().saturating_sub(limit);
                timeline[skip..].iter().map(|(_, id)| id.clone()).collect()
            }
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get_post(id)).collect()
    }

    /// Posts by the account, oldest first.
    pub fn post_times_by(&self, account_id: &str) -> Vec<DateTime<Utc>> {
        self.author_posts
            .get(account_id)
            .map(|timeline| timeline.iter().map(|(ts, _)| *ts).collect())
            .unwrap_or_default()
    }

    /// Posts with `from <= created_at <= to`, ordered by time then id.
    pub fn posts_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Post> {
        let mut posts: Vec<Post> = self
            .posts
            .iter()
            .filter(|post| post.created_at >= from && post.created_at <= to)
            .map(|post| post.clone())
            .collect();
        posts.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        posts
    }

    /// Stored posts still waiting for an embedding, ordered by time then id.
    pub fn unembedded_posts(&self) -> Vec<Post> {
        let mut posts: Vec<Post> = self
            .posts
            .iter()
            .filter(|post| post.embedding.is_none())
            .map(|post| post.clone())
            .collect();
        posts.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        posts
    }

    pub fn post_times(&self) -> Vec<DateTime<Utc>> {
        let mut times: Vec<DateTime<Utc>> = self.posts.iter().map(|post| post.created_at).collect();
        times.sort();
        times
    }

    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .map(|account| account.clone())
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    pub fn post_count(&self) -> usize {
        self.posts.len()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn put_bot_score(&self, score: BotScore) {
        self.bot_scores.insert(score.account_id.clone(), score);
    }

    pub fn bot_score(&self, account_id: &str) -> Option<BotScore> {
        self.bot_scores.get(account_id).map(|score| score.clone())
    }

    pub fn bot_scores(&self) -> Vec<BotScore> {
        let mut scores: Vec<BotScore> = self
            .bot_scores
            .iter()
            .map(|score| score.clone())
            .collect();
        scores.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        scores
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}
