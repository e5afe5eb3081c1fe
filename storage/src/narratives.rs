use crate::repo::StoreError;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sentinel_core::embedding::cosine_similarity;
use sentinel_core::model::{Narrative, NarrativeId, PostId};
use std::sync::atomic::{AtomicU64, Ordering};

/// Narratives keyed by id plus the exclusive post → narrative assignment.
///
/// Updates are optimistic: a writer reads `version`, mutates through
/// [`NarrativeStore::compare_and_update`] and retries on conflict. The
/// assignment map is always locked before the narrative map.
pub struct NarrativeStore {
    narratives: DashMap<NarrativeId, Narrative>,
    assignments: DashMap<PostId, NarrativeId>,
    next_id: AtomicU64,
}

impl NarrativeStore {
    pub fn new() -> Self {
        Self {
            narratives: DashMap::new(),
            assignments: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> NarrativeId {
        format!("nar-{:06}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Opens a narrative seeded by an unassigned post.
    pub fn open(
        &self,
        post_id: &str,
        created_at: DateTime<Utc>,
        embedding: &[f32],
    ) -> Result<NarrativeId, StoreError> {
        match self.assignments.entry(post_id.to_string()) {
            Entry::Occupied(existing) => Err(StoreError::AlreadyAssigned {
                post_id: post_id.to_string(),
                narrative_id: existing.get().clone(),
            }),
            Entry::Vacant(slot) => {
                let id = self.allocate_id();
                let narrative = Narrative::open(id.clone(), post_id.to_string(), created_at, embedding);
                self.narratives.insert(id.clone(), narrative);
                slot.insert(id.clone());
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Narrative> {
        self.narratives.get(id).map(|narrative| narrative.clone())
    }

    pub fn version(&self, id: &str) -> Option<u64> {
        self.narratives.get(id).map(|narrative| narrative.version)
    }

    pub fn narrative_of(&self, post_id: &str) -> Option<NarrativeId> {
        self.assignments.get(post_id).map(|id| id.clone())
    }

    pub fn len(&self) -> usize {
        self.narratives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.narratives.is_empty()
    }

    /// Applies `update` only if the narrative is still at `expected_version`.
    /// The closure must leave the narrative untouched when it fails.
    pub fn compare_and_update<F>(
        &self,
        id: &str,
        expected_version: u64,
        update: F,
    ) -> Result<u64, StoreError>
    where
        F: FnOnce(&mut Narrative) -> Result<(), StoreError>,
    {
        let mut narrative = self
            .narratives
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("narrative", id))?;
        if narrative.version != expected_version {
            return Err(StoreError::Contention {
                narrative_id: id.to_string(),
            });
        }
        update(&mut narrative)?;
        narrative.version += 1;
        Ok(narrative.version)
    }

    /// Read-version, compare-and-update loop bounded by `max_retries`.
    pub fn update_with_retry<F>(
        &self,
        id: &str,
        max_retries: usize,
        mut update: F,
    ) -> Result<u64, StoreError>
    where
        F: FnMut(&mut Narrative) -> Result<(), StoreError>,
    {
        for attempt in 0..=max_retries {
            let version = self
                .version(id)
                .ok_or_else(|| StoreError::not_found("narrative", id))?;
            match self.compare_and_update(id, version, &mut update) {
                Err(StoreError::Contention { .. }) => {
                    tracing::debug!(narrative_id = id, attempt, "narrative version conflict");
                }
                other => return other,
            }
        }
        Err(StoreError::Contention {
            narrative_id: id.to_string(),
        })
    }

    /// Assigns an unassigned post to an existing narrative.
    pub fn join(
        &self,
        id: &str,
        post_id: &str,
        created_at: DateTime<Utc>,
        embedding: &[f32],
        max_retries: usize,
    ) -> Result<u64, StoreError> {
        match self.assignments.entry(post_id.to_string()) {
            Entry::Occupied(existing) => Err(StoreError::AlreadyAssigned {
                post_id: post_id.to_string(),
                narrative_id: existing.get().clone(),
            }),
            Entry::Vacant(slot) => {
                let version = self.update_with_retry(id, max_retries, |narrative| {
                    narrative
                        .admit(post_id, created_at, embedding)
                        .map_err(StoreError::from)
                })?;
                slot.insert(id.to_string());
                Ok(version)
            }
        }
    }

    /// Moves an assigned post to another narrative. Returns the previous
    /// narrative, or `None` when the post already lived in `to`.
    pub fn reassign(
        &self,
        post_id: &str,
        to: &str,
        created_at: DateTime<Utc>,
        embedding: &[f32],
        max_retries: usize,
    ) -> Result<Option<NarrativeId>, StoreError> {
        let mut assignment = self
            .assignments
            .get_mut(post_id)
            .ok_or_else(|| StoreError::not_found("assignment", post_id))?;
        let from = assignment.clone();
        if from == to {
            return Ok(None);
        }
        if !self.narratives.contains_key(to) {
            return Err(StoreError::not_found("narrative", to));
        }

        self.update_with_retry(to, max_retries, |narrative| {
            narrative
                .admit(post_id, created_at, embedding)
                .map_err(StoreError::from)
        })?;
        self.evict_from(&from, post_id, embedding, max_retries)?;
        *assignment = to.to_string();
        Ok(Some(from))
    }

    /// Opens a fresh narrative seeded by `post_id`, detaching the post from
    /// its current narrative first. Returns the new id and the previous one.
    pub fn split_off(
        &self,
        post_id: &str,
        created_at: DateTime<Utc>,
        embedding: &[f32],
        max_retries: usize,
    ) -> Result<(NarrativeId, Option<NarrativeId>), StoreError> {
        match self.assignments.entry(post_id.to_string()) {
            Entry::Vacant(slot) => {
                let id = self.allocate_id();
                let narrative = Narrative::open(id.clone(), post_id.to_string(), created_at, embedding);
                self.narratives.insert(id.clone(), narrative);
                slot.insert(id.clone());
                Ok((id, None))
            }
            Entry::Occupied(mut slot) => {
                let from = slot.get().clone();
                self.evict_from(&from, post_id, embedding, max_retries)?;
                let id = self.allocate_id();
                let narrative = Narrative::open(id.clone(), post_id.to_string(), created_at, embedding);
                self.narratives.insert(id.clone(), narrative);
                slot.insert(id.clone());
                Ok((id, Some(from)))
            }
        }
    }

    /// A narrative left without members is archived in the same update.
    fn evict_from(
        &self,
        id: &str,
        post_id: &str,
        embedding: &[f32],
        max_retries: usize,
    ) -> Result<u64, StoreError> {
        self.update_with_retry(id, max_retries, |narrative| {
            narrative.evict(post_id, Some(embedding));
            if narrative.members.is_empty() {
                narrative.archived = true;
            }
            Ok(())
        })
    }

    /// Marks a narrative archived. Returns `false` if it already was.
    pub fn archive(&self, id: &str, max_retries: usize) -> Result<bool, StoreError> {
        let mut changed = false;
        self.update_with_retry(id, max_retries, |narrative| {
            changed = !narrative.archived;
            narrative.archived = true;
            Ok(())
        })?;
        Ok(changed)
    }

    /// Most similar centroid among non-archived narratives seen at or after
    /// `active_since`; ties resolve to the lowest id.
    pub fn best_match(
        &self,
        embedding: &[f32],
        active_since: DateTime<Utc>,
    ) -> Option<(NarrativeId, f32)> {
        let mut best: Option<(NarrativeId, f32)> = None;
        for entry in self.narratives.iter() {
            if entry.archived || entry.last_seen < active_since {
                continue;
            }
            let Some(similarity) = cosine_similarity(&entry.centroid, embedding) else {
                continue;
            };
            let replace = match &best {
                None => true,
                Some((best_id, best_similarity)) => {
                    similarity > *best_similarity
                        || (similarity == *best_similarity && entry.id < *best_id)
                }
            };
            if replace {
                best = Some((entry.id.clone(), similarity));
            }
        }
        best
    }

    /// Consistent per-narrative copies ordered by id.
    pub fn snapshot(&self) -> Vec<Narrative> {
        let mut narratives: Vec<Narrative> = self
            .narratives
            .iter()
            .map(|narrative| narrative.clone())
            .collect();
        narratives.sort_by(|a, b| a.id.cmp(&b.id));
        narratives
    }

    pub fn ids(&self) -> Vec<NarrativeId> {
        let mut ids: Vec<NarrativeId> = self
            .narratives
            .iter()
            .map(|narrative| narrative.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }
}

impl Default for NarrativeStore {
    fn default() -> Self {
        Self::new()
    }
}
