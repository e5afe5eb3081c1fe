use sentinel_core::embedding::l2_normalize;
use sentinel_core::error::{ErrorKind, SentinelError};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    #[error("similarity index is not initialized")]
    Unavailable,
    #[error("vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl SentinelError for IndexError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            IndexError::Unavailable => ErrorKind::IndexUnavailable,
            IndexError::DimensionMismatch { .. } => ErrorKind::InvalidArgument,
        }
    }
}

/// Contiguous storage of unit vectors; exact cosine by dot product.
struct FlatIndex {
    dims: usize,
    ids: Vec<String>,
    slots: HashMap<String, usize>,
    vectors: Vec<f32>,
}

impl FlatIndex {
    fn new(dims: usize) -> Self {
        Self {
            dims,
            ids: Vec::new(),
            slots: HashMap::new(),
            vectors: Vec::new(),
        }
    }

    fn row(&self, slot: usize) -> &[f32] {
        &self.vectors[slot * self.dims..(slot + 1) * self.dims]
    }
}

/// Incrementally-built similarity index over post embeddings. Readers share
/// the lock; inserts append without rebuilding.
pub struct SimilarityIndex {
    inner: RwLock<Option<FlatIndex>>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    pub fn with_dimension(dims: usize) -> Self {
        Self {
            inner: RwLock::new(Some(FlatIndex::new(dims))),
        }
    }

    /// Returns `false` when the index was already initialized.
    pub fn initialize(&self, dims: usize) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.is_some() {
            return false;
        }
        *inner = Some(FlatIndex::new(dims));
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Inserts a vector; the first insert initializes an uninitialized index.
    /// Returns `false` when the id is already present (embeddings are write-once).
    pub fn insert(&self, id: &str, vector: &[f32]) -> Result<bool, IndexError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let index = inner.get_or_insert_with(|| FlatIndex::new(vector.len()));

        if vector.len() != index.dims {
            return Err(IndexError::DimensionMismatch {
                expected: index.dims,
                actual: vector.len(),
            });
        }
        if index.slots.contains_key(id) {
            return Ok(false);
        }

        let mut unit = vector.to_vec();
        l2_normalize(&mut unit);
        let slot = index.ids.len();
        index.ids.push(id.to_string());
        index.slots.insert(id.to_string(), slot);
        index.vectors.extend_from_slice(&unit);
        Ok(true)
    }

    /// Top-`k` neighbours with cosine at least `min_similarity`, most similar
    /// first, ties broken by id.
    pub fn query_nearest(
        &self,
        vector: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(String, f32)>, IndexError> {
        self.query_nearest_where(vector, k, min_similarity, |_| true)
    }

    /// As `query_nearest`, considering only ids accepted by `accept`. The
    /// filter runs before the top-`k` cut.
    pub fn query_nearest_where<F>(
        &self,
        vector: &[f32],
        k: usize,
        min_similarity: f32,
        accept: F,
    ) -> Result<Vec<(String, f32)>, IndexError>
    where
        F: Fn(&str) -> bool,
    {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let index = inner.as_ref().ok_or(IndexError::Unavailable)?;

        if index.ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != index.dims {
            return Err(IndexError::DimensionMismatch {
                expected: index.dims,
                actual: vector.len(),
            });
        }

        let mut query = vector.to_vec();
        l2_normalize(&mut query);

        let mut scored: Vec<(usize, f32)> = (0..index.ids.len())
            .filter(|slot| accept(&index.ids[*slot]))
            .filter_map(|slot| {
                let similarity: f32 = index
                    .row(slot)
                    .iter()
                    .zip(query.iter())
                    .map(|(a, b)| a * b)
                    .sum();
                (similarity >= min_similarity).then_some((slot, similarity))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| index.ids[a.0].cmp(&index.ids[b.0]))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(slot, similarity)| (index.ids[slot].clone(), similarity))
            .collect())
    }

    pub fn get(&self, id: &str) -> Option<Vec<f32>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let index = inner.as_ref()?;
        index.slots.get(id).map(|slot| index.row(*slot).to_vec())
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|index| index.ids.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SimilarityIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_before_initialization_is_unavailable() {
        let index = SimilarityIndex::new();
        let err = index.query_nearest(&[1.0, 0.0], 3, 0.0).unwrap_err();
        assert_eq!(err, IndexError::Unavailable);
        assert_eq!(err.error_kind(), ErrorKind::IndexUnavailable);
    }

    #[test]
    fn initialized_empty_index_returns_empty_sequence() {
        let index = SimilarityIndex::with_dimension(3);
        let results = index.query_nearest(&[1.0, 0.0, 0.0], 3, 0.0).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn nearest_neighbours_are_ordered_and_filtered() {
        let index = SimilarityIndex::new();
        index.insert("p1", &[1.0, 0.0, 0.0]).unwrap();
        index.insert("p2", &[0.0, 1.0, 0.0]).unwrap();
        index.insert("p3", &[0.9, 0.1, 0.0]).unwrap();

        let results = index.query_nearest(&[1.0, 0.0, 0.0], 5, 0.5).unwrap();
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p3"]);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn filter_applies_before_the_top_k_cut() {
        let index = SimilarityIndex::new();
        index.insert("old-1", &[1.0, 0.0]).unwrap();
        index.insert("old-2", &[1.0, 0.01]).unwrap();
        index.insert("win-1", &[1.0, 0.2]).unwrap();
        index.insert("win-2", &[0.0, 1.0]).unwrap();

        let results = index
            .query_nearest_where(&[1.0, 0.0], 1, 0.5, |id| id.starts_with("win"))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "win-1");
    }

    #[test]
    fn insert_is_write_once_and_checks_dimension() {
        let index = SimilarityIndex::new();
        assert!(index.insert("p1", &[1.0, 0.0]).unwrap());
        assert!(!index.insert("p1", &[0.0, 1.0]).unwrap());
        assert_eq!(index.get("p1"), Some(vec![1.0, 0.0]));
        assert!(matches!(
            index.insert("p2", &[1.0]),
            Err(IndexError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }
}
