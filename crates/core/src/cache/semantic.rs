use std::collections::VecDeque;
use std::sync::RwLock;

/// Cosine-threshold alias index for the embedding and vector-search
/// keyspaces.
///
/// When an exact cache probe misses, a prospective query vector can be
/// matched against recently cached vectors; a neighbor at or above the
/// configured cosine threshold yields the neighbor's cache key so its entry
/// is reused instead of recomputing. The index is a bounded scan list, not a
/// full ANN structure; with a few thousand entries a linear pass is cheaper
/// than maintaining graph indexes.
pub struct SemanticIndex {
    entries: RwLock<VecDeque<(String, Vec<f32>)>>,
    threshold: f32,
    max_entries: usize,
}

impl SemanticIndex {
    pub fn new(threshold: f32, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            threshold,
            max_entries,
        }
    }

    pub fn insert(&self, key: impl Into<String>, vector: Vec<f32>) {
        let mut entries = self.entries.write().expect("semantic index lock poisoned");
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back((key.into(), vector));
    }

    /// Nearest cached key whose cosine similarity meets the threshold.
    pub fn nearest(&self, query: &[f32]) -> Option<(String, f32)> {
        let entries = self.entries.read().expect("semantic index lock poisoned");
        let mut best: Option<(String, f32)> = None;
        for (key, vector) in entries.iter() {
            let similarity = cosine_similarity(query, vector);
            if similarity >= self.threshold
                && best.as_ref().map(|(_, s)| similarity > *s).unwrap_or(true)
            {
                best = Some((key.clone(), similarity));
            }
        }
        best
    }

    pub fn clear(&self) {
        self.entries.write().expect("semantic index lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("semantic index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cosine similarity between two vectors; 0.0 for mismatched or zero-norm
/// input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, -0.25, 1.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn mismatched_lengths_yield_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn nearest_respects_threshold() {
        let index = SemanticIndex::new(0.95, 100);
        index.insert("close", vec![1.0, 0.0, 0.0]);
        index.insert("far", vec![0.0, 1.0, 0.0]);

        // Slightly rotated copy of "close"
        let query = vec![0.999, 0.04, 0.0];
        let (key, similarity) = index.nearest(&query).expect("should find neighbor");
        assert_eq!(key, "close");
        assert!(similarity >= 0.95);

        // Nothing close enough to the diagonal
        assert!(index.nearest(&[0.7, 0.7, 0.0]).is_none());
    }

    #[test]
    fn bounded_size_drops_oldest() {
        let index = SemanticIndex::new(0.9, 2);
        index.insert("a", vec![1.0, 0.0]);
        index.insert("b", vec![0.0, 1.0]);
        index.insert("c", vec![1.0, 1.0]);
        assert_eq!(index.len(), 2);
        assert!(index.nearest(&[1.0, 0.0]).map(|(k, _)| k) != Some("a".to_string()));
    }
}
