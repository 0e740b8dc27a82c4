//! Exact inner-product index over L2-normalized vectors.

use std::collections::HashSet;

use super::IndexError;

#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    ids: Vec<u64>,
    /// Row-major, `ids.len() * dimension` floats.
    data: Vec<f32>,
    id_set: HashSet<u64>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ids: Vec::new(),
            data: Vec::new(),
            id_set: HashSet::new(),
        }
    }

    /// Empty index with room for `capacity` vectors; fails instead of aborting
    /// when the allocation cannot be made.
    pub fn with_capacity(dimension: usize, capacity: usize) -> Result<Self, IndexError> {
        let mut index = Self::new(dimension);
        index.reserve(capacity)?;
        Ok(index)
    }

    pub fn reserve(&mut self, additional: usize) -> Result<(), IndexError> {
        let floats = additional
            .checked_mul(self.dimension)
            .ok_or(IndexError::Allocation { vectors: additional })?;
        self.data
            .try_reserve(floats)
            .map_err(|_| IndexError::Allocation { vectors: additional })?;
        self.ids
            .try_reserve(additional)
            .map_err(|_| IndexError::Allocation { vectors: additional })?;
        self.id_set
            .try_reserve(additional)
            .map_err(|_| IndexError::Allocation { vectors: additional })?;
        Ok(())
    }

    /// Build from `(vector_id, vector)` pairs. Rows are stored in ascending id
    /// order regardless of input order.
    pub fn build(
        dimension: usize,
        mut vectors: Vec<(u64, Vec<f32>)>,
    ) -> Result<Self, IndexError> {
        vectors.sort_by_key(|(id, _)| *id);
        let mut index = Self::with_capacity(dimension, vectors.len())?;
        for (id, vector) in vectors {
            index.add(&vector, id)?;
        }
        Ok(index)
    }

    pub fn add(&mut self, vector: &[f32], vector_id: u64) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if self.id_set.contains(&vector_id) {
            return Err(IndexError::DuplicateVectorId(vector_id));
        }
        self.reserve(1)?;
        self.id_set.insert(vector_id);
        self.ids.push(vector_id);
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Top `k` vectors by inner product with `query`, highest first; equal
    /// scores come back in ascending id order. `k` is clamped to the size of
    /// the index.
    pub fn query(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let k = k.min(self.ids.len());
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(u64, f32)> = self
            .ids
            .iter()
            .zip(self.data.chunks_exact(self.dimension.max(1)))
            .map(|(&id, row)| {
                let score: f32 = row.iter().zip(query).map(|(a, b)| a * b).sum();
                (id, if score.is_nan() { f32::NEG_INFINITY } else { score })
            })
            .collect();

        let by_rank = |a: &(u64, f32), b: &(u64, f32)| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0));
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_rank);
            scored.truncate(k);
        }
        scored.sort_by(by_rank);
        Ok(scored)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn contains(&self, vector_id: u64) -> bool {
        self.id_set.contains(&vector_id)
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    /// `(vector_id, vector)` in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f32])> {
        self.ids.iter().copied().zip(self.data.chunks_exact(self.dimension.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    #[test]
    fn test_query_orders_and_clamps() {
        let mut index = FlatIndex::new(3);
        index.add(&unit(3, 0), 10).unwrap();
        index.add(&[0.6, 0.8, 0.0], 11).unwrap();
        index.add(&unit(3, 2), 12).unwrap();

        let hits = index.query(&unit(3, 0), 2).unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![10, 11]);
        assert!((hits[1].1 - 0.6).abs() < 1e-6);

        let all = index.query(&unit(3, 0), 100).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_ties_break_by_ascending_id() {
        let mut index = FlatIndex::new(2);
        for id in [7, 3, 5, 1] {
            index.add(&[1.0, 0.0], id).unwrap();
        }
        let hits = index.query(&[1.0, 0.0], 3).unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[test]
    fn test_empty_index_and_zero_k() {
        let index = FlatIndex::new(4);
        assert!(index.query(&unit(4, 1), 5).unwrap().is_empty());

        let mut one = FlatIndex::new(4);
        one.add(&unit(4, 1), 0).unwrap();
        assert!(one.query(&unit(4, 1), 0).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut index = FlatIndex::new(3);
        assert!(matches!(
            index.add(&[1.0, 0.0], 1),
            Err(IndexError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        index.add(&unit(3, 0), 1).unwrap();
        assert!(matches!(index.add(&unit(3, 1), 1), Err(IndexError::DuplicateVectorId(1))));
        assert!(matches!(
            index.query(&[1.0; 4], 1),
            Err(IndexError::DimensionMismatch { expected: 3, actual: 4 })
        ));
    }

    #[test]
    fn test_build_sorts_by_id() {
        let index =
            FlatIndex::build(2, vec![(9, vec![1.0, 0.0]), (2, vec![0.0, 1.0])]).unwrap();
        assert_eq!(index.ids(), &[2, 9]);
        let rows: Vec<(u64, Vec<f32>)> = index.iter().map(|(id, v)| (id, v.to_vec())).collect();
        assert_eq!(rows[0], (2, vec![0.0, 1.0]));
    }

    #[test]
    fn test_staging_copy_does_not_touch_original() {
        let original = FlatIndex::build(2, vec![(0, vec![1.0, 0.0])]).unwrap();
        let mut staging = original.clone();
        staging.add(&[0.0, 1.0], 1).unwrap();
        assert_eq!(original.len(), 1);
        assert_eq!(staging.len(), 2);
    }
}
