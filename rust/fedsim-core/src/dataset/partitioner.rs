// rust/fedsim-core/src/dataset/partitioner.rs

//! Deterministic assignment of rows to partitions.

use std::ops::Range;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Result, SimError};

/// Returns the row range of partition `index` when `dataset_size` rows are
/// split into `partition_count` contiguous groups.
///
/// Group sizes differ by at most one; the first `dataset_size %
/// partition_count` groups get the extra row.
///
/// # Errors
///
/// - A configuration error if `partition_count` is zero.
/// - [`SimError::PartitionOutOfRange`] unless `index < partition_count`.
pub fn assign(dataset_size: usize, partition_count: usize, index: usize) -> Result<Range<usize>> {
    if partition_count == 0 {
        return Err(SimError::config("partition count must be greater than 0"));
    }
    if index >= partition_count {
        return Err(SimError::partition_out_of_range(index, partition_count));
    }

    let per_partition = dataset_size / partition_count;
    let remainder = dataset_size % partition_count;

    // Partitions with index < remainder get one extra row
    let start = index * per_partition + index.min(remainder);
    let len = per_partition + usize::from(index < remainder);
    Ok(start..start + len)
}

/// Rows of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionRows {
    Contiguous(Range<usize>),
    /// Explicit row indices, from a seeded permutation.
    Indices(Arc<[usize]>),
}

/// An immutable partition of a split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub count: usize,
    pub rows: PartitionRows,
}

impl Partition {
    pub fn len(&self) -> usize {
        match &self.rows {
            PartitionRows::Contiguous(range) => range.len(),
            PartitionRows::Indices(indices) => indices.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row index of the `i`-th row of this partition.
    pub fn row(&self, i: usize) -> Option<usize> {
        match &self.rows {
            PartitionRows::Contiguous(range) => {
                let row = range.start.checked_add(i)?;
                (row < range.end).then_some(row)
            }
            PartitionRows::Indices(indices) => indices.get(i).copied(),
        }
    }

    pub fn to_indices(&self) -> Vec<usize> {
        match &self.rows {
            PartitionRows::Contiguous(range) => range.clone().collect(),
            PartitionRows::Indices(indices) => indices.to_vec(),
        }
    }
}

/// Splits a split into `num_partitions` IID partitions.
///
/// Without a seed, partitions are contiguous row ranges. With a seed, the
/// rows are permuted once by a seeded RNG and the permutation is cut into
/// contiguous chunks; the same seed always yields the same partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IidPartitioner {
    num_partitions: usize,
    seed: Option<u64>,
}

impl IidPartitioner {
    /// # Errors
    ///
    /// Returns a configuration error if `num_partitions` is zero.
    pub fn new(num_partitions: usize) -> Result<Self> {
        if num_partitions == 0 {
            return Err(SimError::config("num_partitions must be greater than 0"));
        }
        Ok(Self {
            num_partitions,
            seed: None,
        })
    }

    #[must_use]
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Partition `index` of a split with `dataset_size` rows.
    pub fn partition(&self, dataset_size: usize, index: usize) -> Result<Partition> {
        let range = assign(dataset_size, self.num_partitions, index)?;
        let rows = match self.seed {
            None => PartitionRows::Contiguous(range),
            Some(seed) => {
                let mut permutation: Vec<usize> = (0..dataset_size).collect();
                permutation.shuffle(&mut StdRng::seed_from_u64(seed));
                PartitionRows::Indices(Arc::from(&permutation[range]))
            }
        };
        Ok(Partition {
            index,
            count: self.num_partitions,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hundred_rows_three_partitions() {
        let ranges: Vec<_> = (0..3).map(|i| assign(100, 3, i).unwrap()).collect();
        assert_eq!(ranges, vec![0..34, 34..67, 67..100]);
    }

    #[test]
    fn test_more_partitions_than_rows() {
        let sizes: Vec<_> = (0..5).map(|i| assign(3, 5, i).unwrap().len()).collect();
        assert_eq!(sizes, vec![1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_out_of_range_and_zero_count() {
        assert!(matches!(
            assign(10, 3, 3),
            Err(SimError::PartitionOutOfRange { index: 3, count: 3 })
        ));
        assert!(assign(10, 0, 0).unwrap_err().is_configuration());
        assert!(IidPartitioner::new(0).is_err());
    }

    #[test]
    fn test_seeded_partitions_reproducible() {
        let a = IidPartitioner::new(4).unwrap().with_seed(Some(42));
        let b = IidPartitioner::new(4).unwrap().with_seed(Some(42));
        let c = IidPartitioner::new(4).unwrap().with_seed(Some(7));

        let pa = a.partition(40, 1).unwrap();
        assert_eq!(pa, b.partition(40, 1).unwrap());
        assert_eq!(pa.len(), 10);
        assert_ne!(pa.to_indices(), c.partition(40, 1).unwrap().to_indices());
    }

    #[test]
    fn test_partition_row_lookup() {
        let p = IidPartitioner::new(3).unwrap().partition(100, 1).unwrap();
        assert_eq!(p.row(0), Some(34));
        assert_eq!(p.row(32), Some(66));
        assert_eq!(p.row(33), None);
    }

    proptest! {
        #[test]
        fn prop_partitions_cover_rows_exactly_once(size in 0usize..500, count in 1usize..40) {
            let mut seen = vec![0u8; size];
            let mut lengths = Vec::new();
            for index in 0..count {
                let range = assign(size, count, index).unwrap();
                lengths.push(range.len());
                for row in range {
                    seen[row] += 1;
                }
            }
            prop_assert!(seen.iter().all(|&n| n == 1));
            let max = *lengths.iter().max().unwrap();
            let min = *lengths.iter().min().unwrap();
            prop_assert!(max - min <= 1);
        }

        #[test]
        fn prop_seeded_partitions_are_disjoint(size in 0usize..300, count in 1usize..20, seed in any::<u64>()) {
            let partitioner = IidPartitioner::new(count).unwrap().with_seed(Some(seed));
            let mut all: Vec<usize> = (0..count)
                .flat_map(|i| partitioner.partition(size, i).unwrap().to_indices())
                .collect();
            all.sort_unstable();
            prop_assert_eq!(all, (0..size).collect::<Vec<_>>());
        }

        #[test]
        fn prop_same_index_same_partition(size in 0usize..300, count in 1usize..20, seed in proptest::option::of(any::<u64>())) {
            let partitioner = IidPartitioner::new(count).unwrap().with_seed(seed);
            let index = count / 2;
            prop_assert_eq!(
                partitioner.partition(size, index).unwrap(),
                partitioner.partition(size, index).unwrap()
            );
        }
    }
}
