// rust/fedsim-core/src/dataset/mod.rs

//! Federated datasets: splits, record formats and partitioning.
//!
//! Each logical client reads one partition of a split, selected by its
//! partition index. Partitions are deterministic: the same index (and seed)
//! always yields the same rows.
//!
//! # Example
//!
//! ```
//! use fedsim_core::dataset::{FederatedDataset, IidPartitioner};
//!
//! let dataset = FederatedDataset::new("toy")
//!     .with_split_rows("train", (0..100).map(|i| i.to_string()))
//!     .with_partitioner("train", IidPartitioner::new(3).unwrap());
//!
//! let sizes: Vec<usize> = (0..3)
//!     .map(|i| dataset.load_partition(i, "train").unwrap().len())
//!     .collect();
//! assert_eq!(sizes, vec![34, 33, 33]);
//! ```

mod federated;
mod format;
mod partitioner;

pub use federated::{FederatedDataset, Rows, SplitSource};
pub use format::{
    parse_format, FixedSizeFormat, LengthPrefixedFormat, NewlineDelimitedFormat, RecordFormat,
};
pub use partitioner::{assign, IidPartitioner, Partition, PartitionRows};
