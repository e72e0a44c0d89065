// rust/fedsim-core/src/dataset/federated.rs

//! A named dataset with splits and per-split partitioners.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::format::{parse_format, NewlineDelimitedFormat, RecordFormat};
use super::partitioner::{IidPartitioner, Partition};
use crate::config::DatasetConfig;
use crate::error::{Result, SimError};
use crate::storage::{LocalStorage, StorageBackend};

/// Where a split's rows come from.
#[derive(Debug, Clone)]
pub enum SplitSource {
    /// Rows held in memory.
    Rows(Arc<[Bytes]>),
    /// A record file read through the dataset's storage backend.
    File(PathBuf),
}

/// A view over some rows of a loaded split.
#[derive(Debug, Clone)]
pub struct Rows {
    split: String,
    data: Arc<[Bytes]>,
    /// `None` means every row of the split.
    partition: Option<Partition>,
}

impl Rows {
    pub fn split(&self) -> &str {
        &self.split
    }

    pub fn partition(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    pub fn len(&self) -> usize {
        match &self.partition {
            Some(p) => p.len(),
            None => self.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<&Bytes> {
        let row = match &self.partition {
            Some(p) => p.row(i)?,
            None => i,
        };
        self.data.get(row)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }
}

/// A dataset whose splits are loaded on first use and partitioned on demand.
///
/// Partition queries check that the split exists before checking that it has
/// a partitioner, so a typo in the split name is reported as such.
pub struct FederatedDataset {
    name: String,
    sources: BTreeMap<String, SplitSource>,
    partitioners: BTreeMap<String, IidPartitioner>,
    storage: Arc<dyn StorageBackend>,
    format: Arc<dyn RecordFormat>,
    loaded: Mutex<BTreeMap<String, Arc<[Bytes]>>>,
}

impl FederatedDataset {
    /// Creates an empty dataset reading files relative to the current
    /// directory as newline-delimited records.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: BTreeMap::new(),
            partitioners: BTreeMap::new(),
            storage: Arc::new(LocalStorage::new(".")),
            format: Arc::new(NewlineDelimitedFormat::new()),
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    /// Builds a file-backed dataset from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown record format or a zero
    /// partition count.
    pub fn from_config(config: &DatasetConfig) -> Result<Self> {
        let mut dataset = Self::new(&config.name)
            .with_storage(Arc::new(LocalStorage::new(&config.base_path)))
            .with_format(parse_format(&config.format)?);

        for (split, path) in &config.splits {
            dataset = dataset.with_split_file(split, path.clone());
        }
        for (split, count) in &config.partitioners {
            let partitioner = IidPartitioner::new(*count)?.with_seed(config.seed);
            dataset = dataset.with_partitioner(split, partitioner);
        }
        Ok(dataset)
    }

    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = storage;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: Arc<dyn RecordFormat>) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_split_rows<I, R>(mut self, split: impl Into<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Bytes>,
    {
        let rows: Arc<[Bytes]> = rows.into_iter().map(Into::into).collect();
        self.sources.insert(split.into(), SplitSource::Rows(rows));
        self
    }

    #[must_use]
    pub fn with_split_file(mut self, split: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.sources
            .insert(split.into(), SplitSource::File(path.into()));
        self
    }

    #[must_use]
    pub fn with_partitioner(mut self, split: impl Into<String>, partitioner: IidPartitioner) -> Self {
        self.partitioners.insert(split.into(), partitioner);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn splits(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn partitioner(&self, split: &str) -> Option<&IidPartitioner> {
        self.partitioners.get(split)
    }

    /// Names of the splits that have a partitioner, sorted.
    pub fn partitioned_splits(&self) -> Vec<String> {
        self.partitioners.keys().cloned().collect()
    }

    /// Returns the rows of partition `index` of `split`.
    ///
    /// # Errors
    ///
    /// - [`SimError::SplitNotFound`] if the dataset has no such split.
    /// - [`SimError::NoPartitioner`] if the split has no partitioner.
    /// - [`SimError::PartitionOutOfRange`] for a bad index.
    /// - Storage or format errors while loading the split.
    pub fn load_partition(&self, index: usize, split: &str) -> Result<Rows> {
        self.check_split(split)?;
        let Some(partitioner) = self.partitioners.get(split) else {
            return Err(SimError::NoPartitioner {
                split: split.to_string(),
                available: self.partitioned_splits(),
            });
        };

        let data = self.load_split(split)?;
        let partition = partitioner.partition(data.len(), index)?;
        Ok(Rows {
            split: split.to_string(),
            data,
            partition: Some(partition),
        })
    }

    /// Returns every row of `split`.
    pub fn load_full(&self, split: &str) -> Result<Rows> {
        self.check_split(split)?;
        Ok(Rows {
            split: split.to_string(),
            data: self.load_split(split)?,
            partition: None,
        })
    }

    fn check_split(&self, split: &str) -> Result<()> {
        if self.sources.contains_key(split) {
            Ok(())
        } else {
            Err(SimError::SplitNotFound {
                split: split.to_string(),
                available: self.splits(),
            })
        }
    }

    fn load_split(&self, split: &str) -> Result<Arc<[Bytes]>> {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rows) = loaded.get(split) {
            return Ok(rows.clone());
        }

        let rows = match self.sources.get(split) {
            Some(SplitSource::Rows(rows)) => rows.clone(),
            Some(SplitSource::File(path)) => {
                let mut reader = self.storage.open_read(path)?;
                let data = Bytes::from(reader.read_all()?);
                let records = self
                    .format
                    .split_records(&data)
                    .map_err(|e| SimError::dataset(&self.name, format!("split '{split}': {e}")))?;
                tracing::debug!(
                    "Loaded split '{}' of dataset '{}': {} {} record(s) from {}",
                    split,
                    self.name,
                    records.len(),
                    self.format.name(),
                    path.display()
                );
                Arc::from(records)
            }
            None => {
                return Err(SimError::SplitNotFound {
                    split: split.to_string(),
                    available: self.splits(),
                })
            }
        };

        loaded.insert(split.to_string(), rows.clone());
        Ok(rows)
    }

    /// True once `split` has been read.
    pub fn is_loaded(&self, split: &str) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(split)
    }
}

impl std::fmt::Debug for FederatedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedDataset")
            .field("name", &self.name)
            .field("splits", &self.sources.keys().collect::<Vec<_>>())
            .field("partitioners", &self.partitioners)
            .field("format", &self.format.name())
            .finish()
    }
}
