use std::sync::atomic::{AtomicU64, Ordering};

use crate::dataset::Dataset;
use crate::error::{DataError, Result};

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    pub seed: u64,
}

impl LoaderConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
            seed: 0,
        }
    }
}

/// A stacked batch: `data` is `[B, C, H, W]`, `targets` is `[B]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub data: Vec<f32>,
    pub data_shape: [usize; 4],
    pub targets: Vec<i64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Batches over a snapshot of a [`Dataset`] taken at construction.
#[derive(Debug)]
pub struct Loader {
    dataset: Dataset,
    config: LoaderConfig,
    epoch: AtomicU64,
}

impl Loader {
    pub fn new(dataset: &Dataset, config: LoaderConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(DataError::InvalidOptions(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        tracing::debug!(
            samples = dataset.len(),
            batch_size = config.batch_size,
            shuffle = config.shuffle,
            drop_last = config.drop_last,
            "loader created"
        );
        Ok(Self {
            dataset: dataset.clone(),
            config,
            epoch: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn batch_count(&self) -> usize {
        let n = self.dataset.len();
        let b = self.config.batch_size;
        if self.config.drop_last {
            n / b
        } else {
            (n + b - 1) / b
        }
    }

    /// Starts a new pass. Each call draws a fresh permutation when shuffling.
    pub fn begin(&self) -> Cursor {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            shuffle_indices(&mut order, self.config.seed.wrapping_add(epoch));
        }
        Cursor {
            order,
            position: 0,
            count: self.batch_count(),
        }
    }

    fn assemble(&self, indices: &[usize]) -> Result<Batch> {
        let [c, h, w] = self.dataset.example_shape();
        let mut data = Vec::with_capacity(indices.len() * c * h * w);
        let mut targets = Vec::with_capacity(indices.len());
        for &i in indices {
            let example = self.dataset.example(i)?;
            data.extend_from_slice(&example.data);
            targets.push(example.target);
        }
        Ok(Batch {
            data,
            data_shape: [indices.len(), c, h, w],
            targets,
        })
    }
}

/// Position within one pass over a [`Loader`].
#[derive(Debug, Clone)]
pub struct Cursor {
    order: Vec<usize>,
    position: usize,
    count: usize,
}

impl Cursor {
    pub fn is_end(&self) -> bool {
        self.position >= self.count
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves to the next batch; returns whether one is available.
    pub fn advance(&mut self) -> Result<bool> {
        if self.is_end() {
            return Err(DataError::BatchOutOfRange {
                index: self.position,
                count: self.count,
            });
        }
        self.position += 1;
        Ok(!self.is_end())
    }

    pub fn batch(&self, loader: &Loader) -> Result<Batch> {
        if self.is_end() {
            return Err(DataError::BatchOutOfRange {
                index: self.position,
                count: self.count,
            });
        }
        let b = loader.config.batch_size;
        let start = self.position * b;
        let end = (start + b).min(self.order.len());
        loader.assemble(&self.order[start..end])
    }
}

pub fn shuffle_indices(indices: &mut [usize], seed: u64) {
    if indices.len() <= 1 {
        return;
    }
    let mut state = seed ^ 0x9e3779b97f4a7c15;
    for i in (1..indices.len()).rev() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let j = (state % ((i + 1) as u64)) as usize;
        indices.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mnist::Mnist;

    fn dataset(n: usize) -> Dataset {
        let images = (0..n).flat_map(|i| vec![(i % 256) as u8; 4]).collect();
        let labels = (0..n).map(|i| (i % 10) as u8).collect();
        Dataset::new(Mnist::from_parts(images, labels, 2, 2).unwrap())
    }

    fn drain(loader: &Loader) -> Vec<Batch> {
        let mut cursor = loader.begin();
        let mut out = Vec::new();
        while !cursor.is_end() {
            out.push(cursor.batch(loader).unwrap());
            cursor.advance().unwrap();
        }
        out
    }

    #[test]
    fn hundred_by_seven_yields_fifteen_batches() {
        let loader = Loader::new(&dataset(100), LoaderConfig::new(7)).unwrap();
        assert_eq!(loader.batch_count(), 15);
        let batches = drain(&loader);
        assert_eq!(batches.len(), 15);
        assert!(batches[..14].iter().all(|b| b.len() == 7));
        assert_eq!(batches[14].len(), 2);
        assert_eq!(batches[14].data_shape, [2, 1, 2, 2]);
        assert_eq!(batches[14].targets, vec![8, 9]);
    }

    #[test]
    fn drop_last_discards_short_batch() {
        let mut config = LoaderConfig::new(7);
        config.drop_last = true;
        let loader = Loader::new(&dataset(100), config).unwrap();
        assert_eq!(drain(&loader).len(), 14);
    }

    #[test]
    fn empty_dataset_starts_at_end() {
        let loader = Loader::new(&dataset(0), LoaderConfig::new(4)).unwrap();
        let mut cursor = loader.begin();
        assert!(cursor.is_end());
        assert!(cursor.batch(&loader).is_err());
        assert!(cursor.advance().is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = Loader::new(&dataset(3), LoaderConfig::new(0)).unwrap_err();
        assert!(matches!(err, DataError::InvalidOptions(_)));
    }

    #[test]
    fn loader_snapshot_ignores_later_transforms() {
        let mut ds = dataset(3);
        let loader = Loader::new(&ds, LoaderConfig::new(3)).unwrap();
        ds.normalize(vec![0.5], vec![0.5]).unwrap();
        let batch = drain(&loader).remove(0);
        assert!(batch.data.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn shuffle_is_seeded_and_reshuffles_per_pass() {
        let mut config = LoaderConfig::new(50);
        config.shuffle = true;
        config.seed = 42;
        let a = Loader::new(&dataset(50), config.clone()).unwrap();
        let b = Loader::new(&dataset(50), config).unwrap();
        let first_a = drain(&a).remove(0).targets;
        let first_b = drain(&b).remove(0).targets;
        assert_eq!(first_a, first_b);

        let mut all: Vec<i64> = first_a.clone();
        all.sort();
        let mut expected: Vec<i64> = (0..50).map(|i| i % 10).collect();
        expected.sort();
        assert_eq!(all, expected);

        let order_a1 = a.begin().order;
        let order_a2 = a.begin().order;
        assert_ne!(order_a1, order_a2);
    }
}
