//! Capability-aware dataset partitioning.
//!
//! Every rank gets a batch size proportional to its compute capability, and
//! every rank runs the same number of iterations per epoch. The padded epoch
//! sequence is cut into contiguous per-rank slices in rank order:
//!
//! ```text
//! capability  [10.0, 2.5]   batch 64
//! batch sizes [64, 16]      total 80
//! L = 1000 -> 13 iterations -> total_size 1040
//! rank 0: [0, 832)   rank 1: [832, 1040)
//! ```

use crate::capability::CapabilityTable;
use crate::errors::{Result, WorkerError};
use crate::MAX_CAPABILITY;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::ops::Range;

/// Per-rank batch size for a nominal batch and a capability score.
///
/// Rounds half to even and never returns less than one.
pub fn optimized_batch_size(batch_size: usize, capability: f64) -> usize {
    let scaled = (batch_size as f64 * capability / MAX_CAPABILITY).round_ties_even();
    if scaled < 1.0 {
        1
    } else {
        scaled as usize
    }
}

/// Shard boundaries of every rank for one dataset and batch size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    dataset_len: usize,
    batch_sizes: Vec<usize>,
    starts: Vec<usize>,
    iterations: usize,
    total_batch_size: usize,
}

impl ShardLayout {
    pub fn new(dataset_len: usize, batch_size: usize, table: &CapabilityTable) -> Result<Self> {
        if dataset_len == 0 {
            return Err(WorkerError::Shard("dataset is empty".to_string()));
        }
        if batch_size == 0 {
            return Err(WorkerError::Shard("batch size must be positive".to_string()));
        }

        let batch_sizes: Vec<usize> = table
            .as_slice()
            .iter()
            .map(|c| optimized_batch_size(batch_size, *c))
            .collect();
        let total_batch_size: usize = batch_sizes.iter().sum();
        let iterations = dataset_len.div_ceil(total_batch_size);

        let mut starts = Vec::with_capacity(batch_sizes.len());
        let mut offset = 0;
        for b in &batch_sizes {
            starts.push(offset);
            offset += iterations * b;
        }

        Ok(Self {
            dataset_len,
            batch_sizes,
            starts,
            iterations,
            total_batch_size,
        })
    }

    pub fn world_size(&self) -> usize {
        self.batch_sizes.len()
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset_len
    }

    /// Optimizer steps per epoch, identical on every rank.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn total_batch_size(&self) -> usize {
        self.total_batch_size
    }

    /// Length of the padded epoch sequence.
    pub fn total_size(&self) -> usize {
        self.iterations * self.total_batch_size
    }

    pub fn optimized_batch_size(&self, rank: usize) -> Option<usize> {
        self.batch_sizes.get(rank).copied()
    }

    pub fn num_samples(&self, rank: usize) -> Option<usize> {
        self.optimized_batch_size(rank).map(|b| b * self.iterations)
    }

    pub fn start_index(&self, rank: usize) -> Option<usize> {
        self.starts.get(rank).copied()
    }

    pub fn shard(&self, rank: usize) -> Result<WorkerShard> {
        let (Some(optimized_batch_size), Some(start_index)) =
            (self.optimized_batch_size(rank), self.start_index(rank))
        else {
            return Err(WorkerError::Shard(format!(
                "rank {rank} outside world size {}",
                self.world_size()
            )));
        };
        let num_samples = optimized_batch_size * self.iterations;

        Ok(WorkerShard {
            rank,
            optimized_batch_size,
            num_samples,
            total_size: self.total_size(),
            start_index,
            end_index: start_index + num_samples,
        })
    }

    /// Shards of every rank, in rank order.
    pub fn shards(&self) -> Vec<WorkerShard> {
        (0..self.world_size())
            .filter_map(|rank| self.shard(rank).ok())
            .collect()
    }
}

/// One rank's share of the padded epoch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerShard {
    pub rank: usize,
    pub optimized_batch_size: usize,
    pub num_samples: usize,
    pub total_size: usize,
    pub start_index: usize,
    pub end_index: usize,
}

impl WorkerShard {
    pub fn range(&self) -> Range<usize> {
        self.start_index..self.end_index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerOptions {
    /// Permute the dataset each epoch
    pub shuffle: bool,
    /// Base seed; the epoch is added to it
    pub seed: u64,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            shuffle: true,
            seed: 0,
        }
    }
}

/// Deterministic sampler yielding one rank's dataset indices for an epoch.
#[derive(Debug, Clone)]
pub struct CapabilitySampler {
    layout: ShardLayout,
    shard: WorkerShard,
    options: SamplerOptions,
    epoch: u64,
}

impl CapabilitySampler {
    pub fn new(
        dataset_len: usize,
        batch_size: usize,
        rank: usize,
        table: &CapabilityTable,
        options: SamplerOptions,
    ) -> Result<Self> {
        let layout = ShardLayout::new(dataset_len, batch_size, table)?;
        let shard = layout.shard(rank)?;

        tracing::debug!(
            rank,
            batch_size = shard.optimized_batch_size,
            num_samples = shard.num_samples,
            iterations = layout.iterations(),
            "Sampler ready"
        );

        Ok(Self {
            layout,
            shard,
            options,
            epoch: 0,
        })
    }

    /// Select the ordering for the next pass. The ordering persists until changed.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Batch size this rank should load with.
    pub fn batch_size(&self) -> usize {
        self.shard.optimized_batch_size
    }

    pub fn len(&self) -> usize {
        self.shard.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.shard.num_samples == 0
    }

    pub fn shard(&self) -> &WorkerShard {
        &self.shard
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    /// Full padded index sequence for the current epoch, shared by all ranks.
    pub fn epoch_sequence(&self) -> Vec<usize> {
        let len = self.layout.dataset_len();
        let mut order: Vec<usize> = (0..len).collect();
        if self.options.shuffle {
            let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(self.epoch));
            order.shuffle(&mut rng);
        }

        let total = self.layout.total_size();
        let mut sequence = Vec::with_capacity(total);
        while sequence.len() < total {
            let take = (total - sequence.len()).min(len);
            sequence.extend_from_slice(&order[..take]);
        }
        sequence
    }

    /// This rank's indices for the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        let mut sequence = self.epoch_sequence();
        sequence.truncate(self.shard.end_index);
        sequence.drain(..self.shard.start_index);
        sequence
    }

    pub fn iter(&self) -> std::vec::IntoIter<usize> {
        self.indices().into_iter()
    }
}

impl<'a> IntoIterator for &'a CapabilitySampler {
    type Item = usize;
    type IntoIter = std::vec::IntoIter<usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
