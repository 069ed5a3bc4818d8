use burn::tensor::{backend::Backend, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::ImageDataset;
use crate::error::Result;

/// Batches over an [`ImageDataset`] with a per-epoch deterministic order.
///
/// The order of epoch `e` depends only on `(seed, e)`, so a resumed run can
/// skip already-consumed batches without loading them.
///
/// With a shard set, every rank shuffles identically and keeps the items at
/// `rank, rank + world_size, ...`. The epoch is padded by wrapping around so
/// all ranks see the same number of batches.
pub struct DataLoader<'a, D: ImageDataset + ?Sized> {
    dataset: &'a D,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    rank: usize,
    world_size: usize,
}

impl<'a, D: ImageDataset + ?Sized> DataLoader<'a, D> {
    pub fn new(dataset: &'a D, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
            rank: 0,
            world_size: 1,
        }
    }

    /// Restrict every epoch to the shard of `rank` out of `world_size` workers.
    pub fn with_shard(mut self, rank: usize, world_size: usize) -> Self {
        self.world_size = world_size.max(1);
        self.rank = rank.min(self.world_size - 1);
        self
    }

    /// Items this rank sees per epoch.
    fn shard_len(&self) -> usize {
        self.dataset.len().div_ceil(self.world_size)
    }

    /// Batches per epoch on this rank; the last one may be partial.
    pub fn num_batches(&self) -> usize {
        self.shard_len().div_ceil(self.batch_size)
    }

    /// Item indices of every batch in `epoch`, in consumption order.
    pub fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        if self.world_size > 1 {
            let padded = self.shard_len() * self.world_size;
            let shard: Vec<usize> = indices
                .iter()
                .copied()
                .cycle()
                .take(padded)
                .skip(self.rank)
                .step_by(self.world_size)
                .collect();
            indices = shard;
        }
        indices.chunks(self.batch_size).map(|c| c.to_vec()).collect()
    }

    /// Decode and stack the given items into `[N, C, H, W]`.
    pub fn load_batch<B: Backend>(&self, indices: &[usize], epoch: usize, device: &B::Device) -> Result<Tensor<B, 4>> {
        let channels = self.dataset.channels();
        let res = self.dataset.resolution();
        let mut data = Vec::with_capacity(indices.len() * channels * res * res);
        for &index in indices {
            let mut rng = StdRng::seed_from_u64(augment_seed(self.seed, epoch, index));
            data.extend(self.dataset.image(index, &mut rng)?);
        }
        Ok(Tensor::<B, 1>::from_floats(data.as_slice(), device).reshape([indices.len(), channels, res, res]))
    }
}

fn augment_seed(seed: u64, epoch: usize, index: usize) -> u64 {
    seed ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (index as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}
