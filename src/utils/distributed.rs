use burn::data::dataset::{Dataset, transform::PartialDataset};
use tracing::info;

/// Position of this process among its data-parallel replicas.
///
/// Gradient averaging between replicas is left to the launcher; every replica runs the same
/// sequence of steps on its own shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for ProcessGroup {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl ProcessGroup {
    /// Reads `RANK` and `WORLD_SIZE`, falling back to a single process.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<usize>().ok());
        let world_size = var("WORLD_SIZE").unwrap_or(1).max(1);
        let rank = var("RANK").unwrap_or(0).min(world_size - 1);

        let group = Self { rank, world_size };
        info!(rank, world_size, "process group");
        group
    }

    pub fn is_primary(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// The contiguous part of `dataset` owned by this rank.
    pub fn shard<D, I>(&self, dataset: D) -> PartialDataset<D, I>
    where
        D: Dataset<I>,
        I: Clone + Send + Sync,
    {
        let len = dataset.len();
        let per_rank = len / self.world_size;
        let start = self.rank * per_rank;
        let end = if self.rank + 1 == self.world_size {
            len
        } else {
            start + per_rank
        };
        PartialDataset::new(dataset, start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::data::dataset::InMemDataset;
    use std::sync::Arc;

    #[test]
    fn single_process_is_primary() {
        let group = ProcessGroup::default();
        assert!(group.is_primary());
        assert!(!group.is_distributed());
    }

    #[test]
    fn shards_are_disjoint() {
        let dataset = Arc::new(InMemDataset::new((0..11).collect::<Vec<usize>>()));
        let first = ProcessGroup { rank: 0, world_size: 2 }.shard(dataset.clone());
        let second = ProcessGroup { rank: 1, world_size: 2 }.shard(dataset);

        let first: Vec<usize> = first.iter().collect();
        let second: Vec<usize> = second.iter().collect();
        assert_eq!(first, vec![0, 1, 2, 3, 4]);
        assert_eq!(second, vec![5, 6, 7, 8, 9, 10]);
    }
}
