//! Multi-process coordination glue.
//!
//! Work is partitioned by assigning each clip to the peer with the least
//! cumulative bytes so far (greedy, linear scan - peer counts are small).
//! The collective transport itself is external; `Collective` is the seam,
//! and the single-process implementation is the identity.

/// Index of the peer with the smallest allocation; first wins ties.
pub fn least_loaded_index(allocated: &[u64]) -> usize {
    let mut index = 0;
    if allocated.len() > 1 {
        let mut smallest = u64::MAX;
        for (i, &bytes) in allocated.iter().enumerate() {
            if bytes < smallest {
                smallest = bytes;
                index = i;
            }
        }
    }
    index
}

/// Per-peer share of the parallel request budget; the first
/// `total % proc_count` peers take one extra.
pub fn split_parallel_requests(total: usize, proc_index: usize, proc_count: usize) -> usize {
    let peers = proc_count.max(1);
    total / peers + usize::from(proc_index < total % peers)
}

/// Barrier and sum-reduce over the peer group.
pub trait Collective {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self);
    fn sum_f64(&self, value: f64) -> f64;
    fn sum_u64(&self, value: u64) -> u64;
}

/// Single-process run: rank 0 of 1, every reduce is the identity.
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn sum_f64(&self, value: f64) -> f64 {
        value
    }

    fn sum_u64(&self, value: u64) -> u64 {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assign(sizes: &[u64], peers: usize) -> Vec<usize> {
        let mut allocated = vec![0u64; peers];
        sizes
            .iter()
            .map(|&bytes| {
                let index = least_loaded_index(&allocated);
                allocated[index] += bytes;
                index
            })
            .collect()
    }

    #[test]
    fn test_partition_is_disjoint_and_covers_everything() {
        let sizes = [100, 90, 80, 70, 60, 50, 40, 30, 20, 10];
        let owners = assign(&sizes, 2);
        assert_eq!(owners.len(), sizes.len());
        assert!(owners.iter().all(|&o| o < 2));
        assert!(owners.contains(&0) && owners.contains(&1));
    }

    #[test]
    fn test_partition_byte_totals_stay_balanced() {
        let sizes = [100u64, 90, 80, 70, 60, 50, 40, 30, 20, 10];
        let owners = assign(&sizes, 2);
        let mut totals = [0u64; 2];
        for (owner, bytes) in owners.iter().zip(sizes.iter()) {
            totals[*owner] += bytes;
        }
        let diff = totals[0].abs_diff(totals[1]);
        let largest = *sizes.iter().max().unwrap();
        assert!(diff <= largest, "totals {totals:?} differ by more than one clip");
    }

    #[test]
    fn test_single_peer_takes_everything() {
        let owners = assign(&[5, 5, 5], 1);
        assert_eq!(owners, vec![0, 0, 0]);
    }

    #[test]
    fn test_split_parallel_requests_spreads_remainder() {
        assert_eq!(split_parallel_requests(10, 0, 3), 4);
        assert_eq!(split_parallel_requests(10, 1, 3), 3);
        assert_eq!(split_parallel_requests(10, 2, 3), 3);
        assert_eq!(split_parallel_requests(4, 0, 1), 4);
    }
}
