//! Brightest-first combinations of catalog stars.
//!
//! Candidate quads for one index field are drawn from that field's stars,
//! which arrive sorted brightest first. Combinations are yielded in order of
//! increasing sum of positions, so quads made of bright stars come out before
//! quads that need a faint one, and the caller can stop at any point.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// Iterator over `K`-subsets of `items`, ordered by the sum of their positions.
pub struct BreadthFirstCombinations<const K: usize> {
    items: Vec<usize>,
    heap: BinaryHeap<Reverse<(usize, [u32; K])>>,
    seen: HashSet<[u32; K]>,
}

impl<const K: usize> BreadthFirstCombinations<K> {
    pub fn new(items: &[usize]) -> Self {
        let mut heap = BinaryHeap::new();
        let mut seen = HashSet::new();
        if K > 0 && items.len() >= K {
            let first: [u32; K] = std::array::from_fn(|i| i as u32);
            seen.insert(first);
            heap.push(Reverse((position_sum(&first), first)));
        }
        Self {
            items: items.to_vec(),
            heap,
            seen,
        }
    }
}

fn position_sum<const K: usize>(positions: &[u32; K]) -> usize {
    positions.iter().map(|&p| p as usize).sum()
}

impl<const K: usize> Iterator for BreadthFirstCombinations<K> {
    type Item = [usize; K];

    fn next(&mut self) -> Option<[usize; K]> {
        let Reverse((_, positions)) = self.heap.pop()?;

        // successors bump one position while keeping the subset strictly increasing
        let n = self.items.len() as u32;
        for i in 0..K {
            let bumped = positions[i] + 1;
            let limit = if i + 1 < K { positions[i + 1] } else { n };
            if bumped >= limit {
                continue;
            }
            let mut next = positions;
            next[i] = bumped;
            if self.seen.insert(next) {
                self.heap.push(Reverse((position_sum(&next), next)));
            }
        }

        Some(std::array::from_fn(|i| self.items[positions[i] as usize]))
    }
}
