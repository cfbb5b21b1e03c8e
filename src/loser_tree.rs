//! Tournament loser tree for k-way minimum extraction.

use std::cmp::Ordering;

/// Fixed-capacity tournament tree over `k` leaves.
///
/// `nodes[0]` holds the leaf index of the current overall winner;
/// `nodes[1..k]` hold, for each internal match, the leaf index of its
/// loser. Replacing the winner replays only the fixed leaf-to-root path,
/// one comparison per level, where a binary heap sift-down costs two.
/// Inactive leaves lose every match, so exhausted sources fall out of
/// contention without restructuring the tree.
///
/// The comparator is supplied per call rather than owned: leaf values
/// are typically views into reader buffers that the tree must not keep
/// borrowed between operations.
pub struct LoserTree<T> {
    nodes: Vec<usize>,
    values: Vec<Option<T>>,
    active: usize,
}

impl<T> LoserTree<T> {
    /// Creates a tree with `leaves` inactive leaves.
    pub fn new(leaves: usize) -> LoserTree<T> {
        let mut values = Vec::with_capacity(leaves);
        values.resize_with(leaves, || None);
        LoserTree {
            nodes: vec![0; leaves],
            values,
            active: 0,
        }
    }

    /// Number of leaves still in contention.
    pub fn active(&self) -> usize {
        self.active
    }

    /// Sets the initial value of leaf `index` and marks it active.
    /// Call once per non-empty source, before [`LoserTree::build`].
    pub fn set_leaf(&mut self, index: usize, value: T) {
        if self.values[index].is_none() {
            self.active += 1;
        }
        self.values[index] = Some(value);
    }

    /// Plays the full tournament bottom-up in O(k) comparisons.
    ///
    /// In the conceptual `2k`-slot heap layout leaf `i` sits at slot
    /// `k + i`; each internal slot stores its match's loser while the
    /// winner is carried upward.
    pub fn build(&mut self, cmp: &mut impl FnMut(&T, &T) -> Ordering) {
        let k = self.values.len();
        if k == 0 {
            return;
        }
        let mut winners = vec![0usize; 2 * k];
        for i in 0..k {
            winners[k + i] = i;
        }
        for node in (1..k).rev() {
            let (a, b) = (winners[2 * node], winners[2 * node + 1]);
            if self.beats(b, a, cmp) {
                winners[node] = b;
                self.nodes[node] = a;
            } else {
                winners[node] = a;
                self.nodes[node] = b;
            }
        }
        self.nodes[0] = winners[1];
    }

    /// Leaf index of the current overall minimum, or `None` when no leaf
    /// is active.
    pub fn winner(&self) -> Option<usize> {
        if self.active == 0 {
            None
        } else {
            Some(self.nodes[0])
        }
    }

    /// Value at the current winner leaf.
    pub fn winner_value(&self) -> Option<&T> {
        if self.active == 0 {
            return None;
        }
        self.values[self.nodes[0]].as_ref()
    }

    /// Replaces the winner's value and replays its leaf-to-root path.
    pub fn replace_winner(&mut self, value: T, cmp: &mut impl FnMut(&T, &T) -> Ordering) {
        let leaf = self.nodes[0];
        self.values[leaf] = Some(value);
        self.replay(leaf, cmp);
    }

    /// Marks the winner leaf inactive; it loses every match from now on.
    pub fn deactivate_winner(&mut self, cmp: &mut impl FnMut(&T, &T) -> Ordering) {
        let leaf = self.nodes[0];
        self.values[leaf] = None;
        self.active -= 1;
        self.replay(leaf, cmp);
    }

    /// Walks from `leaf` to the root replaying each match: the carried
    /// winner meets the stored loser, the larger stays as the new loser
    /// and the smaller is carried on.
    fn replay(&mut self, leaf: usize, cmp: &mut impl FnMut(&T, &T) -> Ordering) {
        let k = self.values.len();
        let mut winner = leaf;
        let mut node = (k + leaf) / 2;
        while node > 0 {
            let contender = self.nodes[node];
            if self.beats(contender, winner, cmp) {
                self.nodes[node] = winner;
                winner = contender;
            }
            node /= 2;
        }
        self.nodes[0] = winner;
    }

    /// True when leaf `a` wins its match against leaf `b`.
    fn beats(&self, a: usize, b: usize, cmp: &mut impl FnMut(&T, &T) -> Ordering) -> bool {
        match (&self.values[a], &self.values[b]) {
            (Some(va), Some(vb)) => cmp(va, vb) == Ordering::Less,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[cfg(test)]
mod test {
    use rand::prelude::*;
    use rstest::*;

    use super::LoserTree;

    fn cmp(a: &u64, b: &u64) -> std::cmp::Ordering {
        a.cmp(b)
    }

    /// Drains the tree by repeated deactivation, asserting the winner
    /// sequence is non-decreasing.
    fn drain(tree: &mut LoserTree<u64>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(&value) = tree.winner_value() {
            if let Some(last) = out.last() {
                assert!(*last <= value);
            }
            out.push(value);
            tree.deactivate_winner(&mut cmp);
        }
        out
    }

    #[test]
    fn test_empty_tree() {
        let mut tree: LoserTree<u64> = LoserTree::new(0);
        tree.build(&mut cmp);
        assert_eq!(tree.winner(), None);
        assert_eq!(tree.winner_value(), None);
        assert_eq!(tree.active(), 0);
    }

    #[test]
    fn test_single_leaf() {
        let mut tree = LoserTree::new(1);
        tree.set_leaf(0, 42);
        tree.build(&mut cmp);
        assert_eq!(tree.winner(), Some(0));
        assert_eq!(drain(&mut tree), vec![42]);
    }

    #[rstest]
    #[case(2)]
    #[case(3)]
    #[case(7)]
    #[case(64)]
    #[case(1000)]
    fn test_extracts_every_leaf_once(#[case] leaves: usize) {
        let mut rng = rand::thread_rng();
        let mut expected: Vec<u64> = (0..leaves).map(|_| rng.gen_range(0..10_000)).collect();

        let mut tree = LoserTree::new(leaves);
        for (idx, &value) in expected.iter().enumerate() {
            tree.set_leaf(idx, value);
        }
        tree.build(&mut cmp);

        let extracted = drain(&mut tree);
        expected.sort_unstable();
        assert_eq!(extracted, expected);
    }

    #[test]
    fn test_inactive_leaves_always_lose() {
        let mut tree = LoserTree::new(8);
        tree.set_leaf(3, 10);
        tree.set_leaf(6, 5);
        tree.build(&mut cmp);
        assert_eq!(tree.active(), 2);
        assert_eq!(drain(&mut tree), vec![5, 10]);
    }

    #[rstest]
    #[case(1, 100)]
    #[case(4, 250)]
    #[case(17, 40)]
    #[case(64, 25)]
    fn test_replace_winner_merges_sorted_sources(#[case] sources: usize, #[case] per_source: usize) {
        let mut rng = rand::thread_rng();
        let mut feeds: Vec<Vec<u64>> = (0..sources)
            .map(|_| {
                let mut feed: Vec<u64> = (0..per_source).map(|_| rng.gen_range(0..1_000_000)).collect();
                feed.sort_unstable();
                feed
            })
            .collect();
        let mut expected: Vec<u64> = feeds.iter().flatten().copied().collect();
        expected.sort_unstable();

        let mut cursors = vec![0usize; sources];
        let mut tree = LoserTree::new(sources);
        for (idx, feed) in feeds.iter_mut().enumerate() {
            tree.set_leaf(idx, feed[0]);
            cursors[idx] = 1;
        }
        tree.build(&mut cmp);

        let mut merged = Vec::with_capacity(expected.len());
        while let Some(&value) = tree.winner_value() {
            if let Some(last) = merged.last() {
                assert!(*last <= value);
            }
            merged.push(value);
            let source = tree.winner().unwrap();
            if cursors[source] < feeds[source].len() {
                tree.replace_winner(feeds[source][cursors[source]], &mut cmp);
                cursors[source] += 1;
            } else {
                tree.deactivate_winner(&mut cmp);
            }
        }

        assert_eq!(merged, expected);
    }
}
