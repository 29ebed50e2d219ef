//! Append-only integrity tree
//!
//! Leaves are appended in index order and never removed or reordered. The
//! tree keeps every complete level so that both `insert` and `proof` are
//! O(log n) without rebuilding:
//!
//! - `levels[0]` holds the leaves, `levels[k][j] = node(levels[k-1][2j], levels[k-1][2j+1])`
//!   for every complete pair.
//! - When a level has an odd number of nodes its last node is a *peak*: the
//!   root of a perfect subtree that has no sibling yet.
//! - The root right-folds the peaks from the lowest level upward:
//!   `root = node(P_top, node(..., node(P_2, P_1)))`.
//!
//! This is the same root as the classic level-by-level construction that
//! promotes an odd trailing node unchanged (see [`build_root`]).

use crate::hash::{Hash32, Hasher};
use serde::{Deserialize, Serialize};

/// Domain prefix for interior nodes
pub const NODE_PREFIX: u8 = 0x01;

/// Maximum supported depth (2^32 leaves)
pub const MAX_TREE_DEPTH: usize = 32;

/// Hash two children into their parent
pub fn node_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut hasher = Hasher::new();
    hasher
        .update(&[NODE_PREFIX])
        .update(left.as_bytes())
        .update(right.as_bytes());
    hasher.finalize()
}

/// Inputs of one composite leaf
///
/// `leaf = SHA-256(index u32 BE || raw_hash || cipher_hash || captured_at u64 BE)`.
/// Capture and verification must agree on this byte layout exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityLeaf {
    /// Chunk index
    pub index: u32,
    /// SHA-256 of the plaintext segment
    pub raw_hash: Hash32,
    /// SHA-256 of the ciphertext
    pub cipher_hash: Hash32,
    /// Capture time in unix milliseconds
    pub captured_at: u64,
}

impl IntegrityLeaf {
    /// Leaf digest
    pub fn hash(&self) -> Hash32 {
        let mut hasher = Hasher::new();
        hasher
            .update(&self.index.to_be_bytes())
            .update(self.raw_hash.as_bytes())
            .update(self.cipher_hash.as_bytes())
            .update(&self.captured_at.to_be_bytes());
        hasher.finalize()
    }
}

/// Which side the sibling sits on when folding a proof upward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Sibling is the left child; the running hash is the right child
    Left,
    /// Sibling is the right child; the running hash is the left child
    Right,
}

/// One step of an inclusion proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// Sibling position
    pub side: Side,
    /// Sibling digest
    pub hash: Hash32,
}

/// Inclusion proof for one leaf against a given root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityProof {
    /// Index of the proven leaf
    pub leaf_index: u32,
    /// Number of leaves in the tree the proof was cut from
    pub tree_size: u32,
    /// Steps from the leaf to the root
    pub path: Vec<ProofStep>,
}

impl IntegrityProof {
    /// Fold the path over `leaf` and return the implied root
    pub fn root_from(&self, leaf: &Hash32) -> Hash32 {
        self.path.iter().fold(*leaf, |acc, step| match step.side {
            Side::Left => node_hash(&step.hash, &acc),
            Side::Right => node_hash(&acc, &step.hash),
        })
    }

    /// Check that `leaf` is included under `root`
    pub fn verify(&self, leaf: &Hash32, root: &Hash32) -> bool {
        if self.leaf_index >= self.tree_size || self.path.len() > 2 * MAX_TREE_DEPTH {
            return false;
        }
        &self.root_from(leaf) == root
    }
}

/// Incremental append-only tree over leaf digests
#[derive(Debug, Clone, Default)]
pub struct IntegrityTree {
    levels: Vec<Vec<Hash32>>,
}

impl IntegrityTree {
    /// Empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay leaves in order into a fresh tree
    pub fn from_leaves<I>(leaves: I) -> Self
    where
        I: IntoIterator<Item = Hash32>,
    {
        let mut tree = Self::new();
        for leaf in leaves {
            tree.insert(leaf);
        }
        tree
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Whether no leaf has been inserted
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leaf digest at `index`
    pub fn leaf(&self, index: usize) -> Option<Hash32> {
        self.levels.first().and_then(|leaves| leaves.get(index).copied())
    }

    /// Append a leaf and return the new root
    pub fn insert(&mut self, leaf: Hash32) -> Hash32 {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf);

        // Carry completed pairs upward.
        let mut level = 0;
        while self.levels[level].len() % 2 == 0 {
            let nodes = &self.levels[level];
            let parent = node_hash(&nodes[nodes.len() - 2], &nodes[nodes.len() - 1]);
            if self.levels.len() == level + 1 {
                self.levels.push(Vec::new());
            }
            self.levels[level + 1].push(parent);
            level += 1;
        }

        self.root()
    }

    /// Peaks as `(level, digest)`, lowest level first
    fn peaks(&self) -> impl Iterator<Item = (usize, Hash32)> + '_ {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, nodes)| nodes.len() % 2 == 1)
            .filter_map(|(level, nodes)| nodes.last().map(|peak| (level, *peak)))
    }

    fn bag<I>(peaks: I) -> Option<Hash32>
    where
        I: IntoIterator<Item = Hash32>,
    {
        peaks.into_iter().fold(None, |acc, peak| {
            Some(match acc {
                None => peak,
                Some(right) => node_hash(&peak, &right),
            })
        })
    }

    /// Current root; all-zero for an empty tree
    pub fn root(&self) -> Hash32 {
        Self::bag(self.peaks().map(|(_, peak)| peak)).unwrap_or(Hash32::ZERO)
    }

    /// Inclusion proof for leaf `index` against the current root
    ///
    /// # Panics
    /// Panics if `index` is not smaller than [`len`](Self::len). Asking for a
    /// proof of a leaf that was never inserted is a caller bug.
    pub fn proof(&self, index: usize) -> IntegrityProof {
        assert!(
            index < self.len(),
            "proof index {index} out of range for tree of {} leaves",
            self.len()
        );

        let mut path = Vec::new();
        let mut pos = index;
        let mut level = 0;

        // Climb the perfect subtree containing the leaf.
        loop {
            let nodes = &self.levels[level];
            let sibling = pos ^ 1;
            if sibling >= nodes.len() {
                break;
            }
            let side = if pos % 2 == 0 { Side::Right } else { Side::Left };
            path.push(ProofStep {
                side,
                hash: nodes[sibling],
            });
            pos /= 2;
            level += 1;
        }

        // `pos` is now the peak at `level`; fold in the other peaks.
        let lower = Self::bag(
            self.peaks()
                .filter(|(peak_level, _)| *peak_level < level)
                .map(|(_, peak)| peak),
        );
        if let Some(right) = lower {
            path.push(ProofStep {
                side: Side::Right,
                hash: right,
            });
        }
        for (_, peak) in self.peaks().filter(|(peak_level, _)| *peak_level > level) {
            path.push(ProofStep {
                side: Side::Left,
                hash: peak,
            });
        }

        IntegrityProof {
            leaf_index: index as u32,
            tree_size: self.len() as u32,
            path,
        }
    }
}

/// Build a root from all leaves at once
///
/// Level-by-level construction; an odd trailing node is promoted unchanged.
/// Used to cross-check the incremental tree.
pub fn build_root(leaves: &[Hash32]) -> Hash32 {
    if leaves.is_empty() {
        return Hash32::ZERO;
    }

    let mut current = leaves.to_vec();
    while current.len() > 1 {
        current = current
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => node_hash(left, right),
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two elements"),
            })
            .collect();
    }
    current[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaves(n: usize) -> Vec<Hash32> {
        (0..n)
            .map(|i| Hash32::from_bytes(&(i as u64).to_le_bytes()))
            .collect()
    }

    #[test]
    fn test_empty_root_is_zero() {
        assert_eq!(IntegrityTree::new().root(), Hash32::ZERO);
        assert_eq!(build_root(&[]), Hash32::ZERO);
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let leaf = leaves(1)[0];
        let mut tree = IntegrityTree::new();
        assert_eq!(tree.insert(leaf), leaf);
    }

    #[test]
    fn test_three_leaves_promote_odd_node() {
        let l = leaves(3);
        let tree = IntegrityTree::from_leaves(l.clone());
        assert_eq!(tree.root(), node_hash(&node_hash(&l[0], &l[1]), &l[2]));
    }

    #[test]
    fn test_incremental_matches_batch_for_small_sizes() {
        for n in 0..70 {
            let l = leaves(n);
            assert_eq!(IntegrityTree::from_leaves(l.clone()).root(), build_root(&l), "n = {n}");
        }
    }

    #[test]
    fn test_every_proof_verifies() {
        for n in 1..40 {
            let l = leaves(n);
            let tree = IntegrityTree::from_leaves(l.clone());
            let root = tree.root();
            for (i, leaf) in l.iter().enumerate() {
                let proof = tree.proof(i);
                assert!(proof.verify(leaf, &root), "n = {n}, i = {i}");
                assert!(proof.path.len() <= 2 * (usize::BITS - n.leading_zeros()) as usize);
            }
        }
    }

    #[test]
    fn test_proof_rejects_wrong_leaf() {
        let l = leaves(9);
        let tree = IntegrityTree::from_leaves(l.clone());
        let proof = tree.proof(4);
        assert!(!proof.verify(&l[5], &tree.root()));
    }

    #[test]
    fn test_old_proof_does_not_verify_against_new_root() {
        let l = leaves(6);
        let mut tree = IntegrityTree::from_leaves(l.clone());
        let proof = tree.proof(2);
        tree.insert(Hash32::from_bytes(b"late"));
        assert!(!proof.verify(&l[2], &tree.root()));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_proof_out_of_range_panics() {
        IntegrityTree::from_leaves(leaves(3)).proof(3);
    }

    #[test]
    fn test_leaf_layout() {
        let leaf = IntegrityLeaf {
            index: 1,
            raw_hash: Hash32([0xaa; 32]),
            cipher_hash: Hash32([0xbb; 32]),
            captured_at: 2,
        };
        let mut expected = Vec::new();
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(&[0xaa; 32]);
        expected.extend_from_slice(&[0xbb; 32]);
        expected.extend_from_slice(&2u64.to_be_bytes());
        assert_eq!(leaf.hash(), Hash32::from_bytes(&expected));
    }

    proptest! {
        #[test]
        fn prop_root_depends_only_on_leaf_sequence(seeds in prop::collection::vec(any::<u64>(), 0..200)) {
            let l: Vec<Hash32> = seeds.iter().map(|s| Hash32::from_bytes(&s.to_be_bytes())).collect();
            let mut incremental = IntegrityTree::new();
            let mut roots = Vec::new();
            for leaf in &l {
                roots.push(incremental.insert(*leaf));
            }
            prop_assert_eq!(incremental.root(), build_root(&l));
            for (i, root) in roots.iter().enumerate() {
                prop_assert_eq!(*root, build_root(&l[..=i]));
            }
        }
    }
}
