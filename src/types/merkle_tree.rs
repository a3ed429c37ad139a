//! Merkle trees.
//!
//! [`MemoryTree`] commits to VM memory: a sparse binary tree of fixed depth
//! over 160-bit [`Node`]s, keyed by address bits (MSB at the root). Cells
//! that hold zero are not stored, so their subtrees collapse to precomputed
//! zero digests and a 32-level tree over a handful of cells stays cheap.
//!
//! [`MerkleTree`] is the SHA3 tree over script leaves that an output
//! commitment binds to. Odd levels duplicate their last node.

use crate::types::hash::Hash;
use bitdispute_derive::BinaryCodec;
use std::collections::BTreeMap;
use std::fmt;

pub const NODE_LEN: usize = 20;

/// A 160-bit memory tree node: blake3 truncated to 20 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BinaryCodec)]
pub struct Node(pub [u8; NODE_LEN]);

impl Node {
    /// Leaf digest of a memory cell: the value little-endian, zero-padded.
    pub fn leaf(value: u32) -> Node {
        let mut bytes = [0u8; NODE_LEN];
        bytes[..4].copy_from_slice(&value.to_le_bytes());
        Node(bytes)
    }

    pub fn hash_pair(left: &Node, right: &Node) -> Node {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&left.0);
        hasher.update(&right.0);
        let digest = hasher.finalize();
        let mut bytes = [0u8; NODE_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..NODE_LEN]);
        Node(bytes)
    }

    /// Parent of `self` with `sibling`; `bit == 0` puts `self` on the left.
    pub fn parent(&self, sibling: &Node, bit: u32) -> Node {
        if bit & 1 == 0 {
            Node::hash_pair(self, sibling)
        } else {
            Node::hash_pair(sibling, self)
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Bit of `address` that orders the node at `depth` (1-based) against its sibling.
pub fn address_bit(address: u32, depth: usize, tree_depth: usize) -> u32 {
    ((u64::from(address) >> (tree_depth - depth)) & 1) as u32
}

/// Sibling digests from the root level down to the leaf level.
#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct MerklePath {
    pub siblings: Vec<Node>,
}

/// Every populated level of a sparse memory tree.
pub struct MemoryTree {
    depth: usize,
    /// `levels[h]` holds the non-zero subtrees at height `h` (0 = leaves), by index.
    levels: Vec<BTreeMap<u64, Node>>,
    /// `zeros[h]` is the digest of an all-zero subtree of height `h`.
    zeros: Vec<Node>,
}

impl MemoryTree {
    /// Builds the tree over `(address, value)` cells; absent cells are zero.
    pub fn from_cells(cells: impl IntoIterator<Item = (u32, u32)>, depth: usize) -> MemoryTree {
        let mut zeros = Vec::with_capacity(depth + 1);
        zeros.push(Node::leaf(0));
        for h in 0..depth {
            zeros.push(Node::hash_pair(&zeros[h], &zeros[h]));
        }

        let leaves: BTreeMap<u64, Node> = cells
            .into_iter()
            .filter(|(_, value)| *value != 0)
            .map(|(address, value)| (u64::from(address), Node::leaf(value)))
            .collect();

        let mut levels = Vec::with_capacity(depth + 1);
        levels.push(leaves);
        for h in 0..depth {
            let below = &levels[h];
            let mut level = BTreeMap::new();
            for &index in below.keys() {
                let parent = index >> 1;
                if level.contains_key(&parent) {
                    continue;
                }
                let left = below.get(&(parent << 1)).unwrap_or(&zeros[h]);
                let right = below.get(&((parent << 1) | 1)).unwrap_or(&zeros[h]);
                level.insert(parent, Node::hash_pair(left, right));
            }
            levels.push(level);
        }

        MemoryTree {
            depth,
            levels,
            zeros,
        }
    }

    pub fn build(memory: &[u32], depth: usize) -> MemoryTree {
        let cells = memory
            .iter()
            .enumerate()
            .map(|(address, value)| (address as u32, *value));
        MemoryTree::from_cells(cells, depth)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn root(&self) -> Node {
        self.at_height(self.depth, 0)
    }

    fn at_height(&self, height: usize, index: u64) -> Node {
        self.levels[height]
            .get(&index)
            .copied()
            .unwrap_or(self.zeros[height])
    }

    /// The node at `depth` (0 = root, tree depth = leaf) on the path to `address`.
    pub fn node(&self, address: u32, depth: usize) -> Node {
        let height = self.depth - depth;
        self.at_height(height, u64::from(address) >> height)
    }

    /// The sibling of the node at `depth` (>= 1) on the path to `address`.
    pub fn sibling(&self, address: u32, depth: usize) -> Node {
        let height = self.depth - depth;
        self.at_height(height, (u64::from(address) >> height) ^ 1)
    }

    pub fn path(&self, address: u32) -> MerklePath {
        MerklePath {
            siblings: (1..=self.depth).map(|d| self.sibling(address, d)).collect(),
        }
    }
}

pub fn build_tree(memory: &[u32], depth: usize) -> Node {
    MemoryTree::build(memory, depth).root()
}

pub fn build_path(memory: &[u32], address: u32, depth: usize) -> MerklePath {
    MemoryTree::build(memory, depth).path(address)
}

/// Folds `value` up through `path` and returns the implied root.
pub fn verify_path(path: &MerklePath, value: u32, address: u32) -> Node {
    let depth = path.siblings.len();
    path.siblings
        .iter()
        .enumerate()
        .rev()
        .fold(Node::leaf(value), |node, (i, sibling)| {
            node.parent(sibling, address_bit(address, i + 1, depth))
        })
}

const SCRIPT_BRANCH_TAG: &[u8] = b"TAPBRANCH";

/// SHA3 Merkle tree over script leaf hashes.
pub struct MerkleTree;

impl MerkleTree {
    fn hash_pair(left: Hash, right: Hash) -> Hash {
        Hash::tagged(SCRIPT_BRANCH_TAG, &(left, right))
    }

    /// Root of `nodes`, reduced in place; the empty tree is the zero hash.
    pub fn from_raw(mut nodes: Vec<Hash>) -> Hash {
        if nodes.is_empty() {
            return Hash::zero();
        }

        let mut len = nodes.len();
        while len > 1 {
            let mut write = 0;
            for read in (0..len).step_by(2) {
                let left = nodes[read];
                let right = if read + 1 < len { nodes[read + 1] } else { left };
                nodes[write] = Self::hash_pair(left, right);
                write += 1;
            }
            len = write;
        }
        nodes[0]
    }

    /// Sibling hashes from leaf `index` up to the root.
    pub fn proof(leaves: &[Hash], index: usize) -> Vec<Hash> {
        let mut proof = Vec::new();
        let mut level = leaves.to_vec();
        let mut index = index;
        while level.len() > 1 {
            let sibling = level.get(index ^ 1).copied().unwrap_or(level[index]);
            proof.push(sibling);
            level = level
                .chunks(2)
                .map(|pair| Self::hash_pair(pair[0], *pair.get(1).unwrap_or(&pair[0])))
                .collect();
            index /= 2;
        }
        proof
    }

    /// Root implied by `leaf` at `index` with the given `proof`.
    pub fn root_from_proof(leaf: Hash, index: usize, proof: &[Hash]) -> Hash {
        let mut node = leaf;
        let mut index = index;
        for sibling in proof {
            node = if index & 1 == 0 {
                Self::hash_pair(node, *sibling)
            } else {
                Self::hash_pair(*sibling, node)
            };
            index /= 2;
        }
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_root(memory: &[u32], depth: usize) -> Node {
        let mut level: Vec<Node> = (0..1usize << depth)
            .map(|i| Node::leaf(memory.get(i).copied().unwrap_or(0)))
            .collect();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| Node::hash_pair(&pair[0], &pair[1]))
                .collect();
        }
        level[0]
    }

    #[test]
    fn leaf_is_zero_padded_little_endian() {
        let leaf = Node::leaf(0x0403_0201);
        assert_eq!(&leaf.0[..4], &[1, 2, 3, 4]);
        assert!(leaf.0[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn sparse_root_matches_dense_tree() {
        let memory = [7, 0, 42, 9, 1];
        assert_eq!(build_tree(&memory, 4), naive_root(&memory, 4));
        assert_eq!(build_tree(&[], 3), naive_root(&[], 3));
    }

    #[test]
    fn trailing_zero_cells_do_not_change_root() {
        assert_eq!(build_tree(&[1, 2, 3], 5), build_tree(&[1, 2, 3, 0, 0, 0], 5));
    }

    #[test]
    fn verify_path_recovers_root_for_every_address() {
        let memory: Vec<u32> = (0..11).map(|i| i * 31 + 5).collect();
        let root = build_tree(&memory, 4);
        for address in 0..16u32 {
            let path = build_path(&memory, address, 4);
            let value = memory.get(address as usize).copied().unwrap_or(0);
            assert_eq!(verify_path(&path, value, address), root, "address {address}");
        }
    }

    #[test]
    fn verify_path_detects_wrong_value() {
        let memory = [1, 2, 3, 4];
        let path = build_path(&memory, 2, 2);
        assert_ne!(verify_path(&path, 4, 2), build_tree(&memory, 2));
    }

    #[test]
    fn wide_tree_handles_high_addresses() {
        let memory = [5, 6];
        let root = build_tree(&memory, 32);
        let path = build_path(&memory, u32::MAX, 32);
        assert_eq!(path.siblings.len(), 32);
        assert_eq!(verify_path(&path, 0, u32::MAX), root);
        assert_eq!(verify_path(&build_path(&memory, 1, 32), 6, 1), root);
    }

    #[test]
    fn node_and_sibling_follow_the_path() {
        let memory = [3, 1, 4, 1, 5, 9];
        let tree = MemoryTree::build(&memory, 3);
        let address = 5;
        assert_eq!(tree.node(address, 0), tree.root());
        assert_eq!(tree.node(address, 3), Node::leaf(9));
        for depth in 1..=3 {
            let bit = address_bit(address, depth, 3);
            let parent = tree.node(address, depth).parent(&tree.sibling(address, depth), bit);
            assert_eq!(parent, tree.node(address, depth - 1));
        }
    }

    #[test]
    fn script_tree_odd_level_duplicates_last() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let c = Hash::digest(b"c");
        let left = MerkleTree::hash_pair(a, b);
        let right = MerkleTree::hash_pair(c, c);
        assert_eq!(
            MerkleTree::from_raw(vec![a, b, c]),
            MerkleTree::hash_pair(left, right)
        );
        assert_eq!(MerkleTree::from_raw(vec![a]), a);
        assert_eq!(MerkleTree::from_raw(Vec::new()), Hash::zero());
    }

    #[test]
    fn script_tree_proofs_verify() {
        let leaves: Vec<Hash> = (0u8..7).map(|i| Hash::digest(&[i])).collect();
        let root = MerkleTree::from_raw(leaves.clone());
        for (index, leaf) in leaves.iter().enumerate() {
            let proof = MerkleTree::proof(&leaves, index);
            assert_eq!(MerkleTree::root_from_proof(*leaf, index, &proof), root);
        }
        let proof = MerkleTree::proof(&leaves, 2);
        assert_ne!(MerkleTree::root_from_proof(leaves[3], 2, &proof), root);
    }
}
