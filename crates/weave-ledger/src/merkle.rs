//! Binary Merkle tree over the sorted set of event IDs.
//!
//! Leaves are domain-separated from interior nodes so that an interior node
//! can never be passed off as a leaf. An odd node at the end of a level is
//! promoted to the next level unchanged.

use crate::hash::{EventId, Hash, Hasher};
use serde::{Deserialize, Serialize};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Which side of the running hash a sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Left,
    Right,
}

/// Authentication path from an event ID up to a tree root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub event_id: EventId,
    pub path: Vec<Hash>,
    pub directions: Vec<Direction>,
    pub root: Hash,
}

impl MerkleProof {
    /// Recompute the root from the leaf and path.
    pub fn computed_root(&self) -> Option<Hash> {
        if self.path.len() != self.directions.len() {
            return None;
        }
        let mut current = leaf_hash(&self.event_id);
        for (sibling, direction) in self.path.iter().zip(&self.directions) {
            current = match direction {
                Direction::Left => node_hash(sibling, &current),
                Direction::Right => node_hash(&current, sibling),
            };
        }
        Some(current)
    }

    /// Check the path is internally consistent and commits to `trusted_root`.
    pub fn verify_against(&self, trusted_root: &Hash) -> bool {
        self.root == *trusted_root && self.computed_root() == Some(self.root)
    }
}

fn leaf_hash(id: &EventId) -> Hash {
    Hasher::hash_all(&[&[LEAF_PREFIX], id.as_bytes()])
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    Hasher::hash_all(&[&[NODE_PREFIX], left.as_bytes(), right.as_bytes()])
}

/// A fully materialized Merkle tree.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    leaves: Vec<EventId>,
    /// `levels[0]` holds leaf hashes, the last level holds the root.
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Build a tree over `ids`, which are sorted and deduplicated first.
    pub fn from_ids(ids: impl IntoIterator<Item = EventId>) -> Self {
        let mut leaves: Vec<EventId> = ids.into_iter().collect();
        leaves.sort();
        leaves.dedup();

        let mut levels = vec![leaves.iter().map(leaf_hash).collect::<Vec<_>>()];
        while levels.last().map_or(false, |level| level.len() > 1) {
            let level = &levels[levels.len() - 1];
            let next = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => node_hash(left, right),
                    [single] => *single,
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next);
        }

        MerkleTree { leaves, levels }
    }

    /// The root, or the zero hash for an empty tree.
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_else(Hash::zero)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Produce an inclusion proof for `id`, if it is a leaf.
    pub fn proof(&self, id: &EventId) -> Option<MerkleProof> {
        let mut index = self.leaves.binary_search(id).ok()?;
        let mut path = Vec::new();
        let mut directions = Vec::new();

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = index ^ 1;
            if sibling < level.len() {
                path.push(level[sibling]);
                directions.push(if sibling < index {
                    Direction::Left
                } else {
                    Direction::Right
                });
            }
            index /= 2;
        }

        Some(MerkleProof {
            event_id: *id,
            path,
            directions,
            root: self.root(),
        })
    }
}
