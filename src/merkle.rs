use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;

pub const LOG2_WORD_SIZE: u32 = 3;
pub const LOG2_PAGE_SIZE: u32 = 12;
pub const LOG2_ROOT_SIZE: u32 = 64;

/// A Keccak-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

pub fn keccak_data(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

pub fn keccak_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

/// Hash of a 64-bit leaf word.
pub fn word_hash(value: u64) -> Hash {
    keccak_data(&value.to_le_bytes())
}

/// Hash a whole page (a 12-level subtree over 512 words).
pub fn hash_page(data: &[u8]) -> Hash {
    debug_assert_eq!(data.len(), 1 << LOG2_PAGE_SIZE);
    let mut level: Vec<Hash> = data.chunks_exact(8).map(keccak_data).collect();
    while level.len() > 1 {
        level = level.chunks_exact(2).map(|pair| keccak_pair(&pair[0], &pair[1])).collect();
    }
    level[0]
}

/// Hash of an aligned `2^log2`-byte range inside a page image.
pub fn range_hash_in_page(page: &[u8], in_page_offset: u64, log2: u32) -> Hash {
    debug_assert!(log2 >= LOG2_WORD_SIZE && log2 <= LOG2_PAGE_SIZE);
    debug_assert_eq!(in_page_offset & ((1 << log2) - 1), 0);
    let start = in_page_offset as usize;
    let data = &page[start..start + (1usize << log2)];
    if log2 == LOG2_WORD_SIZE {
        return keccak_data(data);
    }
    let half = 1u64 << (log2 - 1);
    keccak_pair(
        &range_hash_in_page(page, in_page_offset, log2 - 1),
        &range_hash_in_page(page, in_page_offset + half, log2 - 1),
    )
}

/// Precomputed hashes of pristine subtrees, indexed by log2 of their byte
/// size (3 through 64).
pub struct ZeroHashes {
    table: [Hash; (LOG2_ROOT_SIZE + 1) as usize],
}

impl ZeroHashes {
    pub fn new() -> Self {
        let mut table = [Hash([0; 32]); (LOG2_ROOT_SIZE + 1) as usize];
        table[LOG2_WORD_SIZE as usize] = word_hash(0);
        for log2 in (LOG2_WORD_SIZE + 1)..=LOG2_ROOT_SIZE {
            let below = table[(log2 - 1) as usize];
            table[log2 as usize] = keccak_pair(&below, &below);
        }
        ZeroHashes { table }
    }

    pub fn get(&self, log2: u32) -> Hash {
        self.table[log2 as usize]
    }
}

impl Default for ZeroHashes {
    fn default() -> Self {
        Self::new()
    }
}

/// Merkle proof for one aligned node of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub target_address: u64,
    pub log2_target_size: u32,
    pub target_hash: Hash,
    pub log2_root_size: u32,
    /// Sibling hashes ordered from the target level up to level 63.
    pub sibling_hashes: Vec<Hash>,
    pub root_hash: Hash,
}

/// Fold a target hash with its siblings up to the root.
pub fn fold_siblings(address: u64, log2_target_size: u32, target: &Hash, siblings: &[Hash]) -> Hash {
    let mut hash = *target;
    for (i, sibling) in siblings.iter().enumerate() {
        let log2 = log2_target_size + i as u32;
        if (address >> log2) & 1 == 0 {
            hash = keccak_pair(&hash, sibling);
        } else {
            hash = keccak_pair(sibling, &hash);
        }
    }
    hash
}

impl Proof {
    pub fn verify(&self) -> bool {
        if self.log2_root_size != LOG2_ROOT_SIZE {
            return false;
        }
        if self.sibling_hashes.len() as u32 != LOG2_ROOT_SIZE - self.log2_target_size {
            return false;
        }
        fold_siblings(
            self.target_address,
            self.log2_target_size,
            &self.target_hash,
            &self.sibling_hashes,
        ) == self.root_hash
    }
}

/// The state tree over the full 64-bit physical address space.
///
/// Only page-level (4 KiB subtree) hashes are cached; everything above is
/// folded on demand with pristine branches replaced by zero hashes. Pages
/// absent from the cache are pristine by construction: the machine pushes a
/// hash for every mapped page on the first update.
pub struct MerkleTree {
    pages: BTreeMap<u64, Hash>,
    zeros: ZeroHashes,
}

impl MerkleTree {
    pub fn new() -> Self {
        MerkleTree { pages: BTreeMap::new(), zeros: ZeroHashes::new() }
    }

    pub fn zero_hash(&self, log2: u32) -> Hash {
        self.zeros.get(log2)
    }

    pub fn set_page(&mut self, page_address: u64, hash: Hash) {
        debug_assert_eq!(page_address & ((1 << LOG2_PAGE_SIZE) - 1), 0);
        self.pages.insert(page_address, hash);
    }

    pub fn page_hash(&self, page_address: u64) -> Option<Hash> {
        self.pages.get(&page_address).copied()
    }

    /// Hash of the aligned node of size `2^log2` at `address`
    /// (`log2 >= 12`).
    pub fn node_hash(&self, address: u64, log2: u32) -> Hash {
        debug_assert!(log2 >= LOG2_PAGE_SIZE && log2 <= LOG2_ROOT_SIZE);
        debug_assert!(log2 == 64 || address & ((1u64 << log2) - 1) == 0);
        if log2 == LOG2_PAGE_SIZE {
            return self.pages.get(&address).copied().unwrap_or_else(|| self.zeros.get(log2));
        }
        let pristine = if log2 == LOG2_ROOT_SIZE {
            self.pages.is_empty()
        } else {
            // The top half of the space has no representable end address.
            match address.checked_add(1u64 << log2) {
                Some(end) => self.pages.range(address..end).next().is_none(),
                None => self.pages.range(address..).next().is_none(),
            }
        };
        if pristine {
            return self.zeros.get(log2);
        }
        let half = 1u64 << (log2 - 1);
        keccak_pair(
            &self.node_hash(address, log2 - 1),
            &self.node_hash(address + half, log2 - 1),
        )
    }

    pub fn root(&self) -> Hash {
        self.node_hash(0, LOG2_ROOT_SIZE)
    }

    /// Sibling hashes for levels `from_log2 .. 64`, bottom first.
    pub fn sibling_hashes_above(&self, address: u64, from_log2: u32) -> Vec<Hash> {
        debug_assert!(from_log2 >= LOG2_PAGE_SIZE);
        let mut siblings = Vec::with_capacity((LOG2_ROOT_SIZE - from_log2) as usize);
        for log2 in from_log2..LOG2_ROOT_SIZE {
            let sibling_addr = address ^ (1u64 << log2);
            siblings.push(self.node_hash(sibling_addr & !((1u64 << log2) - 1), log2));
        }
        siblings
    }
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hashes_chain() {
        let z = ZeroHashes::new();
        assert_eq!(z.get(3), word_hash(0));
        assert_eq!(z.get(4), keccak_pair(&word_hash(0), &word_hash(0)));
        let page = vec![0u8; 4096];
        assert_eq!(z.get(12), hash_page(&page));
    }

    #[test]
    fn empty_tree_root_is_zero_hash() {
        let t = MerkleTree::new();
        assert_eq!(t.root(), t.zero_hash(64));
    }

    #[test]
    fn single_page_proof_folds_to_root() {
        let mut t = MerkleTree::new();
        let mut page = vec![0u8; 4096];
        page[0] = 0xAB;
        let addr = 0x8000_0000;
        t.set_page(addr, hash_page(&page));

        let root = t.root();
        let siblings = t.sibling_hashes_above(addr, 12);
        assert_eq!(siblings.len(), 52);
        assert_eq!(fold_siblings(addr, 12, &hash_page(&page), &siblings), root);
    }

    #[test]
    fn word_proof_inside_page() {
        let mut page = vec![0u8; 4096];
        page[8..16].copy_from_slice(&0xdeadu64.to_le_bytes());
        let page_hash = hash_page(&page);

        // Climb from word 1 (offset 8) to the page hash by hand.
        let mut h = word_hash(0xdead);
        let mut addr = 8u64;
        for log2 in 3..12 {
            let sib = range_hash_in_page(&page, (addr ^ (1 << log2)) & !((1 << log2) - 1), log2);
            h = if (addr >> log2) & 1 == 0 { keccak_pair(&h, &sib) } else { keccak_pair(&sib, &h) };
            addr &= !((1 << (log2 + 1)) - 1);
        }
        assert_eq!(h, page_hash);
    }

    #[test]
    fn updating_a_page_changes_the_root() {
        let mut t = MerkleTree::new();
        let mut page = vec![0u8; 4096];
        t.set_page(0x1000, hash_page(&page));
        let r0 = t.root();
        page[100] = 1;
        t.set_page(0x1000, hash_page(&page));
        assert_ne!(t.root(), r0);
    }
}
