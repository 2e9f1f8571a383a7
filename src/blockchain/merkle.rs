use sha2::{Digest, Sha256};

/// Binary hash tree committing to an ordered list of transactions.
///
/// Leaves are the SHA-256 hashes of the serialized transactions; a level with
/// an odd number of nodes pairs its trailing node with itself. Reordering the
/// input changes the root, so transaction order is part of a block's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    root: [u8; 32],
}

impl MerkleTree {
    pub fn build(items: &[Vec<u8>]) -> Self {
        let mut level: Vec<[u8; 32]> = items
            .iter()
            .map(|data| Sha256::digest(data).into())
            .collect();

        if level.is_empty() {
            return Self { root: [0u8; 32] };
        }

        while level.len() > 1 {
            let mut next = Vec::with_capacity((level.len() + 1) / 2);
            for pair in level.chunks(2) {
                let left = pair[0];
                let right = if pair.len() == 2 { pair[1] } else { pair[0] };

                let mut hasher = Sha256::new();
                hasher.update(left);
                hasher.update(right);
                next.push(hasher.finalize().into());
            }
            level = next;
        }

        Self { root: level[0] }
    }

    pub fn root(&self) -> [u8; 32] {
        self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(parts: &[&[u8]]) -> Vec<Vec<u8>> {
        parts.iter().map(|part| part.to_vec()).collect()
    }

    #[test]
    fn test_root_is_deterministic() {
        let txs = items(&[b"tx-a", b"tx-b", b"tx-c"]);

        let first = MerkleTree::build(&txs).root();
        let second = MerkleTree::build(&txs).root();

        assert_eq!(first, second);
    }

    #[test]
    fn test_root_depends_on_order() {
        let forward = MerkleTree::build(&items(&[b"tx-a", b"tx-b"])).root();
        let reversed = MerkleTree::build(&items(&[b"tx-b", b"tx-a"])).root();

        assert_ne!(forward, reversed);
    }

    #[test]
    fn test_single_leaf_is_its_hash() {
        let tree = MerkleTree::build(&items(&[b"tx-a"]));
        let expected: [u8; 32] = Sha256::digest(b"tx-a").into();

        assert_eq!(tree.root(), expected);
    }

    #[test]
    fn test_odd_leaf_duplicated() {
        // three leaves: the trailing leaf is paired with itself
        let leaf = |data: &[u8]| -> [u8; 32] { Sha256::digest(data).into() };
        let join = |left: [u8; 32], right: [u8; 32]| -> [u8; 32] {
            let mut hasher = Sha256::new();
            hasher.update(left);
            hasher.update(right);
            hasher.finalize().into()
        };

        let ab = join(leaf(b"a"), leaf(b"b"));
        let cc = join(leaf(b"c"), leaf(b"c"));
        let expected = join(ab, cc);

        let tree = MerkleTree::build(&items(&[b"a", b"b", b"c"]));
        assert_eq!(tree.root(), expected);
    }

    #[test]
    fn test_empty_input_has_zero_root() {
        assert_eq!(MerkleTree::build(&[]).root(), [0u8; 32]);
    }
}
