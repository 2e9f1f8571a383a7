use sha2::{Digest, Sha256};
use thiserror::Error;

use super::block::Block;

/// Number of leading zero bits a block hash must carry.
pub const DIFFICULTY: u32 = 12;

/// Errors that can occur during the nonce search
#[derive(Debug, Error)]
pub enum PowError {
    #[error("Nonce space exhausted at difficulty {difficulty}")]
    NonceExhausted { difficulty: u32 },
}

/// Nonce search and validation against a fixed `2^(256 - DIFFICULTY)` target.
///
/// The hash is compared to the target as big-endian bytes; for fixed-width
/// big-endian encodings lexicographic order equals integer order.
pub struct ProofOfWork<'a> {
    block: &'a Block,
    merkle_root: [u8; 32],
    target: [u8; 32],
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> Self {
        Self {
            block,
            merkle_root: block.hash_transactions(),
            target: target_bytes(DIFFICULTY),
        }
    }

    fn hash_payload(&self, nonce: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.block.prev_hash);
        hasher.update(self.merkle_root);
        hasher.update(nonce.to_be_bytes());
        hasher.update(u64::from(DIFFICULTY).to_be_bytes());
        hasher.finalize().into()
    }

    /// Searches nonces from zero upward until the hash drops below the
    /// target. Exhausting the nonce space means the difficulty is
    /// misconfigured and is fatal.
    pub fn run(&self) -> Result<(u64, Vec<u8>), PowError> {
        for nonce in 0..u64::MAX {
            let hash = self.hash_payload(nonce);
            if hash < self.target {
                return Ok((nonce, hash.to_vec()));
            }
        }

        Err(PowError::NonceExhausted {
            difficulty: DIFFICULTY,
        })
    }

    /// Recomputes the hash from the stored nonce and checks it against the
    /// target. Read-only; used to verify historical blocks.
    pub fn validate(&self) -> bool {
        self.hash_payload(self.block.nonce) < self.target
    }
}

fn target_bytes(difficulty: u32) -> [u8; 32] {
    // big-endian representation of 1 << (256 - difficulty)
    let mut target = [0u8; 32];
    let bit = 256 - difficulty as usize;
    target[31 - bit / 8] = 1 << (bit % 8);
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::Transaction;
    use crate::blockchain::wallet::Wallet;

    fn mined_block() -> Block {
        let wallet = Wallet::new();
        let coinbase = Transaction::coinbase(&wallet.address(), b"pow test").unwrap();
        Block::new(vec![coinbase], b"prev".to_vec()).unwrap()
    }

    #[test]
    fn test_target_bytes() {
        // difficulty 12: one zero byte, then the 2^4 bit
        let target = target_bytes(12);
        assert_eq!(target[0], 0);
        assert_eq!(target[1], 0x10);
        assert!(target[2..].iter().all(|byte| *byte == 0));

        // difficulty 8: the 2^248 bit, one leading zero byte required
        let target = target_bytes(8);
        assert_eq!(target[0], 1);
        assert!(target[1..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn test_mined_block_validates() {
        let block = mined_block();
        assert!(ProofOfWork::new(&block).validate());
    }

    #[test]
    fn test_nonce_mutation_invalidates() {
        let mut block = mined_block();
        block.nonce += 1;
        assert!(!ProofOfWork::new(&block).validate());
    }

    #[test]
    fn test_mined_hash_meets_difficulty() {
        let block = mined_block();
        assert_eq!(block.hash[0], 0);
        assert!(block.hash[1] < 0x10);
    }
}
