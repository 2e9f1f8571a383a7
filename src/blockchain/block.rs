use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::merkle::MerkleTree;
use super::pow::{PowError, ProofOfWork};
use super::transaction::Transaction;

/// Errors that can occur during block operations
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Proof-of-work error: {0}")]
    PowError(#[from] PowError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// A mined block. Immutable once constructed; an empty `prev_hash` marks the
/// genesis block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub hash: Vec<u8>,

    pub transactions: Vec<Transaction>,

    pub prev_hash: Vec<u8>,

    pub nonce: u64,
}

impl Block {
    /// Mines a new block holding `transactions` on top of `prev_hash`;
    /// construction always runs proof-of-work.
    pub fn new(transactions: Vec<Transaction>, prev_hash: Vec<u8>) -> Result<Self, BlockError> {
        let mut block = Block {
            hash: Vec::new(),
            transactions,
            prev_hash,
            nonce: 0,
        };

        let (nonce, hash) = ProofOfWork::new(&block).run()?;
        block.nonce = nonce;
        block.hash = hash;

        Ok(block)
    }

    /// The genesis block: a single coinbase transaction, no previous hash.
    pub fn genesis(coinbase: Transaction) -> Result<Self, BlockError> {
        Self::new(vec![coinbase], Vec::new())
    }

    /// Merkle root over the serialized transactions.
    pub fn hash_transactions(&self) -> [u8; 32] {
        let items: Vec<Vec<u8>> = self
            .transactions
            .iter()
            .map(|tx| bincode::serialize(tx).unwrap())
            .collect();

        MerkleTree::build(&items).root()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, BlockError> {
        bincode::serialize(self).map_err(|e| BlockError::SerializationError(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, BlockError> {
        bincode::deserialize(data).map_err(|e| BlockError::DeserializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::pow::ProofOfWork;
    use crate::blockchain::wallet::Wallet;

    fn coinbase(data: &[u8]) -> Transaction {
        let wallet = Wallet::new();
        Transaction::coinbase(&wallet.address(), data).unwrap()
    }

    #[test]
    fn test_new_block_is_mined() {
        let block = Block::new(vec![coinbase(b"a")], b"prev".to_vec()).unwrap();

        assert!(!block.hash.is_empty());
        assert_eq!(block.prev_hash, b"prev".to_vec());
        assert!(ProofOfWork::new(&block).validate());
    }

    #[test]
    fn test_genesis_has_empty_prev_hash() {
        let genesis = Block::genesis(coinbase(b"genesis")).unwrap();

        assert!(genesis.prev_hash.is_empty());
        assert_eq!(genesis.transactions.len(), 1);
        assert!(ProofOfWork::new(&genesis).validate());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let block = Block::new(vec![coinbase(b"a"), coinbase(b"b")], b"prev".to_vec()).unwrap();

        let bytes = block.serialize().unwrap();
        let decoded = Block::deserialize(&bytes).unwrap();

        assert_eq!(decoded, block);
    }

    #[test]
    fn test_transaction_order_changes_commitment() {
        let first = coinbase(b"a");
        let second = coinbase(b"b");

        let forward = Block {
            hash: Vec::new(),
            transactions: vec![first.clone(), second.clone()],
            prev_hash: Vec::new(),
            nonce: 0,
        };
        let reversed = Block {
            hash: Vec::new(),
            transactions: vec![second, first],
            prev_hash: Vec::new(),
            nonce: 0,
        };

        assert_ne!(forward.hash_transactions(), reversed.hash_transactions());
    }
}
