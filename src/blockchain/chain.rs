use std::collections::HashMap;

use log::info;
use secp256k1::SecretKey;
use thiserror::Error;

use super::block::{Block, BlockError};
use super::storage::{KvStore, StorageError, WriteBatch};
use super::transaction::{Transaction, TransactionError, TxOutputs};

/// Store key holding the hash of the most recently appended block.
pub const TIP_KEY: &[u8] = b"lh";

const GENESIS_DATA: &[u8] = b"First transaction from genesis";

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Blockchain already exists in this store")]
    AlreadyExists,

    #[error("No existing blockchain found")]
    NoChain,

    #[error("Transaction {0} does not exist")]
    TransactionNotFound(String),

    #[error("Block {0} does not exist")]
    BlockNotFound(String),

    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// The append-only chain: an explicit tip pointer plus the persistent store.
///
/// Single-writer: callers must not run `add_block` (and the paired UTXO
/// update) concurrently with another such pair or with a reindex on the same
/// store.
#[derive(Debug)]
pub struct Blockchain<S: KvStore> {
    tip: Vec<u8>,
    store: S,
}

impl<S: KvStore> Blockchain<S> {
    /// Creates a new chain in an empty store by mining a genesis block with a
    /// single coinbase transaction paying the subsidy to `address`.
    pub fn init(store: S, address: &str) -> Result<Self, BlockchainError> {
        if store.get(TIP_KEY)?.is_some() {
            return Err(BlockchainError::AlreadyExists);
        }

        let coinbase = Transaction::coinbase(address, GENESIS_DATA)?;
        let genesis = Block::genesis(coinbase)?;

        let mut batch = WriteBatch::new();
        batch.insert(genesis.hash.clone(), genesis.serialize()?);
        batch.insert(TIP_KEY.to_vec(), genesis.hash.clone());
        store.apply_batch(batch)?;
        store.flush()?;

        info!("created chain with genesis block {}", hex::encode(&genesis.hash));

        Ok(Self {
            tip: genesis.hash,
            store,
        })
    }

    /// Reopens a chain previously persisted in `store`.
    pub fn open(store: S) -> Result<Self, BlockchainError> {
        let tip = store.get(TIP_KEY)?.ok_or(BlockchainError::NoChain)?;
        Ok(Self { tip, store })
    }

    pub fn tip(&self) -> &[u8] {
        &self.tip
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mines a block holding `transactions` on top of the current tip and
    /// atomically advances the tip pointer.
    pub fn add_block(&mut self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        let last_hash = self.store.get(TIP_KEY)?.ok_or(BlockchainError::NoChain)?;
        let block = Block::new(transactions, last_hash)?;

        let mut batch = WriteBatch::new();
        batch.insert(block.hash.clone(), block.serialize()?);
        batch.insert(TIP_KEY.to_vec(), block.hash.clone());
        self.store.apply_batch(batch)?;
        self.store.flush()?;

        self.tip = block.hash.clone();
        info!("added block {}", hex::encode(&block.hash));

        Ok(block)
    }

    /// Lazy tip-to-genesis traversal. Each call starts fresh from the
    /// current tip.
    pub fn iter(&self) -> ChainIterator<'_, S> {
        ChainIterator {
            current_hash: self.tip.clone(),
            store: &self.store,
        }
    }

    /// Scans the chain from the tip for a transaction with the given id.
    /// O(chain length); used only to gather signing context.
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, BlockchainError> {
        for block in self.iter() {
            for tx in block?.transactions {
                if tx.id == id {
                    return Ok(tx);
                }
            }
        }

        Err(BlockchainError::TransactionNotFound(hex::encode(id)))
    }

    fn prev_transactions(
        &self,
        tx: &Transaction,
    ) -> Result<HashMap<String, Transaction>, BlockchainError> {
        let mut prev_txs = HashMap::new();
        for input in &tx.inputs {
            let prev_tx = self.find_transaction(&input.prev_tx_id)?;
            prev_txs.insert(hex::encode(&prev_tx.id), prev_tx);
        }
        Ok(prev_txs)
    }

    /// Gathers previous-transaction context from the chain and signs `tx`.
    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        secret_key: &SecretKey,
    ) -> Result<(), BlockchainError> {
        let prev_txs = self.prev_transactions(tx)?;
        tx.sign(secret_key, &prev_txs)?;
        Ok(())
    }

    /// Gathers previous-transaction context from the chain and verifies `tx`.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, BlockchainError> {
        if tx.is_coinbase() {
            return Ok(true);
        }

        let prev_txs = self.prev_transactions(tx)?;
        Ok(tx.verify(&prev_txs)?)
    }

    /// Replays the whole chain and returns every output never referenced by a
    /// later input, grouped by hex transaction id. The authoritative rebuild
    /// path behind [`UtxoSet::reindex`](super::utxo::UtxoSet::reindex).
    pub fn find_utxo(&self) -> Result<HashMap<String, TxOutputs>, BlockchainError> {
        let mut utxo: HashMap<String, TxOutputs> = HashMap::new();
        let mut spent: HashMap<String, Vec<i32>> = HashMap::new();

        // walking tip to genesis means every spend is seen before the
        // outputs it consumes
        for block in self.iter() {
            for tx in &block?.transactions {
                let txid = hex::encode(&tx.id);

                for (out_index, out) in tx.outputs.iter().enumerate() {
                    let spent_here = spent
                        .get(&txid)
                        .map_or(false, |indices| indices.contains(&(out_index as i32)));
                    if !spent_here {
                        utxo.entry(txid.clone())
                            .or_default()
                            .entries
                            .push((out_index as u32, out.clone()));
                    }
                }

                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        spent
                            .entry(hex::encode(&input.prev_tx_id))
                            .or_default()
                            .push(input.out_index);
                    }
                }
            }
        }

        Ok(utxo)
    }
}

/// Backward block iterator, tip to genesis.
pub struct ChainIterator<'a, S: KvStore> {
    current_hash: Vec<u8>,
    store: &'a S,
}

impl<S: KvStore> Iterator for ChainIterator<'_, S> {
    type Item = Result<Block, BlockchainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }

        let raw = match self.store.get(&self.current_hash) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                let missing = hex::encode(&self.current_hash);
                self.current_hash = Vec::new();
                return Some(Err(BlockchainError::BlockNotFound(missing)));
            }
            Err(err) => {
                self.current_hash = Vec::new();
                return Some(Err(err.into()));
            }
        };

        match Block::deserialize(&raw) {
            Ok(block) => {
                self.current_hash = block.prev_hash.clone();
                Some(Ok(block))
            }
            Err(err) => {
                self.current_hash = Vec::new();
                Some(Err(err.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::storage::MemoryStore;
    use crate::blockchain::transaction::SUBSIDY;
    use crate::blockchain::wallet::Wallet;

    #[test]
    fn test_init_creates_genesis() {
        let wallet = Wallet::new();
        let chain = Blockchain::init(MemoryStore::new(), &wallet.address()).unwrap();

        let blocks: Vec<Block> = chain.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].prev_hash.is_empty());

        let coinbase = &blocks[0].transactions[0];
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.outputs[0].value, SUBSIDY);
    }

    #[test]
    fn test_init_twice_fails() {
        let wallet = Wallet::new();
        let store = MemoryStore::new();
        let chain = Blockchain::init(store, &wallet.address()).unwrap();

        let result = Blockchain::init(chain.store, &wallet.address());
        assert!(matches!(result, Err(BlockchainError::AlreadyExists)));
    }

    #[test]
    fn test_open_without_chain_fails() {
        let result = Blockchain::open(MemoryStore::new());
        assert!(matches!(result, Err(BlockchainError::NoChain)));
    }

    #[test]
    fn test_open_restores_tip() {
        let wallet = Wallet::new();
        let mut chain = Blockchain::init(MemoryStore::new(), &wallet.address()).unwrap();
        let filler = Transaction::coinbase(&wallet.address(), b"").unwrap();
        let block = chain.add_block(vec![filler]).unwrap();

        let reopened = Blockchain::open(chain.store).unwrap();
        assert_eq!(reopened.tip(), block.hash.as_slice());
    }

    #[test]
    fn test_iterator_walks_tip_to_genesis() {
        let wallet = Wallet::new();
        let mut chain = Blockchain::init(MemoryStore::new(), &wallet.address()).unwrap();

        let mut tips = vec![chain.tip().to_vec()];
        for _ in 0..2 {
            let filler = Transaction::coinbase(&wallet.address(), b"").unwrap();
            let block = chain.add_block(vec![filler]).unwrap();
            tips.push(block.hash.clone());
        }

        let blocks: Vec<Block> = chain.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].hash, tips[2]);
        assert_eq!(blocks[1].hash, tips[1]);
        assert_eq!(blocks[2].hash, tips[0]);
        assert!(blocks[2].prev_hash.is_empty());

        // restartable: a second traversal starts from the tip again
        assert_eq!(chain.iter().count(), 3);
    }

    #[test]
    fn test_find_transaction() {
        let wallet = Wallet::new();
        let mut chain = Blockchain::init(MemoryStore::new(), &wallet.address()).unwrap();
        let tx = Transaction::coinbase(&wallet.address(), b"findable").unwrap();
        chain.add_block(vec![tx.clone()]).unwrap();

        let found = chain.find_transaction(&tx.id).unwrap();
        assert_eq!(found, tx);

        let missing = chain.find_transaction(b"no such id");
        assert!(matches!(missing, Err(BlockchainError::TransactionNotFound(_))));
    }
}
