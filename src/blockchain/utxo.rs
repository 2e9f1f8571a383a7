use std::collections::BTreeMap;

use log::info;

use super::block::Block;
use super::chain::{Blockchain, BlockchainError};
use super::storage::{KvStore, WriteBatch};
use super::transaction::{TxOutput, TxOutputs};

/// Store key prefix for index entries; the hex transaction id follows.
pub const UTXO_PREFIX: &[u8] = b"utxo-";

/// Derived index over the chain: transaction id -> outputs still unspent.
///
/// Maintained incrementally by [`update`](Self::update) on every appended
/// block and fully rebuildable by [`reindex`](Self::reindex). Entries keep
/// `(output_index, output)` pairs so spending a subset of a transaction's
/// outputs never shifts the indices of the remainder.
pub struct UtxoSet<'a, S: KvStore> {
    chain: &'a Blockchain<S>,
}

impl<'a, S: KvStore> UtxoSet<'a, S> {
    pub fn new(chain: &'a Blockchain<S>) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &'a Blockchain<S> {
        self.chain
    }

    fn entry_key(txid_hex: &str) -> Vec<u8> {
        let mut key = UTXO_PREFIX.to_vec();
        key.extend_from_slice(txid_hex.as_bytes());
        key
    }

    /// Drops every index entry and rebuilds the set from a full chain
    /// replay. Recovery/bootstrap path, not a hot path; the purge and the
    /// rewrite land in one atomic batch.
    pub fn reindex(&self) -> Result<(), BlockchainError> {
        let store = self.chain.store();
        let utxo = self.chain.find_utxo()?;

        let mut batch = WriteBatch::new();
        for (key, _) in store.scan_prefix(UTXO_PREFIX)? {
            batch.remove(key);
        }
        for (txid_hex, outputs) in &utxo {
            batch.insert(Self::entry_key(txid_hex), outputs.serialize()?);
        }
        store.apply_batch(batch)?;
        store.flush()?;

        info!("reindexed {} transactions with unspent outputs", utxo.len());
        Ok(())
    }

    /// Incremental maintenance for one newly appended block: consumes the
    /// entries its inputs spend and records the outputs it creates. Invoked
    /// exactly once per block by the sole writer.
    pub fn update(&self, block: &Block) -> Result<(), BlockchainError> {
        let store = self.chain.store();

        // staged entries, so several inputs spending from the same previous
        // transaction observe each other's removals before the batch lands
        let mut staged: BTreeMap<Vec<u8>, Option<TxOutputs>> = BTreeMap::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let txid_hex = hex::encode(&input.prev_tx_id);
                    let key = Self::entry_key(&txid_hex);

                    let outs = match staged.get(&key) {
                        Some(Some(outs)) => outs.clone(),
                        Some(None) => TxOutputs::default(),
                        None => {
                            let raw = store.get(&key)?.ok_or_else(|| {
                                BlockchainError::TransactionNotFound(txid_hex.clone())
                            })?;
                            TxOutputs::deserialize(&raw)?
                        }
                    };

                    let remaining: Vec<(u32, TxOutput)> = outs
                        .entries
                        .into_iter()
                        .filter(|(index, _)| *index as i32 != input.out_index)
                        .collect();

                    let entry = if remaining.is_empty() {
                        None
                    } else {
                        Some(TxOutputs { entries: remaining })
                    };
                    staged.insert(key, entry);
                }
            }

            let created = TxOutputs {
                entries: tx
                    .outputs
                    .iter()
                    .cloned()
                    .enumerate()
                    .map(|(index, out)| (index as u32, out))
                    .collect(),
            };
            staged.insert(Self::entry_key(&hex::encode(&tx.id)), Some(created));
        }

        let mut batch = WriteBatch::new();
        for (key, entry) in staged {
            match entry {
                Some(outputs) => batch.insert(key, outputs.serialize()?),
                None => batch.remove(key),
            }
        }
        store.apply_batch(batch)?;
        store.flush()?;

        Ok(())
    }

    /// Accumulates outputs locked to `pub_key_hash`, in ascending txid
    /// order, until `amount` is reached; returns the partial accumulation if
    /// the index is exhausted first (the caller detects insufficiency by
    /// comparing against `amount`).
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, BTreeMap<String, Vec<u32>>), BlockchainError> {
        let mut accumulated = 0u64;
        let mut spendable: BTreeMap<String, Vec<u32>> = BTreeMap::new();

        for (key, raw) in self.chain.store().scan_prefix(UTXO_PREFIX)? {
            let txid_hex = String::from_utf8_lossy(&key[UTXO_PREFIX.len()..]).into_owned();
            let outputs = TxOutputs::deserialize(&raw)?;

            for (out_index, out) in &outputs.entries {
                if out.is_locked_with_key(pub_key_hash) && accumulated < amount {
                    accumulated += out.value;
                    spendable.entry(txid_hex.clone()).or_default().push(*out_index);
                }
            }
        }

        Ok((accumulated, spendable))
    }

    /// Every unspent output locked to `pub_key_hash`, unfiltered by amount.
    pub fn find_unspent(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, BlockchainError> {
        let mut unspent = Vec::new();

        for (_, raw) in self.chain.store().scan_prefix(UTXO_PREFIX)? {
            let outputs = TxOutputs::deserialize(&raw)?;
            for (_, out) in outputs.entries {
                if out.is_locked_with_key(pub_key_hash) {
                    unspent.push(out);
                }
            }
        }

        Ok(unspent)
    }

    /// Sum of all unspent value locked to `pub_key_hash`.
    pub fn balance(&self, pub_key_hash: &[u8]) -> Result<u64, BlockchainError> {
        Ok(self
            .find_unspent(pub_key_hash)?
            .iter()
            .map(|out| out.value)
            .sum())
    }

    /// Number of transactions with at least one unspent output. Diagnostic.
    pub fn count_transactions(&self) -> Result<usize, BlockchainError> {
        Ok(self.chain.store().scan_prefix(UTXO_PREFIX)?.len())
    }
}
