// Ledger core
//
// This module contains the ledger engine:
// - Block structure and mining
// - Chain storage and traversal
// - Transaction structure, signing and verification
// - Merkle transaction commitment
// - Proof of work
// - UTXO index
// - Wallet key management

pub mod block;
pub mod chain;
pub mod merkle;
pub mod pow;
pub mod storage;
pub mod transaction;
pub mod utxo;
pub mod wallet;

// Re-export main components for easier access
pub use block::Block;
pub use chain::Blockchain;
pub use transaction::Transaction;
pub use utxo::UtxoSet;
pub use wallet::{Wallet, Wallets};
