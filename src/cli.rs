use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::blockchain::chain::Blockchain;
use crate::blockchain::pow::ProofOfWork;
use crate::blockchain::storage::SledStore;
use crate::blockchain::transaction::Transaction;
use crate::blockchain::utxo::UtxoSet;
use crate::blockchain::wallet::{self, Wallets};

#[derive(Parser)]
#[command(name = "utxo-ledger", version, about = "A single-node proof-of-work UTXO ledger")]
pub struct Cli {
    /// Directory holding the chain database
    #[arg(long, default_value = "tmp/blocks")]
    pub db_path: String,

    /// Wallet file location
    #[arg(long, default_value = "tmp/wallet.data")]
    pub wallet_file: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a blockchain and pay the genesis subsidy to ADDRESS
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },
    /// Get the balance for ADDRESS
    GetBalance {
        #[arg(long)]
        address: String,
    },
    /// Send AMOUNT from one wallet address to another
    Send {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
    },
    /// Print the blocks in the chain, tip to genesis
    PrintChain,
    /// Create a new wallet
    CreateWallet,
    /// List the addresses in the wallet file
    ListAddress,
    /// Rebuild the UTXO set from a full chain replay
    ReindexUtxo,
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::CreateBlockchain { address } => create_blockchain(&cli.db_path, &address),
        Command::GetBalance { address } => get_balance(&cli.db_path, &address),
        Command::Send { from, to, amount } => send(&cli.db_path, &cli.wallet_file, &from, &to, amount),
        Command::PrintChain => print_chain(&cli.db_path),
        Command::CreateWallet => create_wallet(&cli.wallet_file),
        Command::ListAddress => list_address(&cli.db_path, &cli.wallet_file),
        Command::ReindexUtxo => reindex_utxo(&cli.db_path),
    }
}

fn ensure_address(address: &str) -> Result<()> {
    if !wallet::validate_address(address) {
        bail!("address is not valid: {address}");
    }
    Ok(())
}

fn open_chain(db_path: &str) -> Result<Blockchain<SledStore>> {
    let store = SledStore::open(db_path)?;
    Blockchain::open(store).context("no existing blockchain found, create one first")
}

fn create_blockchain(db_path: &str, address: &str) -> Result<()> {
    ensure_address(address)?;

    let store = SledStore::open(db_path)?;
    let chain = Blockchain::init(store, address)?;
    UtxoSet::new(&chain).reindex()?;

    println!("Done! Chain tip: {}", hex::encode(chain.tip()));
    Ok(())
}

fn get_balance(db_path: &str, address: &str) -> Result<()> {
    ensure_address(address)?;

    let chain = open_chain(db_path)?;
    let pub_key_hash = wallet::address_to_pub_key_hash(address)?;
    let balance = UtxoSet::new(&chain).balance(&pub_key_hash)?;

    println!("Balance of {address}: {balance}");
    Ok(())
}

fn send(db_path: &str, wallet_file: &str, from: &str, to: &str, amount: u64) -> Result<()> {
    ensure_address(from)?;
    ensure_address(to)?;

    let wallets = Wallets::open(wallet_file)?;
    let from_wallet = wallets.get_wallet(from)?;

    let mut chain = open_chain(db_path)?;
    let tx = {
        let utxo = UtxoSet::new(&chain);
        Transaction::new_transfer(&from_wallet, to, amount, &utxo)?
    };
    let block = chain.add_block(vec![tx])?;
    UtxoSet::new(&chain).update(&block)?;

    println!("Success!");
    Ok(())
}

fn print_chain(db_path: &str) -> Result<()> {
    let chain = open_chain(db_path)?;

    for block in chain.iter() {
        let block = block?;

        println!("PrevHash: {}", hex::encode(&block.prev_hash));
        println!("Hash:     {}", hex::encode(&block.hash));
        println!("PoW:      {}", ProofOfWork::new(&block).validate());
        for tx in &block.transactions {
            println!("{tx}");
        }
        println!();
    }

    Ok(())
}

fn create_wallet(wallet_file: &str) -> Result<()> {
    let mut wallets = Wallets::open(wallet_file)?;
    let address = wallets.create_wallet();
    wallets.save()?;

    println!("New address is: {address}");
    Ok(())
}

fn list_address(db_path: &str, wallet_file: &str) -> Result<()> {
    let wallets = Wallets::open(wallet_file)?;
    let chain = open_chain(db_path)?;
    let utxo = UtxoSet::new(&chain);

    for address in wallets.addresses() {
        let pub_key_hash = wallet::address_to_pub_key_hash(&address)?;
        let balance = utxo.balance(&pub_key_hash)?;
        println!("{address}  balance: {balance}");
    }

    Ok(())
}

fn reindex_utxo(db_path: &str) -> Result<()> {
    let chain = open_chain(db_path)?;
    let utxo = UtxoSet::new(&chain);
    utxo.reindex()?;

    let count = utxo.count_transactions()?;
    println!("Done! There are {count} transactions in the UTXO set.");
    Ok(())
}
