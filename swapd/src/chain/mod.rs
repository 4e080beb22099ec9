
//! The chain backends the settlement core consumes.

pub mod bitcoind;

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{FeeRate, Transaction, Txid};
use tokio::sync::broadcast;

use bitcoin_ext::BlockHeight;
use bitcoin_ext::rpc::RawTransactionInfo;

use crate::error::SwapError;
use crate::wallet::Wallet;


/// The outcome of a mined transaction on an account-based chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionReceipt {
	pub success: bool,
	pub confirmations: u64,
}

impl TransactionReceipt {
	/// A failed transaction never counts as confirmed.
	pub fn effective_confirmations(&self) -> u64 {
		if self.success {
			self.confirmations
		} else {
			0
		}
	}
}

/// Client of a UTXO chain.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
	fn symbol(&self) -> &str;

	/// Returns [None] if the chain doesn't know the tx.
	async fn get_raw_transaction(&self, txid: Txid) -> anyhow::Result<Option<Transaction>>;

	/// Returns [None] if the chain doesn't know the tx.
	async fn get_raw_transaction_verbose(&self, txid: Txid) -> anyhow::Result<Option<RawTransactionInfo>>;

	async fn send_raw_transaction(&self, tx: &Transaction) -> anyhow::Result<Txid>;

	async fn estimate_fee(&self) -> anyhow::Result<FeeRate>;

	/// Height of the chain tip.
	async fn block_height(&self) -> anyhow::Result<BlockHeight>;

	/// Watch for transactions spending outputs of `txid`.
	fn add_input_filter(&self, txid: Txid);

	fn remove_input_filter(&self, txid: Txid);

	/// Heights of new blocks.
	fn subscribe_blocks(&self) -> broadcast::Receiver<BlockHeight>;

	/// Transactions that matched one of the input filters.
	fn subscribe_transactions(&self) -> broadcast::Receiver<Transaction>;
}

/// Provider of an account-based chain.
#[async_trait]
pub trait AccountProvider: Send + Sync + 'static {
	fn symbol(&self) -> &str;

	/// Returns [None] while the transaction is pending.
	async fn get_transaction_receipt(&self, hash: &str) -> anyhow::Result<Option<TransactionReceipt>>;

	/// Whether the transaction is known, mined or not.
	async fn transaction_exists(&self, hash: &str) -> anyhow::Result<bool>;

	fn subscribe_blocks(&self) -> broadcast::Receiver<BlockHeight>;
}

#[derive(Clone)]
pub enum ChainBackend {
	Utxo(Arc<dyn ChainClient>),
	Account(Arc<dyn AccountProvider>),
}

/// A chain we operate on.
#[derive(Clone)]
pub struct Currency {
	pub symbol: String,
	pub backend: ChainBackend,
	pub wallet: Option<Arc<dyn Wallet>>,
}

impl Currency {
	pub fn utxo(chain: Arc<dyn ChainClient>, wallet: Arc<dyn Wallet>) -> Currency {
		Currency {
			symbol: chain.symbol().to_owned(),
			backend: ChainBackend::Utxo(chain),
			wallet: Some(wallet),
		}
	}

	pub fn account(provider: Arc<dyn AccountProvider>) -> Currency {
		Currency {
			symbol: provider.symbol().to_owned(),
			backend: ChainBackend::Account(provider),
			wallet: None,
		}
	}

	pub fn chain_client(&self) -> Option<&Arc<dyn ChainClient>> {
		match self.backend {
			ChainBackend::Utxo(ref c) => Some(c),
			ChainBackend::Account(_) => None,
		}
	}

	pub fn subscribe_blocks(&self) -> broadcast::Receiver<BlockHeight> {
		match self.backend {
			ChainBackend::Utxo(ref c) => c.subscribe_blocks(),
			ChainBackend::Account(ref p) => p.subscribe_blocks(),
		}
	}
}

/// All currencies by symbol.
#[derive(Clone, Default)]
pub struct Currencies {
	inner: HashMap<String, Currency>,
}

impl Currencies {
	pub fn new(currencies: impl IntoIterator<Item = Currency>) -> Currencies {
		Currencies {
			inner: currencies.into_iter().map(|c| (c.symbol.clone(), c)).collect(),
		}
	}

	pub fn get(&self, symbol: &str) -> Option<&Currency> {
		self.inner.get(symbol)
	}

	pub fn iter(&self) -> impl Iterator<Item = &Currency> {
		self.inner.values()
	}

	pub fn len(&self) -> usize {
		self.inner.len()
	}

	/// The chain client and wallet of a UTXO currency.
	pub fn utxo(&self, symbol: &str) -> anyhow::Result<(&Arc<dyn ChainClient>, &Arc<dyn Wallet>)> {
		let currency = self.get(symbol).ok_or_else(|| anyhow!("unknown currency {}", symbol))?;
		match (currency.chain_client(), currency.wallet.as_ref()) {
			(Some(chain), Some(wallet)) => Ok((chain, wallet)),
			_ => Err(SwapError::CurrencyNotUtxoBased(symbol.to_owned()).into()),
		}
	}
}
