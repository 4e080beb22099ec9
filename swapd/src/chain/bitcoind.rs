
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bitcoin::{Block, FeeRate, Transaction, Txid};
use bitcoin::consensus::serialize;
use tokio::sync::broadcast;

use bitcoin_ext::{BlockHeight, BlockRef, TransactionExt};
use bitcoin_ext::rpc::{BitcoinRpcClient, BitcoinRpcErrorExt, BitcoinRpcExt, RawTransactionInfo};
use bitcoin_ext::rpc::bitcoincore_rpc::RpcApi;

use crate::chain::ChainClient;
use crate::system::RuntimeManager;


/// Used when bitcoind has no fee estimate, 1 sat/vb.
const FALLBACK_FEE_RATE: FeeRate = FeeRate::from_sat_per_kwu(250);

/// Confirmation target for our claims.
const FEE_ESTIMATE_TARGET: u16 = 2;

const NOTIFICATION_BUFFER: usize = 64;

/// A [ChainClient] backed by bitcoind.
///
/// New blocks are found by polling the tip.
pub struct BitcoindChain {
	symbol: String,
	rpc: BitcoinRpcClient,
	filters: parking_lot::Mutex<HashSet<Txid>>,
	blocks: broadcast::Sender<BlockHeight>,
	transactions: broadcast::Sender<Transaction>,
}

impl BitcoindChain {
	pub async fn start(
		rtmgr: RuntimeManager,
		symbol: String,
		rpc: BitcoinRpcClient,
		poll_interval: Duration,
	) -> anyhow::Result<Arc<Self>> {
		let tip = rpc.tip().context("Failed to retrieve tip from bitcoind")?;

		let chain = Arc::new(BitcoindChain {
			symbol,
			rpc,
			filters: parking_lot::Mutex::new(HashSet::new()),
			blocks: broadcast::channel(NOTIFICATION_BUFFER).0,
			transactions: broadcast::channel(NOTIFICATION_BUFFER).0,
		});

		let proc = Process {
			chain: chain.clone(),
			tip: tip,
			poll_interval: poll_interval,
		};
		tokio::spawn(proc.run(rtmgr));

		Ok(chain)
	}

	/// Publish the txs in the block that spend a filtered input.
	fn process_block(&self, height: BlockHeight, block: &Block) {
		let spends = filtered_spends(&self.filters.lock(), block);
		for (spent, tx) in spends {
			slog!(FilteredInputSpent, symbol: self.symbol.clone(),
				spent_txid: spent, spending_txid: tx.compute_txid(),
			);
			let _ = self.transactions.send(tx);
		}
		slog!(TipUpdated, symbol: self.symbol.clone(), height, hash: block.block_hash());
		let _ = self.blocks.send(height);
	}
}

/// The txs in `block` spending an output of one of the `filters` txs.
fn filtered_spends(filters: &HashSet<Txid>, block: &Block) -> Vec<(Txid, Transaction)> {
	block.txdata.iter().filter_map(|tx| {
		tx.spent_txids_in(filters).next().map(|txid| (txid, tx.clone()))
	}).collect()
}

#[async_trait]
impl ChainClient for BitcoindChain {
	fn symbol(&self) -> &str {
		&self.symbol
	}

	async fn get_raw_transaction(&self, txid: Txid) -> anyhow::Result<Option<Transaction>> {
		match self.rpc.get_raw_transaction(&txid, None) {
			Ok(tx) => Ok(Some(tx)),
			Err(e) if e.is_not_found() => Ok(None),
			Err(e) => Err(e).with_context(|| format!("failed to fetch tx {}", txid)),
		}
	}

	async fn get_raw_transaction_verbose(&self, txid: Txid) -> anyhow::Result<Option<RawTransactionInfo>> {
		Ok(self.rpc.raw_transaction_info(&txid)
			.with_context(|| format!("failed to fetch tx info for {}", txid))?)
	}

	async fn send_raw_transaction(&self, tx: &Transaction) -> anyhow::Result<Txid> {
		let txid = tx.compute_txid();
		slog!(BroadcastingTx, symbol: self.symbol.clone(), txid, raw_tx: serialize(tx));
		match self.rpc.broadcast_tx(tx) {
			Ok(txid) => Ok(txid),
			Err(e) => {
				slog!(TxBroadcastError, symbol: self.symbol.clone(), txid,
					raw_tx: serialize(tx), error: e.to_string(),
				);
				Err(e).context("failed to broadcast tx")
			},
		}
	}

	async fn estimate_fee(&self) -> anyhow::Result<FeeRate> {
		let rate = self.rpc.estimate_fee_rate(FEE_ESTIMATE_TARGET)
			.context("failed to estimate fee")?;
		Ok(rate.unwrap_or(FALLBACK_FEE_RATE).max(FALLBACK_FEE_RATE))
	}

	async fn block_height(&self) -> anyhow::Result<BlockHeight> {
		let count = self.rpc.get_block_count().context("failed to fetch block count")?;
		Ok(count as BlockHeight)
	}

	fn add_input_filter(&self, txid: Txid) {
		self.filters.lock().insert(txid);
	}

	fn remove_input_filter(&self, txid: Txid) {
		if self.filters.lock().remove(&txid) {
			slog!(InputFilterRemoved, symbol: self.symbol.clone(), txid);
		}
	}

	fn subscribe_blocks(&self) -> broadcast::Receiver<BlockHeight> {
		self.blocks.subscribe()
	}

	fn subscribe_transactions(&self) -> broadcast::Receiver<Transaction> {
		self.transactions.subscribe()
	}
}

struct Process {
	chain: Arc<BitcoindChain>,
	tip: BlockRef,
	poll_interval: Duration,
}

impl Process {
	fn fetch_block(&self, height: BlockHeight) -> anyhow::Result<Block> {
		let hash = self.chain.rpc.get_block_hash(height as u64)
			.with_context(|| format!("failed to get block hash at {}", height))?;
		Ok(self.chain.rpc.get_block(&hash).with_context(|| format!("failed to get block {}", hash))?)
	}

	/// Process every block between our tip and the chain tip.
	///
	/// A reorg to the same height processes the new tip block again.
	fn update(&mut self) -> anyhow::Result<()> {
		let tip = self.chain.rpc.tip().context("failed to fetch tip")?;
		if tip == self.tip {
			return Ok(());
		}

		let start = if tip.height > self.tip.height { self.tip.height + 1 } else { tip.height };
		for height in start..=tip.height {
			let block = self.fetch_block(height)?;
			self.chain.process_block(height, &block);
			self.tip = BlockRef { height, hash: block.block_hash() };
		}
		Ok(())
	}

	async fn run(mut self, rtmgr: RuntimeManager) {
		let name = format!("BlockPoller-{}", self.chain.symbol);
		let _worker = rtmgr.spawn_critical(&name);

		loop {
			tokio::select! {
				() = tokio::time::sleep(self.poll_interval) => {},
				_ = rtmgr.shutdown_signal() => {
					info!("Shutdown signal received. Exiting {} loop...", name);
					break;
				}
			}

			if let Err(e) = self.update() {
				slog!(TipFetchError, symbol: self.chain.symbol.clone(), error: format!("{:#}", e));
			}
		}

		info!("{} loop terminated gracefully.", name);
	}
}
