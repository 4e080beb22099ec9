
//! Confirmation tracking of the refunds we broadcast of our own lockups.
//!
//! Every scan reads the pending refunds from the database, so a missed
//! block notification is caught up on the next one.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bitcoin::Txid;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::BroadcastStream;

use swap::{Swap, SwapType};

use crate::chain::{ChainBackend, Currencies};
use crate::database::{RefundTransactionRepository, SwapRepository};
use crate::database::model::{RefundStatus, RefundTransaction};
use crate::error::SwapError;
use crate::mutex::KeyedMutex;
use crate::system::RuntimeManager;


/// Confirmations after which a refund is final.
pub const REQUIRED_CONFIRMATIONS: u64 = 1;

const SCAN_LOCK: &str = "pending-refunds";

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub enum RefundEvent {
	/// The refund of the swap confirmed.
	Confirmed {
		swap: Swap,
	},
}

pub struct RefundWatcher {
	currencies: Currencies,
	swaps: Arc<dyn SwapRepository>,
	refunds: Arc<dyn RefundTransactionRepository>,
	locks: Arc<KeyedMutex<&'static str>>,
	events: broadcast::Sender<RefundEvent>,
}

impl RefundWatcher {
	pub fn new(
		currencies: Currencies,
		swaps: Arc<dyn SwapRepository>,
		refunds: Arc<dyn RefundTransactionRepository>,
		locks: Arc<KeyedMutex<&'static str>>,
	) -> RefundWatcher {
		RefundWatcher {
			currencies, swaps, refunds, locks,
			events: broadcast::channel(EVENT_BUFFER).0,
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<RefundEvent> {
		self.events.subscribe()
	}

	/// Check all pending refunds, returns the number that confirmed.
	pub async fn check_pending(&self) -> anyhow::Result<usize> {
		let _guard = self.locks.lock(SCAN_LOCK).await;

		let pending = self.refunds.get_pending_refunds().await
			.context("failed to load pending refunds")?;

		let mut nb_confirmed = 0;
		for refund in &pending {
			match self.check_refund(refund).await {
				Ok(true) => nb_confirmed += 1,
				Ok(false) => {},
				Err(e) => slog!(RefundCheckError, swap_id: refund.swap_id.clone(), txid: refund.id.clone(),
					error: format!("{:#}", e),
				),
			}
		}

		slog!(RefundScanFinished, nb_pending: pending.len(), nb_confirmed);
		Ok(nb_confirmed)
	}

	/// Returns true if the refund is confirmed now.
	async fn check_refund(&self, refund: &RefundTransaction) -> anyhow::Result<bool> {
		let swap = self.swaps.get_swap(&refund.swap_id).await?
			.ok_or_else(|| SwapError::SwapNotFound(refund.swap_id.clone()))?;
		let leg = match swap.kind() {
			SwapType::Submarine => bail!("submarine swap {} has no refund of ours", swap.id),
			SwapType::Reverse | SwapType::Chain => swap.refund_leg()
				.with_context(|| format!("swap {} has no refund leg", swap.id))?,
		};
		let currency = self.currencies.get(&leg.symbol)
			.with_context(|| format!("unknown currency {}", leg.symbol))?;

		let confirmations = match currency.backend {
			ChainBackend::Utxo(ref chain) => {
				let txid = Txid::from_str(&refund.id)
					.with_context(|| format!("invalid refund txid: {}", refund.id))?;
				let info = chain.get_raw_transaction_verbose(txid).await?
					.with_context(|| format!("refund tx {} not found", txid))?;
				info.confirmations() as u64
			},
			ChainBackend::Account(ref provider) => {
				provider.get_transaction_receipt(&refund.id).await?
					.map(|r| r.effective_confirmations())
					.unwrap_or(0)
			},
		};
		if confirmations < REQUIRED_CONFIRMATIONS {
			trace!("Refund {} of swap {} has {} confirmations", refund.id, swap.id, confirmations);
			return Ok(false);
		}

		if let Some(chain) = currency.chain_client() {
			match leg.lockup_outpoint() {
				Ok(lockup) => chain.remove_input_filter(lockup.txid),
				Err(e) => warn!("No lockup filter to remove for swap {}: {}", swap.id, e),
			}
		}

		if !self.refunds.set_refund_status(&refund.id, RefundStatus::Confirmed).await? {
			debug!("Refund {} of swap {} was not pending anymore", refund.id, swap.id);
			return Ok(false);
		}
		slog!(RefundConfirmed, swap_id: swap.id.clone(), symbol: leg.symbol.clone(),
			txid: refund.id.clone(), confirmations,
		);
		let _ = self.events.send(RefundEvent::Confirmed { swap });
		Ok(true)
	}

	/// Scan the pending refunds on every block of any chain, and every
	/// `check_interval` to recover from lost notifications.
	pub async fn run(self: Arc<Self>, rtmgr: RuntimeManager, check_interval: Duration) {
		let name = "RefundWatcher";
		let _worker = rtmgr.spawn_critical(name);

		let mut blocks = StreamMap::new();
		for currency in self.currencies.iter() {
			blocks.insert(currency.symbol.clone(), BroadcastStream::new(currency.subscribe_blocks()));
		}
		let mut interval = tokio::time::interval(check_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				Some((symbol, _)) = blocks.next() => {
					trace!("New {} block, checking pending refunds", symbol);
				},
				_ = interval.tick() => {},
				_ = rtmgr.shutdown_signal() => {
					info!("Shutdown signal received. Exiting {} loop...", name);
					break;
				}
			}

			if let Err(e) = self.check_pending().await {
				error!("Error checking pending refunds: {:#}", e);
			}
		}

		info!("{} loop terminated gracefully.", name);
	}
}
