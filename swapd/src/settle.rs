
//! Handoff to the non-cooperative settlement path.

use bitcoin::Txid;
use swap::{Preimage, Swap};
use tokio::sync::mpsc;

use crate::chain::Currency;
use crate::system::RuntimeManager;


/// Settles swaps without the counterparty's help.
#[async_trait]
pub trait SettlementAttempt: Send + Sync + 'static {
	/// Try to claim the swap's lockup on `currency` through the script path.
	async fn attempt_settle(
		&self,
		currency: &Currency,
		swap: &Swap,
		channel_hint: Option<String>,
		preimage: Option<Preimage>,
	) -> anyhow::Result<()>;

	/// Settle the held invoice of a reverse swap.
	async fn settle_invoice(&self, swap: &Swap, preimage: Preimage) -> anyhow::Result<()>;

	/// Claim the lockups of all `claims` on `currency` in one script-path
	/// transaction.
	///
	/// Returns [None] if the claims were handed over and the settlement
	/// service records the outcome itself.
	async fn claim_batch(
		&self,
		currency: &Currency,
		claims: &[DeferredClaim],
	) -> anyhow::Result<Option<BatchClaimed>>;
}

/// A claim waiting for the next batch sweep of its chain.
#[derive(Debug, Clone)]
pub struct DeferredClaim {
	pub swap: Swap,
	pub preimage: Preimage,
}

/// A batch claim that was broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchClaimed {
	pub txid: Txid,
	/// Fee of the whole transaction.
	pub fee: u64,
}

#[derive(Debug, Clone)]
pub enum SettlementRequest {
	Claim {
		symbol: String,
		swap_id: String,
		channel_hint: Option<String>,
		preimage: Option<Preimage>,
	},
	SettleInvoice {
		swap_id: String,
		preimage: Preimage,
	},
	BatchClaim {
		symbol: String,
		claims: Vec<(String, Preimage)>,
	},
}

/// A [SettlementAttempt] that queues requests for the settlement worker.
#[derive(Clone)]
pub struct SettlementQueue {
	tx: mpsc::UnboundedSender<SettlementRequest>,
}

impl SettlementQueue {
	pub fn new() -> (SettlementQueue, mpsc::UnboundedReceiver<SettlementRequest>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(SettlementQueue { tx }, rx)
	}

	fn send(&self, req: SettlementRequest) -> anyhow::Result<()> {
		self.tx.send(req).map_err(|_| anyhow!("settlement queue closed"))
	}
}

#[async_trait]
impl SettlementAttempt for SettlementQueue {
	async fn attempt_settle(
		&self,
		currency: &Currency,
		swap: &Swap,
		channel_hint: Option<String>,
		preimage: Option<Preimage>,
	) -> anyhow::Result<()> {
		slog!(SettlementRequested, swap_id: swap.id.clone(), symbol: currency.symbol.clone(),
			with_preimage: preimage.is_some(),
		);
		self.send(SettlementRequest::Claim {
			symbol: currency.symbol.clone(),
			swap_id: swap.id.clone(),
			channel_hint,
			preimage,
		})
	}

	async fn settle_invoice(&self, swap: &Swap, preimage: Preimage) -> anyhow::Result<()> {
		self.send(SettlementRequest::SettleInvoice { swap_id: swap.id.clone(), preimage })
	}

	async fn claim_batch(
		&self,
		currency: &Currency,
		claims: &[DeferredClaim],
	) -> anyhow::Result<Option<BatchClaimed>> {
		self.send(SettlementRequest::BatchClaim {
			symbol: currency.symbol.clone(),
			claims: claims.iter().map(|c| (c.swap.id.clone(), c.preimage)).collect(),
		})?;
		Ok(None)
	}
}

/// Drain the settlement queue until shutdown.
///
/// This only logs the requests. Deployments that settle on their own pass
/// their [SettlementAttempt] to [crate::Server::start_with_settlement].
pub async fn run_settlement_log(
	rtmgr: RuntimeManager,
	mut rx: mpsc::UnboundedReceiver<SettlementRequest>,
) {
	let _worker = rtmgr.spawn("SettlementLog");
	loop {
		tokio::select! {
			req = rx.recv() => match req {
				Some(SettlementRequest::Claim { symbol, swap_id, channel_hint, preimage }) => {
					info!("Settlement of {} swap {} requested (channel hint: {:?}, preimage known: {})",
						symbol, swap_id, channel_hint, preimage.is_some(),
					);
				},
				Some(SettlementRequest::SettleInvoice { swap_id, .. }) => {
					info!("Invoice settlement of reverse swap {} requested", swap_id);
				},
				Some(SettlementRequest::BatchClaim { symbol, claims }) => {
					info!("Batch claim of {} {} swaps requested", claims.len(), symbol);
				},
				None => break,
			},
			_ = rtmgr.shutdown_signal() => {
				info!("Shutdown signal received. Exiting SettlementLog loop...");
				break;
			}
		}
	}
}


#[cfg(test)]
mod test {
	use super::*;

	use std::sync::Arc;

	use crate::test_util::{self, MockChain, MockWallet};

	#[tokio::test]
	async fn batch_claim_is_queued() {
		let (queue, mut rx) = SettlementQueue::new();
		let currency = Currency::utxo(Arc::new(MockChain::new("BTC")), Arc::new(MockWallet::new("BTC")));
		let claims = ["a", "b"].into_iter().map(|id| DeferredClaim {
			swap: test_util::submarine_swap(id, "BTC", 10_000),
			preimage: Preimage::from_byte_array(test_util::PREIMAGE),
		}).collect::<Vec<_>>();

		assert_eq!(queue.claim_batch(&currency, &claims).await.unwrap(), None);
		match rx.recv().await.unwrap() {
			SettlementRequest::BatchClaim { symbol, claims } => {
				assert_eq!(symbol, "BTC");
				assert_eq!(claims.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(), ["a", "b"]);
			},
			other => panic!("unexpected request: {:?}", other),
		}

		drop(rx);
		queue.claim_batch(&currency, &claims).await.unwrap_err();
	}
}
