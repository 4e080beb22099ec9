
//! Accounting of the value at risk in unconfirmed lockups.
//!
//! Each tracked chain has a ceiling on the summed amount of the lockups we
//! accepted without confirmation. Admission and the block driven
//! reconciliation of a chain take the same lock, so they never interleave.
//!
//! When an accepted lockup disappears from its chain, zero-conf is disabled
//! for that chain until the process restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use bitcoin::{Transaction, Txid};
use tokio::sync::broadcast;

use crate::chain::{ChainBackend, Currencies};
use crate::database::PendingLockupRepository;
use crate::database::model::PendingLockup;
use crate::error::{ContextExt, SwapError};
use crate::mutex::KeyedMutex;
use crate::rates::RateProvider;
use crate::system::RuntimeManager;
use swap::Swap;


/// Amounts in a chain's base unit.
pub type RiskAmount = u128;

const EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZeroConfEvent {
	/// Zero-conf was disabled for the chain.
	Disabled {
		symbol: String,
	},
}

/// Outcome of checking one pending lockup.
enum LockupState {
	Pending,
	Confirmed,
	Missing,
}

pub struct RiskLedger {
	currencies: Currencies,
	lockups: Arc<dyn PendingLockupRepository>,
	rates: Arc<dyn RateProvider>,

	max_risks: HashMap<String, RiskAmount>,
	risks: parking_lot::Mutex<HashMap<String, RiskAmount>>,
	accepted: HashMap<String, AtomicBool>,

	locks: KeyedMutex<String>,
	events: broadcast::Sender<ZeroConfEvent>,
}

impl RiskLedger {
	/// Create a ledger tracking the chains in `max_risks` we have a currency for.
	pub fn new(
		currencies: Currencies,
		lockups: Arc<dyn PendingLockupRepository>,
		rates: Arc<dyn RateProvider>,
		max_risks: impl IntoIterator<Item = (String, RiskAmount)>,
	) -> RiskLedger {
		let max_risks = max_risks.into_iter().filter(|(symbol, _)| {
			if currencies.get(symbol).is_none() {
				warn!("Not tracking zero-conf risk of {}: no such currency", symbol);
				return false;
			}
			true
		}).collect::<HashMap<_, _>>();

		RiskLedger {
			risks: parking_lot::Mutex::new(max_risks.keys().map(|s| (s.clone(), 0)).collect()),
			accepted: max_risks.keys().map(|s| (s.clone(), AtomicBool::new(true))).collect(),
			max_risks,
			currencies,
			lockups,
			rates,
			locks: KeyedMutex::new(),
			events: broadcast::channel(EVENT_BUFFER).0,
		}
	}

	/// Restore the risk of every tracked chain from the persisted pending lockups.
	pub async fn init(&self) -> anyhow::Result<()> {
		for (symbol, max_risk) in &self.max_risks {
			let _guard = self.locks.lock(symbol.clone()).await;

			let pending = self.lockups.get_pending_lockups(symbol).await
				.with_context(|| format!("failed to load pending lockups of {}", symbol))?;
			let risk = pending.iter().fold(0, |acc: RiskAmount, l| acc.saturating_add(l.amount));
			self.risks.lock().insert(symbol.clone(), risk);

			slog!(RiskLedgerInitialized, symbol: symbol.clone(), risk, max_risk: *max_risk,
				nb_pending: pending.len(),
			);
		}
		Ok(())
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ZeroConfEvent> {
		self.events.subscribe()
	}

	/// Whether we currently accept unconfirmed lockups on the chain.
	pub fn zero_conf_accepted(&self, symbol: &str) -> bool {
		self.accepted.get(symbol).map(|a| a.load(Ordering::SeqCst)).unwrap_or(false)
	}

	/// The current risk of every tracked chain.
	pub fn risks(&self) -> HashMap<String, RiskAmount> {
		self.risks.lock().clone()
	}

	pub fn max_risks(&self) -> &HashMap<String, RiskAmount> {
		&self.max_risks
	}

	/// The symbols whose risk we track.
	pub fn tracked_symbols(&self) -> impl Iterator<Item = &String> {
		self.max_risks.keys()
	}

	/// Check whether accepting the unconfirmed lockup of `swap` keeps the
	/// chain within its risk ceiling, and account for it if so.
	///
	/// `raw_lockup` is the hex encoded transaction on UTXO chains and the
	/// transaction hash on account chains.
	pub async fn is_acceptable(&self, swap: &Swap, raw_lockup: &str) -> anyhow::Result<bool> {
		let leg = match swap.receiving_leg() {
			Some(l) => l,
			None => return badarg!("{} swap {} has no lockup of the user", swap.kind(), swap.id),
		};
		let symbol = &leg.symbol;
		let max_risk = *self.max_risks.get(symbol)
			.ok_or_else(|| SwapError::SymbolNotTracked(symbol.clone()))?;
		if !self.zero_conf_accepted(symbol) {
			return Err(SwapError::ZeroConfDisabled(symbol.clone()).into());
		}

		let currency = self.currencies.get(symbol)
			.ok_or_else(|| SwapError::SymbolNotTracked(symbol.clone()))?;
		let txid = match currency.backend {
			ChainBackend::Utxo(_) => {
				let tx = bitcoin::consensus::encode::deserialize_hex::<Transaction>(raw_lockup)
					.badarg("invalid lockup transaction")?;
				tx.compute_txid().to_string()
			},
			ChainBackend::Account(_) => raw_lockup.to_owned(),
		};
		let amount = RiskAmount::from(leg.amount);

		let _guard = self.locks.lock(symbol.clone()).await;

		// reconciliation may have disabled the chain while we waited
		if !self.zero_conf_accepted(symbol) {
			return Err(SwapError::ZeroConfDisabled(symbol.clone()).into());
		}

		let existing = self.lockups.get_pending_lockup(&swap.id).await
			.context("failed to load pending lockup")?;
		if let Some(existing) = existing {
			debug!("Lockup {} of swap {} is accounted for already", existing.txid, swap.id);
			return Ok(true);
		}

		let risk = self.risks.lock().get(symbol).copied().unwrap_or(0);
		let new_risk = match risk.checked_add(amount) {
			Some(r) if r <= max_risk => r,
			_ => {
				slog!(ZeroConfRejected, swap_id: swap.id.clone(), symbol: symbol.clone(), txid,
					amount, risk, max_risk,
				);
				return Ok(false);
			},
		};

		self.lockups.add_pending_lockup(&PendingLockup {
			swap_id: swap.id.clone(),
			symbol: symbol.clone(),
			txid: txid.clone(),
			amount,
		}).await.context("failed to persist pending lockup")?;
		self.risks.lock().insert(symbol.clone(), new_risk);

		slog!(ZeroConfAccepted, swap_id: swap.id.clone(), symbol: symbol.clone(), txid,
			amount, risk: new_risk, max_risk,
		);
		Ok(true)
	}

	async fn lockup_state(&self, backend: &ChainBackend, lockup: &PendingLockup) -> anyhow::Result<LockupState> {
		match backend {
			ChainBackend::Utxo(chain) => {
				let txid = lockup.txid.parse::<Txid>()
					.with_context(|| format!("invalid lockup txid {}", lockup.txid))?;
				Ok(match chain.get_raw_transaction_verbose(txid).await? {
					Some(info) if info.confirmations() > 0 => LockupState::Confirmed,
					Some(_) => LockupState::Pending,
					None => LockupState::Missing,
				})
			},
			ChainBackend::Account(provider) => {
				match provider.get_transaction_receipt(&lockup.txid).await? {
					Some(receipt) if receipt.effective_confirmations() > 0 => Ok(LockupState::Confirmed),
					Some(_) => Ok(LockupState::Pending),
					None if provider.transaction_exists(&lockup.txid).await? => Ok(LockupState::Pending),
					None => Ok(LockupState::Missing),
				}
			},
		}
	}

	/// Reconcile the pending lockups of a chain after a new block.
	pub async fn on_block(&self, symbol: &str) -> anyhow::Result<()> {
		if !self.max_risks.contains_key(symbol) {
			return Ok(());
		}
		let currency = self.currencies.get(symbol)
			.ok_or_else(|| SwapError::SymbolNotTracked(symbol.to_owned()))?;

		let _guard = self.locks.lock(symbol.to_owned()).await;

		let pending = self.lockups.get_pending_lockups(symbol).await
			.with_context(|| format!("failed to load pending lockups of {}", symbol))?;
		for lockup in pending {
			match self.lockup_state(&currency.backend, &lockup).await {
				Ok(LockupState::Pending) => {},
				Ok(LockupState::Confirmed) => {
					self.lockups.remove_pending_lockup(&lockup.swap_id).await
						.context("failed to remove pending lockup")?;
					// floored: duplicate confirmations would go unnoticed
					let risk = {
						let mut risks = self.risks.lock();
						let risk = risks.entry(symbol.to_owned()).or_insert(0);
						*risk = risk.saturating_sub(lockup.amount);
						*risk
					};
					slog!(PendingLockupConfirmed, swap_id: lockup.swap_id, symbol: symbol.to_owned(),
						txid: lockup.txid, amount: lockup.amount, risk,
					);
				},
				Ok(LockupState::Missing) => {
					slog!(PendingLockupMissing, swap_id: lockup.swap_id, symbol: symbol.to_owned(),
						txid: lockup.txid,
					);
					self.disable(symbol);
				},
				Err(e) => {
					slog!(PendingLockupCheckError, swap_id: lockup.swap_id, symbol: symbol.to_owned(),
						txid: lockup.txid, error: format!("{:#}", e),
					);
				},
			}
		}
		Ok(())
	}

	/// Stop accepting zero-conf on the chain. Only the first call has effect.
	fn disable(&self, symbol: &str) {
		let flag = match self.accepted.get(symbol) {
			Some(f) => f,
			None => return,
		};
		if flag.compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst).is_err() {
			return;
		}

		self.rates.set_zero_conf_amount(symbol, 0);
		slog!(ZeroConfDisabled, symbol: symbol.to_owned());
		let _ = self.events.send(ZeroConfEvent::Disabled { symbol: symbol.to_owned() });
	}

	/// Reconcile the chain on every new block until shutdown.
	pub async fn run_reconciliation(self: Arc<Self>, rtmgr: RuntimeManager, symbol: String) {
		let name = format!("RiskLedger-{}", symbol);
		let _worker = rtmgr.spawn_critical(&name);

		let mut blocks = match self.currencies.get(&symbol) {
			Some(c) => c.subscribe_blocks(),
			None => {
				error!("No currency {} to reconcile zero-conf risk of", symbol);
				return;
			},
		};

		loop {
			tokio::select! {
				block = blocks.recv() => match block {
					Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {},
					Err(broadcast::error::RecvError::Closed) => break,
				},
				_ = rtmgr.shutdown_signal() => {
					info!("Shutdown signal received. Exiting {} loop...", name);
					break;
				}
			}

			if let Err(e) = self.on_block(&symbol).await {
				error!("Error reconciling zero-conf risk of {}: {:#}", symbol, e);
			}
		}

		info!("{} loop terminated gracefully.", name);
	}
}


#[cfg(test)]
mod test {
	use super::*;

	use bitcoin::consensus::encode::serialize_hex;

	use bitcoin_ext::rpc::RawTransactionInfo;

	use crate::chain::{Currency, TransactionReceipt};
	use crate::test_util::{self, MemoryDb, MockAccount, MockChain, RecordingRates};

	struct Setup {
		ledger: RiskLedger,
		chain: Arc<MockChain>,
		db: Arc<MemoryDb>,
		rates: Arc<RecordingRates>,
	}

	fn setup(max_risk: RiskAmount) -> Setup {
		let chain = Arc::new(MockChain::new("BTC"));
		let db = Arc::new(MemoryDb::default());
		let rates = Arc::new(RecordingRates::default());
		let currencies = Currencies::new([
			Currency::utxo(chain.clone(), Arc::new(test_util::MockWallet::new("BTC"))),
		]);
		let ledger = RiskLedger::new(currencies, db.clone(), rates.clone(),
			[("BTC".to_owned(), max_risk), ("DOGE".to_owned(), 5)],
		);
		Setup { ledger, chain, db, rates }
	}

	fn lockup(tag: u8) -> (Txid, String) {
		let tx = test_util::dummy_tx(tag);
		(tx.compute_txid(), serialize_hex(&tx))
	}

	fn info(txid: Txid, confirmations: Option<u32>) -> RawTransactionInfo {
		RawTransactionInfo { txid, hex: Vec::new(), blockhash: None, confirmations }
	}

	#[tokio::test]
	async fn risk_ceiling() {
		let s = setup(100_000);
		let swap1 = test_util::submarine_swap("swap1", "BTC", 60_000);
		let swap2 = test_util::submarine_swap("swap2", "BTC", 50_000);
		let swap3 = test_util::submarine_swap("swap3", "BTC", 40_000);

		assert!(s.ledger.is_acceptable(&swap1, &lockup(1).1).await.unwrap());
		assert_eq!(s.ledger.risks()["BTC"], 60_000);

		assert!(!s.ledger.is_acceptable(&swap2, &lockup(2).1).await.unwrap());
		assert_eq!(s.ledger.risks()["BTC"], 60_000);
		assert_eq!(s.db.pending_lockups("BTC").len(), 1);

		// exactly at the ceiling is fine
		assert!(s.ledger.is_acceptable(&swap3, &lockup(3).1).await.unwrap());
		assert_eq!(s.ledger.risks()["BTC"], 100_000);
	}

	#[tokio::test]
	async fn repeated_admission_counts_once() {
		let s = setup(100_000);
		let (txid, raw) = lockup(1);
		let swap = test_util::submarine_swap("s1", "BTC", 30_000);

		assert!(s.ledger.is_acceptable(&swap, &raw).await.unwrap());
		assert!(s.ledger.is_acceptable(&swap, &raw).await.unwrap());
		assert_eq!(s.ledger.risks()["BTC"], 30_000);
		assert_eq!(s.db.pending_lockups("BTC").len(), 1);

		s.chain.set_tx_info(info(txid, Some(1)));
		s.ledger.on_block("BTC").await.unwrap();
		assert_eq!(s.ledger.risks()["BTC"], 0);
		assert!(s.db.pending_lockups("BTC").is_empty());
	}

	#[tokio::test]
	async fn disabled_while_waiting_for_lock() {
		let s = setup(100_000);
		let ledger = Arc::new(s.ledger);
		let guard = ledger.locks.lock("BTC".to_owned()).await;

		let task = tokio::spawn({
			let ledger = ledger.clone();
			async move {
				let swap = test_util::submarine_swap("s1", "BTC", 10_000);
				ledger.is_acceptable(&swap, &lockup(1).1).await
			}
		});
		// let the admission run up to the lock
		for _ in 0..10 {
			tokio::task::yield_now().await;
		}
		ledger.disable("BTC");
		drop(guard);

		let err = task.await.unwrap().unwrap_err();
		assert_eq!(err.downcast_ref::<SwapError>(), Some(&SwapError::ZeroConfDisabled("BTC".into())));
		assert_eq!(ledger.risks()["BTC"], 0);
		assert!(s.db.pending_lockups("BTC").is_empty());
	}

	#[tokio::test]
	async fn admission_errors() {
		let s = setup(100_000);

		let reverse = test_util::reverse_swap("rev", "BTC", 1_000);
		let err = s.ledger.is_acceptable(&reverse, &lockup(1).1).await.unwrap_err();
		assert!(err.downcast_ref::<crate::error::BadArgument>().is_some(), "{}", err);

		let swap = test_util::submarine_swap("swap", "L-BTC", 1_000);
		let err = s.ledger.is_acceptable(&swap, &lockup(1).1).await.unwrap_err();
		assert_eq!(err.downcast_ref::<SwapError>(), Some(&SwapError::SymbolNotTracked("L-BTC".into())));

		// configured but no currency
		assert!(!s.ledger.zero_conf_accepted("DOGE"));
		assert!(!s.ledger.max_risks().contains_key("DOGE"));

		let swap = test_util::submarine_swap("swap", "BTC", 1_000);
		let err = s.ledger.is_acceptable(&swap, "not a tx").await.unwrap_err();
		assert!(err.downcast_ref::<crate::error::BadArgument>().is_some(), "{}", err);
		assert_eq!(s.ledger.risks()["BTC"], 0);
	}

	#[tokio::test]
	async fn init_restores_risk() {
		let s = setup(100_000);
		for (i, amount) in [10_000, 25_000].into_iter().enumerate() {
			s.db.add_pending_lockup(&PendingLockup {
				swap_id: format!("swap{}", i),
				symbol: "BTC".into(),
				txid: lockup(i as u8).0.to_string(),
				amount,
			}).await.unwrap();
		}

		s.ledger.init().await.unwrap();
		assert_eq!(s.ledger.risks()["BTC"], 35_000);

		let swap = test_util::submarine_swap("swap9", "BTC", 70_000);
		assert!(!s.ledger.is_acceptable(&swap, &lockup(9).1).await.unwrap());
	}

	#[tokio::test]
	async fn confirmation_releases_risk() {
		let s = setup(100_000);
		let (txid1, raw1) = lockup(1);
		let (txid2, raw2) = lockup(2);
		assert!(s.ledger.is_acceptable(&test_util::submarine_swap("s1", "BTC", 30_000), &raw1).await.unwrap());
		assert!(s.ledger.is_acceptable(&test_util::submarine_swap("s2", "BTC", 20_000), &raw2).await.unwrap());

		s.chain.set_tx_info(info(txid1, Some(1)));
		s.chain.set_tx_info(info(txid2, None));
		s.ledger.on_block("BTC").await.unwrap();

		assert_eq!(s.ledger.risks()["BTC"], 20_000);
		let pending = s.db.pending_lockups("BTC");
		assert_eq!(pending.len(), 1);
		assert_eq!(pending[0].swap_id, "s2");
		assert!(s.ledger.zero_conf_accepted("BTC"));
	}

	#[tokio::test]
	async fn untraceable_lockup_disables_zero_conf() {
		let s = setup(100_000);
		let mut events = s.ledger.subscribe();

		let (txid1, raw1) = lockup(1);
		let (_, raw2) = lockup(2);
		assert!(s.ledger.is_acceptable(&test_util::submarine_swap("s1", "BTC", 10_000), &raw1).await.unwrap());
		assert!(s.ledger.is_acceptable(&test_util::submarine_swap("s2", "BTC", 10_000), &raw2).await.unwrap());
		s.chain.set_tx_info(info(txid1, Some(0)));

		// both blocks see the second lockup missing
		s.ledger.on_block("BTC").await.unwrap();
		s.ledger.on_block("BTC").await.unwrap();

		assert!(!s.ledger.zero_conf_accepted("BTC"));
		assert_eq!(events.try_recv().unwrap(), ZeroConfEvent::Disabled { symbol: "BTC".into() });
		assert!(events.try_recv().is_err());
		assert_eq!(s.rates.calls(), vec![("BTC".to_owned(), 0)]);

		let swap = test_util::submarine_swap("s3", "BTC", 1);
		let err = s.ledger.is_acceptable(&swap, &lockup(3).1).await.unwrap_err();
		assert_eq!(err.downcast_ref::<SwapError>(), Some(&SwapError::ZeroConfDisabled("BTC".into())));

		// it stays disabled once the lockup shows up again
		s.chain.set_tx_info(info(test_util::dummy_tx(2).compute_txid(), Some(3)));
		s.ledger.on_block("BTC").await.unwrap();
		assert!(!s.ledger.zero_conf_accepted("BTC"));
	}

	#[tokio::test]
	async fn rpc_errors_dont_disable() {
		let s = setup(100_000);
		let (_, raw) = lockup(1);
		assert!(s.ledger.is_acceptable(&test_util::submarine_swap("s1", "BTC", 10_000), &raw).await.unwrap());

		s.chain.set_failing(true);
		s.ledger.on_block("BTC").await.unwrap();
		assert!(s.ledger.zero_conf_accepted("BTC"));
		assert_eq!(s.ledger.risks()["BTC"], 10_000);
	}

	#[tokio::test]
	async fn account_chain() {
		let provider = Arc::new(MockAccount::new("RBTC"));
		let db = Arc::new(MemoryDb::default());
		let rates = Arc::new(RecordingRates::default());
		let ledger = RiskLedger::new(
			Currencies::new([Currency::account(provider.clone())]),
			db.clone(), rates.clone(), [("RBTC".to_owned(), 1_000)],
		);

		let swap = test_util::submarine_swap("s1", "RBTC", 600);
		assert!(ledger.is_acceptable(&swap, "0xaa").await.unwrap());
		let swap = test_util::submarine_swap("s2", "RBTC", 300);
		assert!(ledger.is_acceptable(&swap, "0xbb").await.unwrap());

		// pending in the mempool, and a failed one
		provider.set_exists("0xaa");
		provider.set_receipt("0xbb", TransactionReceipt { success: false, confirmations: 4 });
		ledger.on_block("RBTC").await.unwrap();
		assert_eq!(ledger.risks()["RBTC"], 900);
		assert!(ledger.zero_conf_accepted("RBTC"));

		provider.set_receipt("0xaa", TransactionReceipt { success: true, confirmations: 1 });
		ledger.on_block("RBTC").await.unwrap();
		assert_eq!(ledger.risks()["RBTC"], 300);

		provider.remove("0xbb");
		ledger.on_block("RBTC").await.unwrap();
		assert!(!ledger.zero_conf_accepted("RBTC"));
		assert_eq!(rates.calls(), vec![("RBTC".to_owned(), 0)]);
	}
}
