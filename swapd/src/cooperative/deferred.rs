//! Claims deferred to batch sweeps per chain.
//!
//! A deferred swap can still be claimed cooperatively until its chain is
//! swept. Sweeps and the cooperative broadcasts of deferred swaps hold the
//! batch claim lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use swap::{CooperativeDetails, PartialSignature, Preimage, Swap, SwapStatus, SwapType, SwapVersion};

use crate::chain::{Currencies, Currency};
use crate::config;
use crate::database::SwapRepository;
use crate::error::SwapError;
use crate::settle::{BatchClaimed, DeferredClaim, SettlementAttempt};
use crate::system::RuntimeManager;
use super::{CoopEvent, CoopSignerBase, SignerLocks, BATCH_CLAIM_LOCK};
use super::triggers::{AmountTrigger, ExpiryTrigger, SweepTrigger};


/// Most swaps claimed in a single transaction.
const MAX_BATCH_CLAIM_CHUNK: usize = 100;

/// Swaps whose preimage we have and whose claim waits for a sweep.
const DEFERRED_STATUSES: [SwapStatus; 1] = [SwapStatus::TransactionClaimPending];

/// What the counterparty needs to co-sign the claim of a deferred swap.
#[derive(Debug, Clone)]
pub struct DeferredDetails {
	pub details: CooperativeDetails,
	pub preimage: Preimage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSweep {
	pub id: String,
	pub kind: SwapType,
	pub amount: u64,
}

/// Collects the claims of submarine and chain swaps and sweeps them in
/// batches.
pub struct DeferredClaimer {
	base: CoopSignerBase,
	batch_claim_interval: Duration,
	triggers: Vec<Box<dyn SweepTrigger>>,
	/// Pending claims by symbol and swap id, one entry per deferred chain.
	pending: parking_lot::Mutex<HashMap<String, BTreeMap<String, DeferredClaim>>>,
}

impl DeferredClaimer {
	pub fn new(
		currencies: Currencies,
		swaps: Arc<dyn SwapRepository>,
		settle: Arc<dyn SettlementAttempt>,
		locks: SignerLocks,
		cfg: &config::DeferredClaims,
		block_times: HashMap<String, Duration>,
	) -> DeferredClaimer {
		let triggers: Vec<Box<dyn SweepTrigger>> = vec![
			Box::new(ExpiryTrigger::new(currencies.clone(), cfg.expiry_tolerance, block_times)),
			Box::new(AmountTrigger::new(cfg.sweep_amount_trigger.clone())),
		];
		DeferredClaimer {
			base: CoopSignerBase::new("deferred", currencies, swaps, settle, locks),
			batch_claim_interval: cfg.batch_claim_interval,
			triggers,
			pending: parking_lot::Mutex::new(
				cfg.symbols.iter().map(|s| (s.clone(), BTreeMap::new())).collect(),
			),
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<CoopEvent> {
		self.base.subscribe()
	}

	/// The chain of the swap's claim, if it is deferred.
	fn deferred_symbol<'a>(&self, swap: &'a Swap) -> Option<&'a str> {
		if swap.version != SwapVersion::Taproot {
			return None;
		}
		let leg = swap.claim_leg()?;
		if !self.pending.lock().contains_key(&leg.symbol) || self.base.currencies.utxo(&leg.symbol).is_err() {
			return None;
		}
		Some(&leg.symbol)
	}

	pub fn should_be_deferred(&self, swap: &Swap) -> bool {
		self.deferred_symbol(swap).is_some()
	}

	/// Add the claim to the pending claims of its chain.
	///
	/// Returns the number and the total amount of pending claims of the chain.
	fn insert(&self, symbol: &str, claim: DeferredClaim) -> (usize, u64) {
		let mut pending = self.pending.lock();
		let claims = pending.entry(symbol.to_owned()).or_default();
		claims.insert(claim.swap.id.clone(), claim);
		(claims.len(), claims.values().map(claim_amount).sum())
	}

	fn reinsert(&self, symbol: &str, claims: &[DeferredClaim]) {
		let mut pending = self.pending.lock();
		let entry = pending.entry(symbol.to_owned()).or_default();
		for claim in claims {
			entry.insert(claim.swap.id.clone(), claim.clone());
		}
	}

	fn pending_claim(&self, swap: &Swap) -> Option<DeferredClaim> {
		let symbol = &swap.claim_leg()?.symbol;
		self.pending.lock().get(symbol)?.get(&swap.id).cloned()
	}

	/// Defer the claim of a swap we have the preimage of.
	///
	/// Returns false if claims of the swap are not deferred. The chain is
	/// swept right away when a sweep trigger fires.
	pub async fn defer_claim(&self, swap: &Swap, preimage: Preimage) -> anyhow::Result<bool> {
		let symbol = match self.deferred_symbol(swap) {
			Some(s) => s.to_owned(),
			None => return Ok(false),
		};
		if !swap.is_valid_preimage(&preimage) {
			return Err(SwapError::IncorrectPreimage.into());
		}

		self.base.swaps.set_preimage(&swap.id, preimage).await.context("failed to store preimage")?;
		self.base.swaps.set_status(&swap.id, SwapStatus::TransactionClaimPending, None).await
			.with_context(|| format!("failed to update status of swap {}", swap.id))?;

		let mut swap = swap.clone();
		swap.status = SwapStatus::TransactionClaimPending;
		swap.preimage.get_or_insert(preimage);
		self.base.register_for_claim(&swap);
		let (nb_pending, pending_value) = self.insert(&symbol, DeferredClaim { swap: swap.clone(), preimage });
		slog!(ClaimDeferred, swap_id: swap.id.clone(), symbol: symbol.clone(), nb_pending);

		if self.check_triggers(&symbol, &swap, pending_value).await {
			if let Err(e) = self.sweep_symbol(&symbol).await {
				warn!("Triggered sweep of {} failed: {:#}", symbol, e);
			}
		}
		Ok(true)
	}

	async fn check_triggers(&self, symbol: &str, swap: &Swap, pending_value: u64) -> bool {
		for trigger in &self.triggers {
			match trigger.check(symbol, swap, pending_value).await {
				Ok(true) => {
					slog!(SweepTriggered, swap_id: swap.id.clone(), symbol: symbol.to_owned(),
						trigger: trigger.name().to_owned(),
					);
					return true;
				},
				Ok(false) => {},
				Err(e) => warn!("Checking {} sweep trigger for swap {} failed: {:#}",
					trigger.name(), swap.id, e,
				),
			}
		}
		false
	}

	/// Restore the deferred claims from the database and sweep them.
	///
	/// Failed sweeps are logged and their swaps stay pending.
	pub async fn init(&self) -> anyhow::Result<usize> {
		let mut nb_swaps = 0;
		for kind in [SwapType::Submarine, SwapType::Chain] {
			let swaps = self.base.swaps.get_swaps_by_status(kind, &DEFERRED_STATUSES).await
				.with_context(|| format!("failed to load deferred {} swaps", kind))?;
			for swap in swaps {
				let symbol = match self.deferred_symbol(&swap) {
					Some(s) => s.to_owned(),
					None => {
						warn!("Claim of {} swap {} is pending but not deferred", kind, swap.id);
						continue;
					},
				};
				let preimage = match swap.preimage {
					Some(p) => p,
					None => {
						warn!("Deferred {} swap {} has no preimage", kind, swap.id);
						continue;
					},
				};
				self.base.register_for_claim(&swap);
				self.insert(&symbol, DeferredClaim { swap, preimage });
				nb_swaps += 1;
			}
		}
		slog!(ClaimRegistryRestored, signer: self.base.name.to_owned(), nb_swaps);

		self.sweep().await;
		Ok(nb_swaps)
	}

	/// Sweep the pending claims of every chain.
	///
	/// Returns the ids of the claimed swaps by symbol. Chains that failed
	/// are logged and left out.
	pub async fn sweep(&self) -> HashMap<String, Vec<String>> {
		let _guard = self.base.lock(BATCH_CLAIM_LOCK).await;

		let symbols = self.pending.lock().iter()
			.filter(|(_, claims)| !claims.is_empty())
			.map(|(s, _)| s.clone())
			.collect::<Vec<_>>();
		let mut claimed = HashMap::with_capacity(symbols.len());
		for symbol in symbols {
			match self.sweep_symbol_locked(&symbol).await {
				Ok(ids) => {
					claimed.insert(symbol, ids);
				},
				Err(e) => error!("Could not sweep {}: {:#}", symbol, e),
			}
		}
		claimed
	}

	/// Sweep the pending claims of one chain.
	///
	/// Fails only if none of the batches could be claimed.
	pub async fn sweep_symbol(&self, symbol: &str) -> anyhow::Result<Vec<String>> {
		let _guard = self.base.lock(BATCH_CLAIM_LOCK).await;
		self.sweep_symbol_locked(symbol).await
	}

	async fn sweep_symbol_locked(&self, symbol: &str) -> anyhow::Result<Vec<String>> {
		let currency = self.base.currencies.get(symbol)
			.with_context(|| format!("unknown currency {}", symbol))?;
		let claims = match self.pending.lock().get_mut(symbol) {
			Some(claims) => std::mem::take(claims).into_values().collect::<Vec<_>>(),
			None => return Ok(Vec::new()),
		};
		if claims.is_empty() {
			return Ok(Vec::new());
		}
		debug!("Sweeping {} deferred claims of {}", claims.len(), symbol);

		let mut claimed = Vec::with_capacity(claims.len());
		let mut error = None;
		for chunk in claims.chunks(MAX_BATCH_CLAIM_CHUNK) {
			match self.claim_batch(currency, chunk).await {
				Ok(()) => claimed.extend(chunk.iter().map(|c| c.swap.id.clone())),
				Err(e) => {
					slog!(BatchClaimFailed, symbol: symbol.to_owned(), nb_swaps: chunk.len(),
						error: format!("{:#}", e),
					);
					self.reinsert(symbol, chunk);
					error = Some(e);
				},
			}
		}

		match error {
			Some(e) if claimed.is_empty() => Err(e.context(format!("failed to sweep {}", symbol))),
			_ => Ok(claimed),
		}
	}

	async fn claim_batch(&self, currency: &Currency, claims: &[DeferredClaim]) -> anyhow::Result<()> {
		let batch = self.base.settle.claim_batch(currency, claims).await?;
		for claim in claims {
			self.base.remove_from_claimable(&claim.swap.id);
		}

		let BatchClaimed { txid, fee } = match batch {
			Some(b) => b,
			None => {
				slog!(BatchClaimHandedOver, symbol: currency.symbol.clone(), nb_swaps: claims.len());
				return Ok(());
			},
		};
		slog!(BatchClaimBroadcast, symbol: currency.symbol.clone(), txid, fee, nb_swaps: claims.len());

		// chunks are never empty
		let fee_per_swap = fee.div_ceil(claims.len() as u64);
		for claim in claims {
			// the claim is out, a failed write must not bring the swap back
			if let Err(e) = self.base.swaps.set_claimed(&claim.swap.id, fee_per_swap).await {
				error!("Failed to store batch claim of swap {}: {:#}", claim.swap.id, e);
				continue;
			}
			self.base.emit_claimed(&claim.swap, fee_per_swap);
		}
		Ok(())
	}

	/// The details for the counterparty to co-sign our claim of a deferred
	/// swap, with its preimage.
	pub async fn get_cooperative_details(&self, swap: &Swap) -> anyhow::Result<DeferredDetails> {
		let claim = self.pending_claim(swap).ok_or(SwapError::NotEligibleForCooperativeClaim(None))?;
		let details = self.base.get_cooperative_details(&claim.swap).await?;
		Ok(DeferredDetails { details, preimage: claim.preimage })
	}

	/// Broadcast our cooperative claim of a deferred swap with the
	/// counterparty's signature, instead of waiting for the sweep.
	pub async fn broadcast_cooperative(
		&self,
		swap: &Swap,
		their_signature: &PartialSignature,
	) -> anyhow::Result<()> {
		let _guard = self.base.lock(BATCH_CLAIM_LOCK).await;

		let not_eligible = || SwapError::NotEligibleForCooperativeClaim(
			Some("no deferred claim to broadcast".into()),
		);
		let claim = self.pending_claim(swap).ok_or_else(not_eligible)?;
		let leg = claim.swap.claim_leg().ok_or_else(not_eligible)?;
		let entry = self.base.registry.get(&swap.id).ok_or_else(not_eligible)?;

		let mut reg = entry.lock().await;
		self.base.claim_cooperatively(&claim.swap, leg, &mut reg, Some(their_signature)).await?;

		if let Some(claims) = self.pending.lock().get_mut(&leg.symbol) {
			claims.remove(&swap.id);
		}
		Ok(())
	}

	/// The ids of the pending claims of every deferred chain.
	pub fn pending_sweeps(&self) -> HashMap<String, Vec<String>> {
		self.pending.lock().iter()
			.map(|(symbol, claims)| (symbol.clone(), claims.keys().cloned().collect()))
			.collect()
	}

	pub fn pending_sweeps_values(&self) -> HashMap<String, Vec<PendingSweep>> {
		self.pending.lock().iter()
			.map(|(symbol, claims)| {
				let values = claims.values().map(|c| PendingSweep {
					id: c.swap.id.clone(),
					kind: c.swap.kind(),
					amount: claim_amount(c),
				}).collect();
				(symbol.clone(), values)
			})
			.collect()
	}

	/// Sweep every chain at the batch claim interval.
	pub async fn run(self: Arc<Self>, rtmgr: RuntimeManager) {
		let name = "DeferredClaimer";
		let _worker = rtmgr.spawn_critical(name);

		let mut interval = tokio::time::interval(self.batch_claim_interval);
		interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
		// init swept already
		interval.reset();

		loop {
			tokio::select! {
				_ = interval.tick() => {},
				_ = rtmgr.shutdown_signal() => {
					info!("Shutdown signal received. Exiting {} loop...", name);
					break;
				}
			}

			let claimed = self.sweep().await;
			trace!("Scheduled sweep claimed {} swaps", claimed.values().map(|ids| ids.len()).sum::<usize>());
		}

		info!("{} loop terminated gracefully.", name);
	}
}

fn claim_amount(claim: &DeferredClaim) -> u64 {
	claim.swap.claim_leg().map_or(0, |l| l.amount)
}
