
//! Cooperative claims and refunds with two-party aggregated signatures.
//!
//! Broadcasting our cooperative claims is serialized over all signers with
//! a single lock. Co-signing refunds has a lock of its own, and so do the
//! batch sweeps of deferred claims.

pub mod chain;
pub mod deferred;
pub mod musig;
pub mod registry;
pub mod triggers;

pub use self::chain::ChainSwapSigner;
pub use self::deferred::DeferredClaimer;
pub use self::musig::{MusigSigner, RefundEligibility, RefundRejectionReason, StatusEligibility};

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, OwnedMutexGuard};

use swap::{
	ClaimSession, CooperativeDetails, PartialSignature, Preimage, Swap, SwapLeg, SwapStatus,
	SwapType, TheirSigningData,
};
use swap::coop::{self, CoopError};

use crate::chain::Currencies;
use crate::database::SwapRepository;
use crate::error::{ContextExt, SwapError};
use crate::mutex::KeyedMutex;
use crate::settle::SettlementAttempt;
use self::registry::{ClaimRegistration, ClaimRegistry, CooperativeClaim};


const COOP_BROADCAST_LOCK: &str = "coop-broadcast";
const REFUND_LOCK: &str = "refund";
const REVERSE_CLAIM_LOCK: &str = "reverse-claim";
const BATCH_CLAIM_LOCK: &str = "batch-claim";

const EVENT_BUFFER: usize = 64;

/// Process-wide named locks shared by the signers.
pub type SignerLocks = Arc<KeyedMutex<&'static str>>;

#[derive(Debug, Clone)]
pub enum CoopEvent {
	/// We broadcast our cooperative claim of the swap.
	Claim {
		swap: Swap,
	},
}

pub struct CoopSignerBase {
	name: &'static str,
	currencies: Currencies,
	swaps: Arc<dyn SwapRepository>,
	settle: Arc<dyn SettlementAttempt>,
	registry: ClaimRegistry,
	locks: SignerLocks,
	events: broadcast::Sender<CoopEvent>,
}

impl CoopSignerBase {
	pub fn new(
		name: &'static str,
		currencies: Currencies,
		swaps: Arc<dyn SwapRepository>,
		settle: Arc<dyn SettlementAttempt>,
		locks: SignerLocks,
	) -> CoopSignerBase {
		CoopSignerBase {
			name, currencies, swaps, settle, locks,
			registry: ClaimRegistry::new(),
			events: broadcast::channel(EVENT_BUFFER).0,
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<CoopEvent> {
		self.events.subscribe()
	}

	async fn lock(&self, name: &'static str) -> OwnedMutexGuard<()> {
		self.locks.lock(name).await
	}

	pub fn is_registered(&self, id: &str) -> bool {
		self.registry.contains(id)
	}

	/// Register the swap for a cooperative claim of the leg we claim.
	///
	/// Only legs on UTXO chains can be claimed cooperatively, others are
	/// skipped. Returns whether the swap is registered.
	pub fn register_for_claim(&self, swap: &Swap) -> bool {
		let leg = match swap.claim_leg() {
			Some(l) => l,
			None => return false,
		};
		if self.currencies.utxo(&leg.symbol).is_err() {
			trace!("Not registering {} swap {} for cooperative claim: {} is not UTXO based",
				swap.kind(), swap.id, leg.symbol,
			);
			return false;
		}

		if self.registry.register(&swap.id, swap.kind()) {
			slog!(SwapRegisteredForClaim, swap_id: swap.id.clone(), swap_type: swap.kind().to_string());
		}
		true
	}

	pub fn remove_from_claimable(&self, id: &str) {
		if self.registry.remove(id) {
			slog!(SwapRemovedFromClaimable, swap_id: id.to_owned());
		}
	}

	/// Register the persisted swaps of the given kind in a claimable status.
	pub async fn init(&self, kind: SwapType, statuses: &[SwapStatus]) -> anyhow::Result<usize> {
		let swaps = self.swaps.get_swaps_by_status(kind, statuses).await
			.with_context(|| format!("failed to load claimable {} swaps", kind))?;
		let nb_swaps = swaps.iter().filter(|s| self.register_for_claim(s)).count();
		slog!(ClaimRegistryRestored, signer: self.name.to_owned(), nb_swaps);
		Ok(nb_swaps)
	}

	/// The details the counterparty needs to co-sign our claim.
	///
	/// The claim is built on the first request and reused afterwards, so
	/// repeated requests return the same nonce.
	pub async fn get_cooperative_details(&self, swap: &Swap) -> anyhow::Result<CooperativeDetails> {
		let entry = self.registry.get(&swap.id)
			.ok_or(SwapError::NotEligibleForCooperativeClaim(None))?;
		if swap.is_settled() {
			return Err(SwapError::ServerClaimSucceededAlready.into());
		}

		let mut reg = entry.lock().await;
		if let Some(ref coop) = reg.cooperative {
			return Ok(coop.session.details());
		}

		let coop = self.create_claim(swap).await?;
		let details = coop.session.details();
		reg.cooperative = Some(coop);
		Ok(details)
	}

	async fn create_claim(&self, swap: &Swap) -> anyhow::Result<CooperativeClaim> {
		let leg = swap.claim_leg().ok_or(SwapError::NotEligibleForCooperativeClaim(None))?;
		let (chain, wallet) = self.currencies.utxo(&leg.symbol)?;
		let lockup = leg.lockup_outpoint()?;

		let lockup_tx = chain.get_raw_transaction(lockup.txid).await?
			.with_context(|| format!("lockup tx {} of swap {} not found", lockup.txid, swap.id))?;
		let prevout = lockup_tx.output.get(lockup.vout as usize).cloned()
			.with_context(|| format!("lockup tx {} has no output {}", lockup.txid, lockup.vout))?;

		let sweep_address = wallet.get_address(&format!("cooperative claim of swap {}", swap.id)).await
			.context("failed to get sweep address")?;
		let destination = wallet.decode_address(&sweep_address)?;
		let fee_rate = chain.estimate_fee().await?;
		let our_key = wallet.keys_by_index(leg.key_index)?;

		let session = ClaimSession::new(
			our_key, leg.their_public_key()?, leg.swap_tree()?, lockup, prevout, destination, fee_rate,
		).with_context(|| format!("failed to create claim of swap {}", swap.id))?;

		slog!(CooperativeDetailsCreated, swap_id: swap.id.clone(), symbol: leg.symbol.clone(), lockup,
			sweep_address: sweep_address.clone(),
		);
		Ok(CooperativeClaim { session, sweep_address })
	}

	/// Finish our claim of the swap and co-sign the counterparty's transaction.
	///
	/// If the swap isn't settled yet, the preimage has to be correct. On UTXO
	/// chains the cooperative claim has to be prepared, their partial
	/// signature is required and the claim is broadcast. Claims on other
	/// chains are handed to the settlement collaborator with the preimage.
	///
	/// Returns our partial signature for `to_sign`, if given.
	pub async fn sign_claim(
		&self,
		swap: &Swap,
		preimage: Option<Preimage>,
		their_signature: Option<&PartialSignature>,
		to_sign: Option<&TheirSigningData>,
	) -> anyhow::Result<Option<PartialSignature>> {
		let _guard = self.lock(COOP_BROADCAST_LOCK).await;

		if swap.is_refunded() {
			return Err(SwapError::NotEligibleForCooperativeClaim(Some("swap was refunded".into())).into());
		}

		if !swap.is_settled() {
			let leg = swap.claim_leg()
				.ok_or_else(|| SwapError::NotEligibleForCooperativeClaim(Some("nothing to claim".into())))?;
			let currency = self.currencies.get(&leg.symbol)
				.with_context(|| format!("unknown currency {}", leg.symbol))?;

			let preimage = match preimage {
				Some(p) if swap.is_valid_preimage(&p) => p,
				_ => {
					self.not_claiming(swap, "preimage is incorrect");
					return Err(SwapError::IncorrectPreimage.into());
				},
			};
			self.swaps.set_preimage(&swap.id, preimage).await.context("failed to store preimage")?;

			if self.currencies.utxo(&leg.symbol).is_ok() {
				let entry = match self.registry.get(&swap.id) {
					Some(e) => e,
					None => {
						self.not_claiming(swap, "swap is not claimable");
						return Err(SwapError::NotEligibleForCooperativeClaim(None).into());
					},
				};
				let mut reg = entry.lock().await;
				self.claim_cooperatively(swap, leg, &mut reg, their_signature).await?;
			} else {
				self.settle.attempt_settle(currency, swap, None, Some(preimage)).await
					.with_context(|| format!("failed to settle swap {}", swap.id))?;
			}
		}

		match (to_sign, swap.sending_leg()) {
			(Some(request), Some(leg)) => Ok(Some(self.create_partial_signature(swap, leg, request, "claim").await?)),
			(Some(_), None) => badarg!("{} swap {} has no leg for us to co-sign", swap.kind(), swap.id),
			(None, _) => Ok(None),
		}
	}

	/// Broadcast the prepared claim of the registration.
	///
	/// Fails if no claim was prepared, and with their invalid or missing
	/// signature.
	async fn claim_cooperatively(
		&self,
		swap: &Swap,
		leg: &SwapLeg,
		reg: &mut ClaimRegistration,
		their_signature: Option<&PartialSignature>,
	) -> anyhow::Result<u64> {
		let coop = match reg.cooperative.as_mut() {
			Some(c) => c,
			None => {
				self.not_claiming(swap, "no cooperative claim prepared");
				return Err(SwapError::NotEligibleForCooperativeClaim(None).into());
			},
		};
		let their_signature = match their_signature {
			Some(s) => s,
			None => {
				self.not_claiming(swap, "partial signature missing");
				return Err(SwapError::InvalidPartialSignature.into());
			},
		};
		let (chain, _) = self.currencies.utxo(&leg.symbol)?;

		let tx = match coop.session.finalize(their_signature) {
			Ok(tx) => tx,
			Err(CoopError::InvalidPartialSignature) => {
				self.not_claiming(swap, "invalid partial signature");
				return Err(SwapError::InvalidPartialSignature.into());
			},
			Err(e) => return Err(e).context("failed to sign cooperative claim"),
		};
		let fee = coop.session.fee().to_sat();

		let txid = match chain.send_raw_transaction(&tx).await {
			Ok(txid) => txid,
			Err(e) => {
				slog!(CooperativeClaimFailed, swap_id: swap.id.clone(), error: format!("{:#}", e));
				// our nonce is spent, the next details request starts over
				reg.cooperative = None;
				return Err(e.context("failed to broadcast cooperative claim"));
			},
		};
		slog!(CooperativeClaimBroadcast, swap_id: swap.id.clone(), symbol: leg.symbol.clone(), txid, fee);

		self.remove_from_claimable(&swap.id);
		self.swaps.set_claimed(&swap.id, fee).await.context("failed to store claim")?;
		self.emit_claimed(swap, fee);
		Ok(fee)
	}

	fn emit_claimed(&self, swap: &Swap, fee: u64) {
		let mut claimed = swap.clone();
		claimed.status = SwapStatus::TransactionClaimed;
		if let Some(leg) = claimed.claim_leg_mut() {
			leg.fee = Some(fee);
		}
		let _ = self.events.send(CoopEvent::Claim { swap: claimed });
	}

	fn not_claiming(&self, swap: &Swap, reason: &str) {
		slog!(NotCooperativelyClaiming, swap_id: swap.id.clone(), reason: reason.to_owned());
	}

	fn reject_refund(&self, swap: &Swap, reason: &str) -> anyhow::Error {
		slog!(CooperativeRefundRejected, swap_id: swap.id.clone(), reason: reason.to_owned());
		SwapError::NotEligibleForCooperativeRefund(Some(reason.to_owned())).into()
	}

	/// Our partial signature for an input of a counterparty transaction
	/// spending the lockup of `leg`.
	async fn create_partial_signature(
		&self,
		swap: &Swap,
		leg: &SwapLeg,
		request: &TheirSigningData,
		purpose: &str,
	) -> anyhow::Result<PartialSignature> {
		let (chain, wallet) = self.currencies.utxo(&leg.symbol)?;
		let our_key = wallet.keys_by_index(leg.key_index)?;

		let mut prevouts = Vec::with_capacity(request.transaction.input.len());
		for input in &request.transaction.input {
			let prev = input.previous_output;
			let tx = chain.get_raw_transaction(prev.txid).await?
				.with_badarg(|| format!("input {} of transaction to sign not found", prev))?;
			let out = tx.output.get(prev.vout as usize).cloned()
				.with_badarg(|| format!("input {} of transaction to sign not found", prev))?;
			prevouts.push(out);
		}

		let sig = coop::sign_their_input(
			&our_key, leg.their_public_key()?, leg.swap_tree()?, request, &prevouts,
		).badarg("cannot sign transaction")?;
		slog!(PartialSignatureCreated, swap_id: swap.id.clone(), purpose: purpose.to_owned(),
			input_idx: request.index,
		);
		Ok(sig)
	}
}
