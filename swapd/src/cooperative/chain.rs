
use std::ops::Deref;
use std::sync::Arc;

use bitcoin::Transaction;

use swap::{PartialSignature, Preimage, Swap, SwapStatus, SwapType, TheirSigningData};
use swap::musig::MusigPubNonce;

use crate::chain::Currencies;
use crate::database::SwapRepository;
use crate::error::SwapError;
use crate::settle::SettlementAttempt;
use super::{CoopSignerBase, RefundRejectionReason, SignerLocks, REFUND_LOCK};


/// Chain swaps we can claim: the user's lockup is in, and so is ours.
const CLAIMABLE_STATUSES: [SwapStatus; 2] = [
	SwapStatus::TransactionServerMempool,
	SwapStatus::TransactionServerConfirmed,
];

/// Cooperative signing for chain swaps.
///
/// We claim the receiving leg, the user claims the sending leg.
pub struct ChainSwapSigner {
	base: CoopSignerBase,
	disable_refunds: bool,
}

impl ChainSwapSigner {
	pub fn new(
		currencies: Currencies,
		swaps: Arc<dyn SwapRepository>,
		settle: Arc<dyn SettlementAttempt>,
		locks: SignerLocks,
		disable_refunds: bool,
	) -> ChainSwapSigner {
		ChainSwapSigner {
			base: CoopSignerBase::new("chain", currencies, swaps, settle, locks),
			disable_refunds,
		}
	}

	pub async fn init(&self) -> anyhow::Result<usize> {
		self.base.init(SwapType::Chain, &CLAIMABLE_STATUSES).await
	}

	/// Finish our claim and co-sign the user's claim of the sending leg.
	pub async fn sign_claim(
		&self,
		swap: &Swap,
		to_sign: &TheirSigningData,
		preimage: Option<Preimage>,
		their_signature: Option<&PartialSignature>,
	) -> anyhow::Result<PartialSignature> {
		let sig = self.base.sign_claim(swap, preimage, their_signature, Some(to_sign)).await?;
		sig.ok_or_else(|| anyhow!("no partial signature for chain swap {}", swap.id))
	}

	/// Co-sign the user's refund of their lockup.
	pub async fn sign_refund(
		&self,
		swap_id: &str,
		their_nonce: MusigPubNonce,
		transaction: Transaction,
		index: usize,
	) -> anyhow::Result<PartialSignature> {
		let _guard = self.base.lock(REFUND_LOCK).await;

		let swap = self.base.swaps.get_swap(swap_id).await?
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_owned()))?;
		let leg = match swap.receiving_leg() {
			Some(l) if swap.kind() == SwapType::Chain => l,
			_ => return Err(SwapError::SwapNotFound(swap_id.to_owned()).into()),
		};
		self.base.currencies.utxo(&leg.symbol)?;

		if self.disable_refunds {
			return Err(self.base.reject_refund(&swap, "cooperative refunds are disabled"));
		}
		if !swap.is_failed() {
			return Err(self.base.reject_refund(&swap, RefundRejectionReason::StatusNotEligible.as_str()));
		}

		let request = TheirSigningData { pub_nonce: their_nonce, transaction, index };
		self.base.create_partial_signature(&swap, leg, &request, "refund").await
	}
}

impl Deref for ChainSwapSigner {
	type Target = CoopSignerBase;
	fn deref(&self) -> &Self::Target {
		&self.base
	}
}
