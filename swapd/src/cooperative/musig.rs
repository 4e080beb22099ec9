
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::Context;
use bitcoin::Transaction;

use swap::{
	PartialSignature, Preimage, Swap, SwapStatus, SwapType, SwapVersion, TheirSigningData,
};
use swap::musig::MusigPubNonce;

use crate::chain::Currencies;
use crate::database::SwapRepository;
use crate::error::SwapError;
use crate::settle::SettlementAttempt;
use super::{CoopSignerBase, SignerLocks, REFUND_LOCK, REVERSE_CLAIM_LOCK};


/// Submarine swaps we can claim: the invoice is paid.
///
/// Deferred claims are restored by the [super::DeferredClaimer].
const CLAIMABLE_STATUSES: [SwapStatus; 1] = [
	SwapStatus::InvoicePaid,
];

/// Reverse swaps whose claim we co-sign: our lockup is out, or the
/// invoice was settled already.
const REVERSE_CLAIM_STATUSES: [SwapStatus; 3] = [
	SwapStatus::TransactionMempool,
	SwapStatus::TransactionConfirmed,
	SwapStatus::InvoiceSettled,
];

/// Why we won't co-sign the refund of a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundRejectionReason {
	VersionNotTaproot,
	StatusNotEligible,
	LightningPaymentPending,
}

impl RefundRejectionReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			RefundRejectionReason::VersionNotTaproot => "swap version is not Taproot",
			RefundRejectionReason::StatusNotEligible => "status not eligible",
			RefundRejectionReason::LightningPaymentPending =>
				"lightning payment still in progress, try again in a couple minutes",
		}
	}
}

impl fmt::Display for RefundRejectionReason {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Decides whether the refund of a swap may be co-signed.
#[async_trait]
pub trait RefundEligibility: Send + Sync + 'static {
	/// Returns [None] if the swap can be refunded.
	async fn non_eligibility_reason(&self, swap: &Swap) -> anyhow::Result<Option<RefundRejectionReason>>;
}

/// Refund eligibility from the swap alone.
///
/// Knows nothing about lightning payments, so it never reports
/// [RefundRejectionReason::LightningPaymentPending].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusEligibility;

#[async_trait]
impl RefundEligibility for StatusEligibility {
	async fn non_eligibility_reason(&self, swap: &Swap) -> anyhow::Result<Option<RefundRejectionReason>> {
		if swap.version != SwapVersion::Taproot {
			return Ok(Some(RefundRejectionReason::VersionNotTaproot));
		}
		if !swap.is_failed() {
			return Ok(Some(RefundRejectionReason::StatusNotEligible));
		}
		Ok(None)
	}
}

/// Cooperative signing for submarine and reverse swaps.
pub struct MusigSigner {
	base: CoopSignerBase,
	disable_refunds: bool,
	eligibility: Arc<dyn RefundEligibility>,
	/// Swaps whose refund the operator allowed regardless of eligibility.
	allowed_refunds: parking_lot::Mutex<HashSet<String>>,
}

impl MusigSigner {
	pub fn new(
		currencies: Currencies,
		swaps: Arc<dyn SwapRepository>,
		settle: Arc<dyn SettlementAttempt>,
		locks: SignerLocks,
		disable_refunds: bool,
		eligibility: Arc<dyn RefundEligibility>,
	) -> MusigSigner {
		MusigSigner {
			base: CoopSignerBase::new("musig", currencies, swaps, settle, locks),
			disable_refunds,
			eligibility,
			allowed_refunds: parking_lot::Mutex::new(HashSet::new()),
		}
	}

	pub async fn init(&self) -> anyhow::Result<usize> {
		self.base.init(SwapType::Submarine, &CLAIMABLE_STATUSES).await
	}

	/// Finish our claim of a submarine swap.
	pub async fn sign_claim(
		&self,
		swap: &Swap,
		preimage: Option<Preimage>,
		their_signature: Option<&PartialSignature>,
	) -> anyhow::Result<()> {
		self.base.sign_claim(swap, preimage, their_signature, None).await?;
		Ok(())
	}

	async fn get_swap(&self, id: &str, kind: SwapType) -> anyhow::Result<Swap> {
		match self.base.swaps.get_swap(id).await? {
			Some(s) if s.kind() == kind => Ok(s),
			_ => Err(SwapError::SwapNotFound(id.to_owned()).into()),
		}
	}

	/// Allow the cooperative refund of a submarine swap even if it is not
	/// eligible.
	pub async fn allow_refund(&self, id: &str) -> anyhow::Result<()> {
		self.get_swap(id, SwapType::Submarine).await?;
		self.allowed_refunds.lock().insert(id.to_owned());
		slog!(CooperativeRefundAllowed, swap_id: id.to_owned(), overridden_reason: None);
		Ok(())
	}

	/// Co-sign the user's refund of their submarine swap lockup.
	pub async fn sign_refund(
		&self,
		swap_id: &str,
		their_nonce: MusigPubNonce,
		transaction: Transaction,
		index: usize,
	) -> anyhow::Result<PartialSignature> {
		let _guard = self.base.lock(REFUND_LOCK).await;

		let swap = self.get_swap(swap_id, SwapType::Submarine).await?;
		let leg = swap.receiving_leg()
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_owned()))?;
		self.base.currencies.utxo(&leg.symbol)?;

		if self.disable_refunds {
			return Err(self.base.reject_refund(&swap, "cooperative refunds are disabled"));
		}

		let reason = self.eligibility.non_eligibility_reason(&swap).await
			.with_context(|| format!("failed to check refund eligibility of swap {}", swap.id))?;
		if let Some(reason) = reason {
			if !self.allowed_refunds.lock().contains(&swap.id) {
				return Err(self.base.reject_refund(&swap, reason.as_str()));
			}
			slog!(CooperativeRefundAllowed, swap_id: swap.id.clone(),
				overridden_reason: Some(reason.to_string()),
			);
		}

		let request = TheirSigningData { pub_nonce: their_nonce, transaction, index };
		self.base.create_partial_signature(&swap, leg, &request, "refund").await
	}

	/// Take the preimage of a reverse swap and co-sign the user's claim.
	///
	/// The held invoice is settled unless it was already. Returns our
	/// partial signature for `to_sign`, if given.
	pub async fn sign_reverse_swap_claim(
		&self,
		swap_id: &str,
		preimage: Preimage,
		to_sign: Option<&TheirSigningData>,
	) -> anyhow::Result<Option<PartialSignature>> {
		let _guard = self.base.lock(REVERSE_CLAIM_LOCK).await;

		let swap = self.get_swap(swap_id, SwapType::Reverse).await?;
		if swap.version != SwapVersion::Taproot || !REVERSE_CLAIM_STATUSES.contains(&swap.status) {
			debug!("Not co-signing claim of reverse swap {} in status {}", swap.id, swap.status);
			return Err(SwapError::NotEligibleForCooperativeClaim(None).into());
		}
		if !swap.is_valid_preimage(&preimage) {
			debug!("Not co-signing claim of reverse swap {}: preimage is incorrect", swap.id);
			return Err(SwapError::IncorrectPreimage.into());
		}

		let settle_invoice = swap.status != SwapStatus::InvoiceSettled;
		slog!(ReverseClaimPreimageReceived, swap_id: swap.id.clone(), settle_invoice);
		self.base.swaps.set_preimage(&swap.id, preimage).await.context("failed to store preimage")?;
		if settle_invoice {
			self.base.settle.settle_invoice(&swap, preimage).await
				.with_context(|| format!("failed to settle invoice of swap {}", swap.id))?;
		}

		let request = match to_sign {
			Some(r) => r,
			None => return Ok(None),
		};
		let leg = swap.sending_leg()
			.ok_or_else(|| SwapError::SwapNotFound(swap_id.to_owned()))?;
		let sig = self.base.create_partial_signature(&swap, leg, request, "reverse claim").await?;
		Ok(Some(sig))
	}
}

impl Deref for MusigSigner {
	type Target = CoopSignerBase;
	fn deref(&self) -> &Self::Target {
		&self.base
	}
}
