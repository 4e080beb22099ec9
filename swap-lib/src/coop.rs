
//! Two-party signing sessions for cooperative claims and counterparty
//! transactions.

use std::fmt;

use bitcoin::{Amount, FeeRate, OutPoint, ScriptBuf, TapSighash, Transaction, TxOut};
use bitcoin::secp256k1::{Keypair, PublicKey};

use crate::claim::{self, ClaimError};
use crate::musig::{self, MusigError, MusigPartialSignature, MusigPubNonce, MusigSecNonce, TaprootKeyAgg};
use crate::tree::{SwapTree, TreeError};


#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoopError {
	#[error("invalid partial signature")]
	InvalidPartialSignature,
	#[error("session nonce was already used")]
	SessionUsed,
	#[error("swap tree error: {0}")]
	Tree(#[from] TreeError),
	#[error("claim tx error: {0}")]
	Claim(#[from] ClaimError),
	#[error("musig error: {0}")]
	Musig(#[from] MusigError),
}

/// A nonce and partial signature from one of the parties.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PartialSignature {
	#[serde(rename = "pubNonce", with = "musig::serde::pubnonce")]
	pub pub_nonce: MusigPubNonce,
	#[serde(rename = "partialSignature", with = "musig::serde::partialsig")]
	pub signature: MusigPartialSignature,
}

/// The counterparty's request to co-sign one of their transaction inputs.
#[derive(Debug, Clone)]
pub struct TheirSigningData {
	pub pub_nonce: MusigPubNonce,
	pub transaction: Transaction,
	pub index: usize,
}

/// Details handed to the counterparty so they can co-sign our claim.
#[derive(Debug, Clone, Copy)]
pub struct CooperativeDetails {
	pub public_key: PublicKey,
	pub pub_nonce: MusigPubNonce,
	pub sighash: TapSighash,
}

fn key_agg(
	our_key: &Keypair,
	their_pubkey: PublicKey,
	tree: &SwapTree,
) -> Result<TaprootKeyAgg, CoopError> {
	Ok(musig::taproot_key_agg([our_key.public_key(), their_pubkey], tree.merkle_root()?)?)
}

/// The state of a cooperative claim of one swap output.
///
/// Holds the unsigned claim and our secret nonce. The nonce can only be
/// used once, so a session can produce at most one signed claim.
pub struct ClaimSession {
	our_key: Keypair,
	their_pubkey: PublicKey,
	agg: TaprootKeyAgg,
	sec_nonce: Option<MusigSecNonce>,
	pub_nonce: MusigPubNonce,
	tx: Transaction,
	prevout: TxOut,
	sighash: TapSighash,
}

impl ClaimSession {
	pub fn new(
		our_key: Keypair,
		their_pubkey: PublicKey,
		tree: &SwapTree,
		lockup: OutPoint,
		prevout: TxOut,
		destination: ScriptBuf,
		fee_rate: FeeRate,
	) -> Result<ClaimSession, CoopError> {
		let agg = key_agg(&our_key, their_pubkey, tree)?;
		let tx = claim::build_claim_tx(lockup, &prevout, destination, fee_rate)?;
		let sighash = claim::key_spend_sighash(&tx, 0, &[prevout.clone()])?;
		let (sec_nonce, pub_nonce) = musig::nonce_pair(&our_key, &agg.cache, sighash);
		Ok(ClaimSession {
			our_key, their_pubkey, agg, pub_nonce, tx, prevout, sighash,
			sec_nonce: Some(sec_nonce),
		})
	}

	pub fn details(&self) -> CooperativeDetails {
		CooperativeDetails {
			public_key: self.our_key.public_key(),
			pub_nonce: self.pub_nonce,
			sighash: self.sighash,
		}
	}

	pub fn unsigned_tx(&self) -> &Transaction {
		&self.tx
	}

	/// The taproot output key the claimed output must pay to.
	pub fn output_key(&self) -> bitcoin::secp256k1::XOnlyPublicKey {
		self.agg.output_key
	}

	pub fn fee(&self) -> Amount {
		claim::tx_fee(&self.tx, &[self.prevout.clone()])
	}

	pub fn is_used(&self) -> bool {
		self.sec_nonce.is_none()
	}

	pub fn verify_partial(&self, theirs: &PartialSignature) -> bool {
		musig::verify_partial_sig(
			&self.agg.cache,
			self.sighash,
			(self.their_pubkey, theirs.pub_nonce),
			self.pub_nonce,
			theirs.signature,
		)
	}

	/// Verify their partial signature and produce the signed claim.
	///
	/// Our secret nonce is only consumed after their signature verified.
	pub fn finalize(&mut self, theirs: &PartialSignature) -> Result<Transaction, CoopError> {
		if self.sec_nonce.is_none() {
			return Err(CoopError::SessionUsed);
		}
		if !self.verify_partial(theirs) {
			return Err(CoopError::InvalidPartialSignature);
		}
		let sec_nonce = self.sec_nonce.take().ok_or(CoopError::SessionUsed)?;
		let sig = musig::sign_and_aggregate(
			&self.agg.cache,
			&self.our_key,
			sec_nonce,
			self.pub_nonce,
			theirs.pub_nonce,
			theirs.signature,
			self.sighash,
		)?;
		let mut tx = self.tx.clone();
		claim::finalize_key_spend(&mut tx, 0, sig);
		Ok(tx)
	}
}

impl fmt::Debug for ClaimSession {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.debug_struct("ClaimSession")
			.field("their_pubkey", &self.their_pubkey)
			.field("txid", &self.tx.compute_txid())
			.field("sighash", &self.sighash)
			.field("used", &self.is_used())
			.finish()
	}
}

/// Create our partial signature for input `index` of a counterparty tx
/// spending an output of the given swap tree.
///
/// `prevouts` are the outputs spent by every input of the transaction.
pub fn sign_their_input(
	our_key: &Keypair,
	their_pubkey: PublicKey,
	tree: &SwapTree,
	request: &TheirSigningData,
	prevouts: &[TxOut],
) -> Result<PartialSignature, CoopError> {
	let agg = key_agg(our_key, their_pubkey, tree)?;
	let sighash = claim::key_spend_sighash(&request.transaction, request.index, prevouts)?;
	let (pub_nonce, signature) = musig::deterministic_partial_sign(
		our_key, &agg.cache, &request.pub_nonce, sighash,
	)?;
	Ok(PartialSignature { pub_nonce, signature })
}
