
//! Key-spend sweep transactions for swap outputs.

use bitcoin::{
	absolute, taproot, transaction, Amount, FeeRate, OutPoint, ScriptBuf, Sequence, TapSighash,
	TapSighashType, Transaction, TxIn, TxOut, Witness,
};
use bitcoin::secp256k1::schnorr;
use bitcoin::sighash::{self, Prevouts, SighashCache};

use bitcoin_ext::{TransactionExt, P2TR_DUST};


#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
	#[error("claim output of {value} would be dust at fee {fee}")]
	Dust { value: Amount, fee: Amount },
	#[error("fee overflow")]
	FeeOverflow,
	#[error("sighash error: {0}")]
	Sighash(#[from] sighash::TaprootError),
	#[error("input {idx} out of range for tx with {nb_inputs} inputs")]
	InputOutOfRange { idx: usize, nb_inputs: usize },
	#[error("expected {expected} prevouts, got {actual}")]
	PrevoutCount { expected: usize, actual: usize },
}

/// Build the unsigned transaction sweeping `prevout` to `destination`.
///
/// The fee is paid for the weight of the transaction once it carries a
/// single key-spend signature.
pub fn build_claim_tx(
	outpoint: OutPoint,
	prevout: &TxOut,
	destination: ScriptBuf,
	fee_rate: FeeRate,
) -> Result<Transaction, ClaimError> {
	let mut tx = Transaction {
		version: transaction::Version::TWO,
		lock_time: absolute::LockTime::ZERO,
		input: vec![TxIn {
			previous_output: outpoint,
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness: Witness::from_slice(&[[0u8; 64]]),
		}],
		output: vec![TxOut {
			value: prevout.value,
			script_pubkey: destination,
		}],
	};

	let fee = fee_rate.fee_wu(tx.weight()).ok_or(ClaimError::FeeOverflow)?;
	let value = prevout.value.checked_sub(fee)
		.ok_or(ClaimError::Dust { value: Amount::ZERO, fee })?;
	if value < P2TR_DUST {
		return Err(ClaimError::Dust { value, fee });
	}
	tx.output[0].value = value;
	tx.input[0].witness = Witness::new();
	Ok(tx)
}

/// The BIP341 key-spend sighash of input `idx`.
pub fn key_spend_sighash(
	tx: &Transaction,
	idx: usize,
	prevouts: &[TxOut],
) -> Result<TapSighash, ClaimError> {
	if idx >= tx.input.len() {
		return Err(ClaimError::InputOutOfRange { idx, nb_inputs: tx.input.len() });
	}
	if prevouts.len() != tx.input.len() {
		return Err(ClaimError::PrevoutCount { expected: tx.input.len(), actual: prevouts.len() });
	}
	let mut shc = SighashCache::new(tx);
	Ok(shc.taproot_key_spend_signature_hash(idx, &Prevouts::All(prevouts), TapSighashType::Default)?)
}

pub fn finalize_key_spend(tx: &mut Transaction, idx: usize, sig: schnorr::Signature) {
	let sig = taproot::Signature { signature: sig, sighash_type: TapSighashType::Default };
	tx.input[idx].witness = Witness::p2tr_key_spend(&sig);
}

/// The fee paid by `tx` spending the given prevouts.
pub fn tx_fee(tx: &Transaction, prevouts: &[TxOut]) -> Amount {
	let input = prevouts.iter().map(|o| o.value).sum::<Amount>();
	input.checked_sub(tx.output_value()).unwrap_or(Amount::ZERO)
}
