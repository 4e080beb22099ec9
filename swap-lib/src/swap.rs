
use std::fmt;
use std::str::FromStr;

use bitcoin::{OutPoint, Txid};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::hex::{DisplayHex, FromHex};
use bitcoin::secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use bitcoin_ext::BlockHeight;

use crate::tree::SwapTree;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapType {
	Submarine,
	Reverse,
	Chain,
}

impl SwapType {
	pub fn as_str(&self) -> &'static str {
		match self {
			SwapType::Submarine => "submarine",
			SwapType::Reverse => "reverse",
			SwapType::Chain => "chain",
		}
	}
}

impl fmt::Display for SwapType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapVersion {
	Legacy,
	Taproot,
}

impl SwapVersion {
	pub fn from_i16(v: i16) -> Option<SwapVersion> {
		match v {
			0 => Some(SwapVersion::Legacy),
			1 => Some(SwapVersion::Taproot),
			_ => None,
		}
	}

	pub fn to_i16(self) -> i16 {
		match self {
			SwapVersion::Legacy => 0,
			SwapVersion::Taproot => 1,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown swap status: {0}")]
pub struct UnknownStatus(pub String);

macro_rules! swap_statuses {
	($($variant:ident => $s:literal,)*) => {
		/// Status of a swap, with the identifiers used on the wire and in storage.
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum SwapStatus {
			$( $variant, )*
		}

		impl SwapStatus {
			pub fn as_str(&self) -> &'static str {
				match self {
					$( SwapStatus::$variant => $s, )*
				}
			}
		}

		impl FromStr for SwapStatus {
			type Err = UnknownStatus;
			fn from_str(s: &str) -> Result<Self, Self::Err> {
				match s {
					$( $s => Ok(SwapStatus::$variant), )*
					_ => Err(UnknownStatus(s.to_owned())),
				}
			}
		}
	};
}

swap_statuses! {
	Created => "swap.created",
	Expired => "swap.expired",
	InvoiceSet => "invoice.set",
	InvoicePending => "invoice.pending",
	InvoicePaid => "invoice.paid",
	InvoiceSettled => "invoice.settled",
	InvoiceFailedToPay => "invoice.failedToPay",
	InvoiceExpired => "invoice.expired",
	MinerFeePaid => "minerfee.paid",
	TransactionMempool => "transaction.mempool",
	TransactionConfirmed => "transaction.confirmed",
	TransactionServerMempool => "transaction.server.mempool",
	TransactionServerConfirmed => "transaction.server.confirmed",
	TransactionClaimPending => "transaction.claim.pending",
	TransactionClaimed => "transaction.claimed",
	TransactionRefunded => "transaction.refunded",
	TransactionFailed => "transaction.failed",
	TransactionLockupFailed => "transaction.lockupFailed",
	TransactionZeroConfRejected => "transaction.zeroconf.rejected",
}

impl SwapStatus {
	/// Statuses after which a swap will not succeed anymore.
	pub const FAILED: [SwapStatus; 4] = [
		SwapStatus::Expired,
		SwapStatus::TransactionLockupFailed,
		SwapStatus::InvoiceFailedToPay,
		SwapStatus::TransactionRefunded,
	];

	pub fn is_failed(&self) -> bool {
		SwapStatus::FAILED.contains(self)
	}
}

impl fmt::Display for SwapStatus {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl Serialize for SwapStatus {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for SwapStatus {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		SwapStatus::from_str(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid preimage: {0}")]
pub struct InvalidPreimage(String);

/// The 32-byte secret whose SHA256 hash locks a swap.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Preimage([u8; 32]);

impl Preimage {
	pub fn from_byte_array(bytes: [u8; 32]) -> Preimage {
		Preimage(bytes)
	}

	pub fn from_slice(bytes: &[u8]) -> Result<Preimage, InvalidPreimage> {
		let arr = <[u8; 32]>::try_from(bytes)
			.map_err(|_| InvalidPreimage(format!("expected 32 bytes, got {}", bytes.len())))?;
		Ok(Preimage(arr))
	}

	pub fn as_byte_array(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn hash(&self) -> sha256::Hash {
		sha256::Hash::hash(&self.0)
	}
}

impl fmt::Display for Preimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(&self.0.as_hex(), f)
	}
}

impl fmt::Debug for Preimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl FromStr for Preimage {
	type Err = InvalidPreimage;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		<[u8; 32]>::from_hex(s).map(Preimage).map_err(|e| InvalidPreimage(e.to_string()))
	}
}

impl Serialize for Preimage {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for Preimage {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		Preimage::from_str(&s).map_err(serde::de::Error::custom)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LegError {
	#[error("no lockup transaction for {0} leg")]
	NoLockup(String),
	#[error("lockup transaction id of {symbol} leg is not a bitcoin txid: {txid}")]
	NotUtxoTxid { symbol: String, txid: String },
	#[error("{0} leg has no swap tree")]
	NoSwapTree(String),
	#[error("{0} leg has no counterparty public key")]
	NoTheirKey(String),
}

/// One on-chain side of a swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapLeg {
	pub symbol: String,
	pub key_index: u32,
	pub their_public_key: Option<PublicKey>,
	pub swap_tree: Option<SwapTree>,
	/// Expected lockup amount in the chain's base unit.
	pub amount: u64,
	/// Transaction id on the leg's chain. Not necessarily a bitcoin txid.
	pub lockup_txid: Option<String>,
	pub lockup_vout: Option<u32>,
	pub timeout_block_height: BlockHeight,
	pub fee: Option<u64>,
}

impl SwapLeg {
	pub fn lockup_outpoint(&self) -> Result<OutPoint, LegError> {
		let txid = self.lockup_txid.as_ref().ok_or_else(|| LegError::NoLockup(self.symbol.clone()))?;
		let vout = self.lockup_vout.ok_or_else(|| LegError::NoLockup(self.symbol.clone()))?;
		let txid = Txid::from_str(txid).map_err(|_| LegError::NotUtxoTxid {
			symbol: self.symbol.clone(),
			txid: txid.clone(),
		})?;
		Ok(OutPoint::new(txid, vout))
	}

	pub fn swap_tree(&self) -> Result<&SwapTree, LegError> {
		self.swap_tree.as_ref().ok_or_else(|| LegError::NoSwapTree(self.symbol.clone()))
	}

	pub fn their_public_key(&self) -> Result<PublicKey, LegError> {
		self.their_public_key.ok_or_else(|| LegError::NoTheirKey(self.symbol.clone()))
	}
}

/// The on-chain legs of a swap, by swap family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapLegs {
	/// The user locks on chain and we claim.
	Submarine { receiving: SwapLeg },
	/// We lock on chain and the user claims.
	Reverse { sending: SwapLeg },
	Chain { receiving: SwapLeg, sending: SwapLeg },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swap {
	pub id: String,
	pub status: SwapStatus,
	pub pair: String,
	pub version: SwapVersion,
	pub preimage_hash: sha256::Hash,
	pub preimage: Option<Preimage>,
	pub failure_reason: Option<String>,
	pub legs: SwapLegs,
}

impl Swap {
	pub fn kind(&self) -> SwapType {
		match self.legs {
			SwapLegs::Submarine { .. } => SwapType::Submarine,
			SwapLegs::Reverse { .. } => SwapType::Reverse,
			SwapLegs::Chain { .. } => SwapType::Chain,
		}
	}

	/// The leg where the user locks funds for us.
	pub fn receiving_leg(&self) -> Option<&SwapLeg> {
		match &self.legs {
			SwapLegs::Submarine { receiving } => Some(receiving),
			SwapLegs::Reverse { .. } => None,
			SwapLegs::Chain { receiving, .. } => Some(receiving),
		}
	}

	/// The leg where we lock funds for the user.
	pub fn sending_leg(&self) -> Option<&SwapLeg> {
		match &self.legs {
			SwapLegs::Submarine { .. } => None,
			SwapLegs::Reverse { sending } => Some(sending),
			SwapLegs::Chain { sending, .. } => Some(sending),
		}
	}

	pub fn sending_leg_mut(&mut self) -> Option<&mut SwapLeg> {
		match &mut self.legs {
			SwapLegs::Submarine { .. } => None,
			SwapLegs::Reverse { sending } => Some(sending),
			SwapLegs::Chain { sending, .. } => Some(sending),
		}
	}

	/// The leg we claim.
	pub fn claim_leg(&self) -> Option<&SwapLeg> {
		self.receiving_leg()
	}

	pub fn claim_leg_mut(&mut self) -> Option<&mut SwapLeg> {
		match &mut self.legs {
			SwapLegs::Submarine { receiving } => Some(receiving),
			SwapLegs::Reverse { .. } => None,
			SwapLegs::Chain { receiving, .. } => Some(receiving),
		}
	}

	/// The leg we might have to refund to ourselves.
	pub fn refund_leg(&self) -> Option<&SwapLeg> {
		self.sending_leg()
	}

	pub fn is_settled(&self) -> bool {
		self.status == SwapStatus::TransactionClaimed
	}

	pub fn is_refunded(&self) -> bool {
		self.status == SwapStatus::TransactionRefunded
	}

	pub fn is_failed(&self) -> bool {
		self.status.is_failed()
	}

	pub fn is_valid_preimage(&self, preimage: &Preimage) -> bool {
		preimage.hash() == self.preimage_hash
	}
}


#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn status_strings() {
		for s in ["swap.created", "transaction.server.mempool", "invoice.failedToPay", "transaction.claimed"] {
			assert_eq!(SwapStatus::from_str(s).unwrap().as_str(), s);
		}
		assert_eq!(SwapStatus::from_str("transaction.exploded"),
			Err(UnknownStatus("transaction.exploded".into())));

		let json = serde_json::to_string(&SwapStatus::TransactionLockupFailed).unwrap();
		assert_eq!(json, "\"transaction.lockupFailed\"");
		assert!(serde_json::from_str::<SwapStatus>(&json).unwrap().is_failed());
		assert!(!SwapStatus::TransactionClaimed.is_failed());
	}

	#[test]
	fn preimage() {
		let preimage = Preimage::from_byte_array([3; 32]);
		let s = preimage.to_string();
		assert_eq!(s.len(), 64);
		assert_eq!(Preimage::from_str(&s).unwrap(), preimage);
		assert_eq!(preimage.hash(), sha256::Hash::hash(&[3; 32]));
		assert!(Preimage::from_slice(&[1; 31]).is_err());
		assert!(Preimage::from_str("00").is_err());
	}

	fn leg(symbol: &str) -> SwapLeg {
		SwapLeg {
			symbol: symbol.into(),
			key_index: 1,
			their_public_key: None,
			swap_tree: None,
			amount: 10_000,
			lockup_txid: None,
			lockup_vout: None,
			timeout_block_height: 100,
			fee: None,
		}
	}

	#[test]
	fn legs_by_family() {
		let mut swap = Swap {
			id: "swap".into(),
			status: SwapStatus::Created,
			pair: "L-BTC/BTC".into(),
			version: SwapVersion::Taproot,
			preimage_hash: sha256::Hash::hash(&[0; 32]),
			preimage: None,
			failure_reason: None,
			legs: SwapLegs::Chain { receiving: leg("L-BTC"), sending: leg("BTC") },
		};
		assert_eq!(swap.kind(), SwapType::Chain);
		assert_eq!(swap.claim_leg().unwrap().symbol, "L-BTC");
		assert_eq!(swap.refund_leg().unwrap().symbol, "BTC");

		swap.legs = SwapLegs::Reverse { sending: leg("BTC") };
		assert!(swap.claim_leg().is_none());
		assert_eq!(swap.refund_leg().unwrap().symbol, "BTC");

		swap.legs = SwapLegs::Submarine { receiving: leg("BTC") };
		assert!(swap.refund_leg().is_none());
		assert!(swap.is_valid_preimage(&Preimage::from_byte_array([0; 32])));
		assert!(!swap.is_valid_preimage(&Preimage::from_byte_array([1; 32])));
	}

	#[test]
	fn lockup_outpoint() {
		let mut leg = leg("BTC");
		assert_eq!(leg.lockup_outpoint(), Err(LegError::NoLockup("BTC".into())));

		leg.lockup_txid = Some("0x1234".into());
		leg.lockup_vout = Some(0);
		assert!(matches!(leg.lockup_outpoint(), Err(LegError::NotUtxoTxid { .. })));

		let txid = Txid::from_byte_array([9; 32]);
		leg.lockup_txid = Some(txid.to_string());
		leg.lockup_vout = Some(2);
		assert_eq!(leg.lockup_outpoint().unwrap(), OutPoint::new(txid, 2));
	}
}
