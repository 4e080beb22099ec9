
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use bitcoin::hashes::sha256;
use bitcoin::secp256k1::PublicKey;
use postgres_types::{FromSql, ToSql};
use tokio_postgres::Row;

use swap::{Swap, SwapLeg, SwapLegs, SwapStatus, SwapTree, SwapType, SwapVersion};

use crate::zeroconf::RiskAmount;


#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSql, FromSql, PartialEq, Eq)]
#[postgres(name = "refund_status")]
pub enum RefundStatus {
	#[postgres(name = "pending")]
	Pending,
	#[postgres(name = "confirmed")]
	Confirmed,
	#[postgres(name = "failed")]
	Failed,
}

impl RefundStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			RefundStatus::Pending => "pending",
			RefundStatus::Confirmed => "confirmed",
			RefundStatus::Failed => "failed",
		}
	}

	pub fn is_final(&self) -> bool {
		match self {
			RefundStatus::Pending => false,
			RefundStatus::Confirmed => true,
			RefundStatus::Failed => true,
		}
	}
}

impl fmt::Display for RefundStatus {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A refund we broadcast of our own lockup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundTransaction {
	/// Transaction id on the refund chain.
	pub id: String,
	pub swap_id: String,
	pub vin: Option<u32>,
	pub status: RefundStatus,
}

impl TryFrom<Row> for RefundTransaction {
	type Error = anyhow::Error;

	fn try_from(row: Row) -> Result<Self, Self::Error> {
		Ok(RefundTransaction {
			id: row.get("id"),
			swap_id: row.get("swap_id"),
			vin: row.get::<_, Option<i32>>("vin").map(u32::try_from).transpose()?,
			status: row.get("status"),
		})
	}
}

/// An unconfirmed lockup we accepted, counted against the zero-conf risk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLockup {
	pub swap_id: String,
	pub symbol: String,
	pub txid: String,
	pub amount: RiskAmount,
}

impl TryFrom<Row> for PendingLockup {
	type Error = anyhow::Error;

	fn try_from(row: Row) -> Result<Self, Self::Error> {
		let amount = row.get::<_, &str>("amount");
		Ok(PendingLockup {
			swap_id: row.get("swap_id"),
			symbol: row.get("symbol"),
			txid: row.get("txid"),
			amount: RiskAmount::from_str(amount)
				.with_context(|| format!("invalid pending lockup amount: {}", amount))?,
		})
	}
}

pub fn swap_type_from_str(s: &str) -> anyhow::Result<SwapType> {
	match s {
		"submarine" => Ok(SwapType::Submarine),
		"reverse" => Ok(SwapType::Reverse),
		"chain" => Ok(SwapType::Chain),
		_ => bail!("invalid swap type: {}", s),
	}
}

impl TryFrom<&Row> for SwapLeg {
	type Error = anyhow::Error;

	fn try_from(row: &Row) -> Result<Self, Self::Error> {
		let their_public_key = row.get::<_, Option<&str>>("their_public_key")
			.map(PublicKey::from_str).transpose()
			.context("invalid counterparty public key")?;
		let swap_tree = row.get::<_, Option<&str>>("swap_tree")
			.map(serde_json::from_str::<SwapTree>).transpose()
			.context("invalid swap tree")?;
		Ok(SwapLeg {
			symbol: row.get("symbol"),
			key_index: u32::try_from(row.get::<_, i64>("key_index"))?,
			their_public_key,
			swap_tree,
			amount: u64::try_from(row.get::<_, i64>("amount"))?,
			lockup_txid: row.get("lockup_txid"),
			lockup_vout: row.get::<_, Option<i32>>("lockup_vout").map(u32::try_from).transpose()?,
			timeout_block_height: u32::try_from(row.get::<_, i32>("timeout_block_height"))?,
			fee: row.get::<_, Option<i64>>("fee").map(u64::try_from).transpose()?,
		})
	}
}

/// Build a swap from its row and the rows of its legs.
pub fn swap_from_rows(row: &Row, legs: &[Row]) -> anyhow::Result<Swap> {
	let id = row.get::<_, String>("id");
	let kind = swap_type_from_str(row.get("kind"))?;

	let mut receiving = None;
	let mut sending = None;
	for leg in legs {
		match leg.get::<_, &str>("side") {
			"receiving" => receiving = Some(SwapLeg::try_from(leg)?),
			"sending" => sending = Some(SwapLeg::try_from(leg)?),
			side => bail!("invalid leg side for swap {}: {}", id, side),
		}
	}
	let legs = match (kind, receiving, sending) {
		(SwapType::Submarine, Some(receiving), None) => SwapLegs::Submarine { receiving },
		(SwapType::Reverse, None, Some(sending)) => SwapLegs::Reverse { sending },
		(SwapType::Chain, Some(receiving), Some(sending)) => SwapLegs::Chain { receiving, sending },
		_ => bail!("legs of {} swap {} don't match its type", kind, id),
	};

	let version = row.get::<_, i16>("version");
	Ok(Swap {
		status: SwapStatus::from_str(row.get("status"))?,
		pair: row.get("pair"),
		version: SwapVersion::from_i16(version)
			.with_context(|| format!("invalid swap version: {}", version))?,
		preimage_hash: sha256::Hash::from_str(row.get("preimage_hash"))?,
		preimage: row.get::<_, Option<&str>>("preimage")
			.map(swap::Preimage::from_str).transpose()?,
		failure_reason: row.get("failure_reason"),
		legs,
		id,
	})
}
