
extern crate bitcoin as cbitcoin;

mod bitcoin;
pub use bitcoin::{FeeRateExt, TransactionExt};

pub mod rpc;


use cbitcoin::{Amount, BlockHash};


/// Type representing a block height in the bitcoin blockchain.
pub type BlockHeight = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef {
	pub height: BlockHeight,
	pub hash: BlockHash,
}

pub const P2TR_DUST_VB: u64 = 110;
/// 330 satoshis
pub const P2TR_DUST_SAT: u64 = P2TR_DUST_VB * 3;
pub const P2TR_DUST: Amount = Amount::from_sat(P2TR_DUST_SAT);
