
pub extern crate bitcoin;

#[macro_use] extern crate serde;
#[macro_use] extern crate lazy_static;

pub mod claim;
pub mod coop;
pub mod musig;
pub mod swap;
pub mod tree;

pub use crate::coop::{ClaimSession, CooperativeDetails, PartialSignature, TheirSigningData};
pub use crate::swap::{
	LegError, Preimage, Swap, SwapLeg, SwapLegs, SwapStatus, SwapType, SwapVersion,
};
pub use crate::tree::{SwapTree, Tapleaf};

use bitcoin::secp256k1;

lazy_static! {
	/// Global secp context.
	pub static ref SECP: secp256k1::Secp256k1<secp256k1::All> = secp256k1::Secp256k1::new();
}
