
//! The two-leaf taproot script tree every swap output commits to.

use bitcoin::{opcodes, ScriptBuf, TapLeafHash, TapNodeHash};
use bitcoin::hashes::{ripemd160, sha256, Hash};
use bitcoin::script::Instruction;
use bitcoin::secp256k1::XOnlyPublicKey;
use bitcoin::taproot::{LeafVersion, TAPROOT_LEAF_TAPSCRIPT};

use bitcoin_ext::BlockHeight;


#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
	#[error("invalid leaf version: {0}")]
	LeafVersion(u8),
	#[error("{0} leaf does not contain a public key")]
	MissingPubkey(&'static str),
	#[error("invalid public key in {0} leaf")]
	InvalidPubkey(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tapleaf {
	pub version: u8,
	#[serde(with = "script_hex")]
	pub output: ScriptBuf,
}

impl Tapleaf {
	pub fn tapscript(output: ScriptBuf) -> Tapleaf {
		Tapleaf { version: TAPROOT_LEAF_TAPSCRIPT, output }
	}

	pub fn leaf_version(&self) -> Result<LeafVersion, TreeError> {
		LeafVersion::from_consensus(self.version).map_err(|_| TreeError::LeafVersion(self.version))
	}

	pub fn leaf_hash(&self) -> Result<TapLeafHash, TreeError> {
		Ok(TapLeafHash::from_script(&self.output, self.leaf_version()?))
	}

	/// The first 32-byte push of the leaf script.
	fn first_xonly(&self, name: &'static str) -> Result<XOnlyPublicKey, TreeError> {
		for instr in self.output.instructions().flatten() {
			if let Instruction::PushBytes(bytes) = instr {
				if bytes.len() == 32 {
					return XOnlyPublicKey::from_slice(bytes.as_bytes())
						.map_err(|_| TreeError::InvalidPubkey(name));
				}
			}
		}
		Err(TreeError::MissingPubkey(name))
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapTree {
	#[serde(rename = "claimLeaf")]
	pub claim_leaf: Tapleaf,
	#[serde(rename = "refundLeaf")]
	pub refund_leaf: Tapleaf,
}

impl SwapTree {
	/// Build the tree with a preimage-gated claim leaf and a timelocked
	/// refund leaf.
	pub fn new(
		preimage_hash: sha256::Hash,
		claim_pubkey: XOnlyPublicKey,
		refund_pubkey: XOnlyPublicKey,
		timeout: BlockHeight,
	) -> SwapTree {
		let hash160 = ripemd160::Hash::hash(&preimage_hash[..]);
		let claim = bitcoin::Script::builder()
			.push_opcode(opcodes::all::OP_SIZE)
			.push_int(32)
			.push_opcode(opcodes::all::OP_EQUALVERIFY)
			.push_opcode(opcodes::all::OP_HASH160)
			.push_slice(hash160.as_byte_array())
			.push_opcode(opcodes::all::OP_EQUALVERIFY)
			.push_x_only_key(&claim_pubkey)
			.push_opcode(opcodes::all::OP_CHECKSIG)
			.into_script();
		let refund = bitcoin::Script::builder()
			.push_x_only_key(&refund_pubkey)
			.push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
			.push_int(timeout as i64)
			.push_opcode(opcodes::all::OP_CLTV)
			.into_script();
		SwapTree {
			claim_leaf: Tapleaf::tapscript(claim),
			refund_leaf: Tapleaf::tapscript(refund),
		}
	}

	/// Both leaves sit at depth one.
	pub fn merkle_root(&self) -> Result<TapNodeHash, TreeError> {
		Ok(TapNodeHash::from_node_hashes(
			self.claim_leaf.leaf_hash()?.into(),
			self.refund_leaf.leaf_hash()?.into(),
		))
	}

	pub fn claim_pubkey(&self) -> Result<XOnlyPublicKey, TreeError> {
		self.claim_leaf.first_xonly("claim")
	}

	pub fn refund_pubkey(&self) -> Result<XOnlyPublicKey, TreeError> {
		self.refund_leaf.first_xonly("refund")
	}
}

mod script_hex {
	use bitcoin::ScriptBuf;
	use bitcoin::hex::{DisplayHex, FromHex};
	use serde::{Deserialize, Deserializer, Serializer};
	use serde::de::Error;

	pub fn serialize<S: Serializer>(script: &ScriptBuf, s: S) -> Result<S::Ok, S::Error> {
		s.collect_str(&script.as_bytes().as_hex())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ScriptBuf, D::Error> {
		let s = String::deserialize(d)?;
		Ok(ScriptBuf::from_bytes(Vec::<u8>::from_hex(&s).map_err(D::Error::custom)?))
	}
}


#[cfg(test)]
mod test {
	use super::*;
	use std::str::FromStr;
	use bitcoin::hex::DisplayHex;

	const TREE: &str = "{\"claimLeaf\":{\"version\":192,\"output\":\"a9140be3e65567f55ff6ac791bd4f65f672bcaf5f211882050d47b462154253db0fcdc63323d50fffef708a4bdce34a34958c46051d1e997ac\"},\"refundLeaf\":{\"version\":192,\"output\":\"206ecd3e58ebe0a558badb9a083a365530e1de168dfa410233433f2b2e3c7f4438ad03b9e101b1\"}}";
	const TREE_REVERSE: &str = "{\"claimLeaf\":{\"version\":192,\"output\":\"82012088a9140be3e65567f55ff6ac791bd4f65f672bcaf5f211882050d47b462154253db0fcdc63323d50fffef708a4bdce34a34958c46051d1e997ac\"},\"refundLeaf\":{\"version\":192,\"output\":\"206ecd3e58ebe0a558badb9a083a365530e1de168dfa410233433f2b2e3c7f4438ad03b9e101b1\"}}";

	const CLAIM_PK: &str = "50d47b462154253db0fcdc63323d50fffef708a4bdce34a34958c46051d1e997";
	const REFUND_PK: &str = "6ecd3e58ebe0a558badb9a083a365530e1de168dfa410233433f2b2e3c7f4438";

	#[test]
	fn json_format() {
		for input in [TREE, TREE_REVERSE] {
			let tree = serde_json::from_str::<SwapTree>(input).unwrap();
			assert_eq!(tree.claim_leaf.version, TAPROOT_LEAF_TAPSCRIPT);
			assert_eq!(serde_json::to_string(&tree).unwrap(), input);
		}
	}

	#[test]
	fn hashes() {
		let tree = serde_json::from_str::<SwapTree>(TREE).unwrap();
		assert_eq!(
			tree.claim_leaf.leaf_hash().unwrap().to_byte_array().as_hex().to_string(),
			"91e1bfa3e4a5a077f8591142a7c8025fb512251d9ea7c33d934457980c924f95",
		);
		assert_eq!(
			tree.merkle_root().unwrap().to_byte_array().as_hex().to_string(),
			"d7f72e04acac75db079fcd6b6288ce455f97a25259185a9553ae54fbdeecf726",
		);

		let tree = serde_json::from_str::<SwapTree>(TREE_REVERSE).unwrap();
		assert_eq!(
			tree.merkle_root().unwrap().to_byte_array().as_hex().to_string(),
			"545007a443c37f3084fb36bb037453f206cc620db3121ecfd38f012094c5d74f",
		);
	}

	#[test]
	fn leaf_pubkeys() {
		for input in [TREE, TREE_REVERSE] {
			let tree = serde_json::from_str::<SwapTree>(input).unwrap();
			assert_eq!(tree.claim_pubkey().unwrap().to_string(), CLAIM_PK);
			assert_eq!(tree.refund_pubkey().unwrap().to_string(), REFUND_PK);
		}

		let no_key = SwapTree {
			claim_leaf: Tapleaf::tapscript(ScriptBuf::new()),
			refund_leaf: Tapleaf::tapscript(ScriptBuf::new()),
		};
		assert_eq!(no_key.claim_pubkey(), Err(TreeError::MissingPubkey("claim")));
	}

	#[test]
	fn build_tree() {
		let claim_pk = XOnlyPublicKey::from_str(CLAIM_PK).unwrap();
		let refund_pk = XOnlyPublicKey::from_str(REFUND_PK).unwrap();
		let tree = SwapTree::new(sha256::Hash::hash(&[7; 32]), claim_pk, refund_pk, 123321);

		let reference = serde_json::from_str::<SwapTree>(TREE_REVERSE).unwrap();
		assert_eq!(tree.refund_leaf, reference.refund_leaf);
		assert_eq!(tree.claim_pubkey().unwrap(), claim_pk);
		assert_eq!(tree.refund_pubkey().unwrap(), refund_pk);

		let claim = tree.claim_leaf.output.as_bytes();
		assert_eq!(&claim[..5], &[0x82, 0x01, 0x20, 0x88, 0xa9]);
		assert_eq!(claim.len(), reference.claim_leaf.output.len());
	}

	#[test]
	fn bad_leaf_version() {
		let mut tree = serde_json::from_str::<SwapTree>(TREE).unwrap();
		tree.refund_leaf.version = 0xc1;
		assert_eq!(tree.merkle_root(), Err(TreeError::LeafVersion(0xc1)));
	}
}
