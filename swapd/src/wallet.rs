
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use bip39::Mnemonic;
use bitcoin::{bip32, Address, Network, Script, ScriptBuf};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::Keypair;

use bitcoin_ext::rpc::BitcoinRpcClient;
use bitcoin_ext::rpc::bitcoincore_rpc::{json::AddressType, RpcApi};

use swap::SECP;

use crate::error::ContextExt;


pub const MNEMONIC_FILE: &str = "mnemonic";

/// Key material and addresses of one currency.
#[async_trait]
pub trait Wallet: Send + Sync + 'static {
	fn symbol(&self) -> &str;

	/// The swap key with the given index.
	fn keys_by_index(&self, index: u32) -> anyhow::Result<Keypair>;

	/// A fresh address to receive funds, labeled for bookkeeping.
	async fn get_address(&self, label: &str) -> anyhow::Result<String>;

	fn encode_address(&self, script: &Script) -> anyhow::Result<String>;

	fn decode_address(&self, address: &str) -> anyhow::Result<ScriptBuf>;
}

/// The BIP32 child index of the swap keys of a currency.
///
/// Picked from the hash of the symbol, so that currencies never share keys.
pub fn currency_child_number(symbol: &str) -> anyhow::Result<bip32::ChildNumber> {
	const MASK_U31: u32 = 0x7FFF_FFFF;
	let sha = sha256::Hash::hash(symbol.as_bytes());
	let idx = u32::from_be_bytes([sha[0], sha[1], sha[2], sha[3]]) & MASK_U31;
	Ok(bip32::ChildNumber::from_hardened_idx(idx)?)
}

pub fn read_mnemonic_from_datadir(data_dir: &Path) -> anyhow::Result<Mnemonic> {
	let mnemonic = std::fs::read_to_string(data_dir.join(MNEMONIC_FILE))
		.context("failed to read mnemonic")?;
	Ok(Mnemonic::from_str(mnemonic.trim())?)
}

/// A [Wallet] with keys derived from our seed and sweep addresses
/// from a bitcoind wallet.
pub struct SeedWallet {
	symbol: String,
	network: Network,
	xpriv: bip32::Xpriv,
	rpc: BitcoinRpcClient,
}

impl SeedWallet {
	pub fn new(
		symbol: String,
		network: Network,
		master_xpriv: &bip32::Xpriv,
		rpc: BitcoinRpcClient,
	) -> anyhow::Result<SeedWallet> {
		let xpriv = master_xpriv.derive_priv(&SECP, &[currency_child_number(&symbol)?])
			.context("failed to derive currency xpriv")?;
		Ok(SeedWallet { symbol, network, xpriv, rpc })
	}

	fn derive(&self, index: u32) -> anyhow::Result<Keypair> {
		let child = bip32::ChildNumber::from_normal_idx(index)
			.with_badarg(|| format!("invalid key index: {}", index))?;
		let xpriv = self.xpriv.derive_priv(&SECP, &[child])?;
		Ok(Keypair::from_secret_key(&SECP, &xpriv.private_key))
	}
}

#[async_trait]
impl Wallet for SeedWallet {
	fn symbol(&self) -> &str {
		&self.symbol
	}

	fn keys_by_index(&self, index: u32) -> anyhow::Result<Keypair> {
		self.derive(index)
	}

	async fn get_address(&self, label: &str) -> anyhow::Result<String> {
		let addr = self.rpc.get_new_address(Some(label), Some(AddressType::Bech32m))
			.context("failed to get address from bitcoind wallet")?;
		Ok(addr.require_network(self.network)?.to_string())
	}

	fn encode_address(&self, script: &Script) -> anyhow::Result<String> {
		Ok(Address::from_script(script, self.network)?.to_string())
	}

	fn decode_address(&self, address: &str) -> anyhow::Result<ScriptBuf> {
		let addr = Address::from_str(address).with_badarg(|| format!("invalid address: {}", address))?
			.require_network(self.network)
			.with_badarg(|| format!("address for wrong network: {}", address))?;
		Ok(addr.script_pubkey())
	}
}
