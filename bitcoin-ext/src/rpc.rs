use std::borrow::Borrow;

use cbitcoin::{Amount, BlockHash, FeeRate, Transaction, Txid};
use serde::{self, Deserialize};

use bdk_bitcoind_rpc::bitcoincore_rpc::{jsonrpc, Auth, Client, Error, Result as RpcResult, RpcApi};

use crate::{BlockHeight, BlockRef, FeeRateExt};

pub use bdk_bitcoind_rpc::bitcoincore_rpc;

/// Error code for RPC_VERIFY_ALREADY_IN_UTXO_SET.
const RPC_VERIFY_ALREADY_IN_UTXO_SET: i32 = -27;

/// Error code for RPC_INVALID_ADDRESS_OR_KEY, used when a tx is not found.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;

/// Clonable bitcoind rpc client.
#[derive(Debug)]
pub struct BitcoinRpcClient {
	client: Client,
	url: String,
	auth: Auth,
}

impl BitcoinRpcClient {
	pub fn new(url: &str, auth: Auth) -> Result<Self, Error> {
		Ok(BitcoinRpcClient {
			client: Client::new(url, auth.clone())?,
			url: url.to_owned(),
			auth: auth,
		})
	}

	/// Create a client for the wallet endpoint of the given bitcoind wallet.
	pub fn for_wallet(&self, wallet: &str) -> Result<Self, Error> {
		let url = format!("{}/wallet/{}", self.url.trim_end_matches('/'), wallet);
		BitcoinRpcClient::new(&url, self.auth.clone())
	}

	pub fn url(&self) -> &str {
		&self.url
	}
}

impl RpcApi for BitcoinRpcClient {
	fn call<T: for<'a> serde::de::Deserialize<'a>>(
		&self, cmd: &str, args: &[serde_json::Value],
	) -> Result<T, Error> {
		self.client.call(cmd, args)
	}
}

impl Clone for BitcoinRpcClient {
	fn clone(&self) -> Self {
		BitcoinRpcClient {
			client: Client::new(&self.url, self.auth.clone())
				.expect("client was created with these arguments before"),
			url: self.url.clone(),
			auth: self.auth.clone(),
		}
	}
}

/// The subset of the verbose `getrawtransaction` result we rely on.
///
/// bitcoind leaves out `blockhash` and `confirmations` while a tx
/// is still in the mempool.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct RawTransactionInfo {
	pub txid: Txid,
	#[serde(with = "serde_hex")]
	pub hex: Vec<u8>,
	pub blockhash: Option<BlockHash>,
	pub confirmations: Option<u32>,
}

impl RawTransactionInfo {
	/// The number of confirmations, with a missing field counting as none.
	pub fn confirmations(&self) -> u32 {
		self.confirmations.unwrap_or(0)
	}
}

mod serde_hex {
	use cbitcoin::hex::FromHex;
	use serde::de::Error;
	use serde::Deserializer;

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
		let hex_str: String = ::serde::Deserialize::deserialize(d)?;
		Ok(FromHex::from_hex(&hex_str).map_err(D::Error::custom)?)
	}
}

#[derive(Clone, Debug, Deserialize)]
struct EstimateSmartFeeResult {
	#[serde(default, with = "cbitcoin::amount::serde::as_btc::opt")]
	feerate: Option<Amount>,
}

pub trait BitcoinRpcErrorExt: Borrow<Error> {
	/// Whether this error indicates that the tx was not found.
	fn is_not_found(&self) -> bool {
		if let Error::JsonRpc(jsonrpc::Error::Rpc(e)) = self.borrow() {
			e.code == RPC_INVALID_ADDRESS_OR_KEY
		} else {
			false
		}
	}

	/// Whether this error indicates that the tx is already in the utxo set.
	fn is_in_utxo_set(&self) -> bool {
		if let Error::JsonRpc(jsonrpc::Error::Rpc(e)) = self.borrow() {
			e.code == RPC_VERIFY_ALREADY_IN_UTXO_SET
		} else {
			false
		}
	}
}
impl BitcoinRpcErrorExt for Error {}

pub trait BitcoinRpcExt: RpcApi {
	/// Verbose transaction lookup that returns [None] for unknown txs.
	fn raw_transaction_info(&self, txid: &Txid) -> RpcResult<Option<RawTransactionInfo>> {
		let args = [serde_json::to_value(txid)?, serde_json::Value::Bool(true)];
		match self.call("getrawtransaction", &args) {
			Ok(ret) => Ok(Some(ret)),
			Err(e) if e.is_not_found() => Ok(None),
			Err(e) => Err(e),
		}
	}

	fn broadcast_tx(&self, tx: &Transaction) -> Result<Txid, Error> {
		match self.send_raw_transaction(tx) {
			Ok(txid) => Ok(txid),
			Err(e) if e.is_in_utxo_set() => Ok(tx.compute_txid()),
			Err(e) => Err(e),
		}
	}

	fn tip(&self) -> Result<BlockRef, Error> {
		let height = self.get_block_count()?;
		let hash = self.get_block_hash(height)?;
		Ok(BlockRef { height: height as BlockHeight, hash })
	}

	/// Estimate a fee rate for confirmation within `target` blocks.
	///
	/// Returns [None] when bitcoind has no estimate, which is the
	/// normal case on regtest.
	fn estimate_fee_rate(&self, target: u16) -> RpcResult<Option<FeeRate>> {
		let args = [serde_json::Value::from(target)];
		let res = self.call::<EstimateSmartFeeResult>("estimatesmartfee", &args)?;
		Ok(res.feerate.map(FeeRate::from_amount_per_kvb))
	}
}

impl <T: RpcApi> BitcoinRpcExt for T {}
