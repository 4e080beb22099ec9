
use bitcoin::{BlockHash, Txid};
use bitcoin_ext::BlockHeight;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TipUpdated {
	pub symbol: String,
	pub height: BlockHeight,
	pub hash: BlockHash,
}
impl_slog!(TipUpdated, Debug, "the chain tip has been updated");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TipFetchError {
	pub symbol: String,
	pub error: String,
}
impl_slog!(TipFetchError, Warn, "error fetching the chain tip");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredInputSpent {
	pub symbol: String,
	pub spent_txid: Txid,
	pub spending_txid: Txid,
}
impl_slog!(FilteredInputSpent, Debug, "a watched input was spent in a new block");


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFilterRemoved {
	pub symbol: String,
	pub txid: Txid,
}
impl_slog!(InputFilterRemoved, Trace, "removed input filter");


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastingTx {
	pub symbol: String,
	pub txid: Txid,
	#[serde(with = "crate::serde_utils::hex")]
	pub raw_tx: Vec<u8>,
}
impl_slog!(BroadcastingTx, Trace, "broadcasting transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxBroadcastError {
	pub symbol: String,
	pub txid: Txid,
	#[serde(with = "crate::serde_utils::hex")]
	pub raw_tx: Vec<u8>,
	pub error: String,
}
impl_slog!(TxBroadcastError, Error, "error broadcasting one of our txs");
