
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundConfirmed {
	pub swap_id: String,
	pub symbol: String,
	pub txid: String,
	pub confirmations: u64,
}
impl_slog!(RefundConfirmed, Info, "refund transaction confirmed");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundCheckError {
	pub swap_id: String,
	pub txid: String,
	pub error: String,
}
impl_slog!(RefundCheckError, Error, "error checking refund transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundScanFinished {
	pub nb_pending: usize,
	pub nb_confirmed: usize,
}
impl_slog!(RefundScanFinished, Trace, "finished checking pending refund transactions");
