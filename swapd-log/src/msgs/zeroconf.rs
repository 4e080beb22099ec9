
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLedgerInitialized {
	pub symbol: String,
	pub risk: u128,
	pub max_risk: u128,
	pub nb_pending: usize,
}
impl_slog!(RiskLedgerInitialized, Info, "restored zero-conf risk from pending lockups");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZeroConfAccepted {
	pub swap_id: String,
	pub symbol: String,
	pub txid: String,
	pub amount: u128,
	pub risk: u128,
	pub max_risk: u128,
}
impl_slog!(ZeroConfAccepted, Debug, "accepted unconfirmed lockup");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZeroConfRejected {
	pub swap_id: String,
	pub symbol: String,
	pub txid: String,
	pub amount: u128,
	pub risk: u128,
	pub max_risk: u128,
}
impl_slog!(ZeroConfRejected, Info, "rejected unconfirmed lockup: risk ceiling reached");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingLockupConfirmed {
	pub swap_id: String,
	pub symbol: String,
	pub txid: String,
	pub amount: u128,
	pub risk: u128,
}
impl_slog!(PendingLockupConfirmed, Debug, "pending lockup transaction confirmed");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingLockupMissing {
	pub swap_id: String,
	pub symbol: String,
	pub txid: String,
}
impl_slog!(PendingLockupMissing, Warn, "could not find pending lockup transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingLockupCheckError {
	pub swap_id: String,
	pub symbol: String,
	pub txid: String,
	pub error: String,
}
impl_slog!(PendingLockupCheckError, Warn, "error checking pending lockup transaction");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZeroConfDisabled {
	pub symbol: String,
}
impl_slog!(ZeroConfDisabled, Warn, "disabled zero-conf until restart");
