
use bitcoin::{OutPoint, Txid};


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRegistryRestored {
	pub signer: String,
	pub nb_swaps: usize,
}
impl_slog!(ClaimRegistryRestored, Info, "registered claimable swaps on startup");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRegisteredForClaim {
	pub swap_id: String,
	pub swap_type: String,
}
impl_slog!(SwapRegisteredForClaim, Trace, "swap registered for cooperative claim");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRemovedFromClaimable {
	pub swap_id: String,
}
impl_slog!(SwapRemovedFromClaimable, Trace, "swap removed from cooperative claims");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooperativeDetailsCreated {
	pub swap_id: String,
	pub symbol: String,
	pub lockup: OutPoint,
	pub sweep_address: String,
}
impl_slog!(CooperativeDetailsCreated, Debug, "created cooperative claim session");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotCooperativelyClaiming {
	pub swap_id: String,
	pub reason: String,
}
impl_slog!(NotCooperativelyClaiming, Warn, "not cooperatively claiming swap");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooperativeClaimBroadcast {
	pub swap_id: String,
	pub symbol: String,
	pub txid: Txid,
	pub fee: u64,
}
impl_slog!(CooperativeClaimBroadcast, Info, "broadcast cooperative claim");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooperativeClaimFailed {
	pub swap_id: String,
	pub error: String,
}
impl_slog!(CooperativeClaimFailed, Warn, "our cooperative claim failed");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialSignatureCreated {
	pub swap_id: String,
	pub purpose: String,
	pub input_idx: usize,
}
impl_slog!(PartialSignatureCreated, Debug, "created partial signature for counterparty tx");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooperativeRefundRejected {
	pub swap_id: String,
	pub reason: String,
}
impl_slog!(CooperativeRefundRejected, Info, "not creating partial signature for refund");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooperativeRefundAllowed {
	pub swap_id: String,
	pub overridden_reason: Option<String>,
}
impl_slog!(CooperativeRefundAllowed, Info, "allowing cooperative refund by operator override");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseClaimPreimageReceived {
	pub swap_id: String,
	pub settle_invoice: bool,
}
impl_slog!(ReverseClaimPreimageReceived, Debug, "got preimage for reverse swap");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimDeferred {
	pub swap_id: String,
	pub symbol: String,
	pub nb_pending: usize,
}
impl_slog!(ClaimDeferred, Debug, "deferred claim of swap to the next batch");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepTriggered {
	pub swap_id: String,
	pub symbol: String,
	pub trigger: String,
}
impl_slog!(SweepTriggered, Info, "sweep trigger fired");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchClaimBroadcast {
	pub symbol: String,
	pub txid: Txid,
	pub fee: u64,
	pub nb_swaps: usize,
}
impl_slog!(BatchClaimBroadcast, Info, "broadcast batch claim");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchClaimHandedOver {
	pub symbol: String,
	pub nb_swaps: usize,
}
impl_slog!(BatchClaimHandedOver, Info, "handed batch claim over to settlement");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchClaimFailed {
	pub symbol: String,
	pub nb_swaps: usize,
	pub error: String,
}
impl_slog!(BatchClaimFailed, Warn, "batch claim failed, swaps stay pending");
