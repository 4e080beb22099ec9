
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStarted {
	pub network: bitcoin::Network,
	pub nb_currencies: usize,
}
impl_slog!(ServerStarted, Info, "swapd started");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTerminated {}
impl_slog!(ServerTerminated, Info, "server terminated: shutdown completed");


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStarted {
	pub name: String,
	pub critical: bool,
}
impl_slog!(WorkerStarted, Trace, "a worker thread started");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStopped {
	pub name: String,
}
impl_slog!(WorkerStopped, Trace, "a worker thread stopped");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalWorkerStopped {
	pub name: String,
}
impl_slog!(CriticalWorkerStopped, Error, "a critical worker stopped unexpectedly");


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRequested {
	pub swap_id: String,
	pub symbol: String,
	pub with_preimage: bool,
}
impl_slog!(SettlementRequested, Info, "handed swap to the non-cooperative settlement path");
