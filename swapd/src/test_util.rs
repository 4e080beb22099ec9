
//! In-memory collaborators and a scripted counterparty for unit tests.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitcoin::{
	absolute, transaction, Address, Amount, FeeRate, Network, OutPoint, Script, ScriptBuf, Sequence,
	TapSighash, Transaction, TxIn, TxOut, Txid, Witness,
};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{rand, Keypair, PublicKey};
use tokio::sync::broadcast;

use bitcoin_ext::BlockHeight;
use bitcoin_ext::rpc::RawTransactionInfo;
use swap::{
	claim, musig, PartialSignature, CooperativeDetails, Preimage, Swap, SwapLeg, SwapLegs, SwapStatus,
	SwapTree, SwapType, SwapVersion, TheirSigningData, SECP,
};
use swap::musig::MusigPubNonce;

use crate::chain::{AccountProvider, ChainClient, Currency, TransactionReceipt};
use crate::database::{PendingLockupRepository, RefundTransactionRepository, SwapRepository};
use crate::database::model::{PendingLockup, RefundStatus, RefundTransaction};
use crate::rates::RateProvider;
use crate::settle::{BatchClaimed, DeferredClaim, SettlementAttempt};
use crate::wallet::Wallet;
use crate::zeroconf::RiskAmount;


pub const PREIMAGE: [u8; 32] = [7; 32];

const TIMEOUT: BlockHeight = 1_000;

/// A transaction spending a made up outpoint, distinct per tag.
pub fn dummy_tx(tag: u8) -> Transaction {
	Transaction {
		version: transaction::Version::TWO,
		lock_time: absolute::LockTime::ZERO,
		input: vec![TxIn {
			previous_output: OutPoint::new(Txid::from_byte_array([tag; 32]), 0),
			script_sig: ScriptBuf::new(),
			sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
			witness: Witness::new(),
		}],
		output: vec![TxOut { value: Amount::from_sat(10_000), script_pubkey: ScriptBuf::new() }],
	}
}

pub fn leg(symbol: &str, amount: u64) -> SwapLeg {
	SwapLeg {
		symbol: symbol.to_owned(),
		key_index: 0,
		their_public_key: None,
		swap_tree: None,
		amount,
		lockup_txid: None,
		lockup_vout: None,
		timeout_block_height: TIMEOUT,
		fee: None,
	}
}

pub fn swap_template(id: &str, preimage_hash: sha256::Hash) -> Swap {
	Swap {
		id: id.to_owned(),
		status: SwapStatus::Created,
		pair: "BTC/BTC".to_owned(),
		version: SwapVersion::Taproot,
		preimage_hash,
		preimage: None,
		failure_reason: None,
		legs: SwapLegs::Submarine { receiving: leg("BTC", 0) },
	}
}

fn preimage_hash() -> sha256::Hash {
	Preimage::from_byte_array(PREIMAGE).hash()
}

pub fn submarine_swap(id: &str, symbol: &str, amount: u64) -> Swap {
	Swap {
		status: SwapStatus::TransactionMempool,
		legs: SwapLegs::Submarine { receiving: leg(symbol, amount) },
		..swap_template(id, preimage_hash())
	}
}

pub fn reverse_swap(id: &str, symbol: &str, amount: u64) -> Swap {
	Swap {
		status: SwapStatus::TransactionMempool,
		legs: SwapLegs::Reverse { sending: leg(symbol, amount) },
		..swap_template(id, preimage_hash())
	}
}


#[derive(Default)]
pub struct MemoryDb {
	swaps: parking_lot::Mutex<HashMap<String, Swap>>,
	preimage_writes: parking_lot::Mutex<Vec<(String, Preimage)>>,
	refunds: parking_lot::Mutex<Vec<RefundTransaction>>,
	lockups: parking_lot::Mutex<Vec<PendingLockup>>,
}

impl MemoryDb {
	pub fn insert(&self, swap: Swap) {
		self.swaps.lock().insert(swap.id.clone(), swap);
	}

	pub fn swap(&self, id: &str) -> Option<Swap> {
		self.swaps.lock().get(id).cloned()
	}

	pub fn pending_lockups(&self, symbol: &str) -> Vec<PendingLockup> {
		self.lockups.lock().iter().filter(|l| l.symbol == symbol).cloned().collect()
	}

	/// Every call to [SwapRepository::set_preimage], stored or not.
	pub fn preimage_writes(&self) -> Vec<(String, Preimage)> {
		self.preimage_writes.lock().clone()
	}

	pub fn refund(&self, id: &str) -> Option<RefundTransaction> {
		self.refunds.lock().iter().find(|r| r.id == id).cloned()
	}
}

#[async_trait]
impl SwapRepository for MemoryDb {
	async fn insert_swap(&self, swap: &Swap) -> anyhow::Result<()> {
		self.insert(swap.clone());
		Ok(())
	}

	async fn get_swap(&self, id: &str) -> anyhow::Result<Option<Swap>> {
		Ok(self.swap(id))
	}

	async fn get_swaps_by_status(
		&self,
		kind: SwapType,
		statuses: &[SwapStatus],
	) -> anyhow::Result<Vec<Swap>> {
		Ok(self.swaps.lock().values()
			.filter(|s| s.kind() == kind && statuses.contains(&s.status))
			.cloned()
			.collect())
	}

	async fn set_status(
		&self,
		id: &str,
		status: SwapStatus,
		failure_reason: Option<String>,
	) -> anyhow::Result<()> {
		let mut swaps = self.swaps.lock();
		let swap = swaps.get_mut(id).ok_or_else(|| anyhow!("swap {} does not exist", id))?;
		swap.status = status;
		swap.failure_reason = failure_reason;
		Ok(())
	}

	async fn set_preimage(&self, id: &str, preimage: Preimage) -> anyhow::Result<bool> {
		self.preimage_writes.lock().push((id.to_owned(), preimage));
		match self.swaps.lock().get_mut(id) {
			Some(swap) if swap.preimage.is_none() => {
				swap.preimage = Some(preimage);
				Ok(true)
			},
			_ => Ok(false),
		}
	}

	async fn set_claimed(&self, id: &str, fee: u64) -> anyhow::Result<()> {
		let mut swaps = self.swaps.lock();
		let swap = swaps.get_mut(id).ok_or_else(|| anyhow!("swap {} does not exist", id))?;
		swap.status = SwapStatus::TransactionClaimed;
		if let Some(leg) = swap.claim_leg_mut() {
			leg.fee = Some(fee);
		}
		Ok(())
	}
}

#[async_trait]
impl RefundTransactionRepository for MemoryDb {
	async fn add_refund(&self, refund: &RefundTransaction) -> anyhow::Result<()> {
		self.refunds.lock().push(refund.clone());
		Ok(())
	}

	async fn get_pending_refunds(&self) -> anyhow::Result<Vec<RefundTransaction>> {
		Ok(self.refunds.lock().iter().filter(|r| r.status == RefundStatus::Pending).cloned().collect())
	}

	async fn set_refund_status(&self, id: &str, status: RefundStatus) -> anyhow::Result<bool> {
		let mut refunds = self.refunds.lock();
		match refunds.iter_mut().find(|r| r.id == id && r.status == RefundStatus::Pending) {
			Some(refund) => {
				refund.status = status;
				Ok(true)
			},
			None => Ok(false),
		}
	}
}

#[async_trait]
impl PendingLockupRepository for MemoryDb {
	async fn add_pending_lockup(&self, lockup: &PendingLockup) -> anyhow::Result<()> {
		let mut lockups = self.lockups.lock();
		if !lockups.iter().any(|l| l.swap_id == lockup.swap_id) {
			lockups.push(lockup.clone());
		}
		Ok(())
	}

	async fn get_pending_lockup(&self, swap_id: &str) -> anyhow::Result<Option<PendingLockup>> {
		Ok(self.lockups.lock().iter().find(|l| l.swap_id == swap_id).cloned())
	}

	async fn get_pending_lockups(&self, symbol: &str) -> anyhow::Result<Vec<PendingLockup>> {
		Ok(self.pending_lockups(symbol))
	}

	async fn remove_pending_lockup(&self, swap_id: &str) -> anyhow::Result<()> {
		self.lockups.lock().retain(|l| l.swap_id != swap_id);
		Ok(())
	}
}


pub struct MockChain {
	symbol: String,
	txs: parking_lot::Mutex<HashMap<Txid, Transaction>>,
	infos: parking_lot::Mutex<HashMap<Txid, RawTransactionInfo>>,
	broadcasts: parking_lot::Mutex<Vec<Transaction>>,
	filters: parking_lot::Mutex<HashSet<Txid>>,
	failing: AtomicBool,
	broadcast_failing: AtomicBool,
	height: AtomicU32,
	blocks: broadcast::Sender<BlockHeight>,
	transactions: broadcast::Sender<Transaction>,
}

impl MockChain {
	pub fn new(symbol: &str) -> MockChain {
		MockChain {
			symbol: symbol.to_owned(),
			txs: Default::default(),
			infos: Default::default(),
			broadcasts: Default::default(),
			filters: Default::default(),
			failing: AtomicBool::new(false),
			broadcast_failing: AtomicBool::new(false),
			height: AtomicU32::new(0),
			blocks: broadcast::channel(16).0,
			transactions: broadcast::channel(16).0,
		}
	}

	pub fn set_tx(&self, tx: Transaction) {
		self.txs.lock().insert(tx.compute_txid(), tx);
	}

	pub fn tx(&self, txid: Txid) -> Option<Transaction> {
		self.txs.lock().get(&txid).cloned()
	}

	pub fn set_tx_info(&self, info: RawTransactionInfo) {
		self.infos.lock().insert(info.txid, info);
	}

	/// Make all lookups fail like an unreachable node.
	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub fn set_broadcast_failing(&self, failing: bool) {
		self.broadcast_failing.store(failing, Ordering::SeqCst);
	}

	pub fn broadcasts(&self) -> Vec<Transaction> {
		self.broadcasts.lock().clone()
	}

	pub fn filters(&self) -> HashSet<Txid> {
		self.filters.lock().clone()
	}

	pub fn mine(&self, height: BlockHeight) {
		self.height.store(height, Ordering::SeqCst);
		let _ = self.blocks.send(height);
	}
}

#[async_trait]
impl ChainClient for MockChain {
	fn symbol(&self) -> &str {
		&self.symbol
	}

	async fn get_raw_transaction(&self, txid: Txid) -> anyhow::Result<Option<Transaction>> {
		if self.failing.load(Ordering::SeqCst) {
			bail!("node unreachable");
		}
		Ok(self.tx(txid))
	}

	async fn get_raw_transaction_verbose(&self, txid: Txid) -> anyhow::Result<Option<RawTransactionInfo>> {
		if self.failing.load(Ordering::SeqCst) {
			bail!("node unreachable");
		}
		Ok(self.infos.lock().get(&txid).cloned())
	}

	async fn send_raw_transaction(&self, tx: &Transaction) -> anyhow::Result<Txid> {
		if self.broadcast_failing.load(Ordering::SeqCst) {
			bail!("transaction rejected");
		}
		self.broadcasts.lock().push(tx.clone());
		self.set_tx(tx.clone());
		Ok(tx.compute_txid())
	}

	async fn estimate_fee(&self) -> anyhow::Result<FeeRate> {
		Ok(FeeRate::from_sat_per_vb_unchecked(2))
	}

	async fn block_height(&self) -> anyhow::Result<BlockHeight> {
		if self.failing.load(Ordering::SeqCst) {
			bail!("node unreachable");
		}
		Ok(self.height.load(Ordering::SeqCst))
	}

	fn add_input_filter(&self, txid: Txid) {
		self.filters.lock().insert(txid);
	}

	fn remove_input_filter(&self, txid: Txid) {
		self.filters.lock().remove(&txid);
	}

	fn subscribe_blocks(&self) -> broadcast::Receiver<BlockHeight> {
		self.blocks.subscribe()
	}

	fn subscribe_transactions(&self) -> broadcast::Receiver<Transaction> {
		self.transactions.subscribe()
	}
}


pub struct MockAccount {
	symbol: String,
	receipts: parking_lot::Mutex<HashMap<String, TransactionReceipt>>,
	known: parking_lot::Mutex<HashSet<String>>,
	blocks: broadcast::Sender<BlockHeight>,
}

impl MockAccount {
	pub fn new(symbol: &str) -> MockAccount {
		MockAccount {
			symbol: symbol.to_owned(),
			receipts: Default::default(),
			known: Default::default(),
			blocks: broadcast::channel(16).0,
		}
	}

	/// Known but not mined.
	pub fn set_exists(&self, hash: &str) {
		self.known.lock().insert(hash.to_owned());
	}

	pub fn set_receipt(&self, hash: &str, receipt: TransactionReceipt) {
		self.set_exists(hash);
		self.receipts.lock().insert(hash.to_owned(), receipt);
	}

	/// Forget the transaction, as after a reorg that dropped it.
	pub fn remove(&self, hash: &str) {
		self.known.lock().remove(hash);
		self.receipts.lock().remove(hash);
	}

	pub fn mine(&self, height: BlockHeight) {
		let _ = self.blocks.send(height);
	}
}

#[async_trait]
impl AccountProvider for MockAccount {
	fn symbol(&self) -> &str {
		&self.symbol
	}

	async fn get_transaction_receipt(&self, hash: &str) -> anyhow::Result<Option<TransactionReceipt>> {
		Ok(self.receipts.lock().get(hash).copied())
	}

	async fn transaction_exists(&self, hash: &str) -> anyhow::Result<bool> {
		Ok(self.known.lock().contains(hash))
	}

	fn subscribe_blocks(&self) -> broadcast::Receiver<BlockHeight> {
		self.blocks.subscribe()
	}
}


/// Keys derived from the symbol and index, addresses on regtest.
pub struct MockWallet {
	symbol: String,
}

impl MockWallet {
	pub fn new(symbol: &str) -> MockWallet {
		MockWallet { symbol: symbol.to_owned() }
	}
}

#[async_trait]
impl Wallet for MockWallet {
	fn symbol(&self) -> &str {
		&self.symbol
	}

	fn keys_by_index(&self, index: u32) -> anyhow::Result<Keypair> {
		let secret = sha256::Hash::hash(format!("{}/{}", self.symbol, index).as_bytes());
		Ok(Keypair::from_seckey_slice(&SECP, secret.as_byte_array())?)
	}

	async fn get_address(&self, _label: &str) -> anyhow::Result<String> {
		let key = self.keys_by_index(0)?.x_only_public_key().0;
		Ok(Address::p2tr(&SECP, key, None, Network::Regtest).to_string())
	}

	fn encode_address(&self, script: &Script) -> anyhow::Result<String> {
		Ok(Address::from_script(script, Network::Regtest)?.to_string())
	}

	fn decode_address(&self, address: &str) -> anyhow::Result<ScriptBuf> {
		Ok(Address::from_str(address)?.require_network(Network::Regtest)?.script_pubkey())
	}
}


#[derive(Default)]
pub struct RecordingRates {
	calls: parking_lot::Mutex<Vec<(String, RiskAmount)>>,
}

impl RecordingRates {
	pub fn calls(&self) -> Vec<(String, RiskAmount)> {
		self.calls.lock().clone()
	}
}

impl RateProvider for RecordingRates {
	fn set_zero_conf_amount(&self, symbol: &str, amount: RiskAmount) {
		self.calls.lock().push((symbol.to_owned(), amount));
	}
}


#[derive(Default)]
pub struct RecordingSettlement {
	attempts: parking_lot::Mutex<Vec<(String, String, Option<Preimage>)>>,
	invoices: parking_lot::Mutex<Vec<(String, Preimage)>>,
	batches: parking_lot::Mutex<Vec<(String, Vec<String>)>>,
	batch_claimed: parking_lot::Mutex<Option<BatchClaimed>>,
	batch_failing: AtomicBool,
}

impl RecordingSettlement {
	/// Swap id, symbol and preimage of every settlement attempt.
	pub fn attempts(&self) -> Vec<(String, String, Option<Preimage>)> {
		self.attempts.lock().clone()
	}

	pub fn settled_invoices(&self) -> Vec<(String, Preimage)> {
		self.invoices.lock().clone()
	}

	/// Symbol and swap ids of every batch claim.
	pub fn batches(&self) -> Vec<(String, Vec<String>)> {
		self.batches.lock().clone()
	}

	/// Report batches as broadcast with this outcome instead of handed over.
	pub fn set_batch_claimed(&self, claimed: Option<BatchClaimed>) {
		*self.batch_claimed.lock() = claimed;
	}

	pub fn set_batch_failing(&self, failing: bool) {
		self.batch_failing.store(failing, Ordering::SeqCst);
	}
}

#[async_trait]
impl SettlementAttempt for RecordingSettlement {
	async fn attempt_settle(
		&self,
		currency: &Currency,
		swap: &Swap,
		_channel_hint: Option<String>,
		preimage: Option<Preimage>,
	) -> anyhow::Result<()> {
		self.attempts.lock().push((swap.id.clone(), currency.symbol.clone(), preimage));
		Ok(())
	}

	async fn settle_invoice(&self, swap: &Swap, preimage: Preimage) -> anyhow::Result<()> {
		self.invoices.lock().push((swap.id.clone(), preimage));
		Ok(())
	}

	async fn claim_batch(
		&self,
		currency: &Currency,
		claims: &[DeferredClaim],
	) -> anyhow::Result<Option<BatchClaimed>> {
		self.batches.lock().push((
			currency.symbol.clone(),
			claims.iter().map(|c| c.swap.id.clone()).collect(),
		));
		if self.batch_failing.load(Ordering::SeqCst) {
			bail!("batch claim failed");
		}
		Ok(*self.batch_claimed.lock())
	}
}


/// The counterparty of a swap, holding the user side keys and preimage.
pub struct User {
	pub key: Keypair,
	pub preimage: Preimage,
}

impl User {
	pub fn new() -> User {
		User {
			key: Keypair::new(&SECP, &mut rand::thread_rng()),
			preimage: Preimage::from_byte_array(rand::random()),
		}
	}

	pub fn preimage_hash(&self) -> sha256::Hash {
		self.preimage.hash()
	}

	fn server_key(leg: &SwapLeg) -> PublicKey {
		MockWallet::new(&leg.symbol).keys_by_index(leg.key_index).unwrap().public_key()
	}

	fn key_agg(&self, leg: &SwapLeg) -> musig::TaprootKeyAgg {
		let root = leg.swap_tree().unwrap().merkle_root().unwrap();
		musig::taproot_key_agg([Self::server_key(leg), self.key.public_key()], root).unwrap()
	}

	/// A leg locked up on chain with its lockup transaction.
	fn locked_leg(&self, wallet: &MockWallet, symbol: &str, key_index: u32, amount: u64, server_claims: bool) -> (SwapLeg, Transaction) {
		let server = wallet.keys_by_index(key_index).unwrap().x_only_public_key().0;
		let user = self.key.x_only_public_key().0;
		let tree = if server_claims {
			SwapTree::new(self.preimage_hash(), server, user, TIMEOUT)
		} else {
			SwapTree::new(self.preimage_hash(), user, server, TIMEOUT)
		};
		let mut leg = SwapLeg {
			key_index,
			their_public_key: Some(self.key.public_key()),
			swap_tree: Some(tree),
			..leg(symbol, amount)
		};
		let agg = self.key_agg(&leg);

		let root = leg.swap_tree().unwrap().merkle_root().unwrap();
		let mut lockup = Transaction {
			output: vec![TxOut {
				value: Amount::from_sat(amount),
				script_pubkey: ScriptBuf::new_p2tr(&SECP, agg.internal_key, Some(root)),
			}],
			..dummy_tx(0)
		};
		// unique per lockup
		lockup.input[0].previous_output = OutPoint::new(Txid::from_byte_array(rand::random()), 0);
		leg.lockup_txid = Some(lockup.compute_txid().to_string());
		leg.lockup_vout = Some(0);
		(leg, lockup)
	}

	/// A leg the server claims with the preimage, locked by the user.
	pub fn server_claims(&self, wallet: &MockWallet, symbol: &str, key_index: u32, amount: u64) -> (SwapLeg, Transaction) {
		self.locked_leg(wallet, symbol, key_index, amount, true)
	}

	/// A leg the user claims, locked by the server.
	pub fn user_claims(&self, wallet: &MockWallet, symbol: &str, key_index: u32, amount: u64) -> (SwapLeg, Transaction) {
		self.locked_leg(wallet, symbol, key_index, amount, false)
	}

	/// Our partial signature for the server's cooperative claim.
	pub fn sign_server_claim(&self, leg: &SwapLeg, details: &CooperativeDetails) -> PartialSignature {
		let agg = self.key_agg(leg);
		let (pub_nonce, signature) = musig::deterministic_partial_sign(
			&self.key, &agg.cache, &details.pub_nonce, details.sighash,
		).unwrap();
		PartialSignature { pub_nonce, signature }
	}

	fn prevouts(chain: &MockChain, tx: &Transaction) -> Vec<TxOut> {
		tx.input.iter().map(|i| {
			let prev = chain.tx(i.previous_output.txid).expect("prevout tx not on chain");
			prev.output[i.previous_output.vout as usize].clone()
		}).collect()
	}

	/// Ask the server to co-sign our claim of `leg` to our own address.
	pub fn claim_request(&self, chain: &MockChain, leg: &SwapLeg) -> TheirSigningData {
		let lockup = leg.lockup_outpoint().unwrap();
		let prevout = chain.tx(lockup.txid).unwrap().output[lockup.vout as usize].clone();
		let destination = ScriptBuf::new_p2tr(&SECP, self.key.x_only_public_key().0, None);
		let tx = claim::build_claim_tx(lockup, &prevout, destination, FeeRate::from_sat_per_vb_unchecked(2))
			.unwrap();
		self.signing_request(chain, leg, tx)
	}

	/// Ask the server to co-sign input 0 of `tx`, spending the lockup of `leg`.
	pub fn signing_request(&self, chain: &MockChain, leg: &SwapLeg, tx: Transaction) -> TheirSigningData {
		let prevouts = Self::prevouts(chain, &tx);
		let sighash = claim::key_spend_sighash(&tx, 0, &prevouts).unwrap();
		let (_, pub_nonce) = musig::nonce_pair(&self.key, &self.key_agg(leg).cache, sighash);
		TheirSigningData { pub_nonce, transaction: tx, index: 0 }
	}

	/// Whether the server's partial signature on our request is valid.
	pub fn verify_ours(
		&self,
		leg: &SwapLeg,
		request: &TheirSigningData,
		ours: &PartialSignature,
		chain: &MockChain,
	) -> bool {
		let prevouts = Self::prevouts(chain, &request.transaction);
		let sighash = claim::key_spend_sighash(&request.transaction, request.index, &prevouts).unwrap();
		musig::verify_partial_sig(
			&self.key_agg(leg).cache,
			sighash,
			(Self::server_key(leg), ours.pub_nonce),
			request.pub_nonce,
			ours.signature,
		)
	}

	pub fn output_key(&self, leg: &SwapLeg) -> bitcoin::secp256k1::XOnlyPublicKey {
		self.key_agg(leg).output_key
	}

	/// A nonce that isn't bound to any swap.
	pub fn nonce(&self) -> MusigPubNonce {
		let cache = musig::key_agg([self.key.public_key()]);
		musig::nonce_pair(&self.key, &cache, TapSighash::all_zeros()).1
	}
}
