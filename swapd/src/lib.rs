
#[macro_use] extern crate anyhow;
#[macro_use] extern crate async_trait;
#[macro_use] extern crate log;
#[macro_use] extern crate serde;
#[macro_use] extern crate swapd_log;

#[macro_use]
pub mod error;

pub mod chain;
pub mod config;
pub mod cooperative;
pub mod database;
pub mod rates;
pub mod refund_watcher;
pub mod settle;
pub mod wallet;
pub mod zeroconf;

pub(crate) mod mutex;
pub(crate) mod serde_util;
pub(crate) mod system;

#[cfg(test)]
pub mod test_util;

pub use crate::config::Config;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bitcoin::bip32;

use bitcoin_ext::rpc::BitcoinRpcClient;
use bitcoin_ext::rpc::bitcoincore_rpc::RpcApi;

use crate::chain::{Currencies, Currency};
use crate::chain::bitcoind::BitcoindChain;
use crate::cooperative::{ChainSwapSigner, DeferredClaimer, MusigSigner, SignerLocks, StatusEligibility};
use crate::mutex::KeyedMutex;
use crate::rates::ZeroConfLimits;
use crate::refund_watcher::RefundWatcher;
use crate::settle::{SettlementAttempt, SettlementQueue};
use crate::system::RuntimeManager;
use crate::wallet::{SeedWallet, MNEMONIC_FILE};
use crate::zeroconf::{RiskAmount, RiskLedger};


pub struct Server {
	config: Config,
	db: database::Db,
	rtmgr: RuntimeManager,
	currencies: Currencies,
	zero_conf_limits: Arc<ZeroConfLimits>,
	risk_ledger: Arc<RiskLedger>,
	chain_signer: Arc<ChainSwapSigner>,
	musig_signer: Arc<MusigSigner>,
	deferred_claimer: Arc<DeferredClaimer>,
	refund_watcher: Arc<RefundWatcher>,
}

impl Server {
	fn bitcoind(cfg: &Config) -> anyhow::Result<BitcoinRpcClient> {
		let bitcoind = BitcoinRpcClient::new(&cfg.bitcoind.url, cfg.bitcoind.auth())
			.context("failed to create bitcoind rpc client")?;
		// Check if our bitcoind is on the expected network.
		let chain_info = bitcoind.get_blockchain_info()?;
		if chain_info.chain != cfg.network {
			bail!("Our bitcoind is running on network {} while we are configured for network {}",
				chain_info.chain, cfg.network,
			);
		}
		Ok(bitcoind)
	}

	pub async fn create(cfg: Config) -> anyhow::Result<()> {
		// Check for a mnemonic file to see if the server was already initialized.
		if cfg.data_dir.join(MNEMONIC_FILE).exists() {
			bail!("Found an existing mnemonic file in datadir, the server is probably already initialized!");
		}

		let _ = Self::bitcoind(&cfg)?;

		info!("Creating server at {}", cfg.data_dir.display());
		fs::create_dir_all(&cfg.data_dir).context("can't create dir")?;

		database::Db::create(&cfg.postgres).await?;

		let mnemonic = bip39::Mnemonic::generate(12).context("failed to generate mnemonic")?;
		fs::write(cfg.data_dir.join(MNEMONIC_FILE), mnemonic.to_string().as_bytes())
			.context("failed to store mnemonic")?;

		Ok(())
	}

	/// Starts the server without a settlement service.
	///
	/// Script-path claims, batch claims and invoice settlements are then
	/// only logged by [settle::run_settlement_log].
	pub async fn start(cfg: Config) -> anyhow::Result<Arc<Self>> {
		Self::start_inner(cfg, None).await
	}

	/// Starts the server, handing everything we don't settle cooperatively
	/// to `settle`.
	pub async fn start_with_settlement(
		cfg: Config,
		settle: Arc<dyn SettlementAttempt>,
	) -> anyhow::Result<Arc<Self>> {
		Self::start_inner(cfg, Some(settle)).await
	}

	async fn start_inner(
		cfg: Config,
		settle: Option<Arc<dyn SettlementAttempt>>,
	) -> anyhow::Result<Arc<Self>> {
		info!("Starting server at {}", cfg.data_dir.display());

		info!("Connecting to db at {}:{}", cfg.postgres.host, cfg.postgres.port);
		let db = database::Db::connect(&cfg.postgres)
			.await
			.context("failed to connect to db")?;
		let repo = Arc::new(db.clone());

		let bitcoind = Self::bitcoind(&cfg)?;
		let seed = wallet::read_mnemonic_from_datadir(&cfg.data_dir)?.to_seed("");
		let master_xpriv = bip32::Xpriv::new_master(cfg.network, &seed)
			.context("failed to derive master key from seed")?;

		let rtmgr = RuntimeManager::new();
		let _startup_worker = rtmgr.spawn("Bootstrapping");
		rtmgr.run_shutdown_signal_listener(Duration::from_secs(60));

		let mut currencies = Vec::with_capacity(cfg.currencies.len());
		for (symbol, currency) in &cfg.currencies {
			let rpc = bitcoind.for_wallet(&currency.wallet)
				.with_context(|| format!("failed to create rpc client for wallet {}", currency.wallet))?;
			let chain = BitcoindChain::start(
				rtmgr.clone(), symbol.clone(), rpc.clone(), cfg.block_poll_interval,
			).await.with_context(|| format!("failed to start {} chain", symbol))?;
			let wallet = SeedWallet::new(symbol.clone(), cfg.network, &master_xpriv, rpc)?;
			currencies.push(Currency::utxo(chain, Arc::new(wallet)));
		}
		let currencies = Currencies::new(currencies);

		let zero_conf = cfg.zero_conf.iter()
			.map(|(s, a)| (s.clone(), RiskAmount::from(*a)))
			.collect::<Vec<_>>();
		let zero_conf_limits = Arc::new(ZeroConfLimits::new(zero_conf.clone()));
		let risk_ledger = Arc::new(RiskLedger::new(
			currencies.clone(), repo.clone(), zero_conf_limits.clone(), zero_conf,
		));
		risk_ledger.init().await.context("failed to restore zero-conf risk")?;
		for symbol in risk_ledger.max_risks().keys() {
			tokio::spawn(risk_ledger.clone().run_reconciliation(rtmgr.clone(), symbol.clone()));
		}

		let settle: Arc<dyn SettlementAttempt> = match settle {
			Some(s) => s,
			None => {
				warn!("No settlement service given, settlement requests are only logged");
				let (queue, rx) = SettlementQueue::new();
				tokio::spawn(settle::run_settlement_log(rtmgr.clone(), rx));
				Arc::new(queue)
			},
		};

		let locks: SignerLocks = Arc::new(KeyedMutex::new());
		let chain_signer = Arc::new(ChainSwapSigner::new(
			currencies.clone(), repo.clone(), settle.clone(), locks.clone(),
			cfg.cooperative.disable_refunds,
		));
		chain_signer.init().await.context("failed to init chain swap signer")?;
		let musig_signer = Arc::new(MusigSigner::new(
			currencies.clone(), repo.clone(), settle.clone(), locks.clone(),
			cfg.cooperative.disable_refunds, Arc::new(StatusEligibility),
		));
		musig_signer.init().await.context("failed to init musig signer")?;

		let block_times = cfg.currencies.iter().map(|(s, c)| (s.clone(), c.block_time)).collect();
		let deferred_claimer = Arc::new(DeferredClaimer::new(
			currencies.clone(), repo.clone(), settle.clone(), locks.clone(),
			&cfg.deferred_claims, block_times,
		));
		if !cfg.deferred_claims.symbols.is_empty() {
			info!("Deferring claims of {} with a batch claim interval of {}",
				cfg.deferred_claims.symbols.join(", "),
				humantime::format_duration(cfg.deferred_claims.batch_claim_interval),
			);
			deferred_claimer.init().await.context("failed to restore deferred claims")?;
			tokio::spawn(deferred_claimer.clone().run(rtmgr.clone()));
		}

		let refund_watcher = Arc::new(RefundWatcher::new(
			currencies.clone(), repo.clone(), repo.clone(), locks.clone(),
		));
		tokio::spawn(refund_watcher.clone().run(rtmgr.clone(), cfg.refund_watcher.check_interval));

		slog!(ServerStarted, network: cfg.network, nb_currencies: currencies.len());

		Ok(Arc::new(Server {
			config: cfg,
			db,
			rtmgr,
			currencies,
			zero_conf_limits,
			risk_ledger,
			chain_signer,
			musig_signer,
			deferred_claimer,
			refund_watcher,
		}))
	}

	/// Waits for server to terminate.
	pub async fn wait(&self) {
		self.rtmgr.wait().await;
		slog!(ServerTerminated);
	}

	/// Starts the server and waits until it terminates.
	///
	/// This is equivalent to calling [Server::start] and [Server::wait] in one go.
	pub async fn run(cfg: Config) -> anyhow::Result<()> {
		let srv = Server::start(cfg).await?;
		srv.wait().await;
		Ok(())
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn db(&self) -> &database::Db {
		&self.db
	}

	pub fn currencies(&self) -> &Currencies {
		&self.currencies
	}

	/// The zero-conf limits as advertised to clients.
	pub fn zero_conf_limits(&self) -> &ZeroConfLimits {
		&self.zero_conf_limits
	}

	pub fn risk_ledger(&self) -> &Arc<RiskLedger> {
		&self.risk_ledger
	}

	pub fn chain_signer(&self) -> &Arc<ChainSwapSigner> {
		&self.chain_signer
	}

	pub fn musig_signer(&self) -> &Arc<MusigSigner> {
		&self.musig_signer
	}

	pub fn deferred_claimer(&self) -> &Arc<DeferredClaimer> {
		&self.deferred_claimer
	}

	pub fn refund_watcher(&self) -> &Arc<RefundWatcher> {
		&self.refund_watcher
	}
}
