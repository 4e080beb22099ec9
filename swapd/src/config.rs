
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use config::{Environment, File};

use bitcoin_ext::rpc::bitcoincore_rpc::Auth;

use crate::serde_util;


#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Bitcoind {
	/// the URL of the bitcoind RPC (mandatory)
	pub url: String,
	/// the path of the cookie file for the bitcoind RPC
	/// It is mandatory to configure exactly one authentication method
	/// This could either be [bitcoind.cookie] or [bitcoind.rpc_user] and [bitcoind.rpc_pass]
	pub cookie: Option<PathBuf>,
	/// the user for the bitcoind RPC
	pub rpc_user: Option<String>,
	/// the password for the bitcoind RPC
	pub rpc_pass: Option<String>,
}

impl Bitcoind {
	/// Validate the bitcoind config, mostly checking auth
	pub fn validate(&self) -> anyhow::Result<()> {
		let with_user_pass = match (&self.rpc_user, &self.rpc_pass) {
			(Some(_), None) => bail!("Missing configuration bitcoind.rpc_pass. \
				This is required if bitcoind.rpc_user is provided"),
			(None, Some(_)) => bail!("Missing configuration bitcoind.rpc_user. \
				This is required if bitcoind.rpc_pass is provided"),
			(None, None) => false,
			(Some(_), Some(_)) => true,
		};

		if !with_user_pass && self.cookie.is_none() {
			bail!("Configuring authentication to bitcoind is mandatory. \
				Specify either bitcoind.cookie or (bitcoind.rpc_user and bitcoind.rpc_pass).")
		} else if with_user_pass && self.cookie.is_some() {
			bail!("Invalid configuration for authentication to bitcoind. Use either \
				bitcoind.cookie or (bitcoind.rpc_user and bitcoind.rpc_pass) but not both.")
		}

		Ok(())
	}

	/// The auth method for the bitcoind RPC. Only meaningful after [Bitcoind::validate].
	pub fn auth(&self) -> Auth {
		match (&self.rpc_user, &self.rpc_pass, &self.cookie) {
			(Some(user), Some(pass), _) => Auth::UserPass(user.into(), pass.into()),
			(_, _, Some(cookie)) => Auth::CookieFile(cookie.into()),
			_ => Auth::None,
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Postgres {
	pub host: String,
	pub port: u16,
	pub name: String,
	pub user: Option<String>,
	pub password: Option<String>,
}

fn default_block_time() -> Duration {
	Duration::from_secs(10 * 60)
}

/// A chain served by our bitcoind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Currency {
	/// The bitcoind wallet that provides our sweep addresses.
	pub wallet: String,
	/// Expected time between blocks.
	#[serde(default = "default_block_time", with = "serde_util::duration")]
	pub block_time: Duration,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Cooperative {
	/// Refuse to co-sign any refund.
	pub disable_refunds: bool,
}

/// Claims collected per chain and swept in batches.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeferredClaims {
	/// Chains whose claims are deferred. Empty disables deferred claims.
	pub symbols: Vec<String>,
	/// Every chain with pending claims is swept at this interval.
	#[serde(with = "serde_util::duration")]
	pub batch_claim_interval: Duration,
	/// A chain is swept as soon as one of its pending swaps expires within
	/// this time.
	#[serde(with = "serde_util::duration")]
	pub expiry_tolerance: Duration,
	/// A chain is swept as soon as its pending claims are worth this much,
	/// by symbol, in base units.
	pub sweep_amount_trigger: BTreeMap<String, u64>,
}

impl Default for DeferredClaims {
	fn default() -> Self {
		DeferredClaims {
			symbols: Vec::new(),
			batch_claim_interval: Duration::from_secs(15 * 60),
			expiry_tolerance: Duration::from_secs(2 * 60 * 60),
			sweep_amount_trigger: BTreeMap::new(),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefundWatcher {
	/// Pending refunds are also rechecked at this interval, so that
	/// missed block notifications don't leave refunds pending.
	#[serde(with = "serde_util::duration")]
	pub check_interval: Duration,
}

impl Default for RefundWatcher {
	fn default() -> Self {
		RefundWatcher {
			check_interval: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	pub data_dir: PathBuf,
	pub log_dir: Option<PathBuf>,
	pub network: bitcoin::Network,

	/// Chains we operate on, by symbol.
	pub currencies: BTreeMap<String, Currency>,
	/// Maximum unconfirmed lockup value at risk, by symbol, in base units.
	///
	/// Chains without an entry don't accept zero-conf lockups.
	pub zero_conf: BTreeMap<String, u64>,
	pub cooperative: Cooperative,
	pub deferred_claims: DeferredClaims,
	pub refund_watcher: RefundWatcher,

	/// The interval at which we poll bitcoind for new blocks.
	#[serde(with = "serde_util::duration")]
	pub block_poll_interval: Duration,

	pub postgres: Postgres,
	pub bitcoind: Bitcoind,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			data_dir: "./swapd".into(),
			log_dir: None,
			network: bitcoin::Network::Regtest,
			currencies: BTreeMap::new(),
			zero_conf: BTreeMap::new(),
			cooperative: Cooperative::default(),
			deferred_claims: DeferredClaims::default(),
			refund_watcher: RefundWatcher::default(),
			block_poll_interval: Duration::from_secs(1),
			postgres: Postgres {
				host: "localhost".into(),
				port: 5432,
				name: "swapd".into(),
				user: None,
				password: None,
			},
			bitcoind: Bitcoind {
				url: "http://127.0.0.1:18443".into(),
				cookie: None,
				rpc_user: None,
				rpc_pass: None,
			},
		}
	}
}

impl Config {
	fn load_with_custom_env(
		config_file: Option<&Path>,
		#[cfg(test)]
		custom_env: Option<std::collections::HashMap<String, String>>,
	) -> anyhow::Result<Self> {
		let default = config::Config::try_from(&Self::default())
			.context("default config failed to deconstruct")?;

		// We'll add three layers of config:
		// - the defaults defined in Config's Default impl
		// - the config file passed in this function, if any
		// - environment variables (prefixed with `SWAPD__`)

		let mut builder = config::Config::builder()
			.add_source(default);
		if let Some(file) = config_file {
			builder = builder.add_source(File::from(file));
		}

		let env = Environment::with_prefix("SWAPD")
			.separator("__");
		#[cfg(test)]
		let env = env.source(custom_env);
		builder = builder.add_source(env);

		let cfg = builder.build().context("error building config")?;
		let mut cfg: Config = cfg.try_deserialize().context("error parsing config")?;

		// symbols are case-insensitive, environment keys come in lowercase
		cfg.currencies = cfg.currencies.into_iter().map(|(k, v)| (k.to_uppercase(), v)).collect();
		cfg.zero_conf = cfg.zero_conf.into_iter().map(|(k, v)| (k.to_uppercase(), v)).collect();
		let deferred = &mut cfg.deferred_claims;
		deferred.symbols = deferred.symbols.iter().map(|s| s.to_uppercase()).collect();
		deferred.sweep_amount_trigger = std::mem::take(&mut deferred.sweep_amount_trigger)
			.into_iter().map(|(k, v)| (k.to_uppercase(), v)).collect();

		Ok(cfg)
	}

	pub fn load(config_file: Option<&Path>) -> anyhow::Result<Self> {
		Self::load_with_custom_env(config_file, #[cfg(test)] None)
	}

	/// Verifies if the specified configuration is valid
	///
	/// It also checks if all required configurations are available
	pub fn validate(&self) -> anyhow::Result<()> {
		self.bitcoind.validate()?;

		if self.postgres.host.is_empty() || self.postgres.name.is_empty() {
			bail!("Both postgres.host and postgres.name have to be configured.");
		}

		for symbol in self.zero_conf.keys() {
			if !self.currencies.contains_key(symbol) {
				bail!("zero_conf.{} is configured but there is no currency {}", symbol, symbol);
			}
		}

		let deferred = &self.deferred_claims;
		for symbol in deferred.symbols.iter().chain(deferred.sweep_amount_trigger.keys()) {
			if !self.currencies.contains_key(symbol) {
				bail!("deferred claims are configured for {} but there is no such currency", symbol);
			}
		}
		if !deferred.symbols.is_empty() && deferred.batch_claim_interval.is_zero() {
			bail!("deferred_claims.batch_claim_interval can't be zero");
		}
		for (symbol, currency) in &self.currencies {
			if currency.block_time.is_zero() {
				bail!("currencies.{}.block_time can't be zero", symbol);
			}
		}

		Ok(())
	}

	/// Write the config into the writer.
	pub fn write_into(&self, writer: &mut dyn io::Write) -> anyhow::Result<()> {
		let s = toml::to_string_pretty(self).context("config serialization error")?;
		writer.write_all(&s.as_bytes()).context("error writing config to writer")?;
		Ok(())
	}
}
