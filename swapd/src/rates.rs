
use std::collections::HashMap;

use crate::zeroconf::RiskAmount;


/// The pricing side, where zero-conf limits are advertised.
pub trait RateProvider: Send + Sync + 'static {
	/// Set the maximum lockup amount accepted without confirmation.
	fn set_zero_conf_amount(&self, symbol: &str, amount: RiskAmount);
}

/// Advertised zero-conf limits, kept in memory for the API layer.
#[derive(Debug, Default)]
pub struct ZeroConfLimits {
	limits: parking_lot::RwLock<HashMap<String, RiskAmount>>,
}

impl ZeroConfLimits {
	pub fn new(limits: impl IntoIterator<Item = (String, RiskAmount)>) -> ZeroConfLimits {
		ZeroConfLimits {
			limits: parking_lot::RwLock::new(limits.into_iter().collect()),
		}
	}

	/// The advertised limit, zero for chains without zero-conf.
	pub fn get(&self, symbol: &str) -> RiskAmount {
		self.limits.read().get(symbol).copied().unwrap_or(0)
	}
}

impl RateProvider for ZeroConfLimits {
	fn set_zero_conf_amount(&self, symbol: &str, amount: RiskAmount) {
		info!("Setting zero-conf limit of {} to {}", symbol, amount);
		self.limits.write().insert(symbol.to_owned(), amount);
	}
}
