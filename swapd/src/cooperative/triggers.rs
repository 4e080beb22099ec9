//! Conditions that sweep the deferred claims of a chain before the next
//! scheduled batch.

use std::collections::HashMap;
use std::time::Duration;

use bitcoin_ext::BlockHeight;
use swap::Swap;

use crate::chain::Currencies;


/// Used for chains without a configured block time.
const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(10 * 60);

#[async_trait]
pub trait SweepTrigger: Send + Sync + 'static {
	fn name(&self) -> &'static str;

	/// Whether the pending claims of `symbol` should be swept now that
	/// `swap` joined them.
	///
	/// `pending_value` is the sum of the amounts of all pending claims of
	/// `symbol`, including `swap`.
	async fn check(&self, symbol: &str, swap: &Swap, pending_value: u64) -> anyhow::Result<bool>;
}

/// Fires for swaps whose timeout is within the tolerance.
pub struct ExpiryTrigger {
	currencies: Currencies,
	tolerance: Duration,
	block_times: HashMap<String, Duration>,
}

impl ExpiryTrigger {
	pub fn new(
		currencies: Currencies,
		tolerance: Duration,
		block_times: HashMap<String, Duration>,
	) -> ExpiryTrigger {
		ExpiryTrigger { currencies, tolerance, block_times }
	}

	/// The tolerance in blocks of the chain.
	fn tolerance_blocks(&self, symbol: &str) -> BlockHeight {
		let block_time = self.block_times.get(symbol).copied().unwrap_or(DEFAULT_BLOCK_TIME);
		let blocks = self.tolerance.as_secs() / block_time.as_secs().max(1);
		BlockHeight::try_from(blocks).unwrap_or(BlockHeight::MAX)
	}
}

#[async_trait]
impl SweepTrigger for ExpiryTrigger {
	fn name(&self) -> &'static str {
		"expiry"
	}

	async fn check(&self, symbol: &str, swap: &Swap, _pending_value: u64) -> anyhow::Result<bool> {
		let leg = match swap.claim_leg() {
			Some(l) => l,
			None => return Ok(false),
		};
		let (chain, _) = self.currencies.utxo(symbol)?;
		let height = chain.block_height().await?;
		Ok(leg.timeout_block_height.saturating_sub(height) <= self.tolerance_blocks(symbol))
	}
}

/// Fires once the pending claims of a chain are worth the threshold.
///
/// Chains without a threshold never trigger.
pub struct AmountTrigger {
	thresholds: HashMap<String, u64>,
}

impl AmountTrigger {
	pub fn new(thresholds: impl IntoIterator<Item = (String, u64)>) -> AmountTrigger {
		AmountTrigger { thresholds: thresholds.into_iter().collect() }
	}
}

#[async_trait]
impl SweepTrigger for AmountTrigger {
	fn name(&self) -> &'static str {
		"amount"
	}

	async fn check(&self, symbol: &str, _swap: &Swap, pending_value: u64) -> anyhow::Result<bool> {
		Ok(self.thresholds.get(symbol).map_or(false, |t| pending_value >= *t))
	}
}


#[cfg(test)]
mod test {
	use super::*;

	use std::sync::Arc;

	use crate::chain::Currency;
	use crate::test_util::{self, MockAccount, MockChain, MockWallet};

	fn expiring(symbol: &str, timeout: BlockHeight) -> Swap {
		let mut swap = test_util::submarine_swap("sub", symbol, 10_000);
		swap.claim_leg_mut().unwrap().timeout_block_height = timeout;
		swap
	}

	fn expiry_trigger() -> (ExpiryTrigger, Arc<MockChain>) {
		let btc = Arc::new(MockChain::new("BTC"));
		let liquid = Arc::new(MockChain::new("L-BTC"));
		btc.mine(100);
		liquid.mine(121);
		let currencies = Currencies::new([
			Currency::utxo(btc.clone(), Arc::new(MockWallet::new("BTC"))),
			Currency::utxo(liquid, Arc::new(MockWallet::new("L-BTC"))),
			Currency::account(Arc::new(MockAccount::new("RBTC"))),
		]);
		let block_times = [("L-BTC".to_owned(), Duration::from_secs(60))].into_iter().collect();
		(ExpiryTrigger::new(currencies, Duration::from_secs(60 * 60), block_times), btc)
	}

	#[tokio::test]
	async fn expiry_within_tolerance() {
		let (trigger, _) = expiry_trigger();

		for (symbol, timeout, expected) in [
			("BTC", 90, true),
			("BTC", 100, true),
			("BTC", 106, true),
			("BTC", 107, false),
			("BTC", 10_000, false),
			("L-BTC", 121, true),
			("L-BTC", 181, true),
			("L-BTC", 182, false),
		] {
			let swap = expiring(symbol, timeout);
			assert_eq!(trigger.check(symbol, &swap, 0).await.unwrap(), expected,
				"{} timeout at {}", symbol, timeout,
			);
		}
	}

	#[tokio::test]
	async fn expiry_needs_chain() {
		let (trigger, btc) = expiry_trigger();

		let reverse = test_util::reverse_swap("rev", "BTC", 10_000);
		assert!(!trigger.check("BTC", &reverse, 0).await.unwrap());

		trigger.check("RBTC", &expiring("RBTC", 100), 0).await.unwrap_err();

		btc.set_failing(true);
		trigger.check("BTC", &expiring("BTC", 100), 0).await.unwrap_err();
	}

	#[tokio::test]
	async fn amount_threshold() {
		let trigger = AmountTrigger::new([("BTC".to_owned(), 100_000)]);
		let swap = test_util::submarine_swap("sub", "BTC", 10_000);

		assert!(!trigger.check("BTC", &swap, 99_999).await.unwrap());
		assert!(trigger.check("BTC", &swap, 100_000).await.unwrap());
		assert!(trigger.check("BTC", &swap, 250_000).await.unwrap());
		assert!(!trigger.check("L-BTC", &swap, 1_000_000).await.unwrap());
	}
}
