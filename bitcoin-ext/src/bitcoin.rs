
use std::borrow::Borrow;
use std::collections::HashSet;

use cbitcoin::{Amount, FeeRate, Transaction, Txid};


/// Extension trait for [Transaction].
pub trait TransactionExt: Borrow<Transaction> {
	/// Returns total output value of the transaction.
	fn output_value(&self) -> Amount {
		self.borrow().output.iter().map(|o| o.value).sum()
	}

	/// Returns the txids of the outputs this tx spends that are in `txids`.
	fn spent_txids_in<'a>(&'a self, txids: &'a HashSet<Txid>) -> impl Iterator<Item = Txid> + 'a {
		self.borrow().input.iter()
			.map(|i| i.previous_output.txid)
			.filter(move |txid| txids.contains(txid))
	}
}
impl TransactionExt for Transaction {}


/// Extension trait for [FeeRate].
pub trait FeeRateExt: Borrow<FeeRate> {
	/// Convert the BTC/kvB amount bitcoind reports for fee estimates.
	fn from_amount_per_kvb(amount_vkb: Amount) -> FeeRate {
		FeeRate::from_sat_per_kvb(amount_vkb.to_sat())
	}

	fn from_sat_per_kvb(sat_kvb: u64) -> FeeRate {
		FeeRate::from_sat_per_kwu(sat_kvb / 4)
	}
}
impl FeeRateExt for FeeRate {}


#[cfg(test)]
mod test {
	use super::*;
	use cbitcoin::{absolute, transaction, OutPoint, ScriptBuf, TxIn, TxOut};
	use cbitcoin::hashes::Hash;

	#[test]
	fn fee_rate_from_amount_per_kvb() {
		assert_eq!(FeeRate::from_amount_per_kvb(Amount::from_sat(1_000)), FeeRate::from_sat_per_kwu(250));
		assert_eq!(FeeRate::from_amount_per_kvb(Amount::from_sat(4_000)).to_sat_per_vb_ceil(), 4);
		assert_eq!(FeeRate::from_sat_per_kvb(25_000).to_sat_per_vb_ceil(), 25);
	}

	#[test]
	fn spent_txids() {
		let a = Txid::from_byte_array([1; 32]);
		let b = Txid::from_byte_array([2; 32]);
		let tx = Transaction {
			version: transaction::Version::TWO,
			lock_time: absolute::LockTime::ZERO,
			input: vec![
				TxIn { previous_output: OutPoint::new(a, 0), ..Default::default() },
				TxIn { previous_output: OutPoint::new(b, 3), ..Default::default() },
			],
			output: vec![
				TxOut { value: Amount::from_sat(1_000), script_pubkey: ScriptBuf::new() },
				TxOut { value: Amount::from_sat(2_500), script_pubkey: ScriptBuf::new() },
			],
		};

		let filter = [b].into_iter().collect::<HashSet<_>>();
		assert_eq!(tx.spent_txids_in(&filter).collect::<Vec<_>>(), vec![b]);
		assert_eq!(tx.output_value(), Amount::from_sat(3_500));
	}
}
