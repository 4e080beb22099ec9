
use std::fmt;
use core::error::Error as StdError;

use anyhow::Context;


/// An error type to add context to anyhow to indicate any form
/// of incorrect user input.
pub struct BadArgument {
	context: Box<dyn fmt::Display + Send + Sync + 'static>,
}

impl BadArgument {
	pub fn new(context: impl fmt::Display + Send + Sync + 'static) -> BadArgument {
		BadArgument {
			context: Box::new(context),
		}
	}
}

impl fmt::Debug for BadArgument {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl fmt::Display for BadArgument {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "bad user input: {}", self.context)
	}
}

impl StdError for BadArgument {}

/// An error type to add context to anyhow to indicate that
/// a requested entity doesn't exist.
pub struct NotFound {
	ids: Vec<String>,
	context: Box<dyn fmt::Display + Send + Sync + 'static>,
}

impl NotFound {
	pub fn new<I, V>(ids: V, context: impl fmt::Display + Send + Sync + 'static) -> NotFound
	where
		V: IntoIterator<Item = I>,
		I: fmt::Display,
	{
		NotFound {
			ids: ids.into_iter().map(|i| i.to_string()).collect(),
			context: Box::new(context),
		}
	}

	pub fn identifiers(&self) -> &Vec<String> {
		&self.ids
	}
}

impl fmt::Debug for NotFound {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

impl fmt::Display for NotFound {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "not found: {}", self.context)
	}
}

impl StdError for NotFound {}


fn reason(r: &Option<String>) -> String {
	match r {
		Some(r) => format!(": {}", r),
		None => String::new(),
	}
}

/// Failures of the settlement core that callers have to act on.
///
/// These are carried inside [anyhow::Error], use
/// `err.downcast_ref::<SwapError>()` to inspect them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwapError {
	#[error("swap is not eligible for a cooperative claim{}", reason(.0))]
	NotEligibleForCooperativeClaim(Option<String>),
	#[error("swap is not eligible for a cooperative refund{}", reason(.0))]
	NotEligibleForCooperativeRefund(Option<String>),
	#[error("server claimed the swap already")]
	ServerClaimSucceededAlready,
	#[error("incorrect preimage")]
	IncorrectPreimage,
	#[error("invalid partial signature")]
	InvalidPartialSignature,
	#[error("currency {0} is not UTXO based")]
	CurrencyNotUtxoBased(String),
	#[error("could not find swap with id: {0}")]
	SwapNotFound(String),
	#[error("lockups of {0} are not being tracked")]
	SymbolNotTracked(String),
	#[error("zero-conf is disabled for {0}")]
	ZeroConfDisabled(String),
}


/// Return an [anyhow] error tagged with [BadArgument].
#[macro_export]
macro_rules! badarg {
	($($arg:tt)*) => {
		Err($crate::anyhow::Error::from($crate::error::BadArgument::new(format!($($arg)*))))
	};
}

/// Return an [anyhow] error tagged with [NotFound].
#[macro_export]
macro_rules! not_found {
	($ids:expr, $($arg:tt)*) => {
		Err($crate::anyhow::Error::from($crate::error::NotFound::new($ids, format!($($arg)*))))
	};
}


/// Extension trait for adding swapd-specific error info.
pub trait ContextExt<T, E>: Context<T, E> {
	/// Tag an error with [BadArgument].
	fn badarg<C>(self, context: C) -> anyhow::Result<T>
		where C: fmt::Display + Send + Sync + 'static;

	/// Tag an error with [BadArgument].
	fn with_badarg<C, F>(self, f: F) -> anyhow::Result<T>
	where
		C: fmt::Display + Send + Sync + 'static,
		F: FnOnce() -> C;
}

impl<R, T, E> ContextExt<T, E> for R
where
	R: Context<T, E>,
{
	fn badarg<C>(self, context: C) -> anyhow::Result<T>
	where
		C: fmt::Display + Send + Sync + 'static,
	{
		self.context(BadArgument::new(context))
	}

	fn with_badarg<C, F>(self, f: F) -> anyhow::Result<T>
	where
		C: fmt::Display + Send + Sync + 'static,
		F: FnOnce() -> C,
	{
		self.with_context(|| BadArgument::new(f()))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn downcast() {
		let e = Result::<(), _>::Err(SwapError::IncorrectPreimage)
			.context("inner_context")
			.badarg("badarg_context")
			.context("outer_context")
			.unwrap_err();
		let _ = e.downcast_ref::<BadArgument>().unwrap();
		assert_eq!(e.downcast_ref::<SwapError>(), Some(&SwapError::IncorrectPreimage));

		let res: anyhow::Result<()> = not_found!(["abc"], "swap");
		let e = res.unwrap_err();
		assert_eq!(e.downcast_ref::<NotFound>().unwrap().identifiers(), &vec!["abc".to_owned()]);
	}

	#[test]
	fn rejection_reasons() {
		assert_eq!(
			SwapError::NotEligibleForCooperativeRefund(Some("status not eligible".into())).to_string(),
			"swap is not eligible for a cooperative refund: status not eligible",
		);
		assert_eq!(
			SwapError::NotEligibleForCooperativeClaim(None).to_string(),
			"swap is not eligible for a cooperative claim",
		);
	}

	#[test]
	fn macros() {
		let _: anyhow::Result<()> = badarg!("bla: {}", 15);
		let _: anyhow::Result<()> = not_found!([12], "bla: {}", 15);
	}
}
