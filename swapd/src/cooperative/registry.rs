
use std::collections::HashMap;
use std::sync::Arc;

use swap::{ClaimSession, SwapType};


/// A cooperative claim we prepared for the counterparty to co-sign.
#[derive(Debug)]
pub struct CooperativeClaim {
	pub session: ClaimSession,
	pub sweep_address: String,
}

#[derive(Debug)]
pub struct ClaimRegistration {
	pub kind: SwapType,
	/// Created on the first details request.
	pub cooperative: Option<CooperativeClaim>,
}

/// The swaps we could claim cooperatively.
///
/// Entries are locked individually so that preparing the details of one
/// swap doesn't block the others.
#[derive(Default)]
pub struct ClaimRegistry {
	swaps: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<ClaimRegistration>>>>,
}

impl ClaimRegistry {
	pub fn new() -> ClaimRegistry {
		ClaimRegistry::default()
	}

	/// Returns false if the swap was registered already, which is kept as is.
	pub fn register(&self, id: &str, kind: SwapType) -> bool {
		let mut swaps = self.swaps.lock();
		if swaps.contains_key(id) {
			return false;
		}
		swaps.insert(id.to_owned(), Arc::new(tokio::sync::Mutex::new(ClaimRegistration {
			kind: kind,
			cooperative: None,
		})));
		true
	}

	pub fn remove(&self, id: &str) -> bool {
		self.swaps.lock().remove(id).is_some()
	}

	pub fn get(&self, id: &str) -> Option<Arc<tokio::sync::Mutex<ClaimRegistration>>> {
		self.swaps.lock().get(id).cloned()
	}

	pub fn contains(&self, id: &str) -> bool {
		self.swaps.lock().contains_key(id)
	}

	pub fn len(&self) -> usize {
		self.swaps.lock().len()
	}
}


#[cfg(test)]
mod test {
	use super::*;

	#[tokio::test]
	async fn registration_is_idempotent() {
		let reg = ClaimRegistry::new();
		assert!(reg.register("a", SwapType::Submarine));
		assert!(!reg.register("a", SwapType::Chain));
		assert_eq!(reg.len(), 1);
		assert_eq!(reg.get("a").unwrap().lock().await.kind, SwapType::Submarine);

		assert!(reg.remove("a"));
		assert!(!reg.remove("a"));
		assert!(!reg.contains("a"));
		assert!(reg.get("a").is_none());
	}
}
