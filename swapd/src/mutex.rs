
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};


/// A set of async locks identified by key, created on first use.
///
/// Holders of the same key are served in acquisition order. The guard can
/// be held across await points.
pub struct KeyedMutex<K> {
	locks: parking_lot::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash> KeyedMutex<K> {
	pub fn new() -> KeyedMutex<K> {
		KeyedMutex { locks: parking_lot::Mutex::new(HashMap::new()) }
	}

	pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
		let lock = self.locks.lock().entry(key).or_default().clone();
		lock.lock_owned().await
	}
}

impl<K: Eq + Hash> Default for KeyedMutex<K> {
	fn default() -> Self {
		KeyedMutex::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use std::time::Duration;

	#[tokio::test]
	async fn same_key_is_exclusive() {
		let locks = Arc::new(KeyedMutex::<&'static str>::new());
		let guard = locks.lock("a").await;

		let l = locks.clone();
		let mut waiting = tokio::spawn(async move {
			let _g = l.lock("a").await;
		});
		let timeout = tokio::time::timeout(Duration::from_millis(50), &mut waiting).await;
		assert!(timeout.is_err(), "second holder got the lock");

		// other keys are independent
		let _other = locks.lock("b").await;

		drop(guard);
		waiting.await.unwrap();
	}
}
