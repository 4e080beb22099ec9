
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};


/// Registration of a running task, held for as long as the task runs.
pub struct Worker {
	rtmgr: RuntimeManager,
	name: String,
	critical: bool,
}

impl Drop for Worker {
	fn drop(&mut self) {
		self.rtmgr.running.send_modify(|n| *n = n.saturating_sub(1));

		if self.critical && !self.rtmgr.shutdown.is_cancelled() {
			slog!(CriticalWorkerStopped, name: self.name.clone());
			self.rtmgr.shutdown();
		} else {
			slog!(WorkerStopped, name: self.name.clone());
		}
	}
}

/// Tracks the background tasks of the server and their shutdown.
#[derive(Clone)]
pub struct RuntimeManager {
	shutdown: CancellationToken,
	running: Arc<watch::Sender<usize>>,
}

impl RuntimeManager {
	pub fn new() -> RuntimeManager {
		RuntimeManager {
			shutdown: CancellationToken::new(),
			running: Arc::new(watch::channel(0).0),
		}
	}

	fn register(&self, name: &str, critical: bool) -> Worker {
		self.running.send_modify(|n| *n += 1);
		slog!(WorkerStarted, name: name.into(), critical);
		Worker { rtmgr: self.clone(), name: name.into(), critical }
	}

	/// Register a task. Shutdown waits until the returned [Worker] is dropped.
	pub fn spawn(&self, name: impl AsRef<str>) -> Worker {
		self.register(name.as_ref(), false)
	}

	/// Like [RuntimeManager::spawn], but the server shuts down when the task ends.
	pub fn spawn_critical(&self, name: impl AsRef<str>) -> Worker {
		self.register(name.as_ref(), true)
	}

	pub fn shutdown(&self) {
		self.shutdown.cancel();
	}

	/// Resolves once shutdown has been requested.
	pub fn shutdown_signal(&self) -> WaitForCancellationFuture<'_> {
		self.shutdown.cancelled()
	}

	/// Resolves once every registered worker is gone.
	pub async fn wait(&self) {
		let mut rx = self.running.subscribe();
		// the sender lives in self, so the channel can't close here
		let _ = rx.wait_for(|n| *n == 0).await;
	}

	/// Request shutdown on SIGTERM or ctrl-c.
	///
	/// The process exits if workers are still running `timeout` after the signal.
	pub fn run_shutdown_signal_listener(&self, timeout: Duration) {
		let rtmgr = self.clone();
		tokio::spawn(async move {
			let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
				Ok(s) => s,
				Err(e) => {
					error!("Failed to listen for SIGTERM: {}", e);
					return;
				}
			};

			tokio::select! {
				_ = sigterm.recv() => info!("SIGTERM received, shutting down..."),
				r = signal::ctrl_c() => match r {
					Ok(()) => info!("Ctrl+C received, shutting down..."),
					Err(e) => error!("failed to listen to ctrl-c signal: {:#}", e),
				},
			}
			rtmgr.shutdown();

			if tokio::time::timeout(timeout, rtmgr.wait()).await.is_err() {
				error!("Workers still running after {}s, exiting...", timeout.as_secs());
				std::process::exit(0);
			}
		});
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn running(rtmgr: &RuntimeManager) -> usize {
		*rtmgr.running.borrow()
	}

	#[tokio::test]
	async fn critical_worker_triggers_shutdown() {
		let rtmgr = RuntimeManager::new();
		let normal = rtmgr.spawn("normal");
		let critical = rtmgr.spawn_critical("critical");
		assert_eq!(running(&rtmgr), 2);

		drop(normal);
		assert!(!rtmgr.shutdown.is_cancelled());

		let rt = rtmgr.clone();
		let waiter = tokio::spawn(async move { rt.wait().await });
		drop(critical);
		assert!(rtmgr.shutdown.is_cancelled());
		waiter.await.unwrap();
		assert_eq!(running(&rtmgr), 0);
	}

	#[tokio::test]
	async fn shutdown_signal_reaches_workers() {
		let rtmgr = RuntimeManager::new();
		let rt = rtmgr.clone();
		let handle = tokio::spawn(async move {
			let _worker = rt.spawn("loop");
			rt.shutdown_signal().await;
		});
		while running(&rtmgr) == 0 {
			tokio::task::yield_now().await;
		}
		rtmgr.shutdown();
		rtmgr.wait().await;
		handle.await.unwrap();
		assert_eq!(running(&rtmgr), 0);
	}
}
