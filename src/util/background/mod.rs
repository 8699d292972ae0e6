//! Runner for long-lived background workers

pub mod worker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use worker::Worker;

/// How long shutdown waits for workers to finish their current unit of
/// work before aborting them. Workers check the exit signal between
/// units, so this is only ever consumed by a wedged unit.
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Owns the background workers of one component (a coordinator or one
/// storage node). Each worker runs on its own task; a supervisor task
/// awaits them all once the stop signal fires and aborts whatever
/// outlives the grace period.
pub struct BackgroundRunner {
	stop_signal: watch::Receiver<bool>,
	workers: Arc<Mutex<Vec<(String, JoinHandle<()>)>>>,
}

impl BackgroundRunner {
	/// Create a new BackgroundRunner. The returned join handle resolves
	/// once the stop signal has fired and every worker has exited or
	/// been aborted.
	pub fn new(stop_signal: watch::Receiver<bool>) -> (Arc<Self>, JoinHandle<()>) {
		let workers = Arc::new(Mutex::new(Vec::<(String, JoinHandle<()>)>::new()));

		let mut stop = stop_signal.clone();
		let supervised = workers.clone();
		let await_all_done = tokio::spawn(async move {
			while !*stop.borrow() {
				if stop.changed().await.is_err() {
					break;
				}
			}

			let workers = std::mem::take(&mut *supervised.lock().unwrap());
			let deadline = tokio::time::Instant::now() + EXIT_GRACE_PERIOD;
			for (name, mut handle) in workers {
				let remaining = deadline.duration_since(tokio::time::Instant::now());
				match tokio::time::timeout(remaining, &mut handle).await {
					Ok(Ok(())) => (),
					Ok(Err(e)) if e.is_panic() => {
						error!("Worker {} panicked: {}", name, e);
					}
					Ok(Err(_)) => (),
					Err(_) => {
						warn!("Worker {} did not exit in time, aborting it", name);
						handle.abort();
					}
				}
			}
		});

		let bgrunner = Arc::new(Self {
			stop_signal,
			workers,
		});
		(bgrunner, await_all_done)
	}

	pub fn spawn_worker<W>(&self, w: W)
	where
		W: Worker + 'static,
	{
		let name = w.name();
		let handle = worker::run_worker(Box::new(w), self.stop_signal.clone());
		self.workers.lock().unwrap().push((name, handle));
	}
}
