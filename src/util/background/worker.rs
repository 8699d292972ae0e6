use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Error;

/// Delay before calling `work` again after it returned an error
const WORK_ERROR_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum WorkerStatus {
	Busy,
	Idle,
	Done,
}

/// A long-lived background loop: the coordinator's two consumers and
/// deadline sweeper, and the storage node's store/request consumers
/// and heartbeat ticker, all implement this.
#[async_trait]
pub trait Worker: Send {
	fn name(&self) -> String;

	/// Process one unit of work if one is available, or return
	/// `WorkerStatus::Idle` immediately. Implementations should check
	/// `must_exit` and return `WorkerStatus::Done` once it is set, so
	/// that shutdown does not have to wait for the exit grace period.
	/// Errors are logged and the same worker is retried after a short
	/// delay.
	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error>;

	/// Block until some work is available (a message in the mailbox, a
	/// tick of the interval). This future may be dropped at any point
	/// when the process exits, so it must not consume anything it
	/// cannot hand back through `work`. Returning `WorkerStatus::Done`
	/// here (closed mailbox) also terminates the worker.
	async fn wait_for_work(&mut self, must_exit: &watch::Receiver<bool>) -> WorkerStatus;
}

/// Drive one worker on its own task until it reports `Done`.
///
/// Busy workers keep calling `work`; idle workers park in
/// `wait_for_work` and are woken up by either work or the exit signal.
/// Once the exit signal is set, the loop stops parking: everything a
/// GridDFS worker would still consume is either drained by `work`
/// (which sees `must_exit`) or redelivered by the broker on the next
/// start.
pub(crate) fn run_worker(
	mut worker: Box<dyn Worker>,
	mut must_exit: watch::Receiver<bool>,
) -> JoinHandle<()> {
	// wait_for_work borrows a receiver for the whole await, so the
	// exit signal is watched on a second receiver of the same channel
	let must_exit_idle = must_exit.clone();
	tokio::spawn(async move {
		let name = worker.name();
		debug!("Worker {} started", name);
		loop {
			if *must_exit.borrow() {
				break;
			}
			match worker.work(&mut must_exit).await {
				Ok(WorkerStatus::Busy) => (),
				Ok(WorkerStatus::Idle) => {
					let woken = tokio::select! {
						s = worker.wait_for_work(&must_exit_idle) => s,
						// Re-check must_exit at the top of the loop
						_ = must_exit.changed() => WorkerStatus::Busy,
					};
					if woken == WorkerStatus::Done {
						break;
					}
				}
				Ok(WorkerStatus::Done) => break,
				Err(e) => {
					error!("Error in worker {}: {}", name, e);
					tokio::time::sleep(WORK_ERROR_RETRY_DELAY).await;
				}
			}
		}
		info!("Worker {} exited", name);
	})
}
