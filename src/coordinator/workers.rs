//! The coordinator's background workers: the two transport consumers
//! and the upload-deadline sweeper

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use griddfs_util::background::worker::{Worker, WorkerStatus};
use griddfs_util::error::Error;

use griddfs_transport::message::{Envelope, Message};
use griddfs_transport::Mailbox;

use crate::coordinator::Coordinator;

/// Consumes `storage.confirm` and applies each confirmation to the
/// metadata store
pub struct ConfirmationWorker {
	coordinator: Arc<Coordinator>,
	mailbox: Mailbox,
	pending: Option<Envelope>,
}

impl ConfirmationWorker {
	pub fn new(coordinator: Arc<Coordinator>, mailbox: Mailbox) -> Self {
		Self {
			coordinator,
			mailbox,
			pending: None,
		}
	}
}

#[async_trait]
impl Worker for ConfirmationWorker {
	fn name(&self) -> String {
		"Storage confirmation consumer".into()
	}

	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if *must_exit.borrow() {
			return Ok(WorkerStatus::Done);
		}
		let env = match self.pending.take().or_else(|| self.mailbox.try_recv()) {
			Some(env) => env,
			None => return Ok(WorkerStatus::Idle),
		};
		match env.msg {
			Message::StorageConfirmed {
				block_id,
				node_id,
				storage_path,
				status,
				error_message,
			} => {
				if let Err(e) = self.coordinator.handle_confirmation(
					&block_id,
					&node_id,
					&storage_path,
					status,
					error_message.as_deref(),
				) {
					// The message is consumed either way; a broken
					// confirmation must not wedge the queue
					error!(
						"Could not record confirmation for block {} from node {}: {}",
						block_id, node_id, e
					);
				}
			}
			other => warn!(
				"Discarding unexpected {} message on {}",
				other.kind(),
				griddfs_transport::QUEUE_STORAGE_CONFIRM
			),
		}
		Ok(WorkerStatus::Busy)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		match self.mailbox.recv().await {
			Some(env) => {
				self.pending = Some(env);
				WorkerStatus::Busy
			}
			None => WorkerStatus::Done,
		}
	}
}

/// Consumes `datanode.heartbeat` and upserts node liveness
pub struct HeartbeatWorker {
	coordinator: Arc<Coordinator>,
	mailbox: Mailbox,
	pending: Option<Envelope>,
}

impl HeartbeatWorker {
	pub fn new(coordinator: Arc<Coordinator>, mailbox: Mailbox) -> Self {
		Self {
			coordinator,
			mailbox,
			pending: None,
		}
	}
}

#[async_trait]
impl Worker for HeartbeatWorker {
	fn name(&self) -> String {
		"Heartbeat consumer".into()
	}

	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if *must_exit.borrow() {
			return Ok(WorkerStatus::Done);
		}
		let env = match self.pending.take().or_else(|| self.mailbox.try_recv()) {
			Some(env) => env,
			None => return Ok(WorkerStatus::Idle),
		};
		match env.msg {
			Message::Heartbeat {
				node_id,
				storage_used,
				storage_capacity,
				storage_available,
				..
			} => {
				if let Err(e) = self.coordinator.handle_heartbeat(
					&node_id,
					storage_capacity,
					storage_used,
					storage_available,
				) {
					error!("Could not record heartbeat of node {}: {}", node_id, e);
				}
			}
			other => warn!(
				"Discarding unexpected {} message on {}",
				other.kind(),
				griddfs_transport::QUEUE_HEARTBEAT
			),
		}
		Ok(WorkerStatus::Busy)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		match self.mailbox.recv().await {
			Some(env) => {
				self.pending = Some(env);
				WorkerStatus::Busy
			}
			None => WorkerStatus::Done,
		}
	}
}

/// Periodically fails pending upload sessions whose deadline elapsed
pub struct SessionExpiryWorker {
	coordinator: Arc<Coordinator>,
	sweep_interval: Duration,
}

impl SessionExpiryWorker {
	pub fn new(coordinator: Arc<Coordinator>, upload_deadline: Duration) -> Self {
		// Sweeping at a fraction of the deadline keeps the failure
		// latency bounded without scanning the session tree too often
		let sweep_interval = std::cmp::max(upload_deadline / 4, Duration::from_secs(1));
		Self {
			coordinator,
			sweep_interval,
		}
	}
}

#[async_trait]
impl Worker for SessionExpiryWorker {
	fn name(&self) -> String {
		"Upload session deadline sweeper".into()
	}

	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if *must_exit.borrow() {
			return Ok(WorkerStatus::Done);
		}
		if let Err(e) = self.coordinator.sweep_expired_sessions() {
			error!("Upload session sweep failed: {}", e);
		}
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(self.sweep_interval).await;
		WorkerStatus::Busy
	}
}
