//! The three storage-node workers: store consumer, request consumer
//! and heartbeat ticker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use griddfs_util::background::worker::{Worker, WorkerStatus};
use griddfs_util::error::Error;

use griddfs_transport::message::{Envelope, Message};
use griddfs_transport::Mailbox;

use crate::node::StorageNode;

/// Consumes the node's fanout inbox and runs each block through the
/// admission pipeline
pub struct StoreWorker {
	node: Arc<StorageNode>,
	mailbox: Mailbox,
	pending: Option<Envelope>,
}

impl StoreWorker {
	pub fn new(node: Arc<StorageNode>, mailbox: Mailbox) -> Self {
		Self {
			node,
			mailbox,
			pending: None,
		}
	}
}

#[async_trait]
impl Worker for StoreWorker {
	fn name(&self) -> String {
		format!("Block store consumer for {}", self.node.id)
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
			Message::StoreBlock {
				block_id,
				block_size,
				block_hash,
				block_data,
				..
			} => {
				self.node
					.handle_store_block(&block_id, block_size, &block_hash, &block_data)
					.await?;
			}
			other => warn!(
				"Discarding unexpected {} message on the fanout inbox",
				other.kind()
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

/// Consumes the node's direct request queue and serves blocks
pub struct RequestWorker {
	node: Arc<StorageNode>,
	mailbox: Mailbox,
	pending: Option<Envelope>,
}

impl RequestWorker {
	pub fn new(node: Arc<StorageNode>, mailbox: Mailbox) -> Self {
		Self {
			node,
			mailbox,
			pending: None,
		}
	}
}

#[async_trait]
impl Worker for RequestWorker {
	fn name(&self) -> String {
		format!("Block request consumer for {}", self.node.id)
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
			Message::RequestBlock {
				block_id,
				client_id,
				reply_address,
			} => {
				self.node
					.handle_request_block(&block_id, &client_id, &reply_address)
					.await?;
			}
			other => warn!(
				"Discarding unexpected {} message on the request queue",
				other.kind()
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

/// Emits one heartbeat per interval. A failed publish is logged by the
/// worker runner and retried after a short delay; each heartbeat is
/// independent so losing some is fine.
pub struct HeartbeatWorker {
	node: Arc<StorageNode>,
	interval: Duration,
}

impl HeartbeatWorker {
	pub fn new(node: Arc<StorageNode>, interval: Duration) -> Self {
		Self { node, interval }
	}
}

#[async_trait]
impl Worker for HeartbeatWorker {
	fn name(&self) -> String {
		format!("Heartbeat ticker for {}", self.node.id)
	}

	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if *must_exit.borrow() {
			return Ok(WorkerStatus::Done);
		}
		self.node.heartbeat_once().await?;
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(self.interval).await;
		WorkerStatus::Busy
	}
}
