//! Message transport layer for GridDFS.
//!
//! Two patterns are required by the rest of the system, stated here as
//! contracts independent of any concrete broker:
//!
//! - **Fanout**: a message published to the block exchange is delivered
//!   to every currently bound storage-node inbox, at least once.
//! - **Direct request/reply**: a client binds an ephemeral reply queue,
//!   embeds its address in the request, and the target node publishes
//!   the response to exactly that address.
//!
//! The in-memory broker in [`memory`] implements both contracts for
//! single-process deployments and tests; a broker-backed implementation
//! lives outside this repository and must honor the same trait.

#[macro_use]
extern crate tracing;

pub mod memory;
pub mod message;

use async_trait::async_trait;

use tokio::sync::mpsc;

use griddfs_util::error::Error;

use crate::message::Envelope;

/// Queue receiving storage confirmations on the coordinator side
pub const QUEUE_STORAGE_CONFIRM: &str = "storage.confirm";
/// Queue receiving node heartbeats on the coordinator side
pub const QUEUE_HEARTBEAT: &str = "datanode.heartbeat";

/// Inbox on which a storage node receives fanned-out blocks
pub fn fanout_queue(node_id: &str) -> String {
	format!("fanout.blocks.{}", node_id)
}

/// Queue on which a storage node receives direct block requests
pub fn request_queue(node_id: &str) -> String {
	format!("block.request.{}", node_id)
}

/// Prefix for ephemeral client reply queues
pub fn response_queue_prefix(client_id: &str) -> String {
	format!("block.response.{}", client_id)
}

/// Consumer side of a bound queue
pub struct Mailbox {
	recv: mpsc::UnboundedReceiver<Envelope>,
}

impl Mailbox {
	pub(crate) fn new(recv: mpsc::UnboundedReceiver<Envelope>) -> Self {
		Self { recv }
	}

	/// Await the next message; `None` means the binding was closed by
	/// the broker
	pub async fn recv(&mut self) -> Option<Envelope> {
		self.recv.recv().await
	}

	/// Return the next message if one is already queued
	pub fn try_recv(&mut self) -> Option<Envelope> {
		self.recv.try_recv().ok()
	}
}

/// Contract between GridDFS components and the message broker
#[async_trait]
pub trait Transport: Send + Sync + 'static {
	/// Publish to the block fanout exchange: delivered to every
	/// currently bound fanout inbox
	async fn publish_fanout(&self, env: Envelope) -> Result<(), Error>;

	/// Publish to a single named queue
	async fn publish(&self, queue: &str, env: Envelope) -> Result<(), Error>;

	/// Bind a storage-node inbox to the fanout exchange
	async fn bind_fanout(&self, inbox: &str) -> Result<Mailbox, Error>;

	/// Bind a durable named queue; messages published before the bind
	/// are delivered from the backlog
	async fn bind_queue(&self, queue: &str) -> Result<Mailbox, Error>;

	/// Bind an auto-delete reply queue with a broker-assigned name.
	/// Once the mailbox is dropped the broker stops routing to it.
	async fn bind_ephemeral(&self, prefix: &str) -> Result<(String, Mailbox), Error>;
}
