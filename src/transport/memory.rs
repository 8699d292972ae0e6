//! In-memory implementation of the transport contracts, used for
//! single-process deployments and for the test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use griddfs_util::data::gen_token;
use griddfs_util::error::Error;

use crate::message::Envelope;
use crate::{Mailbox, Transport};

/// An in-process broker. Queues are durable within the lifetime of the
/// broker: messages published to a named queue before anything binds it
/// are kept in a backlog. Ephemeral reply queues are auto-delete; once
/// their mailbox is dropped, further messages to them are discarded.
pub struct MemoryBroker {
	state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
	queues: HashMap<String, QueueState>,
	fanout_inboxes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
	Durable,
	Ephemeral,
}

struct QueueState {
	kind: QueueKind,
	sender: Option<mpsc::UnboundedSender<Envelope>>,
	backlog: VecDeque<Envelope>,
}

impl QueueState {
	fn new(kind: QueueKind) -> Self {
		Self {
			kind,
			sender: None,
			backlog: VecDeque::new(),
		}
	}
}

impl MemoryBroker {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(BrokerState::default()),
		})
	}
}

impl BrokerState {
	fn deliver(&mut self, queue: &str, env: Envelope) {
		let state = self
			.queues
			.entry(queue.to_string())
			.or_insert_with(|| QueueState::new(QueueKind::Durable));
		let env = match state.sender.take() {
			Some(sender) => match sender.send(env) {
				Ok(()) => {
					state.sender = Some(sender);
					return;
				}
				// The consumer went away; stale bindings are not
				// routed to
				Err(mpsc::error::SendError(env)) => env,
			},
			None => env,
		};
		if state.kind == QueueKind::Durable {
			state.backlog.push_back(env);
		} else {
			trace!("Dropping message for closed reply queue {}", queue);
			self.queues.remove(queue);
		}
	}

	fn bind(&mut self, queue: &str, kind: QueueKind) -> Mailbox {
		let (tx, rx) = mpsc::unbounded_channel();
		let state = self
			.queues
			.entry(queue.to_string())
			.or_insert_with(|| QueueState::new(kind));
		for env in state.backlog.drain(..) {
			// The new consumer inherits the backlog; send cannot fail,
			// we hold the receiver
			tx.send(env).unwrap();
		}
		state.sender = Some(tx);
		Mailbox::new(rx)
	}
}

#[async_trait]
impl Transport for MemoryBroker {
	async fn publish_fanout(&self, env: Envelope) -> Result<(), Error> {
		let mut state = self.state.lock().unwrap();
		let inboxes = state.fanout_inboxes.clone();
		for inbox in inboxes {
			state.deliver(&inbox, env.clone());
		}
		Ok(())
	}

	async fn publish(&self, queue: &str, env: Envelope) -> Result<(), Error> {
		let mut state = self.state.lock().unwrap();
		state.deliver(queue, env);
		Ok(())
	}

	async fn bind_fanout(&self, inbox: &str) -> Result<Mailbox, Error> {
		let mut state = self.state.lock().unwrap();
		if !state.fanout_inboxes.iter().any(|x| x == inbox) {
			state.fanout_inboxes.push(inbox.to_string());
		}
		Ok(state.bind(inbox, QueueKind::Durable))
	}

	async fn bind_queue(&self, queue: &str) -> Result<Mailbox, Error> {
		let mut state = self.state.lock().unwrap();
		Ok(state.bind(queue, QueueKind::Durable))
	}

	async fn bind_ephemeral(&self, prefix: &str) -> Result<(String, Mailbox), Error> {
		let mut state = self.state.lock().unwrap();
		let name = format!("{}.{}", prefix, gen_token());
		let mailbox = state.bind(&name, QueueKind::Ephemeral);
		Ok((name, mailbox))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::Message;

	fn heartbeat(node_id: &str) -> Envelope {
		Envelope::new(Message::Heartbeat {
			node_id: node_id.into(),
			status: "active".into(),
			storage_used: 0,
			storage_capacity: 100,
			storage_available: 100,
		})
	}

	#[tokio::test]
	async fn test_fanout_reaches_all_bound_inboxes() {
		let broker = MemoryBroker::new();
		let mut in1 = broker.bind_fanout("fanout.blocks.dn1").await.unwrap();
		let mut in2 = broker.bind_fanout("fanout.blocks.dn2").await.unwrap();

		broker.publish_fanout(heartbeat("x")).await.unwrap();

		assert!(in1.try_recv().is_some());
		assert!(in2.try_recv().is_some());
		// At most once per publication per inbox
		assert!(in1.try_recv().is_none());
		assert!(in2.try_recv().is_none());
	}

	#[tokio::test]
	async fn test_durable_queue_keeps_backlog() {
		let broker = MemoryBroker::new();
		broker
			.publish("storage.confirm", heartbeat("a"))
			.await
			.unwrap();
		broker
			.publish("storage.confirm", heartbeat("b"))
			.await
			.unwrap();

		let mut mailbox = broker.bind_queue("storage.confirm").await.unwrap();
		assert!(mailbox.try_recv().is_some());
		assert!(mailbox.try_recv().is_some());
		assert!(mailbox.try_recv().is_none());
	}

	#[tokio::test]
	async fn test_ephemeral_queue_drops_after_close() {
		let broker = MemoryBroker::new();
		let (addr, mailbox) = broker.bind_ephemeral("block.response.c1").await.unwrap();
		assert!(addr.starts_with("block.response.c1."));

		drop(mailbox);
		// No panic, message silently discarded
		broker.publish(&addr, heartbeat("x")).await.unwrap();

		// Rebinding an ephemeral queue yields a fresh empty mailbox
		let (addr2, mut mb2) = broker.bind_ephemeral("block.response.c1").await.unwrap();
		assert_ne!(addr, addr2);
		assert!(mb2.try_recv().is_none());
	}

	#[tokio::test]
	async fn test_late_fanout_bind_sees_only_new_messages() {
		let broker = MemoryBroker::new();
		let mut in1 = broker.bind_fanout("fanout.blocks.dn1").await.unwrap();
		broker.publish_fanout(heartbeat("one")).await.unwrap();

		let mut in2 = broker.bind_fanout("fanout.blocks.dn2").await.unwrap();
		broker.publish_fanout(heartbeat("two")).await.unwrap();

		assert!(in1.try_recv().is_some());
		assert!(in1.try_recv().is_some());
		// dn2 was not bound at the time of the first publication
		assert!(in2.try_recv().is_some());
		assert!(in2.try_recv().is_none());
	}
}
