//! The storage node component: admission of fanned-out blocks, direct
//! request servicing and heartbeat emission

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::prelude::*;

use tokio::fs;

use griddfs_util::background::BackgroundRunner;
use griddfs_util::config::StorageNodeConfig;
use griddfs_util::data::{gen_token, sha256sum, Hash};
use griddfs_util::error::Error;

use griddfs_transport::message::{
	decode_block_data, encode_block_data, ConfirmStatus, Envelope, Message, ResponseStatus,
};
use griddfs_transport::{fanout_queue, request_queue, Transport, QUEUE_STORAGE_CONFIRM};

use crate::manager::{valid_block_id, BlockStore};
use crate::policy::{Admission, AdmissionPolicy};
use crate::workers::{HeartbeatWorker, RequestWorker, StoreWorker};

/// Name of the file persisting the node identity inside its data
/// directory; blocks themselves live under `blocks/`
const NODE_ID_FILE: &str = "node_id";

pub struct StorageNode {
	pub id: String,
	store: BlockStore,
	policy: AdmissionPolicy,
	transport: Arc<dyn Transport>,
	heartbeat_interval: Duration,
}

impl StorageNode {
	pub async fn new(
		config: &StorageNodeConfig,
		heartbeat_interval: Duration,
		transport: Arc<dyn Transport>,
	) -> Result<Arc<Self>, Error> {
		fs::create_dir_all(&config.data_dir).await?;
		let id = match &config.node_id {
			Some(id) => id.clone(),
			None => load_or_generate_node_id(&config.data_dir).await?,
		};
		let store = BlockStore::open(config.data_dir.join("blocks")).await?;
		let policy = AdmissionPolicy {
			capacity: config.capacity,
			min_free_ratio: config.min_free_ratio,
			accept_probability: config.accept_probability,
		};
		info!(
			"Storage node {} ready ({} bytes used of {})",
			id,
			store.used(),
			config.capacity
		);
		Ok(Arc::new(Self {
			id,
			store,
			policy,
			transport,
			heartbeat_interval,
		}))
	}

	/// Spawn the three node workers: store consumer, request consumer
	/// and heartbeat ticker
	pub async fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner) -> Result<(), Error> {
		let store_inbox = self.transport.bind_fanout(&fanout_queue(&self.id)).await?;
		bg.spawn_worker(StoreWorker::new(self.clone(), store_inbox));

		let request_inbox = self.transport.bind_queue(&request_queue(&self.id)).await?;
		bg.spawn_worker(RequestWorker::new(self.clone(), request_inbox));

		bg.spawn_worker(HeartbeatWorker::new(self.clone(), self.heartbeat_interval));
		Ok(())
	}

	// ---- Store path ----

	/// Handle one fanned-out block: verify its hash, consult the
	/// admission policy, persist if admitted, and confirm the outcome
	/// to the coordinator. Only transport failures propagate; a bad
	/// block never fails the node.
	pub async fn handle_store_block(
		&self,
		block_id: &str,
		block_size: u64,
		block_hash: &str,
		block_data: &str,
	) -> Result<(), Error> {
		if !valid_block_id(block_id) {
			warn!("Dropping store request with invalid block id {:?}", block_id);
			return Ok(());
		}

		let data = match decode_block_data(block_data) {
			Ok(data) => data,
			Err(e) => {
				return self
					.confirm(block_id, ConfirmStatus::Error, String::new(), Some(e.to_string()))
					.await;
			}
		};

		// Hash first: a corrupt block must never be admitted
		let expected = match Hash::parse_hex(block_hash) {
			Ok(h) => h,
			Err(e) => {
				return self
					.confirm(block_id, ConfirmStatus::Error, String::new(), Some(e.to_string()))
					.await;
			}
		};
		if sha256sum(&data) != expected {
			warn!("Block {} does not match its announced hash", block_id);
			return self
				.confirm(
					block_id,
					ConfirmStatus::Error,
					String::new(),
					Some("block data does not match its hash".to_string()),
				)
				.await;
		}
		if data.len() as u64 != block_size {
			return self
				.confirm(
					block_id,
					ConfirmStatus::Error,
					String::new(),
					Some(format!(
						"block has {} bytes, message says {}",
						data.len(),
						block_size
					)),
				)
				.await;
		}

		let already = self.store.contains(block_id).await;
		let admission = self.policy.evaluate(
			already,
			block_size,
			self.store.used(),
			&mut thread_rng(),
		);
		match admission {
			Admission::AlreadyStored => {
				let path = self.store.block_path(block_id);
				self.confirm(
					block_id,
					ConfirmStatus::Success,
					path.to_string_lossy().into_owned(),
					None,
				)
				.await
			}
			Admission::Refuse => {
				debug!("Refusing block {}: free-space floor", block_id);
				self.confirm(
					block_id,
					ConfirmStatus::InsufficientSpace,
					String::new(),
					Some("insufficient space".to_string()),
				)
				.await
			}
			Admission::Decline => {
				trace!("Declining block {}", block_id);
				self.confirm(block_id, ConfirmStatus::Declined, String::new(), None)
					.await
			}
			Admission::Accept => match self.store.write_block(block_id, &data).await {
				Ok(path) => {
					info!("Stored block {} ({} bytes)", block_id, data.len());
					self.confirm(
						block_id,
						ConfirmStatus::Success,
						path.to_string_lossy().into_owned(),
						None,
					)
					.await
				}
				Err(e) => {
					error!("Could not write block {}: {}", block_id, e);
					self.confirm(
						block_id,
						ConfirmStatus::Error,
						String::new(),
						Some(e.to_string()),
					)
					.await
				}
			},
		}
	}

	async fn confirm(
		&self,
		block_id: &str,
		status: ConfirmStatus,
		storage_path: String,
		error_message: Option<String>,
	) -> Result<(), Error> {
		self.transport
			.publish(
				QUEUE_STORAGE_CONFIRM,
				Envelope::new(Message::StorageConfirmed {
					block_id: block_id.to_string(),
					node_id: self.id.clone(),
					storage_path,
					status,
					error_message,
				}),
			)
			.await
	}

	// ---- Read path ----

	/// Serve a direct block request by replying to the embedded reply
	/// address. Bytes are returned as stored, without re-hashing.
	pub async fn handle_request_block(
		&self,
		block_id: &str,
		client_id: &str,
		reply_address: &str,
	) -> Result<(), Error> {
		let (status, block_data, error_message) = if !valid_block_id(block_id) {
			(
				ResponseStatus::Error,
				None,
				Some("invalid block id".to_string()),
			)
		} else {
			match self.store.read_block(block_id).await {
				Ok(Some(data)) => {
					debug!(
						"Serving block {} ({} bytes) to client {}",
						block_id,
						data.len(),
						client_id
					);
					(ResponseStatus::Success, Some(encode_block_data(&data)), None)
				}
				Ok(None) => (ResponseStatus::NotFound, None, None),
				Err(e) => {
					error!("Could not read block {}: {}", block_id, e);
					(ResponseStatus::Error, None, Some(e.to_string()))
				}
			}
		};

		self.transport
			.publish(
				reply_address,
				Envelope::new(Message::BlockResponse {
					block_id: block_id.to_string(),
					status,
					block_data,
					error_message,
				}),
			)
			.await
	}

	// ---- Liveness ----

	/// Emit one heartbeat. Each heartbeat is independent; losing one is
	/// tolerated by the liveness windows.
	pub async fn heartbeat_once(&self) -> Result<(), Error> {
		let used = self.store.used();
		let capacity = self.policy.capacity;
		self.transport
			.publish(
				griddfs_transport::QUEUE_HEARTBEAT,
				Envelope::new(Message::Heartbeat {
					node_id: self.id.clone(),
					status: "active".to_string(),
					storage_used: used,
					storage_capacity: capacity,
					storage_available: capacity.saturating_sub(used),
				}),
			)
			.await
	}
}

async fn load_or_generate_node_id(data_dir: &Path) -> Result<String, Error> {
	let path = data_dir.join(NODE_ID_FILE);
	match fs::read_to_string(&path).await {
		Ok(id) => {
			let id = id.trim().to_string();
			if id.is_empty() {
				Err(Error::Message(format!(
					"Corrupt node id file: {}",
					path.display()
				)))
			} else {
				Ok(id)
			}
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			let id = gen_token();
			fs::write(&path, &id).await?;
			info!("Generated node id {}", id);
			Ok(id)
		}
		Err(e) => Err(e.into()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use griddfs_transport::memory::MemoryBroker;
	use griddfs_transport::Mailbox;

	async fn test_node(
		capacity: u64,
		accept_probability: f64,
	) -> (mktemp::Temp, Arc<StorageNode>, Arc<MemoryBroker>, Mailbox) {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let config = StorageNodeConfig {
			node_id: Some("dn1".to_string()),
			data_dir: tmp.to_path_buf(),
			capacity,
			min_free_ratio: 0.10,
			accept_probability,
		};
		let broker = MemoryBroker::new();
		let confirmations = broker.bind_queue(QUEUE_STORAGE_CONFIRM).await.unwrap();
		let node = StorageNode::new(
			&config,
			Duration::from_secs(1),
			broker.clone() as Arc<dyn Transport>,
		)
		.await
		.unwrap();
		(tmp, node, broker, confirmations)
	}

	fn store_args(data: &[u8]) -> (String, u64, String) {
		(
			gen_token(),
			data.len() as u64,
			sha256sum(data).hex(),
		)
	}

	fn expect_confirmation(mailbox: &mut Mailbox) -> (String, ConfirmStatus, String) {
		match mailbox.try_recv().expect("no confirmation emitted").msg {
			Message::StorageConfirmed {
				block_id,
				node_id,
				storage_path,
				status,
				..
			} => {
				assert_eq!(node_id, "dn1");
				(block_id, status, storage_path)
			}
			other => panic!("expected storage_confirmed, got {}", other.kind()),
		}
	}

	#[tokio::test]
	async fn test_store_block_success_and_replay() {
		let (_tmp, node, _broker, mut confirmations) = test_node(1000, 1.0).await;
		let data = b"hello block";
		let (block_id, size, hash) = store_args(data);

		node.handle_store_block(&block_id, size, &hash, &encode_block_data(data))
			.await
			.unwrap();
		let (bid, status, path) = expect_confirmation(&mut confirmations);
		assert_eq!(bid, block_id);
		assert_eq!(status, ConfirmStatus::Success);
		assert!(path.ends_with(&block_id));
		assert!(node.store.contains(&block_id).await);
		assert_eq!(node.store.used(), data.len() as u64);

		// Replayed fanout delivery: accepted again, no double counting
		node.handle_store_block(&block_id, size, &hash, &encode_block_data(data))
			.await
			.unwrap();
		let (_, status, _) = expect_confirmation(&mut confirmations);
		assert_eq!(status, ConfirmStatus::Success);
		assert_eq!(node.store.used(), data.len() as u64);
	}

	#[tokio::test]
	async fn test_store_block_hash_mismatch_is_refused() {
		let (_tmp, node, _broker, mut confirmations) = test_node(1000, 1.0).await;
		let data = b"hello block";
		let (block_id, size, _) = store_args(data);
		let wrong_hash = sha256sum(b"something else").hex();

		node.handle_store_block(&block_id, size, &wrong_hash, &encode_block_data(data))
			.await
			.unwrap();
		let (_, status, _) = expect_confirmation(&mut confirmations);
		assert_eq!(status, ConfirmStatus::Error);
		assert!(!node.store.contains(&block_id).await);
		assert_eq!(node.store.used(), 0);
	}

	#[tokio::test]
	async fn test_store_block_insufficient_space() {
		// 100 bytes capacity, 10% floor: a 95-byte block cannot fit
		let (_tmp, node, _broker, mut confirmations) = test_node(100, 1.0).await;
		let data = [0u8; 95];
		let (block_id, size, hash) = store_args(&data);

		node.handle_store_block(&block_id, size, &hash, &encode_block_data(&data))
			.await
			.unwrap();
		let (_, status, _) = expect_confirmation(&mut confirmations);
		assert_eq!(status, ConfirmStatus::InsufficientSpace);
		assert!(!node.store.contains(&block_id).await);
	}

	#[tokio::test]
	async fn test_store_block_declined_silently() {
		let (_tmp, node, _broker, mut confirmations) = test_node(1000, 0.0).await;
		let data = b"hello block";
		let (block_id, size, hash) = store_args(data);

		node.handle_store_block(&block_id, size, &hash, &encode_block_data(data))
			.await
			.unwrap();
		let (_, status, _) = expect_confirmation(&mut confirmations);
		assert_eq!(status, ConfirmStatus::Declined);
		assert!(!node.store.contains(&block_id).await);
	}

	#[tokio::test]
	async fn test_request_block_roundtrip() {
		let (_tmp, node, broker, mut confirmations) = test_node(1000, 1.0).await;
		let data = b"requested bytes";
		let (block_id, size, hash) = store_args(data);
		node.handle_store_block(&block_id, size, &hash, &encode_block_data(data))
			.await
			.unwrap();
		expect_confirmation(&mut confirmations);

		let (reply_address, mut replies) =
			broker.bind_ephemeral("block.response.c1").await.unwrap();
		node.handle_request_block(&block_id, "c1", &reply_address)
			.await
			.unwrap();
		match replies.try_recv().unwrap().msg {
			Message::BlockResponse {
				status, block_data, ..
			} => {
				assert_eq!(status, ResponseStatus::Success);
				assert_eq!(decode_block_data(&block_data.unwrap()).unwrap(), data);
			}
			other => panic!("expected block_response, got {}", other.kind()),
		}

		node.handle_request_block("missing-block-id_____", "c1", &reply_address)
			.await
			.unwrap();
		match replies.try_recv().unwrap().msg {
			Message::BlockResponse { status, .. } => {
				assert_eq!(status, ResponseStatus::NotFound)
			}
			other => panic!("expected block_response, got {}", other.kind()),
		}
	}

	#[tokio::test]
	async fn test_heartbeat_reports_accounting() {
		let (_tmp, node, broker, mut confirmations) = test_node(1000, 1.0).await;
		let mut heartbeats = broker
			.bind_queue(griddfs_transport::QUEUE_HEARTBEAT)
			.await
			.unwrap();

		let data = b"0123456789";
		let (block_id, size, hash) = store_args(data);
		node.handle_store_block(&block_id, size, &hash, &encode_block_data(data))
			.await
			.unwrap();
		expect_confirmation(&mut confirmations);

		node.heartbeat_once().await.unwrap();
		match heartbeats.try_recv().unwrap().msg {
			Message::Heartbeat {
				node_id,
				storage_used,
				storage_capacity,
				storage_available,
				..
			} => {
				assert_eq!(node_id, "dn1");
				assert_eq!(storage_used, 10);
				assert_eq!(storage_capacity, 1000);
				assert_eq!(storage_available, 990);
			}
			other => panic!("expected heartbeat, got {}", other.kind()),
		}
	}

	#[tokio::test]
	async fn test_node_id_is_persisted() {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let config = StorageNodeConfig {
			node_id: None,
			data_dir: tmp.to_path_buf(),
			capacity: 1000,
			min_free_ratio: 0.10,
			accept_probability: 1.0,
		};
		let broker = MemoryBroker::new();
		let node = StorageNode::new(
			&config,
			Duration::from_secs(1),
			broker.clone() as Arc<dyn Transport>,
		)
		.await
		.unwrap();
		let id = node.id.clone();
		drop(node);

		let node = StorageNode::new(
			&config,
			Duration::from_secs(1),
			broker as Arc<dyn Transport>,
		)
		.await
		.unwrap();
		assert_eq!(node.id, id);
	}
}
