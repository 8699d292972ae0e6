//! The coordinator component: upload/download planning, block fanout,
//! and the handlers behind the confirmation and heartbeat consumers

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use griddfs_db::Db;

use griddfs_util::background::BackgroundRunner;
use griddfs_util::config::Config;
use griddfs_util::data::{gen_token, sha256sum, Hash};
use griddfs_util::time::now_msec;

use griddfs_transport::message::{encode_block_data, ConfirmStatus, Envelope, Message};
use griddfs_transport::{Transport, QUEUE_HEARTBEAT, QUEUE_STORAGE_CONFIRM};

use crate::error::Error;
use crate::schema::*;
use crate::store::{ConfirmationOutcome, MetadataStore};
use crate::workers::{ConfirmationWorker, HeartbeatWorker, SessionExpiryWorker};

pub struct Coordinator {
	pub store: MetadataStore,
	transport: Arc<dyn Transport>,

	block_size: usize,
	max_upload_size: u64,
	upload_deadline: Duration,
}

impl Coordinator {
	pub fn new(config: &Config, db: &Db, transport: Arc<dyn Transport>) -> Result<Arc<Self>, Error> {
		let store = MetadataStore::open(db, Duration::from_secs(config.heartbeat_interval))?;
		Ok(Arc::new(Self {
			store,
			transport,
			block_size: config.block_size,
			max_upload_size: config.max_upload_size,
			upload_deadline: Duration::from_secs(config.upload_deadline),
		}))
	}

	pub fn block_size(&self) -> usize {
		self.block_size
	}

	/// Spawn the two consumer loops (storage confirmations, heartbeats)
	/// and the session deadline sweeper
	pub async fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner) -> Result<(), Error> {
		let confirmations = self.transport.bind_queue(QUEUE_STORAGE_CONFIRM).await?;
		bg.spawn_worker(ConfirmationWorker::new(self.clone(), confirmations));

		let heartbeats = self.transport.bind_queue(QUEUE_HEARTBEAT).await?;
		bg.spawn_worker(HeartbeatWorker::new(self.clone(), heartbeats));

		bg.spawn_worker(SessionExpiryWorker::new(self.clone(), self.upload_deadline));
		Ok(())
	}

	// ---- Namespace operations ----

	/// Register a new file with a dense block sequence and a pending
	/// upload session. Does not wait for any storage confirmation.
	pub fn create_upload_plan(
		&self,
		principal: &str,
		path: &str,
		size: u64,
		block_hashes: &[Hash],
		file_hash: Hash,
	) -> Result<UploadPlan, Error> {
		check_principal(principal)?;
		check_path(path)?;
		if size == 0 {
			return Err(Error::invalid_input("cannot upload an empty file"));
		}
		if size > self.max_upload_size {
			return Err(Error::invalid_input(format!(
				"file of {} bytes exceeds the maximum upload size of {} bytes",
				size, self.max_upload_size
			)));
		}
		let total_blocks = (size + self.block_size as u64 - 1) / self.block_size as u64;
		if block_hashes.len() as u64 != total_blocks {
			return Err(Error::invalid_input(format!(
				"expected {} block hashes for {} bytes, got {}",
				total_blocks,
				size,
				block_hashes.len()
			)));
		}
		if self.store.active_node_count()? == 0 {
			return Err(Error::NoCapacity);
		}

		let now = now_msec();
		let upload_id = gen_token();

		let mut blocks = Vec::with_capacity(block_hashes.len());
		let mut descriptors = Vec::with_capacity(block_hashes.len());
		for (index, hash) in block_hashes.iter().enumerate() {
			let offset = index as u64 * self.block_size as u64;
			let block_size = std::cmp::min(self.block_size as u64, size - offset);
			let block_id = gen_token();
			descriptors.push(BlockDescriptor {
				block_id: block_id.clone(),
				index: index as u32,
				size: block_size,
				hash: *hash,
			});
			blocks.push(BlockEntry {
				id: block_id,
				principal: principal.to_string(),
				path: path.to_string(),
				upload_id: upload_id.clone(),
				index: index as u32,
				size: block_size,
				hash: *hash,
				nodes: vec![],
			});
		}

		let file = FileEntry {
			principal: principal.to_string(),
			path: path.to_string(),
			size,
			hash: file_hash,
			created: now,
			upload_id: upload_id.clone(),
			blocks: blocks.iter().map(|b| b.id.clone()).collect(),
		};
		let session = SessionEntry {
			id: upload_id.clone(),
			principal: principal.to_string(),
			path: path.to_string(),
			total_blocks: total_blocks as u32,
			completed_blocks: 0,
			status: SessionStatus::Pending,
			created: now,
		};

		self.store.insert_upload(&file, &blocks, &session)?;
		info!(
			"Planned upload {} for {} ({} blocks, {} bytes)",
			session.id, path, total_blocks, size
		);

		Ok(UploadPlan {
			upload_id,
			total_blocks: total_blocks as u32,
			blocks: descriptors,
		})
	}

	/// Fan every block of a planned upload out to all storage nodes.
	/// Returns as soon as the messages are published; placement progress
	/// is observed through the upload session.
	pub async fn commit_blocks(&self, upload_id: &str, blocks: Vec<Bytes>) -> Result<(), Error> {
		let session = self
			.store
			.session(upload_id)?
			.ok_or_else(|| Error::NotFound(upload_id.to_string()))?;
		if session.status.is_terminal() {
			return Err(Error::invalid_input(format!(
				"upload session {} is not pending anymore",
				upload_id
			)));
		}
		let file = self
			.store
			.file(&session.principal, &session.path)?
			.filter(|f| f.upload_id == session.id)
			.ok_or_else(|| Error::NotFound(session.path.clone()))?;
		if blocks.len() != file.blocks.len() {
			return Err(Error::invalid_input(format!(
				"upload {} has {} planned blocks, got {}",
				upload_id,
				file.blocks.len(),
				blocks.len()
			)));
		}

		for (block_id, data) in file.blocks.iter().zip(blocks.into_iter()) {
			let entry = self.store.block(block_id)?.ok_or_else(|| {
				griddfs_util::error::Error::Message(format!(
					"Metadata inconsistency: block {} of upload {} has no entry",
					block_id, upload_id
				))
			})?;
			if data.len() as u64 != entry.size {
				return Err(Error::invalid_input(format!(
					"block {} has {} bytes, plan says {}",
					block_id,
					data.len(),
					entry.size
				)));
			}
			if sha256sum(&data) != entry.hash {
				return Err(Error::invalid_input(format!(
					"block {} does not match its planned hash",
					block_id
				)));
			}

			self.transport
				.publish_fanout(Envelope::new(Message::StoreBlock {
					block_id: entry.id.clone(),
					block_index: entry.index,
					block_size: entry.size,
					block_hash: entry.hash.hex(),
					upload_id: upload_id.to_string(),
					block_data: encode_block_data(&data),
				}))
				.await
				.map_err(Error::Internal)?;
			debug!("Block {} of upload {} fanned out", entry.id, upload_id);
		}
		info!("All blocks of upload {} fanned out", upload_id);
		Ok(())
	}

	/// Enumerate the blocks of a file with their current live locations,
	/// in index order. The plan is returned even if some block has no
	/// live location; callers turn that into their own unavailability
	/// error when they need the whole content.
	pub fn get_download_plan(&self, principal: &str, path: &str) -> Result<DownloadPlan, Error> {
		let file = self
			.store
			.file(principal, path)?
			.ok_or_else(|| Error::NotFound(path.to_string()))?;
		let blocks = self.store.download_blocks(&file)?;
		if let Some(missing) = blocks.iter().find(|b| b.locations.is_empty()) {
			warn!(
				"Download plan for {} is not durable: block {} has no live location",
				path, missing.block_id
			);
		}
		Ok(DownloadPlan {
			path: file.path,
			size: file.size,
			hash: file.hash,
			blocks,
		})
	}

	/// Like [`Coordinator::get_download_plan`], but fail outright with
	/// `NotDurable` when some block has no live location
	pub fn get_durable_download_plan(
		&self,
		principal: &str,
		path: &str,
	) -> Result<DownloadPlan, Error> {
		let plan = self.get_download_plan(principal, path)?;
		if let Some(missing) = plan.first_unavailable() {
			return Err(Error::NotDurable(missing.block_id.clone()));
		}
		Ok(plan)
	}

	pub fn list(&self, principal: &str, prefix: &str) -> Result<Vec<FileEntry>, Error> {
		check_principal(principal)?;
		self.store.list_files(principal, prefix)
	}

	/// Remove a file with all its blocks and locations. Storage nodes
	/// are not told; their copies become garbage that is never cited in
	/// any plan again.
	pub fn delete(&self, principal: &str, path: &str) -> Result<(), Error> {
		let file = self.store.remove_file(principal, path)?;
		info!("Deleted {} ({} blocks)", path, file.blocks.len());
		Ok(())
	}

	/// Administrator abort of a pending upload
	pub fn abort_upload(&self, upload_id: &str) -> Result<(), Error> {
		self.store.abort_session(upload_id)?;
		info!("Upload session {} aborted", upload_id);
		Ok(())
	}

	pub fn upload_session(&self, upload_id: &str) -> Result<SessionEntry, Error> {
		self.store
			.session(upload_id)?
			.ok_or_else(|| Error::NotFound(upload_id.to_string()))
	}

	pub fn system_status(&self) -> Result<SystemStatus, Error> {
		let now = now_msec();
		let interval = self.store.heartbeat_interval();
		let mut nodes = vec![];
		let mut total_capacity = 0;
		let mut total_used = 0;
		let mut total_available = 0;
		let mut active_nodes = 0;
		for n in self.store.nodes()? {
			let liveness = n.liveness(now, interval);
			if liveness == NodeLiveness::Active {
				active_nodes += 1;
			}
			total_capacity += n.capacity;
			total_used += n.used;
			total_available += n.available;
			nodes.push(NodeStatus {
				id: n.id,
				liveness,
				capacity: n.capacity,
				used: n.used,
				available: n.available,
				last_heartbeat: n.last_heartbeat,
			});
		}
		Ok(SystemStatus {
			nodes,
			total_capacity,
			total_used,
			total_available,
			active_nodes,
		})
	}

	// ---- Consumer handlers ----

	pub(crate) fn handle_confirmation(
		&self,
		block_id: &str,
		node_id: &str,
		storage_path: &str,
		status: ConfirmStatus,
		error_message: Option<&str>,
	) -> Result<(), Error> {
		match status {
			ConfirmStatus::Success => {
				match self
					.store
					.record_storage_success(block_id, node_id, storage_path)?
				{
					ConfirmationOutcome::Recorded {
						newly_placed,
						session_completed,
					} => {
						if newly_placed {
							info!("Block {} placed on node {}", block_id, node_id);
						} else {
							debug!(
								"Replayed confirmation for block {} on node {}",
								block_id, node_id
							);
						}
						if session_completed {
							info!("Upload owning block {} is completed", block_id);
						}
					}
					ConfirmationOutcome::UnknownBlock => {
						info!(
							"Ignoring confirmation for unknown block {} from node {} (file deleted?)",
							block_id, node_id
						);
					}
				}
			}
			ConfirmStatus::InsufficientSpace | ConfirmStatus::Declined => {
				debug!(
					"Node {} did not keep block {}: {:?}",
					node_id, block_id, status
				);
			}
			ConfirmStatus::Error => {
				warn!(
					"Node {} failed to store block {}: {}",
					node_id,
					block_id,
					error_message.unwrap_or("(no detail)")
				);
				self.store.record_storage_failure(block_id, node_id)?;
			}
		}
		Ok(())
	}

	pub(crate) fn handle_heartbeat(
		&self,
		node_id: &str,
		capacity: u64,
		used: u64,
		available: u64,
	) -> Result<(), Error> {
		let is_new = self.store.record_heartbeat(node_id, capacity, used, available)?;
		if is_new {
			info!("Registered new storage node {}", node_id);
		} else {
			trace!("Heartbeat from node {}", node_id);
		}
		Ok(())
	}

	pub(crate) fn sweep_expired_sessions(&self) -> Result<(), Error> {
		for upload_id in self.store.expired_pending_sessions(self.upload_deadline)? {
			warn!(
				"Upload session {} still pending after {}s, marking failed",
				upload_id,
				self.upload_deadline.as_secs()
			);
			self.store.abort_session(&upload_id)?;
		}
		Ok(())
	}
}

fn check_principal(principal: &str) -> Result<(), Error> {
	if principal.is_empty() || principal.contains('\0') {
		return Err(Error::invalid_input("invalid principal identifier"));
	}
	Ok(())
}

fn check_path(path: &str) -> Result<(), Error> {
	if path.is_empty() || !path.starts_with('/') || path.contains('\0') {
		return Err(Error::invalid_input(format!(
			"invalid path {:?}: must be absolute",
			path
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	use griddfs_db::sled_adapter::{sled, SledDb};
	use griddfs_transport::memory::MemoryBroker;
	use griddfs_transport::{fanout_queue, message::decode_block_data};

	fn test_coordinator(block_size: usize) -> (mktemp::Temp, Arc<Coordinator>, Arc<MemoryBroker>) {
		let tmp = mktemp::Temp::new_dir().unwrap();
		let db = SledDb::init(sled::open(tmp.to_path_buf()).unwrap());
		let config = Config {
			metadata_dir: tmp.to_path_buf(),
			block_size,
			max_upload_size: 1024,
			heartbeat_interval: 10,
			request_timeout: 1,
			upload_deadline: 300,
			storage_nodes: vec![],
		};
		let broker = MemoryBroker::new();
		let coordinator =
			Coordinator::new(&config, &db, broker.clone() as Arc<dyn Transport>).unwrap();
		(tmp, coordinator, broker)
	}

	fn block_hashes(data: &[u8], block_size: usize) -> Vec<Hash> {
		data.chunks(block_size).map(sha256sum).collect()
	}

	#[test]
	fn test_plan_validation() {
		let (_tmp, coordinator, _broker) = test_coordinator(5);
		let data = b"hello world";
		let hashes = block_hashes(data, 5);
		let fhash = sha256sum(data);

		// No node has ever sent a heartbeat
		assert!(matches!(
			coordinator
				.create_upload_plan("alice", "/a/b", data.len() as u64, &hashes, fhash)
				.unwrap_err(),
			Error::NoCapacity
		));
		coordinator.handle_heartbeat("dn1", 1000, 0, 1000).unwrap();

		assert!(matches!(
			coordinator
				.create_upload_plan("alice", "/a/b", 0, &[], fhash)
				.unwrap_err(),
			Error::InvalidInput(_)
		));
		assert!(matches!(
			coordinator
				.create_upload_plan("alice", "relative/path", 11, &hashes, fhash)
				.unwrap_err(),
			Error::InvalidInput(_)
		));
		assert!(matches!(
			coordinator
				.create_upload_plan("alice", "/a/b", 2048, &hashes, fhash)
				.unwrap_err(),
			Error::InvalidInput(_)
		));
		// Hash count must match the computed block count
		assert!(matches!(
			coordinator
				.create_upload_plan("alice", "/a/b", 11, &hashes[..2], fhash)
				.unwrap_err(),
			Error::InvalidInput(_)
		));
	}

	#[test]
	fn test_plan_blocks_are_dense() {
		let (_tmp, coordinator, _broker) = test_coordinator(5);
		coordinator.handle_heartbeat("dn1", 1000, 0, 1000).unwrap();

		let data = b"hello world";
		let plan = coordinator
			.create_upload_plan(
				"alice",
				"/a/b",
				data.len() as u64,
				&block_hashes(data, 5),
				sha256sum(data),
			)
			.unwrap();

		assert_eq!(plan.total_blocks, 3);
		let indexes: Vec<u32> = plan.blocks.iter().map(|b| b.index).collect();
		assert_eq!(indexes, vec![0, 1, 2]);
		let sizes: Vec<u64> = plan.blocks.iter().map(|b| b.size).collect();
		assert_eq!(sizes, vec![5, 5, 1]);
		assert_eq!(plan.blocks.iter().map(|b| b.size).sum::<u64>(), 11);

		let session = coordinator.upload_session(&plan.upload_id).unwrap();
		assert_eq!(session.status, SessionStatus::Pending);
		assert_eq!(session.total_blocks, 3);

		// Second upload to the same path fails and commits nothing
		assert!(matches!(
			coordinator
				.create_upload_plan(
					"alice",
					"/a/b",
					data.len() as u64,
					&block_hashes(data, 5),
					sha256sum(data),
				)
				.unwrap_err(),
			Error::AlreadyExists(_)
		));
		assert_eq!(coordinator.list("alice", "/").unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_commit_blocks_fans_out() {
		let (_tmp, coordinator, broker) = test_coordinator(5);
		coordinator.handle_heartbeat("dn1", 1000, 0, 1000).unwrap();
		let mut inbox = broker.bind_fanout(&fanout_queue("dn1")).await.unwrap();

		let data = b"hello world";
		let plan = coordinator
			.create_upload_plan(
				"alice",
				"/a/b",
				data.len() as u64,
				&block_hashes(data, 5),
				sha256sum(data),
			)
			.unwrap();

		// Payload must match the plan
		let bad = vec![Bytes::from_static(b"xxxxx"); 3];
		assert!(matches!(
			coordinator.commit_blocks(&plan.upload_id, bad).await,
			Err(Error::InvalidInput(_))
		));
		assert!(matches!(
			coordinator.commit_blocks("unknown-upload", vec![]).await,
			Err(Error::NotFound(_))
		));

		let chunks: Vec<Bytes> = data
			.chunks(5)
			.map(|c| Bytes::copy_from_slice(c))
			.collect();
		coordinator
			.commit_blocks(&plan.upload_id, chunks)
			.await
			.unwrap();

		for expected in plan.blocks.iter() {
			let env = inbox.try_recv().expect("missing fanout message");
			match env.msg {
				Message::StoreBlock {
					block_id,
					block_index,
					block_size,
					block_hash,
					block_data,
					..
				} => {
					assert_eq!(block_id, expected.block_id);
					assert_eq!(block_index, expected.index);
					assert_eq!(block_size, expected.size);
					assert_eq!(block_hash, expected.hash.hex());
					let bytes = decode_block_data(&block_data).unwrap();
					assert_eq!(sha256sum(&bytes), expected.hash);
				}
				_ => panic!("expected a store_block message"),
			}
		}
		assert!(inbox.try_recv().is_none());
	}

	#[tokio::test]
	async fn test_download_plan_after_confirmations() {
		let (_tmp, coordinator, _broker) = test_coordinator(5);
		coordinator.handle_heartbeat("dn1", 1000, 0, 1000).unwrap();

		assert!(matches!(
			coordinator.get_download_plan("alice", "/a/b").unwrap_err(),
			Error::NotFound(_)
		));

		let data = b"hello world";
		let plan = coordinator
			.create_upload_plan(
				"alice",
				"/a/b",
				data.len() as u64,
				&block_hashes(data, 5),
				sha256sum(data),
			)
			.unwrap();

		// Not all blocks confirmed yet: the plan is returned with an
		// empty location list on the missing blocks
		coordinator
			.handle_confirmation(
				&plan.blocks[0].block_id,
				"dn1",
				"/data/dn1/b0",
				ConfirmStatus::Success,
				None,
			)
			.unwrap();
		let dl = coordinator.get_download_plan("alice", "/a/b").unwrap();
		assert_eq!(dl.blocks.len(), 3);
		assert_eq!(dl.blocks[0].locations.len(), 1);
		assert!(dl.blocks[1].locations.is_empty());
		assert!(matches!(
			coordinator
				.get_durable_download_plan("alice", "/a/b")
				.unwrap_err(),
			Error::NotDurable(_)
		));

		for b in plan.blocks.iter() {
			coordinator
				.handle_confirmation(
					&b.block_id,
					"dn1",
					&format!("/data/dn1/{}", b.block_id),
					ConfirmStatus::Success,
					None,
				)
				.unwrap();
		}
		// Declines are not placement
		coordinator
			.handle_confirmation(
				&plan.blocks[1].block_id,
				"dn2",
				"",
				ConfirmStatus::Declined,
				None,
			)
			.unwrap();

		let dl = coordinator.get_download_plan("alice", "/a/b").unwrap();
		assert!(dl.blocks.iter().all(|b| b.locations.len() == 1));
		let session = coordinator.upload_session(&plan.upload_id).unwrap();
		assert_eq!(session.status, SessionStatus::Completed);
		assert_eq!(session.completed_blocks, 3);

		let status = coordinator.system_status().unwrap();
		assert_eq!(status.active_nodes, 1);
		assert_eq!(status.total_capacity, 1000);
	}
}
