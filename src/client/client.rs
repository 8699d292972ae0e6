//! Upload and download pipelines: chunk-hash-plan-commit on the way
//! up, plan-fetch-verify-assemble on the way down

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use griddfs_util::config::Config;
use griddfs_util::data::{gen_token, sha256sum, Hash};

use griddfs_transport::message::{decode_block_data, Envelope, Message, ResponseStatus};
use griddfs_transport::{response_queue_prefix, Mailbox, Transport};

use griddfs_coordinator::schema::BlockDownload;
use griddfs_coordinator::Coordinator;

use crate::chunker::Chunker;
use crate::error::Error;

pub struct Client {
	principal: String,
	client_id: String,
	coordinator: Arc<Coordinator>,
	transport: Arc<dyn Transport>,
	request_timeout: Duration,
}

impl Client {
	pub fn new(
		config: &Config,
		principal: &str,
		coordinator: Arc<Coordinator>,
		transport: Arc<dyn Transport>,
	) -> Self {
		Self {
			principal: principal.to_string(),
			client_id: gen_token(),
			coordinator,
			transport,
			request_timeout: Duration::from_secs(config.request_timeout),
		}
	}

	/// Upload a local file: split it into blocks, register the plan
	/// with the coordinator and hand the block bytes over for fanout.
	/// Returns the upload id; durability is observed via the session,
	/// not awaited here.
	pub async fn put(&self, local_path: &Path, remote_path: &str) -> Result<String, Error> {
		let file = fs::File::open(local_path)
			.await
			.map_err(griddfs_util::error::Error::from)?;
		let mut chunker = Chunker::new(file, self.coordinator.block_size());

		let mut blocks: Vec<Bytes> = vec![];
		let mut block_hashes: Vec<Hash> = vec![];
		let mut file_hasher = Sha256::new();
		let mut size = 0u64;
		while let Some(chunk) = chunker.next().await? {
			size += chunk.len() as u64;
			block_hashes.push(sha256sum(&chunk));
			file_hasher.update(&chunk);
			blocks.push(chunk);
		}
		let mut file_hash = [0u8; 32];
		file_hash.copy_from_slice(&file_hasher.finalize()[..]);

		let plan = self.coordinator.create_upload_plan(
			&self.principal,
			remote_path,
			size,
			&block_hashes,
			file_hash.into(),
		)?;
		info!(
			"Uploading {} as {}: {} blocks, upload id {}",
			local_path.display(),
			remote_path,
			plan.total_blocks,
			plan.upload_id
		);
		self.coordinator
			.commit_blocks(&plan.upload_id, blocks)
			.await?;
		Ok(plan.upload_id)
	}

	/// Download a remote file to a local path. Blocks are fetched in
	/// index order, each from the first of its locations that returns
	/// bytes matching the expected hash.
	pub async fn get(&self, remote_path: &str, local_path: &Path) -> Result<(), Error> {
		let plan = self
			.coordinator
			.get_download_plan(&self.principal, remote_path)?;
		let (reply_address, mut replies) = self
			.transport
			.bind_ephemeral(&response_queue_prefix(&self.client_id))
			.await?;

		let mut out = fs::File::create(local_path)
			.await
			.map_err(griddfs_util::error::Error::from)?;
		let mut file_hasher = Sha256::new();
		for block in plan.blocks.iter() {
			let data = self.fetch_block(block, &reply_address, &mut replies).await?;
			file_hasher.update(&data);
			out.write_all(&data)
				.await
				.map_err(griddfs_util::error::Error::from)?;
		}
		out.flush()
			.await
			.map_err(griddfs_util::error::Error::from)?;

		let mut file_hash = [0u8; 32];
		file_hash.copy_from_slice(&file_hasher.finalize()[..]);
		if Hash::from(file_hash) != plan.hash {
			return Err(Error::HashMismatch);
		}
		info!("Downloaded {} to {}", remote_path, local_path.display());
		Ok(())
	}

	/// Try each live location of a block in turn until one returns
	/// bytes with the right hash
	async fn fetch_block(
		&self,
		block: &BlockDownload,
		reply_address: &str,
		replies: &mut Mailbox,
	) -> Result<Bytes, Error> {
		for location in block.locations.iter() {
			self.transport
				.publish(
					&location.request_queue,
					Envelope::new(Message::RequestBlock {
						block_id: block.block_id.clone(),
						client_id: self.client_id.clone(),
						reply_address: reply_address.to_string(),
					}),
				)
				.await?;

			let data = match await_block_response(
				replies,
				&block.block_id,
				self.request_timeout,
			)
			.await
			{
				Some(data) => data,
				None => {
					warn!(
						"Node {} did not return block {}, trying next location",
						location.node_id, block.block_id
					);
					continue;
				}
			};
			if sha256sum(&data) != block.hash {
				warn!(
					"Block {} from node {} does not match its hash, trying next location",
					block.block_id, location.node_id
				);
				continue;
			}
			return Ok(data.into());
		}
		Err(Error::UnavailableBlock(block.block_id.clone()))
	}
}

/// Await the response for one block on the reply queue, discarding
/// stale replies left over from timed-out requests. `None` covers
/// timeout, `not_found`, node-side errors and undecodable payloads: the
/// caller falls back to the next location either way.
async fn await_block_response(
	replies: &mut Mailbox,
	block_id: &str,
	request_timeout: Duration,
) -> Option<Vec<u8>> {
	let deadline = Instant::now() + request_timeout;
	loop {
		let remaining = deadline.checked_duration_since(Instant::now())?;
		let env = match tokio::time::timeout(remaining, replies.recv()).await {
			Ok(Some(env)) => env,
			// Queue closed or timed out
			Ok(None) => return None,
			Err(_) => return None,
		};
		match env.msg {
			Message::BlockResponse {
				block_id: bid,
				status,
				block_data,
				error_message,
			} => {
				if bid != block_id {
					debug!("Discarding stale reply for block {}", bid);
					continue;
				}
				match status {
					ResponseStatus::Success => {
						return block_data.and_then(|d| decode_block_data(&d).ok());
					}
					ResponseStatus::NotFound => return None,
					ResponseStatus::Error => {
						warn!(
							"Node-side error for block {}: {}",
							bid,
							error_message.as_deref().unwrap_or("(no detail)")
						);
						return None;
					}
				}
			}
			other => {
				debug!("Discarding unexpected {} reply", other.kind());
				continue;
			}
		}
	}
}
