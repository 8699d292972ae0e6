//! The local block store: raw block files named by block id, written
//! through a staging file, plus the used-bytes accounting

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use rand::prelude::*;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use griddfs_util::error::Error;

/// Block ids come from the fanout and end up as file names; anything
/// outside the token alphabet is treated as hostile and rejected
pub fn valid_block_id(id: &str) -> bool {
	!id.is_empty()
		&& id.len() <= 64
		&& id
			.bytes()
			.all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-')
}

pub struct BlockStore {
	root: PathBuf,
	used: Mutex<u64>,
}

impl BlockStore {
	/// Open the store, creating the storage root if needed, and recover
	/// the used-bytes counter by scanning it. Staging files left by
	/// interrupted writes are swept away; unreadable block files are
	/// deleted, and the coordinator only learns of their absence if it
	/// later cites them and the request comes back `not_found`.
	pub async fn open(root: PathBuf) -> Result<Self, Error> {
		fs::create_dir_all(&root).await?;

		let mut used = 0u64;
		let mut entries = fs::read_dir(&root).await?;
		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			if !entry.file_type().await?.is_file() {
				continue;
			}
			// Block ids never contain a dot, staging names always do
			if entry.file_name().to_string_lossy().contains('.') {
				debug!(
					"Sweeping staging file of an interrupted write: {}",
					path.display()
				);
				fs::remove_file(&path).await?;
				continue;
			}
			match probe_block_file(&path).await {
				Ok(len) => used += len,
				Err(e) => {
					warn!(
						"Deleting unreadable block file {}: {}",
						path.display(),
						e
					);
					fs::remove_file(&path).await?;
				}
			}
		}
		info!(
			"Block store at {} recovered, {} bytes used",
			root.display(),
			used
		);

		Ok(Self {
			root,
			used: Mutex::new(used),
		})
	}

	/// Bytes currently accounted for in the store
	pub fn used(&self) -> u64 {
		*self.used.lock().unwrap()
	}

	/// Full path where a block lives
	pub fn block_path(&self, block_id: &str) -> PathBuf {
		self.root.join(block_id)
	}

	/// Where the bytes of a block are staged until they are complete
	/// and synced. The random suffix keeps concurrent deliveries of the
	/// same block from clobbering each other's staging file.
	fn staging_path(&self, block_id: &str) -> PathBuf {
		let nonce: [u8; 4] = thread_rng().gen();
		self.root
			.join(format!("{}.wr{}", block_id, hex::encode(nonce)))
	}

	pub async fn contains(&self, block_id: &str) -> bool {
		fs::metadata(self.block_path(block_id)).await.is_ok()
	}

	/// Persist a block: stage its bytes, sync them, then move the
	/// staging file onto the block's final name in one rename. Writing
	/// a block that is already present is a no-op.
	pub async fn write_block(&self, block_id: &str, data: &[u8]) -> Result<PathBuf, Error> {
		let path = self.block_path(block_id);
		if fs::metadata(&path).await.is_ok() {
			return Ok(path);
		}

		let staging = self.staging_path(block_id);
		if let Err(e) = self.stage_and_publish(&staging, &path, data).await {
			// The sweep at the next start would catch it too, but a
			// failed write should not sit in the root until then
			let _ = fs::remove_file(&staging).await;
			return Err(e);
		}

		*self.used.lock().unwrap() += data.len() as u64;
		Ok(path)
	}

	async fn stage_and_publish(
		&self,
		staging: &Path,
		path: &Path,
		data: &[u8],
	) -> Result<(), Error> {
		let mut f = fs::File::create(staging).await?;
		f.write_all(data).await?;
		f.sync_all().await?;
		drop(f);

		fs::rename(staging, path).await?;

		// The rename is only durable once the directory metadata
		// itself is on disk, so the root gets its own fsync
		let root = fs::File::open(&self.root).await?;
		root.sync_all().await?;
		Ok(())
	}

	/// Read the raw bytes of a block. The bytes are returned exactly as
	/// stored, without re-hashing: integrity on the read path is the
	/// client's responsibility.
	pub async fn read_block(&self, block_id: &str) -> Result<Option<Bytes>, Error> {
		let path = self.block_path(block_id);
		let mut f = match fs::File::open(&path).await {
			Ok(f) => f,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let mut data = vec![];
		f.read_to_end(&mut data).await?;
		Ok(Some(data.into()))
	}
}

async fn probe_block_file(path: &Path) -> Result<u64, Error> {
	let meta = fs::metadata(path).await?;
	let mut f = fs::File::open(path).await?;
	if meta.len() > 0 {
		let mut first = [0u8; 1];
		f.read_exact(&mut first).await?;
	}
	Ok(meta.len())
}
