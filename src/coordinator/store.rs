//! The coordinator's metadata store: five trees in the embedded
//! database, with the three compound operations (plan insertion,
//! storage confirmation, cascading delete) each running in one
//! serializable transaction.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use griddfs_db as db;
use griddfs_db::{Db, Tree, TxError};

use griddfs_util::data::rmp_to_vec_all_named;
use griddfs_util::time::now_msec;

use griddfs_transport::request_queue;

use crate::error::Error;
use crate::schema::*;

/// Key of a file entry: `(principal, path)`, NUL separated
pub fn file_key(principal: &str, path: &str) -> Vec<u8> {
	[principal.as_bytes(), b"\x00", path.as_bytes()].concat()
}

/// Key of a location entry: `(block_id, node_id)`, NUL separated
fn location_key(block_id: &str, node_id: &str) -> Vec<u8> {
	[block_id.as_bytes(), b"\x00", node_id.as_bytes()].concat()
}

fn enc<T: Serialize>(val: &T) -> Result<Vec<u8>, Error> {
	Ok(rmp_to_vec_all_named(val).map_err(griddfs_util::error::Error::from)?)
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
	Ok(rmp_serde::decode::from_read_ref(bytes)?)
}

fn enc_tx<T: Serialize>(val: &T) -> Result<Vec<u8>, TxError<Error>> {
	rmp_to_vec_all_named(val).map_err(|e| TxError::Abort(e.into()))
}

fn dec_tx<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TxError<Error>> {
	rmp_serde::decode::from_read_ref(bytes).map_err(|e| TxError::Abort(e.into()))
}

/// What became of one storage confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
	/// Location is active; flags tell whether this confirmation changed
	/// anything and whether the owning session is now completed
	Recorded {
		newly_placed: bool,
		session_completed: bool,
	},
	/// The block is not known (late confirmation for a deleted file)
	UnknownBlock,
}

pub struct MetadataStore {
	db: Db,
	file_tree: Tree,
	block_tree: Tree,
	location_tree: Tree,
	node_tree: Tree,
	session_tree: Tree,
	heartbeat_interval: Duration,
}

impl MetadataStore {
	pub fn open(db: &Db, heartbeat_interval: Duration) -> Result<Self, Error> {
		Ok(Self {
			db: db.clone(),
			file_tree: db.open_tree("file")?,
			block_tree: db.open_tree("block")?,
			location_tree: db.open_tree("location")?,
			node_tree: db.open_tree("node")?,
			session_tree: db.open_tree("session")?,
			heartbeat_interval,
		})
	}

	pub fn heartbeat_interval(&self) -> Duration {
		self.heartbeat_interval
	}

	// ---- Compound mutations ----

	/// Atomically insert a new file, its dense block sequence and the
	/// pending upload session tracking it
	pub fn insert_upload(
		&self,
		file: &FileEntry,
		blocks: &[BlockEntry],
		session: &SessionEntry,
	) -> Result<(), Error> {
		let fkey = file_key(&file.principal, &file.path);
		let fval = enc(file)?;
		let bvals = blocks
			.iter()
			.map(|b| Ok((b.id.as_bytes().to_vec(), enc(b)?)))
			.collect::<Result<Vec<_>, Error>>()?;
		let sval = enc(session)?;

		self.db
			.transaction(|mut tx| {
				if tx.get(&self.file_tree, &fkey)?.is_some() {
					return tx.abort(Error::AlreadyExists(file.path.clone()));
				}
				tx.insert(&self.file_tree, &fkey, &fval)?;
				for (k, v) in bvals.iter() {
					tx.insert(&self.block_tree, k, v)?;
				}
				tx.insert(&self.session_tree, session.id.as_bytes(), &sval)?;
				tx.commit(())
			})
			.map_err(Error::from)
	}

	/// Record a successful storage confirmation. Idempotent on
	/// `(block_id, node_id)`: replaying a confirmation changes nothing.
	pub fn record_storage_success(
		&self,
		block_id: &str,
		node_id: &str,
		storage_path: &str,
	) -> Result<ConfirmationOutcome, Error> {
		let now = now_msec();
		let lkey = location_key(block_id, node_id);

		self.db
			.transaction(|mut tx| {
				let mut block: BlockEntry = match tx.get(&self.block_tree, block_id.as_bytes())? {
					Some(v) => dec_tx(&v)?,
					None => return tx.commit(ConfirmationOutcome::UnknownBlock),
				};

				let existing: Option<LocationEntry> = match tx.get(&self.location_tree, &lkey)? {
					Some(v) => Some(dec_tx(&v)?),
					None => None,
				};
				let newly_placed =
					!matches!(&existing, Some(l) if l.status == LocationStatus::Active);
				if newly_placed {
					let loc = LocationEntry {
						block_id: block_id.to_string(),
						node_id: node_id.to_string(),
						status: LocationStatus::Active,
						storage_path: storage_path.to_string(),
						confirmed: now,
					};
					tx.insert(&self.location_tree, &lkey, enc_tx(&loc)?)?;
					if !block.nodes.iter().any(|n| n == node_id) {
						block.nodes.push(node_id.to_string());
						tx.insert(&self.block_tree, block_id.as_bytes(), enc_tx(&block)?)?;
					}
				}

				let session_completed = self.tx_update_session_progress(&mut tx, &block)?;
				tx.commit(ConfirmationOutcome::Recorded {
					newly_placed,
					session_completed,
				})
			})
			.map_err(Error::from)
	}

	/// Re-derive `completed_blocks` of the session owning `block` as the
	/// number of distinct blocks with at least one active location, and
	/// flip the session to completed when every block is placed.
	/// Terminal sessions are left untouched.
	fn tx_update_session_progress(
		&self,
		tx: &mut db::Transaction<'_>,
		block: &BlockEntry,
	) -> Result<bool, TxError<Error>> {
		let mut session: SessionEntry =
			match tx.get(&self.session_tree, block.upload_id.as_bytes())? {
				Some(v) => dec_tx(&v)?,
				None => return Ok(false),
			};
		if session.status.is_terminal() {
			return Ok(session.status == SessionStatus::Completed);
		}

		let file: FileEntry = match tx.get(&self.file_tree, &file_key(&block.principal, &block.path))? {
			Some(v) => dec_tx(&v)?,
			None => return Ok(false),
		};
		// The path may have been deleted and re-uploaded since this
		// session was opened; only the session that inserted the file
		// entry may account against it
		if file.upload_id != session.id {
			return Ok(false);
		}

		let mut completed = 0u32;
		for bid in file.blocks.iter() {
			let b: BlockEntry = match tx.get(&self.block_tree, bid.as_bytes())? {
				Some(v) => dec_tx(&v)?,
				None => continue,
			};
			let mut has_active = false;
			for n in b.nodes.iter() {
				if let Some(lv) = tx.get(&self.location_tree, &location_key(bid, n))? {
					let l: LocationEntry = dec_tx(&lv)?;
					if l.status == LocationStatus::Active {
						has_active = true;
						break;
					}
				}
			}
			if has_active {
				completed += 1;
			}
		}

		session.completed_blocks = session.completed_blocks.max(completed);
		if session.completed_blocks >= session.total_blocks {
			session.status = SessionStatus::Completed;
		}
		tx.insert(
			&self.session_tree,
			session.id.as_bytes(),
			enc_tx(&session)?,
		)?;
		Ok(session.status == SessionStatus::Completed)
	}

	/// A node reported it cannot vouch for this block anymore (hash
	/// mismatch on a re-store, local write failure). An active location
	/// becomes tombstoned; the session counter is monotonic and is not
	/// re-derived downwards.
	pub fn record_storage_failure(&self, block_id: &str, node_id: &str) -> Result<(), Error> {
		let lkey = location_key(block_id, node_id);
		self.db
			.transaction(|mut tx| {
				if let Some(lv) = tx.get(&self.location_tree, &lkey)? {
					let mut loc: LocationEntry = dec_tx(&lv)?;
					if loc.status == LocationStatus::Active {
						loc.status = LocationStatus::Tombstoned;
						tx.insert(&self.location_tree, &lkey, enc_tx(&loc)?)?;
					}
				}
				tx.commit(())
			})
			.map_err(Error::from)
	}

	/// Remove a file with all its blocks and their locations, in one
	/// transaction. Returns the removed entry.
	pub fn remove_file(&self, principal: &str, path: &str) -> Result<FileEntry, Error> {
		let fkey = file_key(principal, path);
		self.db
			.transaction(|mut tx| {
				let file: FileEntry = match tx.get(&self.file_tree, &fkey)? {
					Some(v) => dec_tx(&v)?,
					None => return tx.abort(Error::NotFound(path.to_string())),
				};
				self.tx_remove_blocks(&mut tx, &file)?;
				tx.remove(&self.file_tree, &fkey)?;
				tx.commit(file)
			})
			.map_err(Error::from)
	}

	fn tx_remove_blocks(
		&self,
		tx: &mut db::Transaction<'_>,
		file: &FileEntry,
	) -> Result<(), TxError<Error>> {
		for bid in file.blocks.iter() {
			if let Some(bv) = tx.get(&self.block_tree, bid.as_bytes())? {
				let b: BlockEntry = dec_tx(&bv)?;
				for n in b.nodes.iter() {
					tx.remove(&self.location_tree, &location_key(bid, n))?;
				}
				tx.remove(&self.block_tree, bid.as_bytes())?;
			}
		}
		Ok(())
	}

	/// Fail a pending session (administrator abort or elapsed deadline)
	/// and garbage-collect the file entry it pre-inserted, unless the
	/// path has since been deleted and re-uploaded by another session.
	/// Aborting an already failed session is a no-op.
	pub fn abort_session(&self, upload_id: &str) -> Result<(), Error> {
		self.db
			.transaction(|mut tx| {
				let mut session: SessionEntry =
					match tx.get(&self.session_tree, upload_id.as_bytes())? {
						Some(v) => dec_tx(&v)?,
						None => return tx.abort(Error::NotFound(upload_id.to_string())),
					};
				match session.status {
					SessionStatus::Failed => return tx.commit(()),
					SessionStatus::Completed => {
						return tx.abort(Error::invalid_input(format!(
							"upload session {} is already completed",
							upload_id
						)))
					}
					SessionStatus::Pending => (),
				}
				session.status = SessionStatus::Failed;
				tx.insert(
					&self.session_tree,
					upload_id.as_bytes(),
					enc_tx(&session)?,
				)?;

				let fkey = file_key(&session.principal, &session.path);
				if let Some(fv) = tx.get(&self.file_tree, &fkey)? {
					let file: FileEntry = dec_tx(&fv)?;
					if file.upload_id == session.id {
						self.tx_remove_blocks(&mut tx, &file)?;
						tx.remove(&self.file_tree, &fkey)?;
					}
				}
				tx.commit(())
			})
			.map_err(Error::from)
	}

	/// Upsert a node from a heartbeat. The stored `last_heartbeat` is
	/// the coordinator's own clock. Returns true if this registered a
	/// previously unknown node.
	pub fn record_heartbeat(
		&self,
		node_id: &str,
		capacity: u64,
		used: u64,
		available: u64,
	) -> Result<bool, Error> {
		let now = now_msec();
		self.db
			.transaction(|mut tx| {
				let existing: Option<NodeEntry> =
					match tx.get(&self.node_tree, node_id.as_bytes())? {
						Some(v) => Some(dec_tx(&v)?),
						None => None,
					};
				let is_new = existing.is_none();
				let entry = NodeEntry {
					id: node_id.to_string(),
					request_queue: request_queue(node_id),
					last_heartbeat: now,
					capacity,
					used,
					available,
					first_seen: existing.map(|e| e.first_seen).unwrap_or(now),
				};
				tx.insert(&self.node_tree, node_id.as_bytes(), enc_tx(&entry)?)?;
				tx.commit(is_new)
			})
			.map_err(Error::from)
	}

	// ---- Plain queries ----

	pub fn file(&self, principal: &str, path: &str) -> Result<Option<FileEntry>, Error> {
		self.file_tree
			.get(&file_key(principal, path))?
			.map(|v| dec(&v))
			.transpose()
	}

	pub fn list_files(&self, principal: &str, prefix: &str) -> Result<Vec<FileEntry>, Error> {
		let start = file_key(principal, prefix);
		let mut ret = vec![];
		for item in self.file_tree.range(start.clone()..)? {
			let (k, v) = item.map_err(griddfs_util::error::Error::from)?;
			if !k.starts_with(&start) {
				break;
			}
			ret.push(dec(&v)?);
		}
		Ok(ret)
	}

	pub fn block(&self, block_id: &str) -> Result<Option<BlockEntry>, Error> {
		self.block_tree
			.get(block_id.as_bytes())?
			.map(|v| dec(&v))
			.transpose()
	}

	pub fn location(
		&self,
		block_id: &str,
		node_id: &str,
	) -> Result<Option<LocationEntry>, Error> {
		self.location_tree
			.get(&location_key(block_id, node_id))?
			.map(|v| dec(&v))
			.transpose()
	}

	pub fn session(&self, upload_id: &str) -> Result<Option<SessionEntry>, Error> {
		self.session_tree
			.get(upload_id.as_bytes())?
			.map(|v| dec(&v))
			.transpose()
	}

	pub fn node(&self, node_id: &str) -> Result<Option<NodeEntry>, Error> {
		self.node_tree
			.get(node_id.as_bytes())?
			.map(|v| dec(&v))
			.transpose()
	}

	pub fn nodes(&self) -> Result<Vec<NodeEntry>, Error> {
		let mut ret = vec![];
		for item in self.node_tree.iter()? {
			let (_, v) = item.map_err(griddfs_util::error::Error::from)?;
			ret.push(dec(&v)?);
		}
		Ok(ret)
	}

	pub fn active_node_count(&self) -> Result<usize, Error> {
		let now = now_msec();
		Ok(self
			.nodes()?
			.iter()
			.filter(|n| n.is_active(now, self.heartbeat_interval))
			.count())
	}

	/// Assemble the per-block download descriptors of a file. Locations
	/// are filtered to active location rows on nodes whose derived
	/// liveness is active; a currently unretrievable block keeps its
	/// descriptor but gets an empty location list.
	pub fn download_blocks(&self, file: &FileEntry) -> Result<Vec<BlockDownload>, Error> {
		let now = now_msec();
		let mut ret = Vec::with_capacity(file.blocks.len());
		for bid in file.blocks.iter() {
			let block = self.block(bid)?.ok_or_else(|| {
				griddfs_util::error::Error::Message(format!(
					"Metadata inconsistency: block {} of file {} has no entry",
					bid, file.path
				))
			})?;
			let mut locations = vec![];
			for n in block.nodes.iter() {
				let loc = match self.location(bid, n)? {
					Some(l) if l.status == LocationStatus::Active => l,
					_ => continue,
				};
				match self.node(n)? {
					Some(node) if node.is_active(now, self.heartbeat_interval) => {
						locations.push(BlockLocation {
							node_id: node.id,
							request_queue: node.request_queue,
							storage_path: loc.storage_path,
						});
					}
					_ => (),
				}
			}
			ret.push(BlockDownload {
				block_id: block.id,
				index: block.index,
				size: block.size,
				hash: block.hash,
				locations,
			});
		}
		Ok(ret)
	}

	/// Pending sessions created before `now - deadline`
	pub fn expired_pending_sessions(&self, deadline: Duration) -> Result<Vec<String>, Error> {
		let cutoff = now_msec().saturating_sub(deadline.as_millis() as u64);
		let mut ret = vec![];
		for item in self.session_tree.iter()? {
			let (_, v) = item.map_err(griddfs_util::error::Error::from)?;
			let session: SessionEntry = dec(&v)?;
			if session.status == SessionStatus::Pending && session.created < cutoff {
				ret.push(session.id);
			}
		}
		Ok(ret)
	}
}
