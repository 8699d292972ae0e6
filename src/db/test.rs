use crate::*;

use crate::sled_adapter::SledDb;

// Fixtures mirror how the coordinator uses this crate: one tree per
// entity, keys composed of NUL-separated components, and multi-tree
// transactions that only do point operations.

fn file_key(principal: &str, path: &str) -> Vec<u8> {
	[principal.as_bytes(), b"\x00", path.as_bytes()].concat()
}

fn open_test_db() -> (mktemp::Temp, Db) {
	let dir = mktemp::Temp::new_dir().unwrap();
	let db = SledDb::init(sled::open(dir.to_path_buf()).unwrap());
	(dir, db)
}

#[test]
fn test_point_ops_and_old_values() -> Result<()> {
	let (_dir, db) = open_test_db();
	let files = db.open_tree("file")?;

	let key = file_key("alice", "/a/b");
	assert_eq!(files.get(&key)?, None);

	assert_eq!(files.insert(&key, b"v1")?, None);
	assert_eq!(files.get(&key)?, Some(b"v1".to_vec()));
	assert_eq!(files.len()?, 1);

	// Upsert returns the previous value
	assert_eq!(files.insert(&key, b"v2")?, Some(b"v1".to_vec()));
	assert_eq!(files.get(&key)?, Some(b"v2".to_vec()));

	assert_eq!(files.remove(&key)?, Some(b"v2".to_vec()));
	assert_eq!(files.remove(&key)?, None);
	assert_eq!(files.len()?, 0);

	Ok(())
}

#[test]
fn test_multi_tree_transaction_commits_atomically() -> Result<()> {
	let (_dir, db) = open_test_db();
	let files = db.open_tree("file")?;
	let sessions = db.open_tree("session")?;

	let fkey = file_key("alice", "/a/b");
	let res = db.transaction::<_, (), _>(|mut tx| {
		tx.insert(&files, &fkey, b"file-entry")?;
		tx.insert(&sessions, b"upload-1", b"pending")?;
		tx.commit("planned")
	});
	assert!(matches!(res, Ok("planned")));

	assert_eq!(files.get(&fkey)?, Some(b"file-entry".to_vec()));
	assert_eq!(sessions.get(b"upload-1")?, Some(b"pending".to_vec()));
	Ok(())
}

#[test]
fn test_transaction_abort_rolls_back_all_trees() -> Result<()> {
	let (_dir, db) = open_test_db();
	let files = db.open_tree("file")?;
	let sessions = db.open_tree("session")?;

	let fkey = file_key("alice", "/a/b");
	files.insert(&fkey, b"existing")?;

	// The duplicate-path guard of the upload planner: probe, then
	// abort without leaving the session row behind
	let res = db.transaction::<(), _, _>(|mut tx| {
		tx.insert(&sessions, b"upload-2", b"pending")?;
		if tx.get(&files, &fkey)?.is_some() {
			return tx.abort("file already exists");
		}
		tx.insert(&files, &fkey, b"overwritten")?;
		tx.commit(())
	});
	assert!(matches!(res, Err(TxError::Abort("file already exists"))));

	assert_eq!(files.get(&fkey)?, Some(b"existing".to_vec()));
	assert_eq!(sessions.get(b"upload-2")?, None);
	Ok(())
}

#[test]
fn test_transaction_reads_its_own_writes() -> Result<()> {
	let (_dir, db) = open_test_db();
	let locations = db.open_tree("location")?;

	let lkey = [&b"block-1"[..], b"\x00", b"dn1"].concat();
	let res = db.transaction::<_, (), _>(|mut tx| {
		assert_eq!(tx.get(&locations, &lkey).unwrap(), None);
		tx.insert(&locations, &lkey, b"active")?;
		// The upsert must be visible to the progress recount that runs
		// later in the same transaction
		assert_eq!(tx.get(&locations, &lkey).unwrap(), Some(b"active".to_vec()));
		tx.remove(&locations, &lkey)?;
		assert_eq!(tx.get(&locations, &lkey).unwrap(), None);
		tx.commit(())
	});
	assert!(res.is_ok());
	assert_eq!(locations.get(&lkey)?, None);
	Ok(())
}

#[test]
fn test_prefix_range_scans_one_principal() -> Result<()> {
	let (_dir, db) = open_test_db();
	let files = db.open_tree("file")?;

	files.insert(&file_key("alice", "/a/a"), b"1")?;
	files.insert(&file_key("alice", "/a/b"), b"2")?;
	files.insert(&file_key("alicia", "/a/a"), b"3")?;
	files.insert(&file_key("bob", "/a/a"), b"4")?;

	// The list operation: scan from the principal's key prefix and
	// stop at the first foreign key
	let prefix = file_key("alice", "/");
	let mut listed = vec![];
	for item in files.range(prefix.clone()..)? {
		let (k, v) = item?;
		if !k.starts_with(&prefix) {
			break;
		}
		listed.push(v);
	}
	assert_eq!(listed, vec![b"1".to_vec(), b"2".to_vec()]);

	// Full iteration still sees every principal
	assert_eq!(files.iter()?.count(), 4);
	Ok(())
}

#[test]
fn test_cascade_of_point_removes() -> Result<()> {
	let (_dir, db) = open_test_db();
	let files = db.open_tree("file")?;
	let blocks = db.open_tree("block")?;
	let locations = db.open_tree("location")?;

	let fkey = file_key("alice", "/a/b");
	files.insert(&fkey, b"file")?;
	blocks.insert(b"block-1", b"b1")?;
	blocks.insert(b"block-2", b"b2")?;
	locations.insert(&[&b"block-1"[..], b"\x00", b"dn1"].concat(), b"active")?;
	locations.insert(&[&b"block-2"[..], b"\x00", b"dn2"].concat(), b"active")?;

	// The delete operation walks the forward lists with point removes
	let res = db.transaction::<_, (), _>(|mut tx| {
		for bid in &[&b"block-1"[..], &b"block-2"[..]] {
			tx.remove(&blocks, bid)?;
		}
		tx.remove(&locations, &[&b"block-1"[..], b"\x00", b"dn1"].concat())?;
		tx.remove(&locations, &[&b"block-2"[..], b"\x00", b"dn2"].concat())?;
		tx.remove(&files, &fkey)?;
		tx.commit(())
	});
	assert!(res.is_ok());

	assert_eq!(files.len()?, 0);
	assert_eq!(blocks.len()?, 0);
	assert_eq!(locations.len()?, 0);
	Ok(())
}
