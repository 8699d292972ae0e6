//! Splits a byte source into fixed-size blocks; only the last block of
//! a file may be shorter

use bytes::Bytes;

use tokio::io::{AsyncRead, AsyncReadExt};

use griddfs_util::error::Error;

pub struct Chunker<R: AsyncRead + Unpin> {
	reader: R,
	block_size: usize,
	done: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
	pub fn new(reader: R, block_size: usize) -> Self {
		Self {
			reader,
			block_size,
			done: false,
		}
	}

	/// Read the next block. Returns `None` once the source is
	/// exhausted.
	pub async fn next(&mut self) -> Result<Option<Bytes>, Error> {
		if self.done {
			return Ok(None);
		}

		let mut buf = vec![0u8; self.block_size];
		let mut filled = 0;
		while filled < self.block_size {
			let n = self.reader.read(&mut buf[filled..]).await?;
			if n == 0 {
				self.done = true;
				break;
			}
			filled += n;
		}

		if filled == 0 {
			Ok(None)
		} else {
			buf.truncate(filled);
			Ok(Some(buf.into()))
		}
	}
}
