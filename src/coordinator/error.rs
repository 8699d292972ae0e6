use err_derive::Error;

use griddfs_db as db;

/// Errors of the coordinator API
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "Invalid input: {}", _0)]
	InvalidInput(String),

	#[error(display = "File already exists: {}", _0)]
	AlreadyExists(String),

	#[error(display = "Not found: {}", _0)]
	NotFound(String),

	#[error(display = "No active storage node to place blocks on")]
	NoCapacity,

	#[error(display = "File is not durable: block {} has no live replica", _0)]
	NotDurable(String),

	#[error(display = "Internal error: {}", _0)]
	Internal(#[error(source)] #[error(from)] griddfs_util::error::Error),
}

impl Error {
	pub fn invalid_input<M: Into<String>>(msg: M) -> Self {
		Error::InvalidInput(msg.into())
	}
}

impl From<db::Error> for Error {
	fn from(e: db::Error) -> Error {
		Error::Internal(e.into())
	}
}

impl From<db::TxOpError> for Error {
	fn from(e: db::TxOpError) -> Error {
		Error::Internal(e.into())
	}
}

impl From<db::TxError<Error>> for Error {
	fn from(e: db::TxError<Error>) -> Error {
		match e {
			db::TxError::Abort(x) => x,
			db::TxError::Db(x) => x.into(),
		}
	}
}

impl From<rmp_serde::encode::Error> for Error {
	fn from(e: rmp_serde::encode::Error) -> Error {
		Error::Internal(e.into())
	}
}

impl From<rmp_serde::decode::Error> for Error {
	fn from(e: rmp_serde::decode::Error) -> Error {
		Error::Internal(e.into())
	}
}
