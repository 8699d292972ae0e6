use err_derive::Error;

/// Errors of the client core
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "Block {} is unavailable: all its locations were exhausted", _0)]
	UnavailableBlock(String),

	#[error(display = "Downloaded file does not match its recorded content hash")]
	HashMismatch,

	#[error(display = "{}", _0)]
	Api(#[error(source)] #[error(from)] griddfs_coordinator::Error),

	#[error(display = "{}", _0)]
	Internal(#[error(source)] #[error(from)] griddfs_util::error::Error),
}
