//! Module containing error types used in GridDFS

use err_derive::Error;

use griddfs_db as db;

/// Regroup all infrastructure errors that can happen inside GridDFS
#[derive(Debug, Error)]
pub enum Error {
	// ---- CHANNELS AND SURROUNDINGS ----
	#[error(display = "IO error: {}", _0)]
	Io(#[error(source)] #[error(from)] std::io::Error),

	#[error(display = "Database error: {}", _0)]
	Db(#[error(source)] #[error(from)] db::Error),

	#[error(display = "Transaction error: {}", _0)]
	DbTx(#[error(source)] #[error(from)] db::TxOpError),

	#[error(display = "Timeout waiting for a reply")]
	Timeout,

	#[error(display = "Tokio join error: {}", _0)]
	TokioJoin(#[error(source)] #[error(from)] tokio::task::JoinError),

	// ---- SERIALIZATION ERRORS ----
	#[error(display = "Messagepack encode error: {}", _0)]
	RmpEncode(#[error(source)] #[error(from)] rmp_serde::encode::Error),

	#[error(display = "Messagepack decode error: {}", _0)]
	RmpDecode(#[error(source)] #[error(from)] rmp_serde::decode::Error),

	#[error(display = "JSON error: {}", _0)]
	Json(#[error(source)] #[error(from)] serde_json::error::Error),

	#[error(display = "TOML decode error: {}", _0)]
	TomlDecode(#[error(source)] #[error(from)] toml::de::Error),

	// ---- OTHER ERRORS ----
	#[error(display = "Invalid hex string: {}", _0)]
	Hex(#[error(source)] #[error(from)] hex::FromHexError),

	#[error(display = "{}", _0)]
	Message(String),
}

impl<E> From<db::TxError<E>> for Error
where
	Error: From<E>,
{
	fn from(e: db::TxError<E>) -> Error {
		match e {
			db::TxError::Abort(x) => x.into(),
			db::TxError::Db(x) => x.into(),
		}
	}
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for Error {
	fn from(_e: tokio::sync::watch::error::SendError<T>) -> Error {
		Error::Message("Watch send error".into())
	}
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
	fn from(_e: tokio::sync::mpsc::error::SendError<T>) -> Error {
		Error::Message("MPSC send error".into())
	}
}

/// Trait to map any error type to Error::Message
pub trait OkOrMessage {
	type S;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<Self::S, Error>;
}

impl<T, E> OkOrMessage for Result<T, E>
where
	E: std::fmt::Display,
{
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Ok(x) => Ok(x),
			Err(e) => Err(Error::Message(format!("{}: {}", message.into(), e))),
		}
	}
}

impl<T> OkOrMessage for Option<T> {
	type S = T;
	fn ok_or_message<M: Into<String>>(self, message: M) -> Result<T, Error> {
		match self {
			Some(x) => Ok(x),
			None => Err(Error::Message(message.into())),
		}
	}
}
