//! Module containing common data structures: content hashes, opaque
//! identifiers and the serialization helpers for metadata entries

use rand::prelude::*;
use serde::de::{self, Deserialize, Deserializer, Visitor};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// An array of 32 bytes
#[derive(Default, PartialOrd, Ord, Clone, Hash, PartialEq, Eq, Copy)]
pub struct FixedBytes32([u8; 32]);

impl From<[u8; 32]> for FixedBytes32 {
	fn from(x: [u8; 32]) -> FixedBytes32 {
		FixedBytes32(x)
	}
}

impl std::convert::TryFrom<&[u8]> for FixedBytes32 {
	type Error = std::array::TryFromSliceError;
	fn try_from(by: &[u8]) -> Result<Self, Self::Error> {
		Ok(Self(*<&[u8; 32]>::try_from(by)?))
	}
}

impl AsRef<[u8]> for FixedBytes32 {
	fn as_ref(&self) -> &[u8] {
		&self.0[..]
	}
}

impl FixedBytes32 {
	/// Access the content as a slice
	pub fn as_slice(&self) -> &[u8] {
		&self.0[..]
	}
	/// Copy to a `Vec<u8>`
	pub fn to_vec(&self) -> Vec<u8> {
		self.0.to_vec()
	}
	/// Encode to a hexadecimal string
	pub fn hex(&self) -> String {
		hex::encode(&self.0)
	}
	/// Parse from a hexadecimal string
	pub fn parse_hex(s: &str) -> Result<Self, Error> {
		let mut ret = [0u8; 32];
		hex::decode_to_slice(s, &mut ret)?;
		Ok(Self(ret))
	}
}

impl std::fmt::Debug for FixedBytes32 {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}…", hex::encode(&self.0[..8]))
	}
}

impl Serialize for FixedBytes32 {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_bytes(&self.0[..])
	}
}

struct FixedBytes32Visitor;
impl<'de> Visitor<'de> for FixedBytes32Visitor {
	type Value = FixedBytes32;

	fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(formatter, "a byte slice of size 32")
	}

	fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<Self::Value, E> {
		if value.len() == 32 {
			let mut res = [0u8; 32];
			res.copy_from_slice(value);
			Ok(res.into())
		} else {
			Err(E::custom(format!(
				"invalid byte string length {}, expected 32",
				value.len()
			)))
		}
	}
}

impl<'de> Deserialize<'de> for FixedBytes32 {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<FixedBytes32, D::Error> {
		deserializer.deserialize_bytes(FixedBytes32Visitor)
	}
}

/// A SHA-256 content hash
pub type Hash = FixedBytes32;

/// Compute the SHA-256 hash of a slice
pub fn sha256sum(data: &[u8]) -> Hash {
	let mut hasher = Sha256::new();
	hasher.update(data);
	let mut hash = [0u8; 32];
	hash.copy_from_slice(&hasher.finalize()[..]);
	hash.into()
}

/// Alphabet used for opaque identifiers: URL-safe, no escaping needed
/// in queue names or storage paths
const TOKEN_ALPHABET: &[u8; 64] =
	b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Length of generated tokens; 21 chars of a 64-symbol alphabet is 126
/// bits of entropy
pub const TOKEN_LEN: usize = 21;

/// Generate an opaque, URL-safe, globally unique identifier.
/// Used for block ids, upload ids and client ids.
pub fn gen_token() -> String {
	let mut rng = thread_rng();
	(0..TOKEN_LEN)
		.map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
		.collect()
}

/// Serialize to MessagePack with field names
pub fn rmp_to_vec_all_named<T>(val: &T) -> Result<Vec<u8>, rmp_serde::encode::Error>
where
	T: Serialize + ?Sized,
{
	let mut wr = Vec::with_capacity(128);
	let mut se = rmp_serde::Serializer::new(&mut wr)
		.with_struct_map()
		.with_string_variants();
	val.serialize(&mut se)?;
	Ok(wr)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_sha256sum() {
		// sha256("hello world")
		assert_eq!(
			sha256sum(b"hello world").hex(),
			"b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
		);
	}

	#[test]
	fn test_hash_hex_roundtrip() {
		let h = sha256sum(b"griddfs");
		let h2 = Hash::parse_hex(&h.hex()).unwrap();
		assert_eq!(h, h2);
		assert!(Hash::parse_hex("not a hash").is_err());
	}

	#[test]
	fn test_gen_token() {
		let tok = gen_token();
		assert_eq!(tok.len(), TOKEN_LEN);
		assert!(tok.bytes().all(|c| TOKEN_ALPHABET.contains(&c)));
		assert_ne!(gen_token(), gen_token());
	}
}
