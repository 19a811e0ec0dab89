// Copyright 2021 The Cirrus Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hash Function
//!
//! Primary hash function used in the protocol.

use std::cmp::min;
use std::fmt;

use crate::blake2::blake2b::blake2b;

use crate::ser::{self, Readable, Reader, Writeable, Writer};

/// A hash to uniquely (or close enough) identify one of the main blockchain
/// constructs. Used pervasively for blocks and chunk commitments.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord, Hash)]
pub struct Hash(pub [u8; 32]);

/// The hash of nothing, used as a placeholder anchor.
pub const ZERO_HASH: Hash = Hash([0; 32]);

impl fmt::Debug for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let hash_hex = self.to_hex();
		const NUM_SHOW: usize = 12;
		write!(f, "{}", &hash_hex[..NUM_SHOW])
	}
}

impl fmt::Display for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for i in self.0.iter() {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}

impl Hash {
	/// Size of a hash in bytes.
	pub const LEN: usize = 32;

	/// Builds a Hash from a byte vector. If the vector is too short, it will
	/// be completed by zeroes. If it's too long, it will be truncated.
	pub fn from_vec(v: &[u8]) -> Hash {
		let mut h = [0; Hash::LEN];
		let copy_size = min(v.len(), Hash::LEN);
		h[..copy_size].copy_from_slice(&v[..copy_size]);
		Hash(h)
	}

	/// Converts the hash to a byte vector
	pub fn to_vec(&self) -> Vec<u8> {
		self.0.to_vec()
	}

	/// The hash as a byte slice
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	/// Convert the hash to a hex string
	pub fn to_hex(&self) -> String {
		format!("{}", self)
	}
}

impl Writeable for Hash {
	fn write(&self, writer: &mut dyn Writer) -> Result<(), ser::Error> {
		writer.write_fixed_bytes(&self.0)
	}
}

impl Readable for Hash {
	fn read(reader: &mut dyn Reader) -> Result<Hash, ser::Error> {
		let v = reader.read_fixed_bytes(Hash::LEN)?;
		Ok(Hash::from_vec(&v))
	}
}

/// A trait for types that get their hash from their byte serialization.
pub trait Hashed {
	/// Obtain the hash of the object
	fn hash(&self) -> Hash {
		let data = self.bytes();
		Hash(blake2_256(&data))
	}

	/// Bytes the hash is computed over
	fn bytes(&self) -> Vec<u8>;
}

fn blake2_256(data: &[u8]) -> [u8; 32] {
	let digest = blake2b(32, &[], data);
	let mut buf = [0; 32];
	buf.copy_from_slice(digest.as_bytes());
	buf
}

impl Hashed for [u8] {
	fn bytes(&self) -> Vec<u8> {
		self.to_owned()
	}
}

impl Hashed for Vec<u8> {
	fn bytes(&self) -> Vec<u8> {
		self.clone()
	}
}
