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

//! Error types for the chain synchronization task

use std::fmt::{self, Display};

use failure::{Backtrace, Context, Fail};

use cirrus_core::ser;

/// Error definition
#[derive(Debug, Fail)]
pub struct Error {
	inner: Context<ErrorKind>,
}

/// Sync error definitions. Peer-attributable kinds double as the close
/// reason handed to the transport when we disconnect a peer.
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
	/// A chunk headers payload could not be decoded
	#[fail(display = "invalid chunk headers message data")]
	InvalidChunkHeadersMessage,
	/// A chunk headers payload decoded but failed content verification
	#[fail(display = "wrong chunk headers message data")]
	WrongChunkHeadersMessage,
	/// A chunk data payload could not be decoded
	#[fail(display = "invalid chunk data message data")]
	InvalidChunkDataMessage,
	/// Chunk data for a root we never asked for, or failing verification
	#[fail(display = "wrong chunk data message data")]
	WrongChunkDataMessage,
	/// Chunk headers from a peer we did not solicit
	#[fail(display = "chunk headers from unsolicited source peer")]
	InvalidChunkHeadersSource,
	/// The chunk processor rejected a chunk
	#[fail(display = "chunk process error: {}", _0)]
	ChunkProcess(String),
	/// A chain lookup the task depends on failed
	#[fail(display = "chain error: {}", _0)]
	Chain(String),
	/// Error serializing or deserializing a message
	#[fail(display = "serialization error: {}", _0)]
	Ser(ser::Error),
}

impl Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.inner, f)
	}
}

impl Error {
	/// get kind
	pub fn kind(&self) -> ErrorKind {
		self.inner.get_context().clone()
	}
	/// get cause
	pub fn cause(&self) -> Option<&dyn Fail> {
		self.inner.cause()
	}
	/// get backtrace
	pub fn backtrace(&self) -> Option<&Backtrace> {
		self.inner.backtrace()
	}
}

impl From<ErrorKind> for Error {
	fn from(kind: ErrorKind) -> Error {
		Error {
			inner: Context::new(kind),
		}
	}
}

impl From<Context<ErrorKind>> for Error {
	fn from(inner: Context<ErrorKind>) -> Error {
		Error { inner }
	}
}

impl From<ser::Error> for Error {
	fn from(error: ser::Error) -> Error {
		Error {
			inner: Context::new(ErrorKind::Ser(error)),
		}
	}
}
