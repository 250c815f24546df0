// SPDX-License-Identifier: MIT OR Apache-2.0

//! Module for error handling code.
//!
//! Callers see a small closed set of error kinds; anything recoverable at
//! the protocol layer (framing noise, unmatched responses) never surfaces
//! here - retry policy lives above this crate.

use thiserror::Error;

use crate::serial::pdu::{DecodeError, StubStatus};

#[derive(Debug, Error)]
pub enum StubError
{
	/// A PDU failed to decode in a context where resynchronisation was
	/// not possible.
	#[error("framing error on the stub link")]
	Framing(#[from] DecodeError),

	/// The stub processed the request and reported a failure status.
	#[error("request failed on the stub: {0}")]
	Protocol(StubStatus),

	/// No response arrived within the caller's deadline. The request may
	/// still complete remotely; its late response gets discarded.
	#[error("request to die {id_ccd} timed out")]
	Timeout
	{
		id_ccd: u32,
	},

	/// A beacon arrived while the request was outstanding - the stub
	/// reset and everything in flight is void.
	#[error("the stub reset while the request was outstanding")]
	Reset,

	/// The operation is not valid in the current connection or module
	/// state.
	#[error("invalid state: {0}")]
	InvalidState(&'static str),

	/// The target die already has a request in flight; the stub handles
	/// one request per die at a time.
	#[error("die {id_ccd} already has a request in flight")]
	TryAgain
	{
		id_ccd: u32,
	},

	/// The local link failed underneath the protocol.
	#[error("stub link I/O error")]
	Io(#[from] std::io::Error),
}
