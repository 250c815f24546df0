// SPDX-License-Identifier: MIT OR Apache-2.0

//! Matches inbound response PDUs to the requests that caused them.
//!
//! The stub processes one request per die at a time; the engine enforces
//! that discipline through [`Correlator::is_busy`] before registering a
//! new entry. The table itself keeps one entry per outstanding request
//! keyed by target die, expected response ID and the counter at send time.
//! Responses that match nothing are logged and dropped - a confused peer
//! must never desynchronise the requests that are still healthy.

use std::sync::mpsc::{Receiver, Sender, channel};
use std::time::Instant;

use log::{debug, warn};

use crate::error::StubError;
use crate::serial::pdu::{PduHeader, RrnId};

/// How a pending request ended.
#[derive(Debug)]
pub enum Completion
{
	/// The matching response arrived.
	Response
	{
		status: i32,
		payload: Vec<u8>,
	},
	/// A beacon voided everything in flight.
	Reset,
}

struct PendingRequest
{
	id_ccd: u32,
	/// The RrnId the response must carry: request ID plus the response
	/// range offset.
	response_id: RrnId,
	/// Outgoing counter value at send time, kept for diagnostics.
	counter: u32,
	submitted: Instant,
	completion: Sender<Completion>,
}

pub struct Correlator
{
	pending: Vec<PendingRequest>,
}

impl Correlator
{
	pub fn new() -> Self
	{
		Self {
			pending: Vec::new(),
		}
	}

	/// Whether the given die already has a request outstanding.
	pub fn is_busy(&self, id_ccd: u32) -> bool
	{
		self.pending.iter().any(|entry| entry.id_ccd == id_ccd)
	}

	pub fn outstanding(&self) -> usize
	{
		self.pending.len()
	}

	/// Register a request about to be put on the wire and hand back the
	/// channel its completion arrives on. The per-die in-flight
	/// discipline is the caller's to enforce (under the same lock) via
	/// [`Self::is_busy`].
	pub fn register(&mut self, id_ccd: u32, request_id: RrnId, counter: u32)
	-> Result<Receiver<Completion>, StubError>
	{
		let response_id = request_id
			.response_id()
			.ok_or(StubError::InvalidState("only request IDs can be correlated"))?;
		let (sender, receiver) = channel();
		self.pending.push(PendingRequest {
			id_ccd,
			response_id,
			counter,
			submitted: Instant::now(),
			completion: sender,
		});
		Ok(receiver)
	}

	/// Match an inbound response against the table. Returns whether the
	/// response found its request; mismatches are deliberately only
	/// logged so one bad PDU cannot poison the other dies' traffic.
	pub fn complete(&mut self, header: &PduHeader, payload: Vec<u8>) -> bool
	{
		let position = self
			.pending
			.iter()
			.position(|entry| entry.id_ccd == header.id_ccd && entry.response_id == header.rrn_id);
		let Some(position) = position else {
			warn!(
				"Discarding unmatched response {:?} for die {} (counter {})",
				header.rrn_id, header.id_ccd, header.c_pdus
			);
			return false;
		};

		let entry = self.pending.swap_remove(position);
		debug!(
			"Response {:?} for die {} after {:?} (request counter {})",
			header.rrn_id,
			header.id_ccd,
			entry.submitted.elapsed(),
			entry.counter
		);
		// A dead receiver means the caller gave up (timeout or local
		// cancellation); the late response is simply dropped.
		if entry
			.completion
			.send(Completion::Response {
				status: header.rc_req,
				payload,
			})
			.is_err()
		{
			debug!("Caller abandoned request to die {} before its response arrived", header.id_ccd);
		}
		true
	}

	/// Withdraw a request the caller no longer waits for. The eventual
	/// response, if any, will be discarded as unmatched.
	pub fn cancel(&mut self, id_ccd: u32, counter: u32)
	{
		self.pending
			.retain(|entry| !(entry.id_ccd == id_ccd && entry.counter == counter));
	}

	/// A beacon arrived: complete everything in flight with `Reset`.
	pub fn reset_all(&mut self)
	{
		if !self.pending.is_empty() {
			warn!("Stub reset with {} request(s) in flight", self.pending.len());
		}
		for entry in self.pending.drain(..) {
			let _ = entry.completion.send(Completion::Reset);
		}
	}
}

impl Default for Correlator
{
	fn default() -> Self
	{
		Self::new()
	}
}

#[cfg(test)]
mod tests
{
	use super::*;
	use crate::serial::pdu::RRN_RESPONSE_OFFSET;

	fn response_header(request_id: RrnId, id_ccd: u32, rc_req: i32) -> PduHeader
	{
		PduHeader {
			cb_pdu: 0,
			c_pdus: 1,
			rrn_id: RrnId::try_from(request_id as u32 + RRN_RESPONSE_OFFSET).expect("paired response ID"),
			id_ccd,
			rc_req,
			ts_millies: 0,
		}
	}

	#[test]
	fn matching_response_completes_the_request()
	{
		let mut correlator = Correlator::new();
		let receiver = correlator
			.register(0, RrnId::PspMemRead, 1)
			.expect("request IDs register");
		assert!(correlator.is_busy(0));
		assert!(!correlator.is_busy(1));

		assert!(correlator.complete(&response_header(RrnId::PspMemRead, 0, 0), vec![1, 2, 3, 4]));
		match receiver.try_recv().expect("completion must be queued") {
			Completion::Response {
				status,
				payload,
			} => {
				assert_eq!(status, 0);
				assert_eq!(payload, vec![1, 2, 3, 4]);
			},
			other => panic!("unexpected completion {:?}", other),
		}
		assert!(!correlator.is_busy(0));
	}

	#[test]
	fn mispaired_response_id_is_discarded()
	{
		let mut correlator = Correlator::new();
		let receiver = correlator
			.register(0, RrnId::PspMemRead, 1)
			.expect("request IDs register");

		// Right die, wrong operation: must not complete the request.
		assert!(!correlator.complete(&response_header(RrnId::SmnRead, 0, 0), Vec::new()));
		// Right operation, wrong die: same.
		assert!(!correlator.complete(&response_header(RrnId::PspMemRead, 3, 0), Vec::new()));
		assert!(receiver.try_recv().is_err());
		assert_eq!(correlator.outstanding(), 1);
	}

	#[test]
	fn duplicate_response_is_discarded()
	{
		let mut correlator = Correlator::new();
		let _receiver = correlator
			.register(2, RrnId::SmnWrite, 5)
			.expect("request IDs register");
		assert!(correlator.complete(&response_header(RrnId::SmnWrite, 2, 0), Vec::new()));
		assert!(!correlator.complete(&response_header(RrnId::SmnWrite, 2, 0), Vec::new()));
	}

	#[test]
	fn reset_fails_every_outstanding_request()
	{
		let mut correlator = Correlator::new();
		// Three outstanding requests spread over two dies.
		let receivers = [
			correlator.register(0, RrnId::PspMemRead, 1).expect("register"),
			correlator.register(1, RrnId::SmnRead, 2).expect("register"),
			correlator.register(0, RrnId::PspMemWrite, 3).expect("register"),
		];
		correlator.reset_all();
		for receiver in receivers {
			assert!(matches!(
				receiver.try_recv().expect("reset completion must be queued"),
				Completion::Reset
			));
		}
		assert_eq!(correlator.outstanding(), 0);
	}

	#[test]
	fn cancelled_request_ignores_its_late_response()
	{
		let mut correlator = Correlator::new();
		let _receiver = correlator
			.register(0, RrnId::CoprocRead, 9)
			.expect("request IDs register");
		correlator.cancel(0, 9);
		assert!(!correlator.complete(&response_header(RrnId::CoprocRead, 0, 0), Vec::new()));
	}

	#[test]
	fn non_request_ids_refuse_to_register()
	{
		let mut correlator = Correlator::new();
		assert!(matches!(
			correlator.register(0, RrnId::Beacon, 1),
			Err(StubError::InvalidState(_))
		));
		assert!(matches!(
			correlator.register(0, RrnId::ConnectResp, 1),
			Err(StubError::InvalidState(_))
		));
	}
}
