// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection state tracking: beacon reception, the connect handshake and
//! reset detection. This is the sole owner of the outgoing PDU counter;
//! every request the engine sends consumes the next value from here.

use log::{info, warn};

use crate::error::StubError;
use crate::serial::pdu::ConnectParams;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState
{
	/// Nothing heard from the stub yet.
	Disconnected,
	/// A beacon arrived - the stub is (re)booted and waits for a connect
	/// handshake. Counters and negotiated parameters are void.
	AwaitingBeacon,
	/// Handshake completed, negotiated parameters are valid.
	Connected,
}

pub struct Connection
{
	state: ConnectionState,
	/// Counter stamped into the next outgoing PDU (pre-incremented, so
	/// the first PDU after a reset carries 1).
	c_pdus_sent: u32,
	/// Last counter observed on the inbound direction.
	c_pdus_recvd: u32,
	params: Option<ConnectParams>,
	beacons_seen: u32,
}

impl Connection
{
	pub fn new() -> Self
	{
		Self {
			state: ConnectionState::Disconnected,
			c_pdus_sent: 0,
			c_pdus_recvd: 0,
			params: None,
			beacons_seen: 0,
		}
	}

	pub fn state(&self) -> ConnectionState
	{
		self.state
	}

	pub fn params(&self) -> Option<&ConnectParams>
	{
		self.params.as_ref()
	}

	pub fn beacons_seen(&self) -> u32
	{
		self.beacons_seen
	}

	/// Current value of the outgoing counter (the value the most recently
	/// sent PDU carried).
	pub fn counter(&self) -> u32
	{
		self.c_pdus_sent
	}

	/// Claim the counter value for the next outgoing PDU.
	pub fn next_counter(&mut self) -> u32
	{
		self.c_pdus_sent = self.c_pdus_sent.wrapping_add(1);
		self.c_pdus_sent
	}

	/// Track the inbound counter. Gaps mean the line dropped data; that
	/// is a diagnostic, not a failure - the PDU itself checksummed fine.
	pub fn note_received(&mut self, c_pdus: u32)
	{
		let expected = self.c_pdus_recvd.wrapping_add(1);
		// While the stub idles in its beacon loop every beacon resets our
		// bookkeeping, so gaps are only meaningful once connected.
		if c_pdus != expected && self.state == ConnectionState::Connected {
			warn!(
				"Inbound PDU counter jumped from {} to {} - the link dropped data",
				self.c_pdus_recvd, c_pdus
			);
		}
		self.c_pdus_recvd = c_pdus;
	}

	/// A beacon was observed. Whatever state we were in, the stub has
	/// (re)booted: counters and negotiated parameters are invalid and the
	/// handshake must be redone. The caller is responsible for failing
	/// outstanding requests.
	pub fn on_beacon(&mut self)
	{
		if self.state == ConnectionState::Connected {
			info!("Beacon while connected - the stub reset");
		}
		self.state = ConnectionState::AwaitingBeacon;
		self.c_pdus_sent = 0;
		self.c_pdus_recvd = 0;
		self.params = None;
		self.beacons_seen = self.beacons_seen.wrapping_add(1);
	}

	/// Store the negotiated parameters from a successful connect
	/// response and move to `Connected`.
	pub fn on_connected(&mut self, params: ConnectParams) -> Result<(), StubError>
	{
		if self.state != ConnectionState::AwaitingBeacon {
			return Err(StubError::InvalidState("connect handshake requires a beacon first"));
		}
		info!(
			"Connected: max PDU {} bytes, scratch {:#x}+{:#x}, {} socket(s) with {} die(s) each",
			params.cb_pdu_max, params.scratch_addr, params.cb_scratch, params.sys_sockets, params.ccds_per_socket
		);
		self.params = Some(params);
		self.state = ConnectionState::Connected;
		Ok(())
	}
}

impl Default for Connection
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
	use crate::serial::pdu::StubCaps;

	fn params() -> ConnectParams
	{
		ConnectParams {
			cb_pdu_max: 2048,
			cb_scratch: 0x8000,
			scratch_addr: 0x2_0000,
			sys_sockets: 1,
			ccds_per_socket: 1,
			caps: StubCaps::ExtendedRrnIds,
		}
	}

	#[test]
	fn counter_is_monotone_over_n_sends()
	{
		let mut connection = Connection::new();
		connection.on_beacon();
		let initial = connection.counter();
		for sent in 1..=32u32 {
			assert_eq!(connection.next_counter(), initial + sent);
		}
		assert_eq!(connection.counter(), initial + 32);
	}

	#[test]
	fn beacon_resets_counters_and_parameters()
	{
		let mut connection = Connection::new();
		assert_eq!(connection.state(), ConnectionState::Disconnected);
		connection.on_beacon();
		assert_eq!(connection.state(), ConnectionState::AwaitingBeacon);
		connection.on_connected(params()).expect("handshake from AwaitingBeacon");
		assert_eq!(connection.state(), ConnectionState::Connected);
		connection.next_counter();
		connection.next_counter();

		connection.on_beacon();
		assert_eq!(connection.state(), ConnectionState::AwaitingBeacon);
		assert_eq!(connection.counter(), 0);
		assert!(connection.params().is_none());
		assert_eq!(connection.next_counter(), 1);
	}

	#[test]
	fn connect_requires_a_beacon()
	{
		let mut connection = Connection::new();
		assert!(matches!(
			connection.on_connected(params()),
			Err(StubError::InvalidState(_))
		));

		connection.on_beacon();
		connection.on_connected(params()).expect("handshake from AwaitingBeacon");
		// A second handshake without an intervening beacon is invalid.
		assert!(matches!(
			connection.on_connected(params()),
			Err(StubError::InvalidState(_))
		));
	}
}
