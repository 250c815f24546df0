// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns the raw receive stream into a sequence of validated PDUs.
//!
//! The link is an asynchronous serial line: the stream may open mid-PDU,
//! carry line noise between PDUs, or truncate a PDU when the remote side
//! resets. The framer therefore hunts for the start magic, decodes once
//! enough bytes have arrived, and on a bad frame slides forward one byte
//! at a time until the stream locks back on.

use log::{debug, trace, warn};

use super::codec::{self, wire_size};
use super::{DecodeError, LinkDirection, PDU_FOOTER_SIZE, PDU_HEADER_SIZE, PDU_MAX_PAYLOAD, PduHeader, read_u32};

pub struct Framer
{
	/// Which direction this receiver frames against; the opposite side's
	/// start magic never resynchronises us.
	direction: LinkDirection,
	buffer: Vec<u8>,
	/// Running count of bytes thrown away while resynchronising, kept as
	/// a link quality diagnostic.
	discarded: u64,
}

impl Framer
{
	pub fn new(direction: LinkDirection) -> Self
	{
		Self {
			direction,
			buffer: Vec::new(),
			discarded: 0,
		}
	}

	/// Feed newly received bytes into the accumulation buffer.
	pub fn extend(&mut self, bytes: &[u8])
	{
		self.buffer.extend_from_slice(bytes);
	}

	/// Bytes dropped so far while hunting for valid frames.
	pub fn discarded(&self) -> u64
	{
		self.discarded
	}

	/// Extract the next complete, validated PDU from the buffer, if one
	/// has fully arrived. Garbage in front of a valid start magic is
	/// silently discarded (and counted); a frame that fails validation
	/// costs the stream one byte and the hunt restarts behind it.
	pub fn next_pdu(&mut self) -> Option<(PduHeader, Vec<u8>)>
	{
		loop {
			self.resync()?;

			if self.buffer.len() < PDU_HEADER_SIZE + PDU_FOOTER_SIZE {
				// Not even a minimal PDU yet; wait for more bytes.
				return None;
			}

			let cb_pdu = read_u32(&self.buffer, 4) as usize;
			if cb_pdu > PDU_MAX_PAYLOAD || cb_pdu % 8 != 0 {
				// The magic was noise that happened to line up; step past
				// its first byte and hunt again.
				debug!("Framer: implausible cb_pdu {} behind start magic, sliding one byte", cb_pdu);
				self.drop_bytes(1);
				continue;
			}
			let total = wire_size(cb_pdu);
			if self.buffer.len() < total {
				return None;
			}

			match codec::decode(self.direction, &self.buffer[..total]) {
				Ok(pdu) => {
					self.buffer.drain(..total);
					return Some(pdu);
				},
				Err(DecodeError::InvalidRrnId(value)) => {
					// The frame itself checksummed fine, the peer just
					// speaks a newer dialect. Skip the whole PDU.
					warn!("Framer: discarding well-formed PDU with unknown RrnId {}", value);
					self.buffer.drain(..total);
					continue;
				},
				Err(error) => {
					debug!("Framer: {} - resynchronising", error);
					self.drop_bytes(1);
				},
			}
		}
	}

	/// Discard everything in front of the next start magic candidate.
	/// Returns `None` when the buffer holds no candidate and cannot hold
	/// one until more bytes arrive.
	fn resync(&mut self) -> Option<()>
	{
		let magic = self.direction.start_magic().to_le_bytes();
		match self
			.buffer
			.windows(magic.len())
			.position(|window| window == magic)
		{
			Some(0) => Some(()),
			Some(position) => {
				trace!("Framer: dropping {} noise bytes ahead of start magic", position);
				self.drop_bytes(position);
				Some(())
			},
			None => {
				// No candidate; all but the last three bytes can never
				// become part of a start magic, so let them go.
				if self.buffer.len() > magic.len() - 1 {
					let drop = self.buffer.len() - (magic.len() - 1);
					self.drop_bytes(drop);
				}
				None
			},
		}
	}

	fn drop_bytes(&mut self, count: usize)
	{
		self.buffer.drain(..count);
		self.discarded += count as u64;
	}
}

#[cfg(test)]
mod tests
{
	use super::super::RrnId;
	use super::*;

	fn beacon_pdu() -> Vec<u8>
	{
		let header = PduHeader {
			cb_pdu: 0,
			c_pdus: 1,
			rrn_id: RrnId::Beacon,
			id_ccd: 0,
			rc_req: 0,
			ts_millies: 42,
		};
		codec::encode(LinkDirection::StubToHost, &header, &1u32.to_le_bytes())
	}

	#[test]
	fn garbage_then_valid_pdu_yields_exactly_one()
	{
		let mut framer = Framer::new(LinkDirection::StubToHost);
		framer.extend(b"\xff\x00$P__noise__$PS");
		framer.extend(&beacon_pdu());
		let (header, payload) = framer.next_pdu().expect("the valid PDU must surface");
		assert_eq!(header.rrn_id, RrnId::Beacon);
		assert_eq!(payload.len(), 8);
		assert_eq!(framer.next_pdu(), None);
		assert!(framer.discarded() > 0);
	}

	#[test]
	fn pdu_split_across_chunks_completes()
	{
		let bytes = beacon_pdu();
		let mut framer = Framer::new(LinkDirection::StubToHost);
		for chunk in bytes.chunks(7) {
			framer.extend(chunk);
		}
		assert!(framer.next_pdu().is_some());
	}

	#[test]
	fn incomplete_pdu_stays_pending()
	{
		let bytes = beacon_pdu();
		let mut framer = Framer::new(LinkDirection::StubToHost);
		framer.extend(&bytes[..bytes.len() - 1]);
		assert_eq!(framer.next_pdu(), None);
		framer.extend(&bytes[bytes.len() - 1..]);
		assert!(framer.next_pdu().is_some());
	}

	#[test]
	fn corrupted_pdu_is_skipped_and_stream_recovers()
	{
		let mut corrupt = beacon_pdu();
		// Damage a payload byte so the checksum fails.
		corrupt[PDU_HEADER_SIZE] ^= 0xa5;
		let mut framer = Framer::new(LinkDirection::StubToHost);
		framer.extend(&corrupt);
		framer.extend(&beacon_pdu());
		let (header, _) = framer.next_pdu().expect("second PDU must decode");
		assert_eq!(header.rrn_id, RrnId::Beacon);
		assert_eq!(framer.next_pdu(), None);
	}

	#[test]
	fn back_to_back_pdus_all_surface()
	{
		let mut framer = Framer::new(LinkDirection::StubToHost);
		framer.extend(&beacon_pdu());
		framer.extend(&beacon_pdu());
		framer.extend(&beacon_pdu());
		for _ in 0..3 {
			assert!(framer.next_pdu().is_some());
		}
		assert_eq!(framer.next_pdu(), None);
	}

	#[test]
	fn opposite_direction_traffic_is_noise()
	{
		// A host-to-stub PDU must never frame on the stub-to-host side.
		let header = PduHeader::request(RrnId::Connect, 0, 1);
		let bytes = codec::encode(LinkDirection::HostToStub, &header, &[]);
		let mut framer = Framer::new(LinkDirection::StubToHost);
		framer.extend(&bytes);
		assert_eq!(framer.next_pdu(), None);
	}
}
