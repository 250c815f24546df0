// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pure PDU encode/decode. No I/O and no state lives here; the framer
//! decides what to do about a buffer that fails to decode.

use super::{
	DecodeError, LinkDirection, PDU_FOOTER_SIZE, PDU_HEADER_SIZE, PDU_MAX_PAYLOAD, PduHeader, RrnId, read_u32,
};

/// Round a payload length up to the 8-byte alignment the wire demands.
pub const fn padded_len(len: usize) -> usize
{
	(len + 7) & !7
}

/// Total on-wire size of a PDU carrying `cb_pdu` (already padded) payload
/// bytes.
pub const fn wire_size(cb_pdu: usize) -> usize
{
	PDU_HEADER_SIZE + cb_pdu + PDU_FOOTER_SIZE
}

/// Additive checksum complement over the given bytes: the stored word is
/// chosen such that the byte sum plus the checksum is zero mod 2^32.
fn checksum(bytes: &[u8]) -> u32
{
	let sum = bytes.iter().fold(0u32, |sum, &byte| sum.wrapping_add(byte as u32));
	0u32.wrapping_sub(sum)
}

/// Encode a single PDU travelling in `direction`. The header's `cb_pdu`
/// field is ignored and recomputed from the payload, which gets padded to
/// 8 bytes with zeroes.
pub fn encode(direction: LinkDirection, header: &PduHeader, payload: &[u8]) -> Vec<u8>
{
	let cb_pdu = padded_len(payload.len());
	let mut buffer = Vec::with_capacity(wire_size(cb_pdu));

	buffer.extend_from_slice(&direction.start_magic().to_le_bytes());
	buffer.extend_from_slice(&(cb_pdu as u32).to_le_bytes());
	buffer.extend_from_slice(&header.c_pdus.to_le_bytes());
	buffer.extend_from_slice(&(header.rrn_id as u32).to_le_bytes());
	buffer.extend_from_slice(&header.id_ccd.to_le_bytes());
	buffer.extend_from_slice(&header.rc_req.to_le_bytes());
	buffer.extend_from_slice(&header.ts_millies.to_le_bytes());
	buffer.extend_from_slice(&0u32.to_le_bytes());

	buffer.extend_from_slice(payload);
	buffer.resize(PDU_HEADER_SIZE + cb_pdu, 0);

	// The magic takes no part in the checksum - only the header fields
	// after it and the (padded) payload do.
	let sum = checksum(&buffer[4..]);
	buffer.extend_from_slice(&sum.to_le_bytes());
	buffer.extend_from_slice(&direction.end_magic().to_le_bytes());
	buffer
}

/// Decode a single PDU expected to travel in `direction` from the front of
/// `buffer`. The buffer must hold the complete PDU; the framer guarantees
/// that by peeking at `cb_pdu` before calling in here.
pub fn decode(direction: LinkDirection, buffer: &[u8]) -> Result<(PduHeader, Vec<u8>), DecodeError>
{
	let minimum = wire_size(0);
	if buffer.len() < minimum {
		return Err(DecodeError::TooShort {
			got: buffer.len(),
			needed: minimum,
		});
	}

	let magic = read_u32(buffer, 0);
	if magic != direction.start_magic() {
		return Err(DecodeError::BadMagic {
			found: magic,
		});
	}

	let cb_pdu = read_u32(buffer, 4);
	if cb_pdu as usize > PDU_MAX_PAYLOAD || cb_pdu % 8 != 0 {
		return Err(DecodeError::LengthMismatch {
			cb_pdu,
		});
	}
	let total = wire_size(cb_pdu as usize);
	if buffer.len() < total {
		return Err(DecodeError::TooShort {
			got: buffer.len(),
			needed: total,
		});
	}

	// Validate the checksum before trusting any other field.
	let stored = read_u32(buffer, PDU_HEADER_SIZE + cb_pdu as usize);
	let computed = checksum(&buffer[4..PDU_HEADER_SIZE + cb_pdu as usize]);
	if stored != computed {
		return Err(DecodeError::BadChecksum {
			stored,
			computed,
		});
	}

	let closing = read_u32(buffer, total - 4);
	if closing != direction.end_magic() {
		return Err(DecodeError::BadMagic {
			found: closing,
		});
	}

	let rrn_id = RrnId::try_from(read_u32(buffer, 12))?;
	let header = PduHeader {
		cb_pdu,
		c_pdus: read_u32(buffer, 8),
		rrn_id,
		id_ccd: read_u32(buffer, 16),
		rc_req: read_u32(buffer, 20) as i32,
		ts_millies: read_u32(buffer, 24),
	};
	let payload = buffer[PDU_HEADER_SIZE..PDU_HEADER_SIZE + cb_pdu as usize].to_vec();
	Ok((header, payload))
}
