// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire model for the PSP serial stub protocol.
//!
//! Everything on this link is little-endian. A PDU is a 32-byte header,
//! a payload padded to 8-byte alignment, and an 8-byte footer carrying an
//! additive checksum and a closing magic. The checksum spans every byte
//! between the start magic and the footer.

use bitmask_enum::bitmask;
use thiserror::Error;

pub mod codec;
pub mod framer;

/// Size of the fixed PDU header in bytes, including the start magic.
pub const PDU_HEADER_SIZE: usize = 32;
/// Size of the PDU footer in bytes (checksum + closing magic).
pub const PDU_FOOTER_SIZE: usize = 8;
/// Local ceiling for the payload of a single PDU. The stub advertises its
/// own limit in the connect response; this bound applies before that
/// negotiation has happened.
pub const PDU_MAX_PAYLOAD: usize = 4096;

/// Fixed load address for flat binary code modules on the remote side.
pub const CM_FLAT_BINARY_LOAD_ADDR: u32 = 0x10000;

/// Offset between a request ID and the ID of its paired response.
pub const RRN_RESPONSE_OFFSET: u32 = 9000;

/// First valid notification ID.
pub const RRN_NOTIFICATION_FIRST: u32 = 1;
/// First invalid notification ID.
pub const RRN_NOTIFICATION_INVALID_FIRST: u32 = 6;
/// First valid request ID.
pub const RRN_REQUEST_FIRST: u32 = 1000;
/// First invalid request ID.
pub const RRN_REQUEST_INVALID_FIRST: u32 = 1018;
/// First valid response ID.
pub const RRN_RESPONSE_FIRST: u32 = 10000;
/// First invalid response ID.
pub const RRN_RESPONSE_INVALID_FIRST: u32 = 10018;

/// Which way a PDU travels over the link. The magics differ per direction
/// so that each side can frame against its own receive stream without
/// picking up its own transmissions echoed back by a misbehaving adapter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkDirection
{
	/// Host tooling to the stub on the co-processor.
	HostToStub,
	/// Stub on the co-processor back to the host tooling.
	StubToHost,
}

impl LinkDirection
{
	/// The magic opening a PDU travelling in this direction.
	pub const fn start_magic(self) -> u32
	{
		match self {
			// "$PSP"
			Self::HostToStub => 0x5053_5024,
			// "PSP$"
			Self::StubToHost => 0x2450_5350,
		}
	}

	/// The magic closing a PDU travelling in this direction.
	pub const fn end_magic(self) -> u32
	{
		match self {
			// "~PSP"
			Self::HostToStub => 0x5053_507e,
			// "PSP~"
			Self::StubToHost => 0x7e50_5350,
		}
	}
}

/// Typed view of the signed status word carried in response PDUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StubStatus
{
	Success,
	InvalidParameter,
	BufferOverflow,
	UndefinedInstructionException,
	DataAbortException,
	PrefetchAbortException,
	/// A status code this implementation does not know about. Negative
	/// values are failures, everything else is informational.
	Other(i32),
}

impl StubStatus
{
	pub const fn from_raw(value: i32) -> Self
	{
		match value {
			0 => Self::Success,
			-1 => Self::InvalidParameter,
			-2 => Self::BufferOverflow,
			-3 => Self::UndefinedInstructionException,
			-4 => Self::DataAbortException,
			-5 => Self::PrefetchAbortException,
			other => Self::Other(other),
		}
	}

	pub const fn to_raw(self) -> i32
	{
		match self {
			Self::Success => 0,
			Self::InvalidParameter => -1,
			Self::BufferOverflow => -2,
			Self::UndefinedInstructionException => -3,
			Self::DataAbortException => -4,
			Self::PrefetchAbortException => -5,
			Self::Other(other) => other,
		}
	}

	pub const fn is_failure(self) -> bool
	{
		self.to_raw() < 0
	}
}

impl std::fmt::Display for StubStatus
{
	fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
	{
		match self {
			Self::Success => write!(formatter, "success"),
			Self::InvalidParameter => write!(formatter, "invalid parameter"),
			Self::BufferOverflow => write!(formatter, "buffer overflow"),
			Self::UndefinedInstructionException => write!(formatter, "undefined instruction exception on the stub"),
			Self::DataAbortException => write!(formatter, "data abort exception on the stub"),
			Self::PrefetchAbortException => write!(formatter, "prefetch abort exception on the stub"),
			Self::Other(value) => write!(formatter, "status code {}", value),
		}
	}
}

/// Errors the codec can produce while taking a byte buffer apart. These are
/// all recoverable by the framer - none of them may abort the receive loop.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DecodeError
{
	#[error("PDU buffer too short: got {got} bytes, need at least {needed}")]
	TooShort
	{
		got: usize,
		needed: usize,
	},

	#[error("bad PDU magic {found:#010x}")]
	BadMagic
	{
		found: u32,
	},

	#[error("PDU checksum mismatch: stored {stored:#010x}, computed complement {computed:#010x}")]
	BadChecksum
	{
		stored: u32,
		computed: u32,
	},

	#[error("implausible PDU payload length {cb_pdu}")]
	LengthMismatch
	{
		cb_pdu: u32,
	},

	#[error("request/response/notification ID {0} outside any defined range")]
	InvalidRrnId(u32),

	#[error("enumerated wire field holds undefined value {0}")]
	InvalidEnumValue(u32),
}

/// Classification of an ID into the three disjoint wire ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RrnClass
{
	Notification,
	Request,
	Response,
}

/// Request/Response/Notification ID distinguishing the purpose of a PDU.
///
/// Notifications start at 1, requests at 1000, responses at 10000; a
/// response carries the ID of its request plus [`RRN_RESPONSE_OFFSET`].
/// The field is a u32 on the wire, converted through [`TryFrom`] so that
/// out-of-range values are rejected instead of aliasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RrnId
{
	// Notifications
	Beacon = 1,
	Irq = 2,
	LogMessage = 3,
	OutBuf = 4,
	CodeModFinished = 5,

	// Requests
	Connect = 1000,
	PspMemRead = 1001,
	PspMemWrite = 1002,
	PspMmioRead = 1003,
	PspMmioWrite = 1004,
	SmnRead = 1005,
	SmnWrite = 1006,
	X86MemRead = 1007,
	X86MemWrite = 1008,
	X86MmioRead = 1009,
	X86MmioWrite = 1010,
	DataXfer = 1011,
	CoprocRead = 1012,
	CoprocWrite = 1013,
	InputBufWrite = 1014,
	LoadCodeMod = 1015,
	ExecCodeMod = 1016,
	BranchTo = 1017,

	// Responses
	ConnectResp = 10000,
	PspMemReadResp = 10001,
	PspMemWriteResp = 10002,
	PspMmioReadResp = 10003,
	PspMmioWriteResp = 10004,
	SmnReadResp = 10005,
	SmnWriteResp = 10006,
	X86MemReadResp = 10007,
	X86MemWriteResp = 10008,
	X86MmioReadResp = 10009,
	X86MmioWriteResp = 10010,
	DataXferResp = 10011,
	CoprocReadResp = 10012,
	CoprocWriteResp = 10013,
	InputBufWriteResp = 10014,
	LoadCodeModResp = 10015,
	ExecCodeModResp = 10016,
	BranchToResp = 10017,
}

impl RrnId
{
	pub const fn class(self) -> RrnClass
	{
		let value = self as u32;
		if value < RRN_NOTIFICATION_INVALID_FIRST {
			RrnClass::Notification
		} else if value < RRN_REQUEST_INVALID_FIRST {
			RrnClass::Request
		} else {
			RrnClass::Response
		}
	}

	/// For a request ID, the ID its response will carry.
	pub fn response_id(self) -> Option<RrnId>
	{
		match self.class() {
			RrnClass::Request => RrnId::try_from(self as u32 + RRN_RESPONSE_OFFSET).ok(),
			_ => None,
		}
	}

	/// Whether this ID belongs to the extended set absent from legacy
	/// stub firmware (see [`StubCaps::ExtendedRrnIds`]).
	pub const fn is_extended(self) -> bool
	{
		matches!(
			self,
			Self::DataXfer | Self::CoprocRead | Self::CoprocWrite | Self::BranchTo
		)
	}
}

impl TryFrom<u32> for RrnId
{
	type Error = DecodeError;

	fn try_from(value: u32) -> Result<Self, Self::Error>
	{
		let id = match value {
			1 => Self::Beacon,
			2 => Self::Irq,
			3 => Self::LogMessage,
			4 => Self::OutBuf,
			5 => Self::CodeModFinished,

			1000 => Self::Connect,
			1001 => Self::PspMemRead,
			1002 => Self::PspMemWrite,
			1003 => Self::PspMmioRead,
			1004 => Self::PspMmioWrite,
			1005 => Self::SmnRead,
			1006 => Self::SmnWrite,
			1007 => Self::X86MemRead,
			1008 => Self::X86MemWrite,
			1009 => Self::X86MmioRead,
			1010 => Self::X86MmioWrite,
			1011 => Self::DataXfer,
			1012 => Self::CoprocRead,
			1013 => Self::CoprocWrite,
			1014 => Self::InputBufWrite,
			1015 => Self::LoadCodeMod,
			1016 => Self::ExecCodeMod,
			1017 => Self::BranchTo,

			10000 => Self::ConnectResp,
			10001 => Self::PspMemReadResp,
			10002 => Self::PspMemWriteResp,
			10003 => Self::PspMmioReadResp,
			10004 => Self::PspMmioWriteResp,
			10005 => Self::SmnReadResp,
			10006 => Self::SmnWriteResp,
			10007 => Self::X86MemReadResp,
			10008 => Self::X86MemWriteResp,
			10009 => Self::X86MmioReadResp,
			10010 => Self::X86MmioWriteResp,
			10011 => Self::DataXferResp,
			10012 => Self::CoprocReadResp,
			10013 => Self::CoprocWriteResp,
			10014 => Self::InputBufWriteResp,
			10015 => Self::LoadCodeModResp,
			10016 => Self::ExecCodeModResp,
			10017 => Self::BranchToResp,

			other => return Err(DecodeError::InvalidRrnId(other)),
		};
		Ok(id)
	}
}

/// Decoded view of the 32-byte PDU header, minus the magic which is a
/// framing concern. `cb_pdu` is the padded payload length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PduHeader
{
	/// Size of the payload in bytes, padded to the next 8-byte boundary.
	pub cb_pdu: u32,
	/// Per-direction monotone PDU counter.
	pub c_pdus: u32,
	/// What this PDU is.
	pub rrn_id: RrnId,
	/// The die the PDU is designated for or originates from.
	pub id_ccd: u32,
	/// Status code; meaningful for responses only.
	pub rc_req: i32,
	/// Millisecond timestamp; meaningful for responses and notifications.
	pub ts_millies: u32,
}

impl PduHeader
{
	/// Header for an outgoing request. Requests carry neither a status
	/// nor a timestamp.
	pub fn request(rrn_id: RrnId, id_ccd: u32, c_pdus: u32) -> Self
	{
		Self {
			cb_pdu: 0,
			c_pdus,
			rrn_id,
			id_ccd,
			rc_req: 0,
			ts_millies: 0,
		}
	}

	pub fn status(&self) -> StubStatus
	{
		StubStatus::from_raw(self.rc_req)
	}
}

/// Capability bits negotiated in the connect response. Legacy stubs zero
/// this word (it was padding in their layout), which deliberately reads as
/// "no extended capabilities".
#[bitmask(u32)]
pub enum StubCaps
{
	/// The stub understands the extended ID set: generic data transfer,
	/// co-processor register access and branch-to.
	ExtendedRrnIds,
}

/// Parameters the stub hands back on a successful connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectParams
{
	/// Maximum total PDU length the stub accepts, footer included.
	pub cb_pdu_max: u32,
	/// Size of the remote scratch area in bytes.
	pub cb_scratch: u32,
	/// Start address of the remote scratch area.
	pub scratch_addr: u32,
	/// Number of sockets in the system.
	pub sys_sockets: u32,
	/// Number of dies per socket.
	pub ccds_per_socket: u32,
	/// Capability mask, zero for legacy stubs.
	pub caps: StubCaps,
}

impl ConnectParams
{
	pub const WIRE_SIZE: usize = 24;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, Self::WIRE_SIZE)?;
		Ok(Self {
			cb_pdu_max: read_u32(buffer, 0),
			cb_scratch: read_u32(buffer, 4),
			scratch_addr: read_u32(buffer, 8),
			sys_sockets: read_u32(buffer, 12),
			ccds_per_socket: read_u32(buffer, 16),
			caps: StubCaps::from(read_u32(buffer, 20)),
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = Vec::with_capacity(Self::WIRE_SIZE);
		buffer.extend_from_slice(&self.cb_pdu_max.to_le_bytes());
		buffer.extend_from_slice(&self.cb_scratch.to_le_bytes());
		buffer.extend_from_slice(&self.scratch_addr.to_le_bytes());
		buffer.extend_from_slice(&self.sys_sockets.to_le_bytes());
		buffer.extend_from_slice(&self.ccds_per_socket.to_le_bytes());
		buffer.extend_from_slice(&self.caps.bits().to_le_bytes());
		buffer
	}
}

/// Beacon notification payload - the stub is up and awaiting a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BeaconNotification
{
	/// How many beacons the stub has sent since it booted.
	pub beacons_sent: u32,
}

impl BeaconNotification
{
	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, 4)?;
		Ok(Self {
			beacons_sent: read_u32(buffer, 0),
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = self.beacons_sent.to_le_bytes().to_vec();
		buffer.extend_from_slice(&[0; 4]);
		buffer
	}
}

/// Interrupt lines pending on the stub's core.
#[bitmask(u16)]
pub enum IrqPending
{
	Irq,
	Fiq,
}

/// Interrupt status change notification payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqNotification
{
	pub cur: IrqPending,
	pub prev: IrqPending,
}

impl IrqNotification
{
	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, 4)?;
		Ok(Self {
			cur: IrqPending::from(read_u16(buffer, 0)),
			prev: IrqPending::from(read_u16(buffer, 2)),
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = Vec::with_capacity(8);
		buffer.extend_from_slice(&self.cur.bits().to_le_bytes());
		buffer.extend_from_slice(&self.prev.bits().to_le_bytes());
		buffer.extend_from_slice(&[0; 4]);
		buffer
	}
}

/// Output buffer notification payload header; the buffer contents follow
/// directly after it in the same PDU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutBufNotification
{
	pub id_out_buf: u32,
}

impl OutBufNotification
{
	pub const WIRE_SIZE: usize = 8;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, Self::WIRE_SIZE)?;
		Ok(Self {
			id_out_buf: read_u32(buffer, 0),
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = self.id_out_buf.to_le_bytes().to_vec();
		buffer.extend_from_slice(&[0; 4]);
		buffer
	}
}

/// Code module execution finished notification payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecFinishedNotification
{
	/// Arbitrary return value of the code module's entry point.
	pub ret: u32,
}

impl ExecFinishedNotification
{
	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, 4)?;
		Ok(Self {
			ret: read_u32(buffer, 0),
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = self.ret.to_le_bytes().to_vec();
		buffer.extend_from_slice(&[0; 4]);
		buffer
	}
}

/// Kinds of code module the stub can load. Only flat binaries at the fixed
/// load address exist today.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CodeModType
{
	FlatBinary = 1,
}

impl TryFrom<u32> for CodeModType
{
	type Error = DecodeError;

	fn try_from(value: u32) -> Result<Self, Self::Error>
	{
		match value {
			1 => Ok(Self::FlatBinary),
			other => Err(DecodeError::InvalidEnumValue(other)),
		}
	}
}

/// Load code module request header; the module image follows in the same
/// PDU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadCodeModRequest
{
	pub module_type: CodeModType,
}

impl LoadCodeModRequest
{
	pub const WIRE_SIZE: usize = 8;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, 4)?;
		Ok(Self {
			module_type: CodeModType::try_from(read_u32(buffer, 0))?,
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = (self.module_type as u32).to_le_bytes().to_vec();
		buffer.extend_from_slice(&[0; 4]);
		buffer
	}
}

/// Execute code module request payload - four arbitrary arguments handed
/// through to the module's entry point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecCodeModRequest
{
	pub args: [u32; 4],
}

impl ExecCodeModRequest
{
	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, 16)?;
		Ok(Self {
			args: [
				read_u32(buffer, 0),
				read_u32(buffer, 4),
				read_u32(buffer, 8),
				read_u32(buffer, 12),
			],
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = Vec::with_capacity(16);
		for arg in self.args {
			buffer.extend_from_slice(&arg.to_le_bytes());
		}
		buffer
	}
}

/// Transfer descriptor for the dedicated PSP SRAM/MMIO and SMN read and
/// write requests (8 bytes on the wire). Writes carry the data to store
/// right after the descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemXferRequest
{
	pub addr: u32,
	pub cb_xfer: u32,
}

impl MemXferRequest
{
	pub const WIRE_SIZE: usize = 8;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, Self::WIRE_SIZE)?;
		Ok(Self {
			addr: read_u32(buffer, 0),
			cb_xfer: read_u32(buffer, 4),
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = self.addr.to_le_bytes().to_vec();
		buffer.extend_from_slice(&self.cb_xfer.to_le_bytes());
		buffer
	}
}

/// Transfer descriptor for the dedicated x86 memory and MMIO requests
/// (16 bytes on the wire - the address is a 64-bit physical one).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X86MemXferRequest
{
	pub addr: u64,
	pub cb_xfer: u32,
}

impl X86MemXferRequest
{
	pub const WIRE_SIZE: usize = 16;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, 12)?;
		Ok(Self {
			addr: read_u64(buffer, 0),
			cb_xfer: read_u32(buffer, 8),
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = self.addr.to_le_bytes().to_vec();
		buffer.extend_from_slice(&self.cb_xfer.to_le_bytes());
		buffer.extend_from_slice(&[0; 4]);
		buffer
	}
}

/// Write input buffer request header; the data to feed the code module
/// follows in the same PDU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputBufWriteRequest
{
	pub id_in_buf: u32,
}

impl InputBufWriteRequest
{
	pub const WIRE_SIZE: usize = 8;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, 4)?;
		Ok(Self {
			id_in_buf: read_u32(buffer, 0),
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = self.id_in_buf.to_le_bytes().to_vec();
		buffer.extend_from_slice(&[0; 4]);
		buffer
	}
}

/// Flags steering a generic data transfer.
#[bitmask(u32)]
pub enum XferFlags
{
	/// Read from the target address.
	Read,
	/// Write to the target address.
	Write,
	/// Memset-style operation: the PDU carries a single datum of stride
	/// size which is replicated over the whole transfer length.
	Memset,
	/// Increment the target address by the stride after each access.
	IncrAddr,
}

/// Address-space dependent start address of a generic data transfer.
///
/// The original union aliased these views over the same 16 bytes; the sum
/// type keeps the wire layout while removing the aliasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferAddr
{
	/// PSP address, covering both SRAM and MMIO transfers.
	Psp(u32),
	/// System management network address.
	Smn(u32),
	/// x86 physical address plus the caching attributes for the mapping.
	X86
	{
		addr: u64,
		caching: u32,
	},
}

/// Address spaces reachable through the generic data transfer request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AddrSpace
{
	PspMem = 1,
	PspMmio = 2,
	Smn = 3,
	X86Mem = 4,
	X86Mmio = 5,
}

impl TryFrom<u32> for AddrSpace
{
	type Error = DecodeError;

	fn try_from(value: u32) -> Result<Self, Self::Error>
	{
		match value {
			1 => Ok(Self::PspMem),
			2 => Ok(Self::PspMmio),
			3 => Ok(Self::Smn),
			4 => Ok(Self::X86Mem),
			5 => Ok(Self::X86Mmio),
			other => Err(DecodeError::InvalidEnumValue(other)),
		}
	}
}

/// Generic data transfer request descriptor (32 bytes on the wire). For
/// writes the data to transfer follows the descriptor in the same PDU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataXferRequest
{
	pub addr_space: AddrSpace,
	/// Access stride in bytes: 1, 2 or 4.
	pub stride: u32,
	/// Transfer length in bytes, a multiple of the stride.
	pub cb_xfer: u32,
	pub flags: XferFlags,
	pub addr: XferAddr,
}

impl DataXferRequest
{
	pub const WIRE_SIZE: usize = 32;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, Self::WIRE_SIZE)?;
		let addr_space = AddrSpace::try_from(read_u32(buffer, 0))?;
		let addr = match addr_space {
			AddrSpace::PspMem | AddrSpace::PspMmio => XferAddr::Psp(read_u32(buffer, 16)),
			AddrSpace::Smn => XferAddr::Smn(read_u32(buffer, 16)),
			AddrSpace::X86Mem | AddrSpace::X86Mmio => XferAddr::X86 {
				addr: read_u64(buffer, 16),
				caching: read_u32(buffer, 24),
			},
		};
		Ok(Self {
			addr_space,
			stride: read_u32(buffer, 4),
			cb_xfer: read_u32(buffer, 8),
			flags: XferFlags::from(read_u32(buffer, 12)),
			addr,
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = Vec::with_capacity(Self::WIRE_SIZE);
		buffer.extend_from_slice(&(self.addr_space as u32).to_le_bytes());
		buffer.extend_from_slice(&self.stride.to_le_bytes());
		buffer.extend_from_slice(&self.cb_xfer.to_le_bytes());
		buffer.extend_from_slice(&self.flags.bits().to_le_bytes());
		match self.addr {
			XferAddr::Psp(addr) | XferAddr::Smn(addr) => {
				buffer.extend_from_slice(&addr.to_le_bytes());
				buffer.extend_from_slice(&[0; 12]);
			},
			XferAddr::X86 {
				addr,
				caching,
			} => {
				buffer.extend_from_slice(&addr.to_le_bytes());
				buffer.extend_from_slice(&caching.to_le_bytes());
				buffer.extend_from_slice(&[0; 4]);
			},
		}
		buffer
	}
}

/// Co-processor register access descriptor (8 bytes on the wire). The
/// fields get encoded into the MRC/MCR instruction the stub executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoprocAccessRequest
{
	pub coproc: u8,
	pub crn: u8,
	pub crm: u8,
	pub opc1: u8,
	pub opc2: u8,
}

impl CoprocAccessRequest
{
	pub const WIRE_SIZE: usize = 8;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, 5)?;
		Ok(Self {
			coproc: buffer[0],
			crn: buffer[1],
			crm: buffer[2],
			opc1: buffer[3],
			opc2: buffer[4],
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		vec![self.coproc, self.crn, self.crm, self.opc1, self.opc2, 0, 0, 0]
	}
}

/// Flags steering a branch-to request.
#[bitmask(u32)]
pub enum BranchToFlags
{
	/// The destination uses the Thumb instruction set; clear means the
	/// regular ARM ISA.
	Thumb,
}

/// Branch-to request payload (64 bytes on the wire). The response is sent
/// before the branch happens; this will very likely kill the stub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchToRequest
{
	pub flags: BranchToFlags,
	pub dest: u32,
	/// Initial values for r0-r12.
	pub gprs: [u32; 13],
}

impl BranchToRequest
{
	pub const WIRE_SIZE: usize = 64;

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, DecodeError>
	{
		check_len(buffer, Self::WIRE_SIZE)?;
		let mut gprs = [0u32; 13];
		for (index, gpr) in gprs.iter_mut().enumerate() {
			*gpr = read_u32(buffer, 8 + index * 4);
		}
		Ok(Self {
			flags: BranchToFlags::from(read_u32(buffer, 0)),
			dest: read_u32(buffer, 4),
			gprs,
		})
	}

	pub fn to_bytes(&self) -> Vec<u8>
	{
		let mut buffer = Vec::with_capacity(Self::WIRE_SIZE);
		buffer.extend_from_slice(&self.flags.bits().to_le_bytes());
		buffer.extend_from_slice(&self.dest.to_le_bytes());
		for gpr in self.gprs {
			buffer.extend_from_slice(&gpr.to_le_bytes());
		}
		buffer.extend_from_slice(&[0; 4]);
		buffer
	}
}

fn check_len(buffer: &[u8], needed: usize) -> Result<(), DecodeError>
{
	if buffer.len() < needed {
		Err(DecodeError::TooShort {
			got: buffer.len(),
			needed,
		})
	} else {
		Ok(())
	}
}

fn read_u16(buffer: &[u8], offset: usize) -> u16
{
	let mut bytes = [0u8; 2];
	bytes.copy_from_slice(&buffer[offset..offset + 2]);
	u16::from_le_bytes(bytes)
}

fn read_u32(buffer: &[u8], offset: usize) -> u32
{
	let mut bytes = [0u8; 4];
	bytes.copy_from_slice(&buffer[offset..offset + 4]);
	u32::from_le_bytes(bytes)
}

fn read_u64(buffer: &[u8], offset: usize) -> u64
{
	let mut bytes = [0u8; 8];
	bytes.copy_from_slice(&buffer[offset..offset + 8]);
	u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests
{
	use super::*;

	#[test]
	fn rrnid_pairing_holds_for_every_request()
	{
		for value in RRN_REQUEST_FIRST..RRN_REQUEST_INVALID_FIRST {
			let request = RrnId::try_from(value).expect("request range must convert");
			let response = request.response_id().expect("every request has a response");
			assert_eq!(response as u32, request as u32 + RRN_RESPONSE_OFFSET);
			assert_eq!(response.class(), RrnClass::Response);
		}
	}

	#[test]
	fn rrnid_rejects_sentinels_and_gaps()
	{
		for value in [
			0,
			RRN_NOTIFICATION_INVALID_FIRST,
			999,
			RRN_REQUEST_INVALID_FIRST,
			9999,
			RRN_RESPONSE_INVALID_FIRST,
			0x7fff_ffff,
		] {
			assert_eq!(RrnId::try_from(value), Err(DecodeError::InvalidRrnId(value)));
		}
	}

	#[test]
	fn notifications_and_responses_have_no_pair()
	{
		assert_eq!(RrnId::Beacon.response_id(), None);
		assert_eq!(RrnId::ConnectResp.response_id(), None);
		assert_eq!(RrnId::Beacon.class(), RrnClass::Notification);
		assert_eq!(RrnId::Connect.class(), RrnClass::Request);
	}

	#[test]
	fn data_xfer_round_trips_for_every_address_space()
	{
		let requests = [
			DataXferRequest {
				addr_space: AddrSpace::PspMem,
				stride: 4,
				cb_xfer: 64,
				flags: XferFlags::Read | XferFlags::IncrAddr,
				addr: XferAddr::Psp(0x2_4000),
			},
			DataXferRequest {
				addr_space: AddrSpace::Smn,
				stride: 1,
				cb_xfer: 16,
				flags: XferFlags::Write,
				addr: XferAddr::Smn(0x0290_0000),
			},
			DataXferRequest {
				addr_space: AddrSpace::X86Mem,
				stride: 4,
				cb_xfer: 4,
				flags: XferFlags::Write | XferFlags::Memset,
				addr: XferAddr::X86 {
					addr: 0x1_0000_0000,
					caching: 6,
				},
			},
		];
		for request in requests {
			let bytes = request.to_bytes();
			assert_eq!(bytes.len(), DataXferRequest::WIRE_SIZE);
			assert_eq!(DataXferRequest::from_bytes(&bytes), Ok(request));
		}
	}

	#[test]
	fn connect_params_caps_default_to_legacy()
	{
		// A legacy stub keeps the final word zeroed; that must parse as
		// "no extended capabilities".
		let mut bytes = ConnectParams {
			cb_pdu_max: 2048,
			cb_scratch: 0x8000,
			scratch_addr: 0x2_0000,
			sys_sockets: 1,
			ccds_per_socket: 1,
			caps: StubCaps::none(),
		}
		.to_bytes();
		let params = ConnectParams::from_bytes(&bytes).expect("valid connect payload");
		assert!(!params.caps.contains(StubCaps::ExtendedRrnIds));

		bytes[20] = 1;
		let params = ConnectParams::from_bytes(&bytes).expect("valid connect payload");
		assert!(params.caps.contains(StubCaps::ExtendedRrnIds));
	}

	#[test]
	fn branch_to_round_trips()
	{
		let request = BranchToRequest {
			flags: BranchToFlags::Thumb,
			dest: 0x100,
			gprs: core::array::from_fn(|index| index as u32),
		};
		let bytes = request.to_bytes();
		assert_eq!(bytes.len(), BranchToRequest::WIRE_SIZE);
		assert_eq!(BranchToRequest::from_bytes(&bytes), Ok(request));
	}
}
