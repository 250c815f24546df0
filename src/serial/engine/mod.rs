// SPDX-License-Identifier: MIT OR Apache-2.0

//! The protocol engine proper: one read loop feeding the framer, one
//! serialized write path, and the correlation/notification machinery in
//! between.
//!
//! Exactly one engine instance owns a physical link. Concurrent callers
//! may issue requests to different dies at the same time; the engine
//! hands each die's traffic through the correlator and keeps the wire
//! writes whole by taking the writer exactly once per PDU.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::error::StubError;
use crate::serial::pdu::codec::{self, wire_size};
use crate::serial::pdu::framer::Framer;
use crate::serial::pdu::{
	BranchToRequest, ConnectParams, CoprocAccessRequest, DataXferRequest, DecodeError, InputBufWriteRequest,
	LinkDirection, MemXferRequest, PduHeader, RrnClass, RrnId, StubCaps, StubStatus, X86MemXferRequest,
};

pub mod code_module;
pub mod connection;
pub mod correlator;
pub mod dispatcher;

pub use code_module::{CodeModule, CodeModuleState};
pub use connection::{Connection, ConnectionState};
pub use correlator::{Completion, Correlator};
pub use dispatcher::{Dispatcher, Notification, NotificationKind, NotificationPayload};

/// Size of the chunks pulled off the transport per read call.
const READ_CHUNK_SIZE: usize = 512;

struct EngineShared
{
	writer: Mutex<Box<dyn Write + Send>>,
	connection: Mutex<Connection>,
	correlator: Mutex<Correlator>,
	dispatcher: Dispatcher,
	shutdown: AtomicBool,
}

/// The host-side engine for one stub link.
pub struct StubEngine
{
	shared: Arc<EngineShared>,
	read_loop: Option<JoinHandle<()>>,
}

impl StubEngine
{
	/// Bring up the engine over the two halves of a transport. The reader
	/// half is consumed by a dedicated thread; short read timeouts on the
	/// transport (the serial layer configures 0.5s) double as the
	/// shutdown poll interval.
	pub fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self
	{
		let shared = Arc::new(EngineShared {
			writer: Mutex::new(writer),
			connection: Mutex::new(Connection::new()),
			correlator: Mutex::new(Correlator::new()),
			dispatcher: Dispatcher::new(),
			shutdown: AtomicBool::new(false),
		});

		let loop_shared = shared.clone();
		let read_loop = thread::Builder::new()
			.name("pdu-rx".into())
			.spawn(move || read_loop(loop_shared, reader))
			.expect("spawning the receive thread cannot fail");

		Self {
			shared,
			read_loop: Some(read_loop),
		}
	}

	pub fn state(&self) -> ConnectionState
	{
		self.connection().state()
	}

	/// Negotiated parameters, present once connected.
	pub fn params(&self) -> Option<ConnectParams>
	{
		self.connection().params().copied()
	}

	/// Subscribe to one kind of unsolicited notification.
	pub fn subscribe(&self, kind: NotificationKind) -> Receiver<Notification>
	{
		self.shared.dispatcher.subscribe(kind)
	}

	/// Wait until the stub announces itself. Returns immediately when a
	/// beacon has already been observed and not yet consumed by a
	/// handshake; `None` waits indefinitely.
	pub fn wait_for_beacon(&self, timeout: Option<Duration>) -> Result<(), StubError>
	{
		// Subscribe before checking the state so a beacon arriving in
		// between cannot be missed.
		let beacons = self.subscribe(NotificationKind::Beacon);
		if self.state() != ConnectionState::Disconnected {
			return Ok(());
		}
		let result = match timeout {
			Some(timeout) => beacons.recv_timeout(timeout).map_err(|error| match error {
				RecvTimeoutError::Timeout => StubError::Timeout {
					id_ccd: 0,
				},
				RecvTimeoutError::Disconnected => StubError::InvalidState("engine stopped"),
			}),
			None => beacons
				.recv()
				.map_err(|_| StubError::InvalidState("engine stopped")),
		};
		result.map(|_| ())
	}

	/// Run the connect handshake. Valid only while a beacon is pending;
	/// on success the negotiated parameters govern all further traffic.
	pub fn connect(&self, timeout: Option<Duration>) -> Result<ConnectParams, StubError>
	{
		let payload = self.send_request(0, RrnId::Connect, &[], timeout)?;
		let params = ConnectParams::from_bytes(&payload)?;
		self.connection().on_connected(params)?;
		Ok(params)
	}

	/// Send one request PDU and wait for its response, the caller's
	/// deadline, or a reset - whichever comes first. `None` waits
	/// indefinitely. Returns the response payload once the stub reports
	/// success.
	pub fn send_request(
		&self,
		id_ccd: u32,
		rrn_id: RrnId,
		payload: &[u8],
		timeout: Option<Duration>,
	) -> Result<Vec<u8>, StubError>
	{
		let (receiver, counter) = self.shared.submit(id_ccd, rrn_id, payload)?;

		let completion = match timeout {
			Some(timeout) => receiver.recv_timeout(timeout).map_err(|error| match error {
				RecvTimeoutError::Timeout => {
					// Withdraw the entry; the eventual late response gets
					// discarded as unmatched.
					self.shared.correlator().cancel(id_ccd, counter);
					StubError::Timeout {
						id_ccd,
					}
				},
				RecvTimeoutError::Disconnected => StubError::InvalidState("engine stopped"),
			})?,
			None => receiver
				.recv()
				.map_err(|_| StubError::InvalidState("engine stopped"))?,
		};

		match completion {
			Completion::Response {
				status,
				payload,
			} => {
				let status = StubStatus::from_raw(status);
				if status.is_failure() {
					Err(StubError::Protocol(status))
				} else {
					Ok(payload)
				}
			},
			Completion::Reset => Err(StubError::Reset),
		}
	}

	/// Read from PSP SRAM through the dedicated request.
	pub fn psp_mem_read(&self, id_ccd: u32, addr: u32, len: u32, timeout: Option<Duration>)
	-> Result<Vec<u8>, StubError>
	{
		self.mem_read(id_ccd, RrnId::PspMemRead, addr, len, timeout)
	}

	/// Write to PSP SRAM through the dedicated request.
	pub fn psp_mem_write(&self, id_ccd: u32, addr: u32, data: &[u8], timeout: Option<Duration>)
	-> Result<(), StubError>
	{
		self.mem_write(id_ccd, RrnId::PspMemWrite, addr, data, timeout)
	}

	/// Read from PSP MMIO through the dedicated request.
	pub fn psp_mmio_read(&self, id_ccd: u32, addr: u32, len: u32, timeout: Option<Duration>)
	-> Result<Vec<u8>, StubError>
	{
		self.mem_read(id_ccd, RrnId::PspMmioRead, addr, len, timeout)
	}

	/// Write to PSP MMIO through the dedicated request.
	pub fn psp_mmio_write(&self, id_ccd: u32, addr: u32, data: &[u8], timeout: Option<Duration>)
	-> Result<(), StubError>
	{
		self.mem_write(id_ccd, RrnId::PspMmioWrite, addr, data, timeout)
	}

	/// Read from the system management network.
	pub fn smn_read(&self, id_ccd: u32, addr: u32, len: u32, timeout: Option<Duration>) -> Result<Vec<u8>, StubError>
	{
		self.mem_read(id_ccd, RrnId::SmnRead, addr, len, timeout)
	}

	/// Write to the system management network.
	pub fn smn_write(&self, id_ccd: u32, addr: u32, data: &[u8], timeout: Option<Duration>) -> Result<(), StubError>
	{
		self.mem_write(id_ccd, RrnId::SmnWrite, addr, data, timeout)
	}

	/// Read x86 memory through the dedicated request.
	pub fn x86_mem_read(&self, id_ccd: u32, addr: u64, len: u32, timeout: Option<Duration>)
	-> Result<Vec<u8>, StubError>
	{
		self.x86_read(id_ccd, RrnId::X86MemRead, addr, len, timeout)
	}

	/// Write x86 memory through the dedicated request.
	pub fn x86_mem_write(&self, id_ccd: u32, addr: u64, data: &[u8], timeout: Option<Duration>)
	-> Result<(), StubError>
	{
		self.x86_write(id_ccd, RrnId::X86MemWrite, addr, data, timeout)
	}

	/// Read x86 MMIO through the dedicated request.
	pub fn x86_mmio_read(&self, id_ccd: u32, addr: u64, len: u32, timeout: Option<Duration>)
	-> Result<Vec<u8>, StubError>
	{
		self.x86_read(id_ccd, RrnId::X86MmioRead, addr, len, timeout)
	}

	/// Write x86 MMIO through the dedicated request.
	pub fn x86_mmio_write(&self, id_ccd: u32, addr: u64, data: &[u8], timeout: Option<Duration>)
	-> Result<(), StubError>
	{
		self.x86_write(id_ccd, RrnId::X86MmioWrite, addr, data, timeout)
	}

	/// Issue a generic data transfer (extended ID set). For writes the
	/// data to transfer rides behind the descriptor; reads return the
	/// transferred bytes.
	pub fn data_xfer(
		&self,
		id_ccd: u32,
		request: &DataXferRequest,
		data: Option<&[u8]>,
		timeout: Option<Duration>,
	) -> Result<Vec<u8>, StubError>
	{
		let mut payload = request.to_bytes();
		if let Some(data) = data {
			payload.extend_from_slice(data);
		}
		let mut response = self.send_request(id_ccd, RrnId::DataXfer, &payload, timeout)?;
		response.truncate(request.cb_xfer as usize);
		Ok(response)
	}

	/// Read a co-processor register (extended ID set).
	pub fn coproc_read(&self, id_ccd: u32, register: &CoprocAccessRequest, timeout: Option<Duration>)
	-> Result<u32, StubError>
	{
		let payload = self.send_request(id_ccd, RrnId::CoprocRead, &register.to_bytes(), timeout)?;
		payload_u32(&payload)
	}

	/// Write a co-processor register (extended ID set).
	pub fn coproc_write(
		&self,
		id_ccd: u32,
		register: &CoprocAccessRequest,
		value: u32,
		timeout: Option<Duration>,
	) -> Result<(), StubError>
	{
		let mut payload = register.to_bytes();
		payload.extend_from_slice(&value.to_le_bytes());
		payload.extend_from_slice(&[0; 4]);
		self.send_request(id_ccd, RrnId::CoprocWrite, &payload, timeout)?;
		Ok(())
	}

	/// Feed data into one of the stub's input buffers for a running code
	/// module to consume.
	pub fn input_buf_write(&self, id_ccd: u32, id_in_buf: u32, data: &[u8], timeout: Option<Duration>)
	-> Result<(), StubError>
	{
		let mut payload = InputBufWriteRequest {
			id_in_buf,
		}
		.to_bytes();
		payload.extend_from_slice(data);
		self.send_request(id_ccd, RrnId::InputBufWrite, &payload, timeout)?;
		Ok(())
	}

	/// Branch the stub's core to an arbitrary address (extended ID set).
	/// The response confirms only that the branch is about to happen;
	/// this almost certainly kills the stub, so expect a beacon next.
	pub fn branch_to(&self, id_ccd: u32, request: &BranchToRequest, timeout: Option<Duration>)
	-> Result<(), StubError>
	{
		self.send_request(id_ccd, RrnId::BranchTo, &request.to_bytes(), timeout)?;
		Ok(())
	}

	/// Stop the read loop and wait for it to wind down.
	pub fn shutdown(&mut self)
	{
		self.shared.shutdown.store(true, Ordering::Release);
		if let Some(handle) = self.read_loop.take() {
			if handle.join().is_err() {
				error!("The receive thread panicked during shutdown");
			}
		}
	}

	fn connection(&self) -> std::sync::MutexGuard<'_, Connection>
	{
		self.shared.connection.lock().expect("connection state poisoned")
	}

	fn mem_read(&self, id_ccd: u32, rrn_id: RrnId, addr: u32, len: u32, timeout: Option<Duration>)
	-> Result<Vec<u8>, StubError>
	{
		let request = MemXferRequest {
			addr,
			cb_xfer: len,
		};
		let mut payload = self.send_request(id_ccd, rrn_id, &request.to_bytes(), timeout)?;
		payload.truncate(len as usize);
		Ok(payload)
	}

	fn mem_write(&self, id_ccd: u32, rrn_id: RrnId, addr: u32, data: &[u8], timeout: Option<Duration>)
	-> Result<(), StubError>
	{
		let mut payload = MemXferRequest {
			addr,
			cb_xfer: data.len() as u32,
		}
		.to_bytes();
		payload.extend_from_slice(data);
		self.send_request(id_ccd, rrn_id, &payload, timeout)?;
		Ok(())
	}

	fn x86_read(&self, id_ccd: u32, rrn_id: RrnId, addr: u64, len: u32, timeout: Option<Duration>)
	-> Result<Vec<u8>, StubError>
	{
		let request = X86MemXferRequest {
			addr,
			cb_xfer: len,
		};
		let mut payload = self.send_request(id_ccd, rrn_id, &request.to_bytes(), timeout)?;
		payload.truncate(len as usize);
		Ok(payload)
	}

	fn x86_write(&self, id_ccd: u32, rrn_id: RrnId, addr: u64, data: &[u8], timeout: Option<Duration>)
	-> Result<(), StubError>
	{
		let mut payload = X86MemXferRequest {
			addr,
			cb_xfer: data.len() as u32,
		}
		.to_bytes();
		payload.extend_from_slice(data);
		self.send_request(id_ccd, rrn_id, &payload, timeout)?;
		Ok(())
	}
}

impl Drop for StubEngine
{
	fn drop(&mut self)
	{
		self.shutdown();
	}
}

impl EngineShared
{
	fn correlator(&self) -> std::sync::MutexGuard<'_, Correlator>
	{
		self.correlator.lock().expect("correlator state poisoned")
	}

	/// Validate, frame and write one request PDU. Returns the completion
	/// channel and the counter the PDU went out with.
	fn submit(&self, id_ccd: u32, rrn_id: RrnId, payload: &[u8])
	-> Result<(Receiver<Completion>, u32), StubError>
	{
		let mut connection = self.connection.lock().expect("connection state poisoned");

		// The connect request is the one thing valid before the
		// handshake; everything else needs negotiated parameters.
		if rrn_id == RrnId::Connect {
			if connection.state() != ConnectionState::AwaitingBeacon {
				return Err(StubError::InvalidState("connect requires a pending beacon"));
			}
		} else {
			let Some(params) = connection.params() else {
				return Err(StubError::InvalidState("not connected to the stub"));
			};
			if rrn_id.is_extended() && !params.caps.contains(StubCaps::ExtendedRrnIds) {
				return Err(StubError::InvalidState("the stub firmware lacks the extended request set"));
			}
			if wire_size(codec::padded_len(payload.len())) as u32 > params.cb_pdu_max {
				return Err(StubError::InvalidState("request exceeds the negotiated maximum PDU size"));
			}
		}

		let mut correlator = self.correlator.lock().expect("correlator state poisoned");
		if correlator.is_busy(id_ccd) {
			return Err(StubError::TryAgain {
				id_ccd,
			});
		}
		let counter = connection.next_counter();
		let receiver = correlator.register(id_ccd, rrn_id, counter)?;
		drop(correlator);

		let header = PduHeader::request(rrn_id, id_ccd, counter);
		let bytes = codec::encode(LinkDirection::HostToStub, &header, payload);
		trace!("TX {:?} to die {} ({} bytes, counter {})", rrn_id, id_ccd, bytes.len(), counter);

		// One writer acquisition per PDU keeps frames whole on the wire.
		// The writer lock must be taken before the connection lock goes:
		// counters are claimed under the latter, so a concurrent sender to
		// another die could otherwise claim the next counter and write its
		// PDU first, putting the counters on the wire out of order.
		let result = {
			let mut writer = self.writer.lock().expect("link writer poisoned");
			drop(connection);
			writer.write_all(&bytes).and_then(|_| writer.flush())
		};
		if let Err(error) = result {
			// The request never made it out; withdraw it so the die does
			// not stay busy forever.
			self.correlator().cancel(id_ccd, counter);
			return Err(error.into());
		}
		Ok((receiver, counter))
	}

	fn handle_pdu(&self, header: PduHeader, payload: Vec<u8>)
	{
		trace!(
			"RX {:?} from die {} (counter {}, status {})",
			header.rrn_id, header.id_ccd, header.c_pdus, header.rc_req
		);
		self.connection
			.lock()
			.expect("connection state poisoned")
			.note_received(header.c_pdus);

		match header.rrn_id.class() {
			RrnClass::Response => {
				self.correlator().complete(&header, payload);
			},
			RrnClass::Notification => self.handle_notification(header, payload),
			RrnClass::Request =>
				warn!("Discarding request-class PDU {:?} - the host never serves requests", header.rrn_id),
		}
	}

	fn handle_notification(&self, header: PduHeader, payload: Vec<u8>)
	{
		let notification = match Notification::decode(&header, &payload) {
			Ok(notification) => notification,
			Err(error) => {
				warn!("Discarding malformed {:?} notification: {}", header.rrn_id, error);
				return;
			},
		};

		if matches!(notification.payload, NotificationPayload::Beacon(_)) {
			// A beacon is the reset signal. This path runs whether or not
			// anybody subscribed to beacons: counters restart, negotiated
			// parameters are void and everything in flight dies now.
			self.connection
				.lock()
				.expect("connection state poisoned")
				.on_beacon();
			self.correlator().reset_all();
		}

		self.dispatcher.dispatch(notification);
	}
}

fn read_loop(shared: Arc<EngineShared>, mut reader: Box<dyn Read + Send>)
{
	let mut framer = Framer::new(LinkDirection::StubToHost);
	let mut chunk = [0u8; READ_CHUNK_SIZE];

	while !shared.shutdown.load(Ordering::Acquire) {
		let read = match reader.read(&mut chunk) {
			// A zero-length read is the transport's timeout tick; use it
			// to poll the shutdown flag and carry on.
			Ok(0) => continue,
			Ok(read) => read,
			Err(error) if matches!(error.kind(), ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock) =>
				continue,
			Err(error) => {
				error!("Stub link read failed: {}", error);
				break;
			},
		};

		framer.extend(&chunk[..read]);
		while let Some((header, payload)) = framer.next_pdu() {
			shared.handle_pdu(header, payload);
		}
	}
	debug!(
		"Receive loop wound down ({} noise bytes discarded over the session)",
		framer.discarded()
	);
}

fn payload_u32(payload: &[u8]) -> Result<u32, StubError>
{
	if payload.len() < 4 {
		return Err(StubError::Framing(DecodeError::TooShort {
			got: payload.len(),
			needed: 4,
		}));
	}
	let mut bytes = [0u8; 4];
	bytes.copy_from_slice(&payload[..4]);
	Ok(u32::from_le_bytes(bytes))
}
