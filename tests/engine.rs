// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end exercises of the protocol engine against a scripted stub
//! living on the other end of an in-memory transport.

use std::io::{Read, Write};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pspserial::error::StubError;
use pspserial::serial::engine::{
	CodeModule, CodeModuleState, ConnectionState, NotificationKind, NotificationPayload, StubEngine,
};
use pspserial::serial::pdu::codec;
use pspserial::serial::pdu::framer::Framer;
use pspserial::serial::pdu::{
	AddrSpace, BeaconNotification, ConnectParams, CoprocAccessRequest, DataXferRequest, ExecFinishedNotification,
	LinkDirection, MemXferRequest, OutBufNotification, PduHeader, RrnId, StubCaps, StubStatus, XferAddr, XferFlags,
};

/// Generous bound for anything that should complete immediately in-process.
const TEST_TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

/// Read half of the in-memory transport: byte chunks arrive over a channel
/// and a short receive timeout stands in for the serial layer's VTIME tick.
struct ChannelPipe
{
	source: Receiver<Vec<u8>>,
	leftover: Vec<u8>,
}

impl Read for ChannelPipe
{
	fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize>
	{
		if self.leftover.is_empty() {
			match self.source.recv_timeout(Duration::from_millis(10)) {
				Ok(chunk) => self.leftover = chunk,
				// Idle tick, same as a serial read timing out with no data
				Err(_) => return Ok(0),
			}
		}
		let amount = buffer.len().min(self.leftover.len());
		buffer[..amount].copy_from_slice(&self.leftover[..amount]);
		self.leftover.drain(..amount);
		Ok(amount)
	}
}

/// Write half of the in-memory transport.
struct ChannelSink
{
	sink: Sender<Vec<u8>>,
}

impl Write for ChannelSink
{
	fn write(&mut self, buffer: &[u8]) -> std::io::Result<usize>
	{
		// The stub side hanging up mid-test is fine; writes just vanish
		let _ = self.sink.send(buffer.to_vec());
		Ok(buffer.len())
	}

	fn flush(&mut self) -> std::io::Result<()>
	{
		Ok(())
	}
}

/// The scripted stub's side of the link, handed to request handlers.
struct StubWire
{
	to_host: Sender<Vec<u8>>,
	counter: u32,
	beacons_sent: u32,
}

impl StubWire
{
	fn send(&mut self, rrn_id: RrnId, id_ccd: u32, rc_req: i32, payload: &[u8])
	{
		self.counter = self.counter.wrapping_add(1);
		let header = PduHeader {
			cb_pdu: 0,
			c_pdus: self.counter,
			rrn_id,
			id_ccd,
			rc_req,
			ts_millies: 42,
		};
		let bytes = codec::encode(LinkDirection::StubToHost, &header, payload);
		let _ = self.to_host.send(bytes);
	}

	/// Answer a request with the paired response ID.
	fn respond(&mut self, request: &PduHeader, status: StubStatus, payload: &[u8])
	{
		let response_id = request.rrn_id.response_id().expect("handlers only see requests");
		self.send(response_id, request.id_ccd, status.to_raw(), payload);
	}

	/// Announce a (re)boot. The counter restarts like the real stub's does.
	fn beacon(&mut self)
	{
		self.counter = 0;
		self.beacons_sent += 1;
		let payload = BeaconNotification {
			beacons_sent: self.beacons_sent,
		}
		.to_bytes();
		self.send(RrnId::Beacon, 0, 0, &payload);
	}
}

enum StubCommand
{
	Beacon,
	Notify
	{
		rrn_id: RrnId,
		id_ccd: u32,
		payload: Vec<u8>,
	},
}

struct Harness
{
	engine: StubEngine,
	commands: Option<Sender<StubCommand>>,
	stub: Option<JoinHandle<()>>,
}

impl Harness
{
	fn command(&self, command: StubCommand)
	{
		self.commands
			.as_ref()
			.expect("command channel lives until drop")
			.send(command)
			.expect("stub thread alive");
	}
}

impl Drop for Harness
{
	fn drop(&mut self)
	{
		self.engine.shutdown();
		// Dropping the command channel tells the stub loop to wind down
		drop(self.commands.take());
		if let Some(stub) = self.stub.take() {
			let _ = stub.join();
		}
	}
}

/// Wire an engine up to a scripted stub. The handler gets every request
/// the host sends, already deframed and validated.
fn harness<H>(mut handler: H) -> Harness
where
	H: FnMut(&PduHeader, &[u8], &mut StubWire) + Send + 'static,
{
	let _ = env_logger::builder().is_test(true).try_init();

	let (host_tx, stub_rx) = channel::<Vec<u8>>();
	let (stub_tx, host_rx) = channel::<Vec<u8>>();
	let (command_tx, command_rx) = channel::<StubCommand>();

	let stub = thread::spawn(move || {
		let mut wire = StubWire {
			to_host: stub_tx,
			counter: 0,
			beacons_sent: 0,
		};
		let mut framer = Framer::new(LinkDirection::HostToStub);
		loop {
			match command_rx.try_recv() {
				Ok(StubCommand::Beacon) => wire.beacon(),
				Ok(StubCommand::Notify {
					rrn_id,
					id_ccd,
					payload,
				}) => wire.send(rrn_id, id_ccd, 0, &payload),
				Err(TryRecvError::Empty) => {},
				Err(TryRecvError::Disconnected) => break,
			}
			match stub_rx.recv_timeout(Duration::from_millis(5)) {
				Ok(chunk) => {
					framer.extend(&chunk);
					while let Some((header, payload)) = framer.next_pdu() {
						handler(&header, &payload, &mut wire);
					}
				},
				Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {},
				Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
			}
		}
	});

	let engine = StubEngine::new(
		Box::new(ChannelPipe {
			source: host_rx,
			leftover: Vec::new(),
		}),
		Box::new(ChannelSink {
			sink: host_tx,
		}),
	);

	Harness {
		engine,
		commands: Some(command_tx),
		stub: Some(stub),
	}
}

fn default_params() -> ConnectParams
{
	ConnectParams {
		cb_pdu_max: 2048,
		cb_scratch: 0x1_0000,
		scratch_addr: 0x4_0000,
		sys_sockets: 1,
		ccds_per_socket: 2,
		caps: StubCaps::ExtendedRrnIds,
	}
}

/// Handler answering the connect handshake plus simple memory traffic.
fn basic_stub(params: ConnectParams) -> impl FnMut(&PduHeader, &[u8], &mut StubWire) + Send + 'static
{
	move |header, payload, wire| match header.rrn_id {
		RrnId::Connect => wire.respond(header, StubStatus::Success, &params.to_bytes()),
		RrnId::PspMemRead => {
			let request = MemXferRequest::from_bytes(payload).expect("host sends valid descriptors");
			let data = (0..request.cb_xfer).map(|byte| byte as u8).collect::<Vec<_>>();
			wire.respond(header, StubStatus::Success, &data);
		},
		RrnId::PspMemWrite => wire.respond(header, StubStatus::Success, &[]),
		RrnId::SmnRead => wire.respond(header, StubStatus::InvalidParameter, &[]),
		other => panic!("unscripted request {:?}", other),
	}
}

#[test]
fn handshake_then_memory_traffic()
{
	let harness = harness(basic_stub(default_params()));
	let engine = &harness.engine;
	assert_eq!(engine.state(), ConnectionState::Disconnected);

	// Nothing but connect is legal before the handshake
	assert!(matches!(
		engine.psp_mem_read(0, 0x1000, 16, TEST_TIMEOUT),
		Err(StubError::InvalidState(_))
	));

	harness.command(StubCommand::Beacon);
	engine
		.wait_for_beacon(Some(Duration::from_secs(5)))
		.expect("beacon must arrive");
	// Connect is also required before anything else - the beacon alone
	// does not make the link usable
	assert!(matches!(
		engine.psp_mem_read(0, 0x1000, 16, TEST_TIMEOUT),
		Err(StubError::InvalidState(_))
	));

	let params = engine.connect(TEST_TIMEOUT).expect("handshake succeeds");
	assert_eq!(params, default_params());
	assert_eq!(engine.state(), ConnectionState::Connected);
	assert_eq!(engine.params(), Some(default_params()));

	// Reads come back truncated to exactly the requested length
	let data = engine
		.psp_mem_read(0, 0x1000, 16, TEST_TIMEOUT)
		.expect("read succeeds");
	assert_eq!(data, (0..16).collect::<Vec<u8>>());

	engine
		.psp_mem_write(1, 0x2000, &[1, 2, 3, 4], TEST_TIMEOUT)
		.expect("write succeeds");

	// A failing status surfaces as a protocol error carrying it
	match engine.smn_read(0, 0x5800_0000, 4, TEST_TIMEOUT) {
		Err(StubError::Protocol(status)) => assert_eq!(status, StubStatus::InvalidParameter),
		other => panic!("expected a protocol error, got {:?}", other),
	}
}

#[test]
fn outgoing_counters_are_monotone()
{
	let mut expected = 0u32;
	let harness = harness(move |header: &PduHeader, payload: &[u8], wire: &mut StubWire| {
		expected += 1;
		assert_eq!(header.c_pdus, expected, "host PDU counter must increment by one per PDU");
		basic_stub(default_params())(header, payload, wire);
	});
	let engine = &harness.engine;

	harness.command(StubCommand::Beacon);
	engine
		.wait_for_beacon(Some(Duration::from_secs(5)))
		.expect("beacon must arrive");
	engine.connect(TEST_TIMEOUT).expect("handshake succeeds");
	for _ in 0..8 {
		engine
			.psp_mem_read(0, 0x1000, 4, TEST_TIMEOUT)
			.expect("read succeeds");
	}
}

#[test]
fn concurrent_senders_keep_wire_counters_ordered()
{
	// The receive side sees PDUs in wire order; with the counter claimed
	// and the PDU written as one step, every arrival must carry exactly
	// the previous counter plus one even under contention.
	let mut expected = 0u32;
	let harness = harness(move |header: &PduHeader, payload: &[u8], wire: &mut StubWire| {
		expected += 1;
		assert_eq!(
			header.c_pdus, expected,
			"counters hit the wire out of order: got {} after {}",
			header.c_pdus,
			expected - 1
		);
		basic_stub(default_params())(header, payload, wire);
	});
	let engine = &harness.engine;

	harness.command(StubCommand::Beacon);
	engine
		.wait_for_beacon(Some(Duration::from_secs(5)))
		.expect("beacon must arrive");
	engine.connect(TEST_TIMEOUT).expect("handshake succeeds");

	thread::scope(|scope| {
		// One thread per die so nobody trips the per-die discipline
		for id_ccd in 0..4u32 {
			scope.spawn(move || {
				for _ in 0..50 {
					engine
						.psp_mem_read(id_ccd, 0x1000, 4, TEST_TIMEOUT)
						.expect("read succeeds");
				}
			});
		}
	});
}

#[test]
fn beacon_resets_the_world()
{
	let harness = harness(move |header: &PduHeader, payload: &[u8], wire: &mut StubWire| {
		if header.rrn_id == RrnId::PspMemRead {
			// Crash instead of answering: the stub reboots mid-request
			wire.beacon();
			return;
		}
		basic_stub(default_params())(header, payload, wire);
	});
	let engine = &harness.engine;

	harness.command(StubCommand::Beacon);
	engine
		.wait_for_beacon(Some(Duration::from_secs(5)))
		.expect("beacon must arrive");
	engine.connect(TEST_TIMEOUT).expect("handshake succeeds");

	// The in-flight request dies with the stub
	assert!(matches!(
		engine.psp_mem_read(0, 0x1000, 16, TEST_TIMEOUT),
		Err(StubError::Reset)
	));
	assert_eq!(engine.state(), ConnectionState::AwaitingBeacon);
	assert_eq!(engine.params(), None);

	// The link recovers with a fresh handshake
	engine.connect(TEST_TIMEOUT).expect("reconnect succeeds");
	assert_eq!(engine.state(), ConnectionState::Connected);
}

#[test]
fn extended_requests_need_the_capability()
{
	let mut params = default_params();
	params.caps = StubCaps::none();
	let harness = harness(basic_stub(params));
	let engine = &harness.engine;

	harness.command(StubCommand::Beacon);
	engine
		.wait_for_beacon(Some(Duration::from_secs(5)))
		.expect("beacon must arrive");
	engine.connect(TEST_TIMEOUT).expect("handshake succeeds");

	// A legacy stub zeroes the capability word, so the extended set is
	// refused locally without putting anything on the wire
	let xfer = DataXferRequest {
		addr_space: AddrSpace::PspMem,
		stride: 4,
		cb_xfer: 16,
		flags: XferFlags::Read | XferFlags::IncrAddr,
		addr: XferAddr::Psp(0x1000),
	};
	assert!(matches!(
		engine.data_xfer(0, &xfer, None, TEST_TIMEOUT),
		Err(StubError::InvalidState(_))
	));

	let register = CoprocAccessRequest {
		coproc: 15,
		crn: 0,
		crm: 0,
		opc1: 0,
		opc2: 0,
	};
	assert!(matches!(
		engine.coproc_read(0, &register, TEST_TIMEOUT),
		Err(StubError::InvalidState(_))
	));
}

#[test]
fn busy_die_turns_down_a_second_request()
{
	let harness = harness(move |header: &PduHeader, payload: &[u8], wire: &mut StubWire| {
		if header.rrn_id == RrnId::PspMemRead {
			// A slow stub keeps the die busy long enough for the race
			thread::sleep(Duration::from_millis(200));
		}
		basic_stub(default_params())(header, payload, wire);
	});
	let engine = &harness.engine;

	harness.command(StubCommand::Beacon);
	engine
		.wait_for_beacon(Some(Duration::from_secs(5)))
		.expect("beacon must arrive");
	engine.connect(TEST_TIMEOUT).expect("handshake succeeds");

	thread::scope(|scope| {
		let slow = scope.spawn(|| engine.psp_mem_read(0, 0x1000, 8, TEST_TIMEOUT));
		thread::sleep(Duration::from_millis(50));

		// Same die: refused while the slow read is outstanding
		assert!(matches!(
			engine.psp_mem_write(0, 0x2000, &[0xaa], TEST_TIMEOUT),
			Err(StubError::TryAgain {
				id_ccd: 0
			})
		));
		// Other die: fine, the discipline is per die
		engine
			.psp_mem_write(1, 0x2000, &[0xbb], TEST_TIMEOUT)
			.expect("other die is idle");

		let data = slow.join().expect("reader thread must not panic").expect("slow read succeeds");
		assert_eq!(data.len(), 8);
	});
}

#[test]
fn code_module_lifecycle()
{
	let harness = harness(move |header: &PduHeader, payload: &[u8], wire: &mut StubWire| match header.rrn_id {
		RrnId::Connect => wire.respond(header, StubStatus::Success, &default_params().to_bytes()),
		RrnId::LoadCodeMod => wire.respond(header, StubStatus::Success, &[]),
		RrnId::ExecCodeMod => {
			wire.respond(header, StubStatus::Success, &[]);
			// Completion arrives as a notification a moment later
			let finished = ExecFinishedNotification {
				ret: 0x1234,
			}
			.to_bytes();
			wire.send(RrnId::CodeModFinished, header.id_ccd, 0, &finished);
		},
		other => panic!("unscripted request {:?}", other),
	});
	let engine = &harness.engine;

	harness.command(StubCommand::Beacon);
	engine
		.wait_for_beacon(Some(Duration::from_secs(5)))
		.expect("beacon must arrive");
	engine.connect(TEST_TIMEOUT).expect("handshake succeeds");

	let mut module = CodeModule::new(engine, 0);
	assert_eq!(module.state(), CodeModuleState::NotLoaded);

	// Executing before anything is staged is a local error
	assert!(matches!(
		module.execute([0; 4], TEST_TIMEOUT),
		Err(StubError::InvalidState(_))
	));

	module.load(b"\x00\xf0\x20\xe3", TEST_TIMEOUT).expect("load succeeds");
	assert_eq!(module.state(), CodeModuleState::Loaded);
	// Loading over a staged module is refused too
	assert!(matches!(
		module.load(b"\x00\xf0\x20\xe3", TEST_TIMEOUT),
		Err(StubError::InvalidState(_))
	));

	module
		.execute([1, 2, 3, 4], TEST_TIMEOUT)
		.expect("execute succeeds");
	let ret = module
		.wait_finished(Some(Duration::from_secs(5)))
		.expect("module completes");
	assert_eq!(ret, 0x1234);
	assert_eq!(module.state(), CodeModuleState::Finished(0x1234));

	// A finished slot can be reused
	module.load(b"\x00\xf0\x20\xe3", TEST_TIMEOUT).expect("reload succeeds");
	assert_eq!(module.state(), CodeModuleState::Loaded);
}

#[test]
fn notifications_reach_their_observers()
{
	let harness = harness(basic_stub(default_params()));
	let engine = &harness.engine;

	let output = engine.subscribe(NotificationKind::OutputBufferData);
	let mut payload = OutBufNotification {
		id_out_buf: 3,
	}
	.to_bytes();
	payload.extend_from_slice(b"module output");
	harness.command(StubCommand::Notify {
		rrn_id: RrnId::OutBuf,
		id_ccd: 1,
		payload,
	});

	let notification = output
		.recv_timeout(Duration::from_secs(5))
		.expect("notification must arrive");
	assert_eq!(notification.id_ccd, 1);
	match notification.payload {
		NotificationPayload::OutputBufferData {
			id_out_buf,
			data,
		} => {
			assert_eq!(id_out_buf, 3);
			// The 13 data bytes arrive with the PDU's alignment padding
			// still attached; the wire has no unpadded length for them.
			assert_eq!(data, b"module output\x00\x00\x00");
		},
		other => panic!("unexpected payload {:?}", other),
	}
}
