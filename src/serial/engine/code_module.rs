// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle handling for code modules - small flat binaries the stub
//! loads into its scratch space and runs on request.
//!
//! The state machine is strictly load, execute, wait: executing before a
//! load or loading over a running module is refused locally, without
//! bothering the wire. A beacon at any point throws the module back to
//! square one since the stub's scratch space did not survive the reset.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::error::StubError;
use crate::serial::engine::{Notification, NotificationKind, NotificationPayload, StubEngine};
use crate::serial::pdu::{CodeModType, ExecCodeModRequest, LoadCodeModRequest, RrnId};

/// Poll granularity while blocking on module completion. The wait also
/// has to notice resets, and std channels cannot be selected on.
const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeModuleState
{
	/// No module in the stub's scratch space (or a reset wiped it).
	NotLoaded,
	/// Image transferred and staged, ready to execute.
	Loaded,
	/// The stub handed control to the module's entry point.
	Executing,
	/// The module returned; carries its return value.
	Finished(u32),
}

/// One code module slot on one die. Holds subscriptions for the
/// completion notification and for resets so state stays truthful even
/// when the caller never blocks on [`CodeModule::wait_finished`].
pub struct CodeModule<'link>
{
	engine: &'link StubEngine,
	id_ccd: u32,
	state: CodeModuleState,
	finished: Receiver<Notification>,
	resets: Receiver<Notification>,
}

impl<'link> CodeModule<'link>
{
	pub fn new(engine: &'link StubEngine, id_ccd: u32) -> Self
	{
		Self {
			finished: engine.subscribe(NotificationKind::CodeModuleFinished),
			resets: engine.subscribe(NotificationKind::Beacon),
			engine,
			id_ccd,
			state: CodeModuleState::NotLoaded,
		}
	}

	/// Current lifecycle state, after catching up with any notifications
	/// that arrived since the last call.
	pub fn state(&mut self) -> CodeModuleState
	{
		self.poll();
		self.state
	}

	pub fn id_ccd(&self) -> u32
	{
		self.id_ccd
	}

	/// Transfer a flat binary into the stub's scratch space. Valid when
	/// nothing is loaded or the previous module finished; a running
	/// module must not be pulled out from under the stub.
	pub fn load(&mut self, image: &[u8], timeout: Option<Duration>) -> Result<(), StubError>
	{
		match self.state() {
			CodeModuleState::NotLoaded | CodeModuleState::Finished(_) => {},
			CodeModuleState::Loaded | CodeModuleState::Executing =>
				return Err(StubError::InvalidState("a code module is already staged or running")),
		}

		let mut payload = LoadCodeModRequest {
			module_type: CodeModType::FlatBinary,
		}
		.to_bytes();
		payload.extend_from_slice(image);
		self.engine
			.send_request(self.id_ccd, RrnId::LoadCodeMod, &payload, timeout)?;
		info!("Loaded {} byte code module onto die {}", image.len(), self.id_ccd);
		self.state = CodeModuleState::Loaded;
		Ok(())
	}

	/// Kick off the staged module. The response only acknowledges that
	/// execution started; completion arrives later as a notification.
	pub fn execute(&mut self, args: [u32; 4], timeout: Option<Duration>) -> Result<(), StubError>
	{
		if self.state() != CodeModuleState::Loaded {
			return Err(StubError::InvalidState("no code module staged for execution"));
		}

		let request = ExecCodeModRequest {
			args,
		};
		self.engine
			.send_request(self.id_ccd, RrnId::ExecCodeMod, &request.to_bytes(), timeout)?;
		self.state = CodeModuleState::Executing;
		Ok(())
	}

	/// Block until the running module reports completion and return its
	/// return value. `None` waits indefinitely.
	pub fn wait_finished(&mut self, timeout: Option<Duration>) -> Result<u32, StubError>
	{
		match self.state() {
			CodeModuleState::Executing => {},
			CodeModuleState::Finished(ret) => return Ok(ret),
			CodeModuleState::NotLoaded | CodeModuleState::Loaded =>
				return Err(StubError::InvalidState("no code module is executing")),
		}

		let deadline = timeout.map(|timeout| Instant::now() + timeout);
		loop {
			match self.state() {
				CodeModuleState::Finished(ret) => return Ok(ret),
				// Only a stub reset can take the slot backwards from here
				CodeModuleState::NotLoaded | CodeModuleState::Loaded => return Err(StubError::Reset),
				CodeModuleState::Executing => {},
			}

			let wait = match deadline {
				Some(deadline) => {
					let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
						return Err(StubError::Timeout {
							id_ccd: self.id_ccd,
						});
					};
					remaining.min(FINISH_POLL_INTERVAL)
				},
				None => FINISH_POLL_INTERVAL,
			};

			match self.finished.recv_timeout(wait) {
				Ok(notification) => self.absorb(notification),
				Err(RecvTimeoutError::Timeout) => {},
				Err(RecvTimeoutError::Disconnected) => return Err(StubError::InvalidState("engine stopped")),
			}
		}
	}

	/// Drain both subscription channels and fold their contents into the
	/// lifecycle state.
	fn poll(&mut self)
	{
		while self.resets.try_recv().is_ok() {
			if self.state != CodeModuleState::NotLoaded {
				warn!("Stub reset voided the code module on die {}", self.id_ccd);
			}
			self.state = CodeModuleState::NotLoaded;
		}
		while let Ok(notification) = self.finished.try_recv() {
			self.absorb(notification);
		}
	}

	fn absorb(&mut self, notification: Notification)
	{
		if notification.id_ccd != self.id_ccd {
			return;
		}
		let NotificationPayload::CodeModuleFinished(finished) = notification.payload else {
			return;
		};
		if self.state == CodeModuleState::Executing {
			info!("Code module on die {} finished with {:#x}", self.id_ccd, finished.ret);
			self.state = CodeModuleState::Finished(finished.ret);
		} else {
			warn!(
				"Spurious completion notification for die {} while {:?}",
				self.id_ccd, self.state
			);
		}
	}
}
