// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fan-out of unsolicited PDUs to interested observers.
//!
//! Notifications arrive interleaved with responses on the same stream and
//! must never hold up request/response traffic: observers get their copy
//! over an unbounded channel and drain it at their own pace. A subscriber
//! that went away is pruned on the next dispatch.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender, channel};

use bstr::BString;
use log::{debug, warn};

use crate::serial::pdu::{
	BeaconNotification, DecodeError, ExecFinishedNotification, IrqNotification, OutBufNotification, PduHeader, RrnId,
};

/// The kinds of unsolicited traffic the stub emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind
{
	Beacon,
	IrqChange,
	LogMessage,
	OutputBufferData,
	CodeModuleFinished,
}

/// One decoded notification, with the addressing context from its header.
#[derive(Clone, Debug)]
pub struct Notification
{
	/// Die the notification concerns.
	pub id_ccd: u32,
	/// Stub-side millisecond timestamp at send time.
	pub ts_millies: u32,
	pub payload: NotificationPayload,
}

#[derive(Clone, Debug)]
pub enum NotificationPayload
{
	Beacon(BeaconNotification),
	IrqChange(IrqNotification),
	/// Stub log line; not guaranteed to be valid UTF-8.
	LogMessage(BString),
	/// Output buffer contents from a running code module. The wire
	/// carries no unpadded length for the data, so it keeps the PDU's
	/// 8-byte alignment padding; producers that care delimit their own
	/// records.
	OutputBufferData
	{
		id_out_buf: u32,
		data: Vec<u8>,
	},
	CodeModuleFinished(ExecFinishedNotification),
}

impl NotificationPayload
{
	pub fn kind(&self) -> NotificationKind
	{
		match self {
			Self::Beacon(_) => NotificationKind::Beacon,
			Self::IrqChange(_) => NotificationKind::IrqChange,
			Self::LogMessage(_) => NotificationKind::LogMessage,
			Self::OutputBufferData {
				..
			} => NotificationKind::OutputBufferData,
			Self::CodeModuleFinished(_) => NotificationKind::CodeModuleFinished,
		}
	}
}

impl Notification
{
	/// Decode a notification-class PDU into its typed payload.
	pub fn decode(header: &PduHeader, payload: &[u8]) -> Result<Self, DecodeError>
	{
		let payload = match header.rrn_id {
			RrnId::Beacon => NotificationPayload::Beacon(BeaconNotification::from_bytes(payload)?),
			RrnId::Irq => NotificationPayload::IrqChange(IrqNotification::from_bytes(payload)?),
			RrnId::LogMessage => {
				// Log lines are padded to PDU alignment with NULs; strip
				// those, keep everything else verbatim.
				let end = payload
					.iter()
					.rposition(|&byte| byte != 0)
					.map_or(0, |position| position + 1);
				NotificationPayload::LogMessage(BString::from(&payload[..end]))
			},
			RrnId::OutBuf => {
				let info = OutBufNotification::from_bytes(payload)?;
				NotificationPayload::OutputBufferData {
					id_out_buf: info.id_out_buf,
					data: payload[OutBufNotification::WIRE_SIZE..].to_vec(),
				}
			},
			RrnId::CodeModFinished =>
				NotificationPayload::CodeModuleFinished(ExecFinishedNotification::from_bytes(payload)?),
			other => return Err(DecodeError::InvalidRrnId(other as u32)),
		};
		Ok(Self {
			id_ccd: header.id_ccd,
			ts_millies: header.ts_millies,
			payload,
		})
	}
}

pub struct Dispatcher
{
	observers: Mutex<HashMap<NotificationKind, Vec<Sender<Notification>>>>,
}

impl Dispatcher
{
	pub fn new() -> Self
	{
		Self {
			observers: Mutex::new(HashMap::new()),
		}
	}

	/// Subscribe to one kind of notification. The receive side is the
	/// caller's; dropping it unsubscribes implicitly.
	pub fn subscribe(&self, kind: NotificationKind) -> Receiver<Notification>
	{
		let (sender, receiver) = channel();
		self.observers
			.lock()
			.expect("dispatcher observer table poisoned")
			.entry(kind)
			.or_default()
			.push(sender);
		receiver
	}

	/// Deliver a notification to every live observer of its kind. Sending
	/// onto the unbounded channels cannot block, so a slow consumer never
	/// stalls PDU ingestion.
	pub fn dispatch(&self, notification: Notification)
	{
		if let NotificationPayload::LogMessage(message) = &notification.payload {
			// Stub log lines are always worth relaying locally.
			debug!("stub[{}]: {}", notification.id_ccd, message);
		}

		let kind = notification.payload.kind();
		let mut observers = self
			.observers
			.lock()
			.expect("dispatcher observer table poisoned");
		let Some(subscribers) = observers.get_mut(&kind) else {
			debug!("No observer for {:?} notification, dropping", kind);
			return;
		};
		subscribers.retain(|subscriber| subscriber.send(notification.clone()).is_ok());
		if subscribers.is_empty() {
			warn!("Last observer for {:?} notifications went away", kind);
			observers.remove(&kind);
		}
	}
}

impl Default for Dispatcher
{
	fn default() -> Self
	{
		Self::new()
	}
}
