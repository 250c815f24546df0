// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discovery of the UART adapter the stub is wired up to.
//!
//! The stub's UART typically reaches the host through a common USB
//! serial adapter; this walks the stable by-id device tree and picks out
//! adapters of the known families, optionally narrowed by serial number.

use std::path::PathBuf;

use color_eyre::eyre::Result;

use crate::serial::stub_link::StubLink;

pub struct StubInterface
{
	serial_port: PathBuf,
}

impl StubInterface
{
	/// Use an explicitly named serial device, bypassing discovery.
	pub fn from_port(serial_port: PathBuf) -> Self
	{
		Self {
			serial_port,
		}
	}

	pub fn port(&self) -> &PathBuf
	{
		&self.serial_port
	}

	/// Open the transport on the selected device.
	pub fn link(&self) -> Result<StubLink>
	{
		StubLink::from_path(&self.serial_port)
	}
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl StubInterface
{
	const DEVICE_BY_ID: &str = "/dev/serial/by-id";
	const IDSTRING_CP210X: &str = "usb-Silicon_Labs_CP210";
	const IDSTRING_FTDI: &str = "usb-FTDI_";

	/// Locate the UART adapter the stub sits behind. When `serial_number`
	/// is given, only an adapter carrying it qualifies; otherwise the
	/// first recognised adapter wins.
	pub fn discover(serial_number: Option<&str>) -> Result<Self>
	{
		use std::fs::read_dir;

		use color_eyre::eyre::eyre;

		// Start by opening the by-id serial interfaces device tree
		let dir = read_dir(Self::DEVICE_BY_ID)?;
		// Read through all the entries and try to locate one for a known adapter family
		for entry in dir {
			let entry = entry?;
			// Try to convert this entry's file name to a regular string - if we can't, it
			// cannot be one of the adapters we know (their IDs strictly convert to valid UTF-8)
			let file_name = entry.file_name();
			let Some(file_name) = file_name.to_str() else {
				continue;
			};

			// Check to see if this entry represents a known USB UART adapter
			if !Self::device_is_uart_adapter(file_name) {
				continue;
			}
			// It does! Now check the serial number constraint, if the caller gave one
			if let Some(serial_number) = serial_number {
				if !Self::serial_matches(file_name, serial_number) {
					continue;
				}
			}
			// We have a match! Convert the entry into a path and return
			return Ok(Self {
				serial_port: entry.path(),
			});
		}
		// If we manage to get here, we could not find a matching device - so fail accordingly
		match serial_number {
			Some(serial_number) =>
				Err(eyre!("Failed to locate a UART adapter matching serial number {}", serial_number)),
			None => Err(eyre!("Failed to locate a UART adapter for the stub link")),
		}
	}

	fn device_is_uart_adapter(file_name: &str) -> bool
	{
		// Check if the device file name fragment starts with one of the known
		// by-id prefixes and ends with the right interface suffix
		(file_name.starts_with(Self::IDSTRING_FTDI) || file_name.starts_with(Self::IDSTRING_CP210X)) &&
			file_name.ends_with("-if00-port0")
	}

	fn serial_matches(file_name: &str, serial_number: &str) -> bool
	{
		// Start by trying to find the last _ just before the serial string
		let Some(last_underscore) = file_name.rfind('_') else {
			return false;
		};
		// Having done that, extract the slice representing the serial number for this device
		let begin = last_underscore + 1;
		// This represents one past the last byte of the serial number string,
		// chopping off `-if00-port0`
		let end = file_name.len() - 11;
		begin < end && &file_name[begin..end] == serial_number
	}
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl StubInterface
{
	/// Adapter discovery relies on the by-id device tree; elsewhere the
	/// caller must name the port explicitly via [`Self::from_port`].
	pub fn discover(_serial_number: Option<&str>) -> Result<Self>
	{
		use color_eyre::eyre::eyre;

		Err(eyre!("Adapter discovery is unsupported on this platform, name the serial port explicitly"))
	}
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod tests
{
	use super::*;

	#[test]
	fn known_adapter_families_are_recognised()
	{
		assert!(StubInterface::device_is_uart_adapter(
			"usb-FTDI_TTL232R-3V3_FTA61I6B-if00-port0"
		));
		assert!(StubInterface::device_is_uart_adapter(
			"usb-Silicon_Labs_CP2102_USB_to_UART_Bridge_Controller_0001-if00-port0"
		));
		// Wrong interface suffix
		assert!(!StubInterface::device_is_uart_adapter("usb-FTDI_TTL232R-3V3_FTA61I6B-if01-port0"));
		// Unknown vendor
		assert!(!StubInterface::device_is_uart_adapter(
			"usb-Prolific_Technology_Inc._USB-Serial_Controller_AB12CD34-if00-port0"
		));
	}

	#[test]
	fn serial_number_extraction()
	{
		let name = "usb-FTDI_TTL232R-3V3_FTA61I6B-if00-port0";
		assert!(StubInterface::serial_matches(name, "FTA61I6B"));
		assert!(!StubInterface::serial_matches(name, "FTA61I6C"));
		assert!(!StubInterface::serial_matches("no-underscores-if00-port0", "anything"));
	}
}
