// SPDX-License-Identifier: MIT OR Apache-2.0

//! The raw serial transport underneath the protocol engine.
//!
//! Opens the UART device the stub sits behind, puts it into raw 8N1 mode
//! at the stub's fixed baud rate, and splits the handle into the reader
//! and writer halves the engine wants to own separately.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use color_eyre::eyre::Result;
use log::debug;

pub struct StubLink
{
	handle: File,
}

impl StubLink
{
	/// Open and configure the serial device at the given path.
	pub fn from_path(serial_port: &Path) -> Result<Self>
	{
		// Get the serial interface to the stub open
		let handle = File::options().read(true).write(true).open(serial_port)?;
		debug!("Opened stub link on {}", serial_port.display());

		let result = Self {
			handle,
		};

		// Call the OS-specific handle configuration function to ready
		// the interface handle for raw PDU traffic
		result.init_handle()?;
		Ok(result)
	}

	/// Split the link into independently owned reader and writer halves.
	/// Both refer to the same underlying device; the engine serializes
	/// writes itself and gives the reader to its receive thread.
	pub fn split(self) -> Result<(Box<dyn Read + Send>, Box<dyn Write + Send>)>
	{
		let reader = self.handle.try_clone()?;
		Ok((Box::new(reader), Box::new(self.handle)))
	}
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
impl StubLink
{
	fn init_handle(&self) -> Result<()>
	{
		use std::os::fd::AsRawFd;

		use termios::os::target::B115200;
		use termios::*;

		// Extract the current termios config for the handle
		let fd = self.handle.as_raw_fd();
		let mut attrs = Termios::from_fd(fd)?;

		// Reconfigure the attributes for 8-bit characters, one stop bit, no parity,
		// and no hardware control flow - the stub's UART has only TX and RX
		attrs.c_cflag &= !(CSIZE | CSTOPB | PARENB);
		attrs.c_cflag |= CS8 | CLOCAL | CREAD;
		// Disable break character handling and turn off XON/XOFF based control flow -
		// PDU traffic is binary and every byte value must pass through unharmed
		attrs.c_iflag &= !(IGNBRK | BRKINT | ISTRIP | INLCR | IGNCR | ICRNL | IXON | IXOFF | IXANY);
		// Disable all signaling, echo, remapping and delays
		attrs.c_lflag = 0;
		attrs.c_oflag = 0;
		// Make reads not block, and set 0.5s for read timeout - the receive
		// loop uses the timeout ticks to poll for shutdown
		attrs.c_cc[VMIN] = 0;
		attrs.c_cc[VTIME] = 5;

		// Fix the speed both ways to the stub's rate; there is no negotiation
		cfsetspeed(&mut attrs, B115200)?;

		// Reconfigure the handle with the new termios config
		tcsetattr(fd, TCSANOW, &attrs)?;

		// Flush whatever partial traffic accumulated while nobody listened
		tcflush(fd, TCIOFLUSH)?;
		Ok(())
	}
}

#[cfg(target_os = "windows")]
impl StubLink
{
	fn init_handle(&self) -> Result<()>
	{
		use color_eyre::eyre::eyre;

		// No raw-mode configuration exists for this platform yet; binary
		// PDU traffic through an unconfigured port would be corrupted, so
		// refuse the handle outright rather than pretend it works.
		Err(eyre!("Raw serial configuration is not supported on this platform"))
	}
}

#[cfg(all(test, target_os = "windows"))]
mod tests
{
	use super::*;

	#[test]
	fn unconfigurable_handles_are_refused()
	{
		let path = std::env::temp_dir().join("pspserial-link-check.bin");
		std::fs::write(&path, b"").expect("temp file must be writable");
		// Opening succeeds, but without raw-mode setup the link must not
		// come up.
		assert!(StubLink::from_path(&path).is_err());
		let _ = std::fs::remove_file(&path);
	}
}
