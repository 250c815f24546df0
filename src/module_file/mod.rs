// SPDX-License-Identifier: MIT OR Apache-2.0

//! Loading code module images from disk.
//!
//! The stub only accepts flat binaries placed at its fixed code module
//! load address, but developers mostly have ELF build outputs - this
//! sniffs the file signature and flattens an ELF's loadable segments
//! into the image the stub wants, while passing raw binaries through
//! untouched.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use color_eyre::eyre::{Context, Result, eyre};

mod elf;
mod raw;

use self::elf::ElfModuleFile;
use self::raw::RawModuleFile;

trait ModuleStorage
{
	fn image(&self) -> &[u8];
}

pub struct ModuleFile
{
	inner: Box<dyn ModuleStorage>,
}

impl ModuleFile
{
	/// Construct a ModuleFile from a path to a file
	pub fn from_path(file_name: &Path) -> Result<Self>
	{
		let mut file = File::open(file_name)
			.wrap_err_with(|| eyre!("Failed to read file {} as a code module", file_name.display()))?;

		let mut signature = [0u8; 4];
		let _ = file.read(&mut signature)?;
		file.rewind()?;

		let storage: Box<dyn ModuleStorage> = if &signature == b"\x7fELF" {
			Box::new(ElfModuleFile::try_from(file)?)
		} else {
			Box::new(RawModuleFile::try_from(file)?)
		};

		Ok(Self {
			inner: storage,
		})
	}

	/// The flat binary image, ready for transfer to the stub's code
	/// module load address
	pub fn image(&self) -> &[u8]
	{
		self.inner.image()
	}
}
