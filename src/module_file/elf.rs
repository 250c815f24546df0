// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fs::File;
use std::io::Read;

use color_eyre::eyre::{Report, Result, eyre};
use goblin::container::Endian;
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::{Elf, header::{EI_CLASS, ELFCLASS32, EM_ARM, ET_EXEC}};
use log::debug;

use super::ModuleStorage;
use crate::serial::pdu::{CM_FLAT_BINARY_LOAD_ADDR, LoadCodeModRequest, PDU_MAX_PAYLOAD};

pub struct ElfModuleFile
{
	image: Box<[u8]>,
}

impl TryFrom<File> for ElfModuleFile
{
	type Error = Report;

	fn try_from(mut file: File) -> Result<Self>
	{
		// Extract the contents of the ELF file into memory
		let mut contents = Vec::new();
		file.read_to_end(&mut contents)?;

		// Try to parse the file as an ELF
		let elf = Elf::parse(&contents)?;

		// Validate the header is for a 32-bit little-endian ARM executable -
		// anything else cannot run on the security processor's core
		let header = elf.header;
		if header.e_type != ET_EXEC || header.e_machine != EM_ARM ||
			header.endianness()? != Endian::Little || header.e_ident[EI_CLASS] != ELFCLASS32 {
			return Err(eyre!("ELF does not represent a code module for the security processor"));
		}

		// Extract loadable non-zero-length program headers as base address +
		// file byte range pairs
		let mut segments = elf
			.program_headers
			.iter()
			.filter(|header| header.p_type == PT_LOAD && header.p_filesz != 0)
			.map(|header| (header.p_paddr as u32, header.file_range()))
			.collect::<Vec<_>>();
		segments.sort_by_key(|&(base, _)| base);

		let Some(&(image_base, _)) = segments.first() else {
			return Err(eyre!("ELF contains no loadable segments"));
		};
		// The stub places flat binaries at one fixed address; an image built
		// for anywhere else would run off the rails immediately
		if image_base != CM_FLAT_BINARY_LOAD_ADDR {
			return Err(eyre!(
				"Code module is linked for {:#x} but the stub loads flat binaries at {:#x}",
				image_base,
				CM_FLAT_BINARY_LOAD_ADDR
			));
		}
		if (elf.entry as u32) != CM_FLAT_BINARY_LOAD_ADDR {
			return Err(eyre!(
				"Code module entry point {:#x} is not at the load address {:#x}",
				elf.entry,
				CM_FLAT_BINARY_LOAD_ADDR
			));
		}

		// Flatten the segments into one contiguous image, zero-filling any
		// gaps between them
		let mut image = Vec::new();
		for (base, range) in segments {
			let offset = (base - image_base) as usize;
			if offset < image.len() {
				return Err(eyre!("ELF contains overlapping loadable segments"));
			}
			image.resize(offset, 0);
			image.extend_from_slice(&contents[range]);
		}
		debug!("Flattened ELF into a {} byte code module image", image.len());

		// An image that cannot fit a single load request alongside its
		// descriptor is not usable
		let transfer_limit = PDU_MAX_PAYLOAD - LoadCodeModRequest::WIRE_SIZE;
		if image.len() > transfer_limit {
			return Err(eyre!(
				"Code module image is {} bytes, exceeding the {} byte transfer limit",
				image.len(),
				transfer_limit
			));
		}

		Ok(Self {
			image: image.into_boxed_slice(),
		})
	}
}

impl ModuleStorage for ElfModuleFile
{
	fn image(&self) -> &[u8]
	{
		&self.image
	}
}
