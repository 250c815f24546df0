// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fs::File;
use std::io::Read;

use color_eyre::eyre::{Report, Result, eyre};
use log::debug;

use super::ModuleStorage;
use crate::serial::pdu::{LoadCodeModRequest, PDU_MAX_PAYLOAD};

pub struct RawModuleFile
{
	image: Box<[u8]>,
}

impl TryFrom<File> for RawModuleFile
{
	type Error = Report;

	fn try_from(mut file: File) -> Result<Self>
	{
		debug!("Loading file as a raw flat binary code module");
		// Pull out the entire file contents into memory and stuff it in a vec
		let mut image = Vec::new();
		file.read_to_end(&mut image)?;

		// The whole image has to go over in a single load request
		let transfer_limit = PDU_MAX_PAYLOAD - LoadCodeModRequest::WIRE_SIZE;
		if image.len() > transfer_limit {
			Err(eyre!(
				"Code module image is {} bytes, exceeding the {} byte transfer limit",
				image.len(),
				transfer_limit
			))
		} else {
			Ok(Self {
				image: image.into_boxed_slice(),
			})
		}
	}
}

impl ModuleStorage for RawModuleFile
{
	fn image(&self) -> &[u8]
	{
		&self.image
	}
}
