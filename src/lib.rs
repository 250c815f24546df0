// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod error;
pub mod module_file;
pub mod serial;
