// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod engine;
pub mod interface;
pub mod pdu;
pub mod stub_link;
