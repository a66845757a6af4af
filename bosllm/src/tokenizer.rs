// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Byte-level tokenizer stand-in.
//!
//! The production tokenizer lives outside this firmware; the control
//! plane only needs a stable prompt-bytes-to-ids mapping and the EOS
//! sentinel, so token ids are simply byte values.

/// End-of-sequence token emitted by the accelerator
pub const EOS_TOKEN: u32 = 0xFFFF_FFFF;

/// Maps prompt bytes onto token ids
pub fn encode(prompt: &[u8]) -> Vec<u32> {
    prompt.iter().map(|&byte| u32::from(byte)).collect()
}

/// Maps a token id back onto its byte, `None` for ids outside the byte
/// range (reserved for control tokens)
pub fn decode(token: u32) -> Option<char> {
    if token < 256 {
        Some(token as u8 as char)
    } else {
        None
    }
}
