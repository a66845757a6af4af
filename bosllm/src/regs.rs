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

//! Register map of the accelerator IP core.
//!
//! All offsets are byte offsets into the 4 KiB register window and all
//! accesses are 32-bit aligned.

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;

/// Physical base address of the register window
pub const REG_BASE: u64 = 0x43C0_0000;

/// Size of the register window
pub const REG_WINDOW_SIZE: usize = 4096;

/// Block-level control register
pub const AP_CTRL: usize = 0x00;
/// Global interrupt enable
pub const GIE: usize = 0x04;
/// Interrupt enable register
pub const IER: usize = 0x08;
/// Interrupt status register, write-1-to-clear
pub const ISR: usize = 0x0C;
/// First word of the configuration block
pub const CONFIG_BASE: usize = 0x10;
/// Number of 32-bit words in the configuration block
pub const CONFIG_WORDS: usize = 38;
/// First word of the status block
pub const STATUS_BASE: usize = 0xAC;
/// Number of 32-bit words in the status block
pub const STATUS_WORDS: usize = 4;
/// Status-block valid handshake
pub const STATUS_VALID: usize = 0xBC;
/// Interrupt clear pulse register (write all-ones)
pub const IRQ_CLEAR: usize = 0xD4;

/// Bits of the `AP_CTRL` register
pub mod ap_ctrl {
    pub const START: u32 = 0x01;
    pub const DONE: u32 = 0x02;
    pub const IDLE: u32 = 0x04;
    pub const READY: u32 = 0x08;
    pub const AUTO_RESTART: u32 = 0x80;
    pub const INTERRUPT: u32 = 0x200;
}

/// Bits shared by the `ISR` and `IER` registers
pub mod irq {
    pub const DONE: u32 = 1 << 0;
    pub const READY: u32 = 1 << 1;
    pub const TOKEN_READY: u32 = 1 << 2;
    pub const ERROR: u32 = 1 << 3;
    pub const ALL: u32 = DONE | READY | TOKEN_READY | ERROR;
}

/// Decoded view of the `AP_CTRL` register
#[derive(PackedStruct, Clone, Debug, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "4", endian = "msb")]
pub struct ApCtrl {
    #[packed_field(bits = "0")]
    pub start: bool,
    #[packed_field(bits = "1")]
    pub done: bool,
    #[packed_field(bits = "2")]
    pub idle: bool,
    #[packed_field(bits = "3")]
    pub ready: bool,
    #[packed_field(bits = "7")]
    pub auto_restart: bool,
    /// Interrupt line is currently asserted
    #[packed_field(bits = "9")]
    pub interrupt: bool,
}

impl ApCtrl {
    /// Converts the decoded view into the register word
    pub fn to_reg(&self) -> u32 {
        u32::from_be_bytes(self.pack())
    }

    /// Decodes the register word. Reserved bits are ignored.
    pub fn from_reg(value: u32) -> Self {
        Self::unpack(&value.to_be_bytes()).expect("4-byte AP_CTRL unpack cannot fail")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ap_ctrl_bit_positions() {
        let reg = ApCtrl {
            start: true,
            done: false,
            idle: false,
            ready: false,
            auto_restart: false,
            interrupt: false,
        };
        assert_eq!(reg.to_reg(), ap_ctrl::START);

        let reg = ApCtrl {
            start: false,
            done: true,
            idle: true,
            ready: false,
            auto_restart: true,
            interrupt: true,
        };
        assert_eq!(
            reg.to_reg(),
            ap_ctrl::DONE | ap_ctrl::IDLE | ap_ctrl::AUTO_RESTART | ap_ctrl::INTERRUPT
        );
    }

    #[test]
    fn test_ap_ctrl_round_trip() {
        let value = ap_ctrl::START | ap_ctrl::READY | ap_ctrl::INTERRUPT;
        let reg = ApCtrl::from_reg(value);
        assert!(reg.start);
        assert!(!reg.done);
        assert!(!reg.idle);
        assert!(reg.ready);
        assert!(!reg.auto_restart);
        assert!(reg.interrupt);
        assert_eq!(reg.to_reg(), value);
    }

    #[test]
    fn test_config_block_fits_window() {
        assert!(CONFIG_BASE + CONFIG_WORDS * 4 <= STATUS_BASE);
        assert!(STATUS_BASE + STATUS_WORDS * 4 <= STATUS_VALID);
        assert!(IRQ_CLEAR < REG_WINDOW_SIZE);
    }
}
