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

//! Zynq register window backend.
//!
//! The accelerator's AXI register bank is exported through a UIO device;
//! mapping 0 covers the whole 4 KiB window. All accesses are volatile
//! 32-bit reads/writes so the compiler can neither elide nor reorder
//! them.

use super::Registers;
use crate::error::{self, ErrorKind};
use crate::regs;

use ii_logging::macros::*;

use std::ptr;

pub struct ZynqRegisters {
    map: uio::UioMapping,
}

// The mapping is only dereferenced through volatile 32-bit accesses and
// the engine/interrupt threads touch disjoint registers.
unsafe impl Send for ZynqRegisters {}
unsafe impl Sync for ZynqRegisters {}

impl ZynqRegisters {
    /// Maps the register window of the UIO device called `uio_name`
    pub fn open(uio_name: &str) -> error::Result<Self> {
        let uio = uio::UioDevice::open_by_name(uio_name).map_err(|e| {
            ErrorKind::DeviceUnavailable(format!("uio device {:?}: {}", uio_name, e))
        })?;
        let map = uio.map_mapping(0).map_err(|e| {
            ErrorKind::DeviceUnavailable(format!(
                "cannot map registers of {:?}: {}",
                uio_name, e
            ))
        })?;
        info!("mapped accelerator register window via uio device {}", uio_name);
        Ok(Self { map })
    }

    #[inline]
    fn reg_ptr(&self, offset: usize) -> *mut u32 {
        assert!(
            offset & 0x3 == 0 && offset < regs::REG_WINDOW_SIZE,
            "register access outside the window: 0x{:x}",
            offset
        );
        (self.map.ptr as *mut u8).wrapping_add(offset) as *mut u32
    }
}

impl Registers for ZynqRegisters {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.reg_ptr(offset)) }
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.reg_ptr(offset), value) }
    }
}
