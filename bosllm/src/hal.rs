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

//! Hardware abstraction layer: the accelerator driver and its register
//! backends.
//!
//! The driver only talks to the device through the [`Registers`] trait.
//! `hal::zynq` implements it over the UIO-mapped register window,
//! `hal::sim` over an in-process register file with synthetic status
//! progression; the backend is chosen once at construction time.

pub mod sim;
pub mod zynq;

use crate::cfgio::{self, ConfigIn, StatusOut};
use crate::mem::{MemoryManager, RegionKind};
use crate::model::ContainerHeader;
use crate::regs::{self, ap_ctrl, ApCtrl};

use byteorder::{ByteOrder, LittleEndian};
use ii_logging::macros::*;

use std::sync::Arc;

/// Volatile access to the 4 KiB register window. Reads and writes hit
/// the device immediately and are never reordered across a call.
pub trait Registers: Send + Sync {
    /// Reads the 32-bit register at byte `offset`
    fn read(&self, offset: usize) -> u32;
    /// Writes the 32-bit register at byte `offset`
    fn write(&self, offset: usize, value: u32);
}

/// Driver owning the register window and the cached configuration and
/// status images
pub struct AcceleratorDriver {
    regs: Arc<dyn Registers>,
    mem: Arc<MemoryManager>,
    config: ConfigIn,
    config_words: [u32; regs::CONFIG_WORDS],
    status: StatusOut,
    /// `tokens_generated` value of the last yielded token
    last_token_count: u32,
}

impl AcceleratorDriver {
    pub fn new(regs: Arc<dyn Registers>, mem: Arc<MemoryManager>) -> Self {
        let config = ConfigIn::default();
        let config_words = config.pack();
        Self {
            regs,
            mem,
            config,
            config_words,
            status: StatusOut::default(),
            last_token_count: 0,
        }
    }

    /// Shared handle to the register backend, used to wire up the
    /// interrupt service
    pub fn registers(&self) -> Arc<dyn Registers> {
        self.regs.clone()
    }

    pub fn config(&self) -> &ConfigIn {
        &self.config
    }

    pub fn status(&self) -> &StatusOut {
        &self.status
    }

    /// One-time startup configuration: buffer addresses and the global
    /// generation limits. Writes the complete register image, does not
    /// start the device.
    pub fn configure(
        &mut self,
        input_addr: u64,
        output_addr: u64,
        kv_cache_addr: u64,
        stride: u32,
        max_tokens: u32,
    ) {
        self.config.input_buffer_addr = input_addr;
        self.config.output_buffer_addr = output_addr;
        self.config.kv_cache_addr = kv_cache_addr;
        self.config.stride = stride;
        self.config.max_tokens = max_tokens;
        self.config_words = self.config.pack();
        for (idx, word) in self.config_words.iter().enumerate() {
            self.regs.write(regs::CONFIG_BASE + 4 * idx, *word);
        }
        debug!(
            "configured accelerator: input 0x{:x}, output 0x{:x}, kv 0x{:x}",
            input_addr, output_addr, kv_cache_addr
        );
    }

    /// Publishes the geometry of the staged model. Only touched words
    /// are rewritten.
    pub fn set_model_geometry(&mut self, header: &ContainerHeader) {
        self.config.num_layers = header.num_layers;
        self.config.hidden_size = header.hidden_size;
        self.config.num_heads = header.num_heads;
        self.config.vocab_size = header.vocab_size;
        self.config.sequence_length = header.max_seq_len;
        self.config.batch_size = 1;
        self.write_changed_words();
    }

    /// Updates the task-scoped configuration fields, rewriting only the
    /// words whose value changed
    pub fn set_task_config(&mut self, task_id: u32, prompt_length: u32, task_type: u32) {
        self.config.task_id = task_id;
        self.config.prompt_length = prompt_length;
        self.config.task_type = task_type;
        self.write_changed_words();
    }

    fn write_changed_words(&mut self) {
        let new_words = self.config.pack();
        for idx in cfgio::config_words_changed(&self.config_words, &new_words) {
            self.regs.write(regs::CONFIG_BASE + 4 * idx, new_words[idx]);
        }
        self.config_words = new_words;
    }

    /// Stages the prompt into the input buffer and starts the device.
    /// Prompts longer than the buffer are truncated.
    pub fn start_inference(&mut self, task_id: u32, prompt_tokens: &[u32]) {
        let capacity = (self.mem.region(RegionKind::InputBuffer).size / 4) as usize;
        let staged_len = if prompt_tokens.len() > capacity {
            warn!(
                "prompt of {} tokens truncated to input buffer capacity {}",
                prompt_tokens.len(),
                capacity
            );
            capacity
        } else {
            prompt_tokens.len()
        };
        let staged = &prompt_tokens[..staged_len];

        self.set_task_config(task_id, staged.len() as u32, cfgio::TASK_TYPE_GENERATE);

        let input = self.mem.region(RegionKind::InputBuffer);
        let bytes = unsafe { input.as_mut_slice() };
        LittleEndian::write_u32_into(staged, &mut bytes[..staged.len() * 4]);

        self.status = StatusOut::default();
        self.last_token_count = 0;
        self.regs.write(regs::AP_CTRL, ap_ctrl::START);
    }

    /// Refreshes the cached status image when the device has published a
    /// valid one. Returns whether the cache was refreshed.
    pub fn poll_status(&mut self) -> bool {
        if self.regs.read(regs::STATUS_VALID) & 0x1 == 0 {
            return false;
        }
        let mut words = [0u32; regs::STATUS_WORDS];
        for (idx, word) in words.iter_mut().enumerate() {
            *word = self.regs.read(regs::STATUS_BASE + 4 * idx);
        }
        self.status = StatusOut::unpack(&words);
        true
    }

    /// Yields the next generated token. `tokens_generated` is the
    /// authoritative counter: a token is handed out exactly once, when
    /// the counter advances past the last yielded value.
    pub fn next_token(&mut self, token: &mut u32) -> bool {
        if !self.poll_status() || !self.status.is_valid() {
            return false;
        }
        if self.status.tokens_generated > self.last_token_count {
            self.last_token_count = self.status.tokens_generated;
            *token = self.status.current_token;
            true
        } else {
            false
        }
    }

    pub fn is_done(&self) -> bool {
        ApCtrl::from_reg(self.regs.read(regs::AP_CTRL)).done
    }

    pub fn is_idle(&self) -> bool {
        ApCtrl::from_reg(self.regs.read(regs::AP_CTRL)).idle
    }

    /// Clears all transient device state: pending interrupts, the
    /// control register and the KV cache region. Idempotent.
    pub fn reset(&mut self) {
        self.regs.write(regs::IRQ_CLEAR, u32::max_value());
        self.regs.write(regs::AP_CTRL, 0);
        self.mem.region(RegionKind::KvCache).zero();
        self.status = StatusOut::default();
        self.last_token_count = 0;
    }
}
